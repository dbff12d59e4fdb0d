//! Job records and the job lifecycle state machine.
//!
//! A job moves along a fixed graph:
//!
//! ```text
//! ImageBuilding --(build ok, digest known)--> VmRunning --(instance gone or stuck)--> VmFinished
//!       \
//!        `--(build failed)--> ImageBuildingFailed
//! ```
//!
//! `VmWaiting` is only ever *requested* by the reconciliation monitor. The job
//! service collapses it into `VmRunning` once the confidential instance exists.

use chrono::{DateTime, Utc};
use derive_more::Display;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Lifecycle status of a job.
///
/// The integer codes are the persisted and wire encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(into = "i32", try_from = "i32")]
pub enum JobStatus {
    #[display("image_building")]
    ImageBuilding,
    #[display("image_building_failed")]
    ImageBuildingFailed,
    #[display("vm_waiting")]
    VmWaiting,
    #[display("vm_running")]
    VmRunning,
    #[display("vm_finished")]
    VmFinished,
}

impl JobStatus {
    /// Statuses counted against the per-creator in-flight limit.
    pub const IN_PROGRESS: [JobStatus; 3] = [
        JobStatus::ImageBuilding,
        JobStatus::VmWaiting,
        JobStatus::VmRunning,
    ];

    pub fn code(self) -> i32 {
        match self {
            JobStatus::ImageBuilding => 1,
            JobStatus::ImageBuildingFailed => 2,
            JobStatus::VmWaiting => 3,
            JobStatus::VmRunning => 4,
            JobStatus::VmFinished => 5,
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            1 => Some(JobStatus::ImageBuilding),
            2 => Some(JobStatus::ImageBuildingFailed),
            3 => Some(JobStatus::VmWaiting),
            4 => Some(JobStatus::VmRunning),
            5 => Some(JobStatus::VmFinished),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::ImageBuildingFailed | JobStatus::VmFinished)
    }

    pub fn is_in_progress(self) -> bool {
        Self::IN_PROGRESS.contains(&self)
    }

    /// Decide what applying `requested` to a job currently in `self` means.
    ///
    /// Re-applying a status the job already reached is `Unchanged` so that
    /// overlapping reconciliation passes are harmless.
    pub fn plan(self, requested: JobStatus) -> Result<Transition> {
        use JobStatus::*;

        match (self, requested) {
            (ImageBuilding, VmWaiting) => Ok(Transition::LaunchInstance),
            (ImageBuilding, ImageBuildingFailed) => Ok(Transition::MarkBuildFailed),
            (VmWaiting | VmRunning, VmFinished) => Ok(Transition::Finish),
            (VmWaiting | VmRunning, VmWaiting) => Ok(Transition::Unchanged),
            (ImageBuildingFailed, ImageBuildingFailed) | (VmFinished, VmFinished) => {
                Ok(Transition::Unchanged)
            }
            (from, to) => Err(Error::InvalidTransition { from, to }),
        }
    }
}

impl From<JobStatus> for i32 {
    fn from(status: JobStatus) -> Self {
        status.code()
    }
}

impl TryFrom<i32> for JobStatus {
    type Error = String;

    fn try_from(code: i32) -> std::result::Result<Self, Self::Error> {
        JobStatus::from_code(code).ok_or_else(|| format!("unknown job status code {}", code))
    }
}

/// Outcome of planning a status change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Nothing to do; the job already reflects the request.
    Unchanged,
    /// Narrow trust to the built digest, create the instance, then persist `VmRunning`.
    LaunchInstance,
    /// Persist `ImageBuildingFailed`.
    MarkBuildFailed,
    /// Attach the attestation report and persist `VmFinished`.
    Finish,
}

/// A persisted job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: i64,
    pub uuid: String,
    pub creator: String,
    pub notebook_name: String,
    pub docker_image: String,
    pub docker_image_digest: String,
    pub attestation_report: String,
    pub status: JobStatus,
    pub instance_name: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Fields supplied when a job is first recorded.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub uuid: String,
    pub creator: String,
    pub notebook_name: String,
    pub status: JobStatus,
}

/// Body of the status-update callback sent by the reconciliation monitor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateJobRequest {
    pub uuid: String,
    pub status: JobStatus,
    #[serde(default)]
    pub docker_image: String,
    #[serde(default)]
    pub docker_image_digest: String,
    pub creator: String,
    #[serde(default)]
    pub attestation_token: String,
}

/// Response envelope of the status-update callback. `code == 0` is success.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateJobResponse {
    pub code: i32,
    pub msg: String,
}

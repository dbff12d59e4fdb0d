//! Job runner capability.
//!
//! Build jobs run as containerized batch jobs. The runner creates them, lists
//! their state, deletes them and reads their pod logs.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

use crate::Result;

/// Build job annotation carrying the job uuid.
pub const ANNOTATION_JOB_UUID: &str = "JOB_UUID";
/// Build job annotation carrying the job creator.
pub const ANNOTATION_JOB_CREATOR: &str = "JOB_CREATOR";
/// Build job annotation carrying the submitter's bearer token.
pub const ANNOTATION_USER_TOKEN: &str = "USER_TOKEN";

/// Specification for a build job to launch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildJobSpec {
    /// Deterministic job name.
    pub name: String,
    /// Correlation metadata recovered by the reconciliation monitor.
    pub annotations: BTreeMap<String, String>,
    /// Builder container image.
    pub image: String,
    /// Builder arguments.
    pub args: Vec<String>,
    /// Memory request (e.g., "6000M").
    pub memory_request: String,
    /// Service account the build pod runs as.
    pub service_account: Option<String>,
    /// Time after completion before the runner reaps the job on its own.
    pub ttl: Duration,
}

/// Observed state of a build job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BuildJobState {
    /// No terminal condition yet.
    Running,
    Succeeded,
    Failed,
}

impl BuildJobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, BuildJobState::Succeeded | BuildJobState::Failed)
    }
}

/// A build job as listed by the runner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildJob {
    pub name: String,
    pub annotations: BTreeMap<String, String>,
    pub state: BuildJobState,
}

/// Trait for build job runners.
#[async_trait]
pub trait JobRunner: Send + Sync {
    /// Name of this runner.
    fn name(&self) -> &'static str;

    /// Launch a job. Returns once the job is accepted, not when it finishes.
    async fn create(&self, spec: BuildJobSpec) -> Result<()>;

    /// List all jobs in the runner's scope.
    async fn list(&self) -> Result<Vec<BuildJob>>;

    /// Delete a job and wait for its pods to be cleaned up. Deleting a job
    /// that no longer exists succeeds.
    async fn delete(&self, name: &str) -> Result<()>;

    /// Full log text of each pod belonging to a job, in listing order.
    async fn pod_logs(&self, job_name: &str) -> Result<Vec<String>>;
}

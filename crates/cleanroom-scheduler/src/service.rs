//! Job service - the creator-facing operations and the status update entry point.

use crate::build::{BuildOrchestrator, BuildRequest};
use crate::security::SecurityBinding;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use bytes::Bytes;
use cleanroom_config::SystemConfig;
use cleanroom_core::cloud::{CloudProvider, ConfidentialInstanceSpec};
use cleanroom_core::runner::JobRunner;
use cleanroom_core::{Error, Job, JobStatus, NewJob, Result, Transition, UpdateJobRequest, paths};
use cleanroom_db::{JobPage, JobRepo};
use serde::Serialize;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

/// Submissions are refused once a creator has more than this many jobs in flight.
pub const MAX_IN_PROGRESS: usize = 2;

pub const MAX_PAGE_SIZE: i64 = 100;

/// Name and size of a job's plaintext output.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutputAttrs {
    pub filename: String,
    pub size: u64,
}

pub struct JobService {
    repo: Arc<dyn JobRepo>,
    cloud: Arc<dyn CloudProvider>,
    builder: BuildOrchestrator,
    security: SecurityBinding,
    config: SystemConfig,
}

impl JobService {
    pub fn new(
        repo: Arc<dyn JobRepo>,
        cloud: Arc<dyn CloudProvider>,
        runner: Arc<dyn JobRunner>,
        config: SystemConfig,
    ) -> Self {
        let builder = BuildOrchestrator::new(cloud.clone(), runner, config.clone());
        let security = SecurityBinding::new(cloud.clone(), config.cloud.clone());
        Self {
            repo,
            cloud,
            builder,
            security,
            config,
        }
    }

    /// Accept a workspace and launch its build. Returns the new job's uuid.
    ///
    /// The in-flight check and the insert are not atomic; concurrent
    /// submissions from one creator can briefly exceed the limit.
    pub async fn submit(
        &self,
        creator: &str,
        notebook_name: &str,
        workspace: Bytes,
        token: &str,
    ) -> Result<String> {
        paths::validate_creator(creator)?;
        paths::validate_notebook_name(notebook_name)?;
        if workspace.is_empty() {
            return Err(Error::InvalidInput("workspace archive is empty".to_string()));
        }
        if token.is_empty() {
            return Err(Error::Unauthorized("missing access token".to_string()));
        }

        let in_progress = self.repo.list_in_progress(creator).await?;
        if in_progress.len() > MAX_IN_PROGRESS {
            return Err(Error::LimitExceeded(format!(
                "creator {} has {} jobs in progress",
                creator,
                in_progress.len()
            )));
        }

        self.cloud
            .upload(&paths::workspace_path(creator), workspace, false)
            .await?;
        self.security.prepare_creator(creator).await?;

        let uuid = Uuid::new_v4().to_string();
        self.builder
            .launch(BuildRequest {
                uuid: &uuid,
                creator,
                notebook_name,
                token,
            })
            .await?;

        let job = self
            .repo
            .create(NewJob {
                uuid: uuid.clone(),
                creator: creator.to_string(),
                notebook_name: notebook_name.to_string(),
                status: JobStatus::ImageBuilding,
            })
            .await?;

        info!(job_uuid = %job.uuid, job_id = job.id, creator = %creator, "Submitted job");
        Ok(uuid)
    }

    pub async fn query(&self, creator: &str, page: i64, page_size: i64) -> Result<JobPage> {
        if page < 1 {
            return Err(Error::InvalidInput("page must be at least 1".to_string()));
        }
        if !(1..=MAX_PAGE_SIZE).contains(&page_size) {
            return Err(Error::InvalidInput(format!(
                "page size must be between 1 and {}",
                MAX_PAGE_SIZE
            )));
        }
        Ok(self.repo.list_by_creator(creator, page, page_size).await?)
    }

    pub async fn output_attrs(&self, creator: &str, id: i64) -> Result<OutputAttrs> {
        let job = self.repo.get_by_id_and_creator(id, creator).await?;
        let size = self
            .cloud
            .size(&paths::output_path(creator, &job.uuid, &job.notebook_name))
            .await?;
        Ok(OutputAttrs {
            filename: paths::output_filename(&id.to_string(), &job.notebook_name),
            size,
        })
    }

    /// Base64 of up to `chunk` bytes of the job's output starting at `offset`.
    ///
    /// Nothing checks that the job has finished, so a running job may yield
    /// partial content or `NotFound`.
    pub async fn download_output(
        &self,
        creator: &str,
        id: i64,
        offset: u64,
        chunk: u64,
    ) -> Result<String> {
        if chunk == 0 {
            return Err(Error::InvalidInput("chunk size must be positive".to_string()));
        }
        let job = self.repo.get_by_id_and_creator(id, creator).await?;
        let data = self
            .cloud
            .read_range(
                &paths::output_path(creator, &job.uuid, &job.notebook_name),
                offset,
                chunk,
            )
            .await?;
        Ok(STANDARD.encode(&data))
    }

    pub async fn delete(&self, creator: &str, uuid: &str) -> Result<()> {
        self.repo.delete(creator, uuid).await?;
        info!(job_uuid = %uuid, creator = %creator, "Deleted job");
        Ok(())
    }

    pub async fn attestation_report(&self, creator: &str, id: i64) -> Result<String> {
        let job = self.repo.get_by_id_and_creator(id, creator).await?;
        if job.attestation_report.is_empty() {
            return Err(Error::NotFound(format!(
                "attestation report of job {}",
                id
            )));
        }
        Ok(job.attestation_report)
    }

    /// Apply a status transition reported by the monitor.
    ///
    /// `token` is the submitter's bearer token; it is handed to the
    /// confidential instance when one is launched.
    pub async fn update(&self, request: &UpdateJobRequest, token: &str) -> Result<Job> {
        if token.is_empty() {
            return Err(Error::Unauthorized("missing access token".to_string()));
        }

        let mut job = self
            .repo
            .get_by_uuid_and_creator(&request.uuid, &request.creator)
            .await?;

        match job.status.plan(request.status)? {
            Transition::Unchanged => return Ok(job),
            Transition::MarkBuildFailed => {
                job.status = JobStatus::ImageBuildingFailed;
            }
            Transition::LaunchInstance => {
                self.launch_instance(&mut job, request, token).await?;
                job.status = JobStatus::VmRunning;
            }
            Transition::Finish => {
                job.attestation_report = request.attestation_token.clone();
                job.status = JobStatus::VmFinished;
            }
        }

        let job = self.repo.update(&job).await?;
        info!(job_uuid = %job.uuid, creator = %job.creator, status = %job.status, "Job status updated");
        Ok(job)
    }

    async fn launch_instance(
        &self,
        job: &mut Job,
        request: &UpdateJobRequest,
        token: &str,
    ) -> Result<()> {
        if request.docker_image_digest.is_empty() {
            return Err(Error::InvalidInput(format!(
                "job {} reported ready without an image digest",
                job.uuid
            )));
        }

        job.docker_image = if request.docker_image.is_empty() {
            self.config.cloud.image_tag(&job.creator, &job.uuid)
        } else {
            request.docker_image.clone()
        };
        job.docker_image_digest = request.docker_image_digest.clone();
        job.instance_name = paths::instance_name(&job.creator, &job.uuid);

        self.security
            .narrow_trust(&job.creator, &job.docker_image_digest)
            .await?;
        self.cloud
            .create_confidential_instance(&ConfidentialInstanceSpec {
                name: job.instance_name.clone(),
                image: job.docker_image.clone(),
                uuid: job.uuid.clone(),
                creator: job.creator.clone(),
                user_token: token.to_string(),
            })
            .await?;

        info!(job_uuid = %job.uuid, instance = %job.instance_name, "Launched confidential instance");
        Ok(())
    }
}

//! Reconciliation monitor.
//!
//! Two stateless sweeps fold external state back into job status. Everything
//! needed to correlate a build job or an instance with its job travels in the
//! resource's own name, annotations or labels, so the monitor keeps no store
//! and a restart loses nothing.

use crate::callback::StatusCallback;
use cleanroom_config::SystemConfig;
use cleanroom_core::cloud::{CloudProvider, Instance, InstanceState};
use cleanroom_core::runner::{
    ANNOTATION_JOB_CREATOR, ANNOTATION_JOB_UUID, ANNOTATION_USER_TOKEN, BuildJob, BuildJobState,
    JobRunner,
};
use cleanroom_core::{Error, JobStatus, Result, UpdateJobRequest, paths};
use regex::Regex;
use std::sync::{Arc, LazyLock};
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

/// Instances older than this are finished even if they never terminated.
pub const INSTANCE_MAX_AGE: Duration = Duration::from_secs(6 * 3600);

/// Attestation reports are truncated to this many bytes.
pub const ATTESTATION_REPORT_MAX: u64 = 3 * 1024 * 1024;

static DIGEST_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"sha256:[a-z0-9]+").expect("valid digest pattern"));

/// Image digest on the last non-empty line of a builder log.
pub fn extract_digest(log: &str) -> Option<String> {
    let last = log.lines().rev().find(|line| !line.trim().is_empty())?;
    DIGEST_PATTERN.find(last).map(|m| m.as_str().to_string())
}

/// A resource that could not be reconciled this tick.
#[derive(Debug, Clone, PartialEq)]
pub struct SweepFailure {
    pub resource: String,
    pub error: String,
}

/// Outcome of one sweep.
#[derive(Debug, Clone, Default)]
pub struct SweepReport {
    /// Resources that belong to jobs.
    pub examined: usize,
    pub reconciled: usize,
    /// Resources left alone: still running or missing correlation metadata.
    pub skipped: usize,
    pub failures: Vec<SweepFailure>,
}

impl SweepReport {
    fn fail(&mut self, resource: impl Into<String>, err: &Error) {
        self.failures.push(SweepFailure {
            resource: resource.into(),
            error: err.to_string(),
        });
    }

    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Reports of both sweeps of one tick.
#[derive(Debug, Clone, Default)]
pub struct MonitorReport {
    pub builds: SweepReport,
    pub instances: SweepReport,
}

struct BuildOwner {
    uuid: String,
    creator: String,
    token: String,
}

impl BuildOwner {
    fn from_job(job: &BuildJob) -> Option<Self> {
        let get = |key: &str| {
            job.annotations
                .get(key)
                .filter(|v| !v.is_empty())
                .cloned()
        };
        Some(Self {
            uuid: get(ANNOTATION_JOB_UUID)?,
            creator: get(ANNOTATION_JOB_CREATOR)?,
            token: get(ANNOTATION_USER_TOKEN)?,
        })
    }
}

pub struct Monitor {
    cloud: Arc<dyn CloudProvider>,
    runner: Arc<dyn JobRunner>,
    callback: Arc<dyn StatusCallback>,
    config: SystemConfig,
}

impl Monitor {
    pub fn new(
        cloud: Arc<dyn CloudProvider>,
        runner: Arc<dyn JobRunner>,
        callback: Arc<dyn StatusCallback>,
        config: SystemConfig,
    ) -> Self {
        Self {
            cloud,
            runner,
            callback,
            config,
        }
    }

    /// Forward the outcome of every finished build job.
    pub async fn sweep_builds(&self) -> Result<SweepReport> {
        let jobs = self.runner.list().await?;
        let mut report = SweepReport::default();

        for job in jobs {
            if !job.name.starts_with(paths::BUILD_JOB_PREFIX) {
                continue;
            }
            report.examined += 1;

            if !job.state.is_terminal() {
                report.skipped += 1;
                continue;
            }

            let Some(owner) = BuildOwner::from_job(&job) else {
                warn!(build_job = %job.name, "Build job is missing correlation annotations");
                report.skipped += 1;
                continue;
            };

            match self.reconcile_build(&job, &owner).await {
                Ok(()) => report.reconciled += 1,
                Err(e) => {
                    warn!(build_job = %job.name, job_uuid = %owner.uuid, error = %e, "Failed to reconcile build job");
                    report.fail(&job.name, &e);
                }
            }
        }

        info!(
            examined = report.examined,
            reconciled = report.reconciled,
            skipped = report.skipped,
            failed = report.failures.len(),
            "Build sweep finished"
        );
        Ok(report)
    }

    async fn reconcile_build(&self, job: &BuildJob, owner: &BuildOwner) -> Result<()> {
        let request = match job.state {
            BuildJobState::Running => return Ok(()),
            BuildJobState::Succeeded => {
                let digest = self.find_digest(&job.name).await?;
                UpdateJobRequest {
                    uuid: owner.uuid.clone(),
                    status: JobStatus::VmWaiting,
                    docker_image: self.config.cloud.image_tag(&owner.creator, &owner.uuid),
                    docker_image_digest: digest,
                    creator: owner.creator.clone(),
                    attestation_token: String::new(),
                }
            }
            BuildJobState::Failed => UpdateJobRequest {
                uuid: owner.uuid.clone(),
                status: JobStatus::ImageBuildingFailed,
                docker_image: String::new(),
                docker_image_digest: String::new(),
                creator: owner.creator.clone(),
                attestation_token: String::new(),
            },
        };

        // The build job stays until the transition is accepted so the next tick retries it.
        self.forward(&request, &owner.token, &job.name).await?;
        self.runner.delete(&job.name).await?;

        if job.state == BuildJobState::Succeeded {
            let context = paths::build_context_path(&owner.creator, &owner.uuid);
            if let Err(e) = self.cloud.delete(&context).await {
                warn!(job_uuid = %owner.uuid, path = %context, error = %e, "Failed to delete build context");
            }
        }

        info!(build_job = %job.name, job_uuid = %owner.uuid, status = %request.status, "Reconciled build job");
        Ok(())
    }

    async fn find_digest(&self, job_name: &str) -> Result<String> {
        let logs = self.runner.pod_logs(job_name).await?;
        logs.iter()
            .find_map(|log| extract_digest(log))
            .ok_or_else(|| Error::NotFound(format!("image digest in logs of {}", job_name)))
    }

    /// Finish jobs whose instance terminated or outlived [`INSTANCE_MAX_AGE`].
    pub async fn sweep_instances(&self) -> Result<SweepReport> {
        let instances = self.cloud.list_instances().await?;
        let now = chrono::Utc::now();
        let mut report = SweepReport::default();

        for instance in instances {
            let Some(uuid) = instance.uuid.clone().filter(|u| !u.is_empty()) else {
                continue;
            };
            report.examined += 1;

            let terminated = instance.state == InstanceState::Terminated;
            let age = (now - instance.created_at).to_std().unwrap_or_default();
            let stuck = age > INSTANCE_MAX_AGE;
            if !terminated && !stuck {
                report.skipped += 1;
                continue;
            }

            let creator = instance
                .creator
                .clone()
                .filter(|c| !c.is_empty())
                .or_else(|| {
                    paths::creator_from_instance_name(&instance.name, &uuid).map(str::to_string)
                });
            let (Some(creator), Some(token)) = (
                creator,
                instance.user_token.clone().filter(|t| !t.is_empty()),
            ) else {
                warn!(instance = %instance.name, job_uuid = %uuid, "Instance is missing correlation labels");
                report.skipped += 1;
                continue;
            };

            if !terminated {
                warn!(instance = %instance.name, job_uuid = %uuid, age_secs = age.as_secs(), "Instance exceeded its lifetime");
            }

            match self
                .finish_instance(&instance, &uuid, &creator, &token, terminated)
                .await
            {
                Ok(()) => report.reconciled += 1,
                Err(e) => {
                    warn!(instance = %instance.name, job_uuid = %uuid, error = %e, "Failed to reconcile instance");
                    report.fail(&instance.name, &e);
                }
            }
        }

        info!(
            examined = report.examined,
            reconciled = report.reconciled,
            skipped = report.skipped,
            failed = report.failures.len(),
            "Instance sweep finished"
        );
        Ok(report)
    }

    async fn finish_instance(
        &self,
        instance: &Instance,
        uuid: &str,
        creator: &str,
        token: &str,
        terminated: bool,
    ) -> Result<()> {
        let report = match self.read_attestation(creator, uuid).await {
            Ok(report) => report,
            Err(e) if !terminated => {
                warn!(job_uuid = %uuid, error = %e, "No attestation report for stuck instance");
                String::new()
            }
            Err(e) => return Err(e),
        };

        let request = UpdateJobRequest {
            uuid: uuid.to_string(),
            status: JobStatus::VmFinished,
            docker_image: String::new(),
            docker_image_digest: String::new(),
            creator: creator.to_string(),
            attestation_token: report,
        };
        self.forward(&request, token, &instance.name).await?;
        self.cloud.delete_instance(&instance.name).await?;

        info!(instance = %instance.name, job_uuid = %uuid, "Finished job instance");
        Ok(())
    }

    /// Send a transition. A job that no longer exists is not an error: its
    /// resource is orphaned and gets cleaned up like any finished one.
    async fn forward(
        &self,
        request: &UpdateJobRequest,
        token: &str,
        resource: &str,
    ) -> Result<()> {
        match self.callback.send(request, token).await {
            Err(Error::NotFound(msg)) => {
                warn!(resource = %resource, job_uuid = %request.uuid, reason = %msg, "Job no longer exists, removing orphaned resource");
                Ok(())
            }
            other => other,
        }
    }

    async fn read_attestation(&self, creator: &str, uuid: &str) -> Result<String> {
        let data = self
            .cloud
            .read_range(
                &paths::attestation_token_path(creator, uuid),
                0,
                ATTESTATION_REPORT_MAX,
            )
            .await?;
        Ok(String::from_utf8_lossy(&data).into_owned())
    }

    /// Run the build sweep, then the instance sweep. A listing failure ends
    /// only its own sweep and is reported as that sweep's failure.
    pub async fn run_once(&self) -> MonitorReport {
        let builds = self.sweep_builds().await.unwrap_or_else(|e| {
            error!(error = %e, "Failed to list build jobs");
            let mut report = SweepReport::default();
            report.fail("build jobs", &e);
            report
        });
        let instances = self.sweep_instances().await.unwrap_or_else(|e| {
            error!(error = %e, "Failed to list instances");
            let mut report = SweepReport::default();
            report.fail("instances", &e);
            report
        });
        MonitorReport { builds, instances }
    }

    /// Sweep forever, pausing `interval` between ticks.
    pub async fn run(&self, interval: Duration) {
        info!(
            runner = self.runner.name(),
            cloud = self.cloud.name(),
            interval_secs = interval.as_secs(),
            "Starting monitor"
        );

        loop {
            let report = self.run_once().await;
            debug!(
                build_failures = report.builds.failures.len(),
                instance_failures = report.instances.failures.len(),
                "Monitor tick finished"
            );
            sleep(interval).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::JobService;
    use crate::test_support::{
        FakeCloud, FakeRunner, MemoryJobRepo, RecordingCallback, ServiceCallback, test_config,
        workspace_archive,
    };
    use bytes::Bytes;
    use chrono::Utc;
    use cleanroom_db::JobRepo;
    use std::collections::BTreeMap;

    const UUID: &str = "123e4567-e89b-12d3-a456-426614174000";

    fn build_job(name: &str, state: BuildJobState) -> BuildJob {
        BuildJob {
            name: name.to_string(),
            annotations: BTreeMap::from([
                (ANNOTATION_JOB_UUID.to_string(), UUID.to_string()),
                (ANNOTATION_JOB_CREATOR.to_string(), "alice".to_string()),
                (ANNOTATION_USER_TOKEN.to_string(), "tok".to_string()),
            ]),
            state,
        }
    }

    fn instance(state: InstanceState, age_hours: i64) -> Instance {
        Instance {
            name: "alice-123e4567".to_string(),
            state,
            uuid: Some(UUID.to_string()),
            creator: Some("alice".to_string()),
            user_token: Some("tok".to_string()),
            created_at: Utc::now() - chrono::Duration::hours(age_hours),
        }
    }

    fn monitor(
        cloud: Arc<FakeCloud>,
        runner: Arc<FakeRunner>,
        callback: Arc<dyn StatusCallback>,
    ) -> Monitor {
        Monitor::new(cloud, runner, callback, test_config())
    }

    #[test]
    fn test_extract_digest() {
        let log = "INFO pushing layers\nINFO sha256:abc123 pushed\n";
        assert_eq!(extract_digest(log), Some("sha256:abc123".to_string()));
    }

    #[test]
    fn test_extract_digest_only_reads_last_line() {
        let log = "INFO sha256:abc123 pushed\nINFO done";
        assert_eq!(extract_digest(log), None);
        assert_eq!(extract_digest(""), None);
    }

    #[tokio::test]
    async fn test_successful_build_forwards_digest() {
        let cloud = Arc::new(FakeCloud::default());
        let runner = Arc::new(FakeRunner::default());
        let callback = Arc::new(RecordingCallback::default());
        let name = format!("kaniko-{}", UUID);
        runner.add_job(build_job(&name, BuildJobState::Succeeded));
        runner.set_logs(&name, vec!["step 1\nsha256:deadbeef pushed".to_string()]);
        cloud.put(&format!("alice/context-{}.tar.gz", UUID), b"ctx".to_vec());

        let report = monitor(cloud.clone(), runner.clone(), callback.clone())
            .sweep_builds()
            .await
            .unwrap();

        assert_eq!(report.reconciled, 1);
        assert!(report.is_clean());
        let sent = callback.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0.status, JobStatus::VmWaiting);
        assert_eq!(sent[0].0.docker_image_digest, "sha256:deadbeef");
        assert_eq!(sent[0].1, "tok");
        assert_eq!(runner.deleted(), vec![name]);
        assert!(cloud.object(&format!("alice/context-{}.tar.gz", UUID)).is_none());
    }

    #[tokio::test]
    async fn test_failed_build_forwards_failure() {
        let runner = Arc::new(FakeRunner::default());
        let callback = Arc::new(RecordingCallback::default());
        let name = format!("kaniko-{}", UUID);
        runner.add_job(build_job(&name, BuildJobState::Failed));

        let report = monitor(Arc::new(FakeCloud::default()), runner.clone(), callback.clone())
            .sweep_builds()
            .await
            .unwrap();

        assert_eq!(report.reconciled, 1);
        assert_eq!(callback.sent()[0].0.status, JobStatus::ImageBuildingFailed);
        assert_eq!(runner.deleted(), vec![name]);
    }

    #[tokio::test]
    async fn test_build_sweep_skips_foreign_and_running_jobs() {
        let runner = Arc::new(FakeRunner::default());
        let callback = Arc::new(RecordingCallback::default());
        runner.add_job(build_job("nightly-backup", BuildJobState::Succeeded));
        runner.add_job(build_job("kaniko-running", BuildJobState::Running));
        let mut bare = build_job("kaniko-bare", BuildJobState::Failed);
        bare.annotations.clear();
        runner.add_job(bare);

        let report = monitor(Arc::new(FakeCloud::default()), runner.clone(), callback.clone())
            .sweep_builds()
            .await
            .unwrap();

        assert_eq!(report.examined, 2);
        assert_eq!(report.skipped, 2);
        assert!(callback.sent().is_empty());
        assert!(runner.deleted().is_empty());
    }

    #[tokio::test]
    async fn test_missing_digest_fails_only_that_job() {
        let runner = Arc::new(FakeRunner::default());
        let callback = Arc::new(RecordingCallback::default());
        runner.add_job(build_job("kaniko-nodigest", BuildJobState::Succeeded));
        runner.set_logs("kaniko-nodigest", vec!["error: push denied".to_string()]);
        runner.add_job(build_job("kaniko-failed", BuildJobState::Failed));

        let report = monitor(Arc::new(FakeCloud::default()), runner.clone(), callback.clone())
            .sweep_builds()
            .await
            .unwrap();

        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].resource, "kaniko-nodigest");
        assert_eq!(report.reconciled, 1);
        assert_eq!(runner.deleted(), vec!["kaniko-failed".to_string()]);
    }

    #[tokio::test]
    async fn test_forwarding_failure_keeps_build_job() {
        let runner = Arc::new(FakeRunner::default());
        let callback = Arc::new(RecordingCallback::failing());
        runner.add_job(build_job("kaniko-x", BuildJobState::Failed));

        let report = monitor(Arc::new(FakeCloud::default()), runner.clone(), callback)
            .sweep_builds()
            .await
            .unwrap();

        assert_eq!(report.failures.len(), 1);
        assert!(runner.deleted().is_empty());
        assert_eq!(runner.job_names(), vec!["kaniko-x".to_string()]);
    }

    #[tokio::test]
    async fn test_build_sweep_rerun_is_noop() {
        let runner = Arc::new(FakeRunner::default());
        let callback = Arc::new(RecordingCallback::default());
        runner.add_job(build_job("kaniko-x", BuildJobState::Failed));
        let monitor = monitor(Arc::new(FakeCloud::default()), runner.clone(), callback.clone());

        monitor.sweep_builds().await.unwrap();
        let again = monitor.sweep_builds().await.unwrap();

        assert_eq!(again.examined, 0);
        assert!(again.is_clean());
        assert_eq!(callback.sent().len(), 1);
    }

    #[tokio::test]
    async fn test_terminated_instance_is_finished_with_report() {
        let cloud = Arc::new(FakeCloud::default());
        let callback = Arc::new(RecordingCallback::default());
        cloud.add_instance(instance(InstanceState::Terminated, 1));
        cloud.put(&format!("alice/output/{}-token", UUID), b"report-jwt".to_vec());

        let report = monitor(cloud.clone(), Arc::new(FakeRunner::default()), callback.clone())
            .sweep_instances()
            .await
            .unwrap();

        assert_eq!(report.reconciled, 1);
        let sent = callback.sent();
        assert_eq!(sent[0].0.status, JobStatus::VmFinished);
        assert_eq!(sent[0].0.attestation_token, "report-jwt");
        assert_eq!(cloud.deleted_instances(), vec!["alice-123e4567".to_string()]);
    }

    #[tokio::test]
    async fn test_terminated_instance_without_report_is_retried() {
        let cloud = Arc::new(FakeCloud::default());
        let callback = Arc::new(RecordingCallback::default());
        cloud.add_instance(instance(InstanceState::Terminated, 1));

        let report = monitor(cloud.clone(), Arc::new(FakeRunner::default()), callback.clone())
            .sweep_instances()
            .await
            .unwrap();

        assert_eq!(report.failures.len(), 1);
        assert!(callback.sent().is_empty());
        assert!(cloud.deleted_instances().is_empty());
    }

    #[tokio::test]
    async fn test_stuck_instance_is_forced_to_finish() {
        let cloud = Arc::new(FakeCloud::default());
        let callback = Arc::new(RecordingCallback::default());
        cloud.add_instance(instance(InstanceState::Running, 7));

        let report = monitor(cloud.clone(), Arc::new(FakeRunner::default()), callback.clone())
            .sweep_instances()
            .await
            .unwrap();

        assert_eq!(report.reconciled, 1);
        let sent = callback.sent();
        assert_eq!(sent[0].0.status, JobStatus::VmFinished);
        assert_eq!(sent[0].0.attestation_token, "");
        assert_eq!(cloud.deleted_instances(), vec!["alice-123e4567".to_string()]);
    }

    #[tokio::test]
    async fn test_young_and_foreign_instances_are_left_alone() {
        let cloud = Arc::new(FakeCloud::default());
        let callback = Arc::new(RecordingCallback::default());
        cloud.add_instance(instance(InstanceState::Running, 1));
        let mut foreign = instance(InstanceState::Terminated, 30);
        foreign.name = "bastion".to_string();
        foreign.uuid = None;
        cloud.add_instance(foreign);

        let report = monitor(cloud.clone(), Arc::new(FakeRunner::default()), callback.clone())
            .sweep_instances()
            .await
            .unwrap();

        assert_eq!(report.examined, 1);
        assert_eq!(report.skipped, 1);
        assert!(callback.sent().is_empty());
        assert!(cloud.deleted_instances().is_empty());
    }

    #[tokio::test]
    async fn test_creator_recovered_from_instance_name() {
        let cloud = Arc::new(FakeCloud::default());
        let callback = Arc::new(RecordingCallback::default());
        let mut unlabeled = instance(InstanceState::Running, 8);
        unlabeled.creator = None;
        cloud.add_instance(unlabeled);

        monitor(cloud, Arc::new(FakeRunner::default()), callback.clone())
            .sweep_instances()
            .await
            .unwrap();

        assert_eq!(callback.sent()[0].0.creator, "alice");
    }

    #[tokio::test]
    async fn test_instance_deletion_failure_does_not_stop_sweep() {
        let cloud = Arc::new(FakeCloud::default());
        let callback = Arc::new(RecordingCallback::default());
        cloud.add_instance(instance(InstanceState::Running, 9));
        let mut other = instance(InstanceState::Running, 9);
        other.name = "bob-deadbeef".to_string();
        other.uuid = Some("deadbeef-0000".to_string());
        other.creator = Some("bob".to_string());
        cloud.add_instance(other);
        cloud.fail_instance_deletion();

        let report = monitor(cloud, Arc::new(FakeRunner::default()), callback.clone())
            .sweep_instances()
            .await
            .unwrap();

        assert_eq!(report.failures.len(), 2);
        assert_eq!(callback.sent().len(), 2);
    }

    #[tokio::test]
    async fn test_orphaned_build_job_is_removed() {
        let cloud = Arc::new(FakeCloud::default());
        let runner = Arc::new(FakeRunner::default());
        let callback = Arc::new(RecordingCallback::missing_job());
        let name = format!("kaniko-{}", UUID);
        runner.add_job(build_job(&name, BuildJobState::Succeeded));
        runner.set_logs(&name, vec!["sha256:deadbeef".to_string()]);
        cloud.put(&format!("alice/context-{}.tar.gz", UUID), b"ctx".to_vec());

        let report = monitor(cloud.clone(), runner.clone(), callback)
            .sweep_builds()
            .await
            .unwrap();

        assert!(report.is_clean(), "{:?}", report.failures);
        assert_eq!(report.reconciled, 1);
        assert_eq!(runner.deleted(), vec![name]);
        assert!(cloud.object(&format!("alice/context-{}.tar.gz", UUID)).is_none());
    }

    #[tokio::test]
    async fn test_orphaned_instance_is_deleted() {
        let cloud = Arc::new(FakeCloud::default());
        let callback = Arc::new(RecordingCallback::missing_job());
        cloud.add_instance(instance(InstanceState::Running, 7));

        let report = monitor(cloud.clone(), Arc::new(FakeRunner::default()), callback)
            .sweep_instances()
            .await
            .unwrap();

        assert!(report.is_clean(), "{:?}", report.failures);
        assert_eq!(report.reconciled, 1);
        assert_eq!(cloud.deleted_instances(), vec!["alice-123e4567".to_string()]);
    }

    #[tokio::test]
    async fn test_instance_of_deleted_job_is_cleaned_up() {
        let repo = Arc::new(MemoryJobRepo::default());
        let cloud = Arc::new(FakeCloud::default());
        let runner = Arc::new(FakeRunner::default());
        let service = Arc::new(JobService::new(
            repo.clone(),
            cloud.clone(),
            runner.clone(),
            test_config(),
        ));
        let monitor = Monitor::new(
            cloud.clone(),
            runner.clone(),
            Arc::new(ServiceCallback::new(service.clone())),
            test_config(),
        );

        let workspace =
            workspace_archive(&[("alice-workspace/nb.ipynb", b"{}".as_slice())]);
        let uuid = service
            .submit("alice", "nb.ipynb", Bytes::from(workspace), "tok")
            .await
            .unwrap();
        let build = paths::build_job_name(&uuid);
        runner.set_state(&build, BuildJobState::Succeeded);
        runner.set_logs(&build, vec!["pushed sha256:deadbeef".to_string()]);
        monitor.run_once().await;

        // The creator deletes the job while its instance is still running.
        service.delete("alice", &uuid).await.unwrap();
        let instance = paths::instance_name("alice", &uuid);
        cloud.put(&paths::attestation_token_path("alice", &uuid), b"attested".to_vec());
        cloud.set_instance_state(&instance, InstanceState::Terminated);

        let report = monitor.run_once().await;
        assert!(report.instances.is_clean(), "{:?}", report.instances.failures);
        assert_eq!(cloud.deleted_instances(), vec![instance]);
        assert!(cloud.list_instances().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_ready_transition_retried_after_lost_update() {
        let repo = Arc::new(MemoryJobRepo::default());
        let cloud = Arc::new(FakeCloud::default());
        let runner = Arc::new(FakeRunner::default());
        let service = Arc::new(JobService::new(
            repo.clone(),
            cloud.clone(),
            runner.clone(),
            test_config(),
        ));
        let monitor = Monitor::new(
            cloud.clone(),
            runner.clone(),
            Arc::new(ServiceCallback::new(service.clone())),
            test_config(),
        );

        let workspace =
            workspace_archive(&[("alice-workspace/nb.ipynb", b"{}".as_slice())]);
        let uuid = service
            .submit("alice", "nb.ipynb", Bytes::from(workspace), "tok")
            .await
            .unwrap();
        let build = paths::build_job_name(&uuid);
        runner.set_state(&build, BuildJobState::Succeeded);
        runner.set_logs(&build, vec!["pushed sha256:deadbeef".to_string()]);

        // The instance boots but recording VmRunning fails.
        repo.fail_updates(true);
        let report = monitor.run_once().await;
        assert_eq!(report.builds.failures.len(), 1);
        assert_eq!(runner.job_names(), vec![build.clone()]);
        let job = repo.get_by_uuid_and_creator(&uuid, "alice").await.unwrap();
        assert_eq!(job.status, JobStatus::ImageBuilding);

        repo.fail_updates(false);
        let report = monitor.run_once().await;
        assert!(report.builds.is_clean(), "{:?}", report.builds.failures);
        let job = repo.get_by_uuid_and_creator(&uuid, "alice").await.unwrap();
        assert_eq!(job.status, JobStatus::VmRunning);
        assert_eq!(cloud.list_instances().await.unwrap().len(), 1);
        assert_eq!(cloud.duplicate_instance_creations(), 1);
        assert!(runner.job_names().is_empty());
    }

    #[tokio::test]
    async fn test_run_once_reports_listing_failure() {
        let cloud = Arc::new(FakeCloud::default());
        let runner = Arc::new(FakeRunner::default());
        runner.fail_listing();

        let report = monitor(cloud, runner, Arc::new(RecordingCallback::default()))
            .run_once()
            .await;

        assert_eq!(report.builds.failures.len(), 1);
        assert!(report.instances.is_clean());
    }

    #[tokio::test]
    async fn test_end_to_end_lifecycle() {
        let repo = Arc::new(MemoryJobRepo::default());
        let cloud = Arc::new(FakeCloud::default());
        let runner = Arc::new(FakeRunner::default());
        let service = Arc::new(JobService::new(
            repo.clone(),
            cloud.clone(),
            runner.clone(),
            test_config(),
        ));
        let monitor = Monitor::new(
            cloud.clone(),
            runner.clone(),
            Arc::new(ServiceCallback::new(service.clone())),
            test_config(),
        );

        let workspace =
            workspace_archive(&[("alice-workspace/nb.ipynb", b"{\"cells\": []}".as_slice())]);
        let uuid = service
            .submit("alice", "nb.ipynb", Bytes::from(workspace), "tok")
            .await
            .unwrap();
        let job = repo.get_by_uuid_and_creator(&uuid, "alice").await.unwrap();
        assert_eq!(job.status, JobStatus::ImageBuilding);

        // The builder finishes and pushes the image.
        let build = paths::build_job_name(&uuid);
        runner.set_state(&build, BuildJobState::Succeeded);
        runner.set_logs(&build, vec!["pushed sha256:deadbeef".to_string()]);

        let report = monitor.run_once().await;
        assert!(report.builds.is_clean(), "{:?}", report.builds.failures);
        let job = repo.get_by_uuid_and_creator(&uuid, "alice").await.unwrap();
        assert_eq!(job.status, JobStatus::VmRunning);
        assert_eq!(job.docker_image_digest, "sha256:deadbeef");
        assert_eq!(job.instance_name, paths::instance_name("alice", &uuid));

        // The workload writes its token and the instance shuts down.
        cloud.put(
            &paths::attestation_token_path("alice", &uuid),
            b"attested".to_vec(),
        );
        cloud.set_instance_state(&job.instance_name, InstanceState::Terminated);

        let report = monitor.run_once().await;
        assert!(report.instances.is_clean(), "{:?}", report.instances.failures);
        let job = repo.get_by_uuid_and_creator(&uuid, "alice").await.unwrap();
        assert_eq!(job.status, JobStatus::VmFinished);
        assert_eq!(job.attestation_report, "attested");
        assert!(cloud.deleted_instances().contains(&job.instance_name));
        assert!(cloud.list_instances().await.unwrap().is_empty());

        // Nothing is left to reconcile.
        let report = monitor.run_once().await;
        assert_eq!(report.builds.examined + report.instances.examined, 0);
    }
}

//! Kubernetes job runner implementation.

use async_trait::async_trait;
use cleanroom_core::runner::{BuildJob, BuildJobSpec, BuildJobState, JobRunner};
use cleanroom_core::{Error, Result};
use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{Container, Pod, PodSpec, PodTemplateSpec, ResourceRequirements};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, DeleteParams, ListParams, LogParams, PostParams};
use kube::runtime::wait::{await_condition, conditions};
use kube::Client;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Label the job controller puts on every pod it creates.
const JOB_NAME_LABEL: &str = "job-name";

const BUILDER_CONTAINER: &str = "kaniko";

/// Upper bound on waiting for a deleted job's pods to go away.
const DELETE_TIMEOUT: Duration = Duration::from_secs(120);

/// Kubernetes-based build job runner.
pub struct KubernetesJobRunner {
    client: Client,
    namespace: String,
}

impl KubernetesJobRunner {
    pub async fn new(namespace: impl Into<String>) -> Result<Self> {
        let client = Client::try_default()
            .await
            .map_err(|e| Error::upstream("connect to kubernetes", e))?;
        Ok(Self {
            client,
            namespace: namespace.into(),
        })
    }

    pub fn with_client(client: Client, namespace: impl Into<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
        }
    }

    fn jobs(&self) -> Api<Job> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    fn pods(&self) -> Api<Pod> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }
}

fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 404)
}

/// Translate a build job spec into a `batch/v1` Job.
///
/// Builds are single-attempt: the pod never restarts and the controller
/// never retries.
pub fn build_job_manifest(spec: BuildJobSpec, namespace: &str) -> Job {
    let ttl = i32::try_from(spec.ttl.as_secs()).unwrap_or(i32::MAX);

    let container = Container {
        name: BUILDER_CONTAINER.to_string(),
        image: Some(spec.image),
        args: Some(spec.args),
        resources: Some(ResourceRequirements {
            requests: Some(BTreeMap::from([(
                "memory".to_string(),
                Quantity(spec.memory_request),
            )])),
            ..Default::default()
        }),
        ..Default::default()
    };

    Job {
        metadata: ObjectMeta {
            name: Some(spec.name),
            namespace: Some(namespace.to_string()),
            annotations: Some(spec.annotations),
            ..Default::default()
        },
        spec: Some(JobSpec {
            backoff_limit: Some(0),
            ttl_seconds_after_finished: Some(ttl),
            template: PodTemplateSpec {
                metadata: None,
                spec: Some(PodSpec {
                    containers: vec![container],
                    restart_policy: Some("Never".to_string()),
                    service_account_name: spec.service_account,
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Derive the build state from a job's conditions.
pub fn job_state(job: &Job) -> BuildJobState {
    let conditions = job
        .status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .map(|c| c.as_slice())
        .unwrap_or_default();

    let holds = |kind: &str| {
        conditions
            .iter()
            .any(|c| c.type_ == kind && c.status == "True")
    };

    if holds("Complete") {
        BuildJobState::Succeeded
    } else if holds("Failed") {
        BuildJobState::Failed
    } else {
        BuildJobState::Running
    }
}

#[async_trait]
impl JobRunner for KubernetesJobRunner {
    fn name(&self) -> &'static str {
        "kubernetes"
    }

    async fn create(&self, spec: BuildJobSpec) -> Result<()> {
        let name = spec.name.clone();
        let job = build_job_manifest(spec, &self.namespace);

        self.jobs()
            .create(&PostParams::default(), &job)
            .await
            .map_err(|e| Error::upstream(format!("create build job {}", name), e))?;

        info!(build_job = %name, namespace = %self.namespace, "Created build job");
        Ok(())
    }

    async fn list(&self) -> Result<Vec<BuildJob>> {
        let jobs = self
            .jobs()
            .list(&ListParams::default())
            .await
            .map_err(|e| Error::upstream("list build jobs", e))?;

        Ok(jobs
            .items
            .iter()
            .filter_map(|job| {
                let name = job.metadata.name.clone()?;
                Some(BuildJob {
                    name,
                    annotations: job.metadata.annotations.clone().unwrap_or_default(),
                    state: job_state(job),
                })
            })
            .collect())
    }

    async fn delete(&self, name: &str) -> Result<()> {
        let jobs = self.jobs();
        let pending = match jobs.delete(name, &DeleteParams::foreground()).await {
            Ok(outcome) => outcome.left(),
            Err(e) if is_not_found(&e) => {
                debug!(build_job = %name, "Build job already deleted");
                return Ok(());
            }
            Err(e) => return Err(Error::upstream(format!("delete build job {}", name), e)),
        };

        // Foreground deletion keeps the job object until its pods are gone.
        if let Some(uid) = pending.and_then(|job| job.metadata.uid) {
            let gone = await_condition(jobs, name, conditions::is_deleted(&uid));
            match tokio::time::timeout(DELETE_TIMEOUT, gone).await {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => {
                    return Err(Error::upstream(format!("await deletion of {}", name), e));
                }
                Err(_) => {
                    warn!(build_job = %name, "Timed out waiting for build job pods to be removed");
                }
            }
        }

        info!(build_job = %name, "Deleted build job");
        Ok(())
    }

    async fn pod_logs(&self, job_name: &str) -> Result<Vec<String>> {
        let pods = self.pods();
        let selector = format!("{}={}", JOB_NAME_LABEL, job_name);
        let list = pods
            .list(&ListParams::default().labels(&selector))
            .await
            .map_err(|e| Error::upstream(format!("list pods of {}", job_name), e))?;

        let mut logs = Vec::with_capacity(list.items.len());
        for pod in &list.items {
            let Some(pod_name) = pod.metadata.name.as_deref() else {
                continue;
            };
            let text = pods
                .logs(pod_name, &LogParams::default())
                .await
                .map_err(|e| Error::upstream(format!("read logs of pod {}", pod_name), e))?;
            logs.push(text);
        }

        Ok(logs)
    }
}

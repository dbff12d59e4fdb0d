//! In-memory capabilities for exercising the scheduler without a cluster,
//! a cloud project or a database.

use crate::callback::StatusCallback;
use crate::service::JobService;
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use bytes::Bytes;
use chrono::Utc;
use cleanroom_config::{
    ApiConfig, BuildConfig, CloudConfig, ClusterConfig, MonitorConfig, SystemConfig,
};
use cleanroom_core::cloud::{CloudProvider, ConfidentialInstanceSpec, Instance, InstanceState};
use cleanroom_core::runner::{BuildJob, BuildJobSpec, BuildJobState, JobRunner};
use cleanroom_core::{Error, Job, NewJob, Result, UpdateJobRequest};
use cleanroom_db::{DbError, DbResult, JobPage, JobRepo};
use flate2::Compression;
use flate2::write::GzEncoder;
use std::collections::{BTreeMap, HashMap};
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

fn gzip(data: &[u8]) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data).unwrap();
    encoder.finish().unwrap()
}

/// Gzipped tar holding `files` as regular files.
pub fn workspace_archive(files: &[(&str, &[u8])]) -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());
    for (path, data) in files {
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, path, *data).unwrap();
    }
    gzip(&builder.into_inner().unwrap())
}

/// Gzipped tar with a single entry whose name and link target are written
/// verbatim, bypassing the path checks of [`tar::Header::set_path`].
pub fn raw_entry(mut header: tar::Header, name: &[u8], link: Option<&[u8]>, data: &[u8]) -> Vec<u8> {
    {
        let old = header.as_old_mut();
        old.name[..name.len()].copy_from_slice(name);
        if let Some(link) = link {
            old.linkname[..link.len()].copy_from_slice(link);
        }
    }
    header.set_size(data.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();

    let mut builder = tar::Builder::new(Vec::new());
    builder.append(&header, data).unwrap();
    gzip(&builder.into_inner().unwrap())
}

/// Directory holding the Dockerfile and config injected into test builds.
fn fixture_dir() -> &'static PathBuf {
    static DIR: OnceLock<PathBuf> = OnceLock::new();
    DIR.get_or_init(|| {
        let dir = std::env::temp_dir().join(format!("cleanroom-fixtures-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("Dockerfile"), "ARG BASE_IMAGE\nFROM ${BASE_IMAGE}\n").unwrap();
        std::fs::write(dir.join("config.yaml"), "env: test\n").unwrap();
        dir
    })
}

pub fn test_config() -> SystemConfig {
    let fixtures = fixture_dir();
    SystemConfig {
        cloud: CloudConfig {
            project: "acme".to_string(),
            project_number: 42,
            registry: "us-docker.pkg.dev".to_string(),
            repository: "cleanroom".to_string(),
            bucket: "test-bucket".to_string(),
            cvm_service_account: "cvm".to_string(),
            zone: "us-west1-b".to_string(),
            region: "us-west1".to_string(),
            cpus: 2,
            disk_size_gb: 20,
            debug_image: "projects/cs/global/images/debug".to_string(),
            release_image: "projects/cs/global/images/release".to_string(),
            debug: false,
            key_ring: "ring".to_string(),
            workload_identity_pool: "pool".to_string(),
            issuer_uri: "https://confidentialcomputing.googleapis.com/".to_string(),
            allowed_audiences: vec!["https://sts.googleapis.com".to_string()],
            network: "default".to_string(),
            subnetwork: "default".to_string(),
            env: "test".to_string(),
        },
        cluster: ClusterConfig {
            namespace: "cleanroom".to_string(),
            pod_service_account: "builder".to_string(),
        },
        build: BuildConfig {
            dockerfile: fixtures.join("Dockerfile").display().to_string(),
            config_file: fixtures.join("config.yaml").display().to_string(),
            scratch_dir: fixtures.join("scratch").display().to_string(),
            ..BuildConfig::default()
        },
        api: ApiConfig::default(),
        monitor: MonitorConfig::default(),
    }
}

#[derive(Default)]
struct JobTable {
    next_id: i64,
    jobs: Vec<Job>,
}

/// [`JobRepo`] over a vector.
#[derive(Default)]
pub struct MemoryJobRepo {
    table: Mutex<JobTable>,
    fail_updates: AtomicBool,
}

impl MemoryJobRepo {
    /// Make every `update` fail until switched back.
    pub fn fail_updates(&self, fail: bool) {
        self.fail_updates.store(fail, Ordering::SeqCst);
    }
}

fn missing(what: impl std::fmt::Display) -> DbError {
    DbError::NotFound(format!("job {}", what))
}

#[async_trait]
impl JobRepo for MemoryJobRepo {
    async fn create(&self, job: NewJob) -> DbResult<Job> {
        let mut table = self.table.lock().unwrap();
        if table.jobs.iter().any(|j| j.uuid == job.uuid) {
            return Err(DbError::Duplicate(format!("job {}", job.uuid)));
        }
        table.next_id += 1;
        let now = Utc::now();
        let job = Job {
            id: table.next_id,
            uuid: job.uuid,
            creator: job.creator,
            notebook_name: job.notebook_name,
            docker_image: String::new(),
            docker_image_digest: String::new(),
            attestation_report: String::new(),
            status: job.status,
            instance_name: String::new(),
            created_at: now,
            updated_at: now,
        };
        table.jobs.push(job.clone());
        Ok(job)
    }

    async fn update(&self, job: &Job) -> DbResult<Job> {
        if self.fail_updates.load(Ordering::SeqCst) {
            return Err(DbError::Database(sqlx::Error::PoolTimedOut));
        }
        let mut table = self.table.lock().unwrap();
        let stored = table
            .jobs
            .iter_mut()
            .find(|j| j.id == job.id && j.creator == job.creator)
            .ok_or_else(|| missing(&job.uuid))?;
        stored.status = job.status;
        stored.docker_image = job.docker_image.clone();
        stored.docker_image_digest = job.docker_image_digest.clone();
        stored.attestation_report = job.attestation_report.clone();
        stored.instance_name = job.instance_name.clone();
        stored.updated_at = Utc::now();
        Ok(stored.clone())
    }

    async fn list_by_creator(&self, creator: &str, page: i64, page_size: i64) -> DbResult<JobPage> {
        let table = self.table.lock().unwrap();
        let mut owned: Vec<&Job> = table.jobs.iter().filter(|j| j.creator == creator).collect();
        owned.sort_by(|a, b| b.id.cmp(&a.id));
        let skip = ((page.max(1) - 1) * page_size) as usize;
        Ok(JobPage {
            total: owned.len() as i64,
            jobs: owned
                .into_iter()
                .skip(skip)
                .take(page_size as usize)
                .cloned()
                .collect(),
        })
    }

    async fn get_by_id_and_creator(&self, id: i64, creator: &str) -> DbResult<Job> {
        let table = self.table.lock().unwrap();
        table
            .jobs
            .iter()
            .find(|j| j.id == id && j.creator == creator)
            .cloned()
            .ok_or_else(|| missing(id))
    }

    async fn get_by_uuid_and_creator(&self, uuid: &str, creator: &str) -> DbResult<Job> {
        let table = self.table.lock().unwrap();
        table
            .jobs
            .iter()
            .find(|j| j.uuid == uuid && j.creator == creator)
            .cloned()
            .ok_or_else(|| missing(uuid))
    }

    async fn list_in_progress(&self, creator: &str) -> DbResult<Vec<Job>> {
        let table = self.table.lock().unwrap();
        Ok(table
            .jobs
            .iter()
            .filter(|j| j.creator == creator && j.status.is_in_progress())
            .cloned()
            .collect())
    }

    async fn delete(&self, creator: &str, uuid: &str) -> DbResult<()> {
        let mut table = self.table.lock().unwrap();
        table.jobs.retain(|j| !(j.creator == creator && j.uuid == uuid));
        Ok(())
    }
}

#[derive(Clone)]
struct StoredObject {
    data: Bytes,
    compressed: bool,
}

#[derive(Default)]
struct CloudState {
    objects: BTreeMap<String, StoredObject>,
    keys: Vec<String>,
    grants: Vec<(String, String, String)>,
    providers: BTreeMap<String, String>,
    instances: Vec<Instance>,
    created_instances: Vec<ConfidentialInstanceSpec>,
    duplicate_instance_creations: usize,
    deleted_instances: Vec<String>,
}

/// [`CloudProvider`] over maps, with switches to make single calls fail.
#[derive(Default)]
pub struct FakeCloud {
    state: Mutex<CloudState>,
    service_account: Option<String>,
    fail_instance_creation: AtomicBool,
    fail_instance_deletion: AtomicBool,
}

impl FakeCloud {
    pub fn with_service_account(email: &str) -> Self {
        Self {
            service_account: Some(email.to_string()),
            ..Self::default()
        }
    }

    pub fn put(&self, path: &str, data: Vec<u8>) {
        self.state.lock().unwrap().objects.insert(
            path.to_string(),
            StoredObject {
                data: Bytes::from(data),
                compressed: false,
            },
        );
    }

    pub fn object(&self, path: &str) -> Option<Bytes> {
        self.state
            .lock()
            .unwrap()
            .objects
            .get(path)
            .map(|o| o.data.clone())
    }

    pub fn was_compressed(&self, path: &str) -> bool {
        self.state
            .lock()
            .unwrap()
            .objects
            .get(path)
            .is_some_and(|o| o.compressed)
    }

    pub fn keys_created(&self) -> Vec<String> {
        self.state.lock().unwrap().keys.clone()
    }

    pub fn grants(&self) -> Vec<(String, String, String)> {
        self.state.lock().unwrap().grants.clone()
    }

    pub fn provider_condition(&self, name: &str) -> Option<String> {
        self.state.lock().unwrap().providers.get(name).cloned()
    }

    pub fn add_instance(&self, instance: Instance) {
        self.state.lock().unwrap().instances.push(instance);
    }

    pub fn set_instance_state(&self, name: &str, state: InstanceState) {
        let mut cloud = self.state.lock().unwrap();
        for instance in cloud.instances.iter_mut().filter(|i| i.name == name) {
            instance.state = state;
        }
    }

    pub fn created_instances(&self) -> Vec<ConfidentialInstanceSpec> {
        self.state.lock().unwrap().created_instances.clone()
    }

    /// Creations that found their instance already present.
    pub fn duplicate_instance_creations(&self) -> usize {
        self.state.lock().unwrap().duplicate_instance_creations
    }

    pub fn deleted_instances(&self) -> Vec<String> {
        self.state.lock().unwrap().deleted_instances.clone()
    }

    pub fn fail_instance_creation(&self) {
        self.fail_instance_creation.store(true, Ordering::SeqCst);
    }

    pub fn fail_instance_deletion(&self) {
        self.fail_instance_deletion.store(true, Ordering::SeqCst);
    }

    fn stored(&self, path: &str) -> Result<Bytes> {
        self.object(path)
            .ok_or_else(|| Error::NotFound(format!("object {}", path)))
    }
}

#[async_trait]
impl CloudProvider for FakeCloud {
    fn name(&self) -> &'static str {
        "fake"
    }

    async fn download(&self, path: &str) -> Result<Bytes> {
        self.stored(path)
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .objects
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }

    async fn size(&self, path: &str) -> Result<u64> {
        Ok(self.stored(path)?.len() as u64)
    }

    async fn read_range(&self, path: &str, offset: u64, len: u64) -> Result<Bytes> {
        let data = self.stored(path)?;
        let start = (offset as usize).min(data.len());
        let end = start.saturating_add(len as usize).min(data.len());
        Ok(data.slice(start..end))
    }

    async fn delete(&self, path: &str) -> Result<()> {
        self.state.lock().unwrap().objects.remove(path);
        Ok(())
    }

    async fn upload(&self, path: &str, data: Bytes, compress: bool) -> Result<()> {
        self.state.lock().unwrap().objects.insert(
            path.to_string(),
            StoredObject {
                data,
                compressed: compress,
            },
        );
        Ok(())
    }

    async fn create_key(&self, key_id: &str) -> Result<()> {
        let mut cloud = self.state.lock().unwrap();
        if cloud.keys.iter().any(|k| k == key_id) {
            return Err(Error::upstream("create key", "already exists"));
        }
        cloud.keys.push(key_id.to_string());
        Ok(())
    }

    async fn key_exists(&self, key_id: &str) -> Result<bool> {
        Ok(self.state.lock().unwrap().keys.iter().any(|k| k == key_id))
    }

    async fn encrypt(&self, key_id: &str, plaintext: &[u8]) -> Result<String> {
        if !self.key_exists(key_id).await? {
            return Err(Error::NotFound(format!("key {}", key_id)));
        }
        Ok(STANDARD.encode(plaintext))
    }

    async fn decrypt(&self, key_id: &str, ciphertext_b64: &str) -> Result<Vec<u8>> {
        if !self.key_exists(key_id).await? {
            return Err(Error::NotFound(format!("key {}", key_id)));
        }
        STANDARD
            .decode(ciphertext_b64)
            .map_err(|e| Error::InvalidInput(e.to_string()))
    }

    async fn grant_key_role(&self, service_account: &str, key_id: &str, role: &str) -> Result<()> {
        let mut cloud = self.state.lock().unwrap();
        let grant = (
            service_account.to_string(),
            key_id.to_string(),
            role.to_string(),
        );
        if !cloud.grants.contains(&grant) {
            cloud.grants.push(grant);
        }
        Ok(())
    }

    async fn create_identity_provider(&self, name: &str, attribute_condition: &str) -> Result<()> {
        self.state
            .lock()
            .unwrap()
            .providers
            .entry(name.to_string())
            .or_insert_with(|| attribute_condition.to_string());
        Ok(())
    }

    async fn update_identity_provider(&self, name: &str, attribute_condition: &str) -> Result<()> {
        let mut cloud = self.state.lock().unwrap();
        let condition = cloud
            .providers
            .get_mut(name)
            .ok_or_else(|| Error::NotFound(format!("identity provider {}", name)))?;
        *condition = attribute_condition.to_string();
        Ok(())
    }

    async fn service_account_email(&self) -> Result<Option<String>> {
        Ok(self.service_account.clone())
    }

    async fn list_instances(&self) -> Result<Vec<Instance>> {
        Ok(self.state.lock().unwrap().instances.clone())
    }

    async fn delete_instance(&self, name: &str) -> Result<()> {
        if self.fail_instance_deletion.load(Ordering::SeqCst) {
            return Err(Error::upstream("delete instance", "operation timed out"));
        }
        let mut cloud = self.state.lock().unwrap();
        cloud.instances.retain(|i| i.name != name);
        cloud.deleted_instances.push(name.to_string());
        Ok(())
    }

    async fn create_confidential_instance(&self, spec: &ConfidentialInstanceSpec) -> Result<()> {
        if self.fail_instance_creation.load(Ordering::SeqCst) {
            return Err(Error::upstream("create instance", "quota exceeded"));
        }
        let mut cloud = self.state.lock().unwrap();
        if cloud.instances.iter().any(|i| i.name == spec.name) {
            cloud.duplicate_instance_creations += 1;
            return Ok(());
        }
        cloud.created_instances.push(spec.clone());
        cloud.instances.push(Instance {
            name: spec.name.clone(),
            state: InstanceState::Running,
            uuid: Some(spec.uuid.clone()),
            creator: Some(spec.creator.clone()),
            user_token: Some(spec.user_token.clone()),
            created_at: Utc::now(),
        });
        Ok(())
    }
}

#[derive(Default)]
struct RunnerState {
    jobs: Vec<BuildJob>,
    created: Vec<BuildJobSpec>,
    logs: HashMap<String, Vec<String>>,
    deleted: Vec<String>,
}

/// [`JobRunner`] whose jobs only change state when a test says so.
#[derive(Default)]
pub struct FakeRunner {
    state: Mutex<RunnerState>,
    fail_listing: AtomicBool,
}

impl FakeRunner {
    pub fn add_job(&self, job: BuildJob) {
        self.state.lock().unwrap().jobs.push(job);
    }

    pub fn set_state(&self, name: &str, state: BuildJobState) {
        let mut runner = self.state.lock().unwrap();
        for job in runner.jobs.iter_mut().filter(|j| j.name == name) {
            job.state = state;
        }
    }

    pub fn set_logs(&self, name: &str, logs: Vec<String>) {
        self.state.lock().unwrap().logs.insert(name.to_string(), logs);
    }

    pub fn created(&self) -> Vec<BuildJobSpec> {
        self.state.lock().unwrap().created.clone()
    }

    pub fn deleted(&self) -> Vec<String> {
        self.state.lock().unwrap().deleted.clone()
    }

    pub fn job_names(&self) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .jobs
            .iter()
            .map(|j| j.name.clone())
            .collect()
    }

    pub fn fail_listing(&self) {
        self.fail_listing.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl JobRunner for FakeRunner {
    fn name(&self) -> &'static str {
        "fake"
    }

    async fn create(&self, spec: BuildJobSpec) -> Result<()> {
        let mut runner = self.state.lock().unwrap();
        if runner.jobs.iter().any(|j| j.name == spec.name) {
            return Err(Error::upstream("create build job", "already exists"));
        }
        runner.jobs.push(BuildJob {
            name: spec.name.clone(),
            annotations: spec.annotations.clone(),
            state: BuildJobState::Running,
        });
        runner.created.push(spec);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<BuildJob>> {
        if self.fail_listing.load(Ordering::SeqCst) {
            return Err(Error::upstream("list build jobs", "connection refused"));
        }
        Ok(self.state.lock().unwrap().jobs.clone())
    }

    async fn delete(&self, name: &str) -> Result<()> {
        let mut runner = self.state.lock().unwrap();
        let before = runner.jobs.len();
        runner.jobs.retain(|j| j.name != name);
        if runner.jobs.len() != before {
            runner.deleted.push(name.to_string());
        }
        Ok(())
    }

    async fn pod_logs(&self, job_name: &str) -> Result<Vec<String>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .logs
            .get(job_name)
            .cloned()
            .unwrap_or_default())
    }
}

/// Records every transition it is handed.
#[derive(Default)]
pub struct RecordingCallback {
    sent: Mutex<Vec<(UpdateJobRequest, String)>>,
    fail: bool,
    missing_job: bool,
}

impl RecordingCallback {
    /// A callback that refuses everything, as an unreachable API would.
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    /// A callback answering as the API does for a deleted job.
    pub fn missing_job() -> Self {
        Self {
            missing_job: true,
            ..Self::default()
        }
    }

    pub fn sent(&self) -> Vec<(UpdateJobRequest, String)> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl StatusCallback for RecordingCallback {
    async fn send(&self, request: &UpdateJobRequest, token: &str) -> Result<()> {
        if self.fail {
            return Err(Error::upstream("send status update", "503 Service Unavailable"));
        }
        if self.missing_job {
            return Err(Error::NotFound(format!("job {}", request.uuid)));
        }
        self.sent
            .lock()
            .unwrap()
            .push((request.clone(), token.to_string()));
        Ok(())
    }
}

/// Delivers transitions straight to a [`JobService`], standing in for the HTTP hop.
pub struct ServiceCallback {
    service: Arc<JobService>,
}

impl ServiceCallback {
    pub fn new(service: Arc<JobService>) -> Self {
        Self { service }
    }
}

#[async_trait]
impl StatusCallback for ServiceCallback {
    async fn send(&self, request: &UpdateJobRequest, token: &str) -> Result<()> {
        self.service.update(request, token).await.map(|_| ())
    }
}

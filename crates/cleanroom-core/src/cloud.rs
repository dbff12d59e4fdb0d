//! Cloud capability: object storage, KMS, workload identity and compute.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use derive_more::Display;
use serde::{Deserialize, Serialize};

use crate::Result;

/// Instance metadata key carrying the job uuid.
pub const LABEL_JOB_UUID: &str = "JOB-UUID";
/// Instance metadata key carrying the job creator.
pub const LABEL_JOB_CREATOR: &str = "JOB-CREATOR";
/// Instance metadata key carrying the user's token into the workload.
pub const LABEL_USER_TOKEN: &str = "tee-env-USER_TOKEN";

/// Lifecycle state of a compute instance, as far as reconciliation cares.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
pub enum InstanceState {
    #[display("running")]
    Running,
    #[display("terminated")]
    Terminated,
    #[display("other")]
    Other,
}

impl InstanceState {
    pub fn from_provider(status: &str) -> Self {
        match status {
            "RUNNING" => InstanceState::Running,
            "TERMINATED" => InstanceState::Terminated,
            _ => InstanceState::Other,
        }
    }
}

/// A compute instance as listed by the provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Instance {
    pub name: String,
    pub state: InstanceState,
    /// Job uuid label; instances without one were not created for a job.
    pub uuid: Option<String>,
    pub creator: Option<String>,
    pub user_token: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Everything needed to boot one job's confidential instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfidentialInstanceSpec {
    pub name: String,
    /// Image reference the confidential launcher pulls and measures.
    pub image: String,
    pub uuid: String,
    pub creator: String,
    pub user_token: String,
}

/// Trait for cloud providers.
///
/// Implementations must be safe for concurrent use; deleting something that
/// is already gone succeeds.
#[async_trait]
pub trait CloudProvider: Send + Sync {
    /// Name of this provider.
    fn name(&self) -> &'static str;

    // Object storage

    /// Download a whole object.
    async fn download(&self, path: &str) -> Result<Bytes>;

    /// List object names below a directory prefix.
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;

    /// Size of an object in bytes.
    async fn size(&self, path: &str) -> Result<u64>;

    /// Read at most `len` bytes starting at `offset`. Reading past the end
    /// yields fewer bytes, or none.
    async fn read_range(&self, path: &str, offset: u64, len: u64) -> Result<Bytes>;

    /// Delete an object.
    async fn delete(&self, path: &str) -> Result<()>;

    /// Upload an object, overwriting any previous version. With `compress`
    /// the data is gzip-encoded first.
    async fn upload(&self, path: &str, data: Bytes, compress: bool) -> Result<()>;

    // KMS

    async fn create_key(&self, key_id: &str) -> Result<()>;

    async fn key_exists(&self, key_id: &str) -> Result<bool>;

    /// Encrypt with a key, returning base64 ciphertext.
    async fn encrypt(&self, key_id: &str, plaintext: &[u8]) -> Result<String>;

    /// Decrypt base64 ciphertext with a key.
    async fn decrypt(&self, key_id: &str, ciphertext_b64: &str) -> Result<Vec<u8>>;

    /// Bind `role` on a key to a service account. Granting an existing
    /// binding again changes nothing.
    async fn grant_key_role(&self, service_account: &str, key_id: &str, role: &str)
    -> Result<()>;

    // Workload identity

    /// Create a workload identity pool provider. Creating one that already
    /// exists succeeds and leaves it untouched.
    async fn create_identity_provider(&self, name: &str, attribute_condition: &str)
    -> Result<()>;

    /// Replace the attribute condition of an existing provider.
    async fn update_identity_provider(&self, name: &str, attribute_condition: &str)
    -> Result<()>;

    // Compute

    /// Email of the identity this process runs as, if one is discoverable.
    async fn service_account_email(&self) -> Result<Option<String>>;

    async fn list_instances(&self) -> Result<Vec<Instance>>;

    async fn delete_instance(&self, name: &str) -> Result<()>;

    /// Boot a job's instance. Creating one that already exists succeeds and
    /// leaves it untouched.
    async fn create_confidential_instance(&self, spec: &ConfidentialInstanceSpec) -> Result<()>;
}

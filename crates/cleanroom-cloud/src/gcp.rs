//! Google Cloud provider.
//!
//! Object storage goes through `object_store`'s GCS client. KMS, workload
//! identity pools and Compute Engine are reached over REST with a `reqwest`
//! client and a bearer token from [`TokenSource`].

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use cleanroom_config::CloudConfig;
use cleanroom_core::cloud::{
    CloudProvider, ConfidentialInstanceSpec, Instance, InstanceState, LABEL_JOB_CREATOR,
    LABEL_JOB_UUID, LABEL_USER_TOKEN,
};
use cleanroom_core::{Error, Result};
use flate2::Compression;
use flate2::write::GzEncoder;
use futures::TryStreamExt;
use object_store::gcp::GoogleCloudStorageBuilder;
use object_store::path::Path as ObjectPath;
use object_store::{ClientOptions, ObjectStore};
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::token::TokenSource;

const KMS_API: &str = "https://cloudkms.googleapis.com/v1";
const IAM_API: &str = "https://iam.googleapis.com/v1";
const COMPUTE_API: &str = "https://compute.googleapis.com/compute/v1";

const CLOUD_PLATFORM_SCOPE: &str = "https://www.googleapis.com/auth/cloud-platform";
const INSTANCE_NETWORK_TAG: &str = "tee-instance";

/// Zonal operations are polled at most this many times.
const OPERATION_POLLS: usize = 30;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Deserialize)]
struct EncryptResponse {
    ciphertext: String,
}

#[derive(Debug, Deserialize)]
struct DecryptResponse {
    plaintext: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InstanceList {
    #[serde(default)]
    items: Vec<RawInstance>,
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawInstance {
    name: String,
    status: String,
    creation_timestamp: String,
    #[serde(default)]
    metadata: Option<RawMetadata>,
}

#[derive(Debug, Default, Deserialize)]
struct RawMetadata {
    #[serde(default)]
    items: Vec<RawMetadataItem>,
}

#[derive(Debug, Deserialize)]
struct RawMetadataItem {
    key: String,
    #[serde(default)]
    value: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Operation {
    name: String,
    status: String,
    #[serde(default)]
    error: Option<Value>,
}

/// Google Cloud implementation of [`CloudProvider`].
pub struct GcpProvider {
    client: reqwest::Client,
    tokens: TokenSource,
    store: Arc<dyn ObjectStore>,
    config: CloudConfig,
}

impl GcpProvider {
    /// Create a provider over the configured bucket.
    ///
    /// Credentials are discovered the way the Google SDKs do it:
    /// `GOOGLE_APPLICATION_CREDENTIALS` or the gcloud application default
    /// credentials, then the metadata server. `GOOGLE_OAUTH_ACCESS_TOKEN`
    /// overrides the token used outside of storage.
    pub fn new(config: CloudConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| Error::upstream("build http client", e))?;
        let gcs = GoogleCloudStorageBuilder::from_env()
            .with_bucket_name(&config.bucket)
            .with_client_options(ClientOptions::new().with_timeout(REQUEST_TIMEOUT))
            .build()
            .map_err(|e| Error::upstream("build storage client", e))?;
        let tokens = TokenSource::new(client.clone(), gcs.credentials().clone());
        Ok(Self::with_parts(client, tokens, Arc::new(gcs), config))
    }

    pub fn with_parts(
        client: reqwest::Client,
        tokens: TokenSource,
        store: Arc<dyn ObjectStore>,
        config: CloudConfig,
    ) -> Self {
        Self {
            client,
            tokens,
            store,
            config,
        }
    }

    async fn request(&self, method: Method, url: &str) -> Result<RequestBuilder> {
        let token = self.tokens.token().await?;
        Ok(self.client.request(method, url).bearer_auth(token))
    }

    fn zone_url(&self) -> String {
        format!(
            "{}/projects/{}/zones/{}",
            COMPUTE_API, self.config.project, self.config.zone
        )
    }

    fn providers_url(&self) -> String {
        format!(
            "{}/projects/{}/locations/global/workloadIdentityPools/{}/providers",
            IAM_API, self.config.project, self.config.workload_identity_pool
        )
    }

    /// Wait for a zonal operation to finish and surface its error, if any.
    async fn wait_operation(&self, op: Operation, action: &str) -> Result<()> {
        let mut op = op;
        for _ in 0..OPERATION_POLLS {
            if op.status == "DONE" {
                return match op.error {
                    Some(err) => Err(Error::upstream(action, err)),
                    None => Ok(()),
                };
            }
            let url = format!("{}/operations/{}/wait", self.zone_url(), op.name);
            let response = self.request(Method::POST, &url).await?.send().await;
            op = parse_json(response, action).await?;
        }
        Err(Error::upstream(
            action,
            format!("operation {} did not finish", op.name),
        ))
    }
}

/// Turn a transport failure or non-2xx status into an upstream error.
async fn checked(response: reqwest::Result<Response>, action: &str) -> Result<Response> {
    let response = response.map_err(|e| Error::upstream(action, e))?;
    if response.status().is_success() {
        return Ok(response);
    }
    let status = response.status();
    let text = response.text().await.unwrap_or_default();
    Err(Error::upstream(action, format!("{}: {}", status, text)))
}

async fn parse_json<T: serde::de::DeserializeOwned>(
    response: reqwest::Result<Response>,
    action: &str,
) -> Result<T> {
    checked(response, action)
        .await?
        .json()
        .await
        .map_err(|e| Error::upstream(action, e))
}

fn status_of(response: &reqwest::Result<Response>) -> Option<StatusCode> {
    response.as_ref().ok().map(|r| r.status())
}

fn object_path(path: &str) -> Result<ObjectPath> {
    ObjectPath::parse(path)
        .map_err(|e| Error::InvalidInput(format!("object path {}: {}", path, e)))
}

fn storage_error(action: &str, path: &str, err: object_store::Error) -> Error {
    match err {
        object_store::Error::NotFound { .. } => Error::NotFound(format!("object {}", path)),
        err => Error::upstream(action, err),
    }
}

/// Add `member` to the binding of `role`, creating it if needed. Returns
/// false when the member was already bound.
fn add_binding(policy: &mut Value, role: &str, member: &str) -> bool {
    if !policy["bindings"].is_array() {
        policy["bindings"] = json!([]);
    }
    let Some(bindings) = policy["bindings"].as_array_mut() else {
        return false;
    };

    let existing = bindings.iter_mut().find(|b| b["role"] == role);
    match existing {
        Some(binding) => {
            if !binding["members"].is_array() {
                binding["members"] = json!([]);
            }
            let Some(members) = binding["members"].as_array_mut() else {
                return false;
            };
            if members.iter().any(|m| m == member) {
                return false;
            }
            members.push(json!(member));
        }
        None => bindings.push(json!({ "role": role, "members": [member] })),
    }
    true
}

fn gzip(data: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(data)
        .map_err(|e| Error::Internal(format!("gzip: {}", e)))?;
    encoder
        .finish()
        .map_err(|e| Error::Internal(format!("gzip: {}", e)))
}

/// Request body of a workload identity pool provider.
pub fn identity_provider_body(config: &CloudConfig, name: &str, condition: &str) -> Value {
    json!({
        "displayName": name,
        "description": "",
        "attributeMapping": { "google.subject": "assertion.sub" },
        "attributeCondition": condition,
        "oidc": {
            "issuerUri": config.issuer_uri,
            "allowedAudiences": config.allowed_audiences,
        },
    })
}

/// Request body inserting a confidential instance.
pub fn confidential_instance_body(config: &CloudConfig, spec: &ConfidentialInstanceSpec) -> Value {
    let metadata = [
        ("tee-image-reference", spec.image.clone()),
        ("tee-container-log-redirect", config.debug.to_string()),
        (LABEL_USER_TOKEN, spec.user_token.clone()),
        ("tee-env-EXECUTION_STAGE", "2".to_string()),
        ("tee-env-DEPLOYMENT_ENV", config.env.clone()),
        ("tee-env-PROJECT_ID", config.project.clone()),
        ("tee-env-KEY_LOCATION", config.region.clone()),
        (LABEL_JOB_UUID, spec.uuid.clone()),
        (LABEL_JOB_CREATOR, spec.creator.clone()),
    ]
    .into_iter()
    .map(|(key, value)| json!({ "key": key, "value": value }))
    .collect::<Vec<_>>();

    json!({
        "name": spec.name,
        "machineType": config.machine_type(),
        "confidentialInstanceConfig": { "enableConfidentialCompute": true },
        "shieldedInstanceConfig": { "enableSecureBoot": true },
        "scheduling": { "onHostMaintenance": "TERMINATE" },
        "metadata": { "items": metadata },
        "tags": { "items": [INSTANCE_NETWORK_TAG] },
        "serviceAccounts": [{
            "email": config.cvm_service_account_email(),
            "scopes": [CLOUD_PLATFORM_SCOPE],
        }],
        "disks": [{
            "boot": true,
            "autoDelete": true,
            "diskSizeGb": config.disk_size_gb.to_string(),
            "initializeParams": { "sourceImage": config.instance_image() },
        }],
        "networkInterfaces": [{
            "network": config.network_url(),
            "subnetwork": config.subnetwork_url(),
            "accessConfigs": [{ "name": "external-nat", "type": "ONE_TO_ONE_NAT" }],
        }],
        "canIpForward": false,
    })
}

fn parse_instance(raw: RawInstance) -> Result<Instance> {
    let created_at = DateTime::parse_from_rfc3339(&raw.creation_timestamp)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| {
            Error::upstream(
                "parse instance",
                format!("{}: bad creation time: {}", raw.name, e),
            )
        })?;

    let mut labels: HashMap<String, String> = raw
        .metadata
        .unwrap_or_default()
        .items
        .into_iter()
        .filter_map(|item| item.value.map(|v| (item.key, v)))
        .collect();

    Ok(Instance {
        name: raw.name,
        state: InstanceState::from_provider(&raw.status),
        uuid: labels.remove(LABEL_JOB_UUID),
        creator: labels.remove(LABEL_JOB_CREATOR),
        user_token: labels.remove(LABEL_USER_TOKEN),
        created_at,
    })
}

#[async_trait]
impl CloudProvider for GcpProvider {
    fn name(&self) -> &'static str {
        "gcp"
    }

    async fn download(&self, path: &str) -> Result<Bytes> {
        let action = format!("download {}", path);
        let location = object_path(path)?;
        let object = self
            .store
            .get(&location)
            .await
            .map_err(|e| storage_error(&action, path, e))?;
        object
            .bytes()
            .await
            .map_err(|e| storage_error(&action, path, e))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let prefix = match prefix.trim_end_matches('/') {
            "" => None,
            p => Some(object_path(p)?),
        };
        self.store
            .list(prefix.as_ref())
            .map_ok(|meta| meta.location.to_string())
            .try_collect::<Vec<String>>()
            .await
            .map_err(|e| Error::upstream("list objects", e))
    }

    async fn size(&self, path: &str) -> Result<u64> {
        let meta = self
            .store
            .head(&object_path(path)?)
            .await
            .map_err(|e| storage_error(&format!("stat {}", path), path, e))?;
        Ok(meta.size)
    }

    async fn read_range(&self, path: &str, offset: u64, len: u64) -> Result<Bytes> {
        if len == 0 {
            return Ok(Bytes::new());
        }
        let end = offset.checked_add(len).ok_or_else(|| {
            Error::InvalidInput(format!("range {}+{} is out of bounds", offset, len))
        })?;

        let action = format!("read {}", path);
        let location = object_path(path)?;
        let size = self
            .store
            .head(&location)
            .await
            .map_err(|e| storage_error(&action, path, e))?
            .size;
        let end = end.min(size);
        if offset >= end {
            return Ok(Bytes::new());
        }
        self.store
            .get_range(&location, offset..end)
            .await
            .map_err(|e| storage_error(&action, path, e))
    }

    async fn delete(&self, path: &str) -> Result<()> {
        match self.store.delete(&object_path(path)?).await {
            Ok(()) => Ok(()),
            Err(object_store::Error::NotFound { .. }) => {
                debug!(path = %path, "Object already absent");
                Ok(())
            }
            Err(e) => Err(Error::upstream(format!("delete {}", path), e)),
        }
    }

    async fn upload(&self, path: &str, data: Bytes, compress: bool) -> Result<()> {
        let body = if compress {
            Bytes::from(gzip(&data)?)
        } else {
            data
        };
        let size = body.len();
        self.store
            .put(&object_path(path)?, body.into())
            .await
            .map_err(|e| Error::upstream(format!("upload {}", path), e))?;
        debug!(path = %path, size, compress, "Uploaded object");
        Ok(())
    }

    async fn create_key(&self, key_id: &str) -> Result<()> {
        let url = format!(
            "{}/{}/cryptoKeys?cryptoKeyId={}",
            KMS_API,
            self.config.key_ring_name(),
            urlencoding::encode(key_id)
        );
        let body = json!({
            "purpose": "ENCRYPT_DECRYPT",
            "versionTemplate": { "algorithm": "GOOGLE_SYMMETRIC_ENCRYPTION" },
        });
        let response = self
            .request(Method::POST, &url)
            .await?
            .json(&body)
            .send()
            .await;
        checked(response, &format!("create key {}", key_id)).await?;
        info!(key = %key_id, "Created KMS key");
        Ok(())
    }

    async fn key_exists(&self, key_id: &str) -> Result<bool> {
        let url = format!("{}/{}", KMS_API, self.config.key_name(key_id));
        let response = self.request(Method::GET, &url).await?.send().await;
        if status_of(&response) == Some(StatusCode::NOT_FOUND) {
            return Ok(false);
        }
        checked(response, &format!("look up key {}", key_id)).await?;
        Ok(true)
    }

    async fn encrypt(&self, key_id: &str, plaintext: &[u8]) -> Result<String> {
        let url = format!("{}/{}:encrypt", KMS_API, self.config.key_name(key_id));
        let response = self
            .request(Method::POST, &url)
            .await?
            .json(&json!({ "plaintext": STANDARD.encode(plaintext) }))
            .send()
            .await;
        let out: EncryptResponse =
            parse_json(response, &format!("encrypt with {}", key_id)).await?;
        Ok(out.ciphertext)
    }

    async fn decrypt(&self, key_id: &str, ciphertext_b64: &str) -> Result<Vec<u8>> {
        let action = format!("decrypt with {}", key_id);
        STANDARD
            .decode(ciphertext_b64)
            .map_err(|e| Error::InvalidInput(format!("ciphertext is not base64: {}", e)))?;
        let url = format!("{}/{}:decrypt", KMS_API, self.config.key_name(key_id));
        let response = self
            .request(Method::POST, &url)
            .await?
            .json(&json!({ "ciphertext": ciphertext_b64 }))
            .send()
            .await;
        let out: DecryptResponse = parse_json(response, &action).await?;
        STANDARD
            .decode(out.plaintext)
            .map_err(|e| Error::upstream(&action, e))
    }

    async fn grant_key_role(
        &self,
        service_account: &str,
        key_id: &str,
        role: &str,
    ) -> Result<()> {
        let action = format!("grant {} on {}", role, key_id);
        let key = self.config.key_name(key_id);

        let url = format!("{}/{}:getIamPolicy", KMS_API, key);
        let response = self.request(Method::GET, &url).await?.send().await;
        let mut policy: Value = parse_json(response, &action).await?;

        let member = format!("serviceAccount:{}", service_account);
        if !add_binding(&mut policy, role, &member) {
            debug!(key = %key_id, role = %role, member = %service_account, "Key role already granted");
            return Ok(());
        }

        let url = format!("{}/{}:setIamPolicy", KMS_API, key);
        let response = self
            .request(Method::POST, &url)
            .await?
            .json(&json!({ "policy": policy }))
            .send()
            .await;
        checked(response, &action).await?;
        info!(key = %key_id, role = %role, member = %service_account, "Granted key role");
        Ok(())
    }

    async fn create_identity_provider(
        &self,
        name: &str,
        attribute_condition: &str,
    ) -> Result<()> {
        let url = format!(
            "{}?workloadIdentityPoolProviderId={}",
            self.providers_url(),
            urlencoding::encode(name)
        );
        let body = identity_provider_body(&self.config, name, attribute_condition);
        let response = self
            .request(Method::POST, &url)
            .await?
            .json(&body)
            .send()
            .await;
        if status_of(&response) == Some(StatusCode::CONFLICT) {
            debug!(provider = %name, "Identity provider already exists");
            return Ok(());
        }
        checked(response, &format!("create identity provider {}", name)).await?;
        info!(provider = %name, "Created identity provider");
        Ok(())
    }

    async fn update_identity_provider(
        &self,
        name: &str,
        attribute_condition: &str,
    ) -> Result<()> {
        let url = format!(
            "{}/{}?updateMask=attributeCondition",
            self.providers_url(),
            urlencoding::encode(name)
        );
        let body = identity_provider_body(&self.config, name, attribute_condition);
        let response = self
            .request(Method::PATCH, &url)
            .await?
            .json(&body)
            .send()
            .await;
        checked(response, &format!("update identity provider {}", name)).await?;
        debug!(provider = %name, condition = %attribute_condition, "Updated identity provider");
        Ok(())
    }

    async fn service_account_email(&self) -> Result<Option<String>> {
        self.tokens.service_account_email().await
    }

    async fn list_instances(&self) -> Result<Vec<Instance>> {
        let mut instances = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let mut url = format!("{}/instances", self.zone_url());
            if let Some(token) = &page_token {
                url.push_str(&format!("?pageToken={}", urlencoding::encode(token)));
            }
            let response = self.request(Method::GET, &url).await?.send().await;
            let page: InstanceList = parse_json(response, "list instances").await?;
            for raw in page.items {
                match parse_instance(raw) {
                    Ok(instance) => instances.push(instance),
                    Err(e) => warn!(error = %e, "Skipping unparseable instance"),
                }
            }
            match page.next_page_token {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }
        Ok(instances)
    }

    async fn delete_instance(&self, name: &str) -> Result<()> {
        let action = format!("delete instance {}", name);
        let url = format!("{}/instances/{}", self.zone_url(), name);
        let response = self.request(Method::DELETE, &url).await?.send().await;
        if status_of(&response) == Some(StatusCode::NOT_FOUND) {
            debug!(instance = %name, "Instance already deleted");
            return Ok(());
        }
        let op: Operation = parse_json(response, &action).await?;
        self.wait_operation(op, &action).await?;
        info!(instance = %name, "Deleted instance");
        Ok(())
    }

    async fn create_confidential_instance(&self, spec: &ConfidentialInstanceSpec) -> Result<()> {
        let action = format!("create instance {}", spec.name);
        let url = format!("{}/instances", self.zone_url());
        let body = confidential_instance_body(&self.config, spec);
        let response = self
            .request(Method::POST, &url)
            .await?
            .json(&body)
            .send()
            .await;
        if status_of(&response) == Some(StatusCode::CONFLICT) {
            debug!(instance = %spec.name, "Instance already exists");
            return Ok(());
        }
        let op: Operation = parse_json(response, &action).await?;
        self.wait_operation(op, &action).await?;
        info!(instance = %spec.name, job_uuid = %spec.uuid, "Created confidential instance");
        Ok(())
    }
}

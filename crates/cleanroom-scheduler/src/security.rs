//! Per-creator key and identity provider lifecycle.
//!
//! Each creator owns one KMS key and one workload identity pool provider.
//! The provider is created unrestricted and narrowed to a single image digest
//! right before each of the creator's confidential instances boots.

use cleanroom_config::CloudConfig;
use cleanroom_core::cloud::CloudProvider;
use cleanroom_core::{Result, paths};
use std::sync::Arc;
use tracing::{debug, info};

/// Role that lets an identity encrypt with a key.
pub const KEY_ENCRYPTER_ROLE: &str = "roles/cloudkms.cryptoKeyEncrypter";

/// Build the attribute condition of a creator's identity provider.
///
/// With a digest, only a confidential instance running exactly that image
/// under the instance service account is trusted. Outside debug mode the
/// launcher image must also be a stable release.
pub fn attribute_condition(digest: Option<&str>, service_account: &str, debug: bool) -> String {
    let mut clauses = Vec::with_capacity(4);
    if let Some(digest) = digest {
        clauses.push(format!(
            "assertion.submods.container.image_digest == '{}'",
            digest
        ));
    }
    clauses.push(format!(
        "'{}' in assertion.google_service_accounts",
        service_account
    ));
    clauses.push("assertion.swname == 'CONFIDENTIAL_SPACE'".to_string());
    if !debug {
        clauses.push(
            "'STABLE' in assertion.submods.confidential_space.support_attributes".to_string(),
        );
    }
    clauses.join(" && ")
}

pub struct SecurityBinding {
    cloud: Arc<dyn CloudProvider>,
    config: CloudConfig,
}

impl SecurityBinding {
    pub fn new(cloud: Arc<dyn CloudProvider>, config: CloudConfig) -> Self {
        Self { cloud, config }
    }

    fn condition(&self, digest: Option<&str>) -> String {
        attribute_condition(
            digest,
            &self.config.cvm_service_account_email(),
            self.config.debug,
        )
    }

    /// Make sure the creator's key and identity provider exist.
    ///
    /// Safe to call on every submission. Nothing is rolled back on failure;
    /// whatever was created is reused by the next attempt.
    pub async fn prepare_creator(&self, creator: &str) -> Result<()> {
        let key_id = paths::key_id(creator);
        if self.cloud.key_exists(&key_id).await? {
            debug!(creator = %creator, key = %key_id, "Key already exists");
        } else {
            self.cloud.create_key(&key_id).await?;
            info!(creator = %creator, key = %key_id, "Created creator key");
        }

        if let Some(account) = self.cloud.service_account_email().await? {
            self.cloud
                .grant_key_role(&account, &key_id, KEY_ENCRYPTER_ROLE)
                .await?;
        }

        let provider = paths::provider_name(creator);
        self.cloud
            .create_identity_provider(&provider, &self.condition(None))
            .await?;
        debug!(creator = %creator, provider = %provider, "Identity provider ready");
        Ok(())
    }

    /// Restrict the creator's identity provider to a single image digest.
    pub async fn narrow_trust(&self, creator: &str, digest: &str) -> Result<()> {
        let provider = paths::provider_name(creator);
        self.cloud
            .update_identity_provider(&provider, &self.condition(Some(digest)))
            .await?;
        info!(creator = %creator, provider = %provider, digest = %digest, "Narrowed identity provider");
        Ok(())
    }
}

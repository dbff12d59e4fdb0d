//! Bearer tokens for the Google APIs that object storage does not cover.
//!
//! Tokens come from the same credential chain the storage client resolved
//! (service account key, application default credentials, then the metadata
//! server), so KMS, IAM and Compute calls run as the same identity.

use cleanroom_core::{Error, Result};
use object_store::CredentialProvider;
use object_store::gcp::GcpCredentialProvider;
use std::time::Duration;
use tracing::debug;

const METADATA_BASE: &str = "http://metadata.google.internal/computeMetadata/v1";

/// Environment variable holding a static token for use off-cloud.
pub const TOKEN_ENV: &str = "GOOGLE_OAUTH_ACCESS_TOKEN";

enum Credentials {
    Fixed(String),
    Chain(GcpCredentialProvider),
}

/// Source of bearer tokens for Google APIs.
pub struct TokenSource {
    client: reqwest::Client,
    credentials: Credentials,
}

impl TokenSource {
    /// Use the static token from the environment when set, else `chain`.
    pub fn new(client: reqwest::Client, chain: GcpCredentialProvider) -> Self {
        let credentials = match std::env::var(TOKEN_ENV).ok().filter(|t| !t.is_empty()) {
            Some(token) => Credentials::Fixed(token),
            None => Credentials::Chain(chain),
        };
        Self {
            client,
            credentials,
        }
    }

    pub fn fixed(client: reqwest::Client, token: impl Into<String>) -> Self {
        Self {
            client,
            credentials: Credentials::Fixed(token.into()),
        }
    }

    /// Current access token. The chain caches and refreshes tokens itself.
    pub async fn token(&self) -> Result<String> {
        match &self.credentials {
            Credentials::Fixed(token) => Ok(token.clone()),
            Credentials::Chain(chain) => chain
                .get_credential()
                .await
                .map(|credential| credential.bearer.clone())
                .map_err(|e| Error::upstream("fetch access token", e)),
        }
    }

    /// Email of the default service account, or `None` when not running on
    /// a cloud VM.
    pub async fn service_account_email(&self) -> Result<Option<String>> {
        let response = match self
            .client
            .get(format!(
                "{}/instance/service-accounts/default/email",
                METADATA_BASE
            ))
            .header("Metadata-Flavor", "Google")
            .timeout(Duration::from_secs(2))
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) if e.is_connect() || e.is_timeout() => {
                debug!(error = %e, "Metadata server unreachable");
                return Ok(None);
            }
            Err(e) => return Err(Error::upstream("fetch service account email", e)),
        };

        if !response.status().is_success() {
            return Ok(None);
        }

        let email = response
            .text()
            .await
            .map_err(|e| Error::upstream("read service account email", e))?;
        let email = email.trim();
        Ok((!email.is_empty()).then(|| email.to_string()))
    }
}

//! Authenticated status callback from the monitor to the job service.

use async_trait::async_trait;
use cleanroom_core::{Error, Result, UpdateJobRequest, UpdateJobResponse};
use reqwest::StatusCode;
use tracing::debug;

/// Path of the update endpoint, relative to the API base URL.
pub const UPDATE_PATH: &str = "/api/v1/jobs/update";

/// Response code the API answers with when the job does not exist.
const NOT_FOUND_CODE: i32 = 10003;

/// Sink for status transitions observed by the monitor.
#[async_trait]
pub trait StatusCallback: Send + Sync {
    /// Forward one transition, authenticated with the job's bearer token.
    /// Fails with [`Error::NotFound`] when the job no longer exists.
    async fn send(&self, request: &UpdateJobRequest, token: &str) -> Result<()>;
}

/// Posts transitions to the API server's update endpoint.
pub struct HttpStatusCallback {
    client: reqwest::Client,
    url: String,
}

impl HttpStatusCallback {
    pub fn new(client: reqwest::Client, api_url: &str) -> Self {
        Self {
            client,
            url: format!("{}{}", api_url.trim_end_matches('/'), UPDATE_PATH),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl StatusCallback for HttpStatusCallback {
    async fn send(&self, request: &UpdateJobRequest, token: &str) -> Result<()> {
        let response = self
            .client
            .post(&self.url)
            .header(reqwest::header::AUTHORIZATION, token)
            .json(request)
            .send()
            .await
            .map_err(|e| Error::upstream("send status update", e))?;

        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        interpret(status, &text)?;

        debug!(job_uuid = %request.uuid, status = %request.status, "Status update accepted");
        Ok(())
    }
}

/// Error responses carry the same `{code, msg}` envelope as successes.
fn interpret(status: StatusCode, text: &str) -> Result<()> {
    match serde_json::from_str::<UpdateJobResponse>(text) {
        Ok(body) if body.code != 0 || status == StatusCode::OK => check_response(body),
        Ok(_) => Err(Error::upstream(
            "send status update",
            format!("{}: {}", status, text),
        )),
        Err(e) if status == StatusCode::OK => {
            Err(Error::upstream("parse status update response", e))
        }
        Err(_) => Err(Error::upstream(
            "send status update",
            format!("{}: {}", status, text),
        )),
    }
}

fn check_response(body: UpdateJobResponse) -> Result<()> {
    match body.code {
        0 => Ok(()),
        NOT_FOUND_CODE => Err(Error::NotFound(body.msg)),
        code => Err(Error::upstream(
            "send status update",
            format!("code {}: {}", code, body.msg),
        )),
    }
}

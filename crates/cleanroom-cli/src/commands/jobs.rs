//! Job commands against the API server.

use anyhow::{Context, Result, bail};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use reqwest::multipart::{Form, Part};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use std::path::{Path, PathBuf};
use url::Url;

/// Bytes requested per download round trip.
const DOWNLOAD_CHUNK: u64 = 1024 * 1024;

/// Upper bound on the buffer reserved up front for a download.
const DOWNLOAD_PREALLOCATE_MAX: u64 = 64 * DOWNLOAD_CHUNK;

fn download_capacity(reported_size: u64) -> usize {
    usize::try_from(reported_size.min(DOWNLOAD_PREALLOCATE_MAX)).unwrap_or(0)
}

pub struct ApiClient {
    client: reqwest::Client,
    base: Url,
    token: Option<String>,
}

impl ApiClient {
    pub fn new(base: &Url, token: Option<String>) -> Result<Self> {
        Ok(Self {
            client: reqwest::Client::new(),
            base: base.join("api/v1/jobs/")?,
            token,
        })
    }

    /// Endpoint under the jobs collection; the empty path is the collection itself.
    fn url(&self, path: &str) -> Result<Url> {
        if path.is_empty() {
            return Ok(self.base.join("../jobs")?);
        }
        Ok(self.base.join(path)?)
    }

    fn authorized(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => request.header(reqwest::header::AUTHORIZATION, token),
            None => request,
        }
    }

    async fn call<T: DeserializeOwned>(&self, request: reqwest::RequestBuilder) -> Result<T> {
        let response = self
            .authorized(request)
            .send()
            .await
            .context("Failed to reach the API server")?;
        let status = response.status();
        let body: Value = response
            .json()
            .await
            .with_context(|| format!("Unreadable response ({})", status))?;
        unwrap_envelope(body)
    }
}

/// Payload of a `{code, msg, ...}` response, or the server's message as an error.
fn unwrap_envelope<T: DeserializeOwned>(body: Value) -> Result<T> {
    let code = body.get("code").and_then(Value::as_i64).unwrap_or(-1);
    if code != 0 {
        let msg = body
            .get("msg")
            .and_then(Value::as_str)
            .unwrap_or("unknown error");
        bail!("API error {}: {}", code, msg);
    }
    Ok(serde_json::from_value(body)?)
}

#[derive(Debug, Deserialize)]
struct SubmitResponse {
    uuid: String,
}

#[derive(Debug, Deserialize)]
struct JobSummary {
    id: i64,
    uuid: String,
    notebook_name: String,
    status: i32,
    created_at: String,
}

#[derive(Debug, Deserialize)]
struct ListResponse {
    jobs: Vec<JobSummary>,
    total: i64,
}

#[derive(Debug, Deserialize)]
struct AttestationResponse {
    attestation_report: String,
}

#[derive(Debug, Deserialize)]
struct OutputAttrs {
    filename: String,
    size: u64,
}

#[derive(Debug, Deserialize)]
struct ChunkResponse {
    content: String,
}

fn status_name(code: i32) -> String {
    cleanroom_core::JobStatus::from_code(code)
        .map(|s| s.to_string())
        .unwrap_or_else(|| format!("unknown({})", code))
}

pub async fn list(client: &ApiClient, creator: &str, page: i64, page_size: i64) -> Result<()> {
    let request = client
        .client
        .get(client.url("")?)
        .query(&[
            ("creator", creator.to_string()),
            ("page", page.to_string()),
            ("page_size", page_size.to_string()),
        ]);
    let response: ListResponse = client.call(request).await?;

    println!("{} job(s) total", response.total);
    for job in response.jobs {
        println!(
            "{:>6}  {}  {:<22} {}  {}",
            job.id,
            job.uuid,
            status_name(job.status),
            job.notebook_name,
            job.created_at
        );
    }
    Ok(())
}

pub async fn submit(
    client: &ApiClient,
    creator: &str,
    notebook: &str,
    workspace: &Path,
) -> Result<()> {
    let data = tokio::fs::read(workspace)
        .await
        .with_context(|| format!("Failed to read workspace: {}", workspace.display()))?;
    let file_name = workspace
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "workspace.tar.gz".to_string());

    let form = Form::new()
        .text("creator", creator.to_string())
        .text("filename", notebook.to_string())
        .part("file", Part::bytes(data).file_name(file_name));
    let request = client.client.post(client.url("")?).multipart(form);
    let response: SubmitResponse = client.call(request).await?;

    println!("Submitted job {}", response.uuid);
    Ok(())
}

pub async fn attestation(client: &ApiClient, creator: &str, id: i64) -> Result<()> {
    let request = client
        .client
        .get(client.url(&format!("{}/attestation", id))?)
        .query(&[("creator", creator)]);
    let response: AttestationResponse = client.call(request).await?;
    println!("{}", response.attestation_report);
    Ok(())
}

pub async fn download(
    client: &ApiClient,
    creator: &str,
    id: i64,
    output: Option<PathBuf>,
) -> Result<()> {
    let request = client
        .client
        .get(client.url(&format!("{}/output/attrs", id))?)
        .query(&[("creator", creator)]);
    let attrs: OutputAttrs = client.call(request).await?;

    let mut data = Vec::with_capacity(download_capacity(attrs.size));
    while (data.len() as u64) < attrs.size {
        let request = client
            .client
            .get(client.url(&format!("{}/output", id))?)
            .query(&[
                ("creator", creator.to_string()),
                ("offset", data.len().to_string()),
                ("chunk", DOWNLOAD_CHUNK.to_string()),
            ]);
        let chunk: ChunkResponse = client.call(request).await?;
        let bytes = STANDARD
            .decode(chunk.content)
            .context("Server returned malformed output chunk")?;
        if bytes.is_empty() {
            bail!(
                "Output ended after {} of {} bytes",
                data.len(),
                attrs.size
            );
        }
        data.extend_from_slice(&bytes);
    }

    let path = output.unwrap_or_else(|| PathBuf::from(&attrs.filename));
    tokio::fs::write(&path, &data)
        .await
        .with_context(|| format!("Failed to write {}", path.display()))?;
    println!("Wrote {} bytes to {}", data.len(), path.display());
    Ok(())
}

pub async fn delete(client: &ApiClient, creator: &str, uuid: &str) -> Result<()> {
    let request = client
        .client
        .delete(client.url(uuid)?)
        .query(&[("creator", creator)]);
    let _: Value = client.call(request).await?;
    println!("Deleted job {}", uuid);
    Ok(())
}

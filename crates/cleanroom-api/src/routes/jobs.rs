//! Job endpoints.

use axum::extract::{Multipart, Path, Query, State};
use axum::http::{HeaderMap, header};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::AppState;
use crate::error::{ApiError, codes};
use cleanroom_core::{Job, UpdateJobRequest};
use cleanroom_scheduler::OutputAttrs;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list_jobs).post(submit_job))
        .route("/update", post(update_job))
        .route("/{id}", axum::routing::delete(delete_job))
        .route("/{id}/output", get(download_output))
        .route("/{id}/output/attrs", get(output_attrs))
        .route("/{id}/attestation", get(attestation))
}

/// Successful response: `code` 0 plus the operation's fields.
#[derive(Debug, Serialize)]
struct Envelope<T: Serialize> {
    code: i32,
    msg: &'static str,
    #[serde(flatten)]
    data: T,
}

fn ok<T: Serialize>(data: T) -> Json<Envelope<T>> {
    Json(Envelope {
        code: codes::SUCCESS,
        msg: "success",
        data,
    })
}

#[derive(Debug, Serialize)]
struct Empty {}

/// Bearer token from the `Authorization` header, with or without the
/// `Bearer ` scheme.
fn access_token(headers: &HeaderMap) -> Result<String, ApiError> {
    let value = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .trim();
    let token = value.strip_prefix("Bearer ").unwrap_or(value).trim();
    if token.is_empty() {
        return Err(ApiError::unauthorized("missing Authorization header"));
    }
    Ok(token.to_string())
}

#[derive(Debug, Serialize)]
struct SubmitResponse {
    uuid: String,
}

async fn submit_job(
    State(state): State<AppState>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> Result<Json<Envelope<SubmitResponse>>, ApiError> {
    let token = access_token(&headers)?;

    let mut creator = None;
    let mut notebook = None;
    let mut workspace = None;
    while let Some(field) = multipart.next_field().await? {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "creator" => creator = Some(field.text().await?),
            "filename" => notebook = Some(field.text().await?),
            "file" => workspace = Some(field.bytes().await?),
            _ => {}
        }
    }

    let creator = creator.ok_or_else(|| ApiError::bad_request("missing field 'creator'"))?;
    let notebook = notebook.ok_or_else(|| ApiError::bad_request("missing field 'filename'"))?;
    let workspace = workspace.ok_or_else(|| ApiError::bad_request("missing field 'file'"))?;

    let uuid = state
        .jobs
        .submit(&creator, &notebook, workspace, &token)
        .await?;

    Ok(ok(SubmitResponse { uuid }))
}

fn default_page() -> i64 {
    1
}

fn default_page_size() -> i64 {
    10
}

#[derive(Debug, Deserialize)]
struct ListJobsQuery {
    creator: String,
    #[serde(default = "default_page")]
    page: i64,
    #[serde(default = "default_page_size")]
    page_size: i64,
}

#[derive(Debug, Serialize)]
struct JobResponse {
    id: i64,
    uuid: String,
    creator: String,
    notebook_name: String,
    status: i32,
    docker_image: String,
    docker_image_digest: String,
    instance_name: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<Job> for JobResponse {
    fn from(job: Job) -> Self {
        Self {
            id: job.id,
            uuid: job.uuid,
            creator: job.creator,
            notebook_name: job.notebook_name,
            status: job.status.code(),
            docker_image: job.docker_image,
            docker_image_digest: job.docker_image_digest,
            instance_name: job.instance_name,
            created_at: job.created_at,
            updated_at: job.updated_at,
        }
    }
}

#[derive(Debug, Serialize)]
struct ListJobsResponse {
    jobs: Vec<JobResponse>,
    total: i64,
}

async fn list_jobs(
    State(state): State<AppState>,
    Query(query): Query<ListJobsQuery>,
) -> Result<Json<Envelope<ListJobsResponse>>, ApiError> {
    let page = state
        .jobs
        .query(&query.creator, query.page, query.page_size)
        .await?;

    Ok(ok(ListJobsResponse {
        jobs: page.jobs.into_iter().map(JobResponse::from).collect(),
        total: page.total,
    }))
}

#[derive(Debug, Deserialize)]
struct CreatorQuery {
    creator: String,
}

async fn output_attrs(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Query(query): Query<CreatorQuery>,
) -> Result<Json<Envelope<OutputAttrs>>, ApiError> {
    let attrs = state.jobs.output_attrs(&query.creator, id).await?;
    Ok(ok(attrs))
}

#[derive(Debug, Deserialize)]
struct DownloadQuery {
    creator: String,
    #[serde(default)]
    offset: u64,
    chunk: u64,
}

#[derive(Debug, Serialize)]
struct DownloadResponse {
    content: String,
}

async fn download_output(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Query(query): Query<DownloadQuery>,
) -> Result<Json<Envelope<DownloadResponse>>, ApiError> {
    let content = state
        .jobs
        .download_output(&query.creator, id, query.offset, query.chunk)
        .await?;
    Ok(ok(DownloadResponse { content }))
}

async fn delete_job(
    State(state): State<AppState>,
    Path(uuid): Path<String>,
    Query(query): Query<CreatorQuery>,
) -> Result<Json<Envelope<Empty>>, ApiError> {
    state.jobs.delete(&query.creator, &uuid).await?;
    Ok(ok(Empty {}))
}

#[derive(Debug, Serialize)]
struct AttestationResponse {
    attestation_report: String,
}

async fn attestation(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Query(query): Query<CreatorQuery>,
) -> Result<Json<Envelope<AttestationResponse>>, ApiError> {
    let attestation_report = state.jobs.attestation_report(&query.creator, id).await?;
    Ok(ok(AttestationResponse { attestation_report }))
}

async fn update_job(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<UpdateJobRequest>,
) -> Result<Json<Envelope<Empty>>, ApiError> {
    let token = access_token(&headers)?;
    state.jobs.update(&request, &token).await?;
    Ok(ok(Empty {}))
}

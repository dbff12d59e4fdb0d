//! Job repository.
//!
//! Every query is scoped by creator. A job owned by someone else is reported
//! as not found, exactly as a job that does not exist.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cleanroom_core::{Job, JobStatus, NewJob};
use sqlx::PgPool;

use crate::{DbError, DbResult};

/// Database row for jobs.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct JobRow {
    pub id: i64,
    pub uuid: String,
    pub creator: String,
    pub notebook_name: String,
    pub docker_image: String,
    pub docker_image_digest: String,
    pub attestation_report: String,
    pub job_status: i32,
    pub instance_name: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<JobRow> for Job {
    type Error = DbError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        let status = JobStatus::try_from(row.job_status)
            .map_err(|e| DbError::Corrupt(format!("job {}: {}", row.id, e)))?;

        Ok(Job {
            id: row.id,
            uuid: row.uuid,
            creator: row.creator,
            notebook_name: row.notebook_name,
            docker_image: row.docker_image,
            docker_image_digest: row.docker_image_digest,
            attestation_report: row.attestation_report,
            status,
            instance_name: row.instance_name,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

/// One page of a creator's jobs plus the creator's total job count.
#[derive(Debug, Clone)]
pub struct JobPage {
    pub jobs: Vec<Job>,
    pub total: i64,
}

#[async_trait]
pub trait JobRepo: Send + Sync {
    /// Insert a job; both timestamps are set to now.
    async fn create(&self, job: NewJob) -> DbResult<Job>;

    /// Persist the mutable fields of `job`: status, image, digest,
    /// attestation report and instance name.
    async fn update(&self, job: &Job) -> DbResult<Job>;

    /// Page `page` (1-based) of a creator's jobs, newest first.
    async fn list_by_creator(&self, creator: &str, page: i64, page_size: i64)
    -> DbResult<JobPage>;

    async fn get_by_id_and_creator(&self, id: i64, creator: &str) -> DbResult<Job>;

    async fn get_by_uuid_and_creator(&self, uuid: &str, creator: &str) -> DbResult<Job>;

    /// Jobs counted against the creator's in-flight limit.
    async fn list_in_progress(&self, creator: &str) -> DbResult<Vec<Job>>;

    /// Delete a job. Deleting a missing job succeeds.
    async fn delete(&self, creator: &str, uuid: &str) -> DbResult<()>;
}

/// PostgreSQL implementation.
pub struct PgJobRepo {
    pool: PgPool,
}

impl PgJobRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn in_progress_codes() -> Vec<i32> {
    JobStatus::IN_PROGRESS.iter().map(|s| s.code()).collect()
}

#[async_trait]
impl JobRepo for PgJobRepo {
    async fn create(&self, job: NewJob) -> DbResult<Job> {
        let row = sqlx::query_as::<_, JobRow>(
            r#"
            INSERT INTO jobs (uuid, creator, notebook_name, job_status, created_at, updated_at)
            VALUES ($1, $2, $3, $4, NOW(), NOW())
            RETURNING *
            "#,
        )
        .bind(&job.uuid)
        .bind(&job.creator)
        .bind(&job.notebook_name)
        .bind(job.status.code())
        .fetch_one(&self.pool)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                DbError::Duplicate(format!("job {}", job.uuid))
            }
            other => DbError::Database(other),
        })?;

        row.try_into()
    }

    async fn update(&self, job: &Job) -> DbResult<Job> {
        let row = sqlx::query_as::<_, JobRow>(
            r#"
            UPDATE jobs SET
                job_status = $3,
                docker_image = $4,
                docker_image_digest = $5,
                attestation_report = $6,
                instance_name = $7,
                updated_at = NOW()
            WHERE id = $1 AND creator = $2
            RETURNING *
            "#,
        )
        .bind(job.id)
        .bind(&job.creator)
        .bind(job.status.code())
        .bind(&job.docker_image)
        .bind(&job.docker_image_digest)
        .bind(&job.attestation_report)
        .bind(&job.instance_name)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| DbError::NotFound(format!("job {}", job.uuid)))?;

        row.try_into()
    }

    async fn list_by_creator(
        &self,
        creator: &str,
        page: i64,
        page_size: i64,
    ) -> DbResult<JobPage> {
        let offset = (page.max(1) - 1) * page_size;

        let rows = sqlx::query_as::<_, JobRow>(
            "SELECT * FROM jobs WHERE creator = $1 ORDER BY id DESC LIMIT $2 OFFSET $3",
        )
        .bind(creator)
        .bind(page_size)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM jobs WHERE creator = $1")
            .bind(creator)
            .fetch_one(&self.pool)
            .await?;

        let jobs = rows
            .into_iter()
            .map(|r| r.try_into())
            .collect::<DbResult<Vec<Job>>>()?;

        Ok(JobPage { jobs, total })
    }

    async fn get_by_id_and_creator(&self, id: i64, creator: &str) -> DbResult<Job> {
        let row =
            sqlx::query_as::<_, JobRow>("SELECT * FROM jobs WHERE id = $1 AND creator = $2")
                .bind(id)
                .bind(creator)
                .fetch_optional(&self.pool)
                .await?
                .ok_or_else(|| DbError::NotFound(format!("job {}", id)))?;

        row.try_into()
    }

    async fn get_by_uuid_and_creator(&self, uuid: &str, creator: &str) -> DbResult<Job> {
        let row =
            sqlx::query_as::<_, JobRow>("SELECT * FROM jobs WHERE uuid = $1 AND creator = $2")
                .bind(uuid)
                .bind(creator)
                .fetch_optional(&self.pool)
                .await?
                .ok_or_else(|| DbError::NotFound(format!("job {}", uuid)))?;

        row.try_into()
    }

    async fn list_in_progress(&self, creator: &str) -> DbResult<Vec<Job>> {
        let rows = sqlx::query_as::<_, JobRow>(
            "SELECT * FROM jobs WHERE creator = $1 AND job_status = ANY($2) ORDER BY id",
        )
        .bind(creator)
        .bind(in_progress_codes())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(|r| r.try_into()).collect()
    }

    async fn delete(&self, creator: &str, uuid: &str) -> DbResult<()> {
        sqlx::query("DELETE FROM jobs WHERE creator = $1 AND uuid = $2")
            .bind(creator)
            .bind(uuid)
            .execute(&self.pool)
            .await?;

        Ok(())
    }
}

use chrono::{DateTime, Utc};
use common::api::{JobStatus, JobView, PolledJob};
use serde_json::Value;
use sqlx::FromRow;
use sqlx::types::Json;

use super::Db;
use crate::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "TEXT", rename_all = "lowercase")]
pub enum JobState {
    Queued,
    Running,
    Success,
    Failed,
}

impl From<JobState> for JobStatus {
    fn from(value: JobState) -> Self {
        match value {
            JobState::Queued => JobStatus::Queued,
            JobState::Running => JobStatus::Running,
            JobState::Success => JobStatus::Success,
            JobState::Failed => JobStatus::Failed,
        }
    }
}

impl From<JobStatus> for JobState {
    fn from(value: JobStatus) -> Self {
        match value {
            JobStatus::Queued => JobState::Queued,
            JobStatus::Running => JobState::Running,
            JobStatus::Success => JobState::Success,
            JobStatus::Failed => JobState::Failed,
        }
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct JobRecord {
    pub id: String,
    pub agent_id: String,
    pub job_type: String,
    #[sqlx(rename = "payload_json")]
    pub payload: Json<Value>,
    pub status: JobState,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub log_text: Option<String>,
    pub error_text: Option<String>,
    pub retry_count: i64,
    pub idempotency_key: Option<String>,
    #[sqlx(rename = "result_json")]
    pub result_payload: Option<Json<Value>>,
}

impl JobRecord {
    pub fn status(&self) -> JobStatus {
        self.status.into()
    }

    pub fn to_polled(&self) -> PolledJob {
        PolledJob {
            id: self.id.clone(),
            job_type: self.job_type.clone(),
            payload: self.payload.0.clone(),
            created_at: self.created_at,
        }
    }

    pub fn to_view(&self) -> JobView {
        JobView {
            id: self.id.clone(),
            agent_id: self.agent_id.clone(),
            job_type: self.job_type.clone(),
            payload: self.payload.0.clone(),
            status: self.status(),
            created_at: self.created_at,
            started_at: self.started_at,
            finished_at: self.finished_at,
            log_text: self.log_text.clone(),
            error_text: self.error_text.clone(),
            retry_count: self.retry_count,
            idempotency_key: self.idempotency_key.clone(),
            result_payload: self.result_payload.as_ref().map(|v| v.0.clone()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct NewJob {
    pub id: String,
    pub agent_id: String,
    pub job_type: String,
    pub payload: Value,
    pub idempotency_key: Option<String>,
    pub retry_count: i64,
    pub created_at: DateTime<Utc>,
}

/// Terminal report applied by [`finish_job`].
#[derive(Debug, Clone)]
pub struct JobCompletion {
    pub status: JobState,
    pub log_text: Option<String>,
    pub error_text: Option<String>,
    pub result_payload: Option<Value>,
    pub finished_at: DateTime<Utc>,
}

const JOB_COLUMNS: &str = r#"
    id, agent_id, job_type, payload_json, status, created_at, started_at,
    finished_at, log_text, error_text, retry_count, idempotency_key, result_json
"#;

pub async fn insert_job(pool: &Db, job: &NewJob) -> Result<JobRecord> {
    sqlx::query(
        r#"
        INSERT INTO agent_jobs (
            id, agent_id, job_type, payload_json, status, created_at,
            retry_count, idempotency_key
        )
        VALUES (?1, ?2, ?3, ?4, 'queued', ?5, ?6, ?7)
        "#,
    )
    .bind(&job.id)
    .bind(&job.agent_id)
    .bind(&job.job_type)
    .bind(Json(&job.payload))
    .bind(job.created_at)
    .bind(job.retry_count)
    .bind(&job.idempotency_key)
    .execute(pool)
    .await?;

    get_job(pool, &job.id)
        .await?
        .ok_or_else(|| anyhow::anyhow!("job insert did not return row"))
}

pub async fn get_job(pool: &Db, id: &str) -> Result<Option<JobRecord>> {
    let record = sqlx::query_as::<_, JobRecord>(&format!(
        "SELECT {JOB_COLUMNS} FROM agent_jobs WHERE id = ?1"
    ))
    .bind(id)
    .fetch_optional(pool)
    .await?;
    Ok(record)
}

/// Oldest-first queued jobs for one agent. Read only.
pub async fn list_queued_for_agent(pool: &Db, agent_id: &str, limit: u32) -> Result<Vec<JobRecord>> {
    let records = sqlx::query_as::<_, JobRecord>(&format!(
        r#"
        SELECT {JOB_COLUMNS}
        FROM agent_jobs
        WHERE agent_id = ?1 AND status = 'queued'
        ORDER BY created_at ASC, rowid ASC
        LIMIT ?2
        "#
    ))
    .bind(agent_id)
    .bind(i64::from(limit))
    .fetch_all(pool)
    .await?;
    Ok(records)
}

pub async fn list_jobs_for_agent(
    pool: &Db,
    agent_id: &str,
    status: Option<JobState>,
    limit: u32,
    offset: u32,
) -> Result<Vec<JobRecord>> {
    let records = sqlx::query_as::<_, JobRecord>(&format!(
        r#"
        SELECT {JOB_COLUMNS}
        FROM agent_jobs
        WHERE agent_id = ?1 AND (?2 IS NULL OR status = ?2)
        ORDER BY created_at DESC, rowid DESC
        LIMIT ?3 OFFSET ?4
        "#
    ))
    .bind(agent_id)
    .bind(status)
    .bind(i64::from(limit))
    .bind(i64::from(offset))
    .fetch_all(pool)
    .await?;
    Ok(records)
}

/// Most recent non-terminal job carrying `idempotency_key` for the agent.
pub async fn find_in_flight_by_idempotency_key(
    pool: &Db,
    agent_id: &str,
    idempotency_key: &str,
) -> Result<Option<JobRecord>> {
    let record = sqlx::query_as::<_, JobRecord>(&format!(
        r#"
        SELECT {JOB_COLUMNS}
        FROM agent_jobs
        WHERE agent_id = ?1
          AND idempotency_key = ?2
          AND status IN ('queued', 'running')
        ORDER BY created_at DESC, rowid DESC
        LIMIT 1
        "#
    ))
    .bind(agent_id)
    .bind(idempotency_key)
    .fetch_optional(pool)
    .await?;
    Ok(record)
}

/// Compare-and-set `queued -> running`.
///
/// Returns the updated row, or `None` when no queued job with that id
/// belongs to the agent.
pub async fn claim_job(
    pool: &Db,
    agent_id: &str,
    job_id: &str,
    started_at: DateTime<Utc>,
) -> Result<Option<JobRecord>> {
    let record = sqlx::query_as::<_, JobRecord>(&format!(
        r#"
        UPDATE agent_jobs
        SET status = 'running', started_at = ?3
        WHERE id = ?1 AND agent_id = ?2 AND status = 'queued'
        RETURNING {JOB_COLUMNS}
        "#
    ))
    .bind(job_id)
    .bind(agent_id)
    .bind(started_at)
    .fetch_optional(pool)
    .await?;
    Ok(record)
}

/// Compare-and-set `{queued, running} -> terminal`.
///
/// A job finished straight from `queued` gets `started_at` set to the finish
/// time. Returns `None` when the job is missing, owned by another agent, or
/// already terminal.
pub async fn finish_job(
    pool: &Db,
    agent_id: &str,
    job_id: &str,
    completion: &JobCompletion,
) -> Result<Option<JobRecord>> {
    debug_assert!(matches!(
        completion.status,
        JobState::Success | JobState::Failed
    ));
    let record = sqlx::query_as::<_, JobRecord>(&format!(
        r#"
        UPDATE agent_jobs
        SET status = ?3,
            started_at = COALESCE(started_at, ?4),
            finished_at = ?4,
            log_text = ?5,
            error_text = ?6,
            result_json = ?7
        WHERE id = ?1 AND agent_id = ?2 AND status IN ('queued', 'running')
        RETURNING {JOB_COLUMNS}
        "#
    ))
    .bind(job_id)
    .bind(agent_id)
    .bind(completion.status)
    .bind(completion.finished_at)
    .bind(&completion.log_text)
    .bind(&completion.error_text)
    .bind(completion.result_payload.as_ref().map(Json))
    .fetch_optional(pool)
    .await?;
    Ok(record)
}

/// Running jobs claimed before `started_before`, oldest first.
pub async fn list_stale_running(
    pool: &Db,
    started_before: DateTime<Utc>,
    limit: u32,
) -> Result<Vec<JobRecord>> {
    let records = sqlx::query_as::<_, JobRecord>(&format!(
        r#"
        SELECT {JOB_COLUMNS}
        FROM agent_jobs
        WHERE status = 'running' AND started_at < ?1
        ORDER BY started_at ASC
        LIMIT ?2
        "#
    ))
    .bind(started_before)
    .bind(i64::from(limit))
    .fetch_all(pool)
    .await?;
    Ok(records)
}

/// Fail a job only if it is still running and was claimed at `started_at`.
pub async fn fail_stale_job(
    pool: &Db,
    job_id: &str,
    started_at: DateTime<Utc>,
    error_text: &str,
    finished_at: DateTime<Utc>,
) -> Result<Option<JobRecord>> {
    let record = sqlx::query_as::<_, JobRecord>(&format!(
        r#"
        UPDATE agent_jobs
        SET status = 'failed', finished_at = ?3, error_text = ?4
        WHERE id = ?1 AND status = 'running' AND started_at = ?2
        RETURNING {JOB_COLUMNS}
        "#
    ))
    .bind(job_id)
    .bind(started_at)
    .bind(finished_at)
    .bind(error_text)
    .fetch_optional(pool)
    .await?;
    Ok(record)
}

pub async fn delete_terminal_jobs_before(pool: &Db, cutoff: DateTime<Utc>) -> Result<u64> {
    let result = sqlx::query(
        r#"
        DELETE FROM agent_jobs
        WHERE status IN ('success', 'failed') AND finished_at < ?1
        "#,
    )
    .bind(cutoff)
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}

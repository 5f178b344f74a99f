//! Pull-based agent job queue.
//!
//! Every state change is a conditional update in the database so concurrent
//! callers race on the row, never on in-memory state:
//!
//! ```text
//! queued --start--> running --finish--> success | failed
//!    \_____________finish_____________/
//! ```
//!
//! Terminal rows never change again. Re-finishing one is a no-op so agents
//! may retransmit; re-starting one is a conflict.

use std::time::Duration;

use chrono::{DateTime, Utc};
use common::api::JobStatus;
use metrics::counter;
use serde_json::Value;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::Result;
use crate::config::JobsConfig;
use crate::error::is_unique_violation;
use crate::persistence::jobs::{self as store, JobCompletion};
use crate::persistence::{self as db, Db, JobRecord, JobState, NewJob};
use crate::services::results::ResultApplierRegistry;

const REAPER_BATCH: u32 = 100;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum JobError {
    #[error("agent {0} not found")]
    AgentNotFound(String),
    #[error("job {0} not found")]
    NotFound(String),
    #[error("job {job_id} is {}", .status.as_str())]
    Conflict { job_id: String, status: JobStatus },
    #[error("job id {0} already exists")]
    DuplicateId(String),
    #[error("invalid job status {0:?}, expected success or failed")]
    InvalidStatus(String),
    #[error("job {job_id} failed: {error}")]
    RemoteFailure { job_id: String, error: String },
    #[error("job {job_id} did not finish within {waited_secs}s")]
    WaitTimedOut { job_id: String, waited_secs: u64 },
}

/// Work to enqueue for one agent.
#[derive(Debug, Clone)]
pub struct JobRequest {
    pub agent_id: String,
    pub job_type: String,
    pub payload: Value,
    /// Generated when absent.
    pub id: Option<String>,
    pub idempotency_key: Option<String>,
}

impl JobRequest {
    pub fn new(agent_id: impl Into<String>, job_type: impl Into<String>, payload: Value) -> Self {
        Self {
            agent_id: agent_id.into(),
            job_type: job_type.into(),
            payload,
            id: None,
            idempotency_key: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }
}

/// Result of [`JobQueue::dispatch_once`].
#[derive(Debug, Clone)]
pub struct Dispatched {
    pub job: JobRecord,
    /// False when an in-flight job with the same idempotency key was reused.
    pub created: bool,
}

/// Completion report from an agent, before validation.
#[derive(Debug, Clone, Default)]
pub struct FinishReport {
    pub status: String,
    pub log_text: Option<String>,
    pub error_text: Option<String>,
    pub result_payload: Option<Value>,
}

fn parse_terminal_status(raw: &str) -> std::result::Result<JobState, JobError> {
    match raw {
        "success" => Ok(JobState::Success),
        "failed" => Ok(JobState::Failed),
        other => Err(JobError::InvalidStatus(other.to_string())),
    }
}

#[derive(Debug, Clone)]
pub struct JobQueue {
    db: Db,
    appliers: ResultApplierRegistry,
    cfg: JobsConfig,
}

impl JobQueue {
    pub fn new(db: Db, appliers: ResultApplierRegistry, cfg: JobsConfig) -> Self {
        Self { db, appliers, cfg }
    }

    /// Persist a new queued job. Never deduplicates; see [`Self::dispatch_once`].
    pub async fn dispatch(&self, request: JobRequest) -> Result<JobRecord> {
        if db::agents::get_agent(&self.db, &request.agent_id)
            .await?
            .is_none()
        {
            return Err(JobError::AgentNotFound(request.agent_id).into());
        }
        self.insert(request, 0).await
    }

    /// Return the in-flight job carrying the request's idempotency key, or
    /// dispatch a new one. Requests without a key always dispatch.
    ///
    /// The lookup and insert are not atomic; two concurrent callers with the
    /// same key can both create a job.
    pub async fn dispatch_once(&self, request: JobRequest) -> Result<Dispatched> {
        if let Some(key) = request.idempotency_key.as_deref() {
            if let Some(existing) =
                store::find_in_flight_by_idempotency_key(&self.db, &request.agent_id, key).await?
            {
                debug!(
                    job_id = %existing.id,
                    agent_id = %existing.agent_id,
                    idempotency_key = key,
                    "reusing in-flight job"
                );
                return Ok(Dispatched {
                    job: existing,
                    created: false,
                });
            }
        }
        let job = self.dispatch(request).await?;
        Ok(Dispatched { job, created: true })
    }

    /// Dispatch and block until the job is terminal.
    ///
    /// A job the agent reports as failed comes back as
    /// [`JobError::RemoteFailure`] carrying the agent's error text.
    pub async fn dispatch_and_wait(&self, request: JobRequest) -> Result<JobRecord> {
        let job = self.dispatch(request).await?;
        let job = self.wait_for_terminal(&job.id).await?;
        if job.status == JobState::Failed {
            let error = job
                .error_text
                .clone()
                .filter(|e| !e.trim().is_empty())
                .unwrap_or_else(|| "agent reported failure without details".to_string());
            warn!(job_id = %job.id, job_type = %job.job_type, %error, "agent job failed");
            return Err(JobError::RemoteFailure {
                job_id: job.id,
                error,
            }
            .into());
        }
        Ok(job)
    }

    async fn wait_for_terminal(&self, job_id: &str) -> Result<JobRecord> {
        let timeout = Duration::from_secs(self.cfg.wait_timeout_secs);
        let mut interval =
            tokio::time::interval(Duration::from_millis(self.cfg.wait_poll_interval_ms));
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            interval.tick().await;
            let job = store::get_job(&self.db, job_id)
                .await?
                .ok_or_else(|| JobError::NotFound(job_id.to_string()))?;
            if job.status().is_terminal() {
                return Ok(job);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(JobError::WaitTimedOut {
                    job_id: job_id.to_string(),
                    waited_secs: self.cfg.wait_timeout_secs,
                }
                .into());
            }
        }
    }

    /// Re-dispatch a failed job under a new id with `retry_count + 1`.
    pub async fn retry(&self, job_id: &str) -> Result<JobRecord> {
        let original = self.get(job_id).await?;
        if original.status != JobState::Failed {
            return Err(JobError::Conflict {
                status: original.status(),
                job_id: original.id,
            }
            .into());
        }
        let request = JobRequest {
            agent_id: original.agent_id.clone(),
            job_type: original.job_type.clone(),
            payload: original.payload.0.clone(),
            id: None,
            idempotency_key: original.idempotency_key.clone(),
        };
        let job = self.insert(request, original.retry_count + 1).await?;
        info!(
            job_id = %job.id,
            retry_of = %original.id,
            retry_count = job.retry_count,
            "job retried"
        );
        Ok(job)
    }

    async fn insert(&self, request: JobRequest, retry_count: i64) -> Result<JobRecord> {
        let id = request
            .id
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let new_job = NewJob {
            id: id.clone(),
            agent_id: request.agent_id,
            job_type: request.job_type,
            payload: request.payload,
            idempotency_key: request.idempotency_key,
            retry_count,
            created_at: Utc::now(),
        };
        let job = store::insert_job(&self.db, &new_job).await.map_err(|err| {
            if is_unique_violation(&err) {
                JobError::DuplicateId(id.clone()).into()
            } else {
                err
            }
        })?;
        counter!("agent_jobs_dispatched_total", "type" => job.job_type.clone()).increment(1);
        info!(
            job_id = %job.id,
            agent_id = %job.agent_id,
            job_type = %job.job_type,
            "job dispatched"
        );
        Ok(job)
    }

    /// Queued jobs for the agent, oldest first. Has no side effects.
    pub async fn poll(&self, agent_id: &str, limit: Option<u32>) -> Result<Vec<JobRecord>> {
        let limit = match limit {
            Some(0) | None => self.cfg.poll_limit_default,
            Some(n) => n.min(self.cfg.poll_limit_max),
        };
        store::list_queued_for_agent(&self.db, agent_id, limit).await
    }

    /// Claim a queued job for the agent.
    pub async fn start(&self, agent_id: &str, job_id: &str) -> Result<JobRecord> {
        if let Some(job) = store::claim_job(&self.db, agent_id, job_id, Utc::now()).await? {
            counter!("agent_jobs_claimed_total").increment(1);
            info!(job_id, agent_id, job_type = %job.job_type, "job started");
            return Ok(job);
        }

        let current = self.owned_by(agent_id, job_id).await?;
        counter!("agent_jobs_claim_conflicts_total").increment(1);
        debug!(job_id, agent_id, status = current.status().as_str(), "job claim conflict");
        Err(JobError::Conflict {
            status: current.status(),
            job_id: current.id,
        }
        .into())
    }

    /// Record the agent's terminal report and run the result appliers.
    ///
    /// Finishing a job that is already terminal returns the stored row
    /// unchanged and does not run the appliers again.
    pub async fn finish(
        &self,
        agent_id: &str,
        job_id: &str,
        report: FinishReport,
    ) -> Result<JobRecord> {
        let status = parse_terminal_status(report.status.trim())?;
        let completion = JobCompletion {
            status,
            log_text: report.log_text,
            error_text: report.error_text,
            result_payload: report.result_payload,
            finished_at: Utc::now(),
        };

        let Some(job) = store::finish_job(&self.db, agent_id, job_id, &completion).await? else {
            let current = self.owned_by(agent_id, job_id).await?;
            if current.status().is_terminal() {
                debug!(
                    job_id,
                    agent_id,
                    status = current.status().as_str(),
                    "ignoring finish for terminal job"
                );
                return Ok(current);
            }
            // Lost a race with another transition; report what is stored now.
            return Err(JobError::Conflict {
                status: current.status(),
                job_id: current.id,
            }
            .into());
        };

        counter!("agent_jobs_finished_total", "status" => job.status().as_str()).increment(1);
        info!(
            job_id,
            agent_id,
            job_type = %job.job_type,
            status = job.status().as_str(),
            "job finished"
        );
        self.appliers.apply(&self.db, &job).await;
        Ok(job)
    }

    /// Fail running jobs claimed more than `running_timeout_secs` before `now`.
    pub async fn reap_stale(&self, now: DateTime<Utc>) -> Result<usize> {
        if self.cfg.running_timeout_secs == 0 {
            return Ok(0);
        }
        let timeout_secs = i64::try_from(self.cfg.running_timeout_secs).unwrap_or(i64::MAX);
        let cutoff = now - chrono::Duration::seconds(timeout_secs);
        let error_text = format!("timed out after {} seconds", self.cfg.running_timeout_secs);

        let mut reaped = 0;
        for stale in store::list_stale_running(&self.db, cutoff, REAPER_BATCH).await? {
            let Some(started_at) = stale.started_at else {
                continue;
            };
            let Some(job) =
                store::fail_stale_job(&self.db, &stale.id, started_at, &error_text, now).await?
            else {
                // Finished by its agent since the listing.
                continue;
            };
            counter!("agent_jobs_reaped_total").increment(1);
            warn!(
                job_id = %job.id,
                agent_id = %job.agent_id,
                job_type = %job.job_type,
                "stale running job failed"
            );
            self.appliers.apply(&self.db, &job).await;
            reaped += 1;
        }
        Ok(reaped)
    }

    pub async fn get(&self, job_id: &str) -> Result<JobRecord> {
        store::get_job(&self.db, job_id)
            .await?
            .ok_or_else(|| JobError::NotFound(job_id.to_string()).into())
    }

    pub async fn list_for_agent(
        &self,
        agent_id: &str,
        status: Option<JobStatus>,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<JobRecord>> {
        store::list_jobs_for_agent(&self.db, agent_id, status.map(Into::into), limit, offset).await
    }

    /// The job if it exists and belongs to the agent. Another agent's job is
    /// reported as not found.
    async fn owned_by(&self, agent_id: &str, job_id: &str) -> Result<JobRecord> {
        match store::get_job(&self.db, job_id).await? {
            Some(job) if job.agent_id == agent_id => Ok(job),
            _ => Err(JobError::NotFound(job_id.to_string()).into()),
        }
    }
}

//! Reactions to finished jobs.
//!
//! Appliers run synchronously after a job reaches a terminal state, for agent
//! reported failures as well as successes. Their errors are logged and counted
//! but never undo the terminal transition.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use metrics::counter;
use tracing::{debug, warn};

use crate::Result;
use crate::persistence::{self as db, Db, JobRecord, JobState};

#[async_trait]
pub trait ResultApplier: Send + Sync {
    /// Name used in logs and metrics.
    fn name(&self) -> &'static str;

    fn handles(&self, job_type: &str) -> bool;

    async fn apply(&self, db: &Db, job: &JobRecord) -> Result<()>;
}

#[derive(Clone, Default)]
pub struct ResultApplierRegistry {
    appliers: Vec<Arc<dyn ResultApplier>>,
}

impl std::fmt::Debug for ResultApplierRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.appliers.iter().map(|a| a.name()))
            .finish()
    }
}

impl ResultApplierRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in appliers.
    pub fn with_defaults() -> Self {
        Self::new().register(Arc::new(ViewerSnapshotApplier))
    }

    pub fn register(mut self, applier: Arc<dyn ResultApplier>) -> Self {
        self.appliers.push(applier);
        self
    }

    /// Run every applier that handles the job type. Returns how many ran
    /// without error.
    pub async fn apply(&self, db: &Db, job: &JobRecord) -> usize {
        let mut applied = 0;
        for applier in self.appliers.iter().filter(|a| a.handles(&job.job_type)) {
            match applier.apply(db, job).await {
                Ok(()) => {
                    applied += 1;
                    debug!(job_id = %job.id, applier = applier.name(), "job result applied");
                }
                Err(err) => {
                    counter!("agent_job_result_apply_errors_total", "applier" => applier.name())
                        .increment(1);
                    warn!(
                        ?err,
                        job_id = %job.id,
                        job_type = %job.job_type,
                        applier = applier.name(),
                        "failed to apply job result"
                    );
                }
            }
        }
        applied
    }
}

/// Caches the result of successful `*.viewer_snapshot` jobs per agent and
/// instance. The job payload must carry `instance_id`.
#[derive(Debug, Default)]
pub struct ViewerSnapshotApplier;

#[async_trait]
impl ResultApplier for ViewerSnapshotApplier {
    fn name(&self) -> &'static str {
        "viewer_snapshot"
    }

    fn handles(&self, job_type: &str) -> bool {
        job_type.ends_with(".viewer_snapshot")
    }

    async fn apply(&self, db: &Db, job: &JobRecord) -> Result<()> {
        if job.status != JobState::Success {
            return Ok(());
        }
        let Some(snapshot) = job.result_payload.as_ref() else {
            return Ok(());
        };
        let instance_id = job
            .payload
            .0
            .get("instance_id")
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow::anyhow!("viewer snapshot job {} has no instance_id", job.id))?;

        db::snapshots::upsert_viewer_snapshot(
            db,
            &job.agent_id,
            instance_id,
            &job.id,
            &snapshot.0,
            job.finished_at.unwrap_or_else(Utc::now),
        )
        .await
    }
}

use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use tracing::{info, warn};

use crate::Result;
use crate::config::JobsConfig;
use crate::persistence::{self as db, jobs as job_store};

pub async fn job_retention_loop(db: db::Db, cfg: JobsConfig) {
    let sweep_interval = cfg.retention_interval_secs.max(60);
    let mut interval = tokio::time::interval(Duration::from_secs(sweep_interval));

    loop {
        interval.tick().await;

        if cfg.retention_secs == 0 {
            continue;
        }

        match run_retention_sweep(&db, cfg.retention_secs, Utc::now()).await {
            Ok(0) => {}
            Ok(pruned) => {
                info!(pruned, "job retention sweep removed finished jobs");
            }
            Err(err) => warn!(?err, "job retention sweep failed"),
        }
    }
}

/// Delete terminal jobs that finished more than `retention_secs` before `now`.
pub(crate) async fn run_retention_sweep(
    db: &db::Db,
    retention_secs: u64,
    now: DateTime<Utc>,
) -> Result<u64> {
    if retention_secs == 0 {
        return Ok(0);
    }

    let cutoff = now - ChronoDuration::seconds(retention_secs.min(i64::MAX as u64) as i64);
    job_store::delete_terminal_jobs_before(db, cutoff).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::jobs::{FinishReport, JobQueue, JobRequest};
    use crate::services::results::ResultApplierRegistry;
    use crate::services::test_support::{seed_agent, test_db};
    use serde_json::json;

    #[tokio::test]
    async fn sweep_prunes_old_terminal_jobs_only() {
        let db = test_db().await;
        seed_agent(&db, "node-1").await;
        let jobs = JobQueue::new(
            db.clone(),
            ResultApplierRegistry::with_defaults(),
            JobsConfig::default(),
        );
        for id in ["finished", "pending"] {
            jobs.dispatch(JobRequest::new("node-1", "ts3.backup", json!({})).with_id(id))
                .await
                .expect("dispatch");
        }
        jobs.finish(
            "node-1",
            "finished",
            FinishReport {
                status: "failed".into(),
                ..FinishReport::default()
            },
        )
        .await
        .expect("finish");

        assert_eq!(run_retention_sweep(&db, 3600, Utc::now()).await.expect("sweep"), 0);
        assert_eq!(run_retention_sweep(&db, 0, Utc::now()).await.expect("sweep"), 0);

        let later = Utc::now() + ChronoDuration::hours(2);
        assert_eq!(run_retention_sweep(&db, 3600, later).await.expect("sweep"), 1);
        assert!(jobs.get("finished").await.is_err());
        assert!(jobs.get("pending").await.is_ok());
    }
}

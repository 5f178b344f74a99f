use std::time::Duration;

use chrono::Utc;
use tracing::{info, warn};

use crate::config::JobsConfig;
use crate::services::jobs::JobQueue;

/// Periodically fail jobs stuck in `running` longer than the configured timeout.
pub async fn job_reaper_loop(jobs: JobQueue, cfg: JobsConfig) {
    if cfg.running_timeout_secs == 0 {
        info!("stale job reaper disabled");
        return;
    }
    let mut interval = tokio::time::interval(Duration::from_secs(cfg.reaper_interval_secs.max(1)));

    loop {
        interval.tick().await;
        match jobs.reap_stale(Utc::now()).await {
            Ok(0) => {}
            Ok(reaped) => info!(reaped, "stale job sweep failed running jobs"),
            Err(err) => warn!(?err, "stale job sweep failed"),
        }
    }
}

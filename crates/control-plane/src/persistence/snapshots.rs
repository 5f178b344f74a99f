use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::FromRow;
use sqlx::types::Json;

use super::Db;
use crate::Result;

#[derive(Debug, Clone, FromRow)]
pub struct ViewerSnapshotRecord {
    pub agent_id: String,
    pub instance_id: String,
    pub job_id: String,
    #[sqlx(rename = "snapshot_json")]
    pub snapshot: Json<Value>,
    pub captured_at: DateTime<Utc>,
}

pub async fn upsert_viewer_snapshot(
    pool: &Db,
    agent_id: &str,
    instance_id: &str,
    job_id: &str,
    snapshot: &Value,
    captured_at: DateTime<Utc>,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO viewer_snapshots (agent_id, instance_id, job_id, snapshot_json, captured_at)
        VALUES (?1, ?2, ?3, ?4, ?5)
        ON CONFLICT (agent_id, instance_id) DO UPDATE SET
            job_id = excluded.job_id,
            snapshot_json = excluded.snapshot_json,
            captured_at = excluded.captured_at
        "#,
    )
    .bind(agent_id)
    .bind(instance_id)
    .bind(job_id)
    .bind(Json(snapshot))
    .bind(captured_at)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn get_viewer_snapshot(
    pool: &Db,
    agent_id: &str,
    instance_id: &str,
) -> Result<Option<ViewerSnapshotRecord>> {
    let record = sqlx::query_as::<_, ViewerSnapshotRecord>(
        r#"
        SELECT agent_id, instance_id, job_id, snapshot_json, captured_at
        FROM viewer_snapshots
        WHERE agent_id = ?1 AND instance_id = ?2
        "#,
    )
    .bind(agent_id)
    .bind(instance_id)
    .fetch_optional(pool)
    .await?;
    Ok(record)
}

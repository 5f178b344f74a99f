use chrono::{DateTime, Utc};
use sqlx::FromRow;

use super::Db;
use crate::Result;

#[derive(Debug, Clone, FromRow)]
pub struct InstanceRecord {
    pub id: String,
    pub agent_id: String,
    pub game_key: String,
    pub customer_id: Option<String>,
    pub created_at: DateTime<Utc>,
    /// When the instance's port allocation committed. `None` until then and
    /// again after a release.
    pub ports_allocated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct NewInstance {
    pub id: String,
    pub agent_id: String,
    pub game_key: String,
    pub customer_id: Option<String>,
}

pub async fn create_instance(pool: &Db, instance: &NewInstance) -> Result<InstanceRecord> {
    sqlx::query(
        r#"
        INSERT INTO instances (id, agent_id, game_key, customer_id, created_at)
        VALUES (?1, ?2, ?3, ?4, ?5)
        "#,
    )
    .bind(&instance.id)
    .bind(&instance.agent_id)
    .bind(&instance.game_key)
    .bind(&instance.customer_id)
    .bind(Utc::now())
    .execute(pool)
    .await?;

    get_instance(pool, &instance.id)
        .await?
        .ok_or_else(|| anyhow::anyhow!("instance insert did not return row"))
}

pub async fn get_instance(pool: &Db, id: &str) -> Result<Option<InstanceRecord>> {
    let record = sqlx::query_as::<_, InstanceRecord>(
        r#"
        SELECT id, agent_id, game_key, customer_id, created_at, ports_allocated_at
        FROM instances
        WHERE id = ?1
        "#,
    )
    .bind(id)
    .fetch_optional(pool)
    .await?;
    Ok(record)
}

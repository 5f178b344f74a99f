use chrono::{DateTime, Utc};
use common::api::PortBlockView;
use sqlx::FromRow;

use super::Db;
use crate::Result;

#[derive(Debug, Clone, FromRow)]
pub struct PortBlockRecord {
    pub id: String,
    pub pool_id: String,
    pub customer_id: String,
    pub start_port: i64,
    pub end_port: i64,
    pub created_at: DateTime<Utc>,
}

impl PortBlockRecord {
    pub fn to_view(&self) -> PortBlockView {
        PortBlockView {
            id: self.id.clone(),
            pool_id: self.pool_id.clone(),
            customer_id: self.customer_id.clone(),
            start_port: self.start_port as u16,
            end_port: self.end_port as u16,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewPortBlock {
    pub customer_id: String,
    pub start_port: u16,
    pub end_port: u16,
}

pub async fn list_blocks_for_pool(pool: &Db, pool_id: &str) -> Result<Vec<PortBlockRecord>> {
    let records = sqlx::query_as::<_, PortBlockRecord>(
        r#"
        SELECT id, pool_id, customer_id, start_port, end_port, created_at
        FROM port_blocks
        WHERE pool_id = ?1
        ORDER BY start_port ASC
        "#,
    )
    .bind(pool_id)
    .fetch_all(pool)
    .await?;
    Ok(records)
}

/// Insert blocks in one transaction after re-checking for overlap against
/// rows committed since the caller planned them.
///
/// Returns `None` when a planned block now overlaps an existing one.
pub async fn insert_blocks(
    pool: &Db,
    pool_id: &str,
    blocks: &[NewPortBlock],
) -> Result<Option<Vec<PortBlockRecord>>> {
    let mut tx = pool.begin().await?;
    // Take the write lock before reading so overlap checks see the latest rows.
    sqlx::query("UPDATE port_pools SET tag = tag WHERE id = ?1")
        .bind(pool_id)
        .execute(&mut *tx)
        .await?;

    let now = Utc::now();
    let mut ids = Vec::with_capacity(blocks.len());
    for block in blocks {
        let overlapping: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*)
            FROM port_blocks
            WHERE pool_id = ?1 AND start_port <= ?3 AND end_port >= ?2
            "#,
        )
        .bind(pool_id)
        .bind(i64::from(block.start_port))
        .bind(i64::from(block.end_port))
        .fetch_one(&mut *tx)
        .await?;
        if overlapping > 0 {
            tx.rollback().await?;
            return Ok(None);
        }

        let id = uuid::Uuid::new_v4().to_string();
        sqlx::query(
            r#"
            INSERT INTO port_blocks (id, pool_id, customer_id, start_port, end_port, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
        )
        .bind(&id)
        .bind(pool_id)
        .bind(&block.customer_id)
        .bind(i64::from(block.start_port))
        .bind(i64::from(block.end_port))
        .bind(now)
        .execute(&mut *tx)
        .await?;
        ids.push(id);
    }
    tx.commit().await?;

    let mut records = list_blocks_for_pool(pool, pool_id).await?;
    records.retain(|r| ids.contains(&r.id));
    Ok(Some(records))
}

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use common::api::{PortAllocationView, PortPoolView};
use sqlx::FromRow;

use super::Db;
use super::instances::get_instance;
use crate::Result;

#[derive(Debug, Clone, FromRow)]
pub struct PortPoolRecord {
    pub id: String,
    pub agent_id: String,
    pub tag: String,
    pub start_port: i64,
    pub end_port: i64,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
}

impl PortPoolRecord {
    pub fn start(&self) -> u16 {
        self.start_port as u16
    }

    pub fn end(&self) -> u16 {
        self.end_port as u16
    }

    pub fn to_view(&self) -> PortPoolView {
        PortPoolView {
            id: self.id.clone(),
            agent_id: self.agent_id.clone(),
            tag: self.tag.clone(),
            start_port: self.start(),
            end_port: self.end(),
            enabled: self.enabled,
        }
    }
}

#[derive(Debug, Clone)]
pub struct NewPortPool {
    pub id: String,
    pub agent_id: String,
    pub tag: String,
    pub start_port: u16,
    pub end_port: u16,
    pub enabled: bool,
}

#[derive(Debug, Clone, FromRow)]
pub struct PortAllocationRecord {
    pub id: String,
    pub instance_id: String,
    pub agent_id: String,
    pub role_key: String,
    pub protocol: String,
    pub port: i64,
    pub strategy: String,
    pub required: bool,
    pub pool_tag: Option<String>,
    pub derived_from: Option<String>,
    pub derived_offset: Option<i64>,
    pub block_index: i64,
    pub position: i64,
    pub created_at: DateTime<Utc>,
}

impl PortAllocationRecord {
    pub fn to_view(&self) -> PortAllocationView {
        PortAllocationView {
            role: self.role_key.clone(),
            protocol: self.protocol.clone(),
            port: self.port as u16,
            strategy: self.strategy.clone(),
            required: self.required,
            pool_tag: self.pool_tag.clone(),
            derived_from: self.derived_from.clone(),
            derived_offset: self.derived_offset.map(|v| v as i32),
            block_index: self.block_index as u16,
        }
    }
}

/// One row to be written by [`insert_allocations`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewPortAllocation {
    pub role_key: String,
    pub protocol: String,
    pub port: u16,
    pub strategy: String,
    pub required: bool,
    pub pool_tag: Option<String>,
    pub derived_from: Option<String>,
    pub derived_offset: Option<i32>,
    pub block_index: u16,
}

/// Result of writing an allocation batch.
#[derive(Debug, Clone)]
pub enum AllocationWrite {
    Inserted(Vec<PortAllocationRecord>),
    /// Another writer allocated the instance first; its rows are returned.
    AlreadyAllocated(Vec<PortAllocationRecord>),
}

pub async fn create_pool(pool: &Db, new_pool: &NewPortPool) -> Result<PortPoolRecord> {
    sqlx::query(
        r#"
        INSERT INTO port_pools (id, agent_id, tag, start_port, end_port, enabled, created_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
        "#,
    )
    .bind(&new_pool.id)
    .bind(&new_pool.agent_id)
    .bind(&new_pool.tag)
    .bind(i64::from(new_pool.start_port))
    .bind(i64::from(new_pool.end_port))
    .bind(new_pool.enabled)
    .bind(Utc::now())
    .execute(pool)
    .await?;

    get_pool(pool, &new_pool.id)
        .await?
        .ok_or_else(|| anyhow::anyhow!("port pool insert did not return row"))
}

pub async fn get_pool(pool: &Db, id: &str) -> Result<Option<PortPoolRecord>> {
    let record = sqlx::query_as::<_, PortPoolRecord>(
        r#"
        SELECT id, agent_id, tag, start_port, end_port, enabled, created_at
        FROM port_pools
        WHERE id = ?1
        "#,
    )
    .bind(id)
    .fetch_optional(pool)
    .await?;
    Ok(record)
}

pub async fn list_pools_for_agent(pool: &Db, agent_id: &str) -> Result<Vec<PortPoolRecord>> {
    let records = sqlx::query_as::<_, PortPoolRecord>(
        r#"
        SELECT id, agent_id, tag, start_port, end_port, enabled, created_at
        FROM port_pools
        WHERE agent_id = ?1
        ORDER BY tag ASC, start_port ASC
        "#,
    )
    .bind(agent_id)
    .fetch_all(pool)
    .await?;
    Ok(records)
}

/// Enabled pools with `tag` on the agent, lowest range first.
pub async fn list_enabled_pools_by_tag(
    pool: &Db,
    agent_id: &str,
    tag: &str,
) -> Result<Vec<PortPoolRecord>> {
    let records = sqlx::query_as::<_, PortPoolRecord>(
        r#"
        SELECT id, agent_id, tag, start_port, end_port, enabled, created_at
        FROM port_pools
        WHERE agent_id = ?1 AND tag = ?2 AND enabled = 1
        ORDER BY start_port ASC
        "#,
    )
    .bind(agent_id)
    .bind(tag)
    .fetch_all(pool)
    .await?;
    Ok(records)
}

pub async fn list_allocations_for_instance(
    pool: &Db,
    instance_id: &str,
) -> Result<Vec<PortAllocationRecord>> {
    let records = sqlx::query_as::<_, PortAllocationRecord>(
        r#"
        SELECT id, instance_id, agent_id, role_key, protocol, port, strategy, required,
               pool_tag, derived_from, derived_offset, block_index, position, created_at
        FROM port_allocations
        WHERE instance_id = ?1
        ORDER BY position ASC
        "#,
    )
    .bind(instance_id)
    .fetch_all(pool)
    .await?;
    Ok(records)
}

/// Ports already recorded for the node and protocol inside `[start, end]`.
pub async fn allocated_ports_in_range(
    pool: &Db,
    agent_id: &str,
    protocol: &str,
    start: u16,
    end: u16,
) -> Result<HashSet<u16>> {
    let ports: Vec<i64> = sqlx::query_scalar(
        r#"
        SELECT port
        FROM port_allocations
        WHERE agent_id = ?1 AND protocol = ?2 AND port BETWEEN ?3 AND ?4
        "#,
    )
    .bind(agent_id)
    .bind(protocol)
    .bind(i64::from(start))
    .bind(i64::from(end))
    .fetch_all(pool)
    .await?;
    Ok(ports.into_iter().map(|p| p as u16).collect())
}

pub async fn is_port_allocated(pool: &Db, agent_id: &str, protocol: &str, port: u16) -> Result<bool> {
    let taken = allocated_ports_in_range(pool, agent_id, protocol, port, port).await?;
    Ok(!taken.is_empty())
}

/// Write every allocation for an instance in one transaction.
///
/// The instance is marked allocated first, which takes the write lock and
/// tells a concurrent allocator that already committed apart from one that
/// has not. The marker is set even for an empty batch so a profile whose
/// optional roles all went unresolved stays settled. A unique violation on
/// `(agent_id, protocol, port)` is returned as an error and rolls the whole
/// batch back, marker included.
pub async fn insert_allocations(
    pool: &Db,
    instance_id: &str,
    agent_id: &str,
    allocations: &[NewPortAllocation],
) -> Result<AllocationWrite> {
    let now = Utc::now();
    let mut tx = pool.begin().await?;
    let marked = sqlx::query(
        "UPDATE instances SET ports_allocated_at = ?2 WHERE id = ?1 AND ports_allocated_at IS NULL",
    )
    .bind(instance_id)
    .bind(now)
    .execute(&mut *tx)
    .await?;
    if marked.rows_affected() == 0 {
        tx.rollback().await?;
        if get_instance(pool, instance_id).await?.is_none() {
            anyhow::bail!("instance {instance_id} disappeared during allocation");
        }
        let records = list_allocations_for_instance(pool, instance_id).await?;
        return Ok(AllocationWrite::AlreadyAllocated(records));
    }

    for (position, allocation) in allocations.iter().enumerate() {
        sqlx::query(
            r#"
            INSERT INTO port_allocations (
                id, instance_id, agent_id, role_key, protocol, port, strategy, required,
                pool_tag, derived_from, derived_offset, block_index, position, created_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
            "#,
        )
        .bind(uuid::Uuid::new_v4().to_string())
        .bind(instance_id)
        .bind(agent_id)
        .bind(&allocation.role_key)
        .bind(&allocation.protocol)
        .bind(i64::from(allocation.port))
        .bind(&allocation.strategy)
        .bind(allocation.required)
        .bind(&allocation.pool_tag)
        .bind(&allocation.derived_from)
        .bind(allocation.derived_offset.map(i64::from))
        .bind(i64::from(allocation.block_index))
        .bind(position as i64)
        .bind(now)
        .execute(&mut *tx)
        .await?;
    }
    tx.commit().await?;

    let records = list_allocations_for_instance(pool, instance_id).await?;
    Ok(AllocationWrite::Inserted(records))
}

/// Drop the instance's allocations and clear its marker so the next call
/// allocates afresh.
pub async fn delete_allocations_for_instance(pool: &Db, instance_id: &str) -> Result<u64> {
    let mut tx = pool.begin().await?;
    let result = sqlx::query("DELETE FROM port_allocations WHERE instance_id = ?1")
        .bind(instance_id)
        .execute(&mut *tx)
        .await?;
    sqlx::query("UPDATE instances SET ports_allocated_at = NULL WHERE id = ?1")
        .bind(instance_id)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;
    Ok(result.rows_affected())
}

//! Customer port blocks carved out of a pool.
//!
//! Blocks are a planning construct: they are never checked against the node.

use tracing::{info, warn};

use crate::Result;
use crate::persistence::blocks::{self as store, NewPortBlock};
use crate::persistence::{self as db, Db, PortBlockRecord, PortPoolRecord};

const MAX_BLOCK_ATTEMPTS: u32 = 3;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum BlockError {
    #[error("port pool {0} not found")]
    PoolNotFound(String),
    #[error("{field}: {reason}")]
    Validation { field: &'static str, reason: String },
    #[error("port pool {pool_id} has no free run of {size} ports")]
    Exhausted { pool_id: String, size: u16 },
    #[error("port pool {0} is being modified concurrently, try again")]
    Contended(String),
}

fn validation(field: &'static str, reason: impl Into<String>) -> anyhow::Error {
    BlockError::Validation {
        field,
        reason: reason.into(),
    }
    .into()
}

async fn load_pool(db: &Db, pool_id: &str) -> Result<PortPoolRecord> {
    db::ports::get_pool(db, pool_id)
        .await?
        .ok_or_else(|| BlockError::PoolNotFound(pool_id.to_string()).into())
}

/// First port of the lowest gap of at least `size` ports between existing
/// blocks, which must be sorted by start port.
fn first_gap(pool: &PortPoolRecord, blocks: &[PortBlockRecord], size: u16) -> Option<u16> {
    let size = u32::from(size);
    let end = u32::from(pool.end());
    let mut cursor = u32::from(pool.start());
    for block in blocks {
        let (start, stop) = (block.start_port as u32, block.end_port as u32);
        if start >= cursor && start - cursor >= size {
            break;
        }
        cursor = cursor.max(stop + 1);
    }
    (cursor + size - 1 <= end).then_some(cursor as u16)
}

/// Lease the lowest free run of `size` ports in the pool to a customer.
pub async fn allocate_block(
    db: &Db,
    pool_id: &str,
    customer_id: &str,
    size: u16,
) -> Result<PortBlockRecord> {
    if size == 0 {
        return Err(validation("size", "must be at least 1"));
    }
    let pool = load_pool(db, pool_id).await?;

    for _ in 0..MAX_BLOCK_ATTEMPTS {
        let existing = store::list_blocks_for_pool(db, pool_id).await?;
        let Some(start) = first_gap(&pool, &existing, size) else {
            return Err(BlockError::Exhausted {
                pool_id: pool_id.to_string(),
                size,
            }
            .into());
        };
        let block = NewPortBlock {
            customer_id: customer_id.to_string(),
            start_port: start,
            end_port: start + (size - 1),
        };
        if let Some(mut inserted) = store::insert_blocks(db, pool_id, &[block]).await? {
            if let Some(record) = inserted.pop() {
                info!(
                    pool_id,
                    customer_id,
                    start_port = record.start_port,
                    end_port = record.end_port,
                    "port block leased"
                );
                return Ok(record);
            }
        }
        warn!(pool_id, customer_id, "port block overlapped a concurrent lease, retrying");
    }
    Err(BlockError::Contended(pool_id.to_string()).into())
}

/// Partition `[range_start, range_end]` into blocks of `block_size` ports.
///
/// The range must lie inside the pool, divide evenly by the block size and
/// not overlap any existing block.
pub async fn allocate_blocks_in_range(
    db: &Db,
    pool_id: &str,
    customer_id: &str,
    range_start: u16,
    range_end: u16,
    block_size: u16,
) -> Result<Vec<PortBlockRecord>> {
    if block_size == 0 {
        return Err(validation("block_size", "must be at least 1"));
    }
    if range_start > range_end {
        return Err(validation(
            "range_start",
            format!("{range_start} is after range_end {range_end}"),
        ));
    }
    let pool = load_pool(db, pool_id).await?;
    if range_start < pool.start() || range_end > pool.end() {
        return Err(validation(
            "range",
            format!(
                "{range_start}-{range_end} is outside pool range {}-{}",
                pool.start(),
                pool.end()
            ),
        ));
    }
    let span = u32::from(range_end) - u32::from(range_start) + 1;
    if span % u32::from(block_size) != 0 {
        return Err(validation(
            "block_size",
            format!("range of {span} ports is not divisible by block size {block_size}"),
        ));
    }

    let existing = store::list_blocks_for_pool(db, pool_id).await?;
    if let Some(clash) = existing.iter().find(|b| {
        b.start_port <= i64::from(range_end) && b.end_port >= i64::from(range_start)
    }) {
        return Err(validation(
            "range",
            format!(
                "{range_start}-{range_end} overlaps existing block {}-{}",
                clash.start_port, clash.end_port
            ),
        ));
    }

    let blocks: Vec<NewPortBlock> = (0..span / u32::from(block_size))
        .map(|i| {
            let start = u32::from(range_start) + i * u32::from(block_size);
            NewPortBlock {
                customer_id: customer_id.to_string(),
                start_port: start as u16,
                end_port: (start + u32::from(block_size) - 1) as u16,
            }
        })
        .collect();

    let Some(records) = store::insert_blocks(db, pool_id, &blocks).await? else {
        return Err(validation(
            "range",
            format!("{range_start}-{range_end} overlaps a block leased concurrently"),
        ));
    };
    info!(
        pool_id,
        customer_id,
        range_start,
        range_end,
        blocks = records.len(),
        "port range partitioned into blocks"
    );
    Ok(records)
}

pub async fn list_blocks(db: &Db, pool_id: &str) -> Result<Vec<PortBlockRecord>> {
    load_pool(db, pool_id).await?;
    store::list_blocks_for_pool(db, pool_id).await
}

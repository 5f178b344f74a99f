use sqlx::SqlitePool;

pub mod agents;
pub mod blocks;
pub mod instances;
pub mod jobs;
pub mod migrations;
pub mod ports;
pub mod snapshots;

pub type Db = SqlitePool;

pub use agents::{AgentRecord, NewAgent};
pub use blocks::{NewPortBlock, PortBlockRecord};
pub use instances::{InstanceRecord, NewInstance};
pub use jobs::{JobCompletion, JobRecord, JobState, NewJob};
pub use migrations::{MigrationLabel, MigrationRunOutcome, MigrationSnapshot};
pub use ports::{
    AllocationWrite, NewPortAllocation, NewPortPool, PortAllocationRecord, PortPoolRecord,
};
pub use snapshots::ViewerSnapshotRecord;

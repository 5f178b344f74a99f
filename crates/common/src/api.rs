//! Shared API DTOs used by the control plane and agents.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use utoipa::ToSchema;

/// Lifecycle state of an agent job (wire format uses lowercase values).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Waiting for an agent to claim it.
    Queued,
    /// Claimed by an agent and executing.
    Running,
    /// Finished successfully.
    Success,
    /// Finished with a failure reported by the agent or the reaper.
    Failed,
}

impl JobStatus {
    /// Returns the canonical lowercase representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Success => "success",
            JobStatus::Failed => "failed",
        }
    }

    /// True once the job can no longer change state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Success | JobStatus::Failed)
    }
}

/// One queued job as returned to a polling agent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, ToSchema)]
pub struct PolledJob {
    /// Job identifier.
    pub id: String,
    /// Job type tag, e.g. `ts3.install`.
    #[serde(rename = "type")]
    pub job_type: String,
    /// Arbitrary job payload.
    #[schema(value_type = Object)]
    pub payload: Value,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
}

/// Response body of the poll endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, ToSchema)]
pub struct JobPollResponse {
    /// Queued jobs for the calling agent, oldest first.
    pub jobs: Vec<PolledJob>,
}

/// Response body of the claim endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, ToSchema)]
pub struct JobStartResponse {
    /// Job identifier.
    pub id: String,
    /// Status after the claim (always `running`).
    pub status: JobStatus,
    /// Claim timestamp.
    pub started_at: DateTime<Utc>,
}

/// Completion report sent by an agent.
///
/// `status` is kept as a raw string so unknown values surface as a
/// validation error instead of a deserialization failure.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, ToSchema)]
pub struct JobFinishRequest {
    /// `success` or `failed`.
    pub status: String,
    /// Optional log output.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_text: Option<String>,
    /// Optional error text.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_text: Option<String>,
    /// Optional structured result.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schema(value_type = Option<Object>)]
    pub result_payload: Option<Value>,
}

/// Response body of the finish endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, ToSchema)]
pub struct JobFinishResponse {
    /// Job identifier.
    pub id: String,
    /// Terminal status stored for the job.
    pub status: JobStatus,
    /// Finish timestamp.
    pub finished_at: Option<DateTime<Utc>>,
}

/// Full job view returned to operators.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, ToSchema)]
pub struct JobView {
    /// Job identifier.
    pub id: String,
    /// Owning agent.
    pub agent_id: String,
    /// Job type tag.
    #[serde(rename = "type")]
    pub job_type: String,
    /// Job payload.
    #[schema(value_type = Object)]
    pub payload: Value,
    /// Current status.
    pub status: JobStatus,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Claim timestamp.
    pub started_at: Option<DateTime<Utc>>,
    /// Finish timestamp.
    pub finished_at: Option<DateTime<Utc>>,
    /// Log output reported by the agent.
    pub log_text: Option<String>,
    /// Error text reported by the agent or the reaper.
    pub error_text: Option<String>,
    /// Number of times this work was re-dispatched.
    pub retry_count: i64,
    /// Caller supplied idempotency key.
    pub idempotency_key: Option<String>,
    /// Result payload reported on finish.
    #[schema(value_type = Option<Object>)]
    pub result_payload: Option<Value>,
}

/// Operator request to enqueue a job for an agent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, ToSchema)]
pub struct DispatchJobRequest {
    /// Job type tag.
    #[serde(rename = "type")]
    pub job_type: String,
    /// Job payload.
    #[serde(default)]
    #[schema(value_type = Object)]
    pub payload: Value,
    /// Optional caller chosen job id; generated when absent.
    #[serde(default)]
    pub id: Option<String>,
    /// Optional idempotency key; an in-flight job with the same key is returned instead.
    #[serde(default)]
    pub idempotency_key: Option<String>,
}

/// One port to check on a node.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, ToSchema)]
pub struct PortCheck {
    /// Protocol, `tcp` or `udp`.
    pub proto: String,
    /// Port number.
    pub port: u16,
}

/// Body of `POST /ports/check-free` sent to an agent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, ToSchema)]
pub struct PortCheckRequest {
    /// Ports to check.
    pub checks: Vec<PortCheck>,
}

/// Liveness verdict for one port.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
pub struct PortCheckResult {
    /// Protocol, `tcp` or `udp`.
    pub proto: String,
    /// Port number.
    pub port: u16,
    /// True when nothing on the node is bound to the port.
    pub free: bool,
}

/// Response of `POST /ports/check-free`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, ToSchema)]
pub struct PortCheckResponse {
    /// One result per requested check.
    pub results: Vec<PortCheckResult>,
}

/// Heartbeat body sent by an agent.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, ToSchema)]
pub struct AgentHeartbeatRequest {
    /// Address the agent's service endpoint is reachable on.
    #[serde(default)]
    pub address: Option<String>,
    /// Metadata entries to merge into the agent record.
    #[serde(default)]
    pub metadata: Option<HashMap<String, String>>,
}

/// Operator request to register a new agent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, ToSchema)]
pub struct AgentRegistrationRequest {
    /// Optional agent id; generated when absent.
    #[serde(default)]
    pub id: Option<String>,
    /// Display name.
    pub name: String,
    /// Initial metadata (e.g. `service_url`).
    #[serde(default)]
    pub metadata: Option<HashMap<String, String>>,
}

/// Registration result. The secret is only ever returned here.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, ToSchema)]
pub struct AgentRegistrationResponse {
    /// Agent identifier.
    pub agent_id: String,
    /// Shared secret used to sign agent requests.
    pub secret: String,
}

/// Agent details shown to operators (never includes the secret).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, ToSchema)]
pub struct AgentSummary {
    /// Agent identifier.
    pub agent_id: String,
    /// Display name.
    pub name: String,
    /// Metadata map.
    pub metadata: HashMap<String, String>,
    /// Address seen on the last heartbeat.
    pub last_heartbeat_addr: Option<String>,
    /// Time of the last heartbeat.
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    /// Registration time.
    pub created_at: DateTime<Utc>,
}

/// Operator request to create a port pool.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, ToSchema)]
pub struct PortPoolCreateRequest {
    /// Pool tag referenced by game profile roles.
    pub tag: String,
    /// First port (inclusive).
    pub start_port: u16,
    /// Last port (inclusive).
    pub end_port: u16,
    /// Defaults to enabled.
    #[serde(default)]
    pub enabled: Option<bool>,
}

/// Port pool as returned to operators.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, ToSchema)]
pub struct PortPoolView {
    /// Pool identifier.
    pub id: String,
    /// Owning agent.
    pub agent_id: String,
    /// Pool tag.
    pub tag: String,
    /// First port (inclusive).
    pub start_port: u16,
    /// Last port (inclusive).
    pub end_port: u16,
    /// Whether allocations may draw from the pool.
    pub enabled: bool,
}

/// Request a single block of `size` ports for a customer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, ToSchema)]
pub struct PortBlockRequest {
    /// Customer the block is handed to.
    pub customer_id: String,
    /// Number of consecutive ports.
    pub size: u16,
}

/// Partition an explicit sub-range of a pool into equal blocks.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, ToSchema)]
pub struct PortBlockRangeRequest {
    /// Customer the blocks are handed to.
    pub customer_id: String,
    /// First port of the range (inclusive).
    pub range_start: u16,
    /// Last port of the range (inclusive).
    pub range_end: u16,
    /// Size of each block.
    pub block_size: u16,
}

/// A leased block of ports.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, ToSchema)]
pub struct PortBlockView {
    /// Block identifier.
    pub id: String,
    /// Pool the block was carved from.
    pub pool_id: String,
    /// Customer holding the block.
    pub customer_id: String,
    /// First port (inclusive).
    pub start_port: u16,
    /// Last port (inclusive).
    pub end_port: u16,
}

/// Operator request to create an instance and allocate its ports.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, ToSchema)]
pub struct InstanceCreateRequest {
    /// Optional instance id; generated when absent.
    #[serde(default)]
    pub id: Option<String>,
    /// Node hosting the instance.
    pub agent_id: String,
    /// Game profile key.
    pub game_key: String,
    /// Owning customer.
    #[serde(default)]
    pub customer_id: Option<String>,
}

/// One concrete port bound to an instance role.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, ToSchema)]
pub struct PortAllocationView {
    /// Role key, e.g. `voice`.
    pub role: String,
    /// Protocol.
    pub protocol: String,
    /// Port number.
    pub port: u16,
    /// Strategy that produced the port.
    pub strategy: String,
    /// Whether the role was required.
    pub required: bool,
    /// Pool tag the port was drawn from.
    pub pool_tag: Option<String>,
    /// Base role for derived ports.
    pub derived_from: Option<String>,
    /// Offset applied to the base role.
    pub derived_offset: Option<i32>,
    /// Position inside a consecutive block.
    pub block_index: u16,
}

/// Instance with its port allocations.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, ToSchema)]
pub struct InstancePortsResponse {
    /// Instance identifier.
    pub instance_id: String,
    /// Hosting agent.
    pub agent_id: String,
    /// Game profile key.
    pub game_key: String,
    /// Allocations in role declaration order.
    pub ports: Vec<PortAllocationView>,
}

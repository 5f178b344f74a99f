//! Port allocation for instances.
//!
//! An attempt resolves every role of the instance's game profile in
//! declaration order, confirming candidates with the node before anything is
//! written, then commits all rows in one transaction. Two allocators racing
//! for the same port are arbitrated by the `(agent_id, protocol, port)`
//! uniqueness constraint: the loser discards the whole attempt, liveness
//! checks included, and starts over.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use common::api::PortCheck;
use metrics::counter;
use tracing::{debug, info, warn};

use crate::Result;
use crate::error::is_unique_violation;
use crate::metrics::record_allocation_failure;
use crate::persistence::ports::{self as store, AllocationWrite};
use crate::persistence::{
    self as db, AgentRecord, Db, InstanceRecord, NewPortAllocation, PortAllocationRecord,
};
use crate::profiles::{AllocationStrategy, GameProfile, PortRole, Protocol};
use crate::services::liveness::PortLivenessChecker;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum AllocationError {
    #[error("unknown game profile {0}")]
    UnknownProfile(String),
    #[error("agent {0} not found")]
    AgentNotFound(String),
    #[error("instance {0} not found")]
    InstanceNotFound(String),
    #[error("required port role {role} could not be allocated: {reason}")]
    RequiredRoleUnavailable { role: String, reason: String },
    #[error("port role {role} derives from {base}, which was not resolved")]
    DerivedBaseMissing { role: String, base: String },
    #[error("port allocation kept conflicting with concurrent allocations after {attempts} attempts")]
    RetriesExhausted { attempts: u32 },
}

impl AllocationError {
    fn reason(&self) -> &'static str {
        match self {
            AllocationError::UnknownProfile(_) => "unknown_profile",
            AllocationError::AgentNotFound(_) => "agent_not_found",
            AllocationError::InstanceNotFound(_) => "instance_not_found",
            AllocationError::RequiredRoleUnavailable { .. } => "required_role_unavailable",
            AllocationError::DerivedBaseMissing { .. } => "derived_base_missing",
            AllocationError::RetriesExhausted { .. } => "retries_exhausted",
        }
    }
}

/// Why a role produced no port.
enum Unresolved {
    Unavailable(String),
    BaseMissing(String),
    /// A concurrent allocation committed the port after this attempt started.
    Taken(u16),
}

enum Attempt {
    Planned(Plan),
    /// A derived port was committed by someone else after the attempt began.
    Raced { role: String, port: u16 },
}

/// Ports picked so far within one attempt.
#[derive(Default)]
struct Plan {
    rows: Vec<NewPortAllocation>,
    resolved: HashMap<String, u16>,
    claimed: HashSet<(Protocol, u16)>,
}

impl Plan {
    fn is_claimed(&self, protocol: Protocol, port: u16) -> bool {
        self.claimed.contains(&(protocol, port))
    }

    fn push(&mut self, role: &PortRole, start: u16, count: u16) {
        let (derived_from, derived_offset) = match &role.strategy {
            AllocationStrategy::DerivedOffset { from_role, offset } => {
                (Some(from_role.clone()), Some(*offset))
            }
            _ => (None, None),
        };
        for index in 0..count {
            let port = start + index;
            self.claimed.insert((role.protocol, port));
            self.rows.push(NewPortAllocation {
                role_key: role.key.clone(),
                protocol: role.protocol.as_str().to_string(),
                port,
                strategy: role.strategy.name().to_string(),
                required: role.required,
                pool_tag: role.strategy.pool_tag().map(str::to_string),
                derived_from: derived_from.clone(),
                derived_offset,
                block_index: index,
            });
        }
        self.resolved.insert(role.key.clone(), start);
    }
}

fn check(protocol: Protocol, port: u16) -> PortCheck {
    PortCheck {
        proto: protocol.as_str().to_string(),
        port,
    }
}

#[derive(Clone)]
pub struct PortAllocator {
    db: Db,
    liveness: Arc<dyn PortLivenessChecker>,
    max_attempts: u32,
}

impl std::fmt::Debug for PortAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PortAllocator")
            .field("max_attempts", &self.max_attempts)
            .finish_non_exhaustive()
    }
}

impl PortAllocator {
    pub fn new(db: Db, liveness: Arc<dyn PortLivenessChecker>, max_attempts: u32) -> Self {
        Self {
            db,
            liveness,
            max_attempts: max_attempts.max(1),
        }
    }

    /// Allocate every port role of `profile` for the instance.
    ///
    /// Returns the existing rows untouched once the instance has a committed
    /// allocation, including one that resolved no ports.
    pub async fn allocate_ports(
        &self,
        instance: &InstanceRecord,
        profile: &GameProfile,
    ) -> Result<Vec<PortAllocationRecord>> {
        let result = self.allocate_inner(instance, profile).await;
        if let Err(err) = &result {
            let reason = err
                .downcast_ref::<AllocationError>()
                .map(AllocationError::reason)
                .unwrap_or("error");
            record_allocation_failure(reason);
        }
        result
    }

    async fn allocate_inner(
        &self,
        instance: &InstanceRecord,
        profile: &GameProfile,
    ) -> Result<Vec<PortAllocationRecord>> {
        let agent = db::agents::get_agent(&self.db, &instance.agent_id)
            .await?
            .ok_or_else(|| AllocationError::AgentNotFound(instance.agent_id.clone()))?;

        let mut seen_taken = HashSet::new();
        for attempt in 1..=self.max_attempts {
            let current = db::instances::get_instance(&self.db, &instance.id)
                .await?
                .ok_or_else(|| AllocationError::InstanceNotFound(instance.id.clone()))?;
            if current.ports_allocated_at.is_some() {
                debug!(instance_id = %instance.id, "instance already has port allocations");
                return self.allocations(&instance.id).await;
            }

            counter!("port_allocation_attempts_total").increment(1);
            let plan = match self.plan(&agent, profile, &seen_taken).await? {
                Attempt::Planned(plan) => plan,
                Attempt::Raced { role, port } => {
                    counter!("port_allocation_conflicts_total").increment(1);
                    warn!(
                        instance_id = %instance.id,
                        agent_id = %agent.id,
                        role = %role,
                        attempt,
                        "derived port taken by a concurrent allocation, retrying"
                    );
                    seen_taken.insert((role, port));
                    continue;
                }
            };
            match store::insert_allocations(&self.db, &instance.id, &agent.id, &plan.rows).await {
                Ok(AllocationWrite::Inserted(rows)) => {
                    info!(
                        instance_id = %instance.id,
                        agent_id = %agent.id,
                        game_key = %profile.key,
                        ports = rows.len(),
                        attempt,
                        "ports allocated"
                    );
                    return Ok(rows);
                }
                Ok(AllocationWrite::AlreadyAllocated(rows)) => {
                    debug!(instance_id = %instance.id, "concurrent allocation won for instance");
                    return Ok(rows);
                }
                Err(err) if is_unique_violation(&err) => {
                    counter!("port_allocation_conflicts_total").increment(1);
                    warn!(
                        instance_id = %instance.id,
                        agent_id = %agent.id,
                        attempt,
                        "port allocation conflicted, retrying"
                    );
                }
                Err(err) => return Err(err),
            }
        }

        Err(AllocationError::RetriesExhausted {
            attempts: self.max_attempts,
        }
        .into())
    }

    /// Resolve every role. Holds no transaction; each pick reads committed
    /// rows and asks the node.
    async fn plan(
        &self,
        agent: &AgentRecord,
        profile: &GameProfile,
        seen_taken: &HashSet<(String, u16)>,
    ) -> Result<Attempt> {
        let mut plan = Plan::default();
        for role in &profile.roles {
            let failure = match self.resolve_role(agent, role, &plan).await? {
                Ok((port, count)) => {
                    plan.push(role, port, count);
                    continue;
                }
                // A commit that landed mid-attempt is retried. Hitting the same
                // port again means the base pick cannot move past it.
                Err(Unresolved::Taken(port)) if !seen_taken.contains(&(role.key.clone(), port)) => {
                    return Ok(Attempt::Raced {
                        role: role.key.clone(),
                        port,
                    });
                }
                Err(Unresolved::Taken(port)) => AllocationError::RequiredRoleUnavailable {
                    role: role.key.clone(),
                    reason: format!("derived port {port} is already allocated"),
                },
                Err(Unresolved::Unavailable(reason)) => AllocationError::RequiredRoleUnavailable {
                    role: role.key.clone(),
                    reason,
                },
                Err(Unresolved::BaseMissing(base)) => AllocationError::DerivedBaseMissing {
                    role: role.key.clone(),
                    base,
                },
            };

            if role.required {
                return Err(failure.into());
            }
            info!(
                agent_id = %agent.id,
                game_key = %profile.key,
                role = %role.key,
                reason = %failure,
                "optional port role left unallocated"
            );
        }
        Ok(Attempt::Planned(plan))
    }

    /// Returns the first port and how many consecutive ports the role takes.
    async fn resolve_role(
        &self,
        agent: &AgentRecord,
        role: &PortRole,
        plan: &Plan,
    ) -> Result<std::result::Result<(u16, u16), Unresolved>> {
        let picked = match &role.strategy {
            AllocationStrategy::PoolSingle { pool_tag } => self
                .pick_consecutive(agent, role.protocol, pool_tag, 1, plan)
                .await?
                .map(|port| (port, 1)),
            AllocationStrategy::PoolConsecutive { pool_tag, count } => self
                .pick_consecutive(agent, role.protocol, pool_tag, *count, plan)
                .await?
                .map(|port| (port, *count)),
            AllocationStrategy::FixedDefaultOrPool {
                pool_tag,
                default_port,
            } => {
                if self
                    .default_is_free(agent, role.protocol, *default_port, plan)
                    .await?
                {
                    Some((*default_port, 1))
                } else {
                    self.pick_consecutive(agent, role.protocol, pool_tag, 1, plan)
                        .await?
                        .map(|port| (port, 1))
                }
            }
            AllocationStrategy::DerivedOffset { from_role, offset } => {
                let Some(base) = plan.resolved.get(from_role) else {
                    return Ok(Err(Unresolved::BaseMissing(from_role.clone())));
                };
                let Some(port) = i32::from(*base)
                    .checked_add(*offset)
                    .and_then(|p| u16::try_from(p).ok())
                    .filter(|p| *p != 0)
                else {
                    return Ok(Err(Unresolved::Unavailable(format!(
                        "{base} offset by {offset} is not a valid port"
                    ))));
                };
                if plan.is_claimed(role.protocol, port) {
                    return Ok(Err(Unresolved::Unavailable(format!(
                        "derived port {port} is already claimed by another role"
                    ))));
                }
                if store::is_port_allocated(&self.db, &agent.id, role.protocol.as_str(), port).await? {
                    return Ok(Err(Unresolved::Taken(port)));
                }
                return Ok(Ok((port, 1)));
            }
        };

        Ok(picked.ok_or_else(|| {
            let tag = role.strategy.pool_tag().unwrap_or_default();
            Unresolved::Unavailable(format!("no free port in pools tagged {tag}"))
        }))
    }

    async fn default_is_free(
        &self,
        agent: &AgentRecord,
        protocol: Protocol,
        port: u16,
        plan: &Plan,
    ) -> Result<bool> {
        if port == 0 || plan.is_claimed(protocol, port) {
            return Ok(false);
        }
        if store::is_port_allocated(&self.db, &agent.id, protocol.as_str(), port).await? {
            return Ok(false);
        }
        let wanted = check(protocol, port);
        let report = self.liveness.check_free(agent, &[wanted.clone()]).await?;
        Ok(report.get(&wanted).copied().unwrap_or(false))
    }

    /// Scan the tagged pools low to high for `count` consecutive ports that
    /// are unrecorded and confirmed free by one batched node check.
    async fn pick_consecutive(
        &self,
        agent: &AgentRecord,
        protocol: Protocol,
        pool_tag: &str,
        count: u16,
        plan: &Plan,
    ) -> Result<Option<u16>> {
        let count = u32::from(count.max(1));
        for pool in store::list_enabled_pools_by_tag(&self.db, &agent.id, pool_tag).await? {
            let (start, end) = (u32::from(pool.start()), u32::from(pool.end()));
            let taken =
                store::allocated_ports_in_range(&self.db, &agent.id, protocol.as_str(), pool.start(), pool.end())
                    .await?;
            let unavailable =
                |port: u32| taken.contains(&(port as u16)) || plan.is_claimed(protocol, port as u16);

            let mut candidate = start;
            while candidate + count - 1 <= end {
                if let Some(blocked) = (candidate..candidate + count).rev().find(|p| unavailable(*p)) {
                    candidate = blocked + 1;
                    continue;
                }

                let checks: Vec<PortCheck> = (candidate..candidate + count)
                    .map(|p| check(protocol, p as u16))
                    .collect();
                let report = self.liveness.check_free(agent, &checks).await?;
                let busy = checks
                    .iter()
                    .rev()
                    .find(|c| !report.get(*c).copied().unwrap_or(false));
                match busy {
                    None => return Ok(Some(candidate as u16)),
                    Some(busy) => {
                        debug!(
                            agent_id = %agent.id,
                            port = busy.port,
                            proto = %busy.proto,
                            "port busy on node"
                        );
                        candidate = u32::from(busy.port) + 1;
                    }
                }
            }
        }
        Ok(None)
    }

    pub async fn allocations(&self, instance_id: &str) -> Result<Vec<PortAllocationRecord>> {
        store::list_allocations_for_instance(&self.db, instance_id).await
    }

    /// Drop every allocation held by the instance.
    pub async fn release_ports(&self, instance_id: &str) -> Result<u64> {
        if db::instances::get_instance(&self.db, instance_id)
            .await?
            .is_none()
        {
            return Err(AllocationError::InstanceNotFound(instance_id.to_string()).into());
        }
        let released = store::delete_allocations_for_instance(&self.db, instance_id).await?;
        info!(instance_id, released, "port allocations released");
        Ok(released)
    }
}

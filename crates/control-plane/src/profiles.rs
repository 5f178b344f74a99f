//! Game profile catalog.
//!
//! Profiles are plain records loaded from configuration. A profile may name a
//! parent through `inherits`; resolution walks the chain over an arena of
//! specs indexed by key, guarding against cycles with a visited set. Parent
//! roles come first, a child role with the same key replaces the parent's in
//! place, and new child roles are appended.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

pub const STRATEGY_POOL_SINGLE: &str = "pool_single";
pub const STRATEGY_POOL_CONSECUTIVE: &str = "pool_consecutive";
pub const STRATEGY_FIXED_DEFAULT_OR_POOL: &str = "fixed_default_or_pool";
pub const STRATEGY_DERIVED_OFFSET: &str = "derived_offset";

const MAX_DERIVED_OFFSET: i32 = u16::MAX as i32 - 1;

/// Profile as declared in configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GameProfileSpec {
    pub key: String,
    #[serde(default)]
    pub inherits: Option<String>,
    #[serde(default)]
    pub roles: Vec<PortRoleSpec>,
}

/// Port role as declared in configuration. Strategy parameters are optional
/// here and checked when the profile is resolved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRoleSpec {
    pub key: String,
    pub protocol: String,
    #[serde(default)]
    pub purpose: Option<String>,
    #[serde(default)]
    pub required: bool,
    pub strategy: String,
    #[serde(default)]
    pub pool_tag: Option<String>,
    #[serde(default)]
    pub count: Option<u16>,
    #[serde(default)]
    pub default_port: Option<u16>,
    #[serde(default)]
    pub from_role: Option<String>,
    #[serde(default)]
    pub offset: Option<i32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        }
    }

    fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "tcp" => Some(Protocol::Tcp),
            "udp" => Some(Protocol::Udp),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AllocationStrategy {
    PoolSingle { pool_tag: String },
    PoolConsecutive { pool_tag: String, count: u16 },
    FixedDefaultOrPool { pool_tag: String, default_port: u16 },
    DerivedOffset { from_role: String, offset: i32 },
}

impl AllocationStrategy {
    pub fn name(&self) -> &'static str {
        match self {
            AllocationStrategy::PoolSingle { .. } => STRATEGY_POOL_SINGLE,
            AllocationStrategy::PoolConsecutive { .. } => STRATEGY_POOL_CONSECUTIVE,
            AllocationStrategy::FixedDefaultOrPool { .. } => STRATEGY_FIXED_DEFAULT_OR_POOL,
            AllocationStrategy::DerivedOffset { .. } => STRATEGY_DERIVED_OFFSET,
        }
    }

    pub fn pool_tag(&self) -> Option<&str> {
        match self {
            AllocationStrategy::PoolSingle { pool_tag }
            | AllocationStrategy::PoolConsecutive { pool_tag, .. }
            | AllocationStrategy::FixedDefaultOrPool { pool_tag, .. } => Some(pool_tag),
            AllocationStrategy::DerivedOffset { .. } => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortRole {
    pub key: String,
    pub protocol: Protocol,
    pub purpose: Option<String>,
    pub required: bool,
    pub strategy: AllocationStrategy,
}

/// A profile with its inheritance chain flattened and every role validated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GameProfile {
    pub key: String,
    pub roles: Vec<PortRole>,
}

impl GameProfile {
    pub fn role(&self, key: &str) -> Option<&PortRole> {
        self.roles.iter().find(|r| r.key == key)
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ProfileError {
    #[error("game profile {0} is declared more than once")]
    DuplicateProfile(String),
    #[error("game profile {profile} inherits unknown profile {parent}")]
    UnknownParent { profile: String, parent: String },
    #[error("game profile inheritance cycle through {0}")]
    Cycle(String),
    #[error("game profile {profile} declares role {role} more than once")]
    DuplicateRole { profile: String, role: String },
    #[error("game profile {profile} role {role}: {reason}")]
    InvalidRole {
        profile: String,
        role: String,
        reason: String,
    },
}

#[derive(Debug, Clone, Default)]
pub struct GameProfileCatalog {
    profiles: HashMap<String, GameProfile>,
}

impl GameProfileCatalog {
    pub fn from_specs(specs: Vec<GameProfileSpec>) -> Result<Self, ProfileError> {
        let mut index: HashMap<String, usize> = HashMap::with_capacity(specs.len());
        for (idx, spec) in specs.iter().enumerate() {
            if index.insert(spec.key.clone(), idx).is_some() {
                return Err(ProfileError::DuplicateProfile(spec.key.clone()));
            }
            check_unique_role_keys(spec)?;
        }

        let mut profiles = HashMap::with_capacity(specs.len());
        for idx in 0..specs.len() {
            let chain = inheritance_chain(&specs, &index, idx)?;
            let merged = merge_roles(&specs, &chain);
            let key = specs[idx].key.clone();
            let roles = merged
                .into_iter()
                .map(|role| validate_role(&key, role))
                .collect::<Result<Vec<_>, _>>()?;
            check_derived_order(&key, &roles)?;
            profiles.insert(key.clone(), GameProfile { key, roles });
        }
        Ok(Self { profiles })
    }

    pub fn get(&self, key: &str) -> Option<&GameProfile> {
        self.profiles.get(key)
    }

    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }
}

fn check_unique_role_keys(spec: &GameProfileSpec) -> Result<(), ProfileError> {
    let mut seen = HashSet::new();
    for role in &spec.roles {
        if !seen.insert(role.key.as_str()) {
            return Err(ProfileError::DuplicateRole {
                profile: spec.key.clone(),
                role: role.key.clone(),
            });
        }
    }
    Ok(())
}

/// Indices from the root ancestor down to `start`.
fn inheritance_chain(
    specs: &[GameProfileSpec],
    index: &HashMap<String, usize>,
    start: usize,
) -> Result<Vec<usize>, ProfileError> {
    let mut visited = HashSet::new();
    let mut chain = Vec::new();
    let mut current = Some(start);
    while let Some(idx) = current {
        if !visited.insert(idx) {
            return Err(ProfileError::Cycle(specs[idx].key.clone()));
        }
        chain.push(idx);
        current = match specs[idx].inherits.as_deref() {
            None => None,
            Some(parent) => Some(*index.get(parent).ok_or_else(|| {
                ProfileError::UnknownParent {
                    profile: specs[idx].key.clone(),
                    parent: parent.to_string(),
                }
            })?),
        };
    }
    chain.reverse();
    Ok(chain)
}

fn merge_roles(specs: &[GameProfileSpec], chain: &[usize]) -> Vec<PortRoleSpec> {
    let mut merged: Vec<PortRoleSpec> = Vec::new();
    for &idx in chain {
        for role in &specs[idx].roles {
            match merged.iter_mut().find(|r| r.key == role.key) {
                Some(existing) => *existing = role.clone(),
                None => merged.push(role.clone()),
            }
        }
    }
    merged
}

fn validate_role(profile: &str, spec: PortRoleSpec) -> Result<PortRole, ProfileError> {
    let invalid = |reason: &str| ProfileError::InvalidRole {
        profile: profile.to_string(),
        role: spec.key.clone(),
        reason: reason.to_string(),
    };

    if spec.key.trim().is_empty() {
        return Err(invalid("role key cannot be empty"));
    }
    let protocol =
        Protocol::parse(&spec.protocol).ok_or_else(|| invalid("protocol must be tcp or udp"))?;
    let pool_tag = || {
        spec.pool_tag
            .clone()
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| invalid("pool_tag is required for pool strategies"))
    };

    let strategy = match spec.strategy.as_str() {
        STRATEGY_POOL_SINGLE => AllocationStrategy::PoolSingle {
            pool_tag: pool_tag()?,
        },
        STRATEGY_POOL_CONSECUTIVE => {
            let count = spec.count.unwrap_or(0);
            if count == 0 {
                return Err(invalid("count must be at least 1"));
            }
            AllocationStrategy::PoolConsecutive {
                pool_tag: pool_tag()?,
                count,
            }
        }
        STRATEGY_FIXED_DEFAULT_OR_POOL => AllocationStrategy::FixedDefaultOrPool {
            pool_tag: pool_tag()?,
            default_port: spec.default_port.unwrap_or(0),
        },
        STRATEGY_DERIVED_OFFSET => {
            let from_role = spec
                .from_role
                .clone()
                .filter(|r| !r.trim().is_empty())
                .ok_or_else(|| invalid("from_role is required for derived_offset"))?;
            if from_role == spec.key {
                return Err(invalid("derived role cannot reference itself"));
            }
            let offset = spec.offset.unwrap_or(0);
            // Any base is in 1..=65535, so larger offsets can never land on a port.
            if !(-MAX_DERIVED_OFFSET..=MAX_DERIVED_OFFSET).contains(&offset) {
                return Err(invalid(&format!(
                    "offset must be between -{MAX_DERIVED_OFFSET} and {MAX_DERIVED_OFFSET}"
                )));
            }
            AllocationStrategy::DerivedOffset { from_role, offset }
        }
        other => return Err(invalid(&format!("unknown strategy {other}"))),
    };

    Ok(PortRole {
        key: spec.key,
        protocol,
        purpose: spec.purpose,
        required: spec.required,
        strategy,
    })
}

/// Derived roles must reference a role declared earlier in the resolved list.
fn check_derived_order(profile: &str, roles: &[PortRole]) -> Result<(), ProfileError> {
    for (pos, role) in roles.iter().enumerate() {
        if let AllocationStrategy::DerivedOffset { from_role, .. } = &role.strategy
            && !roles[..pos].iter().any(|r| &r.key == from_role)
        {
            return Err(ProfileError::InvalidRole {
                profile: profile.to_string(),
                role: role.key.clone(),
                reason: format!("from_role {from_role} must be declared before this role"),
            });
        }
    }
    Ok(())
}

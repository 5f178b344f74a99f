//! Shared types for the agent control plane workspace.
//!
//! Keep the agent-facing wire format and the request signing scheme here so the
//! control plane and anything speaking to it agree on a single definition.

#![warn(missing_docs)]

/// Shared API DTOs for cross-crate use.
pub mod api;
/// Canonical request signing shared by agents and the control plane.
pub mod signing;

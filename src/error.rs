//! # Errors
//!
//! Configuration and registry failures. None of them is fatal: the simulation
//! logs them and degrades to a no-op, so callers may ignore the `Result`.

use crate::structs::AgentId;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("max_thread_count must be at least 1, got {0}")]
    InvalidThreadCount(usize),

    #[error("update_rate must be finite and within [0.001, 1000] ticks/s, got {0}")]
    InvalidUpdateRate(f64),

    #[error("preferred_velocity_jitter must be finite and non-negative, got {0}")]
    InvalidJitter(f64),
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum RegistryError {
    #[error("{0} is already registered")]
    AlreadyRegistered(AgentId),

    #[error("{0} is not registered")]
    NotRegistered(AgentId),

    #[error("invalid parameters for {id}: {reason}")]
    InvalidParams { id: AgentId, reason: &'static str },
}

/// A policy name that matches no variant.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown {kind} policy '{name}'")]
pub struct ParsePolicyError {
    pub kind: &'static str,
    pub name: String,
}

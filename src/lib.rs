//! # ORCA Avoidance
//!
//! Real-time 3D collision avoidance for many independently moving agents,
//! based on Optimal Reciprocal Collision Avoidance.
//!
//! ## Pipeline
//!
//! Each tick the [`Simulation`] pulls position, velocity and preferred
//! velocity from every registered host agent, rebuilds a kd-tree over the
//! snapshot, and hands contiguous slices of agents to a worker pool. For each
//! agent a worker:
//!
//! 1. Collects the nearest neighbors within range (`neighbors`).
//! 2. Turns every neighbor into a half-space constraint on velocity (`orca`).
//! 3. Solves the resulting 3D linear program, falling back to the least
//!    violating velocity when the constraints are infeasible.
//!
//! The solved velocities are published back to the hosts once all workers
//! report in.
//!
//! ## Modules
//!
//! - `structs`: vector math, planes, lines and the agent data model
//! - `kdtree`: arena-backed spatial index over agent positions
//! - `neighbors`: bounded nearest-neighbor collection
//! - `orca`: constraint construction and the linear program cascade
//! - `scheduler`: persistent worker pool splitting a tick across threads
//! - `simulation`: registry, tick loop and velocity publication
//! - `agent`: the host-side `OrcaAgent` trait and a ready-made implementation
//! - `config` / `error`: configuration and error types
//!
//! Python bindings are available behind the `python` feature.

pub mod agent;
pub mod config;
pub mod error;
pub mod kdtree;
pub mod neighbors;
pub mod orca;
pub mod scheduler;
pub mod simulation;
pub mod structs;

#[cfg(feature = "python")]
mod python;

pub use agent::{OrcaAgent, SharedAgent};
pub use config::{SimulationConfig, TickClock};
pub use error::{ConfigError, ParsePolicyError, RegistryError};
pub use kdtree::KdTree;
pub use orca::{compute_new_velocity, SolverScratch};
pub use simulation::Simulation;
pub use structs::{AgentCategory, AgentId, AgentParams, AgentState, DodgePolicy, Plane, Vector3D, WeightPolicy};

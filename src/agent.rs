//! # Host Agent Interface
//!
//! The simulation never owns host objects. Each registered agent is reached
//! through an `OrcaAgent` handle: once per tick the simulation pulls the
//! kinematic state and, after solving, publishes the optimized velocity back.
//! Applying that velocity to the host's own motion is the host's job.

use crate::structs::Vector3D;
use std::sync::{Mutex, MutexGuard};

/// Capability set the simulation needs from a host-side agent.
///
/// Calls happen on the thread calling `Simulation::tick` while the simulation
/// is locked, never from solver workers. Implementations must not call back
/// into the `Simulation`.
pub trait OrcaAgent: Send + Sync {
    fn position(&self) -> Vector3D;

    fn velocity(&self) -> Vector3D;

    /// Velocity the agent would take with nobody around.
    fn preferred_velocity(&self) -> Vector3D;

    /// Receives the collision-free velocity computed this tick. Only finite
    /// values are ever published.
    fn publish_optimized_velocity(&self, velocity: Vector3D);
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
struct SharedAgentState {
    position: Vector3D,
    velocity: Vector3D,
    preferred_velocity: Vector3D,
    optimized_velocity: Option<Vector3D>,
}

/// Ready-made `OrcaAgent` for hosts that push state in rather than compute it
/// on demand. Wrap it in an `Arc` and keep a clone on the host side.
#[derive(Debug, Default)]
pub struct SharedAgent {
    state: Mutex<SharedAgentState>,
}

impl SharedAgent {
    pub fn new(position: Vector3D, velocity: Vector3D, preferred_velocity: Vector3D) -> Self {
        SharedAgent {
            state: Mutex::new(SharedAgentState {
                position,
                velocity,
                preferred_velocity,
                optimized_velocity: None,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SharedAgentState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn set_position(&self, position: Vector3D) {
        self.lock().position = position;
    }

    pub fn set_velocity(&self, velocity: Vector3D) {
        self.lock().velocity = velocity;
    }

    pub fn set_preferred_velocity(&self, preferred_velocity: Vector3D) {
        self.lock().preferred_velocity = preferred_velocity;
    }

    /// Last velocity published by the simulation, if any.
    pub fn optimized_velocity(&self) -> Option<Vector3D> {
        self.lock().optimized_velocity
    }

    /// Moves the agent by `dt` seconds with its optimized velocity (or its
    /// current one before the first publication) and adopts that velocity.
    pub fn integrate(&self, dt: f64) {
        let mut state = self.lock();
        let velocity = state.optimized_velocity.unwrap_or(state.velocity);
        state.velocity = velocity;
        state.position += velocity * dt;
    }
}

impl OrcaAgent for SharedAgent {
    fn position(&self) -> Vector3D {
        self.lock().position
    }

    fn velocity(&self) -> Vector3D {
        self.lock().velocity
    }

    fn preferred_velocity(&self) -> Vector3D {
        self.lock().preferred_velocity
    }

    fn publish_optimized_velocity(&self, velocity: Vector3D) {
        self.lock().optimized_velocity = Some(velocity);
    }
}

//! # Simulation Configuration
//!
//! Startup settings owned by the host: worker-pool size, tick pacing and the
//! preferred-velocity jitter used for symmetry breaking. Read once when the
//! `Simulation` is constructed.

use crate::error::ConfigError;
use log::warn;
use serde::{Deserialize, Serialize};

pub const MIN_UPDATE_RATE: f64 = 0.001;
pub const MAX_UPDATE_RATE: f64 = 1000.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    /// Upper bound on solving threads, coordinator included.
    pub max_thread_count: usize,
    /// Ticks per second, for hosts pacing through `TickClock`.
    pub update_rate: f64,
    /// Radius of the random perturbation added to every preferred velocity.
    /// Zero disables it.
    pub preferred_velocity_jitter: f64,
    pub seed: u64,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        SimulationConfig {
            max_thread_count: 4,
            update_rate: 30.0,
            preferred_velocity_jitter: 1e-5,
            seed: 0,
        }
    }
}

impl SimulationConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_thread_count < 1 {
            return Err(ConfigError::InvalidThreadCount(self.max_thread_count));
        }
        self.validate_update_rate()?;
        if !(self.preferred_velocity_jitter.is_finite() && self.preferred_velocity_jitter >= 0.0) {
            return Err(ConfigError::InvalidJitter(self.preferred_velocity_jitter));
        }
        Ok(())
    }

    fn validate_update_rate(&self) -> Result<(), ConfigError> {
        if self.update_rate.is_finite() && (MIN_UPDATE_RATE..=MAX_UPDATE_RATE).contains(&self.update_rate) {
            Ok(())
        } else {
            Err(ConfigError::InvalidUpdateRate(self.update_rate))
        }
    }

    /// Worker threads to run: the configured maximum capped by the hardware,
    /// never less than one.
    pub fn effective_thread_count(&self) -> usize {
        let hardware = std::thread::available_parallelism().map_or(1, |n| n.get());
        self.max_thread_count.min(hardware).max(1)
    }

    /// Pacing helper for this config's update rate. An invalid rate is logged
    /// and yields a clock that never fires.
    pub fn tick_clock(&self) -> TickClock {
        match self.validate_update_rate() {
            Ok(()) => TickClock {
                step: Some(1.0 / self.update_rate),
                timer: 0.0,
            },
            Err(err) => {
                warn!("{}; ticking disabled", err);
                TickClock { step: None, timer: 0.0 }
            }
        }
    }
}

/// Accumulates host frame time and reports when the next tick is due.
#[derive(Debug, Clone, PartialEq)]
pub struct TickClock {
    step: Option<f64>,
    timer: f64,
}

impl TickClock {
    /// Seconds between ticks, `None` if the clock is disabled.
    pub fn step(&self) -> Option<f64> {
        self.step
    }

    /// Adds `dt` seconds. Returns true at most once per call when a full step
    /// has elapsed, and restarts the accumulator.
    pub fn advance(&mut self, dt: f64) -> bool {
        let Some(step) = self.step else {
            return false;
        };
        if dt.is_finite() && dt > 0.0 {
            self.timer += dt;
        }
        if self.timer >= step {
            self.timer = 0.0;
            true
        } else {
            false
        }
    }
}

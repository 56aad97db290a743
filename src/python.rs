//! # Python Bindings
//!
//! PyO3 wrappers exposing the simulation to a Python host. Vectors cross the
//! boundary as `(x, y, z)` tuples.
//!
//! ```python
//! import orca_avoidance as orca
//!
//! sim = orca.Simulation(max_thread_count=4)
//! a = orca.Agent((0.0, 0.0, 0.0), preferred_velocity=(1.0, 0.0, 0.0))
//! sim.register(1, a, radius=0.5, dodge_policy="fixed", dodge_weight=0.5)
//! sim.tick()
//! a.integrate(1.0 / 30.0)
//! ```

use crate::agent::{OrcaAgent, SharedAgent};
use crate::config::SimulationConfig;
use crate::simulation::Simulation;
use crate::structs::{AgentId, AgentParams, DodgePolicy, WeightPolicy};
use pyo3::exceptions::PyValueError;
use pyo3::prelude::*;
use std::sync::Arc;

type Vec3 = (f64, f64, f64);

/// Host-side agent handle; state is pushed in from Python.
#[pyclass(name = "Agent")]
pub struct PyAgent {
    inner: Arc<SharedAgent>,
}

#[pymethods]
impl PyAgent {
    #[new]
    #[pyo3(signature = (position, velocity = (0.0, 0.0, 0.0), preferred_velocity = (0.0, 0.0, 0.0)))]
    fn new(position: Vec3, velocity: Vec3, preferred_velocity: Vec3) -> Self {
        PyAgent {
            inner: Arc::new(SharedAgent::new(position.into(), velocity.into(), preferred_velocity.into())),
        }
    }

    #[getter]
    fn position(&self) -> Vec3 {
        self.inner.position().into()
    }

    #[setter]
    fn set_position(&self, position: Vec3) {
        self.inner.set_position(position.into());
    }

    #[getter]
    fn velocity(&self) -> Vec3 {
        self.inner.velocity().into()
    }

    #[setter]
    fn set_velocity(&self, velocity: Vec3) {
        self.inner.set_velocity(velocity.into());
    }

    #[getter]
    fn preferred_velocity(&self) -> Vec3 {
        self.inner.preferred_velocity().into()
    }

    #[setter]
    fn set_preferred_velocity(&self, preferred_velocity: Vec3) {
        self.inner.set_preferred_velocity(preferred_velocity.into());
    }

    /// Last velocity published by the simulation, or None.
    #[getter]
    fn optimized_velocity(&self) -> Option<Vec3> {
        self.inner.optimized_velocity().map(Vec3::from)
    }

    fn integrate(&self, dt: f64) {
        self.inner.integrate(dt);
    }

    fn __repr__(&self) -> String {
        format!(
            "Agent(position={}, velocity={})",
            self.inner.position(),
            self.inner.velocity()
        )
    }
}

#[pyclass(name = "Simulation")]
pub struct PySimulation {
    inner: Simulation,
}

#[pymethods]
impl PySimulation {
    #[new]
    #[pyo3(signature = (max_thread_count = 4, update_rate = 30.0, preferred_velocity_jitter = 1e-5, seed = 0))]
    fn new(max_thread_count: usize, update_rate: f64, preferred_velocity_jitter: f64, seed: u64) -> Self {
        PySimulation {
            inner: Simulation::new(SimulationConfig {
                max_thread_count,
                update_rate,
                preferred_velocity_jitter,
                seed,
            }),
        }
    }

    /// Registers `agent` under `id`. Unset parameters keep their defaults.
    ///
    /// Policies are given by name: `weight_policy` is `"fixed"` or
    /// `"linear_interpolation"`, `dodge_policy` one of `"treat_as_reciprocal"`,
    /// `"none"`, `"fixed"` or `"standard"`.
    #[pyo3(signature = (
        id,
        agent,
        *,
        one_sided = false,
        radius = None,
        max_speed = None,
        max_neighbors = None,
        neighbor_dist = None,
        projectile_dist = None,
        time_horizon = None,
        weight_policy = None,
        weight = None,
        projectile_weight = None,
        dodge_policy = None,
        dodge_weight = None
    ))]
    #[allow(clippy::too_many_arguments)]
    fn register(
        &self,
        id: u64,
        agent: PyRef<'_, PyAgent>,
        one_sided: bool,
        radius: Option<f64>,
        max_speed: Option<f64>,
        max_neighbors: Option<usize>,
        neighbor_dist: Option<f64>,
        projectile_dist: Option<f64>,
        time_horizon: Option<f64>,
        weight_policy: Option<&str>,
        weight: Option<f64>,
        projectile_weight: Option<f64>,
        dodge_policy: Option<&str>,
        dodge_weight: Option<f64>,
    ) -> PyResult<()> {
        let defaults = if one_sided {
            AgentParams::one_sided()
        } else {
            AgentParams::default()
        };
        let weight_policy = match weight_policy {
            Some(name) => name.parse::<WeightPolicy>().map_err(|err| PyValueError::new_err(err.to_string()))?,
            None => defaults.weight_policy,
        };
        let dodge_policy = match dodge_policy {
            Some(name) => name.parse::<DodgePolicy>().map_err(|err| PyValueError::new_err(err.to_string()))?,
            None => defaults.dodge_policy,
        };
        let params = AgentParams {
            radius: radius.unwrap_or(defaults.radius),
            max_speed: max_speed.unwrap_or(defaults.max_speed),
            max_neighbors: max_neighbors.unwrap_or(defaults.max_neighbors),
            neighbor_dist: neighbor_dist.unwrap_or(defaults.neighbor_dist),
            projectile_dist: projectile_dist.unwrap_or(defaults.projectile_dist),
            time_horizon: time_horizon.unwrap_or(defaults.time_horizon),
            weight_policy,
            weight: weight.unwrap_or(defaults.weight),
            projectile_weight: projectile_weight.unwrap_or(defaults.projectile_weight),
            dodge_policy,
            dodge_weight: dodge_weight.unwrap_or(defaults.dodge_weight),
            ..defaults
        };
        let handle: Arc<dyn OrcaAgent> = agent.inner.clone();
        self.inner
            .register(AgentId(id), params, handle)
            .map_err(|err| PyValueError::new_err(err.to_string()))
    }

    fn unregister(&self, id: u64) -> PyResult<()> {
        self.inner
            .unregister(AgentId(id))
            .map_err(|err| PyValueError::new_err(err.to_string()))
    }

    /// Runs one tick with the GIL released.
    fn tick(&self, py: Python<'_>) {
        py.allow_threads(|| self.inner.tick());
    }

    fn agent_count(&self) -> usize {
        self.inner.agent_count()
    }

    fn optimized_velocity(&self, id: u64) -> Option<Vec3> {
        self.inner.optimized_velocity(AgentId(id)).map(Vec3::from)
    }

    fn worker_count(&self) -> usize {
        self.inner.worker_count()
    }

    fn is_enabled(&self) -> bool {
        self.inner.is_enabled()
    }
}

#[pymodule]
fn orca_avoidance(m: &Bound<'_, PyModule>) -> PyResult<()> {
    m.add_class::<PyAgent>()?;
    m.add_class::<PySimulation>()?;
    m.add("COLLISION_TIME_STEP", crate::orca::COLLISION_TIME_STEP)?;
    Ok(())
}

//! # Simulation
//!
//! Entry point for hosts. Owns the roster of registered agents, the worker
//! pool and the per-tick frame, all behind a single mutex, so a tick never
//! interleaves with a registration change.
//!
//! ## Tick
//!
//! 1. **Rebuild**: fold pending registrations into the roster, pull every
//!    agent's state from its host handle, rebuild the kd-tree
//! 2. **Compute**: solve Reciprocal agents across the pool
//! 3. **Barrier**: wait for every worker
//! 4. **Publish**: hand finite velocities back to the host handles
//!
//! Registration changes made between ticks take effect at the next Rebuild;
//! until then `agent_count` reports the previous roster.

use crate::agent::OrcaAgent;
use crate::config::{SimulationConfig, TickClock};
use crate::error::{ConfigError, RegistryError};
use crate::scheduler::{TickFrame, WorkerPool};
use crate::structs::{AgentCategory, AgentId, AgentParams, AgentState, Vector3D};
use log::{debug, warn};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha12Rng;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

struct Registration {
    params: AgentParams,
    handle: Arc<dyn OrcaAgent>,
    optimized_velocity: Option<Vector3D>,
}

struct SimulationInner {
    /// Every registered agent, updated immediately.
    registry: BTreeMap<AgentId, Registration>,
    /// Agents solved by the current tick, in id order. Refreshed from
    /// `registry` at the start of a tick when `dirty` is set.
    roster: Vec<AgentId>,
    dirty: bool,
    frame: TickFrame,
    /// `None` when the configuration disabled ticking.
    pool: Option<WorkerPool>,
    rng: ChaCha12Rng,
    jitter: f64,
}

pub struct Simulation {
    config: SimulationConfig,
    inner: Mutex<SimulationInner>,
}

impl Simulation {
    /// Creates the simulation and starts its worker threads.
    ///
    /// Configuration problems are logged, never fatal: an invalid thread count
    /// disables ticking, an invalid jitter disables the perturbation, and an
    /// invalid update rate only affects `tick_clock`.
    pub fn new(config: SimulationConfig) -> Self {
        let mut jitter = config.preferred_velocity_jitter;
        let mut enabled = true;

        if let Err(err) = config.validate() {
            match err {
                ConfigError::InvalidThreadCount(_) => {
                    warn!("{}; simulation disabled", err);
                    enabled = false;
                }
                ConfigError::InvalidJitter(_) => {
                    warn!("{}; preferred velocity jitter disabled", err);
                    jitter = 0.0;
                }
                ConfigError::InvalidUpdateRate(_) => {
                    warn!("{}; host tick pacing disabled", err);
                }
            }
        }
        // validate() stops at the first problem; re-check the jitter on its own
        if !(jitter.is_finite() && jitter >= 0.0) {
            warn!("{}; preferred velocity jitter disabled", ConfigError::InvalidJitter(jitter));
            jitter = 0.0;
        }

        let pool = enabled.then(|| WorkerPool::new(config.effective_thread_count()));
        let rng = ChaCha12Rng::seed_from_u64(config.seed);

        Simulation {
            config,
            inner: Mutex::new(SimulationInner {
                registry: BTreeMap::new(),
                roster: Vec::new(),
                dirty: false,
                frame: TickFrame::new(),
                pool,
                rng,
                jitter,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SimulationInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn config(&self) -> &SimulationConfig {
        &self.config
    }

    /// Pacing helper for hosts that drive `tick` from a frame loop.
    pub fn tick_clock(&self) -> TickClock {
        self.config.tick_clock()
    }

    /// Adds an agent. Takes effect at the next tick.
    pub fn register(&self, id: AgentId, params: AgentParams, handle: Arc<dyn OrcaAgent>) -> Result<(), RegistryError> {
        if let Err(reason) = params.validate() {
            warn!("refusing to register {}: {}", id, reason);
            return Err(RegistryError::InvalidParams { id, reason });
        }

        let mut inner = self.lock();
        if inner.registry.contains_key(&id) {
            warn!("{} is already registered; ignoring", id);
            return Err(RegistryError::AlreadyRegistered(id));
        }
        inner.registry.insert(
            id,
            Registration {
                params,
                handle,
                optimized_velocity: None,
            },
        );
        inner.dirty = true;
        Ok(())
    }

    /// Removes an agent. Takes effect at the next tick.
    pub fn unregister(&self, id: AgentId) -> Result<(), RegistryError> {
        let mut inner = self.lock();
        if inner.registry.remove(&id).is_none() {
            debug!("{} is not registered; nothing to remove", id);
            return Err(RegistryError::NotRegistered(id));
        }
        inner.dirty = true;
        Ok(())
    }

    /// Agents in the current roster, i.e. as of the last tick.
    pub fn agent_count(&self) -> usize {
        self.lock().roster.len()
    }

    pub fn is_registered(&self, id: AgentId) -> bool {
        self.lock().registry.contains_key(&id)
    }

    /// Last finite velocity published to `id`.
    pub fn optimized_velocity(&self, id: AgentId) -> Option<Vector3D> {
        self.lock().registry.get(&id).and_then(|r| r.optimized_velocity)
    }

    /// Solving threads, coordinator included; 0 when disabled.
    pub fn worker_count(&self) -> usize {
        self.lock().pool.as_ref().map_or(0, |pool| pool.thread_count())
    }

    pub fn is_enabled(&self) -> bool {
        self.lock().pool.is_some()
    }

    /// Runs one Rebuild, Compute, Barrier, Publish cycle.
    pub fn tick(&self) {
        let mut guard = self.lock();
        let SimulationInner {
            registry,
            roster,
            dirty,
            frame,
            pool,
            rng,
            jitter,
        } = &mut *guard;

        let Some(pool) = pool.as_mut() else {
            warn!("tick on a disabled simulation; skipping");
            return;
        };

        // Rebuild
        if *dirty {
            let old_count = roster.len();
            roster.clear();
            roster.extend(registry.keys().copied());
            *dirty = false;
            debug!("roster rebuilt: {} -> {} agents", old_count, roster.len());
        }

        if roster.is_empty() {
            debug!("tick with zero agents; skipping");
            return;
        }

        frame.agents.clear();
        for id in roster.iter() {
            let Some(registration) = registry.get(id) else {
                continue;
            };
            let handle = &registration.handle;
            let preferred = perturb(handle.preferred_velocity(), *jitter, rng);
            frame.agents.push(AgentState::new(
                *id,
                registration.params,
                handle.position(),
                handle.velocity(),
                preferred,
            ));
        }
        frame.rebuild_index();

        // Compute + Barrier
        let (solved_frame, results) = pool.run_tick(std::mem::take(frame));
        *frame = solved_frame;

        // Publish
        for (agent, result) in frame.agents.iter().zip(results) {
            let Some(velocity) = result else {
                continue;
            };
            if agent.category() == AgentCategory::OneSided {
                continue;
            }
            let Some(registration) = registry.get_mut(&agent.id) else {
                continue;
            };
            if velocity.is_finite() {
                registration.optimized_velocity = Some(velocity);
                registration.handle.publish_optimized_velocity(velocity);
            } else {
                warn!(
                    "{}: optimized velocity {} is not finite; keeping the previous one. \
                     The situation may be unsolvable; consider a larger time_horizon or neighbor_dist",
                    agent.id,
                    velocity
                );
            }
        }
    }
}

/// Adds a uniform random offset from the ball of radius `jitter`.
fn perturb(velocity: Vector3D, jitter: f64, rng: &mut ChaCha12Rng) -> Vector3D {
    if jitter <= 0.0 {
        return velocity;
    }
    loop {
        let offset = Vector3D::new(
            rng.random_range(-1.0..=1.0),
            rng.random_range(-1.0..=1.0),
            rng.random_range(-1.0..=1.0),
        );
        if offset.magnitude_squared() <= 1.0 {
            return velocity + offset * jitter;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::SharedAgent;
    use approx::{assert_abs_diff_eq, assert_relative_eq};

    fn quiet_config(threads: usize) -> SimulationConfig {
        SimulationConfig {
            max_thread_count: threads,
            preferred_velocity_jitter: 0.0,
            ..SimulationConfig::default()
        }
    }

    fn shared(position: Vector3D, velocity: Vector3D, pref: Vector3D) -> Arc<SharedAgent> {
        Arc::new(SharedAgent::new(position, velocity, pref))
    }

    // ==================== Registration Tests ====================

    #[test]
    fn test_register_takes_effect_next_tick() {
        let sim = Simulation::new(quiet_config(2));
        let agent = shared(Vector3D::ZERO, Vector3D::ZERO, Vector3D::ZERO);
        assert!(sim.register(AgentId(1), AgentParams::default(), agent).is_ok());
        assert!(sim.is_registered(AgentId(1)));
        assert_eq!(sim.agent_count(), 0);
        sim.tick();
        assert_eq!(sim.agent_count(), 1);
    }

    #[test]
    fn test_register_duplicate_is_rejected() {
        let sim = Simulation::new(quiet_config(1));
        let agent = shared(Vector3D::ZERO, Vector3D::ZERO, Vector3D::ZERO);
        sim.register(AgentId(1), AgentParams::default(), agent.clone()).unwrap();
        assert_eq!(
            sim.register(AgentId(1), AgentParams::default(), agent),
            Err(RegistryError::AlreadyRegistered(AgentId(1)))
        );
        sim.tick();
        assert_eq!(sim.agent_count(), 1);
    }

    #[test]
    fn test_register_invalid_params_is_rejected() {
        let sim = Simulation::new(quiet_config(1));
        let params = AgentParams {
            time_horizon: -1.0,
            ..AgentParams::default()
        };
        let result = sim.register(AgentId(5), params, shared(Vector3D::ZERO, Vector3D::ZERO, Vector3D::ZERO));
        assert!(matches!(result, Err(RegistryError::InvalidParams { id: AgentId(5), .. })));
        assert!(!sim.is_registered(AgentId(5)));
    }

    #[test]
    fn test_unregister_absent_is_noop() {
        let sim = Simulation::new(quiet_config(1));
        assert_eq!(sim.unregister(AgentId(3)), Err(RegistryError::NotRegistered(AgentId(3))));
        sim.tick();
        assert_eq!(sim.agent_count(), 0);
    }

    #[test]
    fn test_unregister_takes_effect_next_tick() {
        let sim = Simulation::new(quiet_config(2));
        let a = shared(Vector3D::ZERO, Vector3D::ZERO, Vector3D::new(1.0, 0.0, 0.0));
        let b = shared(Vector3D::new(50.0, 0.0, 0.0), Vector3D::ZERO, Vector3D::ZERO);
        sim.register(AgentId(1), AgentParams::default(), a).unwrap();
        sim.register(AgentId(2), AgentParams::default(), b).unwrap();
        sim.tick();
        assert_eq!(sim.agent_count(), 2);

        sim.unregister(AgentId(1)).unwrap();
        assert!(!sim.is_registered(AgentId(1)));
        assert_eq!(sim.agent_count(), 2);
        sim.tick();
        assert_eq!(sim.agent_count(), 1);
        assert_eq!(sim.optimized_velocity(AgentId(1)), None);
    }

    #[test]
    fn test_reregister_after_unregister() {
        let sim = Simulation::new(quiet_config(1));
        let agent = shared(Vector3D::ZERO, Vector3D::ZERO, Vector3D::new(2.0, 0.0, 0.0));
        sim.register(AgentId(1), AgentParams::default(), agent.clone()).unwrap();
        sim.unregister(AgentId(1)).unwrap();
        sim.register(AgentId(1), AgentParams::default(), agent).unwrap();
        sim.tick();
        assert_eq!(sim.agent_count(), 1);
        assert_eq!(sim.optimized_velocity(AgentId(1)), Some(Vector3D::new(2.0, 0.0, 0.0)));
    }

    // ==================== Configuration Tests ====================

    #[test]
    fn test_invalid_thread_count_disables_ticking() {
        let sim = Simulation::new(quiet_config(0));
        assert!(!sim.is_enabled());
        assert_eq!(sim.worker_count(), 0);

        let agent = shared(Vector3D::ZERO, Vector3D::ZERO, Vector3D::new(1.0, 0.0, 0.0));
        sim.register(AgentId(1), AgentParams::default(), agent.clone()).unwrap();
        sim.tick();
        assert_eq!(agent.optimized_velocity(), None);
        assert_eq!(sim.agent_count(), 0);
    }

    #[test]
    fn test_invalid_jitter_is_disabled() {
        let config = SimulationConfig {
            preferred_velocity_jitter: f64::NAN,
            ..SimulationConfig::default()
        };
        let sim = Simulation::new(config);
        assert!(sim.is_enabled());
        let agent = shared(Vector3D::ZERO, Vector3D::ZERO, Vector3D::new(1.0, 0.0, 0.0));
        sim.register(AgentId(1), AgentParams::default(), agent.clone()).unwrap();
        sim.tick();
        assert_eq!(agent.optimized_velocity(), Some(Vector3D::new(1.0, 0.0, 0.0)));
    }

    #[test]
    fn test_worker_count_is_bounded_by_config() {
        let sim = Simulation::new(quiet_config(1));
        assert_eq!(sim.worker_count(), 1);
        let sim = Simulation::new(quiet_config(64));
        assert!(sim.worker_count() >= 1 && sim.worker_count() <= 64);
    }

    #[test]
    fn test_tick_with_zero_agents() {
        let sim = Simulation::new(quiet_config(4));
        sim.tick();
        sim.tick();
        assert_eq!(sim.agent_count(), 0);
    }

    #[test]
    fn test_tick_clock_follows_config() {
        let sim = Simulation::new(SimulationConfig {
            update_rate: 20.0,
            ..quiet_config(1)
        });
        let mut clock = sim.tick_clock();
        assert!(!clock.advance(0.01));
        assert!(clock.advance(0.05));
    }

    // ==================== Scenario Tests ====================

    #[test]
    fn test_single_agent_gets_clamped_preferred_velocity() {
        let sim = Simulation::new(quiet_config(2));
        let agent = shared(Vector3D::ZERO, Vector3D::ZERO, Vector3D::new(30.0, 40.0, 0.0));
        sim.register(AgentId(7), AgentParams::default(), agent.clone()).unwrap();
        sim.tick();

        let v = agent.optimized_velocity().unwrap_or(Vector3D::ZERO);
        assert_relative_eq!(v.x, 6.0, epsilon = 1e-12);
        assert_relative_eq!(v.y, 8.0, epsilon = 1e-12);
        assert_eq!(sim.optimized_velocity(AgentId(7)), Some(v));
    }

    #[test]
    fn test_one_sided_agent_is_never_published() {
        let sim = Simulation::new(quiet_config(2));
        let walker = shared(Vector3D::ZERO, Vector3D::new(1.0, 0.0, 0.0), Vector3D::new(1.0, 0.0, 0.0));
        let projectile = shared(Vector3D::new(5.0, 0.1, 0.0), Vector3D::new(-4.0, 0.0, 0.0), Vector3D::new(-4.0, 0.0, 0.0));
        sim.register(AgentId(1), AgentParams::default(), walker.clone()).unwrap();
        sim.register(AgentId(2), AgentParams::one_sided(), projectile.clone()).unwrap();

        sim.tick();
        assert_eq!(projectile.optimized_velocity(), None);
        assert_eq!(sim.optimized_velocity(AgentId(2)), None);

        // The walker dodges the incoming projectile
        let v = walker.optimized_velocity().unwrap_or(Vector3D::ZERO);
        assert!(v.is_finite());
        assert!((v - Vector3D::new(1.0, 0.0, 0.0)).magnitude() > 1e-3, "walker ignored the projectile: {}", v);
    }

    #[test]
    fn test_head_on_agents_get_mirrored_velocities() {
        let sim = Simulation::new(quiet_config(2));
        let params = AgentParams {
            radius: 0.5,
            time_horizon: 10.0,
            ..AgentParams::default()
        };
        let position = Vector3D::new(-5.0, -0.1, 0.0);
        let velocity = Vector3D::new(1.0, 0.0, 0.0);
        let a = shared(position, velocity, velocity);
        let b = shared(-position, -velocity, -velocity);
        sim.register(AgentId(1), params, a.clone()).unwrap();
        sim.register(AgentId(2), params, b.clone()).unwrap();
        sim.tick();

        let va = a.optimized_velocity().unwrap_or(Vector3D::ZERO);
        let vb = b.optimized_velocity().unwrap_or(Vector3D::ZERO);
        assert!(va.y.abs() > 1e-3, "expected a lateral dodge, got {}", va);
        assert_abs_diff_eq!(va.x, -vb.x, epsilon = 1e-9);
        assert_abs_diff_eq!(va.y, -vb.y, epsilon = 1e-9);
        assert_abs_diff_eq!(va.z, -vb.z, epsilon = 1e-9);
    }

    #[test]
    fn test_overlapping_agents_separate() {
        let sim = Simulation::new(quiet_config(2));
        let params = AgentParams {
            radius: 0.5,
            ..AgentParams::default()
        };
        let a = shared(Vector3D::ZERO, Vector3D::ZERO, Vector3D::ZERO);
        let b = shared(Vector3D::new(0.6, 0.0, 0.0), Vector3D::ZERO, Vector3D::ZERO);
        sim.register(AgentId(1), params, a.clone()).unwrap();
        sim.register(AgentId(2), params, b.clone()).unwrap();

        let mut previous = (b.position() - a.position()).magnitude();
        for _ in 0..3 {
            sim.tick();
            a.integrate(0.1);
            b.integrate(0.1);
            let gap = (b.position() - a.position()).magnitude();
            assert!(gap > previous, "overlap must shrink every tick: {} -> {}", previous, gap);
            previous = gap;
        }
    }

    #[test]
    fn test_non_finite_result_keeps_previous_velocity() {
        let sim = Simulation::new(quiet_config(1));
        let agent = shared(Vector3D::ZERO, Vector3D::ZERO, Vector3D::new(1.0, 0.0, 0.0));
        sim.register(AgentId(1), AgentParams::default(), agent.clone()).unwrap();
        sim.tick();
        let good = agent.optimized_velocity();
        assert_eq!(good, Some(Vector3D::new(1.0, 0.0, 0.0)));

        agent.set_preferred_velocity(Vector3D::new(f64::NAN, 0.0, 0.0));
        sim.tick();
        assert_eq!(agent.optimized_velocity(), good);
        assert_eq!(sim.optimized_velocity(AgentId(1)), good);
    }

    #[test]
    fn test_many_agents_spawned_on_one_spot() {
        let sim = Simulation::new(quiet_config(2));
        let count = 5000;
        let mut agents = Vec::with_capacity(count);
        for i in 0..count {
            let agent = shared(Vector3D::ZERO, Vector3D::ZERO, Vector3D::new(1.0, 0.0, 0.0));
            sim.register(AgentId(i as u64), AgentParams::default(), agent.clone()).unwrap();
            agents.push(agent);
        }

        sim.tick();
        assert_eq!(sim.agent_count(), count);
        assert!(agents
            .iter()
            .all(|agent| agent.optimized_velocity().is_some_and(|v| v.is_finite())));
    }

    #[test]
    fn test_jitter_is_seeded() {
        let run = |seed: u64| {
            let sim = Simulation::new(SimulationConfig {
                max_thread_count: 3,
                preferred_velocity_jitter: 1e-3,
                seed,
                ..SimulationConfig::default()
            });
            // Spaced beyond neighbor_dist, so each result is its perturbed preference
            let agents: Vec<Arc<SharedAgent>> = (0..6)
                .map(|i| shared(Vector3D::new(i as f64 * 20.0, 0.0, 0.0), Vector3D::ZERO, Vector3D::new(1.0, 0.0, 0.0)))
                .collect();
            for (i, agent) in agents.iter().enumerate() {
                sim.register(AgentId(i as u64), AgentParams::default(), agent.clone()).unwrap();
            }
            sim.tick();
            agents
                .iter()
                .map(|a| a.optimized_velocity().unwrap_or(Vector3D::ZERO))
                .collect::<Vec<_>>()
        };

        assert_eq!(run(5), run(5), "same seed must give the same velocities");
        let jittered = run(5);
        assert!(jittered.iter().any(|v| *v != Vector3D::new(1.0, 0.0, 0.0)));
        assert!(jittered
            .iter()
            .all(|v| (*v - Vector3D::new(1.0, 0.0, 0.0)).magnitude() <= 1e-3 + 1e-12));
    }

    #[test]
    fn test_ring_of_agents_stays_collision_free() {
        // 16 agents cross a circle through the worker pool.
        let sim = Simulation::new(SimulationConfig {
            max_thread_count: 4,
            preferred_velocity_jitter: 1e-5,
            seed: 1,
            ..SimulationConfig::default()
        });
        let params = AgentParams {
            radius: 0.4,
            max_speed: 1.5,
            neighbor_dist: 6.0,
            time_horizon: 3.0,
            ..AgentParams::default()
        };
        let count = 16;
        let ring = 8.0;
        let mut agents = Vec::new();
        for i in 0..count {
            let angle = i as f64 / count as f64 * 2.0 * std::f64::consts::PI;
            let position = Vector3D::new(ring * angle.cos(), ring * angle.sin(), 0.0);
            let agent = shared(position, Vector3D::ZERO, Vector3D::ZERO);
            sim.register(AgentId(i as u64), params, agent.clone()).unwrap();
            agents.push((agent, -position));
        }

        let dt = 0.05;
        for step in 0..400 {
            for (agent, goal) in &agents {
                let to_goal = *goal - agent.position();
                let pref = if to_goal.magnitude() > params.max_speed {
                    to_goal.normalize() * params.max_speed
                } else {
                    to_goal
                };
                agent.set_preferred_velocity(pref);
            }
            sim.tick();
            for (agent, _) in &agents {
                assert!(agent.optimized_velocity().is_some_and(|v| v.is_finite()));
                agent.integrate(dt);
            }

            for i in 0..count {
                for j in (i + 1)..count {
                    let gap = (agents[i].0.position() - agents[j].0.position()).magnitude();
                    assert!(
                        gap >= 2.0 * params.radius * 0.9,
                        "step {}: agents {} and {} are {} apart",
                        step,
                        i,
                        j,
                        gap
                    );
                }
            }
        }
        assert_eq!(sim.agent_count(), count);
    }
}

//! # ORCA - Optimal Reciprocal Collision Avoidance
//!
//! This module implements the 3D ORCA velocity solver from
//! "Reciprocal n-body Collision Avoidance" by van den Berg et al. (ISRR 2011).
//!
//! ## Algorithm Overview
//!
//! For one agent per tick:
//! 1. Collect Reciprocal and OneSided neighbors from the kd-tree
//! 2. Turn each neighbor into a half-space ("ORCA plane") in velocity space
//! 3. Find the velocity inside the max-speed sphere and every plane that is
//!    closest to the preferred velocity (incremental linear programming)
//! 4. If no such velocity exists, find the one minimizing the largest
//!    violation instead (4th-stage fallback)
//!
//! ## Plane Construction
//!
//! The truncated velocity obstacle of a neighbor is the cone from the origin
//! through the disc of radius `R` around `relPos`, cut off by the disc of radius
//! `R / τ` around `relPos / τ`. The smallest change `u` that moves the relative
//! velocity to the obstacle boundary becomes the plane normal; the agent takes
//! its share of `u` given by the responsibility weight. Agents that already
//! overlap use a fixed recovery step instead of `τ`, so they separate within
//! that step.
//!
//! ## Linear Programs
//!
//! - `linear_program1`: a line, clipped by the speed sphere and earlier planes
//! - `linear_program2`: one plane, falling back to `linear_program1` on the
//!   intersection line with each earlier plane it conflicts with
//! - `linear_program3`: the full cascade; returns the index of the first plane
//!   it could not satisfy, or the plane count on success
//! - `linear_program4`: minimizes the worst violation over the planes from the
//!   failing index on, by re-running the cascade on projected planes with a
//!   direction objective
//!
//! Plane order matters: Reciprocal neighbors are added first, nearest first,
//! so in the over-constrained case the nearest Reciprocal constraints are the
//! ones kept exactly.

use crate::kdtree::KdTree;
use crate::neighbors::{collect_neighbors, NeighborList};
use crate::structs::{
    sqr, AgentCategory, AgentParams, AgentState, DodgePolicy, Line, Plane, Vector3D, WeightPolicy,
    RVO_EPSILON,
};
use log::{debug, warn};

/// Time step used instead of the time horizon when two agents already overlap.
pub const COLLISION_TIME_STEP: f64 = 0.25;
const INV_COLLISION_TIME_STEP: f64 = 1.0 / COLLISION_TIME_STEP;

/// Keeps the interpolated weight finite when both weights are zero.
const WEIGHT_EPSILON: f64 = 1e-4;

/// Reusable per-worker buffers, so a tick allocates nothing once warmed up.
#[derive(Debug, Clone, Default)]
pub struct SolverScratch {
    reciprocal: NeighborList,
    one_sided: NeighborList,
    planes: Vec<Plane>,
    projected: Vec<Plane>,
}

impl SolverScratch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Planes built by the last `compute_new_velocity` call, in solve order.
    pub fn planes(&self) -> &[Plane] {
        &self.planes
    }

    /// Neighbor lists from the last call: (Reciprocal, OneSided).
    pub fn neighbors(&self) -> (&NeighborList, &NeighborList) {
        (&self.reciprocal, &self.one_sided)
    }
}

/// Computes a new, safe velocity for `agents[agent_index]`.
///
/// The tree must have been built over `agents` this tick. The caller skips
/// OneSided agents; they never avoid anything.
pub fn compute_new_velocity(
    agent_index: usize,
    agents: &[AgentState],
    tree: &KdTree,
    scratch: &mut SolverScratch,
) -> Vector3D {
    let SolverScratch {
        reciprocal,
        one_sided,
        planes,
        projected,
    } = scratch;

    // Step 1: Collect neighbors
    collect_neighbors(agent_index, agents, tree, reciprocal, one_sided);

    // Step 2: One plane per neighbor, Reciprocal neighbors first
    let agent = &agents[agent_index];
    let inv_time_horizon = 1.0 / agent.params.time_horizon;
    planes.clear();
    for candidate in reciprocal.iter().chain(one_sided.iter()) {
        let other = &agents[candidate.index];
        let plane = orca_plane(agent, other, inv_time_horizon);
        if !(plane.point.is_finite() && plane.normal.is_finite()) {
            // Coincident agents with equal velocities have no avoidance direction
            warn!(
                "{}: degenerate ORCA plane against {} (position {}, velocity {}); ignoring it",
                agent.id,
                other.id,
                other.position,
                other.velocity
            );
            continue;
        }
        planes.push(plane);
    }

    // Step 3: Closest feasible velocity to the preferred one
    let max_speed = agent.params.max_speed;
    let mut result = Vector3D::ZERO;
    let plane_fail = linear_program3(planes, max_speed, agent.pref_velocity, false, &mut result);

    // Step 4: Over-constrained, minimize the worst violation instead
    if plane_fail < planes.len() {
        debug!(
            "{}: infeasible at plane {} of {}, using fallback",
            agent.id,
            plane_fail,
            planes.len()
        );
        linear_program4(planes, plane_fail, max_speed, &mut result, projected);
    }

    result
}

/// Builds the ORCA plane `agent` must respect with respect to `other`.
pub fn orca_plane(agent: &AgentState, other: &AgentState, inv_time_horizon: f64) -> Plane {
    let relative_position = other.position - agent.position;
    let relative_velocity = agent.velocity - other.velocity;
    let dist_sq = relative_position.magnitude_squared();
    let combined_radius = agent.params.radius + other.params.radius;
    let combined_radius_sq = sqr(combined_radius);

    let (normal, u) = if dist_sq > combined_radius_sq {
        // No collision. Vector from cutoff center to relative velocity.
        let w = relative_velocity - inv_time_horizon * relative_position;
        let w_length_sq = w.magnitude_squared();
        let dot_product = w.dot(&relative_position);

        if dot_product < 0.0 && sqr(dot_product) > combined_radius_sq * w_length_sq {
            // Project on cut-off circle
            let w_length = w_length_sq.sqrt();
            let unit_w = w / w_length;
            (unit_w, (combined_radius * inv_time_horizon - w_length) * unit_w)
        } else {
            // Project on cone: t places the tangent sphere center at t * relPos
            let a = dist_sq;
            let b = relative_position.dot(&relative_velocity);
            let c = relative_velocity.magnitude_squared()
                - relative_position.cross(&relative_velocity).magnitude_squared()
                    / (dist_sq - combined_radius_sq);
            let t = (b + (sqr(b) - a * c).sqrt()) / a;
            let ww = relative_velocity - t * relative_position;
            let ww_length = ww.magnitude();
            let unit_ww = ww / ww_length;
            (unit_ww, (combined_radius * t - ww_length) * unit_ww)
        }
    } else {
        // Collision. Leave the overlap within one recovery step.
        let w = relative_velocity - INV_COLLISION_TIME_STEP * relative_position;
        let w_length = w.magnitude();
        let unit_w = w / w_length;
        (unit_w, (combined_radius * INV_COLLISION_TIME_STEP - w_length) * unit_w)
    };

    let weight = responsibility_weight(&agent.params, other.category(), &other.params);
    Plane::new(agent.velocity + u * weight, normal)
}

/// Share of the avoidance correction `own` takes on against a neighbor.
pub fn responsibility_weight(own: &AgentParams, other_category: AgentCategory, other: &AgentParams) -> f64 {
    if other_category == AgentCategory::Reciprocal || own.dodge_policy == DodgePolicy::TreatAsReciprocal {
        return match own.weight_policy {
            WeightPolicy::Fixed => own.weight.clamp(0.0, 1.0),
            WeightPolicy::LinearInterpolation => other.weight / (own.weight + other.weight + WEIGHT_EPSILON),
        };
    }

    match own.dodge_policy {
        DodgePolicy::None => 0.0,
        DodgePolicy::Fixed => own.dodge_weight.clamp(0.0, 1.0),
        DodgePolicy::Standard => (own.dodge_weight * other.projectile_weight).clamp(0.0, 1.0),
        // Handled above
        DodgePolicy::TreatAsReciprocal => 0.5,
    }
}

/// Solves a one-dimensional linear program on `line`, subject to the sphere
/// of `radius` and the first `plane_no` planes.
///
/// Returns false if the constraints leave nothing of the line.
pub fn linear_program1(
    planes: &[Plane],
    plane_no: usize,
    line: &Line,
    radius: f64,
    opt_velocity: Vector3D,
    direction_opt: bool,
    result: &mut Vector3D,
) -> bool {
    let dot_product = line.point.dot(&line.direction);
    let discriminant = sqr(dot_product) + sqr(radius) - line.point.magnitude_squared();

    if discriminant < 0.0 {
        // Max speed sphere fully invalidates the line
        return false;
    }

    let sqrt_discriminant = discriminant.sqrt();
    let mut t_left = -dot_product - sqrt_discriminant;
    let mut t_right = -dot_product + sqrt_discriminant;

    for plane in &planes[..plane_no] {
        let numerator = (plane.point - line.point).dot(&plane.normal);
        let denominator = line.direction.dot(&plane.normal);

        if sqr(denominator) <= RVO_EPSILON {
            // Line is (almost) parallel to the plane
            if numerator > 0.0 {
                return false;
            }
            continue;
        }

        let t = numerator / denominator;
        if denominator >= 0.0 {
            // Plane bounds line on the left
            t_left = t_left.max(t);
        } else {
            // Plane bounds line on the right
            t_right = t_right.min(t);
        }

        if t_left > t_right {
            return false;
        }
    }

    if direction_opt {
        // Take the extreme agreeing with the direction
        if opt_velocity.dot(&line.direction) > 0.0 {
            *result = line.point + t_right * line.direction;
        } else {
            *result = line.point + t_left * line.direction;
        }
    } else {
        // Closest point to opt_velocity, clamped into the bounds
        let t = line.direction.dot(&(opt_velocity - line.point));
        let t = if t < t_left {
            t_left
        } else if t > t_right {
            t_right
        } else {
            t
        };
        *result = line.point + t * line.direction;
    }

    true
}

/// Solves a two-dimensional linear program on plane `plane_no`, subject to the
/// sphere of `radius` and all earlier planes.
pub fn linear_program2(
    planes: &[Plane],
    plane_no: usize,
    radius: f64,
    opt_velocity: Vector3D,
    direction_opt: bool,
    result: &mut Vector3D,
) -> bool {
    let plane = planes[plane_no];
    let plane_dist = plane.point.dot(&plane.normal);
    let plane_dist_sq = sqr(plane_dist);
    let radius_sq = sqr(radius);

    if plane_dist_sq > radius_sq {
        // Max speed sphere fully invalidates the plane
        return false;
    }

    let plane_radius_sq = radius_sq - plane_dist_sq;
    let plane_center = plane_dist * plane.normal;

    if direction_opt {
        // Project direction onto the plane
        let plane_opt_velocity = opt_velocity - opt_velocity.dot(&plane.normal) * plane.normal;
        let plane_opt_velocity_length_sq = plane_opt_velocity.magnitude_squared();

        if plane_opt_velocity_length_sq <= RVO_EPSILON {
            *result = plane_center;
        } else {
            *result = plane_center + (plane_radius_sq / plane_opt_velocity_length_sq).sqrt() * plane_opt_velocity;
        }
    } else {
        // Project point onto the plane
        *result = opt_velocity + (plane.point - opt_velocity).dot(&plane.normal) * plane.normal;

        // Outside the plane's disc: project onto its rim
        if result.magnitude_squared() > radius_sq {
            let plane_result = *result - plane_center;
            let plane_result_length_sq = plane_result.magnitude_squared();
            *result = plane_center + (plane_radius_sq / plane_result_length_sq).sqrt() * plane_result;
        }
    }

    for i in 0..plane_no {
        if planes[i].violation(result) > 0.0 {
            // Intersection line of plane i and this plane
            let cross_product = planes[i].normal.cross(&plane.normal);

            if cross_product.magnitude_squared() <= RVO_EPSILON {
                // (Almost) parallel, and plane i fully invalidates this one
                return false;
            }

            let direction = cross_product.normalize();
            let line_normal = direction.cross(&plane.normal);
            let point = plane.point
                + ((planes[i].point - plane.point).dot(&planes[i].normal) / line_normal.dot(&planes[i].normal))
                    * line_normal;
            let line = Line::new(point, direction);

            if !linear_program1(planes, i, &line, radius, opt_velocity, direction_opt, result) {
                return false;
            }
        }
    }

    true
}

/// Solves the three-dimensional linear program over all `planes`.
///
/// Returns `planes.len()` on success, otherwise the index of the plane that
/// could not be satisfied; `result` then holds the best velocity found before it.
pub fn linear_program3(
    planes: &[Plane],
    radius: f64,
    opt_velocity: Vector3D,
    direction_opt: bool,
    result: &mut Vector3D,
) -> usize {
    if direction_opt {
        // opt_velocity is a unit vector here
        *result = opt_velocity * radius;
    } else if opt_velocity.magnitude_squared() > sqr(radius) {
        *result = opt_velocity.normalize() * radius;
    } else {
        *result = opt_velocity;
    }

    for i in 0..planes.len() {
        if planes[i].violation(result) > 0.0 {
            let temp_result = *result;
            if !linear_program2(planes, i, radius, opt_velocity, direction_opt, result) {
                *result = temp_result;
                return i;
            }
        }
    }

    planes.len()
}

/// Moves `result` to the velocity minimizing the largest violation of the
/// planes from `begin_plane` on, keeping earlier planes satisfied where possible.
///
/// `projected` is scratch space.
pub fn linear_program4(
    planes: &[Plane],
    begin_plane: usize,
    radius: f64,
    result: &mut Vector3D,
    projected: &mut Vec<Plane>,
) {
    let mut distance = 0.0;

    for i in begin_plane..planes.len() {
        if planes[i].violation(result) <= distance {
            continue;
        }

        // Result violates plane i by more than the best so far
        projected.clear();
        for j in 0..i {
            let cross_product = planes[j].normal.cross(&planes[i].normal);

            let point = if cross_product.magnitude_squared() <= RVO_EPSILON {
                // Planes i and j are (almost) parallel
                if planes[i].normal.dot(&planes[j].normal) > 0.0 {
                    // Same direction
                    continue;
                }
                // Opposite direction
                0.5 * (planes[i].point + planes[j].point)
            } else {
                // Point on the intersection line of planes i and j
                let line_normal = cross_product.cross(&planes[i].normal);
                planes[i].point
                    + ((planes[j].point - planes[i].point).dot(&planes[j].normal)
                        / line_normal.dot(&planes[j].normal))
                        * line_normal
            };

            projected.push(Plane::new(point, (planes[j].normal - planes[i].normal).normalize()));
        }

        let temp_result = *result;
        if linear_program3(projected, radius, planes[i].normal, true, result) < projected.len() {
            // In principle unreachable: the previous result already lies in the
            // feasible region. Failure here is floating-point error.
            *result = temp_result;
        }

        distance = planes[i].violation(result);
    }
}

//! # Core Data Structures
//!
//! This module defines the fundamental data types used throughout the library:
//!
//! - **Vector3D**: 3-component position/velocity vector with arithmetic operations
//! - **Plane / Line**: half-space and line primitives in velocity space
//! - **AgentParams**: static per-agent configuration read once at registration
//! - **AgentState**: per-tick snapshot of one agent (params plus kinematic state)
//!
//! The optimization is effectively planar per neighbor pair, but every quantity is
//! kept in R³ so hosts with flying or layered agents need no special casing.

use crate::error::ParsePolicyError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::ops::{Add, AddAssign, Div, Index, IndexMut, Mul, Neg, Sub, SubAssign};

/// Threshold for near-parallel and near-zero denominators in the solver.
pub const RVO_EPSILON: f64 = 1e-5;

#[inline]
pub fn sqr(scalar: f64) -> f64 {
    scalar * scalar
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Vector3D {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Vector3D {
    pub const ZERO: Vector3D = Vector3D { x: 0.0, y: 0.0, z: 0.0 };

    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Vector3D { x, y, z }
    }

    pub fn dot(&self, other: &Vector3D) -> f64 {
        self.x * other.x + self.y * other.y + self.z * other.z
    }

    pub fn cross(&self, other: &Vector3D) -> Vector3D {
        Vector3D {
            x: self.y * other.z - self.z * other.y,
            y: self.z * other.x - self.x * other.z,
            z: self.x * other.y - self.y * other.x,
        }
    }

    pub fn magnitude_squared(&self) -> f64 {
        self.dot(self)
    }

    pub fn magnitude(&self) -> f64 {
        self.magnitude_squared().sqrt()
    }

    /// Divides by the length. The caller guarantees a nonzero vector; a zero
    /// vector yields NaN components, which publication rejects.
    pub fn normalize(&self) -> Vector3D {
        *self / self.magnitude()
    }

    /// False if any component is NaN or infinite.
    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite() && self.z.is_finite()
    }
}

impl fmt::Display for Vector3D {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Vector3D({:.2}, {:.2}, {:.2})", self.x, self.y, self.z)
    }
}

impl Index<usize> for Vector3D {
    type Output = f64;

    fn index(&self, axis: usize) -> &f64 {
        match axis {
            0 => &self.x,
            1 => &self.y,
            2 => &self.z,
            _ => panic!("Vector3D axis out of range: {}", axis),
        }
    }
}

impl IndexMut<usize> for Vector3D {
    fn index_mut(&mut self, axis: usize) -> &mut f64 {
        match axis {
            0 => &mut self.x,
            1 => &mut self.y,
            2 => &mut self.z,
            _ => panic!("Vector3D axis out of range: {}", axis),
        }
    }
}

impl Add for Vector3D {
    type Output = Vector3D;

    fn add(self, other: Vector3D) -> Vector3D {
        Vector3D {
            x: self.x + other.x,
            y: self.y + other.y,
            z: self.z + other.z,
        }
    }
}

impl AddAssign for Vector3D {
    fn add_assign(&mut self, other: Vector3D) {
        *self = *self + other;
    }
}

impl Sub for Vector3D {
    type Output = Vector3D;

    fn sub(self, other: Vector3D) -> Vector3D {
        Vector3D {
            x: self.x - other.x,
            y: self.y - other.y,
            z: self.z - other.z,
        }
    }
}

impl SubAssign for Vector3D {
    fn sub_assign(&mut self, other: Vector3D) {
        *self = *self - other;
    }
}

impl Neg for Vector3D {
    type Output = Vector3D;

    fn neg(self) -> Vector3D {
        Vector3D {
            x: -self.x,
            y: -self.y,
            z: -self.z,
        }
    }
}

impl Mul<f64> for Vector3D {
    type Output = Vector3D;

    fn mul(self, scalar: f64) -> Vector3D {
        Vector3D {
            x: self.x * scalar,
            y: self.y * scalar,
            z: self.z * scalar,
        }
    }
}

impl Mul<Vector3D> for f64 {
    type Output = Vector3D;

    fn mul(self, vector: Vector3D) -> Vector3D {
        vector * self
    }
}

impl Div<f64> for Vector3D {
    type Output = Vector3D;

    fn div(self, scalar: f64) -> Vector3D {
        Vector3D {
            x: self.x / scalar,
            y: self.y / scalar,
            z: self.z / scalar,
        }
    }
}

impl From<nalgebra::Vector3<f64>> for Vector3D {
    fn from(v: nalgebra::Vector3<f64>) -> Self {
        Vector3D::new(v.x, v.y, v.z)
    }
}

impl From<Vector3D> for nalgebra::Vector3<f64> {
    fn from(v: Vector3D) -> Self {
        nalgebra::Vector3::new(v.x, v.y, v.z)
    }
}

impl From<(f64, f64, f64)> for Vector3D {
    fn from((x, y, z): (f64, f64, f64)) -> Self {
        Vector3D::new(x, y, z)
    }
}

impl From<Vector3D> for (f64, f64, f64) {
    fn from(v: Vector3D) -> Self {
        (v.x, v.y, v.z)
    }
}

/// Half-space in velocity space. A velocity `v` is admissible if
/// `normal · (point - v) <= 0`.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Plane {
    pub point: Vector3D,
    pub normal: Vector3D,
}

impl Plane {
    pub fn new(point: Vector3D, normal: Vector3D) -> Self {
        Plane { point, normal }
    }

    /// Signed violation of `velocity`: positive means outside the half-space.
    #[inline]
    pub fn violation(&self, velocity: &Vector3D) -> f64 {
        self.normal.dot(&(self.point - *velocity))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Line {
    pub point: Vector3D,
    pub direction: Vector3D,
}

impl Line {
    pub fn new(point: Vector3D, direction: Vector3D) -> Self {
        Line { point, direction }
    }
}

/// Host-chosen identity of a registered agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AgentId(pub u64);

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Agent#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum AgentCategory {
    /// Avoids others and is avoided by others.
    #[default]
    Reciprocal,
    /// Avoided by Reciprocal agents but never avoids anything itself
    /// (projectiles, scripted movers).
    OneSided,
}

/// How much of the burden an agent takes against a Reciprocal neighbor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum WeightPolicy {
    /// Fixed share, clamped to [0, 1], regardless of the neighbor.
    Fixed,
    /// `other.weight / (own.weight + other.weight)`: a heavier agent dodges less.
    #[default]
    LinearInterpolation,
}

/// How an agent reacts to OneSided neighbors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DodgePolicy {
    /// Use the weight policy exactly as for a Reciprocal neighbor.
    TreatAsReciprocal,
    /// Never dodge.
    None,
    /// Clamped constant `dodge_weight`.
    Fixed,
    /// `dodge_weight * neighbor.projectile_weight`, clamped.
    #[default]
    Standard,
}

/// Lowercases a policy name and drops `_`, `-` and spaces, so `"TreatAsReciprocal"`,
/// `"treat_as_reciprocal"` and `"treat-as-reciprocal"` all match.
fn normalize_policy_name(name: &str) -> String {
    name.chars()
        .filter(|c| !matches!(c, '_' | '-' | ' '))
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

impl FromStr for WeightPolicy {
    type Err = ParsePolicyError;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        match normalize_policy_name(name).as_str() {
            "fixed" => Ok(WeightPolicy::Fixed),
            "linearinterpolation" | "linear" => Ok(WeightPolicy::LinearInterpolation),
            _ => Err(ParsePolicyError {
                kind: "weight",
                name: name.to_string(),
            }),
        }
    }
}

impl FromStr for DodgePolicy {
    type Err = ParsePolicyError;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        match normalize_policy_name(name).as_str() {
            "treatasreciprocal" => Ok(DodgePolicy::TreatAsReciprocal),
            "none" => Ok(DodgePolicy::None),
            "fixed" => Ok(DodgePolicy::Fixed),
            "standard" => Ok(DodgePolicy::Standard),
            _ => Err(ParsePolicyError {
                kind: "dodge",
                name: name.to_string(),
            }),
        }
    }
}

/// Static configuration of an agent, read once at registration.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentParams {
    pub category: AgentCategory,
    pub radius: f64,
    /// Upper bound on the magnitude of the optimized velocity.
    pub max_speed: f64,
    /// Bound on each neighbor list; 0 disables avoidance entirely.
    pub max_neighbors: usize,
    /// Search radius for Reciprocal neighbors.
    pub neighbor_dist: f64,
    /// Search radius for OneSided neighbors.
    pub projectile_dist: f64,
    /// Look-ahead in seconds for the velocity-obstacle cutoff.
    pub time_horizon: f64,
    pub weight_policy: WeightPolicy,
    pub weight: f64,
    /// How seriously others dodge this agent when it is OneSided.
    pub projectile_weight: f64,
    pub dodge_policy: DodgePolicy,
    pub dodge_weight: f64,
}

impl Default for AgentParams {
    fn default() -> Self {
        AgentParams {
            category: AgentCategory::Reciprocal,
            radius: 2.0,
            max_speed: 10.0,
            max_neighbors: 15,
            neighbor_dist: 15.0,
            projectile_dist: 15.0,
            time_horizon: 2.0,
            weight_policy: WeightPolicy::LinearInterpolation,
            weight: 100.0,
            projectile_weight: 100.0,
            dodge_policy: DodgePolicy::Standard,
            dodge_weight: 0.01,
        }
    }
}

impl AgentParams {
    pub fn one_sided() -> Self {
        AgentParams {
            category: AgentCategory::OneSided,
            ..AgentParams::default()
        }
    }

    pub fn validate(&self) -> Result<(), &'static str> {
        let non_negative = |v: f64| v.is_finite() && v >= 0.0;
        if !non_negative(self.radius) {
            return Err("radius must be finite and non-negative");
        }
        if !non_negative(self.max_speed) {
            return Err("max_speed must be finite and non-negative");
        }
        if !non_negative(self.neighbor_dist) || !non_negative(self.projectile_dist) {
            return Err("search distances must be finite and non-negative");
        }
        if !(self.time_horizon.is_finite() && self.time_horizon > 0.0) {
            return Err("time_horizon must be finite and positive");
        }
        if !non_negative(self.weight)
            || !non_negative(self.projectile_weight)
            || !non_negative(self.dodge_weight)
        {
            return Err("weights must be finite and non-negative");
        }
        Ok(())
    }
}

/// Snapshot of one agent for a single tick: configuration plus the kinematic
/// state pulled from the host.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentState {
    pub id: AgentId,
    pub params: AgentParams,
    pub position: Vector3D,
    pub velocity: Vector3D,
    pub pref_velocity: Vector3D,
}

impl AgentState {
    pub fn new(
        id: AgentId,
        params: AgentParams,
        position: Vector3D,
        velocity: Vector3D,
        pref_velocity: Vector3D,
    ) -> Self {
        AgentState {
            id,
            params,
            position,
            velocity,
            pref_velocity,
        }
    }

    pub fn category(&self) -> AgentCategory {
        self.params.category
    }

    pub fn distance_squared_to(&self, other: &AgentState) -> f64 {
        (self.position - other.position).magnitude_squared()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    // ==================== Vector3D Tests ====================

    #[test]
    fn test_vector3d_dot() {
        let v1 = Vector3D::new(1.0, 2.0, 3.0);
        let v2 = Vector3D::new(4.0, -5.0, 6.0);
        assert_eq!(v1.dot(&v2), 12.0); // 4 - 10 + 18
    }

    #[test]
    fn test_vector3d_cross_right_handed() {
        let x = Vector3D::new(1.0, 0.0, 0.0);
        let y = Vector3D::new(0.0, 1.0, 0.0);
        assert_eq!(x.cross(&y), Vector3D::new(0.0, 0.0, 1.0));
        assert_eq!(y.cross(&x), Vector3D::new(0.0, 0.0, -1.0));
    }

    #[test]
    fn test_vector3d_cross_is_orthogonal() {
        let a = Vector3D::new(1.5, -2.0, 0.5);
        let b = Vector3D::new(-0.3, 4.0, 2.0);
        let c = a.cross(&b);
        assert_relative_eq!(c.dot(&a), 0.0, epsilon = 1e-12);
        assert_relative_eq!(c.dot(&b), 0.0, epsilon = 1e-12);
    }

    #[test]
    fn test_vector3d_magnitude() {
        let v = Vector3D::new(2.0, 3.0, 6.0);
        assert_eq!(v.magnitude_squared(), 49.0);
        assert_eq!(v.magnitude(), 7.0);
    }

    #[test]
    fn test_vector3d_normalize() {
        let n = Vector3D::new(0.0, 3.0, 4.0).normalize();
        assert_relative_eq!(n.y, 0.6, epsilon = 1e-12);
        assert_relative_eq!(n.z, 0.8, epsilon = 1e-12);
        assert_relative_eq!(n.magnitude(), 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_vector3d_normalize_zero_is_not_finite() {
        // Zero-length input is the caller's responsibility; it must surface as
        // a non-finite value rather than a silent zero.
        assert!(!Vector3D::ZERO.normalize().is_finite());
    }

    #[test]
    fn test_vector3d_operators() {
        let a = Vector3D::new(1.0, 2.0, 3.0);
        let b = Vector3D::new(0.5, 0.5, 0.5);
        assert_eq!(a + b, Vector3D::new(1.5, 2.5, 3.5));
        assert_eq!(a - b, Vector3D::new(0.5, 1.5, 2.5));
        assert_eq!(-a, Vector3D::new(-1.0, -2.0, -3.0));
        assert_eq!(a * 2.0, Vector3D::new(2.0, 4.0, 6.0));
        assert_eq!(2.0 * a, a * 2.0);
        assert_eq!(a / 2.0, Vector3D::new(0.5, 1.0, 1.5));

        let mut c = a;
        c += b;
        c -= a;
        assert_eq!(c, b);
    }

    #[test]
    fn test_vector3d_index() {
        let mut v = Vector3D::new(7.0, 8.0, 9.0);
        assert_eq!(v[0], 7.0);
        assert_eq!(v[1], 8.0);
        assert_eq!(v[2], 9.0);
        v[1] = -1.0;
        assert_eq!(v.y, -1.0);
    }

    #[test]
    #[should_panic]
    fn test_vector3d_index_out_of_range() {
        let v = Vector3D::ZERO;
        let _ = v[3];
    }

    #[test]
    fn test_vector3d_is_finite() {
        assert!(Vector3D::new(1.0, -2.0, 0.0).is_finite());
        assert!(!Vector3D::new(f64::NAN, 0.0, 0.0).is_finite());
        assert!(!Vector3D::new(0.0, f64::INFINITY, 0.0).is_finite());
        assert!(!Vector3D::new(0.0, 0.0, f64::NEG_INFINITY).is_finite());
    }

    #[test]
    fn test_vector3d_display() {
        let v = Vector3D::new(1.5, 2.25, -3.0);
        assert_eq!(v.to_string(), "Vector3D(1.50, 2.25, -3.00)");
    }

    #[test]
    fn test_vector3d_nalgebra_conversion() {
        let v = Vector3D::new(1.0, 2.0, 3.0);
        let n: nalgebra::Vector3<f64> = v.into();
        assert_eq!(n.norm_squared(), v.magnitude_squared());
        assert_eq!(Vector3D::from(n), v);
    }

    #[test]
    fn test_vector3d_tuple_conversion() {
        let v = Vector3D::from((1.0, -2.0, 0.5));
        assert_eq!(v, Vector3D::new(1.0, -2.0, 0.5));
        let t: (f64, f64, f64) = v.into();
        assert_eq!(t, (1.0, -2.0, 0.5));
    }

    // ==================== Plane Tests ====================

    #[test]
    fn test_plane_violation_sign() {
        // Admissible region: x >= 1
        let plane = Plane::new(Vector3D::new(1.0, 0.0, 0.0), Vector3D::new(1.0, 0.0, 0.0));
        assert!(plane.violation(&Vector3D::new(2.0, 5.0, 0.0)) < 0.0);
        assert_eq!(plane.violation(&Vector3D::new(1.0, -3.0, 2.0)), 0.0);
        assert_eq!(plane.violation(&Vector3D::ZERO), 1.0);
    }

    // ==================== AgentParams Tests ====================

    #[test]
    fn test_agent_params_defaults() {
        let params = AgentParams::default();
        assert_eq!(params.category, AgentCategory::Reciprocal);
        assert_eq!(params.max_neighbors, 15);
        assert_eq!(params.weight_policy, WeightPolicy::LinearInterpolation);
        assert_eq!(params.dodge_policy, DodgePolicy::Standard);
        assert!(params.validate().is_ok());
    }

    #[test]
    fn test_policy_names_parse() {
        assert_eq!("fixed".parse::<WeightPolicy>(), Ok(WeightPolicy::Fixed));
        assert_eq!("LinearInterpolation".parse::<WeightPolicy>(), Ok(WeightPolicy::LinearInterpolation));
        assert_eq!("linear_interpolation".parse::<WeightPolicy>(), Ok(WeightPolicy::LinearInterpolation));
        assert_eq!("treat-as-reciprocal".parse::<DodgePolicy>(), Ok(DodgePolicy::TreatAsReciprocal));
        assert_eq!("None".parse::<DodgePolicy>(), Ok(DodgePolicy::None));
        assert_eq!("FIXED".parse::<DodgePolicy>(), Ok(DodgePolicy::Fixed));
        assert_eq!("standard".parse::<DodgePolicy>(), Ok(DodgePolicy::Standard));
    }

    #[test]
    fn test_unknown_policy_name_is_rejected() {
        let err = "sometimes".parse::<DodgePolicy>().unwrap_err();
        assert_eq!(err.kind, "dodge");
        assert_eq!(err.name, "sometimes");
        assert!("standard".parse::<WeightPolicy>().is_err(), "standard is a dodge policy only");
    }

    #[test]
    fn test_agent_params_one_sided() {
        let params = AgentParams::one_sided();
        assert_eq!(params.category, AgentCategory::OneSided);
        assert_eq!(params.radius, AgentParams::default().radius);
    }

    #[test]
    fn test_agent_params_validate_rejects_bad_values() {
        let bad_horizon = AgentParams {
            time_horizon: 0.0,
            ..AgentParams::default()
        };
        assert!(bad_horizon.validate().is_err());

        let bad_radius = AgentParams {
            radius: -1.0,
            ..AgentParams::default()
        };
        assert!(bad_radius.validate().is_err());

        let bad_speed = AgentParams {
            max_speed: f64::NAN,
            ..AgentParams::default()
        };
        assert!(bad_speed.validate().is_err());

        let bad_weight = AgentParams {
            projectile_weight: f64::INFINITY,
            ..AgentParams::default()
        };
        assert!(bad_weight.validate().is_err());
    }

    // ==================== AgentState Tests ====================

    #[test]
    fn test_agent_state_distance_squared() {
        let a = AgentState::new(
            AgentId(0),
            AgentParams::default(),
            Vector3D::new(0.0, 0.0, 0.0),
            Vector3D::ZERO,
            Vector3D::ZERO,
        );
        let b = AgentState::new(
            AgentId(1),
            AgentParams::one_sided(),
            Vector3D::new(1.0, 2.0, 2.0),
            Vector3D::ZERO,
            Vector3D::ZERO,
        );
        assert_eq!(a.distance_squared_to(&b), 9.0);
        assert_eq!(b.category(), AgentCategory::OneSided);
    }

    #[test]
    fn test_agent_id_display_and_order() {
        assert_eq!(AgentId(7).to_string(), "Agent#7");
        assert!(AgentId(1) < AgentId(2));
    }
}

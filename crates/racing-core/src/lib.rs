//! # Racing Core
//!
//! Vehicle-side building blocks for the gate-racing controller:
//!
//! - [`math`]: Numerical integrators and rotation helpers
//! - [`dynamics`]: Drone state and the identified attitude-level quadrotor model
//! - [`geometry`]: Gate/obstacle descriptions and signed clearance checks
//!
//! Nothing in this crate holds controller state. Every function is deterministic
//! and side-effect free, so it can be used both inside the optimiser and in
//! fallback safety checks.

pub mod math;
pub mod dynamics;
pub mod geometry;

use nalgebra::Vector3;

/// 3D vector type
pub type Vec3 = Vector3<f64>;

/// Gravity constant [m/s²]
pub const GRAVITY: f64 = 9.81;

/// World z-axis (ENU, z-up)
pub fn up() -> Vec3 {
    Vec3::new(0.0, 0.0, 1.0)
}

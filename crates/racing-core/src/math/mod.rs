//! Mathematical utilities
//!
//! Numerical integrators and the roll-pitch-yaw conventions shared by the
//! dynamics model and the collision geometry.

pub mod integrator;
pub mod rotation;

pub use integrator::*;
pub use rotation::*;

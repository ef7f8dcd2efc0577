//! Course geometry and collision clearance
//!
//! Gates are modelled by their physical frame (four bars around the aperture),
//! obstacles as infinitely tall vertical cylinders, and the drone as an
//! ellipsoid. All checks return a signed clearance: positive outside, zero on
//! contact, negative when penetrating.

pub mod collision;

pub use collision::*;

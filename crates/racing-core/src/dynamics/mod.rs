//! Vehicle models
//!
//! - [`state`]: Drone state as delivered by state estimation
//! - [`attitude`]: Identified attitude-level quadrotor model used by the MPC

pub mod state;
pub mod attitude;

pub use state::*;
pub use attitude::*;

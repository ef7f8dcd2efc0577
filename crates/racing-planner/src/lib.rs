//! Racing Planner
//!
//! Receding-horizon trajectory tracking for autonomous gate racing.
//!
//! # Architecture
//!
//! Every control tick the controller solves a finite-horizon optimal control
//! problem around a gate-by-gate reference trajectory:
//!
//! ```text
//! minimize    J = Σ ‖x_k - x_k,ref‖²_Q + ‖u_k‖²_R + s·‖x_N - x_N,ref‖²_Q
//! subject to  x₀ = x_init
//!             x_{k+1} = f(x_k, u_k)          (attitude-level drone model)
//!             u_min ≤ u_k ≤ u_max            (command-rate limits)
//!             clearance(p_k) ≥ 0             (gates, obstacles; soft)
//! ```
//!
//! The reference trajectory is regenerated when the drone deviates from it,
//! a gate moves, or the target gate advances.
//!
//! # Components
//!
//! - [`config`]: Controller configuration loaded from TOML
//! - [`weights`]: Cost weight presets and post-replan blending
//! - [`ocp`]: Reference points, commands and cost terms
//! - [`trajectory`]: Time-parameterized waypoint trajectories
//! - [`planner`]: Gate-sequence trajectory generation and replan decisions
//! - [`constraints`]: Collision and command constraints as soft penalties
//! - [`qp`]: Box-constrained QP subproblem solver
//! - [`warm_start`]: Shifted initial guesses and `.npz` persistence
//! - [`solver`]: Gauss-Newton SQP over the horizon
//! - [`flight_log`]: Planned vs. actual position recording
//! - [`controller`]: Per-tick control loop

pub mod config;
pub mod weights;
pub mod ocp;
pub mod trajectory;
pub mod planner;
pub mod constraints;
pub mod qp;
pub mod warm_start;
pub mod solver;
pub mod flight_log;
pub mod controller;

// Re-exports
pub use config::ControllerConfig;
pub use controller::{ControlOutput, ControlStatus, MpcController, Observation};
pub use ocp::Command;
pub use planner::TrajectoryPlanner;
pub use solver::{MpcSolver, SolveStatus};
pub use trajectory::Trajectory;

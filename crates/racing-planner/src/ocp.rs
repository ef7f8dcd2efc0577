//! Optimal Control Problem (OCP) definition
//!
//! Receding-horizon tracking problem over the attitude-level model:
//!
//! ```text
//! minimize    J = Σₖ₌₁ᴺ ½‖xₖ − xₖ,ref‖²_Q + Σₖ₌₀ᴺ⁻¹ ½‖uₖ‖²_R + Σₖ φ(hₖ(xₖ))
//! subject to  x₀ = x_init
//!             xₖ₊₁ = F(xₖ, uₖ)       (RK4 over the identified model)
//!             u_min ≤ uₖ ≤ u_max      (command-rate bounds)
//! ```
//!
//! `hₖ ≥ 0` are the clearance and command-bound constraints, softened by the
//! slack penalty φ (see [`crate::constraints`]). The terminal stage uses `Q`
//! scaled by the configured terminal factor.

use nalgebra::Vector3;
use serde::{Deserialize, Serialize};

use racing_core::dynamics::{idx, InputVector, StateVector, NU};

use crate::config::SolverConfig;
use crate::weights::CostWeights;

/// Reference for one horizon node
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReferencePoint {
    /// Desired position [m]
    pub position: Vector3<f64>,
    /// Desired velocity [m/s]
    pub velocity: Vector3<f64>,
    /// Desired collective thrust command
    pub thrust: f64,
    /// Desired yaw [rad]
    pub yaw: f64,
}

impl ReferencePoint {
    /// Hold position at the given thrust
    pub fn hover(position: Vector3<f64>, thrust: f64) -> Self {
        Self {
            position,
            velocity: Vector3::zeros(),
            thrust,
            yaw: 0.0,
        }
    }

    /// Target model state for this node
    pub fn target_state(&self) -> StateVector {
        let mut x = StateVector::zeros();
        x.fixed_rows_mut::<3>(idx::POS).copy_from(&self.position);
        x.fixed_rows_mut::<3>(idx::VEL).copy_from(&self.velocity);
        x[idx::RPY + 2] = self.yaw;
        x[idx::THRUST] = self.thrust;
        x[idx::THRUST_CMD] = self.thrust;
        x[idx::RPY_CMD + 2] = self.yaw;
        x
    }
}

/// Command sent to the flight firmware
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Command {
    /// Collective thrust command
    pub thrust: f64,
    /// Roll, pitch, yaw command [rad]
    pub rpy: Vector3<f64>,
}

impl Command {
    /// Level attitude at the given thrust
    pub fn level(thrust: f64) -> Self {
        Self {
            thrust,
            rpy: Vector3::zeros(),
        }
    }

    /// Commanded part of a model state
    pub fn from_state(x: &StateVector) -> Self {
        Self {
            thrust: x[idx::THRUST_CMD],
            rpy: x.fixed_rows::<3>(idx::RPY_CMD).into_owned(),
        }
    }

    pub fn is_finite(&self) -> bool {
        self.thrust.is_finite() && self.rpy.iter().all(|v| v.is_finite())
    }

    /// Clamp into the actuator envelope
    pub fn clamped(&self, bounds: &CommandBounds) -> Self {
        Self {
            thrust: self.thrust.clamp(bounds.thrust[0], bounds.thrust[1]),
            rpy: self.rpy.map(|a| a.clamp(-bounds.attitude, bounds.attitude)),
        }
    }

    pub fn within(&self, bounds: &CommandBounds) -> bool {
        self.thrust >= bounds.thrust[0]
            && self.thrust <= bounds.thrust[1]
            && self.rpy.iter().all(|a| a.abs() <= bounds.attitude)
    }
}

/// Actuator envelope for commanded thrust and attitude
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CommandBounds {
    /// [min, max] collective thrust
    pub thrust: [f64; 2],
    /// Symmetric bound on roll/pitch/yaw [rad]
    pub attitude: f64,
}

impl CommandBounds {
    pub fn from_config(config: &SolverConfig) -> Self {
        Self {
            thrust: config.thrust_bounds,
            attitude: config.attitude_limit,
        }
    }
}

/// Box bounds on the input (command-rate) vector
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InputBounds {
    pub lower: InputVector,
    pub upper: InputVector,
}

impl InputBounds {
    pub fn from_config(config: &SolverConfig) -> Self {
        let t = config.thrust_rate_limit;
        let a = config.attitude_rate_limit;
        Self {
            lower: InputVector::new(-t, -a, -a, -a),
            upper: InputVector::new(t, a, a, a),
        }
    }

    pub fn clamp(&self, u: &InputVector) -> InputVector {
        let mut out = *u;
        for i in 0..NU {
            out[i] = u[i].clamp(self.lower[i], self.upper[i]);
        }
        out
    }
}

/// Diagonal of the state weight matrix Q
pub fn state_weight_diagonal(weights: &CostWeights, scale: f64) -> StateVector {
    let mut q = StateVector::zeros();
    for i in 0..3 {
        q[idx::POS + i] = weights.q_pos;
        q[idx::VEL + i] = weights.q_vel;
        q[idx::RPY + i] = weights.q_rpy;
        q[idx::RPY_CMD + i] = weights.q_cmd;
    }
    q[idx::THRUST] = weights.q_thrust;
    q[idx::THRUST_CMD] = weights.q_cmd;
    q * scale
}

/// ½‖x − x_ref‖²_Q
pub fn tracking_cost(x: &StateVector, reference: &ReferencePoint, q: &StateVector) -> f64 {
    let e = x - reference.target_state();
    0.5 * e.component_mul(&e).dot(q)
}

/// ½‖u‖²_R
pub fn input_cost(u: &InputVector, weights: &CostWeights) -> f64 {
    0.5 * weights.r * u.norm_squared()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_tracking_cost_zero_on_reference() {
        let reference = ReferencePoint::hover(Vector3::new(1.0, 2.0, 1.0), 0.3);
        let q = state_weight_diagonal(&CostWeights::default(), 1.0);
        assert_relative_eq!(tracking_cost(&reference.target_state(), &reference, &q), 0.0);
    }

    #[test]
    fn test_tracking_cost_weights_position() {
        let reference = ReferencePoint::hover(Vector3::zeros(), 0.3);
        let weights = CostWeights::default();
        let q = state_weight_diagonal(&weights, 2.0);
        let mut x = reference.target_state();
        x[idx::POS] = 0.5;
        assert_relative_eq!(tracking_cost(&x, &reference, &q), 0.5 * 2.0 * weights.q_pos * 0.25);
    }

    #[test]
    fn test_command_clamp() {
        let bounds = CommandBounds { thrust: [0.1, 0.5], attitude: 0.4 };
        let cmd = Command { thrust: 0.9, rpy: Vector3::new(-1.0, 0.2, 0.0) };
        assert!(!cmd.within(&bounds));
        let clamped = cmd.clamped(&bounds);
        assert!(clamped.within(&bounds));
        assert_relative_eq!(clamped.thrust, 0.5);
        assert_relative_eq!(clamped.rpy.x, -0.4);
        assert_relative_eq!(clamped.rpy.y, 0.2);
    }
}

//! Attitude-level quadrotor model
//!
//! The flight firmware closes the attitude loop, so the model the MPC plans
//! with takes commanded collective thrust and commanded roll/pitch/yaw. The
//! attitude response is identified as a first-order system per axis:
//!
//! ```text
//! ṗ = v
//! v̇ = (a₀·f + a₁) · z_body(φ, θ, ψ) − g·e₃
//! φ̇ = k_φ₀·φ + k_φ₁·φ_cmd      (same for θ, ψ)
//! ḟ = (f_cmd − f) / τ_f
//! ḟ_cmd = u₀,  [φ̇_cmd, θ̇_cmd, ψ̇_cmd] = u₁..₃
//! ```
//!
//! The inputs are rates of the commands, which keeps the commands themselves
//! in the state and lets the cost penalise both their level and their change.

use nalgebra::{SMatrix, SVector, Vector3};
use serde::{Deserialize, Serialize};

use crate::dynamics::DroneState;
use crate::math::{rk4, thrust_direction};
use crate::GRAVITY;

/// State dimension
pub const NX: usize = 14;
/// Input dimension
pub const NU: usize = 4;

/// Model state vector
pub type StateVector = SVector<f64, NX>;
/// Model input vector
pub type InputVector = SVector<f64, NU>;
/// State Jacobian
pub type StateMatrix = SMatrix<f64, NX, NX>;
/// Input Jacobian
pub type InputMatrix = SMatrix<f64, NX, NU>;

/// State vector layout
pub mod idx {
    /// Position x, y, z
    pub const POS: usize = 0;
    /// Velocity x, y, z
    pub const VEL: usize = 3;
    /// Roll, pitch, yaw
    pub const RPY: usize = 6;
    /// Collective thrust actually produced
    pub const THRUST: usize = 9;
    /// Commanded collective thrust
    pub const THRUST_CMD: usize = 10;
    /// Commanded roll, pitch, yaw
    pub const RPY_CMD: usize = 11;
}

/// Identified model coefficients
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AttitudeModelParams {
    /// Thrust-to-acceleration gain a₀ [m/s² per unit command]
    pub acc_gain: f64,
    /// Thrust-to-acceleration offset a₁ [m/s²]
    pub acc_offset: f64,
    /// Roll response [k₀, k₁]
    pub roll_response: [f64; 2],
    /// Pitch response [k₀, k₁]
    pub pitch_response: [f64; 2],
    /// Yaw response [k₀, k₁]
    pub yaw_response: [f64; 2],
    /// Thrust lag time constant τ_f [s]
    pub thrust_time_constant: f64,
    /// Gravity [m/s²]
    pub gravity: f64,
}

impl Default for AttitudeModelParams {
    fn default() -> Self {
        // Identified on a Crazyflie-class racer
        Self {
            acc_gain: 20.907574256269616,
            acc_offset: 3.653687545690674,
            roll_response: [-3.960889336015948, 4.078293254657104],
            pitch_response: [-6.003842038081178, 6.213752925707588],
            yaw_response: [-0.005347588299390372, 0.0],
            thrust_time_constant: 0.1,
            gravity: GRAVITY,
        }
    }
}

impl AttitudeModelParams {
    /// Collective thrust command that balances gravity at level attitude
    pub fn hover_thrust(&self) -> f64 {
        (self.gravity - self.acc_offset) / self.acc_gain
    }
}

/// Attitude-level dynamics model
#[derive(Debug, Clone)]
pub struct AttitudeModel {
    pub params: AttitudeModelParams,
}

impl Default for AttitudeModel {
    fn default() -> Self {
        Self::new(AttitudeModelParams::default())
    }
}

impl AttitudeModel {
    pub fn new(params: AttitudeModelParams) -> Self {
        Self { params }
    }

    /// Continuous-time derivative ẋ = f(x, u)
    pub fn derivative(&self, x: &StateVector, u: &InputVector) -> StateVector {
        let p = &self.params;
        let rpy = Vector3::new(x[idx::RPY], x[idx::RPY + 1], x[idx::RPY + 2]);
        let thrust = x[idx::THRUST];
        let thrust_cmd = x[idx::THRUST_CMD];

        let acc = thrust_direction(&rpy) * (p.acc_gain * thrust + p.acc_offset)
            - Vector3::new(0.0, 0.0, p.gravity);

        let mut dx = StateVector::zeros();
        for i in 0..3 {
            dx[idx::POS + i] = x[idx::VEL + i];
            dx[idx::VEL + i] = acc[i];
        }
        dx[idx::RPY] = p.roll_response[0] * rpy.x + p.roll_response[1] * x[idx::RPY_CMD];
        dx[idx::RPY + 1] = p.pitch_response[0] * rpy.y + p.pitch_response[1] * x[idx::RPY_CMD + 1];
        dx[idx::RPY + 2] = p.yaw_response[0] * rpy.z + p.yaw_response[1] * x[idx::RPY_CMD + 2];
        dx[idx::THRUST] = (thrust_cmd - thrust) / p.thrust_time_constant;
        dx[idx::THRUST_CMD] = u[0];
        dx[idx::RPY_CMD] = u[1];
        dx[idx::RPY_CMD + 1] = u[2];
        dx[idx::RPY_CMD + 2] = u[3];
        dx
    }

    /// Discrete step x_{k+1} = F(x_k, u_k) with zero-order-hold input
    pub fn step(&self, x: &StateVector, u: &InputVector, dt: f64) -> StateVector {
        rk4(x, dt, |s| self.derivative(s, u))
    }

    /// Jacobians of the discrete step by central finite differences
    ///
    /// Returns (∂F/∂x, ∂F/∂u) evaluated at (x, u).
    pub fn step_jacobians(
        &self,
        x: &StateVector,
        u: &InputVector,
        dt: f64,
    ) -> (StateMatrix, InputMatrix) {
        const EPS: f64 = 1e-6;
        let mut a = StateMatrix::zeros();
        let mut b = InputMatrix::zeros();

        for i in 0..NX {
            let mut xp = *x;
            let mut xm = *x;
            xp[i] += EPS;
            xm[i] -= EPS;
            let col = (self.step(&xp, u, dt) - self.step(&xm, u, dt)) / (2.0 * EPS);
            a.set_column(i, &col);
        }
        for i in 0..NU {
            let mut up = *u;
            let mut um = *u;
            up[i] += EPS;
            um[i] -= EPS;
            let col = (self.step(x, &up, dt) - self.step(x, &um, dt)) / (2.0 * EPS);
            b.set_column(i, &col);
        }
        (a, b)
    }

    /// Pack a measured drone state plus actuation memory into a model state
    pub fn pack_state(
        &self,
        drone: &DroneState,
        thrust: f64,
        thrust_cmd: f64,
        rpy_cmd: &Vector3<f64>,
    ) -> StateVector {
        let rpy = drone.rpy();
        let mut x = StateVector::zeros();
        x.fixed_rows_mut::<3>(idx::POS).copy_from(&drone.position);
        x.fixed_rows_mut::<3>(idx::VEL).copy_from(&drone.velocity);
        x.fixed_rows_mut::<3>(idx::RPY).copy_from(&rpy);
        x[idx::THRUST] = thrust;
        x[idx::THRUST_CMD] = thrust_cmd;
        x.fixed_rows_mut::<3>(idx::RPY_CMD).copy_from(rpy_cmd);
        x
    }
}

/// Position part of a model state
pub fn position_of(x: &StateVector) -> Vector3<f64> {
    x.fixed_rows::<3>(idx::POS).into_owned()
}

/// Velocity part of a model state
pub fn velocity_of(x: &StateVector) -> Vector3<f64> {
    x.fixed_rows::<3>(idx::VEL).into_owned()
}

/// Commanded attitude part of a model state
pub fn rpy_cmd_of(x: &StateVector) -> Vector3<f64> {
    x.fixed_rows::<3>(idx::RPY_CMD).into_owned()
}

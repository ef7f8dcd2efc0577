//! Drone state as reported by state estimation each control tick

use nalgebra::{UnitQuaternion, Vector3};
use serde::{Deserialize, Serialize};

use crate::math::rpy_from_quaternion;

/// Full rigid-body drone state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DroneState {
    /// Position [m] (world frame)
    pub position: Vector3<f64>,
    /// Velocity [m/s] (world frame)
    pub velocity: Vector3<f64>,
    /// Orientation (body to world)
    pub attitude: UnitQuaternion<f64>,
    /// Angular velocity [rad/s] (body frame)
    pub body_rates: Vector3<f64>,
}

impl Default for DroneState {
    fn default() -> Self {
        Self {
            position: Vector3::zeros(),
            velocity: Vector3::zeros(),
            attitude: UnitQuaternion::identity(),
            body_rates: Vector3::zeros(),
        }
    }
}

impl DroneState {
    /// Drone at rest at the given position, level attitude
    pub fn at_rest(position: Vector3<f64>) -> Self {
        Self {
            position,
            ..Default::default()
        }
    }

    /// Roll, pitch, yaw [rad]
    pub fn rpy(&self) -> Vector3<f64> {
        rpy_from_quaternion(&self.attitude)
    }

    /// Speed [m/s]
    pub fn speed(&self) -> f64 {
        self.velocity.norm()
    }

    /// Whether every component is finite
    pub fn is_finite(&self) -> bool {
        self.position.iter().all(|v| v.is_finite())
            && self.velocity.iter().all(|v| v.is_finite())
            && self.attitude.coords.iter().all(|v| v.is_finite())
            && self.body_rates.iter().all(|v| v.is_finite())
    }
}

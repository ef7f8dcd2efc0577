//! Rotation utilities
//!
//! Roll-pitch-yaw follows the extrinsic x-y-z convention used by nalgebra's
//! `from_euler_angles`, i.e. R = Rz(yaw) · Ry(pitch) · Rx(roll).

use nalgebra::{Matrix3, Rotation3, UnitQuaternion, Vector3};
use std::f64::consts::PI;

/// Rotation matrix from roll, pitch, yaw
pub fn rotation_from_rpy(rpy: &Vector3<f64>) -> Matrix3<f64> {
    *Rotation3::from_euler_angles(rpy.x, rpy.y, rpy.z).matrix()
}

/// Rotation about the world z-axis only
pub fn yaw_rotation(yaw: f64) -> Matrix3<f64> {
    let (s, c) = yaw.sin_cos();
    Matrix3::new(
        c, -s, 0.0,
        s, c, 0.0,
        0.0, 0.0, 1.0,
    )
}

/// Body z-axis in world frame for the given roll, pitch, yaw
///
/// ```text
/// z_body = [cr·sp·cy + sr·sy,  cr·sp·sy − sr·cy,  cr·cp]ᵀ
/// ```
pub fn thrust_direction(rpy: &Vector3<f64>) -> Vector3<f64> {
    let (sr, cr) = rpy.x.sin_cos();
    let (sp, cp) = rpy.y.sin_cos();
    let (sy, cy) = rpy.z.sin_cos();
    Vector3::new(
        cr * sp * cy + sr * sy,
        cr * sp * sy - sr * cy,
        cr * cp,
    )
}

/// Roll, pitch, yaw of a unit quaternion
pub fn rpy_from_quaternion(q: &UnitQuaternion<f64>) -> Vector3<f64> {
    let (roll, pitch, yaw) = q.euler_angles();
    Vector3::new(roll, pitch, yaw)
}

/// Unit quaternion from roll, pitch, yaw
pub fn quaternion_from_rpy(rpy: &Vector3<f64>) -> UnitQuaternion<f64> {
    UnitQuaternion::from_euler_angles(rpy.x, rpy.y, rpy.z)
}

/// Wrap an angle to (−π, π]
pub fn wrap_angle(angle: f64) -> f64 {
    let wrapped = (angle + PI).rem_euclid(2.0 * PI) - PI;
    if wrapped <= -PI {
        wrapped + 2.0 * PI
    } else {
        wrapped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use std::f64::consts::FRAC_PI_2;

    #[test]
    fn test_thrust_direction_matches_rotation_matrix() {
        let rpy = Vector3::new(0.2, -0.3, 1.1);
        let r = rotation_from_rpy(&rpy);
        let z = r.column(2).into_owned();
        assert_relative_eq!(thrust_direction(&rpy), z, epsilon = 1e-12);
    }

    #[test]
    fn test_level_attitude_thrusts_up() {
        let z = thrust_direction(&Vector3::new(0.0, 0.0, 2.0));
        assert_relative_eq!(z, Vector3::new(0.0, 0.0, 1.0), epsilon = 1e-12);
    }

    #[test]
    fn test_yaw_rotation() {
        let r = yaw_rotation(FRAC_PI_2);
        let v = r * Vector3::new(1.0, 0.0, 0.0);
        assert_relative_eq!(v, Vector3::new(0.0, 1.0, 0.0), epsilon = 1e-12);
    }

    #[test]
    fn test_quaternion_rpy_roundtrip() {
        let rpy = Vector3::new(0.1, 0.2, -0.4);
        let q = quaternion_from_rpy(&rpy);
        assert_relative_eq!(rpy_from_quaternion(&q), rpy, epsilon = 1e-12);
    }

    #[test]
    fn test_wrap_angle() {
        assert_relative_eq!(wrap_angle(3.0 * PI), PI, epsilon = 1e-12);
        assert_relative_eq!(wrap_angle(-FRAC_PI_2), -FRAC_PI_2, epsilon = 1e-12);
        assert_relative_eq!(wrap_angle(2.0 * PI + 0.5), 0.5, epsilon = 1e-12);
    }
}

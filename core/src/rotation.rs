//! Rotation matrices from Euler angles and the gyro-rate to Euler-rate transform.
//!
//! All matrices are right-handed, active rotations. The device-to-world rotation used throughout the crate is
//!
//! $$
//! R = R_z(\psi) R_y(\theta) R_x(\phi)
//! $$
//!
//! and body angular rates $\omega$ map to Euler angle rates through
//!
//! $$
//! \begin{bmatrix} \dot\phi \\\\ \dot\theta \\\\ \dot\psi \end{bmatrix} =
//! \begin{bmatrix} 1 & \sin\phi \tan\theta & \cos\phi \tan\theta \\\\
//!                 0 & \cos\phi & -\sin\phi \\\\
//!                 0 & \sin\phi / \cos\theta & \cos\phi / \cos\theta \end{bmatrix} \omega
//! $$
use nalgebra::{Matrix3, Vector3};

/// Rotation about the x axis by `angle` radians.
pub fn rotation_x(angle: f64) -> Matrix3<f64> {
    let (s, c) = angle.sin_cos();
    Matrix3::new(
        1.0, 0.0, 0.0, //
        0.0, c, -s, //
        0.0, s, c,
    )
}

/// Rotation about the y axis by `angle` radians.
pub fn rotation_y(angle: f64) -> Matrix3<f64> {
    let (s, c) = angle.sin_cos();
    Matrix3::new(
        c, 0.0, s, //
        0.0, 1.0, 0.0, //
        -s, 0.0, c,
    )
}

/// Rotation about the z axis by `angle` radians.
pub fn rotation_z(angle: f64) -> Matrix3<f64> {
    let (s, c) = angle.sin_cos();
    Matrix3::new(
        c, -s, 0.0, //
        s, c, 0.0, //
        0.0, 0.0, 1.0,
    )
}

/// Device-to-world rotation $R_z(\psi) R_y(\theta) R_x(\phi)$ from a roll/pitch/yaw vector.
pub fn rotation_zyx(euler: &Vector3<f64>) -> Matrix3<f64> {
    rotation_z(euler[2]) * rotation_y(euler[1]) * rotation_x(euler[0])
}

/// Matrix mapping body angular rates to roll/pitch/yaw rates at the given attitude.
///
/// Singular at $\theta = \pm\pi/2$ (gimbal lock); the caller gets infinities there.
pub fn gyro_to_euler_rate(roll: f64, pitch: f64) -> Matrix3<f64> {
    let (sr, cr) = roll.sin_cos();
    let (tp, cp) = (pitch.tan(), pitch.cos());
    Matrix3::new(
        1.0, sr * tp, cr * tp, //
        0.0, cr, -sr, //
        0.0, sr / cp, cr / cp,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;
    use nalgebra::Rotation3;
    use std::f64::consts::FRAC_PI_2;

    #[test]
    fn elementary_rotations_match_nalgebra() {
        let angle = 0.7;
        let rx = Rotation3::from_axis_angle(&Vector3::x_axis(), angle);
        let ry = Rotation3::from_axis_angle(&Vector3::y_axis(), angle);
        let rz = Rotation3::from_axis_angle(&Vector3::z_axis(), angle);
        assert!((rotation_x(angle) - rx.matrix()).norm() < 1e-12);
        assert!((rotation_y(angle) - ry.matrix()).norm() < 1e-12);
        assert!((rotation_z(angle) - rz.matrix()).norm() < 1e-12);
    }

    #[test]
    fn zyx_matches_nalgebra_euler() {
        let euler = Vector3::new(0.1, -0.4, 2.2);
        let expected = Rotation3::from_euler_angles(euler[0], euler[1], euler[2]);
        assert!((rotation_zyx(&euler) - expected.matrix()).norm() < 1e-12);
    }

    #[test]
    fn quarter_turn_about_z() {
        let v = rotation_z(FRAC_PI_2) * Vector3::new(1.0, 0.0, 0.0);
        assert_approx_eq!(v[0], 0.0, 1e-12);
        assert_approx_eq!(v[1], 1.0, 1e-12);
        assert_approx_eq!(v[2], 0.0, 1e-12);
    }

    #[test]
    fn euler_rate_is_identity_when_level() {
        let g = gyro_to_euler_rate(0.0, 0.0);
        assert!((g - Matrix3::identity()).norm() < 1e-15);
    }

    #[test]
    fn euler_rate_yaw_only_with_roll() {
        // A pure body z rate with the device rolled feeds both pitch and yaw rates.
        let roll: f64 = 0.3;
        let rates = gyro_to_euler_rate(roll, 0.0) * Vector3::new(0.0, 0.0, 1.0);
        assert_approx_eq!(rates[0], 0.0, 1e-12);
        assert_approx_eq!(rates[1], -roll.sin(), 1e-12);
        assert_approx_eq!(rates[2], roll.cos(), 1e-12);
    }
}

//! Attitude estimation fusing a gravity/magnetometer attitude with gyro integration.
//!
//! Every update computes a direct attitude measurement from the gravity and magnetic field vectors:
//!
//! $$
//! \phi = \operatorname{atan2}(g_y, g_z) \qquad
//! \theta = \operatorname{atan2}\left(-g_x, \sqrt{g_y^2 + g_z^2}\right) \qquad
//! \psi = \operatorname{atan2}(-m'_y, m'_x), \quad m' = R_y(\theta) R_x(\phi) m
//! $$
//!
//! The tilt-compensated magnetic vector $m'$ keeps the heading free of roll/pitch coupling. The fused attitude is
//! then one linear Kalman step with identity transition and observation, the gyro rates entering as a control
//! input through the Euler-rate transform $G(\phi, \theta) \Delta t$.
//!
//! A gyro-only track is integrated alongside for diagnostics.
use crate::config::OrientationConfig;
use crate::kalman::{LinearKalmanModel, linear_kalman_step};
use crate::rotation::{gyro_to_euler_rate, rotation_x, rotation_y};
use crate::{wrap_euler, wrap_once};

use nalgebra::{DMatrix, DVector, Matrix3, Vector3};
use std::fmt::{self, Display};

#[derive(Clone, Debug)]
pub struct OrientationEstimator {
    /// Fused roll, pitch, yaw (rad)
    pub orientation: Vector3<f64>,
    /// Direct attitude measurement from gravity and magnetic field (rad)
    pub orientation_from_accel_mag: Vector3<f64>,
    /// Gyro-integration-only attitude (rad)
    pub orientation_from_gyro: Vector3<f64>,
    /// Covariance of the fused attitude
    pub covariance: Matrix3<f64>,
    process_noise: Matrix3<f64>,
    measurement_noise: Matrix3<f64>,
    initialized: bool,
}

impl Display for OrientationEstimator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "OrientationEstimator {{ fused: [{:.4}, {:.4}, {:.4}], accel/mag: [{:.4}, {:.4}, {:.4}], gyro: [{:.4}, {:.4}, {:.4}] }}",
            self.orientation[0],
            self.orientation[1],
            self.orientation[2],
            self.orientation_from_accel_mag[0],
            self.orientation_from_accel_mag[1],
            self.orientation_from_accel_mag[2],
            self.orientation_from_gyro[0],
            self.orientation_from_gyro[1],
            self.orientation_from_gyro[2],
        )
    }
}

impl Default for OrientationEstimator {
    fn default() -> Self {
        Self::new(&OrientationConfig::default())
    }
}

impl OrientationEstimator {
    pub fn new(config: &OrientationConfig) -> Self {
        Self {
            orientation: Vector3::zeros(),
            orientation_from_accel_mag: Vector3::zeros(),
            orientation_from_gyro: Vector3::zeros(),
            covariance: Matrix3::zeros(),
            process_noise: Matrix3::from_diagonal(&Vector3::from(config.process_noise)),
            measurement_noise: Matrix3::from_diagonal(&Vector3::from(config.measurement_noise)),
            initialized: false,
        }
    }

    /// Forget all attitude history; the next update is treated as the first.
    pub fn reset(&mut self) {
        self.orientation = Vector3::zeros();
        self.orientation_from_accel_mag = Vector3::zeros();
        self.orientation_from_gyro = Vector3::zeros();
        self.covariance = Matrix3::zeros();
        self.initialized = false;
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Fuse one IMU sample and return the new roll/pitch/yaw.
    ///
    /// On the first call `dt` is ignored and the output is the gravity/magnetometer attitude.
    ///
    /// # Arguments
    /// * `gravity` - gravity vector in the device frame, pointing away from the Earth (any units)
    /// * `magnetic` - magnetic field vector in the device frame (any units)
    /// * `gyro_rate` - body angular rates (rad/s)
    /// * `dt` - time since the previous sample (s)
    ///
    /// A zero gravity or magnetic vector yields NaN angles; callers must screen such samples.
    pub fn update(
        &mut self,
        gravity: &Vector3<f64>,
        magnetic: &Vector3<f64>,
        gyro_rate: &Vector3<f64>,
        dt: f64,
    ) -> Vector3<f64> {
        self.orientation_from_accel_mag = attitude_from_gravity_and_magnetic(gravity, magnetic);

        if !self.initialized {
            self.orientation = self.orientation_from_accel_mag;
            self.orientation_from_gyro = self.orientation_from_accel_mag;
            self.initialized = true;
            return self.orientation;
        }

        self.fuse(gyro_rate, dt);
        self.integrate_gyro(gyro_rate, dt);
        self.orientation
    }

    fn fuse(&mut self, gyro_rate: &Vector3<f64>, dt: f64) {
        let euler_rate = gyro_to_euler_rate(self.orientation[0], self.orientation[1]) * dt;
        let predicted = self.orientation + euler_rate * gyro_rate;
        // Keep the measurement on the same branch as the prediction so the innovation never spans a full turn.
        let measurement = predicted + wrap_euler(&(self.orientation_from_accel_mag - predicted));

        let model = LinearKalmanModel {
            transition: DMatrix::identity(3, 3),
            control: to_dmatrix(&euler_rate),
            observation: DMatrix::identity(3, 3),
            process_noise: to_dmatrix(&self.process_noise),
            measurement_noise: to_dmatrix(&self.measurement_noise),
        };
        let (mean, cov) = linear_kalman_step(
            &model,
            &DVector::from_column_slice(self.orientation.as_slice()),
            &to_dmatrix(&self.covariance),
            &DVector::from_column_slice(gyro_rate.as_slice()),
            &DVector::from_column_slice(measurement.as_slice()),
        );
        self.orientation = wrap_euler(&Vector3::new(mean[0], mean[1], mean[2]));
        self.covariance = Matrix3::from_column_slice(cov.as_slice());
    }

    fn integrate_gyro(&mut self, gyro_rate: &Vector3<f64>, dt: f64) {
        let g = gyro_to_euler_rate(self.orientation_from_gyro[0], self.orientation_from_gyro[1]);
        self.orientation_from_gyro = (self.orientation_from_gyro + g * gyro_rate * dt).map(wrap_once);
    }
}

fn to_dmatrix(m: &Matrix3<f64>) -> DMatrix<f64> {
    DMatrix::from_column_slice(3, 3, m.as_slice())
}

/// Roll/pitch from the gravity vector and tilt-compensated yaw from the magnetic field.
pub fn attitude_from_gravity_and_magnetic(
    gravity: &Vector3<f64>,
    magnetic: &Vector3<f64>,
) -> Vector3<f64> {
    let roll = gravity[1].atan2(gravity[2]);
    let pitch = (-gravity[0]).atan2(gravity[1].hypot(gravity[2]));
    let magnetic_fixed = rotation_y(pitch) * rotation_x(roll) * magnetic;
    let yaw = (-magnetic_fixed[1]).atan2(magnetic_fixed[0]);
    Vector3::new(roll, pitch, yaw)
}

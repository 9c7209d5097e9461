//! Inertial/visual localization with a Rao-Blackwellized particle filter
//!
//! This crate estimates the pose (position, velocity, orientation) of a moving device together with a sparse map
//! of 3D landmarks. Inertial measurements (accelerometer, gyroscope, magnetometer, and a gravity estimate) drive the
//! motion model while keypoint observations from a camera weight the motion hypotheses. The filter is a
//! Rao-Blackwellized particle filter (RBPF): every particle samples one device trajectory and analytically tracks its
//! own set of landmarks, each with a small Kalman filter conditioned on that trajectory.
//!
//! This crate is primarily built off of the following dependencies:
//! - [`nalgebra`](https://crates.io/crates/nalgebra): Provides the linear algebra tools for the filters.
//! - [`rand`](https://crates.io/crates/rand) and [`rand_distr`](https://crates.io/crates/rand_distr): Provides random
//!   number generation for process noise and resampling.
//! - [`rayon`](https://crates.io/crates/rayon): Optional per-particle parallelism.
//!
//! All other functionality is auxiliary (configuration, record parsing, replay and I/O).
//!
//! ## Crate overview
//!
//! - [rotation]: Rotation matrices from Euler angles and the gyro-rate to Euler-rate transform.
//! - [kalman]: A single linear Kalman filter predict + correct step.
//! - [linalg]: Symmetrization, SPD solves and covariance factors.
//! - [orientation]: Attitude estimation fusing gravity/magnetometer attitude with gyro integration.
//! - [landmark]: Landmarks owned by a particle, the camera model, initialization and Kalman update.
//! - [particle]: The particle (one motion hypothesis), motion model, resampling and averaging strategies.
//! - [rbpf]: The particle set and the filter engine (IMU-driven and camera-driven steps).
//! - [config]: Serializable configuration for the estimator and the filter.
//! - [messages]: Sensor and keypoint records, event streams and their CSV readers.
//! - [state]: The localizer that sequences IMU and camera ticks and stores the outputs.
//! - [sim]: Replay of recorded data through the localizer.
//!
//! ## State and frame conventions
//!
//! Each particle carries the state
//!
//! $$
//! x = [p_x, p_y, p_z, v_x, v_y, v_z, a_x, a_y, a_z, \phi, \theta, \psi]
//! $$
//!
//! where position, velocity and acceleration are expressed in the world frame and $\phi$, $\theta$, $\psi$ are the
//! roll, pitch and yaw Euler angles (radians). The device-to-world rotation is
//! $R = R_z(\psi) R_y(\theta) R_x(\phi)$. Euler angles are kept in $[-\pi, \pi)$ by [wrap_once] after every update.
//!
//! ### Motion model
//!
//! Between ticks each particle follows a constant-acceleration model with isotropic Gaussian acceleration noise
//! $w \sim N(0, \sigma_a I)$:
//!
//! $$
//! p(+) = p(-) + v(-) t + \frac{1}{2} (a(-) + w) t^2 \qquad v(+) = v(-) + (a(-) + w) t
//! $$
//!
//! On an IMU tick the acceleration and orientation are then replaced by the sensor-derived values; on a camera tick
//! they are carried over.

pub mod config;
pub mod error;
pub mod kalman;
pub mod landmark;
pub mod linalg;
pub mod messages;
pub mod orientation;
pub mod particle;
pub mod rbpf;
pub mod rotation;
pub mod sim;
pub mod state;

pub use config::{OrientationConfig, RbpfConfig, SlamConfig};
pub use error::{Result, SlamError};
pub use landmark::{CameraModel, Keypoint, Landmark};
pub use orientation::OrientationEstimator;
pub use particle::{Particle, PoseEstimate};
pub use rbpf::{ParticleSet, RbpfEngine};
pub use state::Localizer;

use nalgebra::Vector3;
use std::f64::consts::PI;

/// Shift an angle back into $[-\pi, \pi)$ by at most one full turn.
///
/// Angles are assumed to never move by more than $2\pi$ in one update, so a single correction is enough. Angles
/// further out are shifted once and left as they are.
///
/// # Example
/// ```rust
/// use rbslam::wrap_once;
/// use std::f64::consts::PI;
/// let wrapped = wrap_once(PI + 0.1);
/// assert!((wrapped - (-PI + 0.1)).abs() < 1e-12);
/// ```
pub fn wrap_once(angle: f64) -> f64 {
    if angle >= PI {
        angle - 2.0 * PI
    } else if angle < -PI {
        angle + 2.0 * PI
    } else {
        angle
    }
}

/// Apply [wrap_once] to each component of a roll/pitch/yaw vector.
pub fn wrap_euler(euler: &Vector3<f64>) -> Vector3<f64> {
    euler.map(wrap_once)
}

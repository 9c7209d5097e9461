//! Landmarks: 3D map points owned by a single particle.
//!
//! A landmark is created the first time its keypoint index is observed and refined by a small extended Kalman
//! filter every time the same index is seen again. Because each particle owns its landmarks outright, the landmark
//! posteriors are conditioned on that particle's trajectory alone, which is what makes the filter
//! Rao-Blackwellized.
//!
//! ## Camera model
//!
//! Pinhole camera rigidly attached to the device: the optical axis is the device $+z$ axis, image $x$/$y$ follow
//! device $x$/$y$ and keypoint coordinates are measured from the principal point. For a landmark $l$ seen from a
//! device at position $p$ with device-to-world rotation $R$:
//!
//! $$
//! c = R^T (l - p) \qquad h(l) = \frac{f}{c_z} \begin{bmatrix} c_x \\\\ c_y \end{bmatrix}
//! $$
//!
//! A single view gives no depth, so a new landmark is placed at a configured depth along the viewing ray with a
//! covariance elongated along that ray.
use crate::config::RbpfConfig;
use crate::rotation::rotation_zyx;

use nalgebra::{Matrix2, Matrix2x3, Matrix3, Vector2, Vector3};
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};

/// Landmarks closer to the image plane than this are not projected.
const MIN_DEPTH: f64 = 1e-6;

/// One matched feature in a camera frame.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Keypoint {
    /// Identifier that is stable across frames (assigned by the feature tracker)
    pub index: u64,
    /// Pixel x coordinate relative to the principal point
    pub x: f64,
    /// Pixel y coordinate relative to the principal point
    pub y: f64,
}

impl Keypoint {
    pub fn new(index: u64, x: f64, y: f64) -> Self {
        Keypoint { index, x, y }
    }

    pub fn pixel(&self) -> Vector2<f64> {
        Vector2::new(self.x, self.y)
    }
}

/// Intrinsics and noise figures of the camera.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CameraModel {
    pub focal_length_px: f64,
    pub initial_depth_m: f64,
    pub depth_std_m: f64,
    pub pixel_noise_std: f64,
}

impl From<&RbpfConfig> for CameraModel {
    fn from(config: &RbpfConfig) -> Self {
        CameraModel {
            focal_length_px: config.focal_length_px,
            initial_depth_m: config.initial_depth_m,
            depth_std_m: config.depth_std_m,
            pixel_noise_std: config.pixel_noise_std,
        }
    }
}

impl CameraModel {
    /// Unit viewing ray of a keypoint in the device frame.
    pub fn ray(&self, keypoint: &Keypoint) -> Vector3<f64> {
        Vector3::new(keypoint.x, keypoint.y, self.focal_length_px).normalize()
    }

    /// Landmark coordinates in the device frame.
    fn to_device(
        point: &Vector3<f64>,
        device_position: &Vector3<f64>,
        device_rotation: &Matrix3<f64>,
    ) -> Vector3<f64> {
        device_rotation.transpose() * (point - device_position)
    }

    /// Pixel coordinates of a device-frame point, `None` if it is not in front of the camera.
    fn project(&self, p_c: &Vector3<f64>) -> Option<Vector2<f64>> {
        if p_c[2] <= MIN_DEPTH {
            return None;
        }
        Some(self.focal_length_px / p_c[2] * Vector2::new(p_c[0], p_c[1]))
    }

    /// Jacobian of the projection with respect to the device-frame point.
    fn projection_jacobian(&self, p_c: &Vector3<f64>) -> Matrix2x3<f64> {
        let inv_z = 1.0 / p_c[2];
        let f = self.focal_length_px;
        Matrix2x3::new(
            f * inv_z, 0.0, -f * p_c[0] * inv_z * inv_z, //
            0.0, f * inv_z, -f * p_c[1] * inv_z * inv_z,
        )
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Landmark {
    /// Position in the owning particle's landmark list
    pub id: usize,
    /// Camera step at which the landmark was first observed
    pub first_seen_step: u64,
    /// Keypoint index it was created from
    pub keypoint_index: u64,
    pub position_estimate: Vector3<f64>,
    pub covariance: Matrix3<f64>,
}

impl Display for Landmark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Landmark {{ id: {}, keypoint: {}, first_seen: {}, position: [{:.3}, {:.3}, {:.3}], sigma: [{:.3}, {:.3}, {:.3}] }}",
            self.id,
            self.keypoint_index,
            self.first_seen_step,
            self.position_estimate[0],
            self.position_estimate[1],
            self.position_estimate[2],
            self.covariance[(0, 0)].sqrt(),
            self.covariance[(1, 1)].sqrt(),
            self.covariance[(2, 2)].sqrt(),
        )
    }
}

impl Landmark {
    /// Place a new landmark along the viewing ray of `keypoint`.
    ///
    /// The covariance combines the device position uncertainty, the depth uncertainty along the ray and the pixel
    /// noise projected to the assumed depth across the ray.
    pub fn initialize(
        id: usize,
        step: u64,
        keypoint: &Keypoint,
        device_position: &Vector3<f64>,
        device_orientation: &Vector3<f64>,
        pose_covariance: &Matrix3<f64>,
        camera: &CameraModel,
    ) -> Self {
        let ray = rotation_zyx(device_orientation) * camera.ray(keypoint);
        let along = ray * ray.transpose();
        let across = Matrix3::identity() - along;
        let lateral_std =
            camera.initial_depth_m * camera.pixel_noise_std / camera.focal_length_px;
        Landmark {
            id,
            first_seen_step: step,
            keypoint_index: keypoint.index,
            position_estimate: device_position + camera.initial_depth_m * ray,
            covariance: pose_covariance
                + camera.depth_std_m.powi(2) * along
                + lateral_std.powi(2) * across,
        }
    }

    /// Pixel position at which this landmark is expected from the given device pose.
    pub fn predict_pixel(
        &self,
        device_position: &Vector3<f64>,
        device_orientation: &Vector3<f64>,
        camera: &CameraModel,
    ) -> Option<Vector2<f64>> {
        let rotation = rotation_zyx(device_orientation);
        camera.project(&CameraModel::to_device(
            &self.position_estimate,
            device_position,
            &rotation,
        ))
    }

    /// Correct the estimate with a re-observation and return the Gaussian log-likelihood of the innovation.
    ///
    /// The log-likelihood omits the normalizing constant: it is $-\frac{1}{2} \nu^T S^{-1} \nu$, so an exact
    /// reprojection scores 0. Returns `None`, leaving the landmark untouched, when the landmark is not in front of
    /// the camera or the innovation covariance is singular.
    pub fn update(
        &mut self,
        keypoint: &Keypoint,
        device_position: &Vector3<f64>,
        device_orientation: &Vector3<f64>,
        camera: &CameraModel,
    ) -> Option<f64> {
        let rotation = rotation_zyx(device_orientation);
        let p_c = CameraModel::to_device(&self.position_estimate, device_position, &rotation);
        let predicted = camera.project(&p_c)?;

        let h = camera.projection_jacobian(&p_c) * rotation.transpose();
        let r = Matrix2::identity() * camera.pixel_noise_std.powi(2);
        let s = h * self.covariance * h.transpose() + r;
        let s_inv = s.try_inverse()?;

        let innovation = keypoint.pixel() - predicted;
        let gain = self.covariance * h.transpose() * s_inv;
        self.position_estimate += gain * innovation;
        let cov = (Matrix3::identity() - gain * h) * self.covariance;
        self.covariance = 0.5 * (cov + cov.transpose());

        Some(-0.5 * (innovation.transpose() * s_inv * innovation)[(0, 0)])
    }
}

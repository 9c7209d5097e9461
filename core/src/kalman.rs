//! A single linear Kalman filter step (predict + correct).
//!
//! The model is
//!
//! $$
//! x_k = F x_{k-1} + B u_k + w_k, \quad w_k \sim N(0, Q) \qquad y_k = H x_k + v_k, \quad v_k \sim N(0, R)
//! $$
//!
//! and one call to [linear_kalman_step] performs
//!
//! $$
//! \bar\mu = F\mu + Bu, \quad \bar\Sigma = F \Sigma F^T + Q, \quad
//! K = \bar\Sigma H^T (H \bar\Sigma H^T + R)^{-1}, \quad
//! \mu' = \bar\mu + K(y - H\bar\mu), \quad \Sigma' = (I - KH)\bar\Sigma
//! $$
use crate::linalg::{spd_solve, symmetrize};

use log::warn;
use nalgebra::{DMatrix, DVector};

/// System and noise matrices of a linear Gaussian model.
#[derive(Clone, Debug)]
pub struct LinearKalmanModel {
    /// State transition matrix F
    pub transition: DMatrix<f64>,
    /// Control input matrix B
    pub control: DMatrix<f64>,
    /// Observation matrix H
    pub observation: DMatrix<f64>,
    /// Process noise covariance Q
    pub process_noise: DMatrix<f64>,
    /// Measurement noise covariance R
    pub measurement_noise: DMatrix<f64>,
}

/// Run one predict + correct cycle and return the posterior `(mean, covariance)`.
///
/// If the innovation covariance cannot be inverted the correction is skipped and the prediction is returned.
///
/// # Panics
/// If the matrix dimensions are inconsistent.
pub fn linear_kalman_step(
    model: &LinearKalmanModel,
    mean: &DVector<f64>,
    covariance: &DMatrix<f64>,
    control_input: &DVector<f64>,
    measurement: &DVector<f64>,
) -> (DVector<f64>, DMatrix<f64>) {
    let f = &model.transition;
    let h = &model.observation;

    let mean_pred = f * mean + &model.control * control_input;
    let cov_pred = symmetrize(&(f * covariance * f.transpose() + &model.process_noise));

    let s = h * &cov_pred * h.transpose() + &model.measurement_noise;
    // K^T = S^-1 H Σ (S and Σ symmetric)
    let Some(gain_t) = spd_solve(&s, &(h * &cov_pred)) else {
        warn!("innovation covariance is singular; skipping Kalman correction");
        return (mean_pred, cov_pred);
    };
    let gain = gain_t.transpose();

    let innovation = measurement - h * &mean_pred;
    let mean_post = &mean_pred + &gain * innovation;
    let eye = DMatrix::<f64>::identity(cov_pred.nrows(), cov_pred.ncols());
    let cov_post = symmetrize(&((eye - &gain * h) * &cov_pred));
    (mean_post, cov_post)
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    fn scalar_model(q: f64, r: f64) -> LinearKalmanModel {
        LinearKalmanModel {
            transition: DMatrix::identity(1, 1),
            control: DMatrix::from_element(1, 1, 1.0),
            observation: DMatrix::identity(1, 1),
            process_noise: DMatrix::from_element(1, 1, q),
            measurement_noise: DMatrix::from_element(1, 1, r),
        }
    }

    #[test]
    fn scalar_step_matches_closed_form() {
        let model = scalar_model(0.1, 0.01);
        let mean = DVector::from_element(1, 1.0);
        let cov = DMatrix::from_element(1, 1, 0.0);
        let u = DVector::from_element(1, 0.5);
        let y = DVector::from_element(1, 2.0);
        let (m, p) = linear_kalman_step(&model, &mean, &cov, &u, &y);
        // prediction 1.5 with variance 0.1; gain 0.1 / 0.11
        let k = 0.1 / 0.11;
        assert_approx_eq!(m[0], 1.5 + k * (2.0 - 1.5), 1e-12);
        assert_approx_eq!(p[(0, 0)], (1.0 - k) * 0.1, 1e-12);
    }

    #[test]
    fn huge_measurement_noise_keeps_prediction() {
        let model = scalar_model(0.1, 1e12);
        let mean = DVector::from_element(1, 3.0);
        let cov = DMatrix::from_element(1, 1, 1.0);
        let u = DVector::from_element(1, -1.0);
        let y = DVector::from_element(1, 100.0);
        let (m, p) = linear_kalman_step(&model, &mean, &cov, &u, &y);
        assert_approx_eq!(m[0], 2.0, 1e-6);
        assert_approx_eq!(p[(0, 0)], 1.1, 1e-6);
    }

    #[test]
    fn posterior_covariance_shrinks() {
        let model = LinearKalmanModel {
            transition: DMatrix::identity(3, 3),
            control: DMatrix::zeros(3, 3),
            observation: DMatrix::identity(3, 3),
            process_noise: DMatrix::identity(3, 3) * 0.1,
            measurement_noise: DMatrix::identity(3, 3) * 0.01,
        };
        let cov = DMatrix::identity(3, 3);
        let (_, p) = linear_kalman_step(
            &model,
            &DVector::zeros(3),
            &cov,
            &DVector::zeros(3),
            &DVector::from_vec(vec![1.0, 2.0, 3.0]),
        );
        for i in 0..3 {
            assert!(p[(i, i)] < cov[(i, i)]);
            assert!(p[(i, i)] > 0.0);
        }
        assert!((&p - p.transpose()).amax() < 1e-15);
    }
}

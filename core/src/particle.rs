//! Particles, the motion model, and the resampling and averaging strategies of the filter.
//!
//! A [Particle] is one complete motion hypothesis: kinematics, orientation and its own landmark map. Propagation
//! never mutates a particle in place; it returns a new, fully owned particle so particles can be processed
//! independently (and in parallel) without sharing any state.
use crate::landmark::{CameraModel, Keypoint, Landmark};

use nalgebra::{Matrix3, Vector3};
use rand::Rng;
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Particle {
    /// World-frame position (m)
    pub position: Vector3<f64>,
    /// World-frame velocity (m/s)
    pub velocity: Vector3<f64>,
    /// World-frame acceleration (m/s²)
    pub acceleration: Vector3<f64>,
    /// Roll, pitch, yaw (rad), each in [-π, π)
    pub orientation: Vector3<f64>,
    pub landmarks: Vec<Landmark>,
}

impl Display for Particle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Particle")
            .field(
                "position",
                &format_args!(
                    "({:.3}, {:.3}, {:.3}) m",
                    self.position[0], self.position[1], self.position[2]
                ),
            )
            .field(
                "velocity",
                &format_args!(
                    "({:.3}, {:.3}, {:.3}) m/s",
                    self.velocity[0], self.velocity[1], self.velocity[2]
                ),
            )
            .field(
                "orientation",
                &format_args!(
                    "({:.3}, {:.3}, {:.3}) rad",
                    self.orientation[0], self.orientation[1], self.orientation[2]
                ),
            )
            .field("landmarks", &self.landmarks.len())
            .finish()
    }
}

/// Isotropic Gaussian acceleration noise with the given per-axis variance.
pub fn sample_acceleration_noise<R: Rng + ?Sized>(variance: f64, rng: &mut R) -> Vector3<f64> {
    let std = variance.max(0.0).sqrt();
    Vector3::from_fn(|_, _| rng.sample::<f64, _>(StandardNormal) * std)
}

impl Particle {
    pub fn new(
        position: Vector3<f64>,
        velocity: Vector3<f64>,
        acceleration: Vector3<f64>,
        orientation: Vector3<f64>,
    ) -> Particle {
        Particle {
            position,
            velocity,
            acceleration,
            orientation,
            landmarks: Vec::new(),
        }
    }

    /// Constant-acceleration step with an additive acceleration noise term.
    fn kinematic_step(&self, dt: f64, noise: &Vector3<f64>) -> Particle {
        let half_dt2 = 0.5 * dt * dt;
        let mut next = self.clone();
        next.position = self.position + dt * self.velocity + half_dt2 * (self.acceleration + noise);
        next.velocity = self.velocity + dt * (self.acceleration + noise);
        next
    }

    /// IMU-driven propagation with an explicit noise draw.
    ///
    /// After the kinematic step the acceleration and orientation are replaced by the sensor-derived values.
    pub fn propagate_imu_with_noise(
        &self,
        dt: f64,
        accel: &Vector3<f64>,
        orientation: &Vector3<f64>,
        noise: &Vector3<f64>,
    ) -> Particle {
        let mut next = self.kinematic_step(dt, noise);
        next.acceleration = *accel;
        next.orientation = *orientation;
        next
    }

    /// IMU-driven propagation, drawing acceleration noise with variance `noise_a_sys` per axis.
    pub fn propagate_imu<R: Rng + ?Sized>(
        &self,
        dt: f64,
        accel: &Vector3<f64>,
        orientation: &Vector3<f64>,
        noise_a_sys: f64,
        rng: &mut R,
    ) -> Particle {
        let noise = sample_acceleration_noise(noise_a_sys, rng);
        self.propagate_imu_with_noise(dt, accel, orientation, &noise)
    }

    /// Camera-driven propagation with an explicit noise draw; acceleration and orientation carry over.
    pub fn propagate_camera_with_noise(&self, dt: f64, noise: &Vector3<f64>) -> Particle {
        self.kinematic_step(dt, noise)
    }

    /// Camera-driven propagation, drawing acceleration noise with variance `noise_a_sys` per axis.
    pub fn propagate_camera<R: Rng + ?Sized>(
        &self,
        dt: f64,
        noise_a_sys: f64,
        rng: &mut R,
    ) -> Particle {
        let noise = sample_acceleration_noise(noise_a_sys, rng);
        self.propagate_camera_with_noise(dt, &noise)
    }

    /// Index of the landmark created from `keypoint_index` strictly before `step`.
    pub fn find_landmark(&self, step: u64, keypoint_index: u64) -> Option<usize> {
        self.landmarks
            .iter()
            .position(|l| l.keypoint_index == keypoint_index && l.first_seen_step < step)
    }

    /// Apply one keypoint observation and return its log-likelihood contribution.
    ///
    /// An unseen keypoint index creates a landmark and contributes 0 (a neutral factor of 1). A known index updates
    /// its landmark in place. A landmark created earlier in the same step is left alone and contributes 0.
    ///
    /// A known landmark that cannot be projected (at or behind the image plane) is not updated and contributes
    /// `-inf`: the keypoint was seen, so this particle's pose contradicts the observation.
    pub fn observe(
        &mut self,
        keypoint: &Keypoint,
        step: u64,
        pose_covariance: &Matrix3<f64>,
        camera: &CameraModel,
    ) -> f64 {
        match self.find_landmark(step, keypoint.index) {
            Some(i) => self.landmarks[i]
                .update(keypoint, &self.position, &self.orientation, camera)
                .unwrap_or(f64::NEG_INFINITY),
            None => {
                if self.landmarks.iter().any(|l| l.keypoint_index == keypoint.index) {
                    return 0.0;
                }
                let landmark = Landmark::initialize(
                    self.landmarks.len(),
                    step,
                    keypoint,
                    &self.position,
                    &self.orientation,
                    pose_covariance,
                    camera,
                );
                self.landmarks.push(landmark);
                0.0
            }
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum ParticleResamplingStrategy {
    /// One uniform offset plus equal strides (low variance)
    #[default]
    Systematic,
    /// One independent uniform draw per stratum
    Stratified,
    /// Independent draws from the categorical distribution
    Multinomial,
    /// Deterministic copies of floor(M w) plus systematic draws on the remainder
    Residual,
}

impl ParticleResamplingStrategy {
    /// Draw `weights.len()` particle indices. Weights are expected to sum to one.
    pub fn resample<R: Rng + ?Sized>(&self, weights: &[f64], rng: &mut R) -> Vec<usize> {
        match self {
            ParticleResamplingStrategy::Systematic => systematic_resample(weights, rng),
            ParticleResamplingStrategy::Stratified => stratified_resample(weights, rng),
            ParticleResamplingStrategy::Multinomial => multinomial_resample(weights, rng),
            ParticleResamplingStrategy::Residual => residual_resample(weights, rng),
        }
    }
}

/// Walk the cumulative weights for each sorted threshold, clamping to the last index on round-off.
///
/// Zero-weight entries are stepped over, so a threshold of exactly 0 never selects them.
fn walk_cumulative(weights: &[f64], thresholds: impl Iterator<Item = f64>) -> Vec<usize> {
    let last = weights.len().saturating_sub(1);
    let mut indices = Vec::with_capacity(weights.len());
    let mut i = 0;
    let mut cumulative = weights.first().copied().unwrap_or(0.0);
    for u in thresholds {
        while (cumulative < u || weights[i] <= 0.0) && i < last {
            i += 1;
            cumulative += weights[i];
        }
        indices.push(i);
    }
    indices
}

/// Systematic resampling for a given offset `offset` in [0, 1/M).
pub fn systematic_resample_with_offset(weights: &[f64], offset: f64) -> Vec<usize> {
    systematic_draws(weights, weights.len(), offset)
}

fn systematic_draws(weights: &[f64], num_samples: usize, offset: f64) -> Vec<usize> {
    if weights.is_empty() {
        return Vec::new();
    }
    let step = 1.0 / num_samples as f64;
    walk_cumulative(weights, (0..num_samples).map(|m| offset + m as f64 * step))
}

/// Systematic resampling: one offset `r ~ U(0, 1/M)` and thresholds `r + m/M`.
pub fn systematic_resample<R: Rng + ?Sized>(weights: &[f64], rng: &mut R) -> Vec<usize> {
    if weights.is_empty() {
        return Vec::new();
    }
    let offset = rng.random::<f64>() / weights.len() as f64;
    systematic_resample_with_offset(weights, offset)
}

pub fn stratified_resample<R: Rng + ?Sized>(weights: &[f64], rng: &mut R) -> Vec<usize> {
    let m = weights.len();
    let thresholds: Vec<f64> = (0..m)
        .map(|k| (k as f64 + rng.random::<f64>()) / m as f64)
        .collect();
    walk_cumulative(weights, thresholds.into_iter())
}

pub fn multinomial_resample<R: Rng + ?Sized>(weights: &[f64], rng: &mut R) -> Vec<usize> {
    let mut draws: Vec<f64> = (0..weights.len()).map(|_| rng.random::<f64>()).collect();
    draws.sort_by(|a, b| a.total_cmp(b));
    let mut indices = walk_cumulative(weights, draws.into_iter());
    // Sorted draws would otherwise leave the output grouped by index.
    for k in (1..indices.len()).rev() {
        let j = rng.random_range(0..=k);
        indices.swap(k, j);
    }
    indices
}

pub fn residual_resample<R: Rng + ?Sized>(weights: &[f64], rng: &mut R) -> Vec<usize> {
    let n = weights.len();
    let mut indices = Vec::with_capacity(n);
    let mut residual = vec![0.0; n];
    for (i, &w) in weights.iter().enumerate() {
        let copies = (w * n as f64).floor() as usize;
        indices.extend(std::iter::repeat_n(i, copies));
        residual[i] = w * n as f64 - copies as f64;
    }
    indices.truncate(n);
    let remaining = n - indices.len();
    if remaining > 0 {
        let sum_residual: f64 = residual.iter().sum();
        if sum_residual > 0.0 {
            residual.iter_mut().for_each(|r| *r /= sum_residual);
        } else {
            residual.iter_mut().for_each(|r| *r = 1.0 / n as f64);
        }
        let offset = rng.random::<f64>() / remaining as f64;
        indices.extend(systematic_draws(&residual, remaining, offset));
    }
    indices
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum ParticleAveragingStrategy {
    #[default]
    WeightedAverage,
    UnweightedAverage,
    HighestWeight,
}

/// Summary of the particle cloud reported as the device state.
#[derive(Clone, Debug, PartialEq)]
pub struct PoseEstimate {
    pub position: Vector3<f64>,
    pub velocity: Vector3<f64>,
    pub acceleration: Vector3<f64>,
    pub orientation: Vector3<f64>,
    /// Spread of particle positions about `position`
    pub position_covariance: Matrix3<f64>,
    /// Index of the particle with the largest weight
    pub best_particle: usize,
}

impl ParticleAveragingStrategy {
    /// Reduce the particle cloud to one estimate. `None` for an empty set.
    pub fn estimate(&self, particles: &[Particle], weights: &[f64]) -> Option<PoseEstimate> {
        let best_particle = weights
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map(|(i, _)| i)?;
        let effective: Vec<f64> = match self {
            ParticleAveragingStrategy::WeightedAverage => {
                let sum: f64 = weights.iter().sum();
                if sum > 0.0 && sum.is_finite() {
                    weights.iter().map(|w| w / sum).collect()
                } else {
                    vec![1.0 / particles.len() as f64; particles.len()]
                }
            }
            ParticleAveragingStrategy::UnweightedAverage => {
                vec![1.0 / particles.len() as f64; particles.len()]
            }
            ParticleAveragingStrategy::HighestWeight => {
                let mut one_hot = vec![0.0; particles.len()];
                one_hot[best_particle] = 1.0;
                one_hot
            }
        };
        Some(weighted_state(particles, &effective, best_particle))
    }
}

fn weighted_state(particles: &[Particle], weights: &[f64], best_particle: usize) -> PoseEstimate {
    let mut position = Vector3::zeros();
    let mut velocity = Vector3::zeros();
    let mut acceleration = Vector3::zeros();
    let mut sin_sum = Vector3::<f64>::zeros();
    let mut cos_sum = Vector3::<f64>::zeros();
    for (p, &w) in particles.iter().zip(weights) {
        position += w * p.position;
        velocity += w * p.velocity;
        acceleration += w * p.acceleration;
        sin_sum += w * p.orientation.map(f64::sin);
        cos_sum += w * p.orientation.map(f64::cos);
    }
    // Circular mean so that angles on either side of ±π average correctly.
    let orientation = sin_sum.zip_map(&cos_sum, f64::atan2);
    let mut position_covariance = Matrix3::zeros();
    for (p, &w) in particles.iter().zip(weights) {
        let d = p.position - position;
        position_covariance += w * d * d.transpose();
    }
    PoseEstimate {
        position,
        velocity,
        acceleration,
        orientation,
        position_covariance,
        best_particle,
    }
}

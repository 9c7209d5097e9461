//! Rao-Blackwellized particle filter (RBPF) for visual-inertial localization and mapping.
//!
//! Particles sample the device trajectory; each particle carries its own landmark map whose points are tracked
//! analytically with small extended Kalman filters conditioned on that trajectory. IMU ticks only propagate the
//! particles. Camera ticks propagate, weight every particle by the reprojection likelihood of its re-observed
//! landmarks and, when the summed weight is large enough to be trusted, resample.

use crate::config::RbpfConfig;
use crate::landmark::{CameraModel, Keypoint};
use crate::linalg::covariance_factor;
use crate::particle::{Particle, PoseEstimate};

use log::{debug, warn};
use nalgebra::{Matrix3, Vector3};
use rand::prelude::*;
use rand_distr::StandardNormal;
use rayon::prelude::*;
use std::collections::HashSet;

/// Particles with a parallel weight vector. `weights.len() == particles.len()` at every step boundary.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ParticleSet {
    pub particles: Vec<Particle>,
    pub weights: Vec<f64>,
}

impl ParticleSet {
    /// Wrap particles with uniform weights.
    pub fn new(particles: Vec<Particle>) -> Self {
        let n = particles.len();
        let weights = vec![1.0 / n.max(1) as f64; n];
        ParticleSet { particles, weights }
    }

    pub fn len(&self) -> usize {
        self.particles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.particles.is_empty()
    }

    /// Effective sample size `1 / Σ w²` of the normalized weights.
    pub fn effective_sample_size(&self) -> f64 {
        let sum: f64 = self.weights.iter().sum();
        if sum <= 0.0 || !sum.is_finite() {
            return 0.0;
        }
        let sum_sq: f64 = self.weights.iter().map(|w| (w / sum).powi(2)).sum();
        1.0 / sum_sq
    }

    /// The highest-weight particle.
    pub fn best_particle(&self) -> Option<&Particle> {
        self.weights
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map(|(i, _)| &self.particles[i])
    }
}

/// The particle filter engine. Configuration is fixed at construction.
pub struct RbpfEngine {
    config: RbpfConfig,
    camera: CameraModel,
    rng: StdRng,
}

impl RbpfEngine {
    pub fn new(config: RbpfConfig) -> Self {
        let rng = StdRng::seed_from_u64(config.seed);
        let camera = CameraModel::from(&config);
        RbpfEngine {
            config,
            camera,
            rng,
        }
    }

    pub fn config(&self) -> &RbpfConfig {
        &self.config
    }

    pub fn camera(&self) -> &CameraModel {
        &self.camera
    }

    /// Device position covariance used when initializing landmarks.
    pub fn pose_covariance(&self) -> Matrix3<f64> {
        Matrix3::from_diagonal(&Vector3::from(self.config.pose_covariance_diagonal))
    }

    /// Initial particle set scattered around a starting state.
    pub fn initial_set(
        &mut self,
        position: &Vector3<f64>,
        velocity: &Vector3<f64>,
        orientation: &Vector3<f64>,
    ) -> ParticleSet {
        let covariance = Matrix3::from_fn(|i, j| self.config.initial_position_covariance[i][j]);
        let scatter = covariance_factor(&covariance);
        let particles = (0..self.config.num_particles)
            .map(|_| {
                let z = Vector3::from_fn(|_, _| self.rng.sample::<f64, _>(StandardNormal));
                Particle::new(position + scatter * z, *velocity, Vector3::zeros(), *orientation)
            })
            .collect();
        ParticleSet::new(particles)
    }

    /// Apply `f` to every particle with an independent generator per particle.
    ///
    /// Seeds are drawn up front from the engine generator so sequential and parallel runs produce the same result.
    fn map_particles<T, F>(&mut self, particles: &[Particle], f: F) -> Vec<T>
    where
        T: Send,
        F: Fn(&Particle, &mut StdRng) -> T + Sync + Send,
    {
        let seeds: Vec<u64> = (0..particles.len()).map(|_| self.rng.random()).collect();
        if self.config.parallel {
            particles
                .par_iter()
                .zip(seeds.par_iter())
                .map(|(p, seed)| f(p, &mut StdRng::seed_from_u64(*seed)))
                .collect()
        } else {
            particles
                .iter()
                .zip(seeds.iter())
                .map(|(p, seed)| f(p, &mut StdRng::seed_from_u64(*seed)))
                .collect()
        }
    }

    /// IMU tick: propagate every particle, substituting the measured acceleration and orientation. Count, order
    /// and weights are preserved.
    pub fn step_imu(
        &mut self,
        set: &ParticleSet,
        dt: f64,
        accel: &Vector3<f64>,
        orientation: &Vector3<f64>,
    ) -> ParticleSet {
        let noise_a_sys = self.config.noise_a_sys;
        let particles = self.map_particles(&set.particles, |p, rng| {
            p.propagate_imu(dt, accel, orientation, noise_a_sys, rng)
        });
        ParticleSet {
            particles,
            weights: set.weights.clone(),
        }
    }

    /// Camera-driven propagation followed by every keypoint observation. Returns the predicted particles and their
    /// unnormalized weights, `exp` of the summed per-landmark log-likelihoods.
    ///
    /// Only the first occurrence of a keypoint index in `keypoints` is used.
    pub fn predict_and_update(
        &mut self,
        set: &ParticleSet,
        dt: f64,
        keypoints: &[Keypoint],
        step: u64,
        pose_covariance: &Matrix3<f64>,
    ) -> (Vec<Particle>, Vec<f64>) {
        let noise_a_sys = self.config.noise_a_sys;
        let camera = self.camera;
        let mut seen = HashSet::new();
        let keypoints: Vec<Keypoint> = keypoints
            .iter()
            .filter(|kp| seen.insert(kp.index))
            .copied()
            .collect();
        let updated = self.map_particles(&set.particles, |p, rng| {
            let mut next = p.propagate_camera(dt, noise_a_sys, rng);
            let log_likelihood: f64 = keypoints
                .iter()
                .map(|kp| next.observe(kp, step, pose_covariance, &camera))
                .sum();
            (next, log_likelihood)
        });
        let mut particles = Vec::with_capacity(updated.len());
        let mut weights = Vec::with_capacity(updated.len());
        for (particle, log_likelihood) in updated {
            let w = log_likelihood.exp();
            weights.push(if w.is_finite() { w } else { 0.0 });
            particles.push(particle);
        }
        (particles, weights)
    }

    /// Normalize and resample when the summed weight exceeds the confidence threshold; otherwise return the
    /// predicted particles and weights untouched.
    pub fn normalize_and_resample(&mut self, particles: Vec<Particle>, weights: Vec<f64>) -> ParticleSet {
        let weight_sum: f64 = weights.iter().sum();
        if weight_sum <= self.config.confidence_threshold {
            debug!(
                "weight sum {:.3e} at or below threshold {}, skipping resampling",
                weight_sum, self.config.confidence_threshold
            );
            return ParticleSet { particles, weights };
        }
        let normalized: Vec<f64> = weights.iter().map(|w| w / weight_sum).collect();
        let indices = self
            .config
            .resampling_strategy
            .resample(&normalized, &mut self.rng);
        let m = particles.len();
        let resampled: Vec<Particle> = indices
            .into_iter()
            .map(|i| particles[i.min(m - 1)].clone())
            .collect();
        ParticleSet::new(resampled)
    }

    /// Camera tick: propagate, weight by landmark reprojection and resample.
    pub fn step_camera(
        &mut self,
        set: &ParticleSet,
        dt: f64,
        keypoints: &[Keypoint],
        step: u64,
        pose_covariance: &Matrix3<f64>,
    ) -> ParticleSet {
        if set.is_empty() {
            warn!("camera step {step} on an empty particle set");
            return set.clone();
        }
        let (particles, weights) = self.predict_and_update(set, dt, keypoints, step, pose_covariance);
        let next = self.normalize_and_resample(particles, weights);
        debug!(
            "camera step {}: {} keypoints, effective sample size {:.1}",
            step,
            keypoints.len(),
            next.effective_sample_size()
        );
        next
    }

    /// Reduce the set to one state using the configured averaging strategy.
    pub fn estimate(&self, set: &ParticleSet) -> Option<PoseEstimate> {
        self.config
            .averaging_strategy
            .estimate(&set.particles, &set.weights)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::particle::ParticleResamplingStrategy;
    use assert_approx_eq::assert_approx_eq;

    fn quiet_config(num_particles: usize) -> RbpfConfig {
        RbpfConfig {
            num_particles,
            noise_a_sys: 0.0,
            seed: 7,
            ..Default::default()
        }
    }

    fn spread_set(n: usize) -> ParticleSet {
        let particles = (0..n)
            .map(|i| {
                Particle::new(
                    Vector3::new(i as f64, 0.0, 0.0),
                    Vector3::new(0.0, 1.0, 0.0),
                    Vector3::zeros(),
                    Vector3::zeros(),
                )
            })
            .collect();
        ParticleSet::new(particles)
    }

    #[test]
    fn initial_set_has_uniform_weights() {
        let mut engine = RbpfEngine::new(RbpfConfig {
            num_particles: 8,
            initial_position_covariance: [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 0.0]],
            ..Default::default()
        });
        let set = engine.initial_set(&Vector3::zeros(), &Vector3::zeros(), &Vector3::zeros());
        assert_eq!(set.len(), 8);
        assert_eq!(set.weights.len(), 8);
        assert!(set.weights.iter().all(|w| (*w - 0.125).abs() < 1e-15));
        assert!(set.particles.iter().any(|p| p.position[0] != 0.0));
        assert!(set.particles.iter().all(|p| p.position[2].abs() < 1e-4));
        assert_approx_eq!(set.effective_sample_size(), 8.0, 1e-9);
    }

    #[test]
    fn initial_scatter_follows_covariance() {
        let mut engine = RbpfEngine::new(RbpfConfig {
            num_particles: 20_000,
            initial_position_covariance: [[4.0, 1.0, 0.0], [1.0, 1.0, 0.0], [0.0, 0.0, 0.25]],
            ..Default::default()
        });
        let set = engine.initial_set(&Vector3::zeros(), &Vector3::zeros(), &Vector3::zeros());
        let estimate = engine.estimate(&set).unwrap();
        assert_approx_eq!(estimate.position_covariance[(0, 0)], 4.0, 0.15);
        assert_approx_eq!(estimate.position_covariance[(0, 1)], 1.0, 0.1);
        assert_approx_eq!(estimate.position_covariance[(2, 2)], 0.25, 0.02);
    }

    #[test]
    fn imu_step_preserves_count_order_and_weights() {
        let mut engine = RbpfEngine::new(quiet_config(5));
        let mut set = spread_set(5);
        set.weights = vec![0.1, 0.2, 0.3, 0.2, 0.2];
        let accel = Vector3::new(0.0, 0.0, 1.0);
        let orientation = Vector3::new(0.0, 0.0, 0.5);
        let next = engine.step_imu(&set, 1.0, &accel, &orientation);
        assert_eq!(next.len(), 5);
        assert_eq!(next.weights, set.weights);
        for (i, p) in next.particles.iter().enumerate() {
            assert_eq!(p.position, Vector3::new(i as f64, 1.0, 0.0));
            assert_eq!(p.acceleration, accel);
            assert_eq!(p.orientation, orientation);
        }
    }

    #[test]
    fn low_confidence_skips_resampling() {
        let mut engine = RbpfEngine::new(quiet_config(4));
        let set = spread_set(4);
        let weights = vec![0.1, 0.2, 0.1, 0.1];
        let next = engine.normalize_and_resample(set.particles.clone(), weights.clone());
        assert_eq!(next.particles, set.particles);
        assert_eq!(next.weights, weights);
    }

    #[test]
    fn confident_weights_resample_to_uniform() {
        let mut engine = RbpfEngine::new(quiet_config(4));
        let set = spread_set(4);
        let next = engine.normalize_and_resample(set.particles.clone(), vec![0.0, 0.0, 3.0, 0.0]);
        assert_eq!(next.len(), 4);
        assert!(next.particles.iter().all(|p| p.position[0] == 2.0));
        assert!(next.weights.iter().all(|w| (*w - 0.25).abs() < 1e-15));
    }

    #[test]
    fn resampled_particles_are_independent_copies() {
        let mut engine = RbpfEngine::new(quiet_config(3));
        let set = spread_set(3);
        let keypoints = [Keypoint::new(1, 0.0, 0.0)];
        let pose_cov = engine.pose_covariance();
        let mut next = engine.step_camera(&set, 0.0, &keypoints, 1, &pose_cov);
        let before = next.particles[1].landmarks[0].clone();
        next.particles[0].landmarks[0].position_estimate[2] += 5.0;
        assert_eq!(next.particles[1].landmarks[0], before);
    }

    #[test]
    fn first_frame_initializes_landmarks_with_neutral_weights() {
        let mut engine = RbpfEngine::new(quiet_config(6));
        let set = spread_set(6);
        let keypoints = [Keypoint::new(3, 10.0, -4.0), Keypoint::new(8, -20.0, 30.0)];
        let pose_cov = engine.pose_covariance();
        let (particles, weights) = engine.predict_and_update(&set, 0.5, &keypoints, 1, &pose_cov);
        assert_eq!(weights, vec![1.0; 6]);
        assert!(particles.iter().all(|p| p.landmarks.len() == 2));
    }

    #[test]
    fn repeated_index_in_one_frame_is_used_once() {
        let mut engine = RbpfEngine::new(quiet_config(2));
        let set = spread_set(2);
        let pose_cov = engine.pose_covariance();
        let first = engine.step_camera(&set, 0.0, &[Keypoint::new(5, 0.0, 0.0)], 1, &pose_cov);

        let once = [Keypoint::new(5, 3.0, 0.0)];
        let twice = [Keypoint::new(5, 3.0, 0.0), Keypoint::new(5, 40.0, 0.0)];
        let (a, wa) = RbpfEngine::new(quiet_config(2)).predict_and_update(&first, 0.0, &once, 2, &pose_cov);
        let (b, wb) = RbpfEngine::new(quiet_config(2)).predict_and_update(&first, 0.0, &twice, 2, &pose_cov);
        assert_eq!(a, b);
        assert_eq!(wa, wb);
    }

    #[test]
    fn landmark_behind_the_camera_gets_zero_weight() {
        let mut engine = RbpfEngine::new(quiet_config(2));
        let set = spread_set(2);
        let pose_cov = engine.pose_covariance();
        let mut first = engine.step_camera(&set, 0.0, &[Keypoint::new(1, 0.0, 0.0)], 1, &pose_cov);
        // The second hypothesis has moved past the landmark along the optical axis.
        first.particles[1].position[2] = 10.0;

        let (_, weights) = engine.predict_and_update(&first, 0.0, &[Keypoint::new(1, 3.0, 0.0)], 2, &pose_cov);
        assert!(weights[0] > 0.0);
        assert_eq!(weights[1], 0.0);
        assert!(weights[0] >= weights[1]);
    }

    #[test]
    fn inconsistent_reobservation_leaves_predicted_set() {
        let mut engine = RbpfEngine::new(quiet_config(10));
        let set = spread_set(10);
        let pose_cov = engine.pose_covariance();
        let first = engine.step_camera(&set, 0.0, &[Keypoint::new(5, 0.0, 0.0)], 1, &pose_cov);

        let (predicted, weights) =
            engine.predict_and_update(&first, 0.0, &[Keypoint::new(5, 400.0, 0.0)], 2, &pose_cov);
        assert!(weights.iter().sum::<f64>() <= 0.5);
        let next = engine.normalize_and_resample(predicted.clone(), weights);
        let positions: Vec<_> = next.particles.iter().map(|p| p.position).collect();
        let expected: Vec<_> = predicted.iter().map(|p| p.position).collect();
        assert_eq!(positions, expected);
    }

    #[test]
    fn consistent_reobservation_keeps_landmark_count() {
        let mut engine = RbpfEngine::new(quiet_config(5));
        let set = spread_set(5);
        let pose_cov = engine.pose_covariance();
        let kp = [Keypoint::new(5, 12.0, -7.0)];
        let first = engine.step_camera(&set, 0.0, &kp, 1, &pose_cov);
        let second = engine.step_camera(&first, 0.0, &kp, 2, &pose_cov);
        assert_eq!(second.len(), 5);
        assert!(second.particles.iter().all(|p| p.landmarks.len() == 1));
    }

    #[test]
    fn parallel_and_sequential_agree() {
        let mut config = RbpfConfig {
            num_particles: 16,
            noise_a_sys: 0.5,
            resampling_strategy: ParticleResamplingStrategy::Stratified,
            ..Default::default()
        };
        let mut sequential = RbpfEngine::new(config.clone());
        config.parallel = true;
        let mut parallel = RbpfEngine::new(config);

        let start = Vector3::zeros();
        let mut a = sequential.initial_set(&start, &start, &start);
        let mut b = parallel.initial_set(&start, &start, &start);
        let pose_cov = sequential.pose_covariance();
        for step in 1..4u64 {
            let accel = Vector3::new(0.1, 0.0, 0.0);
            a = sequential.step_imu(&a, 0.1, &accel, &start);
            b = parallel.step_imu(&b, 0.1, &accel, &start);
            let kp = [Keypoint::new(1, step as f64, 2.0)];
            a = sequential.step_camera(&a, 0.1, &kp, step, &pose_cov);
            b = parallel.step_camera(&b, 0.1, &kp, step, &pose_cov);
        }
        assert_eq!(a, b);
    }

    #[test]
    fn estimate_of_uniform_set_is_the_mean() {
        let engine = RbpfEngine::new(quiet_config(3));
        let set = spread_set(3);
        let estimate = engine.estimate(&set).unwrap();
        assert_approx_eq!(estimate.position[0], 1.0, 1e-12);
        assert!(engine.estimate(&ParticleSet::default()).is_none());
    }
}

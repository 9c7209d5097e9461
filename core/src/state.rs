//! The localizer: sequences IMU and camera ticks through the orientation estimator and the particle filter.
//!
//! Ticks must arrive in timestamp order. A tick older than the last processed one is dropped with a warning, a
//! camera frame without keypoints is a no-op, and the first IMU record only initializes the attitude. Every other
//! tick propagates the particle set by the time elapsed since the previous propagation.
use crate::config::SlamConfig;
use crate::landmark::Landmark;
use crate::messages::{CameraFrame, ImuRecord};
use crate::orientation::OrientationEstimator;
use crate::particle::PoseEstimate;
use crate::rbpf::{ParticleSet, RbpfEngine};
use crate::rotation::rotation_zyx;

use log::{debug, warn};
use nalgebra::{Matrix3, Vector3};

/// Squared angular rate (rad²/s²) below which no rotational terms are removed.
const MIN_ROTATION_RATE_SQ: f64 = 0.1;
const TANGENTIAL_SMOOTHING: f64 = 0.8;

/// Removes centrifugal and tangential acceleration of a device rotating about a point away from its sensor.
///
/// The rotation radius is recovered from the integrated world velocity and the angular rate, `r = (v × ω) / |ω|²`.
/// The accelerometer is then corrected by `ω × (ω × r)` and a low-passed `ω̇ × r`.
#[derive(Clone, Debug, Default)]
struct RotationalCompensator {
    velocity: Vector3<f64>,
    tangential: Vector3<f64>,
}

impl RotationalCompensator {
    fn apply(
        &mut self,
        record: &ImuRecord,
        previous_accel: &Vector3<f64>,
        rotation: &Matrix3<f64>,
        dt: f64,
    ) -> Vector3<f64> {
        let omega = record.gyro;
        let omega_sq = omega.norm_squared();
        if omega_sq <= MIN_ROTATION_RATE_SQ {
            *self = RotationalCompensator::default();
            return record.accel;
        }
        self.velocity += rotation * previous_accel * dt;
        let radius = self.velocity.cross(&omega) / omega_sq;
        let centrifugal = omega.cross(&omega.cross(&radius));
        let tangential = record.gyro_diff.cross(&radius);
        self.tangential =
            TANGENTIAL_SMOOTHING * self.tangential + (1.0 - TANGENTIAL_SMOOTHING) * tangential;
        record.accel + centrifugal - self.tangential
    }
}

pub struct Localizer {
    config: SlamConfig,
    estimator: OrientationEstimator,
    engine: RbpfEngine,
    particles: ParticleSet,
    compensator: Option<RotationalCompensator>,
    /// Timestamp of the last processed tick (ms)
    time_ms: Option<f64>,
    /// Time between the last two IMU records (s)
    dt: f64,
    last_imu_ms: Option<f64>,
    last_propagation_ms: Option<f64>,
    previous_accel: Vector3<f64>,
    step: u64,
    orientation: Vector3<f64>,
    global_accel: Vector3<f64>,
}

impl Localizer {
    pub fn new(config: SlamConfig) -> Self {
        let mut engine = RbpfEngine::new(config.rbpf.clone());
        let zero = Vector3::zeros();
        let particles = engine.initial_set(&zero, &zero, &zero);
        let estimator = OrientationEstimator::new(&config.orientation);
        let compensator = config
            .compensate_rotational_accel
            .then(RotationalCompensator::default);
        Localizer {
            config,
            estimator,
            engine,
            particles,
            compensator,
            time_ms: None,
            dt: 0.0,
            last_imu_ms: None,
            last_propagation_ms: None,
            previous_accel: Vector3::zeros(),
            step: 0,
            orientation: Vector3::zeros(),
            global_accel: Vector3::zeros(),
        }
    }

    /// Restart from the initial particle set with no attitude or time history.
    pub fn reset(&mut self) {
        *self = Localizer::new(self.config.clone());
    }

    pub fn set_orientation(&mut self, orientation: Vector3<f64>) {
        self.orientation = orientation;
    }

    /// Set the world-frame acceleration applied at the next IMU propagation.
    pub fn set_accel(&mut self, accel: Vector3<f64>) {
        self.global_accel = accel;
    }

    /// Record an IMU timestamp and the time delta to the previous one.
    pub fn set_time(&mut self, timestamp_ms: f64) {
        if let Some(previous) = self.last_imu_ms {
            self.dt = (timestamp_ms - previous) / 1000.0;
        }
        self.last_imu_ms = Some(timestamp_ms);
        self.time_ms = Some(timestamp_ms);
    }

    /// Seconds since the last propagation, zero before the first one. Marks `timestamp_ms` as propagated.
    fn take_propagation_dt(&mut self, timestamp_ms: f64) -> f64 {
        let dt = self
            .last_propagation_ms
            .map(|t| (timestamp_ms - t) / 1000.0)
            .unwrap_or(0.0);
        self.last_propagation_ms = Some(timestamp_ms);
        dt
    }

    fn is_stale(&self, timestamp_ms: f64, kind: &str) -> bool {
        match self.time_ms {
            Some(last) if timestamp_ms < last => {
                warn!("dropping {kind} tick at {timestamp_ms} ms, older than last tick at {last} ms");
                true
            }
            _ => false,
        }
    }

    /// Process one IMU record. Returns `false` if it was dropped as out of order.
    pub fn process_imu(&mut self, record: &ImuRecord) -> bool {
        if self.is_stale(record.timestamp_ms, "IMU") {
            return false;
        }
        if record.is_degenerate() {
            warn!(
                "degenerate gravity or magnetic vector at {} ms, attitude is undefined",
                record.timestamp_ms
            );
        }
        let first = !self.estimator.is_initialized();
        self.set_time(record.timestamp_ms);

        let orientation =
            self.estimator
                .update(&record.gravity, &record.magnetic, &record.gyro, self.dt);
        self.set_orientation(orientation);
        let rotation = rotation_zyx(&orientation);

        let accel = match self.compensator.as_mut() {
            Some(c) if !first => c.apply(record, &self.previous_accel, &rotation, self.dt),
            _ => record.accel,
        };
        self.previous_accel = record.accel;
        self.set_accel(rotation * accel);

        if first {
            self.last_propagation_ms = Some(record.timestamp_ms);
        } else {
            self.localization();
        }
        true
    }

    /// IMU propagation of the particle set with the current orientation and world-frame acceleration.
    pub fn localization(&mut self) {
        let Some(now) = self.time_ms else {
            return;
        };
        let dt = self.take_propagation_dt(now);
        self.particles =
            self.engine
                .step_imu(&self.particles, dt, &self.global_accel, &self.orientation);
    }

    /// Process one camera frame. Returns `true` if a filter step ran.
    pub fn process_camera(&mut self, frame: &CameraFrame) -> bool {
        if self.is_stale(frame.timestamp_ms, "camera") {
            return false;
        }
        let keypoints = frame.keypoints();
        if keypoints.is_empty() {
            return false;
        }
        self.time_ms = Some(frame.timestamp_ms);
        self.step += 1;
        let dt = self.take_propagation_dt(frame.timestamp_ms);
        let pose_covariance = self.engine.pose_covariance();
        self.particles =
            self.engine
                .step_camera(&self.particles, dt, keypoints, self.step, &pose_covariance);
        debug!(
            "camera step {} at {} ms: {} landmarks on best particle",
            self.step,
            frame.timestamp_ms,
            self.landmarks().len()
        );
        true
    }

    pub fn orientation(&self) -> Vector3<f64> {
        self.orientation
    }

    pub fn global_accel(&self) -> Vector3<f64> {
        self.global_accel
    }

    pub fn time_ms(&self) -> Option<f64> {
        self.time_ms
    }

    /// Time between the last two IMU records (s).
    pub fn time_delta(&self) -> f64 {
        self.dt
    }

    /// Number of camera steps that ran the filter.
    pub fn step(&self) -> u64 {
        self.step
    }

    pub fn orientation_estimator(&self) -> &OrientationEstimator {
        &self.estimator
    }

    pub fn particles(&self) -> &ParticleSet {
        &self.particles
    }

    pub fn estimate(&self) -> Option<PoseEstimate> {
        self.engine.estimate(&self.particles)
    }

    /// Landmark map of the highest-weight particle.
    pub fn landmarks(&self) -> &[Landmark] {
        self.particles
            .best_particle()
            .map(|p| p.landmarks.as_slice())
            .unwrap_or(&[])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RbpfConfig;
    use crate::landmark::Keypoint;
    use assert_approx_eq::assert_approx_eq;

    fn quiet_config() -> SlamConfig {
        SlamConfig {
            rbpf: RbpfConfig {
                num_particles: 20,
                noise_a_sys: 0.0,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn level_record(timestamp_ms: f64, accel: Vector3<f64>) -> ImuRecord {
        ImuRecord {
            timestamp_ms,
            accel,
            gravity: Vector3::new(0.0, 0.0, 9.81),
            magnetic: Vector3::new(30.0, 0.0, -40.0),
            ..Default::default()
        }
    }

    #[test]
    fn first_imu_record_only_initializes_attitude() {
        let mut loc = Localizer::new(quiet_config());
        assert!(loc.process_imu(&level_record(1000.0, Vector3::new(1.0, 0.0, 0.0))));
        assert!(loc.orientation_estimator().is_initialized());
        let est = loc.estimate().unwrap();
        assert_eq!(est.position, Vector3::zeros());
        assert_eq!(est.velocity, Vector3::zeros());
        assert_approx_eq!(loc.global_accel()[0], 1.0, 1e-9);
    }

    #[test]
    fn imu_ticks_integrate_world_acceleration() {
        let mut loc = Localizer::new(quiet_config());
        let accel = Vector3::new(1.0, 0.0, 0.0);
        for k in 0..3 {
            loc.process_imu(&level_record(1000.0 + 500.0 * k as f64, accel));
        }
        assert_approx_eq!(loc.time_delta(), 0.5, 1e-12);
        let est = loc.estimate().unwrap();
        // The first propagation substitutes the acceleration, the second integrates it over 0.5 s.
        assert_approx_eq!(est.velocity[0], 0.5, 1e-9);
        assert_approx_eq!(est.position[0], 0.125, 1e-9);
        assert_approx_eq!(est.acceleration[0], 1.0, 1e-9);
    }

    #[test]
    fn out_of_order_ticks_are_dropped() {
        let mut loc = Localizer::new(quiet_config());
        assert!(loc.process_imu(&level_record(1000.0, Vector3::zeros())));
        assert!(loc.process_imu(&level_record(1100.0, Vector3::zeros())));
        assert!(!loc.process_imu(&level_record(1050.0, Vector3::zeros())));
        let frame = CameraFrame::with_keypoints(900.0, vec![Keypoint::new(1, 0.0, 0.0)]);
        assert!(!loc.process_camera(&frame));
        assert_eq!(loc.time_ms(), Some(1100.0));
        assert_eq!(loc.step(), 0);
    }

    #[test]
    fn sentinel_and_empty_frames_are_noops() {
        let mut loc = Localizer::new(quiet_config());
        loc.process_imu(&level_record(1000.0, Vector3::zeros()));
        let before = loc.particles().clone();
        assert!(!loc.process_camera(&CameraFrame::no_match(1010.0)));
        assert!(!loc.process_camera(&CameraFrame::with_keypoints(1020.0, vec![])));
        assert_eq!(loc.particles(), &before);
        assert_eq!(loc.step(), 0);
    }

    #[test]
    fn camera_frames_build_the_map() {
        let mut loc = Localizer::new(quiet_config());
        loc.process_imu(&level_record(1000.0, Vector3::zeros()));
        let frame = CameraFrame::with_keypoints(
            1033.0,
            vec![Keypoint::new(4, 10.0, 5.0), Keypoint::new(9, -30.0, 12.0)],
        );
        assert!(loc.process_camera(&frame));
        assert_eq!(loc.step(), 1);
        assert_eq!(loc.landmarks().len(), 2);

        let frame = CameraFrame::with_keypoints(
            1066.0,
            vec![Keypoint::new(4, 10.5, 5.0), Keypoint::new(11, 0.0, 0.0)],
        );
        assert!(loc.process_camera(&frame));
        assert_eq!(loc.step(), 2);
        let indices: Vec<u64> = loc.landmarks().iter().map(|l| l.keypoint_index).collect();
        assert_eq!(indices, vec![4, 9, 11]);
    }

    #[test]
    fn compensation_is_inactive_for_slow_rotation() {
        let mut config = quiet_config();
        config.compensate_rotational_accel = true;
        let mut loc = Localizer::new(config);
        let accel = Vector3::new(0.0, 2.0, 0.0);
        loc.process_imu(&level_record(0.0, accel));
        let mut record = level_record(100.0, accel);
        record.gyro = Vector3::new(0.0, 0.0, 0.2);
        loc.process_imu(&record);
        let world = rotation_zyx(&loc.orientation()) * accel;
        assert_approx_eq!((loc.global_accel() - world).norm(), 0.0, 1e-12);
    }

    #[test]
    fn compensation_removes_centrifugal_term() {
        let mut comp = RotationalCompensator {
            velocity: Vector3::new(1.0, 0.0, 0.0),
            tangential: Vector3::zeros(),
        };
        let record = ImuRecord {
            accel: Vector3::new(0.0, 0.0, 0.0),
            gyro: Vector3::new(0.0, 0.0, 1.0),
            ..Default::default()
        };
        let corrected = comp.apply(&record, &Vector3::zeros(), &Matrix3::identity(), 0.01);
        // r = v × ω = (0, -1, 0); ω × (ω × r) = -r
        assert_approx_eq!(corrected[1], 1.0, 1e-12);
        assert_approx_eq!(corrected[0], 0.0, 1e-12);
    }

    #[test]
    fn reset_restores_initial_state() {
        let mut loc = Localizer::new(quiet_config());
        loc.process_imu(&level_record(0.0, Vector3::new(1.0, 0.0, 0.0)));
        loc.process_imu(&level_record(100.0, Vector3::new(1.0, 0.0, 0.0)));
        loc.reset();
        assert_eq!(loc.time_ms(), None);
        assert!(!loc.orientation_estimator().is_initialized());
        assert_eq!(loc.estimate().unwrap().position, Vector3::zeros());
    }
}

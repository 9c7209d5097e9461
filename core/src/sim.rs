//! Replay of recorded sensor and camera logs through the [Localizer](crate::state::Localizer).
//!
//! This module provides:
//! - `run_replay`, which feeds an [EventStream] through a fresh localizer and collects one trajectory row per
//!   processed tick
//! - `TrajectoryRecord` and `LandmarkRecord` for writing and reading the results as CSV
use crate::config::SlamConfig;
use crate::error::Result;
use crate::landmark::Landmark;
use crate::messages::{Event, EventStream};
use crate::state::Localizer;

use log::info;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// State of the filter after one processed tick.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TrajectoryRecord {
    pub timestamp_ms: f64,
    /// Event that produced the row, `imu` or `camera`
    pub source: String,
    pub x_m: f64,
    pub y_m: f64,
    pub z_m: f64,
    pub vx_mps: f64,
    pub vy_mps: f64,
    pub vz_mps: f64,
    pub roll_rad: f64,
    pub pitch_rad: f64,
    pub yaw_rad: f64,
    /// Landmarks held by the best particle
    pub landmarks: usize,
    pub effective_sample_size: f64,
    /// Camera steps that ran the filter so far
    pub camera_step: u64,
}

impl TrajectoryRecord {
    fn from_localizer(localizer: &Localizer, timestamp_ms: f64, source: &str) -> Option<Self> {
        let estimate = localizer.estimate()?;
        Some(TrajectoryRecord {
            timestamp_ms,
            source: source.to_string(),
            x_m: estimate.position[0],
            y_m: estimate.position[1],
            z_m: estimate.position[2],
            vx_mps: estimate.velocity[0],
            vy_mps: estimate.velocity[1],
            vz_mps: estimate.velocity[2],
            roll_rad: estimate.orientation[0],
            pitch_rad: estimate.orientation[1],
            yaw_rad: estimate.orientation[2],
            landmarks: localizer.landmarks().len(),
            effective_sample_size: localizer.particles().effective_sample_size(),
            camera_step: localizer.step(),
        })
    }

    /// Writes trajectory rows to a CSV file with a header.
    pub fn to_csv<P: AsRef<Path>>(records: &[Self], path: P) -> Result<()> {
        let mut writer = csv::Writer::from_path(path)?;
        for record in records {
            writer.serialize(record)?;
        }
        writer.flush()?;
        Ok(())
    }

    pub fn from_csv<P: AsRef<Path>>(path: P) -> Result<Vec<Self>> {
        let mut rdr = csv::Reader::from_path(path)?;
        let mut records = Vec::new();
        for result in rdr.deserialize() {
            records.push(result?);
        }
        Ok(records)
    }
}

/// One landmark of the final map.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LandmarkRecord {
    pub id: usize,
    pub keypoint_index: u64,
    pub first_seen_step: u64,
    pub x_m: f64,
    pub y_m: f64,
    pub z_m: f64,
    /// Standard deviations from the covariance diagonal
    pub sigma_x_m: f64,
    pub sigma_y_m: f64,
    pub sigma_z_m: f64,
}

impl From<&Landmark> for LandmarkRecord {
    fn from(l: &Landmark) -> Self {
        LandmarkRecord {
            id: l.id,
            keypoint_index: l.keypoint_index,
            first_seen_step: l.first_seen_step,
            x_m: l.position_estimate[0],
            y_m: l.position_estimate[1],
            z_m: l.position_estimate[2],
            sigma_x_m: l.covariance[(0, 0)].max(0.0).sqrt(),
            sigma_y_m: l.covariance[(1, 1)].max(0.0).sqrt(),
            sigma_z_m: l.covariance[(2, 2)].max(0.0).sqrt(),
        }
    }
}

impl LandmarkRecord {
    pub fn to_csv<P: AsRef<Path>>(records: &[Self], path: P) -> Result<()> {
        let mut writer = csv::Writer::from_path(path)?;
        for record in records {
            writer.serialize(record)?;
        }
        writer.flush()?;
        Ok(())
    }

    pub fn from_csv<P: AsRef<Path>>(path: P) -> Result<Vec<Self>> {
        let mut rdr = csv::Reader::from_path(path)?;
        let mut records = Vec::new();
        for result in rdr.deserialize() {
            records.push(result?);
        }
        Ok(records)
    }
}

/// Output of a replay.
#[derive(Clone, Debug, Default)]
pub struct ReplayResult {
    pub trajectory: Vec<TrajectoryRecord>,
    /// Map of the best particle at the end of the run
    pub landmarks: Vec<LandmarkRecord>,
    /// Ticks that were dropped or were no-ops
    pub skipped: usize,
}

/// Run every event through a fresh localizer built from `config`.
///
/// Fails only if the configuration is invalid; individual ticks never fail.
pub fn run_replay(config: &SlamConfig, stream: &EventStream) -> Result<ReplayResult> {
    config.validate()?;
    let mut localizer = Localizer::new(config.clone());
    let mut result = ReplayResult {
        trajectory: Vec::with_capacity(stream.len()),
        ..Default::default()
    };
    for event in &stream.events {
        let (processed, source) = match event {
            Event::Imu(record) => (localizer.process_imu(record), "imu"),
            Event::Camera(frame) => (localizer.process_camera(frame), "camera"),
        };
        if !processed {
            result.skipped += 1;
            continue;
        }
        if let Some(row) = TrajectoryRecord::from_localizer(&localizer, event.timestamp_ms(), source) {
            result.trajectory.push(row);
        }
    }
    result.landmarks = localizer.landmarks().iter().map(LandmarkRecord::from).collect();
    info!(
        "replayed {} events: {} trajectory rows, {} skipped, {} camera steps, {} landmarks",
        stream.len(),
        result.trajectory.len(),
        result.skipped,
        localizer.step(),
        result.landmarks.len()
    );
    Ok(result)
}

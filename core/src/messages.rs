//! Sensor and camera records, their CSV readers, and the merged event stream that drives a replay.
//!
//! ## IMU file
//!
//! Headerless CSV, 16 columns per row:
//!
//! ```text
//! timestamp_ms, ax, ay, az, gx, gy, gz, mx, my, mz, wx, wy, wz, dwx, dwy, dwz
//! ```
//!
//! linear acceleration (m/s²), gravity (m/s²), magnetometer (µT), gyro rate (rad/s) and gyro rate derivative (rad/s²).
//! The raw gravity columns point toward the Earth; they are negated on ingestion so the stored vector points away
//! from it, which is the convention of [OrientationEstimator](crate::orientation::OrientationEstimator).
//!
//! ## Frame file
//!
//! Headerless CSV of variable width. Column 0 is `timestamp_ms`; column 1 is either the literal `nomatch` or the
//! start of `index, x, y` keypoint triples with pixel coordinates relative to the principal point.
//!
//! ```text
//! 1000,nomatch
//! 1033,12,-40.5,22.0,17,101.2,-3.5
//! ```
use crate::error::{Result, SlamError};
use crate::landmark::Keypoint;

use csv::{ReaderBuilder, StringRecord};
use log::warn;
use nalgebra::Vector3;
use std::io;
use std::path::Path;

const IMU_COLUMNS: usize = 16;
const NO_MATCH: &str = "nomatch";

/// One inertial sample.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ImuRecord {
    pub timestamp_ms: f64,
    /// Linear acceleration, gravity removed, in the device frame (m/s²)
    pub accel: Vector3<f64>,
    /// Gravity in the device frame (m/s²), negated from the raw columns
    pub gravity: Vector3<f64>,
    /// Magnetic field in the device frame
    pub magnetic: Vector3<f64>,
    /// Angular rate (rad/s)
    pub gyro: Vector3<f64>,
    /// Angular acceleration (rad/s²)
    pub gyro_diff: Vector3<f64>,
}

fn record_line(record: &StringRecord) -> u64 {
    record.position().map(|p| p.line()).unwrap_or(0)
}

fn parse_field(record: &StringRecord, column: usize) -> Result<f64> {
    let raw = record.get(column).unwrap_or("");
    raw.trim()
        .parse::<f64>()
        .map_err(|e| SlamError::MalformedRecord {
            line: record_line(record),
            reason: format!("column {column} ({raw:?}): {e}"),
        })
}

fn parse_vector(record: &StringRecord, first: usize) -> Result<Vector3<f64>> {
    Ok(Vector3::new(
        parse_field(record, first)?,
        parse_field(record, first + 1)?,
        parse_field(record, first + 2)?,
    ))
}

impl ImuRecord {
    pub fn from_record(record: &StringRecord) -> Result<Self> {
        if record.len() < IMU_COLUMNS {
            return Err(SlamError::MalformedRecord {
                line: record_line(record),
                reason: format!("expected {IMU_COLUMNS} columns, found {}", record.len()),
            });
        }
        Ok(ImuRecord {
            timestamp_ms: parse_field(record, 0)?,
            accel: parse_vector(record, 1)?,
            gravity: -parse_vector(record, 4)?,
            magnetic: parse_vector(record, 7)?,
            gyro: parse_vector(record, 10)?,
            gyro_diff: parse_vector(record, 13)?,
        })
    }

    /// Gravity or magnetic field with zero norm; attitude from such a sample is undefined.
    pub fn is_degenerate(&self) -> bool {
        self.gravity.norm() == 0.0 || self.magnetic.norm() == 0.0
    }
}

/// What a camera tick delivered.
#[derive(Clone, Debug, PartialEq)]
pub enum FrameObservation {
    /// The tracker found no correspondences; the tick is a no-op
    NoMatch,
    Keypoints(Vec<Keypoint>),
}

#[derive(Clone, Debug, PartialEq)]
pub struct CameraFrame {
    pub timestamp_ms: f64,
    pub observation: FrameObservation,
}

impl CameraFrame {
    pub fn no_match(timestamp_ms: f64) -> Self {
        CameraFrame {
            timestamp_ms,
            observation: FrameObservation::NoMatch,
        }
    }

    pub fn with_keypoints(timestamp_ms: f64, keypoints: Vec<Keypoint>) -> Self {
        CameraFrame {
            timestamp_ms,
            observation: FrameObservation::Keypoints(keypoints),
        }
    }

    /// Keypoints of the frame, empty for a sentinel frame.
    pub fn keypoints(&self) -> &[Keypoint] {
        match &self.observation {
            FrameObservation::NoMatch => &[],
            FrameObservation::Keypoints(k) => k,
        }
    }

    pub fn from_record(record: &StringRecord) -> Result<Self> {
        let timestamp_ms = parse_field(record, 0)?;
        let fields: Vec<&str> = record
            .iter()
            .skip(1)
            .map(str::trim)
            .filter(|f| !f.is_empty())
            .collect();
        if fields.first() == Some(&NO_MATCH) {
            return Ok(CameraFrame::no_match(timestamp_ms));
        }
        if fields.len() % 3 != 0 {
            return Err(SlamError::MalformedRecord {
                line: record_line(record),
                reason: format!("{} keypoint fields is not a multiple of 3", fields.len()),
            });
        }
        let malformed = |reason: String| SlamError::MalformedRecord {
            line: record_line(record),
            reason,
        };
        let mut keypoints = Vec::with_capacity(fields.len() / 3);
        for triple in fields.chunks_exact(3) {
            let index = triple[0]
                .parse::<u64>()
                .map_err(|e| malformed(format!("keypoint index {:?}: {e}", triple[0])))?;
            let x = triple[1]
                .parse::<f64>()
                .map_err(|e| malformed(format!("keypoint x {:?}: {e}", triple[1])))?;
            let y = triple[2]
                .parse::<f64>()
                .map_err(|e| malformed(format!("keypoint y {:?}: {e}", triple[2])))?;
            keypoints.push(Keypoint::new(index, x, y));
        }
        Ok(CameraFrame::with_keypoints(timestamp_ms, keypoints))
    }
}

fn headerless_reader<R: io::Read>(reader: R) -> csv::Reader<R> {
    ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(reader)
}

/// Read IMU records. Any malformed row is an error.
pub fn read_imu_records<R: io::Read>(reader: R) -> Result<Vec<ImuRecord>> {
    let mut rdr = headerless_reader(reader);
    let mut records = Vec::new();
    for row in rdr.records() {
        records.push(ImuRecord::from_record(&row?)?);
    }
    Ok(records)
}

pub fn read_imu_csv<P: AsRef<Path>>(path: P) -> Result<Vec<ImuRecord>> {
    read_imu_records(std::fs::File::open(path)?)
}

/// Read camera frames. A malformed row is logged and replaced by a sentinel frame at its timestamp, or skipped when
/// even the timestamp cannot be read.
pub fn read_camera_frames<R: io::Read>(reader: R) -> Result<Vec<CameraFrame>> {
    let mut rdr = headerless_reader(reader);
    let mut frames = Vec::new();
    for row in rdr.records() {
        let row = row?;
        match CameraFrame::from_record(&row) {
            Ok(frame) => frames.push(frame),
            Err(e) => {
                warn!("{e}; treating frame as no match");
                if let Ok(timestamp_ms) = parse_field(&row, 0) {
                    frames.push(CameraFrame::no_match(timestamp_ms));
                }
            }
        }
    }
    Ok(frames)
}

pub fn read_camera_csv<P: AsRef<Path>>(path: P) -> Result<Vec<CameraFrame>> {
    read_camera_frames(std::fs::File::open(path)?)
}

/// A single tick of the replay.
#[derive(Clone, Debug, PartialEq)]
pub enum Event {
    Imu(ImuRecord),
    Camera(CameraFrame),
}

impl Event {
    pub fn timestamp_ms(&self) -> f64 {
        match self {
            Event::Imu(r) => r.timestamp_ms,
            Event::Camera(f) => f.timestamp_ms,
        }
    }

    /// Tie-break on equal timestamps: inertial data first.
    fn order(&self) -> u8 {
        match self {
            Event::Imu(_) => 0,
            Event::Camera(_) => 1,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct EventStream {
    /// Timestamp of the first event (ms)
    pub start_time_ms: f64,
    pub events: Vec<Event>,
}

impl EventStream {
    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

/// Merge IMU records and camera frames into one timestamp-ordered stream.
pub fn build_event_stream(imu: &[ImuRecord], frames: &[CameraFrame]) -> EventStream {
    let mut events: Vec<Event> = imu
        .iter()
        .cloned()
        .map(Event::Imu)
        .chain(frames.iter().cloned().map(Event::Camera))
        .collect();
    events.sort_by(|a, b| {
        a.timestamp_ms()
            .total_cmp(&b.timestamp_ms())
            .then(a.order().cmp(&b.order()))
    });
    let start_time_ms = events.first().map(Event::timestamp_ms).unwrap_or(0.0);
    EventStream {
        start_time_ms,
        events,
    }
}

//! Configuration for the orientation estimator and the particle filter.
//!
//! All noise parameters are fixed at construction; nothing in the engine mutates them afterwards. A full
//! configuration can be written to and read from JSON, YAML or TOML, selected by file extension.
//!
//! ## Example TOML
//!
//! ```toml
//! compensate_rotational_accel = false
//!
//! [orientation]
//! process_noise = [0.1, 0.1, 0.1]
//! measurement_noise = [0.01, 0.01, 0.01]
//!
//! [rbpf]
//! num_particles = 100
//! noise_a_sys = 0.01
//! focal_length_px = 500.0
//! resampling_strategy = "systematic"
//! ```
use crate::error::{Result, SlamError};
use crate::particle::{ParticleAveragingStrategy, ParticleResamplingStrategy};

use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;

/// Noise parameters of the orientation Kalman filter (diagonal Q and R).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrientationConfig {
    /// Diagonal of the process noise covariance Q (rad²)
    pub process_noise: [f64; 3],
    /// Diagonal of the measurement noise covariance R (rad²)
    pub measurement_noise: [f64; 3],
}

impl Default for OrientationConfig {
    fn default() -> Self {
        Self {
            process_noise: [0.1, 0.1, 0.1],
            measurement_noise: [0.01, 0.01, 0.01],
        }
    }
}

/// RBPF configuration parameters.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RbpfConfig {
    /// Number of particles M
    pub num_particles: usize,
    /// Variance of the isotropic acceleration process noise ((m/s²)²)
    pub noise_a_sys: f64,
    /// Camera focal length in pixels
    pub focal_length_px: f64,
    /// Depth assumed along the viewing ray when a landmark is first seen (m)
    pub initial_depth_m: f64,
    /// Standard deviation of that assumed depth (m)
    pub depth_std_m: f64,
    /// Standard deviation of keypoint pixel coordinates (px)
    pub pixel_noise_std: f64,
    /// Minimum sum of unnormalized weights required before resampling
    pub confidence_threshold: f64,
    pub resampling_strategy: ParticleResamplingStrategy,
    pub averaging_strategy: ParticleAveragingStrategy,
    /// Covariance of the initial particle scatter around the start position (m², row major)
    pub initial_position_covariance: [[f64; 3]; 3],
    /// Diagonal of the device position covariance used when initializing landmarks (m²)
    pub pose_covariance_diagonal: [f64; 3],
    pub seed: u64,
    /// Process particles on the rayon thread pool
    pub parallel: bool,
}

impl Default for RbpfConfig {
    fn default() -> Self {
        Self {
            num_particles: 100,
            noise_a_sys: 0.01,
            focal_length_px: 500.0,
            initial_depth_m: 2.0,
            depth_std_m: 1.0,
            pixel_noise_std: 2.0,
            confidence_threshold: 0.5,
            resampling_strategy: ParticleResamplingStrategy::default(),
            averaging_strategy: ParticleAveragingStrategy::default(),
            initial_position_covariance: [[0.0; 3]; 3],
            pose_covariance_diagonal: [0.01, 0.01, 0.01],
            seed: 42,
            parallel: false,
        }
    }
}

/// Complete configuration of a localization run.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SlamConfig {
    /// Remove centrifugal and tangential terms from the accelerometer before rotating it to the world frame
    pub compensate_rotational_accel: bool,
    pub orientation: OrientationConfig,
    pub rbpf: RbpfConfig,
}

fn non_negative(name: &str, value: f64) -> Result<()> {
    if value.is_finite() && value >= 0.0 {
        Ok(())
    } else {
        Err(SlamError::InvalidConfig(format!(
            "{name} must be finite and non-negative, got {value}"
        )))
    }
}

fn positive(name: &str, value: f64) -> Result<()> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(SlamError::InvalidConfig(format!(
            "{name} must be finite and positive, got {value}"
        )))
    }
}

impl SlamConfig {
    /// Check that every parameter is usable by the filter.
    pub fn validate(&self) -> Result<()> {
        let rbpf = &self.rbpf;
        if rbpf.num_particles == 0 {
            return Err(SlamError::InvalidConfig(
                "num_particles must be at least 1".to_string(),
            ));
        }
        non_negative("noise_a_sys", rbpf.noise_a_sys)?;
        positive("focal_length_px", rbpf.focal_length_px)?;
        positive("initial_depth_m", rbpf.initial_depth_m)?;
        non_negative("depth_std_m", rbpf.depth_std_m)?;
        positive("pixel_noise_std", rbpf.pixel_noise_std)?;
        non_negative("confidence_threshold", rbpf.confidence_threshold)?;
        for (i, row) in rbpf.initial_position_covariance.iter().enumerate() {
            non_negative("initial_position_covariance diagonal", row[i])?;
            if row.iter().any(|v| !v.is_finite()) {
                return Err(SlamError::InvalidConfig(
                    "initial_position_covariance must be finite".to_string(),
                ));
            }
        }
        for v in rbpf.pose_covariance_diagonal {
            non_negative("pose_covariance_diagonal", v)?;
        }
        for v in self.orientation.process_noise {
            non_negative("orientation.process_noise", v)?;
        }
        for v in self.orientation.measurement_noise {
            non_negative("orientation.measurement_noise", v)?;
        }
        Ok(())
    }

    /// Write the configuration to a JSON file (pretty-printed).
    pub fn to_json<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let file = File::create(path)?;
        serde_json::to_writer_pretty(file, self)
            .map_err(|e| SlamError::ConfigSerialize(e.to_string()))
    }

    /// Read the configuration from a JSON file.
    pub fn from_json<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path)?;
        serde_json::from_reader(file).map_err(|e| SlamError::ConfigParse(e.to_string()))
    }

    /// Write the configuration as YAML.
    pub fn to_yaml<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let mut file = File::create(path)?;
        let s = serde_yaml::to_string(self).map_err(|e| SlamError::ConfigSerialize(e.to_string()))?;
        file.write_all(s.as_bytes())?;
        Ok(())
    }

    /// Read the configuration from YAML.
    pub fn from_yaml<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path)?;
        serde_yaml::from_reader(file).map_err(|e| SlamError::ConfigParse(e.to_string()))
    }

    /// Write the configuration as TOML.
    pub fn to_toml<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let mut file = File::create(path)?;
        let s = toml::to_string(self).map_err(|e| SlamError::ConfigSerialize(e.to_string()))?;
        file.write_all(s.as_bytes())?;
        Ok(())
    }

    /// Read the configuration from TOML.
    pub fn from_toml<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut s = String::new();
        File::open(path)?.read_to_string(&mut s)?;
        toml::from_str(&s).map_err(|e| SlamError::ConfigParse(e.to_string()))
    }

    /// Generic write: choose format by file extension (.json/.yaml/.yml/.toml)
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let p = path.as_ref();
        match extension_of(p).as_deref() {
            Some("json") => self.to_json(p),
            Some("yaml") | Some("yml") => self.to_yaml(p),
            Some("toml") => self.to_toml(p),
            other => Err(SlamError::UnsupportedExtension(other.map(str::to_string))),
        }
    }

    /// Generic read: choose format by file extension (.json/.yaml/.yml/.toml)
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let p = path.as_ref();
        match extension_of(p).as_deref() {
            Some("json") => Self::from_json(p),
            Some("yaml") | Some("yml") => Self::from_yaml(p),
            Some("toml") => Self::from_toml(p),
            other => Err(SlamError::UnsupportedExtension(other.map(str::to_string))),
        }
    }
}

fn extension_of(p: &Path) -> Option<String> {
    p.extension()
        .and_then(|s| s.to_str())
        .map(|s| s.to_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample_cfg() -> SlamConfig {
        SlamConfig {
            compensate_rotational_accel: true,
            orientation: OrientationConfig {
                process_noise: [0.2, 0.2, 0.3],
                measurement_noise: [0.02, 0.02, 0.05],
            },
            rbpf: RbpfConfig {
                num_particles: 250,
                noise_a_sys: 0.5,
                resampling_strategy: ParticleResamplingStrategy::Stratified,
                averaging_strategy: ParticleAveragingStrategy::HighestWeight,
                seed: 7,
                parallel: true,
                ..RbpfConfig::default()
            },
        }
    }

    #[test]
    fn file_formats_preserve_config() {
        let dir = tempdir().unwrap();
        let cfg = sample_cfg();
        for name in ["cfg.json", "cfg.yaml", "cfg.yml", "cfg.toml"] {
            let path = dir.path().join(name);
            cfg.to_file(&path).unwrap();
            let back = SlamConfig::from_file(&path).unwrap();
            assert_eq!(back, cfg, "format {name}");
        }
    }

    #[test]
    fn unknown_extension_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cfg.ini");
        let err = sample_cfg().to_file(&path).unwrap_err();
        assert!(matches!(err, SlamError::UnsupportedExtension(Some(ref e)) if e == "ini"));
    }

    #[test]
    fn unknown_keys_are_ignored() {
        let cfg: SlamConfig =
            toml::from_str("[rbpf]\nnum_particles = 30\nnoise_g_sys = 0.02\n").unwrap();
        assert_eq!(cfg.rbpf.num_particles, 30);
        let written = toml::to_string(&cfg).unwrap();
        assert!(!written.contains("noise_g_sys"));
    }

    #[test]
    fn partial_toml_falls_back_to_defaults() {
        let cfg: SlamConfig = toml::from_str("[rbpf]\nnum_particles = 12\n").unwrap();
        assert_eq!(cfg.rbpf.num_particles, 12);
        assert_eq!(cfg.rbpf.noise_a_sys, RbpfConfig::default().noise_a_sys);
        assert_eq!(cfg.orientation, OrientationConfig::default());
    }

    #[test]
    fn validate_rejects_bad_values() {
        assert!(SlamConfig::default().validate().is_ok());

        let mut cfg = SlamConfig::default();
        cfg.rbpf.num_particles = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = SlamConfig::default();
        cfg.rbpf.noise_a_sys = -1.0;
        assert!(cfg.validate().is_err());

        let mut cfg = SlamConfig::default();
        cfg.rbpf.focal_length_px = 0.0;
        assert!(cfg.validate().is_err());

        let mut cfg = SlamConfig::default();
        cfg.orientation.measurement_noise[1] = f64::NAN;
        assert!(cfg.validate().is_err());
    }
}

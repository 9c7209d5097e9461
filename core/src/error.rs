//! Error type for the I/O and configuration boundary of the crate.
//!
//! The estimation code itself does not fail: degenerate sensor input produces NaN, weight underflow skips
//! resampling and malformed camera frames are absorbed as no-ops. Errors only arise when reading records or
//! configuration from disk.

use std::io;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, SlamError>;

#[derive(Debug, Error)]
pub enum SlamError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("malformed record on line {line}: {reason}")]
    MalformedRecord { line: u64, reason: String },

    #[error("unsupported configuration file extension: {0:?}")]
    UnsupportedExtension(Option<String>),

    #[error("failed to parse configuration: {0}")]
    ConfigParse(String),

    #[error("failed to serialize configuration: {0}")]
    ConfigSerialize(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

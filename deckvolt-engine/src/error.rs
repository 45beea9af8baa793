//! Error types for deckvolt-engine
//!
//! Mirrors the engine's failure taxonomy: validation errors are reported
//! before any mutation, hardware errors force a safe reset, safety aborts
//! roll a calibration run back.

use crate::limits::ValidationError;
use thiserror::Error;

/// Failure at the driver boundary (voltage sink, metrics source, governor, workload)
#[derive(Error, Debug, Clone, PartialEq)]
pub enum HardwareError {
    #[error("voltage write failed on core {core_id}: {message}")]
    Write { core_id: usize, message: String },

    #[error("metrics read failed on core {core_id}: {message}")]
    Read { core_id: usize, message: String },

    #[error("governor control failed on core {core_id}: {message}")]
    Governor { core_id: usize, message: String },

    #[error("stress workload failed: {0}")]
    Workload(String),

    #[error("permission denied: {0}")]
    Permission(String),
}

impl HardwareError {
    /// Core the failure refers to, when there is one
    pub fn core_id(&self) -> Option<usize> {
        match self {
            HardwareError::Write { core_id, .. }
            | HardwareError::Read { core_id, .. }
            | HardwareError::Governor { core_id, .. } => Some(*core_id),
            HardwareError::Workload(_) | HardwareError::Permission(_) => None,
        }
    }
}

/// Main error type for deckvolt-engine
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration rejected; every violated rule is listed
    #[error("Validation failed: {}", join_validation(.0))]
    Validation(Vec<ValidationError>),

    /// Driver-boundary failure; cores have been reset to 0 mV
    #[error("Hardware error: {0}")]
    Hardware(HardwareError),

    /// Insufficient privileges to touch hardware
    #[error("Permission error: {0}")]
    Permission(String),

    /// Three consecutive stale reads on one core
    #[error("Metrics unavailable on core {core_id}")]
    MetricsUnavailable { core_id: usize },

    /// Temperature ceiling or instability ended a run
    #[error("Safety abort: {0}")]
    SafetyAbort(String),

    /// A calibration run already owns the single slot
    #[error("Already running: {0}")]
    AlreadyRunning(String),

    /// Operation not valid in the current state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Run cancelled by request
    #[error("Cancelled")]
    Cancelled,

    /// Configuration file loading errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// File I/O errors
    #[error("File I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encode/decode errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Errors from the common crate
    #[error(transparent)]
    Common(#[from] deckvolt_common::Error),
}

impl From<HardwareError> for Error {
    fn from(err: HardwareError) -> Self {
        match err {
            HardwareError::Permission(message) => Error::Permission(message),
            other => Error::Hardware(other),
        }
    }
}

fn join_validation(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

/// Convenience Result type using deckvolt-engine Error
pub type Result<T> = std::result::Result<T, Error>;

//! Unified error handling for wbooster
//!
//! This crate provides the single error type used by the controller and
//! the daemon.

use std::io;
use std::path::PathBuf;

/// Result type alias using WbError
pub type Result<T> = std::result::Result<T, WbError>;

/// Unified error type for all wbooster operations
#[derive(thiserror::Error, Debug)]
pub enum WbError {
    // ============================================================================
    // I/O and File System Errors
    // ============================================================================
    #[error("Failed to read file {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: io::Error,
    },

    #[error("Failed to write file {path}: {source}")]
    FileWrite {
        path: PathBuf,
        source: io::Error,
    },

    #[error("Failed to parse {path}: {reason}")]
    SysfsParse {
        path: PathBuf,
        reason: String,
    },

    // ============================================================================
    // Hardware Errors
    // ============================================================================
    #[error("Failed to turn write booster {target}: {reason}")]
    HardwareToggle {
        target: &'static str,
        reason: String,
    },

    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    // ============================================================================
    // Controller Errors
    // ============================================================================
    #[error("Invalid threshold {field}: {reason}")]
    InvalidThreshold {
        field: &'static str,
        reason: String,
    },

    #[error("Unknown vote reason: {0}")]
    UnknownReason(String),

    #[error("Controller is stopped")]
    ControllerStopped,

    // ============================================================================
    // Configuration Errors
    // ============================================================================
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration value for {field}: {reason}")]
    InvalidConfig {
        field: String,
        reason: String,
    },

    // ============================================================================
    // Generic Errors
    // ============================================================================
    #[error("{0}")]
    Generic(String),
}

impl WbError {
    /// Create a generic error from a string
    pub fn generic(msg: impl Into<String>) -> Self {
        Self::Generic(msg.into())
    }

    /// Create a config error from a string
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a hardware toggle error for the given target state
    pub fn hardware(on: bool, reason: impl Into<String>) -> Self {
        Self::HardwareToggle {
            target: if on { "on" } else { "off" },
            reason: reason.into(),
        }
    }

    /// Create an invalid threshold error
    pub fn invalid_threshold(field: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidThreshold {
            field,
            reason: reason.into(),
        }
    }

    /// Whether this error came from the physical toggle
    pub fn is_hardware(&self) -> bool {
        matches!(self, Self::HardwareToggle { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hardware_error_display() {
        let err = WbError::hardware(true, "query timed out");
        assert_eq!(err.to_string(), "Failed to turn write booster on: query timed out");
        assert!(err.is_hardware());
    }

    #[test]
    fn test_threshold_error_display() {
        let err = WbError::invalid_threshold("off_slots", "must not exceed on_slots (13 > 12)");
        assert!(err.to_string().contains("off_slots"));
        assert!(!err.is_hardware());
    }

    #[test]
    fn test_file_error_keeps_path() {
        let err = WbError::FileRead {
            path: PathBuf::from("/sys/block/sda/inflight"),
            source: io::Error::from(io::ErrorKind::NotFound),
        };
        assert!(err.to_string().contains("/sys/block/sda/inflight"));
        assert!(std::error::Error::source(&err).is_some());
    }
}

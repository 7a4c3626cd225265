//! Error types for the audio policy engine
//!
//! Only argument validation, configuration and service lifecycle problems are
//! reported as errors. Permission denials and safe-volume blocks are ordinary
//! outcomes (see [`crate::types::VolumeOutcome`]), and native failures are
//! rolled back and broadcast instead of being returned to the caller.

use thiserror::Error;

/// Result type for audio policy operations
pub type Result<T> = std::result::Result<T, AudioPolicyError>;

/// Errors that can occur in the audio policy engine
#[derive(Debug, Error)]
pub enum AudioPolicyError {
    /// Raw value does not name a stream type
    #[error("Invalid stream type: {value}")]
    InvalidStreamType { value: i32 },

    /// Raw value is not a volume adjustment direction
    #[error("Invalid volume adjustment direction: {value}")]
    InvalidDirection { value: i32 },

    /// Raw value is not a ringer mode
    #[error("Invalid ringer mode: {value}")]
    InvalidRingerMode { value: i32 },

    /// Raw value is not an audio mode
    #[error("Invalid audio mode: {value}")]
    InvalidMode { value: i32 },

    /// Audio session id is out of range
    #[error("Invalid audio session id: {value}")]
    InvalidSessionId { value: i32 },

    /// Any other argument rejected at the API boundary
    #[error("Invalid argument: {message}")]
    InvalidArgument { message: String },

    /// Configuration error
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// Persisted settings could not be read or written
    #[error("Settings error: {message}")]
    Settings { message: String },

    /// The worker task is gone
    #[error("Audio service is stopped")]
    ServiceStopped,

    /// A bounded wait expired
    #[error("{operation} timed out after {timeout_ms} ms")]
    Timeout { operation: String, timeout_ms: u64 },

    /// IO error while loading configuration
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error while loading configuration
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl AudioPolicyError {
    /// Create an invalid argument error
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create a settings error
    pub fn settings(message: impl Into<String>) -> Self {
        Self::Settings {
            message: message.into(),
        }
    }

    /// Create a timeout error
    pub fn timeout(operation: impl Into<String>, timeout_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_ms,
        }
    }

    /// True for every variant that rejects caller-supplied input
    pub fn is_invalid_argument(&self) -> bool {
        matches!(
            self,
            Self::InvalidStreamType { .. }
                | Self::InvalidDirection { .. }
                | Self::InvalidRingerMode { .. }
                | Self::InvalidMode { .. }
                | Self::InvalidSessionId { .. }
                | Self::InvalidArgument { .. }
        )
    }
}

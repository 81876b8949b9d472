//! Custom error types for the arm controller.
//!
//! This module defines the error taxonomy used across the crate. Using the
//! `thiserror` crate, each failure class gets its own type so that callers can
//! apply the right isolation policy by matching on it:
//!
//! - **`WireError`**: a task record received over the network is malformed,
//!   carries an unknown tag or version, or exceeds the configured limits. The
//!   originating connection is closed; nothing else is affected.
//! - **`ResolutionError`**: a plate/well pair could not be turned into a
//!   coordinate at execution time. Only the offending task is aborted.
//! - **`CommandChannelError`**: writing a motion command to the hardware
//!   failed. This is fatal for the current execution pass.
//! - **`ConnectionError`**: network I/O on a client connection failed. That
//!   connection is closed, no retry.
//! - **`ConfigError`**: settings could not be loaded or failed validation.
//!
//! `ArmError` consolidates all of the above for code paths that can hit more
//! than one class, and `#[from]` keeps `?` working across them.

use thiserror::Error;

/// Convenience alias for results using the crate-wide error type.
pub type AppResult<T> = std::result::Result<T, ArmError>;

/// Umbrella error for the arm controller.
#[derive(Error, Debug)]
pub enum ArmError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Deserialization error: {0}")]
    Wire(#[from] WireError),

    #[error("Resolution error: {0}")]
    Resolution(#[from] ResolutionError),

    #[error("Command channel error: {0}")]
    CommandChannel(#[from] CommandChannelError),

    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Settings could not be loaded or are semantically invalid.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration load error: {0}")]
    Load(#[from] Box<figment::Error>),

    #[error("Configuration validation error: {0}")]
    Validation(String),
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        ConfigError::Load(Box::new(err))
    }
}

/// A wire task record could not be turned into a task.
#[derive(Error, Debug)]
pub enum WireError {
    #[error("Malformed task record: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("Unsupported record version {found} (expected {expected})")]
    UnsupportedVersion { found: u32, expected: u32 },

    #[error("Field '{0}' must not be empty")]
    EmptyField(&'static str),

    #[error("Task nesting exceeds maximum depth of {max_depth}")]
    TooDeep { max_depth: usize },

    #[error("Task record exceeds {max_bytes} bytes")]
    RecordTooLarge { max_bytes: usize },

    #[error("Stream ended in the middle of a task record")]
    Truncated,
}

/// A plate/well pair has no coordinate.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResolutionError {
    #[error("Unknown plate '{0}'")]
    UnknownPlate(String),

    #[error("Invalid well identifier '{well}' on plate '{plate}'")]
    InvalidWell { plate: String, well: String },

    #[error("Well '{well}' is outside plate '{plate}' ({rows}x{columns})")]
    OutOfRange {
        plate: String,
        well: String,
        rows: u32,
        columns: u32,
    },
}

/// Writing to the hardware command channel failed.
#[derive(Error, Debug)]
pub enum CommandChannelError {
    #[error("Failed to write command '{command}': {source}")]
    Write {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to open command output '{target}': {source}")]
    Open {
        target: String,
        #[source]
        source: std::io::Error,
    },
}

/// Failure while executing a single task.
///
/// Resolution failures abort only the task that hit them; channel failures
/// end the whole execution pass.
#[derive(Error, Debug)]
pub enum TaskError {
    #[error(transparent)]
    Resolution(#[from] ResolutionError),

    #[error(transparent)]
    CommandChannel(#[from] CommandChannelError),
}

impl TaskError {
    /// True when the execution pass must stop.
    pub fn is_fatal(&self) -> bool {
        matches!(self, TaskError::CommandChannel(_))
    }
}

impl From<TaskError> for ArmError {
    fn from(err: TaskError) -> Self {
        match err {
            TaskError::Resolution(e) => ArmError::Resolution(e),
            TaskError::CommandChannel(e) => ArmError::CommandChannel(e),
        }
    }
}

/// Editing text for a task has the wrong shape.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EditError {
    #[error("Expected '<plate>, <well>', got '{0}'")]
    Format(String),
}

/// Network I/O on a client connection failed.
#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to accept connection: {0}")]
    Accept(#[source] std::io::Error),

    #[error("Failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Connection I/O failed: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ArmError::from(ResolutionError::UnknownPlate("PlateZ".to_string()));
        assert_eq!(err.to_string(), "Resolution error: Unknown plate 'PlateZ'");
    }

    #[test]
    fn test_wire_version_error() {
        let err = WireError::UnsupportedVersion {
            found: 7,
            expected: 1,
        };
        assert!(err.to_string().contains("version 7"));
    }

    #[test]
    fn test_channel_error_keeps_command() {
        let err = CommandChannelError::Write {
            command: "move(1.00,2.00)".into(),
            source: std::io::Error::new(std::io::ErrorKind::BrokenPipe, "gone"),
        };
        assert!(err.to_string().contains("move(1.00,2.00)"));
    }
}

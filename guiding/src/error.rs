//! Error types for the guiding core

use mast_device::{DeviceError, ErrorKind, ImageGeometry, ReportableError};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Result type for guiding operations
pub type GuidingResult<T> = Result<T, GuidingError>;

/// Wire protocol errors between coordinator and worker
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Connection closed by peer")]
    Closed,

    #[error("Empty frame")]
    EmptyFrame,

    #[error("Frame of {size} bytes exceeds the {max} byte limit")]
    FrameTooLarge { size: usize, max: usize },

    #[error("Malformed message: {0}")]
    Malformed(String),

    #[error("Unexpected message: expected {expected}, got {got}")]
    Unexpected { expected: String, got: String },

    #[error("Timed out after {duration:?} waiting for {waiting_for}")]
    Timeout {
        duration: Duration,
        waiting_for: String,
    },
}

impl ProtocolError {
    pub fn unexpected(expected: impl Into<String>, got: impl Into<String>) -> Self {
        ProtocolError::Unexpected {
            expected: expected.into(),
            got: got.into(),
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, ProtocolError::Timeout { .. })
    }
}

impl From<serde_json::Error> for ProtocolError {
    fn from(err: serde_json::Error) -> Self {
        ProtocolError::Malformed(err.to_string())
    }
}

/// Shared image buffer errors
#[derive(Error, Debug)]
pub enum BufferError {
    #[error("Shared buffer '{name}' at {path:?}: {source}")]
    Io {
        name: String,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Shared buffer '{name}' does not exist at {path:?}")]
    NotFound { name: String, path: PathBuf },

    #[error(
        "Shared buffer '{name}' geometry mismatch: expected {expected} ({expected_len} bytes), buffer holds {actual_len} bytes"
    )]
    GeometryMismatch {
        name: String,
        expected: ImageGeometry,
        expected_len: usize,
        actual_len: u64,
    },

    #[error("Frame geometry {frame} does not match shared buffer '{name}' geometry {buffer}")]
    FrameMismatch {
        name: String,
        frame: ImageGeometry,
        buffer: ImageGeometry,
    },

    #[error("Invalid shared buffer geometry: {0}")]
    InvalidGeometry(String),

    #[error("Invalid shared buffer name '{0}'")]
    InvalidName(String),
}

/// Errors raised by the guiding coordinator and its worker channel
#[derive(Error, Debug)]
pub enum GuidingError {
    #[error(transparent)]
    Device(#[from] DeviceError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Buffer error: {0}")]
    Buffer(#[from] BufferError),

    #[error("Solve failed: {0}")]
    SolveFailure(String),

    #[error("Worker unreachable: {0}")]
    WorkerUnreachable(String),

    #[error("Invalid guiding configuration: {0}")]
    Config(String),
}

impl ReportableError for ProtocolError {
    fn kind(&self) -> ErrorKind {
        ErrorKind::Protocol
    }
}

impl ReportableError for BufferError {
    fn kind(&self) -> ErrorKind {
        ErrorKind::Buffer
    }
}

impl ReportableError for GuidingError {
    fn kind(&self) -> ErrorKind {
        match self {
            GuidingError::Device(e) => e.kind(),
            GuidingError::Protocol(_) => ErrorKind::Protocol,
            GuidingError::Buffer(_) => ErrorKind::Buffer,
            GuidingError::SolveFailure(_) => ErrorKind::SolveFailure,
            GuidingError::WorkerUnreachable(_) => ErrorKind::WorkerUnreachable,
            GuidingError::Config(_) => ErrorKind::InvalidParameter,
        }
    }
}

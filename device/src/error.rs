//! Error types for MAST devices
//!
//! Every error carries an [`ErrorKind`] so that command handlers can report
//! failures through the uniform command envelope without losing their category.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::activity::ActivityError;

/// Result type for device operations
pub type DeviceResult<T> = Result<T, DeviceError>;

/// Coarse error category reported to callers in command envelopes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    NotConnected,
    NotPowered,
    DuplicateActivity,
    NotActive,
    NotSupported,
    InvalidParameter,
    DriverFault,
    SolveFailure,
    WorkerUnreachable,
    Protocol,
    Buffer,
    Internal,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Errors raised by device controllers and pollers
#[derive(Error, Debug, Clone)]
pub enum DeviceError {
    #[error("{0}: not connected")]
    NotConnected(String),

    #[error("{0}: not powered")]
    NotPowered(String),

    #[error(transparent)]
    Activity(#[from] ActivityError),

    #[error("{device}: operation not supported - {operation}")]
    NotSupported { device: String, operation: String },

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    /// The underlying hardware driver call failed
    #[error("{device}: driver fault during {operation} - {message}")]
    DriverFault {
        device: String,
        operation: String,
        message: String,
    },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl DeviceError {
    /// Create a driver fault with operation context
    pub fn driver(
        device: impl Into<String>,
        operation: impl Into<String>,
        message: impl std::fmt::Display,
    ) -> Self {
        DeviceError::DriverFault {
            device: device.into(),
            operation: operation.into(),
            message: message.to_string(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            DeviceError::NotConnected(_) => ErrorKind::NotConnected,
            DeviceError::NotPowered(_) => ErrorKind::NotPowered,
            DeviceError::Activity(ActivityError::Duplicate { .. }) => ErrorKind::DuplicateActivity,
            DeviceError::Activity(ActivityError::NotActive { .. }) => ErrorKind::NotActive,
            DeviceError::NotSupported { .. } => ErrorKind::NotSupported,
            DeviceError::InvalidParameter(_) => ErrorKind::InvalidParameter,
            DeviceError::DriverFault { .. } => ErrorKind::DriverFault,
            DeviceError::Internal(_) => ErrorKind::Internal,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        assert_eq!(DeviceError::NotConnected("camera".into()).kind(), ErrorKind::NotConnected);
        assert_eq!(
            DeviceError::driver("camera", "start_exposure", "COM failure").kind(),
            ErrorKind::DriverFault
        );
        let dup: DeviceError = ActivityError::Duplicate {
            device: "camera".into(),
            activity: "Exposing".into(),
        }
        .into();
        assert_eq!(dup.kind(), ErrorKind::DuplicateActivity);
    }

    #[test]
    fn test_driver_fault_message() {
        let err = DeviceError::driver("camera", "abort_exposure", "timeout");
        let msg = err.to_string();
        assert!(msg.contains("camera"));
        assert!(msg.contains("abort_exposure"));
        assert!(msg.contains("timeout"));
    }
}

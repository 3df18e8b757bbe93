//! Uniform command result envelope
//!
//! Every mutating command returns `{result, error, status}`: the command's
//! output (if any), the error it hit (if any) and a fresh status snapshot of
//! the device, so a caller can always observe current device state even
//! after a failure.

use crate::error::{DeviceError, ErrorKind};
use serde::{Deserialize, Serialize};

/// Errors that can be reported inside a [`CommandOutcome`]
pub trait ReportableError: std::fmt::Display {
    fn kind(&self) -> ErrorKind;
}

impl ReportableError for DeviceError {
    fn kind(&self) -> ErrorKind {
        DeviceError::kind(self)
    }
}

/// Error as reported to callers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorReport {
    pub kind: ErrorKind,
    pub message: String,
}

impl ErrorReport {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn from_error<E: ReportableError + ?Sized>(err: &E) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

/// Result of a device command plus the device status after it ran
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandOutcome<S> {
    pub result: Option<serde_json::Value>,
    pub error: Option<ErrorReport>,
    pub status: S,
}

impl<S> CommandOutcome<S> {
    /// Capture a command result. Unit results (`()`) are reported as no result.
    pub fn from_result<T, E>(result: Result<T, E>, status: S) -> Self
    where
        T: Serialize,
        E: ReportableError,
    {
        match result {
            Ok(value) => {
                let value = match serde_json::to_value(&value) {
                    Ok(serde_json::Value::Null) => None,
                    Ok(v) => Some(v),
                    Err(e) => {
                        return Self {
                            result: None,
                            error: Some(ErrorReport::new(
                                ErrorKind::Internal,
                                format!("result serialization failed: {}", e),
                            )),
                            status,
                        }
                    }
                };
                Self {
                    result: value,
                    error: None,
                    status,
                }
            }
            Err(e) => Self {
                result: None,
                error: Some(ErrorReport::from_error(&e)),
                status,
            },
        }
    }

    pub fn ok(status: S) -> Self {
        Self {
            result: None,
            error: None,
            status,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        self.error.as_ref().map(|e| e.kind)
    }
}

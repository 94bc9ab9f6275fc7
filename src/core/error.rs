//! Error types for Portunus operations.
//!
//! One canonical error enum is used throughout. Failures come in two kinds:
//! **operational** errors are expected (a tool timed out, a policy denied a
//! run) and are recorded without terminating the run; **bug** errors indicate
//! broken invariants and are recorded, terminate the run, and surface to the
//! caller.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::io;
use thiserror::Error;

/// Closed set of machine-readable error codes.
///
/// Persisted in event payloads and response `error` blocks as
/// SCREAMING_SNAKE_CASE strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    Timeout,
    NonzeroExit,
    InvalidJsonOutput,
    CommandNotFound,
    PermissionDenied,
    CwdNotFound,
    CwdNotDirectory,
    EnvInvalid,
    ConnectionFailed,
    HttpError,
    CapabilityMissing,
    UnknownAdapter,
    PolicyDenied,
    MaxStepsExceeded,
    Cancelled,
    RunExists,
    RunNotFound,
    SequenceConflict,
    DigestMismatch,
    InvalidBundle,
    BugError,
    UnknownError,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::Timeout => "TIMEOUT",
            ErrorCode::NonzeroExit => "NONZERO_EXIT",
            ErrorCode::InvalidJsonOutput => "INVALID_JSON_OUTPUT",
            ErrorCode::CommandNotFound => "COMMAND_NOT_FOUND",
            ErrorCode::PermissionDenied => "PERMISSION_DENIED",
            ErrorCode::CwdNotFound => "CWD_NOT_FOUND",
            ErrorCode::CwdNotDirectory => "CWD_NOT_DIRECTORY",
            ErrorCode::EnvInvalid => "ENV_INVALID",
            ErrorCode::ConnectionFailed => "CONNECTION_FAILED",
            ErrorCode::HttpError => "HTTP_ERROR",
            ErrorCode::CapabilityMissing => "CAPABILITY_MISSING",
            ErrorCode::UnknownAdapter => "UNKNOWN_ADAPTER",
            ErrorCode::PolicyDenied => "POLICY_DENIED",
            ErrorCode::MaxStepsExceeded => "MAX_STEPS_EXCEEDED",
            ErrorCode::Cancelled => "CANCELLED",
            ErrorCode::RunExists => "RUN_EXISTS",
            ErrorCode::RunNotFound => "RUN_NOT_FOUND",
            ErrorCode::SequenceConflict => "SEQUENCE_CONFLICT",
            ErrorCode::DigestMismatch => "DIGEST_MISMATCH",
            ErrorCode::InvalidBundle => "INVALID_BUNDLE",
            ErrorCode::BugError => "BUG_ERROR",
            ErrorCode::UnknownError => "UNKNOWN_ERROR",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Canonical error type for all Portunus operations.
#[derive(Error, Debug)]
pub enum PortunusError {
    /// SQLite database error (auto-converts from `rusqlite::Error`)
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// I/O error (auto-converts from `std::io::Error`)
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Invalid construction or wiring (e.g. both a single adapter and a
    /// registry supplied, empty adapter id). Never recorded as a run event.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Expected failure with a stable code. Recorded at step scope; the run
    /// continues.
    #[error("{code}: {message}")]
    Operational {
        code: ErrorCode,
        message: String,
        details: Option<JsonValue>,
    },

    /// Invariant violation or unexpected failure. Recorded, terminates the
    /// run, and returned to the caller.
    #[error("{code}: {message}")]
    Bug {
        code: ErrorCode,
        message: String,
        details: Option<JsonValue>,
    },
}

impl PortunusError {
    pub fn operational(code: ErrorCode, message: impl Into<String>) -> Self {
        PortunusError::Operational {
            code,
            message: message.into(),
            details: None,
        }
    }

    pub fn operational_with(
        code: ErrorCode,
        message: impl Into<String>,
        details: JsonValue,
    ) -> Self {
        PortunusError::Operational {
            code,
            message: message.into(),
            details: Some(details),
        }
    }

    pub fn bug(code: ErrorCode, message: impl Into<String>) -> Self {
        PortunusError::Bug {
            code,
            message: message.into(),
            details: None,
        }
    }

    pub fn bug_with(code: ErrorCode, message: impl Into<String>, details: JsonValue) -> Self {
        PortunusError::Bug {
            code,
            message: message.into(),
            details: Some(details),
        }
    }

    pub fn is_operational(&self) -> bool {
        matches!(self, PortunusError::Operational { .. })
    }

    /// Code carried by structured variants; infrastructure errors have none.
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            PortunusError::Operational { code, .. } | PortunusError::Bug { code, .. } => {
                Some(*code)
            }
            _ => None,
        }
    }

    pub fn details(&self) -> Option<&JsonValue> {
        match self {
            PortunusError::Operational { details, .. } | PortunusError::Bug { details, .. } => {
                details.as_ref()
            }
            _ => None,
        }
    }
}

use std::io;
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Transient,
    Permanent,
}

/// Failure of a single attempt, classified by the operation that produced it.
#[derive(Debug)]
pub enum AttemptError {
    Transient(anyhow::Error),
    Permanent(anyhow::Error),
}

impl AttemptError {
    pub fn transient(err: impl Into<anyhow::Error>) -> Self {
        Self::Transient(err.into())
    }

    pub fn permanent(err: impl Into<anyhow::Error>) -> Self {
        Self::Permanent(err.into())
    }

    pub fn classified(class: ErrorClass, err: impl Into<anyhow::Error>) -> Self {
        match class {
            ErrorClass::Transient => Self::Transient(err.into()),
            ErrorClass::Permanent => Self::Permanent(err.into()),
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Transient(_) => ErrorClass::Transient,
            Self::Permanent(_) => ErrorClass::Permanent,
        }
    }
}

#[derive(Debug, Error)]
pub enum RetryError {
    #[error("circuit '{resource}' is open, failing fast (retry after {retry_after:?})")]
    CircuitOpen {
        resource: String,
        retry_after: Duration,
    },

    #[error("'{resource}' failed after {attempts} attempt(s): {error:#}")]
    Exhausted {
        resource: String,
        attempts: u32,
        error: anyhow::Error,
    },

    #[error("'{resource}' failed with a non-retryable error: {error:#}")]
    Permanent {
        resource: String,
        error: anyhow::Error,
    },
}

impl RetryError {
    pub fn resource(&self) -> &str {
        match self {
            Self::CircuitOpen { resource, .. }
            | Self::Exhausted { resource, .. }
            | Self::Permanent { resource, .. } => resource,
        }
    }

    pub fn is_circuit_open(&self) -> bool {
        matches!(self, Self::CircuitOpen { .. })
    }
}

/// 408, 429 and every 5xx are worth another attempt; other statuses
/// (bad request, auth, not found) will fail the same way again.
pub fn classify_http_status(status: u16) -> ErrorClass {
    match status {
        408 | 429 | 500..=599 => ErrorClass::Transient,
        _ => ErrorClass::Permanent,
    }
}

pub fn classify_io_error(err: &io::Error) -> ErrorClass {
    match err.kind() {
        io::ErrorKind::TimedOut
        | io::ErrorKind::ConnectionRefused
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::NotConnected
        | io::ErrorKind::BrokenPipe
        | io::ErrorKind::Interrupted
        | io::ErrorKind::WouldBlock => ErrorClass::Transient,
        _ => ErrorClass::Permanent,
    }
}

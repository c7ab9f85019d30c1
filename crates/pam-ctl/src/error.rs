//! Error types for the controller

use pam_protocol::ProtocolError;
use thiserror::Error;

/// Transport fault that survived a reconnect-and-retry
#[derive(Debug, Error)]
pub enum LinkError {
    /// I/O error after reconnecting
    #[error("{operation} failed on {endpoint}: {source}")]
    Transport {
        /// Endpoint description (port path or simulator id)
        endpoint: String,
        /// Link operation that failed
        operation: &'static str,
        #[source]
        source: std::io::Error,
    },
}

/// Errors from multi-step driver operations
#[derive(Debug, Error)]
pub enum DriverError {
    /// Parameters rejected before touching hardware
    #[error(transparent)]
    Validation(#[from] ProtocolError),

    /// Actuator still energized; FUNCTION was not written
    #[error("safety stop: PIN15 still energized after {attempts} checks")]
    SafetyStop { attempts: u32 },

    /// Readback did not match what was written
    #[error("{register} verification failed: expected {expected}, read back {actual}")]
    VerificationFailed {
        /// Register that was verified
        register: String,
        /// Value written
        expected: String,
        /// Value read back
        actual: String,
    },

    /// Readback produced no parseable reply
    #[error("no response reading back {0}")]
    NoResponse(String),
}

impl DriverError {
    /// Failure for a readback that did not match what was written
    pub(crate) fn readback(
        register: impl Into<String>,
        expected: impl ToString,
        actual: Option<impl ToString>,
    ) -> Self {
        match actual {
            Some(actual) => DriverError::VerificationFailed {
                register: register.into(),
                expected: expected.to_string(),
                actual: actual.to_string(),
            },
            None => DriverError::NoResponse(register.into()),
        }
    }
}

/// Errors returned to callers of the command serializer
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum SubmitError {
    /// Queue at capacity; the command was not accepted
    #[error("command queue full")]
    QueueFull,

    /// No result within the caller's wait window (the command may still run)
    #[error("command timeout")]
    TimedOut,

    /// The processor has been stopped
    #[error("command processor stopped")]
    QueueClosed,
}

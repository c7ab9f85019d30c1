//! Error types for PAM command validation and parsing

use thiserror::Error;

/// Errors raised while validating parameters or parsing console text
///
/// These are all rejected before any byte reaches the serial link.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// FUNCTION code other than 195 or 196
    #[error("invalid function: {0} (expected 195 or 196)")]
    InvalidFunction(i64),

    /// Analog input unit other than V or C
    #[error("invalid unit: {0:?} (expected V or C)")]
    InvalidUnit(String),

    /// Channel other than A or B
    #[error("invalid channel: {0:?} (expected A or B)")]
    InvalidChannel(String),

    /// Current setpoint outside the accepted range
    #[error("value {0} out of range (500-2600)")]
    CurrentOutOfRange(i64),

    /// Argument that should have been a number
    #[error("invalid number: {0:?}")]
    InvalidNumber(String),

    /// Unknown or unsupported command
    #[error("unknown command: {0}")]
    UnknownCommand(String),
}

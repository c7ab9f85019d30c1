//! PAM Console Protocol Library
//!
//! This crate provides the wire vocabulary for the PAM actuator controller's
//! line-based serial console:
//!
//! - **Commands**: bare ASCII tokens terminated by CRLF (`FUNCTION 196`,
//!   `AINA V`, `CURRENT:A 1200`, `SAVE`, `RX1:READYA`, `RC:S`)
//! - **Responses**: free text terminated by a `>` prompt
//! - **Status words**: READY and remote-control bitmasks
//! - **Scaling**: conversion of raw throttle readings into display units
//!
//! # Architecture
//!
//! The same command token means different things based on its argument:
//! - `FUNCTION` with no argument = query the firmware function
//! - `FUNCTION 196` = write the firmware function
//!
//! [`PamCommand`] covers both forms; [`response`] holds the tolerant parsers
//! used on the free-text replies.
//!
//! # Example
//!
//! ```rust
//! use pam_protocol::{Channel, EncodeCommand, PamCommand};
//! use pam_protocol::response::extract_number;
//!
//! let cmd = PamCommand::Current { channel: Channel::A, value: Some(1200) };
//! assert_eq!(cmd.encode(), b"CURRENT:A 1200\r\n".to_vec());
//!
//! assert_eq!(extract_number("1200\r\n>"), Some(1200.0));
//! ```

pub mod command;
pub mod error;
pub mod response;
pub mod scaling;
pub mod status;

use std::fmt;
use std::str::FromStr;

pub use command::PamCommand;
pub use error::ProtocolError;
pub use status::ReadyStatus;

/// Lowest current setpoint accepted by the controller, in mA
pub const CURRENT_MIN_MA: u32 = 500;
/// Highest current setpoint accepted by the controller, in mA
pub const CURRENT_MAX_MA: u32 = 2600;

/// Firmware operating function
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(into = "u16", try_from = "u16"))]
pub enum Function {
    /// FUNCTION 195: single, directional channel
    Single,
    /// FUNCTION 196: dual independent channels
    Dual,
}

impl Function {
    /// Numeric code used on the console
    pub fn code(&self) -> u16 {
        match self {
            Function::Single => 195,
            Function::Dual => 196,
        }
    }

    /// Map a console code to a function, rejecting anything but 195/196
    pub fn from_code(code: i64) -> Result<Self, ProtocolError> {
        match code {
            195 => Ok(Function::Single),
            196 => Ok(Function::Dual),
            other => Err(ProtocolError::InvalidFunction(other)),
        }
    }
}

impl From<Function> for u16 {
    fn from(f: Function) -> Self {
        f.code()
    }
}

impl TryFrom<u16> for Function {
    type Error = ProtocolError;

    fn try_from(code: u16) -> Result<Self, Self::Error> {
        Function::from_code(i64::from(code))
    }
}

impl fmt::Display for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// Analog input unit (throttle source)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum AinUnit {
    /// Voltage-controlled throttle
    V,
    /// Current-controlled throttle
    C,
}

impl AinUnit {
    /// Console token for this unit
    pub fn as_str(&self) -> &'static str {
        match self {
            AinUnit::V => "V",
            AinUnit::C => "C",
        }
    }
}

impl FromStr for AinUnit {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "V" => Ok(AinUnit::V),
            "C" => Ok(AinUnit::C),
            _ => Err(ProtocolError::InvalidUnit(s.to_string())),
        }
    }
}

impl fmt::Display for AinUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Output channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Channel {
    /// Channel A (the only channel used under FUNCTION 195)
    #[default]
    A,
    /// Channel B
    B,
}

impl Channel {
    /// Console suffix for this channel
    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::A => "A",
            Channel::B => "B",
        }
    }

    /// The other channel
    pub fn other(&self) -> Channel {
        match self {
            Channel::A => Channel::B,
            Channel::B => Channel::A,
        }
    }
}

impl FromStr for Channel {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "A" => Ok(Channel::A),
            "B" => Ok(Channel::B),
            _ => Err(ProtocolError::InvalidChannel(s.to_string())),
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Console mode; the controller only accepts our command set in STD
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ConsoleMode {
    /// Standard command set
    Std,
    /// Expert command set
    Exp,
}

impl ConsoleMode {
    /// Console token for this mode
    pub fn as_str(&self) -> &'static str {
        match self {
            ConsoleMode::Std => "STD",
            ConsoleMode::Exp => "EXP",
        }
    }
}

/// Validate a current setpoint against the controller's accepted range
pub fn validate_current(value: i64) -> Result<u32, ProtocolError> {
    if (i64::from(CURRENT_MIN_MA)..=i64::from(CURRENT_MAX_MA)).contains(&value) {
        Ok(value as u32)
    } else {
        Err(ProtocolError::CurrentOutOfRange(value))
    }
}

/// Trait for commands that can be encoded to bytes
pub trait EncodeCommand {
    /// Encode this command to its wire format, terminator included
    fn encode(&self) -> Vec<u8>;
}

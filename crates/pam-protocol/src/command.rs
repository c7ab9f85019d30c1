//! PAM console command representation
//!
//! Every console line is a bare keyword, optionally followed by a single
//! space-separated argument. A keyword on its own is a query; with an
//! argument it is a write.
//!
//! # Common Commands
//! - `FUNCTION` / `FUNCTION 196` - firmware function
//! - `MODE` / `MODE STD` - console mode
//! - `AINA` / `AINB V` - analog input unit
//! - `CURRENT:A` / `CURRENT:A 1200` - current setpoint in mA
//! - `IA` / `IB 0` - channel current
//! - `W`, `WA`, `WB` - throttle readings
//! - `SAVE` - persist working registers to EEPROM
//! - `RX1:READYA` - READY status word
//! - `RC:S` - remote-control status word

use std::fmt;
use std::str::FromStr;

use tracing::trace;

use crate::error::ProtocolError;
use crate::{AinUnit, Channel, ConsoleMode, EncodeCommand};

/// Line terminator appended to every command
pub const LINE_TERMINATOR: &str = "\r\n";

/// Prompt byte that ends every console reply
pub const PROMPT: u8 = b'>';

/// PAM console command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PamCommand {
    /// Query or set the firmware function: FUNCTION / FUNCTION 196
    Function(Option<u16>),
    /// Query or set the console mode: MODE / MODE STD
    ConsoleMode(Option<ConsoleMode>),
    /// Query or set an analog input unit: AINA / AINA V
    AinMode {
        channel: Channel,
        unit: Option<AinUnit>,
    },
    /// Query or set a current setpoint: CURRENT:A / CURRENT:A 1200
    Current {
        channel: Channel,
        value: Option<u32>,
    },
    /// Query or force a channel current: IA / IB 0
    ChannelCurrent {
        channel: Channel,
        value: Option<u32>,
    },
    /// Throttle reading: W (function 195) or WA / WB (function 196)
    Throttle(Option<Channel>),
    /// Persist working registers: SAVE
    Save,
    /// READY status word: RX1:READYA
    ReadyStatus,
    /// Remote-control status word: RC:S
    RemoteStatus,
    /// Unknown/unrecognized command
    Unknown(String),
}

impl PamCommand {
    /// Render the command line without its terminator
    pub fn line(&self) -> String {
        match self {
            PamCommand::Function(None) => "FUNCTION".to_string(),
            PamCommand::Function(Some(code)) => format!("FUNCTION {}", code),
            PamCommand::ConsoleMode(None) => "MODE".to_string(),
            PamCommand::ConsoleMode(Some(mode)) => format!("MODE {}", mode.as_str()),
            PamCommand::AinMode { channel, unit } => match unit {
                None => format!("AIN{}", channel),
                Some(unit) => format!("AIN{} {}", channel, unit),
            },
            PamCommand::Current { channel, value } => match value {
                None => format!("CURRENT:{}", channel),
                Some(v) => format!("CURRENT:{} {}", channel, v),
            },
            PamCommand::ChannelCurrent { channel, value } => match value {
                None => format!("I{}", channel),
                Some(v) => format!("I{} {}", channel, v),
            },
            PamCommand::Throttle(None) => "W".to_string(),
            PamCommand::Throttle(Some(channel)) => format!("W{}", channel),
            PamCommand::Save => "SAVE".to_string(),
            PamCommand::ReadyStatus => "RX1:READYA".to_string(),
            PamCommand::RemoteStatus => "RC:S".to_string(),
            PamCommand::Unknown(raw) => raw.clone(),
        }
    }

    /// Returns true if this command changes controller registers
    pub fn is_write(&self) -> bool {
        match self {
            PamCommand::Function(arg) => arg.is_some(),
            PamCommand::ConsoleMode(arg) => arg.is_some(),
            PamCommand::AinMode { unit, .. } => unit.is_some(),
            PamCommand::Current { value, .. } | PamCommand::ChannelCurrent { value, .. } => {
                value.is_some()
            }
            PamCommand::Save => true,
            PamCommand::Throttle(_)
            | PamCommand::ReadyStatus
            | PamCommand::RemoteStatus
            | PamCommand::Unknown(_) => false,
        }
    }

    /// Parse a single console line (terminator optional)
    ///
    /// Unrecognized keywords parse to [`PamCommand::Unknown`]; malformed
    /// arguments to a known keyword are an error.
    pub fn parse(line: &str) -> Result<Self, ProtocolError> {
        let line = line.trim();
        let (keyword, arg) = match line.split_once(char::is_whitespace) {
            Some((k, a)) => (k, Some(a.trim())),
            None => (line, None),
        };
        let keyword = keyword.to_ascii_uppercase();

        let cmd = match keyword.as_str() {
            "FUNCTION" => PamCommand::Function(arg.map(parse_u16).transpose()?),
            "MODE" => PamCommand::ConsoleMode(
                arg.map(|a| match a.to_ascii_uppercase().as_str() {
                    "STD" => Ok(ConsoleMode::Std),
                    "EXP" => Ok(ConsoleMode::Exp),
                    _ => Err(ProtocolError::UnknownCommand(line.to_string())),
                })
                .transpose()?,
            ),
            "AINA" | "AINB" => PamCommand::AinMode {
                channel: keyword[3..].parse()?,
                unit: arg.map(str::parse).transpose()?,
            },
            "CURRENT:A" | "CURRENT:B" => PamCommand::Current {
                channel: keyword[8..].parse()?,
                value: arg.map(parse_u32).transpose()?,
            },
            "IA" | "IB" => PamCommand::ChannelCurrent {
                channel: keyword[1..].parse()?,
                value: arg.map(parse_u32).transpose()?,
            },
            "W" => PamCommand::Throttle(None),
            "WA" | "WB" => PamCommand::Throttle(Some(keyword[1..].parse()?)),
            "SAVE" => PamCommand::Save,
            "RX1:READYA" => PamCommand::ReadyStatus,
            "RC:S" => PamCommand::RemoteStatus,
            _ => {
                trace!("Unrecognized console line: {:?}", line);
                PamCommand::Unknown(line.to_string())
            }
        };

        Ok(cmd)
    }
}

fn parse_u16(s: &str) -> Result<u16, ProtocolError> {
    s.parse()
        .map_err(|_| ProtocolError::InvalidNumber(s.to_string()))
}

fn parse_u32(s: &str) -> Result<u32, ProtocolError> {
    s.parse()
        .map_err(|_| ProtocolError::InvalidNumber(s.to_string()))
}

impl FromStr for PamCommand {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        PamCommand::parse(s)
    }
}

impl fmt::Display for PamCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.line())
    }
}

impl EncodeCommand for PamCommand {
    fn encode(&self) -> Vec<u8> {
        let mut bytes = self.line().into_bytes();
        bytes.extend_from_slice(LINE_TERMINATOR.as_bytes());
        bytes
    }
}

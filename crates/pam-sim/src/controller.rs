//! Virtual PAM controller
//!
//! Models the firmware registers behind the console and answers each command
//! line the way the real controller does: a short text reply terminated by
//! the `>` prompt. Fault knobs let tests reproduce a live actuator, slow
//! EEPROM rebuilds, stale readbacks, and a flaky cable.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use pam_protocol::{AinUnit, Channel, ConsoleMode, PamCommand};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

/// A virtual controller shared between the test (or daemon) and its ports
pub type SharedPam = Arc<Mutex<VirtualPam>>;

/// Reply for accepted writes
const OK_REPLY: &str = "OK\r\n>";
/// Reply for unknown or malformed lines
const ERR_REPLY: &str = "ERR\r\n>";
/// Most recent lines kept in the received log
pub const RECEIVED_HISTORY: usize = 1024;

/// Configuration for creating a virtual controller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VirtualPamConfig {
    /// Display name/identifier
    pub id: String,
    /// Initial FUNCTION code
    pub function: u16,
    /// Initial console mode
    pub console_mode: ConsoleMode,
    /// Initial AINA unit
    pub ain_a: AinUnit,
    /// Initial AINB unit
    pub ain_b: AinUnit,
    /// Raw throttle readings reported for W, WA, WB
    pub throttle_w: f64,
    pub throttle_a: f64,
    pub throttle_b: f64,
    /// Raw READY word reported for RX1:READYA
    pub ready_word: i32,
}

impl Default for VirtualPamConfig {
    fn default() -> Self {
        Self {
            id: "Virtual PAM".to_string(),
            function: 195,
            console_mode: ConsoleMode::Std,
            ain_a: AinUnit::V,
            ain_b: AinUnit::V,
            throttle_w: 2500.0,
            throttle_a: 2500.0,
            throttle_b: 1200.0,
            ready_word: 65532,
        }
    }
}

/// A simulated PAM controller console
#[derive(Debug)]
pub struct VirtualPam {
    id: String,
    function: u16,
    previous_function: u16,
    console_mode: ConsoleMode,
    ain: [AinUnit; 2],
    setpoint: [u32; 2],
    channel_current: [u32; 2],
    throttle_w: f64,
    throttle: [f64; 2],
    ready_word: i32,
    pin15: bool,
    pin15_polls: u32,
    pin6: bool,
    stale_function_readbacks: u32,
    ignore_current_writes: bool,
    ignore_ain_writes: [bool; 2],
    silent: bool,
    /// Last `RECEIVED_HISTORY` lines, oldest first
    received: VecDeque<String>,
    saves: u32,
    bytes_received: usize,
    fail_next_io: u32,
    fail_next_opens: u32,
    opens: u32,
}

fn index(channel: Channel) -> usize {
    match channel {
        Channel::A => 0,
        Channel::B => 1,
    }
}

impl VirtualPam {
    /// Create a controller with default registers
    pub fn new(id: impl Into<String>) -> Self {
        let mut pam = Self::from_config(VirtualPamConfig::default());
        pam.id = id.into();
        pam
    }

    /// Create a controller from configuration
    pub fn from_config(config: VirtualPamConfig) -> Self {
        Self {
            id: config.id,
            function: config.function,
            previous_function: config.function,
            console_mode: config.console_mode,
            ain: [config.ain_a, config.ain_b],
            setpoint: [0, 0],
            channel_current: [0, 0],
            throttle_w: config.throttle_w,
            throttle: [config.throttle_a, config.throttle_b],
            ready_word: config.ready_word,
            pin15: false,
            pin15_polls: 0,
            pin6: false,
            stale_function_readbacks: 0,
            ignore_current_writes: false,
            ignore_ain_writes: [false, false],
            silent: false,
            received: VecDeque::with_capacity(RECEIVED_HISTORY),
            saves: 0,
            bytes_received: 0,
            fail_next_io: 0,
            fail_next_opens: 0,
            opens: 0,
        }
    }

    /// Wrap this controller for sharing with ports
    pub fn shared(self) -> SharedPam {
        Arc::new(Mutex::new(self))
    }

    /// Get the identifier
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Current FUNCTION register
    pub fn function(&self) -> u16 {
        self.function
    }

    /// Current console mode
    pub fn console_mode(&self) -> ConsoleMode {
        self.console_mode
    }

    /// Set the console mode (e.g. to simulate a technician leaving it in EXP)
    pub fn set_console_mode(&mut self, mode: ConsoleMode) {
        self.console_mode = mode;
    }

    /// Analog input unit of a channel
    pub fn ain(&self, channel: Channel) -> AinUnit {
        self.ain[index(channel)]
    }

    /// Set the analog input unit of a channel
    pub fn set_ain(&mut self, channel: Channel, unit: AinUnit) {
        self.ain[index(channel)] = unit;
    }

    /// Current setpoint of a channel, in mA
    pub fn setpoint(&self, channel: Channel) -> u32 {
        self.setpoint[index(channel)]
    }

    /// Set a channel's current setpoint directly
    pub fn set_setpoint(&mut self, channel: Channel, value: u32) {
        self.setpoint[index(channel)] = value;
    }

    /// Channel current register (IA/IB)
    pub fn channel_current(&self, channel: Channel) -> u32 {
        self.channel_current[index(channel)]
    }

    /// Set the channel current register (IA/IB)
    pub fn set_channel_current(&mut self, channel: Channel, value: u32) {
        self.channel_current[index(channel)] = value;
    }

    /// Set the raw READY word
    pub fn set_ready_word(&mut self, word: i32) {
        self.ready_word = word;
    }

    /// Set the raw throttle readings for W, WA and WB
    pub fn set_throttle(&mut self, w: f64, wa: f64, wb: f64) {
        self.throttle_w = w;
        self.throttle = [wa, wb];
    }

    /// Hold PIN15 (actuator energized) on or off
    pub fn set_pin15(&mut self, energized: bool) {
        self.pin15 = energized;
    }

    /// Report PIN15 energized for the next `polls` RC:S queries only
    pub fn energize_pin15_for(&mut self, polls: u32) {
        self.pin15_polls = polls;
    }

    /// Set PIN6
    pub fn set_pin6(&mut self, on: bool) {
        self.pin6 = on;
    }

    /// Report the previous FUNCTION for the next `count` readbacks
    pub fn stale_function_readbacks(&mut self, count: u32) {
        self.stale_function_readbacks = count;
    }

    /// Accept current writes without changing the setpoint
    pub fn ignore_current_writes(&mut self, ignore: bool) {
        self.ignore_current_writes = ignore;
    }

    /// Accept AIN writes on one channel without changing its unit
    pub fn ignore_ain_writes(&mut self, channel: Channel, ignore: bool) {
        self.ignore_ain_writes[index(channel)] = ignore;
    }

    /// Stop answering entirely (no prompt is ever sent)
    pub fn set_silent(&mut self, silent: bool) {
        self.silent = silent;
    }

    /// Fail the next `count` port operations with an I/O error
    pub fn fail_next_io(&mut self, count: u32) {
        self.fail_next_io = count;
    }

    /// Fail the next `count` attempts to open a port
    pub fn fail_next_opens(&mut self, count: u32) {
        self.fail_next_opens = count;
    }

    /// Number of successful port opens
    pub fn opens(&self) -> u32 {
        self.opens
    }

    /// Most recent lines received, oldest first
    pub fn received_lines(&self) -> impl Iterator<Item = &str> {
        self.received.iter().map(String::as_str)
    }

    /// Number of SAVE commands accepted since creation
    pub fn save_count(&self) -> u32 {
        self.saves
    }

    /// Number of received lines equal to `line`
    pub fn count_received(&self, line: &str) -> usize {
        self.received.iter().filter(|l| l.as_str() == line).count()
    }

    /// Total bytes written to this controller by any port
    pub fn bytes_received(&self) -> usize {
        self.bytes_received
    }

    /// Clear received lines and byte counters
    pub fn clear_received(&mut self) {
        self.received.clear();
        self.bytes_received = 0;
    }

    pub(crate) fn record_bytes(&mut self, n: usize) {
        self.bytes_received += n;
    }

    pub(crate) fn take_io_fault(&mut self) -> bool {
        if self.fail_next_io > 0 {
            self.fail_next_io -= 1;
            true
        } else {
            false
        }
    }

    pub(crate) fn try_open(&mut self) -> bool {
        if self.fail_next_opens > 0 {
            self.fail_next_opens -= 1;
            false
        } else {
            self.opens += 1;
            true
        }
    }

    fn remote_word(&mut self) -> u16 {
        let energized = if self.pin15_polls > 0 {
            self.pin15_polls -= 1;
            true
        } else {
            self.pin15
        };
        let mut word = 0u16;
        if energized {
            word |= 1 << 6;
        }
        if self.pin6 {
            word |= 1 << 3;
        }
        word
    }

    /// Process one console line and return the reply text
    pub fn handle_line(&mut self, line: &str) -> String {
        let line = line.trim();
        if self.received.len() == RECEIVED_HISTORY {
            self.received.pop_front();
        }
        self.received.push_back(line.to_string());
        trace!("Virtual PAM {} received {:?}", self.id, line);

        if self.silent {
            return String::new();
        }

        let cmd = match PamCommand::parse(line) {
            Ok(cmd) => cmd,
            Err(e) => {
                debug!("Virtual PAM {} rejected {:?}: {}", self.id, line, e);
                return ERR_REPLY.to_string();
            }
        };

        match cmd {
            PamCommand::Function(None) => {
                let reported = if self.stale_function_readbacks > 0 {
                    self.stale_function_readbacks -= 1;
                    self.previous_function
                } else {
                    self.function
                };
                format!("{}\r\n>", reported)
            }
            PamCommand::Function(Some(code)) => {
                if code != self.function {
                    self.previous_function = self.function;
                    self.function = code;
                }
                OK_REPLY.to_string()
            }
            PamCommand::ConsoleMode(None) => format!("{}\r\n>", self.console_mode.as_str()),
            PamCommand::ConsoleMode(Some(mode)) => {
                self.console_mode = mode;
                OK_REPLY.to_string()
            }
            PamCommand::AinMode {
                channel,
                unit: None,
            } => format!("{}\r\n>", self.ain(channel)),
            PamCommand::AinMode {
                channel,
                unit: Some(unit),
            } => {
                if !self.ignore_ain_writes[index(channel)] {
                    self.set_ain(channel, unit);
                }
                OK_REPLY.to_string()
            }
            PamCommand::Current {
                channel,
                value: None,
            } => format!("{}\r\n>", self.setpoint(channel)),
            PamCommand::Current {
                channel,
                value: Some(v),
            } => {
                if !self.ignore_current_writes {
                    self.set_setpoint(channel, v);
                }
                OK_REPLY.to_string()
            }
            PamCommand::ChannelCurrent {
                channel,
                value: None,
            } => format!("{}\r\n>", self.channel_current(channel)),
            PamCommand::ChannelCurrent {
                channel,
                value: Some(v),
            } => {
                self.set_channel_current(channel, v);
                OK_REPLY.to_string()
            }
            PamCommand::Throttle(None) => format!("{}\r\n>", self.throttle_w),
            PamCommand::Throttle(Some(channel)) => {
                format!("{}\r\n>", self.throttle[index(channel)])
            }
            PamCommand::Save => {
                self.saves += 1;
                OK_REPLY.to_string()
            }
            PamCommand::ReadyStatus => format!("{}\r\n>", self.ready_word),
            PamCommand::RemoteStatus => format!("{}\r\n>", self.remote_word()),
            PamCommand::Unknown(_) => ERR_REPLY.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_function_write_and_readback() {
        let mut pam = VirtualPam::new("test");
        assert_eq!(pam.handle_line("FUNCTION"), "195\r\n>");
        assert_eq!(pam.handle_line("FUNCTION 196"), OK_REPLY);
        assert_eq!(pam.handle_line("FUNCTION"), "196\r\n>");
        assert_eq!(pam.function(), 196);
    }

    #[test]
    fn test_stale_function_readbacks() {
        let mut pam = VirtualPam::new("test");
        pam.handle_line("FUNCTION 196");
        pam.stale_function_readbacks(2);
        assert_eq!(pam.handle_line("FUNCTION"), "195\r\n>");
        assert_eq!(pam.handle_line("FUNCTION"), "195\r\n>");
        assert_eq!(pam.handle_line("FUNCTION"), "196\r\n>");
    }

    #[test]
    fn test_ain_and_current_registers() {
        let mut pam = VirtualPam::new("test");
        pam.handle_line("AINB C");
        assert_eq!(pam.ain(Channel::B), AinUnit::C);
        assert_eq!(pam.handle_line("AINB"), "C\r\n>");

        pam.handle_line("CURRENT:A 1200");
        assert_eq!(pam.handle_line("CURRENT:A"), "1200\r\n>");

        pam.ignore_current_writes(true);
        pam.handle_line("CURRENT:A 1500");
        assert_eq!(pam.setpoint(Channel::A), 1200);

        pam.ignore_ain_writes(Channel::B, true);
        assert_eq!(pam.handle_line("AINB V"), OK_REPLY);
        assert_eq!(pam.ain(Channel::B), AinUnit::C);
    }

    #[test]
    fn test_remote_status_pin_bits() {
        let mut pam = VirtualPam::new("test");
        assert_eq!(pam.handle_line("RC:S"), "0\r\n>");

        pam.energize_pin15_for(1);
        pam.set_pin6(true);
        assert_eq!(pam.handle_line("RC:S"), "72\r\n>");
        assert_eq!(pam.handle_line("RC:S"), "8\r\n>");
    }

    #[test]
    fn test_unknown_and_silent() {
        let mut pam = VirtualPam::new("test");
        assert_eq!(pam.handle_line("HELP"), ERR_REPLY);
        assert_eq!(pam.handle_line("FUNCTION x"), ERR_REPLY);

        pam.set_silent(true);
        assert_eq!(pam.handle_line("FUNCTION"), "");
        assert_eq!(pam.received_lines().count(), 3);
        assert_eq!(pam.count_received("FUNCTION"), 1);
    }

    #[test]
    fn test_save_counter_ignores_silent_lines() {
        let mut pam = VirtualPam::new("test");
        pam.handle_line("SAVE");
        pam.handle_line("SAVE");
        pam.set_silent(true);
        pam.handle_line("SAVE");
        assert_eq!(pam.save_count(), 2);
        assert_eq!(pam.count_received("SAVE"), 3);
    }

    #[test]
    fn test_received_log_keeps_most_recent_lines() {
        let mut pam = VirtualPam::new("test");
        for _ in 0..RECEIVED_HISTORY {
            pam.handle_line("W");
        }
        pam.handle_line("WA");
        pam.handle_line("WB");

        assert_eq!(pam.received_lines().count(), RECEIVED_HISTORY);
        assert_eq!(pam.count_received("W"), RECEIVED_HISTORY - 2);
        let last: Vec<&str> = pam.received_lines().skip(RECEIVED_HISTORY - 2).collect();
        assert_eq!(last, ["WA", "WB"]);
    }
}

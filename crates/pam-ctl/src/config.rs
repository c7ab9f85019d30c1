//! Runtime configuration
//!
//! Every duration is stored in milliseconds so the settings file stays
//! human-editable; accessors convert to [`Duration`].

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Complete controller configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PamConfig {
    /// Serial link settings
    pub link: LinkConfig,
    /// Protocol driver settings
    pub driver: DriverConfig,
    /// Command serializer settings
    pub processor: ProcessorConfig,
    /// Telemetry poller settings
    pub poller: PollerConfig,
}

/// Serial link configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// Serial port path
    pub port: String,
    /// Baud rate
    pub baud_rate: u32,
    /// Read/write timeout for a single operation
    pub timeout_ms: u64,
    /// Delay between attempts to reopen the port
    pub reconnect_delay_ms: u64,
    /// Log only every Nth failed open attempt
    pub log_every: u32,
    /// Time allowed for the device to settle after opening
    pub open_settle_ms: u64,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            port: "/dev/ttyUSB0".to_string(),
            baud_rate: 57600,
            timeout_ms: 150,
            reconnect_delay_ms: 1000,
            log_every: 10,
            open_settle_ms: 500,
        }
    }
}

impl LinkConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn open_settle(&self) -> Duration {
        Duration::from_millis(self.open_settle_ms)
    }
}

/// Protocol driver configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverConfig {
    /// Read back current setpoints after writing them
    pub verify_writes: bool,
    /// Hardware pacing
    pub timing: DriverTiming,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            verify_writes: true,
            timing: DriverTiming::default(),
        }
    }
}

/// Hardware pacing for multi-step operations
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverTiming {
    /// Window to wait for the `>` prompt after a command
    pub response_window_ms: u64,
    /// PIN15 checks before a FUNCTION change is refused
    pub safety_polls: u32,
    /// Delay between PIN15 checks
    pub safety_interval_ms: u64,
    /// EEPROM rebuild time after SAVE
    pub save_settle_ms: u64,
    /// FUNCTION readback attempts after a switch
    pub verify_attempts: u32,
    /// Delay between FUNCTION readback attempts
    pub verify_interval_ms: u64,
    /// Failed readback after which SAVE is re-issued once
    pub kick_attempt: u32,
    /// Delay between writes to channel A and channel B
    pub channel_settle_ms: u64,
    /// Delay before re-reading MODE after forcing STD
    pub std_recheck_ms: u64,
}

impl Default for DriverTiming {
    fn default() -> Self {
        Self {
            response_window_ms: 200,
            safety_polls: 3,
            safety_interval_ms: 500,
            save_settle_ms: 3000,
            verify_attempts: 10,
            verify_interval_ms: 1000,
            kick_attempt: 4,
            channel_settle_ms: 500,
            std_recheck_ms: 100,
        }
    }
}

impl DriverTiming {
    pub fn response_window(&self) -> Duration {
        Duration::from_millis(self.response_window_ms)
    }

    pub fn safety_interval(&self) -> Duration {
        Duration::from_millis(self.safety_interval_ms)
    }

    pub fn save_settle(&self) -> Duration {
        Duration::from_millis(self.save_settle_ms)
    }

    pub fn verify_interval(&self) -> Duration {
        Duration::from_millis(self.verify_interval_ms)
    }

    pub fn channel_settle(&self) -> Duration {
        Duration::from_millis(self.channel_settle_ms)
    }

    pub fn std_recheck(&self) -> Duration {
        Duration::from_millis(self.std_recheck_ms)
    }
}

/// Command serializer configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessorConfig {
    /// Maximum number of queued commands
    pub queue_capacity: usize,
    /// How long a waiting caller blocks for its result
    pub response_timeout_ms: u64,
    /// Queue poll interval (bounds stop-signal latency)
    pub poll_interval_ms: u64,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 50,
            response_timeout_ms: 5000,
            poll_interval_ms: 500,
        }
    }
}

impl ProcessorConfig {
    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Telemetry poller configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollerConfig {
    /// Delay between polling cycles
    pub loop_delay_ms: u64,
    /// Interval between console MODE checks
    pub mode_check_interval_ms: u64,
    /// Interval between READY / PIN status reads
    pub status_interval_ms: u64,
    /// Back-off when FUNCTION cannot be read
    pub retry_delay_ms: u64,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            loop_delay_ms: 10,
            mode_check_interval_ms: 3000,
            status_interval_ms: 1000,
            retry_delay_ms: 100,
        }
    }
}

impl PollerConfig {
    pub fn loop_delay(&self) -> Duration {
        Duration::from_millis(self.loop_delay_ms)
    }

    pub fn mode_check_interval(&self) -> Duration {
        Duration::from_millis(self.mode_check_interval_ms)
    }

    pub fn status_interval(&self) -> Duration {
        Duration::from_millis(self.status_interval_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

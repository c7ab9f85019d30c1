//! PAM protocol driver
//!
//! Single request/response exchanges ([`PamDriver::cmd`]), register reads
//! and writes, and the multi-step hardware operations: FUNCTION switching
//! with its safety gate and verification, AIN unit changes and current
//! setpoints. None of the multi-step operations are safe to interleave with
//! each other; [`CommandProcessor`](crate::CommandProcessor) runs them one
//! at a time.

use std::sync::atomic::{AtomicBool, Ordering};

use pam_protocol::command::PROMPT;
use pam_protocol::response::{extract_bool, extract_integer, extract_mode, extract_number, extract_pam_mode};
use pam_protocol::status::{mask_word, pin_15, pin_6};
use pam_protocol::{
    validate_current, AinUnit, Channel, ConsoleMode, EncodeCommand, Function, PamCommand,
    ReadyStatus,
};
use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, trace, warn};

use crate::config::{DriverConfig, DriverTiming};
use crate::error::DriverError;
use crate::link::SerialLink;

/// Driver for one PAM controller
#[derive(Debug)]
pub struct PamDriver {
    link: SerialLink,
    timing: DriverTiming,
    verify_writes: AtomicBool,
    std_confirmed: AtomicBool,
    exchange: Mutex<()>,
}

impl PamDriver {
    pub fn new(link: SerialLink, config: DriverConfig) -> Self {
        Self {
            link,
            timing: config.timing,
            verify_writes: AtomicBool::new(config.verify_writes),
            std_confirmed: AtomicBool::new(false),
            exchange: Mutex::new(()),
        }
    }

    pub fn link(&self) -> &SerialLink {
        &self.link
    }

    pub fn timing(&self) -> &DriverTiming {
        &self.timing
    }

    /// Whether current setpoints are read back after writing
    pub fn verify_writes(&self) -> bool {
        self.verify_writes.load(Ordering::Relaxed)
    }

    pub fn set_verify_writes(&self, verify: bool) {
        self.verify_writes.store(verify, Ordering::Relaxed);
    }

    /// Send one command and collect the reply up to the `>` prompt
    ///
    /// Returns an empty string if the link fails; link faults are logged,
    /// never raised.
    pub async fn cmd(&self, command: &PamCommand) -> String {
        let _exchange = self.exchange.lock().await;
        let line = command.line();

        if let Err(e) = self.link.reset_input_buffer().await {
            warn!("{}: {}", line, e);
            return String::new();
        }
        if let Err(e) = self.link.write(&command.encode()).await {
            warn!("{}: {}", line, e);
            return String::new();
        }

        let deadline = Instant::now() + self.timing.response_window();
        let mut reply = Vec::new();
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match self.link.read_for(256, remaining).await {
                Ok(chunk) => {
                    reply.extend_from_slice(&chunk);
                    if reply.contains(&PROMPT) {
                        break;
                    }
                }
                Err(e) => {
                    warn!("{}: {}", line, e);
                    return String::new();
                }
            }
        }

        let text = String::from_utf8_lossy(&reply).into_owned();
        trace!("{} -> {:?}", line, text);
        text
    }

    /// Read the firmware FUNCTION register
    pub async fn read_function(&self) -> Option<u16> {
        let resp = self.cmd(&PamCommand::Function(None)).await;
        extract_integer(&resp).and_then(|v| u16::try_from(v).ok())
    }

    /// Read the unit of one analog input
    pub async fn read_ain_mode(&self, channel: Channel) -> Option<AinUnit> {
        let resp = self
            .cmd(&PamCommand::AinMode {
                channel,
                unit: None,
            })
            .await;
        extract_mode(&resp)
    }

    async fn read_number(&self, command: PamCommand) -> Option<f64> {
        let resp = self.cmd(&command).await;
        extract_number(&resp)
    }

    /// Channel A throttle (function 196)
    pub async fn read_wa(&self) -> Option<f64> {
        self.read_number(PamCommand::Throttle(Some(Channel::A))).await
    }

    /// Channel B throttle (function 196)
    pub async fn read_wb(&self) -> Option<f64> {
        self.read_number(PamCommand::Throttle(Some(Channel::B))).await
    }

    /// Combined throttle (function 195)
    pub async fn read_w(&self) -> Option<f64> {
        self.read_number(PamCommand::Throttle(None)).await
    }

    pub async fn read_ia(&self) -> Option<f64> {
        self.read_channel_current(Channel::A).await
    }

    pub async fn read_ib(&self) -> Option<f64> {
        self.read_channel_current(Channel::B).await
    }

    pub async fn read_channel_current(&self, channel: Channel) -> Option<f64> {
        self.read_number(PamCommand::ChannelCurrent {
            channel,
            value: None,
        })
        .await
    }

    /// Read a current setpoint register
    pub async fn read_current_setpoint(&self, channel: Channel) -> Option<f64> {
        self.read_number(PamCommand::Current {
            channel,
            value: None,
        })
        .await
    }

    /// Make sure the console is in STD mode, forcing it only out of EXP
    ///
    /// An unreadable mode is reported as `None` without writing anything.
    /// Returns the mode read back after any correction.
    pub async fn ensure_std_mode(&self) -> Option<ConsoleMode> {
        let resp = self.cmd(&PamCommand::ConsoleMode(None)).await;
        let mode = extract_pam_mode(&resp);
        match mode {
            Some(ConsoleMode::Std) => {
                if !self.std_confirmed.swap(true, Ordering::Relaxed) {
                    info!("PAM console in STD mode");
                }
                return mode;
            }
            Some(ConsoleMode::Exp) => {}
            None => {
                debug!("PAM console mode unreadable: {:?}", resp.trim());
                self.std_confirmed.store(false, Ordering::Relaxed);
                return None;
            }
        }

        warn!("PAM console in EXP mode; forcing STD");
        self.std_confirmed.store(false, Ordering::Relaxed);
        self.cmd(&PamCommand::ConsoleMode(Some(ConsoleMode::Std)))
            .await;
        sleep(self.timing.std_recheck()).await;

        let resp = self.cmd(&PamCommand::ConsoleMode(None)).await;
        let mode = extract_pam_mode(&resp);
        if mode == Some(ConsoleMode::Std) {
            self.std_confirmed.store(true, Ordering::Relaxed);
            info!("PAM console switched to STD mode");
        } else {
            warn!("PAM console still not in STD mode: {:?}", mode);
        }
        mode
    }

    /// Decode the READY word under the current FUNCTION
    pub async fn get_ready_status(&self) -> Option<ReadyStatus> {
        let function = Function::from_code(i64::from(self.read_function().await?)).ok()?;
        self.ready_status_for(function).await
    }

    /// Decode the READY word under a known FUNCTION
    pub async fn ready_status_for(&self, function: Function) -> Option<ReadyStatus> {
        let resp = self.cmd(&PamCommand::ReadyStatus).await;
        let word = mask_word(extract_number(&resp)?);
        Some(ReadyStatus::decode(word, function))
    }

    async fn read_remote_status(&self) -> Option<u16> {
        let resp = self.cmd(&PamCommand::RemoteStatus).await;
        match extract_number(&resp) {
            Some(raw) => Some(mask_word(raw)),
            // Some firmware answers RC:S with ON/OFF text.
            None => extract_bool(&resp).map(|on| if on { 1 << 6 } else { 0 }),
        }
    }

    /// Whether the actuator is energized (PIN15)
    pub async fn get_pin_15_status(&self) -> Option<bool> {
        self.read_remote_status().await.map(pin_15)
    }

    pub async fn get_pin_6_status(&self) -> Option<bool> {
        self.read_remote_status().await.map(pin_6)
    }

    async fn write(&self, command: PamCommand) {
        if !command.is_write() {
            warn!("{} is not a register write", command.line());
            return;
        }
        let resp = self.cmd(&command).await;
        if resp.contains("ERR") {
            warn!("{} rejected: {:?}", command.line(), resp.trim());
        } else {
            debug!("{} -> {:?}", command.line(), resp.trim());
        }
    }

    pub async fn write_function(&self, function: Function) {
        self.write(PamCommand::Function(Some(function.code()))).await;
    }

    pub async fn write_ain_mode(&self, unit: AinUnit, channel: Channel) {
        self.write(PamCommand::AinMode {
            channel,
            unit: Some(unit),
        })
        .await;
    }

    pub async fn write_current(&self, channel: Channel, value: u32) {
        self.write(PamCommand::Current {
            channel,
            value: Some(value),
        })
        .await;
    }

    /// Force both channel currents to zero
    pub async fn zero_setpoints(&self) {
        for channel in [Channel::A, Channel::B] {
            self.write(PamCommand::ChannelCurrent {
                channel,
                value: Some(0),
            })
            .await;
        }
    }

    /// Persist the working registers to EEPROM
    pub async fn save_settings(&self) {
        self.write(PamCommand::Save).await;
    }

    /// Poll PIN15 until the actuator reports de-energized
    async fn wait_for_safe_state(&self) -> Result<(), DriverError> {
        let polls = self.timing.safety_polls.max(1);
        for attempt in 1..=polls {
            match self.get_pin_15_status().await {
                Some(false) => return Ok(()),
                Some(true) => warn!("PIN15 energized ({}/{})", attempt, polls),
                None => warn!("PIN15 status unreadable ({}/{})", attempt, polls),
            }
            if attempt < polls {
                sleep(self.timing.safety_interval()).await;
            }
        }
        Err(DriverError::SafetyStop { attempts: polls })
    }

    /// Switch the firmware FUNCTION
    ///
    /// Refuses to proceed while PIN15 is energized. After writing, both
    /// channel currents are zeroed, the settings saved, and FUNCTION is read
    /// back until it matches; the SAVE is re-issued once if the readback is
    /// slow to follow.
    pub async fn change_pam_function(&self, new_mode: i64) -> Result<Function, DriverError> {
        let function = Function::from_code(new_mode)?;
        info!("Changing PAM function to {}", function);

        self.wait_for_safe_state().await?;

        self.write_function(function).await;
        self.zero_setpoints().await;
        self.save_settings().await;
        sleep(self.timing.save_settle()).await;

        self.verify_function(function).await?;
        info!("PAM function is now {}", function);
        Ok(function)
    }

    async fn verify_function(&self, function: Function) -> Result<(), DriverError> {
        let expected = i64::from(function.code());
        let attempts = self.timing.verify_attempts.max(1);
        let mut last = None;

        for attempt in 1..=attempts {
            let resp = self.cmd(&PamCommand::Function(None)).await;
            let read = extract_integer(&resp);
            if read == Some(expected) {
                debug!("FUNCTION {} confirmed on attempt {}", expected, attempt);
                return Ok(());
            }
            debug!(
                "FUNCTION readback {:?} (attempt {}/{})",
                read, attempt, attempts
            );
            last = read;

            if attempt == self.timing.kick_attempt {
                warn!("FUNCTION {} not confirmed yet; re-issuing SAVE", expected);
                self.save_settings().await;
            }
            if attempt < attempts {
                sleep(self.timing.verify_interval()).await;
            }
        }

        Err(DriverError::readback("FUNCTION", expected, last))
    }

    /// Change the unit of one analog input and verify it
    pub async fn change_pam_ain_mode(
        &self,
        unit: AinUnit,
        channel: Channel,
    ) -> Result<(), DriverError> {
        info!("Setting AIN{} to {}", channel, unit);
        self.write_ain_mode(unit, channel).await;
        self.save_settings().await;
        sleep(self.timing.save_settle()).await;

        let read = self.read_ain_mode(channel).await;
        if read == Some(unit) {
            Ok(())
        } else {
            Err(DriverError::readback(
                format!("AIN{}", channel),
                unit,
                read,
            ))
        }
    }

    /// Write a current setpoint
    ///
    /// Under function 195 only channel A exists, so any request is
    /// redirected there. Returns the channel actually written.
    pub async fn set_current_value(
        &self,
        value: i64,
        channel: Channel,
        mode: i64,
    ) -> Result<Channel, DriverError> {
        let value = validate_current(value)?;
        let function = Function::from_code(mode)?;

        let target = match function {
            Function::Single => {
                if channel != Channel::A {
                    debug!("Function 195 has no channel {}; using A", channel);
                }
                Channel::A
            }
            Function::Dual => channel,
        };

        info!("Setting CURRENT:{} to {} mA", target, value);
        self.write_current(target, value).await;
        self.save_settings().await;
        sleep(self.timing.save_settle()).await;

        if self.verify_writes() {
            let read = self.read_current_setpoint(target).await;
            if read != Some(f64::from(value)) {
                return Err(DriverError::readback(
                    format!("CURRENT:{}", target),
                    value,
                    read,
                ));
            }
        }
        Ok(target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LinkConfig;
    use crate::sim::SimConnector;
    use pam_protocol::ProtocolError;
    use pam_sim::{SharedPam, VirtualPam};

    async fn driver_for(pam: &SharedPam) -> PamDriver {
        let link = SerialLink::connect(
            "test",
            Box::new(SimConnector::new(pam.clone())),
            LinkConfig::default(),
        )
        .await;
        PamDriver::new(link, DriverConfig::default())
    }

    #[tokio::test(start_paused = true)]
    async fn test_cmd_collects_reply() {
        let pam = VirtualPam::new("drv").shared();
        let driver = driver_for(&pam).await;

        let reply = driver.cmd(&PamCommand::Function(None)).await;
        assert_eq!(reply, "195\r\n>");
        assert_eq!(driver.read_function().await, Some(195));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cmd_silent_controller_returns_empty() {
        let pam = VirtualPam::new("drv").shared();
        let driver = driver_for(&pam).await;
        pam.lock().unwrap().set_silent(true);

        assert_eq!(driver.cmd(&PamCommand::Function(None)).await, "");
        assert_eq!(driver.read_function().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ensure_std_mode_forces_std() {
        let pam = VirtualPam::new("drv").shared();
        pam.lock().unwrap().set_console_mode(ConsoleMode::Exp);
        let driver = driver_for(&pam).await;

        assert_eq!(driver.ensure_std_mode().await, Some(ConsoleMode::Std));
        assert_eq!(pam.lock().unwrap().console_mode(), ConsoleMode::Std);
        assert_eq!(pam.lock().unwrap().count_received("MODE STD"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ensure_std_mode_silent_controller_writes_nothing() {
        let pam = VirtualPam::new("drv").shared();
        pam.lock().unwrap().set_console_mode(ConsoleMode::Exp);
        let driver = driver_for(&pam).await;
        pam.lock().unwrap().set_silent(true);

        assert_eq!(driver.ensure_std_mode().await, None);
        assert_eq!(pam.lock().unwrap().count_received("MODE STD"), 0);
        assert_eq!(pam.lock().unwrap().console_mode(), ConsoleMode::Exp);
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_only_command_is_not_written() {
        let pam = VirtualPam::new("drv").shared();
        let driver = driver_for(&pam).await;

        driver.write(PamCommand::Throttle(None)).await;
        assert_eq!(pam.lock().unwrap().count_received("W"), 0);
        driver.write(PamCommand::Save).await;
        assert_eq!(pam.lock().unwrap().count_received("SAVE"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pin_status() {
        let pam = VirtualPam::new("drv").shared();
        let driver = driver_for(&pam).await;

        assert_eq!(driver.get_pin_15_status().await, Some(false));
        pam.lock().unwrap().set_pin15(true);
        pam.lock().unwrap().set_pin6(true);
        assert_eq!(driver.get_pin_15_status().await, Some(true));
        assert_eq!(driver.get_pin_6_status().await, Some(true));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ready_status_all_off() {
        let pam = VirtualPam::new("drv").shared();
        let driver = driver_for(&pam).await;
        assert_eq!(driver.get_ready_status().await, Some(ReadyStatus::AllOff));
    }

    #[tokio::test(start_paused = true)]
    async fn test_change_function_success() {
        let pam = VirtualPam::new("drv").shared();
        let driver = driver_for(&pam).await;
        pam.lock().unwrap().set_channel_current(Channel::A, 900);

        let function = driver.change_pam_function(196).await.unwrap();
        assert_eq!(function, Function::Dual);

        let pam = pam.lock().unwrap();
        assert_eq!(pam.function(), 196);
        assert_eq!(pam.channel_current(Channel::A), 0);
        assert_eq!(pam.count_received("IA 0"), 1);
        assert_eq!(pam.count_received("IB 0"), 1);
        assert_eq!(pam.count_received("SAVE"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_change_function_rejects_invalid_without_io() {
        let pam = VirtualPam::new("drv").shared();
        let driver = driver_for(&pam).await;

        let err = driver.change_pam_function(197).await.unwrap_err();
        assert!(matches!(
            err,
            DriverError::Validation(ProtocolError::InvalidFunction(197))
        ));
        assert_eq!(pam.lock().unwrap().bytes_received(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_safety_stop_when_energized() {
        let pam = VirtualPam::new("drv").shared();
        pam.lock().unwrap().set_pin15(true);
        let driver = driver_for(&pam).await;

        let err = driver.change_pam_function(196).await.unwrap_err();
        assert!(matches!(err, DriverError::SafetyStop { attempts: 3 }));

        let pam = pam.lock().unwrap();
        assert_eq!(pam.function(), 195);
        assert_eq!(pam.count_received("RC:S"), 3);
        assert_eq!(pam.count_received("FUNCTION 196"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_safety_gate_waits_for_release() {
        let pam = VirtualPam::new("drv").shared();
        pam.lock().unwrap().energize_pin15_for(2);
        let driver = driver_for(&pam).await;

        driver.change_pam_function(196).await.unwrap();
        assert_eq!(pam.lock().unwrap().count_received("RC:S"), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_verification_kick_reissues_save() {
        let pam = VirtualPam::new("drv").shared();
        let driver = driver_for(&pam).await;
        pam.lock().unwrap().stale_function_readbacks(4);

        driver.change_pam_function(196).await.unwrap();

        let pam = pam.lock().unwrap();
        assert_eq!(pam.count_received("SAVE"), 2);
        assert_eq!(pam.save_count(), 2);
        assert_eq!(pam.count_received("FUNCTION"), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_verification_gives_up() {
        let pam = VirtualPam::new("drv").shared();
        let driver = driver_for(&pam).await;
        pam.lock().unwrap().stale_function_readbacks(20);

        let err = driver.change_pam_function(196).await.unwrap_err();
        match err {
            DriverError::VerificationFailed {
                expected, actual, ..
            } => {
                assert_eq!(expected, "196");
                assert_eq!(actual, "195");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(pam.lock().unwrap().count_received("FUNCTION"), 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_change_ain_mode() {
        let pam = VirtualPam::new("drv").shared();
        let driver = driver_for(&pam).await;

        driver
            .change_pam_ain_mode(AinUnit::C, Channel::B)
            .await
            .unwrap();
        assert_eq!(pam.lock().unwrap().ain(Channel::B), AinUnit::C);
        assert_eq!(driver.read_ain_mode(Channel::B).await, Some(AinUnit::C));
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_readback_is_no_response() {
        let pam = VirtualPam::new("drv").shared();
        let driver = driver_for(&pam).await;
        pam.lock().unwrap().set_silent(true);

        let err = driver
            .change_pam_ain_mode(AinUnit::C, Channel::A)
            .await
            .unwrap_err();
        assert!(matches!(err, DriverError::NoResponse(ref register) if register == "AINA"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_current_redirects_to_a_under_195() {
        let pam = VirtualPam::new("drv").shared();
        let driver = driver_for(&pam).await;

        let target = driver
            .set_current_value(1200, Channel::B, 195)
            .await
            .unwrap();
        assert_eq!(target, Channel::A);

        let pam = pam.lock().unwrap();
        assert_eq!(pam.setpoint(Channel::A), 1200);
        assert_eq!(pam.count_received("CURRENT:B 1200"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_current_rejects_out_of_range() {
        let pam = VirtualPam::new("drv").shared();
        let driver = driver_for(&pam).await;

        for value in [499, 2601] {
            let err = driver
                .set_current_value(value, Channel::A, 195)
                .await
                .unwrap_err();
            assert!(matches!(
                err,
                DriverError::Validation(ProtocolError::CurrentOutOfRange(_))
            ));
        }
        assert_eq!(pam.lock().unwrap().bytes_received(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_current_verification() {
        let pam = VirtualPam::new("drv").shared();
        let driver = driver_for(&pam).await;
        pam.lock().unwrap().ignore_current_writes(true);

        let err = driver
            .set_current_value(1500, Channel::B, 196)
            .await
            .unwrap_err();
        assert!(matches!(err, DriverError::VerificationFailed { .. }));

        driver.set_verify_writes(false);
        assert_eq!(
            driver.set_current_value(1500, Channel::B, 196).await.unwrap(),
            Channel::B
        );
    }
}

//! Command serializer
//!
//! All mutating work reaches the controller through a single worker task
//! fed by a bounded queue. Callers either fire-and-forget or wait for the
//! result up to a configured timeout. A handler that panics fails only its
//! own command; the worker keeps running.

use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use pam_protocol::{AinUnit, Channel, Function, ProtocolError};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, error, info, warn};

use crate::config::ProcessorConfig;
use crate::driver::PamDriver;
use crate::error::{DriverError, SubmitError};
use crate::machine::{MachineSnapshot, MachineState, StatusPatch};

/// Kind of command, without parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandType {
    ChangeMode,
    SetAinMode,
    SetCurrent,
    SaveSettings,
    GetStatus,
}

impl CommandType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandType::ChangeMode => "change_mode",
            CommandType::SetAinMode => "set_ain_mode",
            CommandType::SetCurrent => "set_current",
            CommandType::SaveSettings => "save_settings",
            CommandType::GetStatus => "get_status",
        }
    }
}

impl fmt::Display for CommandType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CommandType {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "change_mode" => Ok(CommandType::ChangeMode),
            "set_ain_mode" => Ok(CommandType::SetAinMode),
            "set_current" => Ok(CommandType::SetCurrent),
            "save_settings" => Ok(CommandType::SaveSettings),
            "get_status" => Ok(CommandType::GetStatus),
            _ => Err(ProtocolError::UnknownCommand(s.to_string())),
        }
    }
}

/// A command with its parameters
///
/// Numeric parameters are carried unvalidated; the handlers reject bad
/// values before any I/O.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CommandKind {
    ChangeMode {
        mode: i64,
    },
    SetAinMode {
        unit: AinUnit,
        #[serde(default)]
        channel: Channel,
    },
    SetCurrent {
        value: i64,
        #[serde(default)]
        channel: Channel,
        mode: i64,
    },
    SaveSettings,
    GetStatus,
}

impl CommandKind {
    pub fn command_type(&self) -> CommandType {
        match self {
            CommandKind::ChangeMode { .. } => CommandType::ChangeMode,
            CommandKind::SetAinMode { .. } => CommandType::SetAinMode,
            CommandKind::SetCurrent { .. } => CommandType::SetCurrent,
            CommandKind::SaveSettings => CommandType::SaveSettings,
            CommandKind::GetStatus => CommandType::GetStatus,
        }
    }
}

/// Outcome of a processed command
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CommandResult {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<MachineSnapshot>,
}

impl CommandResult {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            data: None,
        }
    }

    pub fn ok_with(message: impl Into<String>, data: MachineSnapshot) -> Self {
        Self {
            success: true,
            message: message.into(),
            data: Some(data),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            data: None,
        }
    }
}

impl From<SubmitError> for CommandResult {
    fn from(err: SubmitError) -> Self {
        CommandResult::failed(err.to_string())
    }
}

/// Queued unit of work
#[derive(Debug)]
struct Command {
    kind: CommandKind,
    respond_to: Option<oneshot::Sender<CommandResult>>,
    queued_at: Instant,
}

/// Worker bookkeeping
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerStats {
    /// Channel of the most recent current write
    pub last_channel: Channel,
    /// FUNCTION confirmed by the most recent mode change
    pub last_function: Option<Function>,
    pub processed: u64,
    pub failed: u64,
}

impl Default for WorkerStats {
    fn default() -> Self {
        Self {
            last_channel: Channel::A,
            last_function: None,
            processed: 0,
            failed: 0,
        }
    }
}

/// Serializes commands onto one worker task
#[derive(Debug)]
pub struct CommandProcessor {
    queue: mpsc::Sender<Command>,
    stop: watch::Sender<bool>,
    stats: Arc<Mutex<WorkerStats>>,
    config: ProcessorConfig,
    worker: JoinHandle<()>,
}

impl CommandProcessor {
    /// Start the worker; must be called from within a Tokio runtime
    pub fn start(driver: Arc<PamDriver>, state: Arc<MachineState>, config: ProcessorConfig) -> Self {
        let (queue, rx) = mpsc::channel(config.queue_capacity.max(1));
        let (stop, stop_rx) = watch::channel(false);
        let stats = Arc::new(Mutex::new(WorkerStats::default()));

        let handlers = Arc::new(Handlers {
            driver,
            state,
            stats: Arc::clone(&stats),
        });
        let worker = tokio::spawn(run_worker(handlers, rx, stop_rx, config.clone()));
        info!("Command processor started");

        Self {
            queue,
            stop,
            stats,
            config,
            worker,
        }
    }

    /// Queue a command
    ///
    /// Never blocks on a full queue. With `wait_for_response` the caller
    /// waits up to the configured timeout; on timeout the command may still
    /// run later. Without it an immediate "queued" result is returned.
    pub async fn submit(
        &self,
        kind: CommandKind,
        wait_for_response: bool,
    ) -> Result<CommandResult, SubmitError> {
        let (respond_to, response) = if wait_for_response {
            let (tx, rx) = oneshot::channel();
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };

        let command = Command {
            kind,
            respond_to,
            queued_at: Instant::now(),
        };
        self.queue.try_send(command).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                warn!("Command queue full; dropping {}", kind.command_type());
                SubmitError::QueueFull
            }
            mpsc::error::TrySendError::Closed(_) => SubmitError::QueueClosed,
        })?;

        let Some(response) = response else {
            return Ok(CommandResult::ok("Command queued"));
        };
        match timeout(self.config.response_timeout(), response).await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(_)) => Err(SubmitError::QueueClosed),
            Err(_) => {
                warn!("{} timed out waiting for result", kind.command_type());
                Err(SubmitError::TimedOut)
            }
        }
    }

    /// Commands waiting in the queue
    pub fn pending(&self) -> usize {
        self.queue.max_capacity() - self.queue.capacity()
    }

    pub fn stats(&self) -> WorkerStats {
        *lock_stats(&self.stats)
    }

    /// Signal the worker to stop after its current command
    pub fn stop(&self) {
        self.stop.send_replace(true);
    }

    /// Stop the worker and wait for it to exit
    pub async fn shutdown(self) {
        self.stop();
        if let Err(e) = self.worker.await {
            error!("Command worker ended abnormally: {}", e);
        }
        info!("Command processor stopped");
    }
}

fn lock_stats(stats: &Mutex<WorkerStats>) -> MutexGuard<'_, WorkerStats> {
    stats.lock().unwrap_or_else(PoisonError::into_inner)
}

async fn run_worker(
    handlers: Arc<Handlers>,
    mut rx: mpsc::Receiver<Command>,
    stop: watch::Receiver<bool>,
    config: ProcessorConfig,
) {
    while !*stop.borrow() {
        let command = match timeout(config.poll_interval(), rx.recv()).await {
            Ok(Some(command)) => command,
            Ok(None) => break,
            Err(_) => continue,
        };

        let kind = command.kind;
        let name = kind.command_type();
        debug!(
            "Processing {} (queued {:?})",
            name,
            command.queued_at.elapsed()
        );

        let task = tokio::spawn({
            let handlers = Arc::clone(&handlers);
            async move { handlers.execute(kind).await }
        });
        let result = match task.await {
            Ok(result) => result,
            Err(e) => {
                error!("{} handler aborted: {}", name, e);
                CommandResult::failed(format!("{} failed: internal error", name))
            }
        };

        {
            let mut stats = lock_stats(&handlers.stats);
            stats.processed += 1;
            if !result.success {
                stats.failed += 1;
            }
        }

        if let Some(respond_to) = command.respond_to {
            if respond_to.send(result).is_err() {
                debug!("{} result dropped; caller stopped waiting", name);
            }
        }
    }
}

struct Handlers {
    driver: Arc<PamDriver>,
    state: Arc<MachineState>,
    stats: Arc<Mutex<WorkerStats>>,
}

impl Handlers {
    async fn execute(&self, kind: CommandKind) -> CommandResult {
        let outcome = match kind {
            CommandKind::ChangeMode { mode } => self.change_mode(mode).await,
            CommandKind::SetAinMode { unit, channel } => self.set_ain_mode(unit, channel).await,
            CommandKind::SetCurrent {
                value,
                channel,
                mode,
            } => self.set_current(value, channel, mode).await,
            CommandKind::SaveSettings => {
                self.driver.save_settings().await;
                Ok(CommandResult::ok("Settings saved"))
            }
            CommandKind::GetStatus => Ok(CommandResult::ok_with(
                "Status retrieved",
                self.state.get_all(),
            )),
        };

        outcome.unwrap_or_else(|e| {
            warn!("{} failed: {}", kind.command_type(), e);
            CommandResult::failed(format!("{} failed: {}", kind.command_type(), e))
        })
    }

    /// FUNCTION as reported by the controller, else as last published
    async fn current_function(&self) -> Option<Function> {
        match self.driver.read_function().await {
            Some(code) => Function::try_from(code).ok(),
            None => self.state.get_all().func,
        }
    }

    async fn change_mode(&self, mode: i64) -> Result<CommandResult, DriverError> {
        let target = Function::from_code(mode)?;
        let _transition = self.state.begin_transition();

        let prior = self.current_function().await;
        let carry_units = prior == Some(Function::Single) && target == Function::Dual;
        // Channel A's unit, read while still under 195
        let unit_a = if carry_units {
            self.driver.read_ain_mode(Channel::A).await
        } else {
            None
        };

        let function = self.driver.change_pam_function(mode).await?;
        lock_stats(&self.stats).last_function = Some(function);

        let mut patch = StatusPatch {
            func: Some(function),
            ..Default::default()
        };
        if carry_units {
            let unit_a = match unit_a {
                Some(unit) => Some(unit),
                None => self.driver.read_ain_mode(Channel::A).await,
            };
            match unit_a {
                Some(unit) => {
                    let (a, b) = self.sync_ain_units(unit).await;
                    patch.mode = a;
                    patch.mode_a = a;
                    patch.mode_b = b;
                }
                None => warn!("AINA unit unknown; AIN channels left unsynchronized"),
            }
        }
        self.state.update(patch);

        Ok(CommandResult::ok(format!("Mode changed to {}", function)))
    }

    /// Write one unit to both analog inputs, returning what reads back
    async fn sync_ain_units(&self, unit: AinUnit) -> (Option<AinUnit>, Option<AinUnit>) {
        info!("Synchronizing AINA/AINB to {}", unit);
        let timing = self.driver.timing();

        self.driver.write_ain_mode(unit, Channel::A).await;
        sleep(timing.channel_settle()).await;
        self.driver.write_ain_mode(unit, Channel::B).await;
        self.driver.save_settings().await;
        sleep(timing.save_settle()).await;

        let a = self.driver.read_ain_mode(Channel::A).await;
        let b = self.driver.read_ain_mode(Channel::B).await;
        if a != Some(unit) || b != Some(unit) {
            warn!("AIN sync incomplete: AINA={:?} AINB={:?}", a, b);
        }
        (a, b)
    }

    async fn set_ain_mode(
        &self,
        unit: AinUnit,
        channel: Channel,
    ) -> Result<CommandResult, DriverError> {
        if self.current_function().await != Some(Function::Dual) {
            self.driver.change_pam_ain_mode(unit, Channel::A).await?;
            self.state.update(StatusPatch {
                mode: Some(unit),
                mode_a: Some(unit),
                ..Default::default()
            });
            return Ok(CommandResult::ok(format!("AINA set to {}", unit)));
        }

        // Both inputs must share a unit under 196.
        let _transition = self.state.begin_transition();
        let first = self.driver.change_pam_ain_mode(unit, channel).await;
        sleep(self.driver.timing().channel_settle()).await;
        let second = self.driver.change_pam_ain_mode(unit, channel.other()).await;
        first?;
        second?;

        self.state.update(StatusPatch {
            mode: Some(unit),
            mode_a: Some(unit),
            mode_b: Some(unit),
            ..Default::default()
        });
        Ok(CommandResult::ok(format!("AINA and AINB set to {}", unit)))
    }

    async fn set_current(
        &self,
        value: i64,
        channel: Channel,
        mode: i64,
    ) -> Result<CommandResult, DriverError> {
        let target = self.driver.set_current_value(value, channel, mode).await?;
        lock_stats(&self.stats).last_channel = target;

        // Validated by set_current_value
        let written = u32::try_from(value).ok();
        let patch = match Function::from_code(mode)? {
            Function::Single => StatusPatch {
                current_status: written,
                ..Default::default()
            },
            Function::Dual if target == Channel::A => StatusPatch {
                current_a_status: written,
                ..Default::default()
            },
            Function::Dual => StatusPatch {
                current_b_status: written,
                ..Default::default()
            },
        };
        self.state.update(patch);

        Ok(CommandResult::ok(format!(
            "CURRENT:{} set to {} mA",
            target, value
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_type_names() {
        assert_eq!(
            "change_mode".parse::<CommandType>().unwrap(),
            CommandType::ChangeMode
        );
        assert_eq!(CommandType::GetStatus.to_string(), "get_status");
        assert!(matches!(
            "reboot".parse::<CommandType>(),
            Err(ProtocolError::UnknownCommand(_))
        ));
    }

    #[test]
    fn test_command_kind_json() {
        let kind: CommandKind =
            serde_json::from_str(r#"{"type":"set_current","value":1200,"channel":"B","mode":196}"#)
                .unwrap();
        assert_eq!(
            kind,
            CommandKind::SetCurrent {
                value: 1200,
                channel: Channel::B,
                mode: 196
            }
        );

        let kind: CommandKind = serde_json::from_str(r#"{"type":"set_ain_mode","unit":"C"}"#).unwrap();
        assert_eq!(
            kind,
            CommandKind::SetAinMode {
                unit: AinUnit::C,
                channel: Channel::A
            }
        );
    }

    #[test]
    fn test_submit_error_as_result() {
        let result = CommandResult::from(SubmitError::QueueFull);
        assert!(!result.success);
        assert_eq!(result.message, "command queue full");
    }
}

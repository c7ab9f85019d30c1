//! PAM Controller Runtime
//!
//! This crate drives a PAM actuator controller over its serial console:
//!
//! - [`SerialLink`]: a connection that reconnects and retries on I/O faults
//! - [`PamDriver`]: request/response exchanges and the multi-step hardware
//!   operations (FUNCTION switching, AIN units, current setpoints)
//! - [`MachineState`]: the published status snapshot and transition flag
//! - [`CommandProcessor`]: the single worker every mutating command goes
//!   through
//! - [`TelemetryPoller`]: the read-only loop that keeps the state fresh
//!
//! The `sim` feature adds `SimConnector`, which links onto an in-process
//! `pam_sim::VirtualPam`.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐  submit   ┌──────────────────┐
//! │ remote client├──────────►│ CommandProcessor │──┐
//! └──────────────┘           └──────────────────┘  │  PamDriver
//!                            ┌──────────────────┐  ├──────────► SerialLink ──► PAM
//!                            │ TelemetryPoller  │──┘
//!                            └────────┬─────────┘
//!                                     ▼
//!                               MachineState
//! ```
//!
//! The poller pauses whenever a command marks the state as in transition,
//! so a FUNCTION change never races with telemetry reads.

pub mod config;
pub mod driver;
pub mod error;
pub mod link;
pub mod machine;
pub mod poller;
pub mod processor;
#[cfg(any(test, feature = "sim"))]
pub mod sim;

pub use config::{DriverConfig, DriverTiming, LinkConfig, PamConfig, PollerConfig, ProcessorConfig};
pub use driver::PamDriver;
pub use error::{DriverError, LinkError, SubmitError};
pub use link::{Connector, PamPort, SerialConnector, SerialLink};
pub use machine::{MachineSnapshot, MachineState, StatusKey, StatusPatch, StatusValue, TransitionGuard};
pub use poller::{PollOutcome, TelemetryPoller};
pub use processor::{CommandKind, CommandProcessor, CommandResult, CommandType, WorkerStats};
#[cfg(any(test, feature = "sim"))]
pub use sim::SimConnector;

// Re-export the protocol vocabulary used in the public API
pub use pam_protocol::{AinUnit, Channel, ConsoleMode, Function, ReadyStatus};

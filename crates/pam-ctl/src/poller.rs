//! Telemetry poller
//!
//! Read-only loop that publishes throttle, current, AIN unit, READY and
//! PIN status into [`MachineState`]. Cycles are skipped while a transition
//! is in progress.

use std::sync::Arc;

use pam_protocol::scaling::scale_value;
use pam_protocol::{Channel, Function};
use tokio::sync::watch;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use crate::config::PollerConfig;
use crate::driver::PamDriver;
use crate::machine::{MachineState, StatusPatch};

/// Result of one polling cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// A transition was in progress; nothing was read
    Skipped,
    /// FUNCTION could not be read
    NoFunction,
    /// FUNCTION is neither 195 nor 196
    Unsupported(u16),
    /// Telemetry published under this function
    Published(Function),
}

pub struct TelemetryPoller {
    driver: Arc<PamDriver>,
    state: Arc<MachineState>,
    config: PollerConfig,
    last_mode_check: Option<Instant>,
    last_status: Option<Instant>,
}

impl TelemetryPoller {
    pub fn new(driver: Arc<PamDriver>, state: Arc<MachineState>, config: PollerConfig) -> Self {
        Self {
            driver,
            state,
            config,
            last_mode_check: None,
            last_status: None,
        }
    }

    fn due(last: Option<Instant>, interval: std::time::Duration) -> bool {
        last.map_or(true, |at| at.elapsed() >= interval)
    }

    /// Run one polling cycle
    pub async fn poll_once(&mut self) -> PollOutcome {
        if self.state.is_in_transition() {
            return PollOutcome::Skipped;
        }

        if Self::due(self.last_mode_check, self.config.mode_check_interval()) {
            self.driver.ensure_std_mode().await;
            self.last_mode_check = Some(Instant::now());
        }

        let Some(code) = self.driver.read_function().await else {
            return PollOutcome::NoFunction;
        };
        let Ok(function) = Function::try_from(code) else {
            debug!("Unsupported FUNCTION {}", code);
            return PollOutcome::Unsupported(code);
        };

        let mut patch = match function {
            Function::Dual => self.read_dual().await,
            Function::Single => self.read_single().await,
        };
        patch.func = Some(function);

        if Self::due(self.last_status, self.config.status_interval()) {
            let ready = self.driver.ready_status_for(function).await;
            patch.ready = ready;
            patch.enabled_b = ready.map(|r| r.b_active());
            patch.pin15 = self.driver.get_pin_15_status().await;
            patch.pin6 = self.driver.get_pin_6_status().await;
            self.last_status = Some(Instant::now());
        }

        // A transition may have started while this cycle was reading.
        if self.state.is_in_transition() {
            return PollOutcome::Skipped;
        }
        self.state.update(patch);
        PollOutcome::Published(function)
    }

    async fn read_dual(&self) -> StatusPatch {
        let function = Function::Dual;
        let mode_a = self.driver.read_ain_mode(Channel::A).await;
        let mode_b = self.driver.read_ain_mode(Channel::B).await;
        let wa = self.driver.read_wa().await;
        let wb = self.driver.read_wb().await;
        let ia = self.driver.read_ia().await;
        let ib = self.driver.read_ib().await;

        StatusPatch {
            wa: wa.and_then(|raw| scale_value(raw, mode_a, function)),
            wb: wb.and_then(|raw| scale_value(raw, mode_b, function)),
            ia,
            ib,
            mode: mode_a,
            mode_a,
            mode_b,
            ..Default::default()
        }
    }

    async fn read_single(&self) -> StatusPatch {
        let function = Function::Single;
        let mode = self.driver.read_ain_mode(Channel::A).await;
        let w = self.driver.read_w().await;
        let ia = self.driver.read_ia().await;
        let ib = self.driver.read_ib().await;

        StatusPatch {
            wa: w.and_then(|raw| scale_value(raw, mode, function)),
            wb: Some(0.0),
            ia,
            ib,
            mode,
            mode_a: mode,
            ..Default::default()
        }
    }

    /// Poll until `shutdown` turns true
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!("Telemetry poller started");
        while !*shutdown.borrow() {
            let delay = match self.poll_once().await {
                PollOutcome::NoFunction => {
                    warn!("FUNCTION unreadable; retrying");
                    self.config.retry_delay()
                }
                _ => self.config.loop_delay(),
            };
            tokio::select! {
                _ = sleep(delay) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        info!("Telemetry poller stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DriverConfig, LinkConfig};
    use crate::link::SerialLink;
    use crate::sim::SimConnector;
    use crate::machine::StatusKey;
    use pam_protocol::{AinUnit, ReadyStatus};
    use pam_sim::{SharedPam, VirtualPam};

    async fn poller_for(pam: &SharedPam) -> (TelemetryPoller, Arc<MachineState>) {
        let link = SerialLink::connect(
            "test",
            Box::new(SimConnector::new(pam.clone())),
            LinkConfig::default(),
        )
        .await;
        let driver = Arc::new(PamDriver::new(link, DriverConfig::default()));
        let state = Arc::new(MachineState::new());
        let poller = TelemetryPoller::new(driver, Arc::clone(&state), PollerConfig::default());
        (poller, state)
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_function_telemetry() {
        let pam = VirtualPam::new("poll").shared();
        pam.lock().unwrap().set_throttle(2500.0, 0.0, 0.0);
        let (mut poller, state) = poller_for(&pam).await;

        assert_eq!(poller.poll_once().await, PollOutcome::Published(Function::Single));

        let snapshot = state.get_all();
        assert_eq!(snapshot.func, Some(Function::Single));
        assert_eq!(snapshot.wa, Some(2.5));
        assert_eq!(snapshot.wb, Some(0.0));
        assert_eq!(snapshot.mode, Some(AinUnit::V));
        assert_eq!(snapshot.ready, Some(ReadyStatus::AllOff));
        assert_eq!(snapshot.enabled_b, Some(false));
        assert_eq!(snapshot.pin15, Some(false));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dual_function_scales_per_channel() {
        let pam = VirtualPam::new("poll").shared();
        {
            let mut pam = pam.lock().unwrap();
            pam.handle_line("FUNCTION 196");
            pam.set_ain(Channel::B, AinUnit::C);
            pam.set_throttle(0.0, 1500.0, 5000.0);
            pam.set_ready_word(1 << 15);
        }
        let (mut poller, state) = poller_for(&pam).await;

        assert_eq!(poller.poll_once().await, PollOutcome::Published(Function::Dual));

        let snapshot = state.get_all();
        assert_eq!(snapshot.wa, Some(1.5));
        assert_eq!(snapshot.wb, Some(5000.0 * 0.0016 + 4.0));
        assert_eq!(snapshot.mode_a, Some(AinUnit::V));
        assert_eq!(snapshot.mode_b, Some(AinUnit::C));
        assert_eq!(snapshot.ready, Some(ReadyStatus::BActive));
        assert_eq!(snapshot.enabled_b, Some(true));
    }

    #[tokio::test(start_paused = true)]
    async fn test_skips_during_transition() {
        let pam = VirtualPam::new("poll").shared();
        let (mut poller, state) = poller_for(&pam).await;

        let guard = state.begin_transition();
        pam.lock().unwrap().clear_received();
        assert_eq!(poller.poll_once().await, PollOutcome::Skipped);
        assert_eq!(pam.lock().unwrap().received_lines().count(), 0);
        assert_eq!(state.get(StatusKey::Func), None);
        drop(guard);

        assert_eq!(poller.poll_once().await, PollOutcome::Published(Function::Single));
    }

    #[tokio::test(start_paused = true)]
    async fn test_status_read_is_throttled() {
        let pam = VirtualPam::new("poll").shared();
        let (mut poller, _state) = poller_for(&pam).await;

        poller.poll_once().await;
        poller.poll_once().await;
        assert_eq!(pam.lock().unwrap().count_received("RX1:READYA"), 1);
        assert_eq!(pam.lock().unwrap().count_received("MODE"), 1);

        sleep(std::time::Duration::from_secs(1)).await;
        poller.poll_once().await;
        assert_eq!(pam.lock().unwrap().count_received("RX1:READYA"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_function() {
        let pam = VirtualPam::new("poll").shared();
        let (mut poller, _state) = poller_for(&pam).await;
        pam.lock().unwrap().set_silent(true);

        assert_eq!(poller.poll_once().await, PollOutcome::NoFunction);
    }
}

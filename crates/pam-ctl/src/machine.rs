//! Shared machine state
//!
//! The latest published view of the controller plus the transition flag
//! that pauses telemetry while a multi-step operation reconfigures it.
//! Readers always receive owned copies.

use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use pam_protocol::{AinUnit, Function, ProtocolError, ReadyStatus};
use serde::Serialize;
use tokio::time::{sleep, Instant};

const TRANSITION_POLL: Duration = Duration::from_millis(5);

/// Snapshot of the published controller status
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct MachineSnapshot {
    pub func: Option<Function>,
    pub wa: Option<f64>,
    pub wb: Option<f64>,
    pub ia: Option<f64>,
    pub ib: Option<f64>,
    pub mode: Option<AinUnit>,
    pub mode_a: Option<AinUnit>,
    pub mode_b: Option<AinUnit>,
    pub ready: Option<ReadyStatus>,
    pub pin15: Option<bool>,
    pub pin6: Option<bool>,
    pub enabled_b: Option<bool>,
    pub current_status: Option<u32>,
    pub current_a_status: Option<u32>,
    pub current_b_status: Option<u32>,
    pub in_transition: bool,
}

/// Partial update; only `Some` fields are applied
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatusPatch {
    pub func: Option<Function>,
    pub wa: Option<f64>,
    pub wb: Option<f64>,
    pub ia: Option<f64>,
    pub ib: Option<f64>,
    pub mode: Option<AinUnit>,
    pub mode_a: Option<AinUnit>,
    pub mode_b: Option<AinUnit>,
    pub ready: Option<ReadyStatus>,
    pub pin15: Option<bool>,
    pub pin6: Option<bool>,
    pub enabled_b: Option<bool>,
    pub current_status: Option<u32>,
    pub current_a_status: Option<u32>,
    pub current_b_status: Option<u32>,
}

macro_rules! apply_patch {
    ($snapshot:expr, $patch:expr; $($field:ident),+ $(,)?) => {
        $(
            if let Some(value) = $patch.$field {
                $snapshot.$field = Some(value);
            }
        )+
    };
}

/// Named status field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatusKey {
    Func,
    Wa,
    Wb,
    Ia,
    Ib,
    Mode,
    ModeA,
    ModeB,
    Ready,
    Pin15,
    Pin6,
    EnabledB,
    CurrentStatus,
    CurrentAStatus,
    CurrentBStatus,
    InTransition,
}

impl StatusKey {
    pub const ALL: [StatusKey; 16] = [
        StatusKey::Func,
        StatusKey::Wa,
        StatusKey::Wb,
        StatusKey::Ia,
        StatusKey::Ib,
        StatusKey::Mode,
        StatusKey::ModeA,
        StatusKey::ModeB,
        StatusKey::Ready,
        StatusKey::Pin15,
        StatusKey::Pin6,
        StatusKey::EnabledB,
        StatusKey::CurrentStatus,
        StatusKey::CurrentAStatus,
        StatusKey::CurrentBStatus,
        StatusKey::InTransition,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            StatusKey::Func => "FUNC",
            StatusKey::Wa => "WA",
            StatusKey::Wb => "WB",
            StatusKey::Ia => "IA",
            StatusKey::Ib => "IB",
            StatusKey::Mode => "MODE",
            StatusKey::ModeA => "MODE_A",
            StatusKey::ModeB => "MODE_B",
            StatusKey::Ready => "READY",
            StatusKey::Pin15 => "PIN15",
            StatusKey::Pin6 => "PIN6",
            StatusKey::EnabledB => "ENABLED_B",
            StatusKey::CurrentStatus => "CURRENT_STATUS",
            StatusKey::CurrentAStatus => "CURRENT_A_STATUS",
            StatusKey::CurrentBStatus => "CURRENT_B_STATUS",
            StatusKey::InTransition => "IN_TRANSITION",
        }
    }
}

impl fmt::Display for StatusKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for StatusKey {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_uppercase();
        StatusKey::ALL
            .into_iter()
            .find(|key| key.name() == wanted)
            .ok_or_else(|| ProtocolError::UnknownCommand(s.to_string()))
    }
}

/// Value of a single status field
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(untagged)]
pub enum StatusValue {
    Function(Function),
    Number(f64),
    Unit(AinUnit),
    Ready(ReadyStatus),
    Flag(bool),
    Milliamps(u32),
}

impl MachineSnapshot {
    /// Look up one field by key
    pub fn value(&self, key: StatusKey) -> Option<StatusValue> {
        match key {
            StatusKey::Func => self.func.map(StatusValue::Function),
            StatusKey::Wa => self.wa.map(StatusValue::Number),
            StatusKey::Wb => self.wb.map(StatusValue::Number),
            StatusKey::Ia => self.ia.map(StatusValue::Number),
            StatusKey::Ib => self.ib.map(StatusValue::Number),
            StatusKey::Mode => self.mode.map(StatusValue::Unit),
            StatusKey::ModeA => self.mode_a.map(StatusValue::Unit),
            StatusKey::ModeB => self.mode_b.map(StatusValue::Unit),
            StatusKey::Ready => self.ready.map(StatusValue::Ready),
            StatusKey::Pin15 => self.pin15.map(StatusValue::Flag),
            StatusKey::Pin6 => self.pin6.map(StatusValue::Flag),
            StatusKey::EnabledB => self.enabled_b.map(StatusValue::Flag),
            StatusKey::CurrentStatus => self.current_status.map(StatusValue::Milliamps),
            StatusKey::CurrentAStatus => self.current_a_status.map(StatusValue::Milliamps),
            StatusKey::CurrentBStatus => self.current_b_status.map(StatusValue::Milliamps),
            StatusKey::InTransition => Some(StatusValue::Flag(self.in_transition)),
        }
    }
}

/// Thread-safe holder of the published status
#[derive(Debug, Default)]
pub struct MachineState {
    inner: Mutex<MachineSnapshot>,
}

impl MachineState {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MachineSnapshot> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Merge a patch into the published status
    pub fn update(&self, patch: StatusPatch) {
        let mut snapshot = self.lock();
        apply_patch!(snapshot, patch;
            func, wa, wb, ia, ib, mode, mode_a, mode_b, ready,
            pin15, pin6, enabled_b, current_status, current_a_status, current_b_status,
        );
    }

    pub fn get(&self, key: StatusKey) -> Option<StatusValue> {
        self.lock().value(key)
    }

    pub fn get_all(&self) -> MachineSnapshot {
        self.lock().clone()
    }

    pub fn set_transition(&self, active: bool) {
        self.lock().in_transition = active;
    }

    pub fn is_in_transition(&self) -> bool {
        self.lock().in_transition
    }

    /// Mark a transition until the returned guard is dropped
    pub fn begin_transition(self: &Arc<Self>) -> TransitionGuard {
        self.set_transition(true);
        TransitionGuard {
            state: Arc::clone(self),
        }
    }

    /// Wait until no transition is in progress
    ///
    /// Returns false if the transition was still active after `timeout`.
    pub async fn wait_for_transition(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while self.is_in_transition() {
            if Instant::now() >= deadline {
                return false;
            }
            sleep(TRANSITION_POLL).await;
        }
        true
    }
}

/// Clears the transition flag when dropped
#[derive(Debug)]
#[must_use = "the transition ends when the guard is dropped"]
pub struct TransitionGuard {
    state: Arc<MachineState>,
}

impl Drop for TransitionGuard {
    fn drop(&mut self) {
        self.state.set_transition(false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_update_merges_only_set_fields() {
        let state = MachineState::new();
        state.update(StatusPatch {
            func: Some(Function::Dual),
            wa: Some(1.5),
            ..Default::default()
        });
        state.update(StatusPatch {
            wb: Some(2.0),
            ..Default::default()
        });

        let snapshot = state.get_all();
        assert_eq!(snapshot.func, Some(Function::Dual));
        assert_eq!(snapshot.wa, Some(1.5));
        assert_eq!(snapshot.wb, Some(2.0));
        assert_eq!(snapshot.ia, None);
    }

    #[test]
    fn test_get_by_key() {
        let state = MachineState::new();
        assert_eq!(state.get(StatusKey::Func), None);
        assert_eq!(
            state.get(StatusKey::InTransition),
            Some(StatusValue::Flag(false))
        );

        state.update(StatusPatch {
            ready: Some(ReadyStatus::BActive),
            ..Default::default()
        });
        assert_eq!(
            state.get(StatusKey::Ready),
            Some(StatusValue::Ready(ReadyStatus::BActive))
        );
    }

    #[test]
    fn test_get_all_is_a_copy() {
        let state = MachineState::new();
        let mut snapshot = state.get_all();
        snapshot.pin15 = Some(true);
        assert_eq!(state.get(StatusKey::Pin15), None);
    }

    #[test]
    fn test_status_key_names() {
        assert_eq!("MODE_A".parse::<StatusKey>().unwrap(), StatusKey::ModeA);
        assert_eq!("enabled_b".parse::<StatusKey>().unwrap(), StatusKey::EnabledB);
        assert!("BOGUS".parse::<StatusKey>().is_err());
        for key in StatusKey::ALL {
            assert_eq!(key.name().parse::<StatusKey>().unwrap(), key);
        }
    }

    #[test]
    fn test_transition_guard_clears_flag() {
        let state = Arc::new(MachineState::new());
        {
            let _guard = state.begin_transition();
            assert!(state.is_in_transition());
        }
        assert!(!state.is_in_transition());
    }

    #[test]
    fn test_snapshot_serializes_with_status_names() {
        let state = MachineState::new();
        state.update(StatusPatch {
            func: Some(Function::Single),
            mode_a: Some(AinUnit::C),
            ..Default::default()
        });
        let json = serde_json::to_value(state.get_all()).unwrap();
        assert_eq!(json["FUNC"], 195);
        assert_eq!(json["MODE_A"], "C");
        assert_eq!(json["IN_TRANSITION"], false);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_transition() {
        let state = Arc::new(MachineState::new());
        assert!(state.wait_for_transition(Duration::from_millis(10)).await);

        let guard = state.begin_transition();
        assert!(!state.wait_for_transition(Duration::from_millis(50)).await);

        let releaser = tokio::spawn(async move {
            sleep(Duration::from_millis(20)).await;
            drop(guard);
        });
        assert!(state.wait_for_transition(Duration::from_secs(1)).await);
        releaser.await.unwrap();
    }
}

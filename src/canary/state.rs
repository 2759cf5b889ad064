//! Canary rollout state.
//!
//! The current percentage is read on every request, so it lives in an
//! atomic; the rest of the state (phase, timestamps) sits behind a short
//! `RwLock` that only the rollback controller and operator tooling write.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU8, Ordering};

use crate::RouterError;

/// Rollout phase. Each phase implies a fixed new-provider percentage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum CanaryPhase {
    /// Not started: all traffic on legacy.
    Initial,
    /// 10% of traffic on the new provider.
    #[serde(rename = "canary_10")]
    Canary10,
    /// 50% of traffic on the new provider.
    #[serde(rename = "canary_50")]
    Canary50,
    /// All traffic on the new provider.
    Full,
    /// Rolled back after a breach: all traffic on legacy.
    Rollback,
}

impl CanaryPhase {
    /// New-provider percentage for this phase.
    pub fn percentage(&self) -> u8 {
        match self {
            Self::Initial | Self::Rollback => 0,
            Self::Canary10 => 10,
            Self::Canary50 => 50,
            Self::Full => 100,
        }
    }

    /// Phase reached by promoting from this one, if any.
    ///
    /// `Rollback` re-enters at `Canary10`; `Full` is terminal.
    pub fn next(&self) -> Option<Self> {
        match self {
            Self::Initial | Self::Rollback => Some(Self::Canary10),
            Self::Canary10 => Some(Self::Canary50),
            Self::Canary50 => Some(Self::Full),
            Self::Full => None,
        }
    }

    /// `true` for phases the controller may advance on its own schedule.
    pub fn auto_advances(&self) -> bool {
        matches!(self, Self::Canary10 | Self::Canary50)
    }

    /// Wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initial => "initial",
            Self::Canary10 => "canary_10",
            Self::Canary50 => "canary_50",
            Self::Full => "full",
            Self::Rollback => "rollback",
        }
    }
}

impl fmt::Display for CanaryPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CanaryPhase {
    type Err = RouterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let needle = s.trim().to_ascii_lowercase();
        [
            Self::Initial,
            Self::Canary10,
            Self::Canary50,
            Self::Full,
            Self::Rollback,
        ]
        .into_iter()
        .find(|p| p.as_str() == needle)
        .ok_or_else(|| RouterError::Validation(format!("invalid canary phase '{s}'")))
    }
}

/// Point-in-time view of the rollout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanaryState {
    /// Current phase.
    pub phase: CanaryPhase,
    /// New-provider percentage, 0–100.
    pub percentage: u8,
    /// When the current phase began.
    pub phase_started_at: DateTime<Utc>,
    /// Last health evaluation.
    pub last_health_check: Option<DateTime<Utc>>,
    /// Most recent rollback.
    pub last_rollback_at: Option<DateTime<Utc>>,
}

/// Read side of the rollout state, as seen by the traffic splitter.
pub trait RolloutState: Send + Sync {
    /// Current new-provider percentage, 0–100.
    fn percentage(&self) -> u8;

    /// Full snapshot.
    fn snapshot(&self) -> CanaryState;
}

/// Process-wide rollout state shared by the splitter (reader) and the
/// rollback controller (writer).
///
/// # Panics
///
/// This type and its methods never panic.
#[derive(Debug)]
pub struct SharedCanaryState {
    percentage: AtomicU8,
    inner: RwLock<CanaryState>,
}

impl SharedCanaryState {
    /// Start in `phase` at `now`.
    pub fn new(phase: CanaryPhase, now: DateTime<Utc>) -> Self {
        Self {
            percentage: AtomicU8::new(phase.percentage()),
            inner: RwLock::new(CanaryState {
                phase,
                percentage: phase.percentage(),
                phase_started_at: now,
                last_health_check: None,
                last_rollback_at: None,
            }),
        }
    }

    /// Current phase.
    pub fn phase(&self) -> CanaryPhase {
        self.inner.read().phase
    }

    /// Enter `phase` at `now`.
    pub fn set_phase(&self, phase: CanaryPhase, now: DateTime<Utc>) {
        let mut state = self.inner.write();
        state.phase = phase;
        state.percentage = phase.percentage();
        state.phase_started_at = now;
        if phase == CanaryPhase::Rollback {
            state.last_rollback_at = Some(now);
        }
        self.percentage.store(phase.percentage(), Ordering::Release);
    }

    /// Apply `f` to the state under the write lock. The percentage is kept
    /// in sync with the phase afterwards.
    pub fn update<R>(&self, f: impl FnOnce(&mut CanaryState) -> R) -> R {
        let mut state = self.inner.write();
        let out = f(&mut state);
        state.percentage = state.phase.percentage();
        self.percentage.store(state.percentage, Ordering::Release);
        out
    }
}

impl RolloutState for SharedCanaryState {
    fn percentage(&self) -> u8 {
        self.percentage.load(Ordering::Acquire)
    }

    fn snapshot(&self) -> CanaryState {
        self.inner.read().clone()
    }
}

/// Fixed percentage, for benchmarks and tests that do not exercise the
/// controller.
#[derive(Debug, Clone, Copy)]
pub struct FixedRollout(pub u8);

impl RolloutState for FixedRollout {
    fn percentage(&self) -> u8 {
        self.0.min(100)
    }

    fn snapshot(&self) -> CanaryState {
        CanaryState {
            phase: CanaryPhase::Canary10,
            percentage: self.percentage(),
            phase_started_at: DateTime::<Utc>::default(),
            last_health_check: None,
            last_rollback_at: None,
        }
    }
}

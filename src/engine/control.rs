use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tracing::info;

/// Lifecycle of a run.
///
/// `Configuring -> Ramping <-> Steady -> Draining -> Completed`, with
/// `Aborted` reachable from any non-terminal phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum RunPhase {
    Configuring = 0,
    Ramping = 1,
    Steady = 2,
    Draining = 3,
    Completed = 4,
    Aborted = 5,
}

impl RunPhase {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => RunPhase::Configuring,
            1 => RunPhase::Ramping,
            2 => RunPhase::Steady,
            3 => RunPhase::Draining,
            4 => RunPhase::Completed,
            _ => RunPhase::Aborted,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, RunPhase::Completed | RunPhase::Aborted)
    }

    pub fn can_transition_to(self, next: RunPhase) -> bool {
        use RunPhase::*;
        match (self, next) {
            (from, Aborted) => !from.is_terminal(),
            (Configuring, Ramping | Steady | Draining) => true,
            (Ramping, Steady) | (Steady, Ramping) => true,
            (Ramping | Steady, Draining) => true,
            (Draining, Completed) => true,
            _ => false,
        }
    }
}

impl fmt::Display for RunPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunPhase::Configuring => "configuring",
            RunPhase::Ramping => "ramping",
            RunPhase::Steady => "steady",
            RunPhase::Draining => "draining",
            RunPhase::Completed => "completed",
            RunPhase::Aborted => "aborted",
        };
        f.write_str(s)
    }
}

/// Why a run stopped before its schedule ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "detail")]
pub enum StopReason {
    /// A threshold with abort-on-fail breached during the run.
    ThresholdBreach(String),
    /// Ctrl-C or an embedding application asked to stop.
    Interrupted,
}

/// Shared state between the engine's control loop and whoever else needs to
/// observe or stop the run.
pub struct ControlState {
    phase: AtomicU8,
    /// Stop flag
    stopped: AtomicBool,
    stop_reason: Mutex<Option<StopReason>>,
    /// Last computed target, summed over scenarios
    target_workers: AtomicUsize,
    history: Mutex<Vec<(RunPhase, Duration)>>,
    /// Reference instant for phase timestamps, reset by `begin_run`
    reference_instant: Mutex<Instant>,
}

impl ControlState {
    pub fn new() -> Self {
        Self {
            phase: AtomicU8::new(RunPhase::Configuring as u8),
            stopped: AtomicBool::new(false),
            stop_reason: Mutex::new(None),
            target_workers: AtomicUsize::new(0),
            history: Mutex::new(vec![(RunPhase::Configuring, Duration::ZERO)]),
            reference_instant: Mutex::new(Instant::now()),
        }
    }

    /// Start a fresh lifecycle: phase offsets are measured from now. State
    /// left behind by a finished run is cleared; a stop requested before the
    /// first run is kept.
    pub fn begin_run(&self) {
        let mut history = self.history.lock();
        if self.phase().is_terminal() {
            self.stopped.store(false, Ordering::SeqCst);
            *self.stop_reason.lock() = None;
        }
        self.phase.store(RunPhase::Configuring as u8, Ordering::SeqCst);
        self.target_workers.store(0, Ordering::SeqCst);
        *self.reference_instant.lock() = Instant::now();
        history.clear();
        history.push((RunPhase::Configuring, Duration::ZERO));
    }

    pub fn phase(&self) -> RunPhase {
        RunPhase::from_u8(self.phase.load(Ordering::SeqCst))
    }

    /// Move to `next` if the lifecycle allows it. Returns whether the phase changed.
    pub fn transition(&self, next: RunPhase) -> bool {
        let mut history = self.history.lock();
        let current = self.phase();
        if current == next || !current.can_transition_to(next) {
            return false;
        }
        self.phase.store(next as u8, Ordering::SeqCst);
        history.push((next, self.reference_instant.lock().elapsed()));
        info!(from = %current, to = %next, "Run phase changed");
        true
    }

    /// Phases entered so far, with their offset from the start of the run.
    pub fn history(&self) -> Vec<(RunPhase, Duration)> {
        self.history.lock().clone()
    }

    /// First reason wins; later calls only keep the flag set.
    pub fn stop(&self, reason: StopReason) {
        let mut slot = self.stop_reason.lock();
        if slot.is_none() {
            *slot = Some(reason);
        }
        self.stopped.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    pub fn stop_reason(&self) -> Option<StopReason> {
        self.stop_reason.lock().clone()
    }

    /// Returns the previous target.
    pub fn set_target_workers(&self, count: usize) -> usize {
        self.target_workers.swap(count, Ordering::SeqCst)
    }

    pub fn target_workers(&self) -> usize {
        self.target_workers.load(Ordering::SeqCst)
    }
}

impl Default for ControlState {
    fn default() -> Self {
        Self::new()
    }
}

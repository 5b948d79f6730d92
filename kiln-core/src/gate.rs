//! Single-flight admission for generation work.
//!
//! The gate holds at most one admission at a time and never queues: a caller either gets a
//! [`Permit`] right away or gets nothing. Dropping the permit returns the gate to idle, so
//! every exit path of the work it guards releases it.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;

#[derive(Debug, Default)]
struct GenerationState {
    busy: bool,
    current_prompt: String,
    start_time: Option<Instant>,
    /// Bumped on every admission so a permit can tell whether it is still the holder.
    epoch: u64,
}

impl GenerationState {
    fn clear(&mut self) {
        self.busy = false;
        self.current_prompt.clear();
        self.start_time = None;
    }
}

/// Point-in-time view of the gate for progress queries.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct GateSnapshot {
    pub is_generating: bool,
    pub current_prompt: String,
    /// Seconds since admission, 0 when idle.
    pub elapsed: f64,
}

#[derive(Debug, Clone, Default)]
pub struct GenerationGate {
    state: Arc<Mutex<GenerationState>>,
}

impl GenerationGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Admits the caller if the gate is idle. Never waits.
    pub fn try_acquire(&self, prompt: &str) -> Option<Permit> {
        let mut state = self.state.lock();
        if state.busy {
            return None;
        }
        let now = Instant::now();
        state.epoch = state.epoch.wrapping_add(1);
        state.busy = true;
        state.current_prompt = prompt.to_string();
        state.start_time = Some(now);
        Some(Permit {
            state: Arc::clone(&self.state),
            epoch: state.epoch,
            admitted_at: now,
        })
    }

    /// Unconditionally returns the gate to idle, whoever holds it.
    pub fn release(&self) {
        self.state.lock().clear();
    }

    pub fn is_busy(&self) -> bool {
        self.state.lock().busy
    }

    pub fn snapshot(&self) -> GateSnapshot {
        let state = self.state.lock();
        GateSnapshot {
            is_generating: state.busy,
            current_prompt: state.current_prompt.clone(),
            elapsed: state
                .start_time
                .map_or(0.0, |start| start.elapsed().as_secs_f64()),
        }
    }
}

/// Proof of admission. Releases the gate on drop unless the admission was already
/// cleared by [`GenerationGate::release`] and handed to someone else.
#[derive(Debug)]
pub struct Permit {
    state: Arc<Mutex<GenerationState>>,
    epoch: u64,
    admitted_at: Instant,
}

impl Permit {
    pub fn elapsed(&self) -> Duration {
        self.admitted_at.elapsed()
    }

    /// Whether this permit still owns the gate.
    pub fn is_current(&self) -> bool {
        let state = self.state.lock();
        state.busy && state.epoch == self.epoch
    }
}

impl Drop for Permit {
    fn drop(&mut self) {
        let mut state = self.state.lock();
        if state.busy && state.epoch == self.epoch {
            state.clear();
        }
    }
}

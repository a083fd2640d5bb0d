//! Per-cell, non-blocking sleeps.
//!
//! A sleeping cell suspends only its own sheet. The sheet keeps re-evaluating
//! the sleeping cell on every cycle until the wake time has passed.

use std::collections::HashMap;

use streamsheets_engine::engine::CellRef;
use tracing::debug;

/// Sleeps shorter than this never block.
pub const MIN_SLEEP_SECS: f64 = 0.001;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SleepOutcome {
    Proceed,
    Suspend,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct SleepState {
    resume_at_ms: i64,
    duration_ms: i64,
}

#[derive(Debug, Default)]
pub struct SleepCoordinator {
    states: HashMap<CellRef, SleepState>,
}

impl SleepCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Evaluate `SLEEP(seconds)` for `cell` at time `now_ms`.
    pub fn sleep(&mut self, cell: &CellRef, seconds: f64, now_ms: i64) -> SleepOutcome {
        if !(seconds >= MIN_SLEEP_SECS) {
            self.states.remove(cell);
            return SleepOutcome::Proceed;
        }
        let duration_ms = (seconds * 1000.0).ceil() as i64;
        match self.states.get(cell) {
            Some(state) if state.duration_ms == duration_ms => {
                if now_ms >= state.resume_at_ms {
                    self.states.remove(cell);
                    debug!(cell = %cell, "sleep elapsed");
                    SleepOutcome::Proceed
                } else {
                    SleepOutcome::Suspend
                }
            }
            _ => {
                let resume_at_ms = now_ms + duration_ms;
                debug!(cell = %cell, duration_ms, resume_at_ms, "sleep armed");
                self.states.insert(
                    cell.clone(),
                    SleepState {
                        resume_at_ms,
                        duration_ms,
                    },
                );
                SleepOutcome::Suspend
            }
        }
    }

    pub fn is_sleeping(&self, cell: &CellRef) -> bool {
        self.states.contains_key(cell)
    }

    pub fn resume_at(&self, cell: &CellRef) -> Option<i64> {
        self.states.get(cell).map(|s| s.resume_at_ms)
    }

    pub fn cancel(&mut self, cell: &CellRef) {
        if self.states.remove(cell).is_some() {
            debug!(cell = %cell, "sleep cancelled");
        }
    }

    pub fn clear(&mut self) {
        self.states.clear();
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}

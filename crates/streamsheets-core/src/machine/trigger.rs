//! When a sheet steps.

use rand::Rng;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TriggerKind {
    /// One evaluation per explicit step call.
    Once,
    Always,
    MachineStart,
    MachineStop,
    Timer { interval_ms: u64 },
    /// Next delay drawn uniformly from `[0, max_interval_ms)`.
    Random { max_interval_ms: u64 },
    /// Every cycle while the inbox has work.
    Arrival,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Repeat {
    #[default]
    Once,
    /// Re-enter the loop collection instead of finishing the message.
    Endless,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerConfig {
    #[serde(flatten)]
    pub kind: TriggerKind,
    #[serde(default)]
    pub repeat: Repeat,
}

impl Default for TriggerConfig {
    fn default() -> Self {
        TriggerConfig {
            kind: TriggerKind::Always,
            repeat: Repeat::Once,
        }
    }
}

impl TriggerConfig {
    pub fn new(kind: TriggerKind) -> Self {
        TriggerConfig {
            kind,
            repeat: Repeat::Once,
        }
    }

    pub fn endless(mut self) -> Self {
        self.repeat = Repeat::Endless;
        self
    }
}

/// Why a sheet is asked to step.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StepReason {
    Cycle,
    /// An explicit `step` while the machine is not running.
    Manual,
    MachineStart,
    MachineStop,
}

#[derive(Clone, Debug)]
pub struct Trigger {
    config: TriggerConfig,
    next_fire_ms: Option<i64>,
}

impl Trigger {
    pub fn new(config: TriggerConfig) -> Self {
        Trigger {
            config,
            next_fire_ms: None,
        }
    }

    pub fn config(&self) -> &TriggerConfig {
        &self.config
    }

    pub fn is_endless(&self) -> bool {
        self.config.repeat == Repeat::Endless
    }

    /// Forget the timer schedule.
    pub fn reset(&mut self) {
        self.next_fire_ms = None;
    }

    /// Decide whether the sheet steps. `has_work` tells ARRIVAL whether
    /// anything is left to process.
    pub fn should_fire(&mut self, reason: StepReason, now_ms: i64, has_work: bool) -> bool {
        match reason {
            StepReason::MachineStart => self.config.kind == TriggerKind::MachineStart,
            StepReason::MachineStop => self.config.kind == TriggerKind::MachineStop,
            StepReason::Manual => !matches!(
                self.config.kind,
                TriggerKind::MachineStart | TriggerKind::MachineStop
            ),
            StepReason::Cycle => match self.config.kind {
                TriggerKind::Always => true,
                TriggerKind::Arrival => has_work,
                TriggerKind::Timer { interval_ms } => self.due(now_ms, interval_ms as i64),
                TriggerKind::Random { max_interval_ms } => {
                    let delay = if max_interval_ms == 0 {
                        0
                    } else {
                        rand::thread_rng().gen_range(0..max_interval_ms) as i64
                    };
                    self.due(now_ms, delay)
                }
                TriggerKind::Once | TriggerKind::MachineStart | TriggerKind::MachineStop => false,
            },
        }
    }

    /// Fire if the scheduled time has come, then schedule the next one `delay_ms` later.
    fn due(&mut self, now_ms: i64, delay_ms: i64) -> bool {
        match self.next_fire_ms {
            Some(next) if now_ms < next => false,
            _ => {
                self.next_fire_ms = Some(now_ms + delay_ms);
                true
            }
        }
    }

    pub fn next_fire_ms(&self) -> Option<i64> {
        self.next_fire_ms
    }
}

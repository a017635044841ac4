//! Phase progress records

use serde::{Deserialize, Serialize};

/// A persisted progress snapshot for one phase.
///
/// Serialized as `{"step", "message", "percent", "completed"}`; missing
/// fields default to the zero state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PhaseProgress {
    /// Number of steps completed
    pub step: u32,

    /// Human readable description of the latest step
    pub message: String,

    /// Completion percentage, 0..=100
    pub percent: u8,

    /// Terminal flag; once set the phase does not run again in this run
    pub completed: bool,
}

impl PhaseProgress {
    /// Zero state with a starting message
    pub fn starting(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Self::default()
        }
    }

    /// Record `step` of `total` as done.
    ///
    /// Percent never decreases and `completed` never resets. A phase with
    /// no steps completes at `advance(0, 0, ..)`.
    pub fn advance(&self, step: u32, total: u32, message: impl Into<String>) -> Self {
        let percent = percent_of(step, total).max(self.percent);
        Self {
            step: step.max(self.step),
            message: message.into(),
            percent,
            completed: self.completed || step >= total,
        }
    }

    pub fn is_zero(&self) -> bool {
        self.step == 0 && self.percent == 0 && !self.completed
    }
}

/// `step / total * 100`, clamped to 100
pub fn percent_of(step: u32, total: u32) -> u8 {
    if total == 0 {
        return 100;
    }
    let pct = (u64::from(step.min(total)) * 100) / u64::from(total);
    pct as u8
}

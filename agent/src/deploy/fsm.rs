//! Finite state machine for store operations
//!
//! queued -> running -> {success, error}. Terminal states are write-once.

use chrono::Utc;

use crate::errors::StoreError;
use crate::models::operation::{Operation, OperationStatus, OperationStep};

/// Highest progress a non-terminal operation may report
pub const MAX_RUNNING_PROGRESS: u8 = 99;

/// Operation transition
#[derive(Debug, Clone)]
pub enum OperationTransition {
    /// First phase begins
    Start,

    /// Move to a new phase, raising progress to at least the given value
    Advance { step: OperationStep, progress: u8 },

    /// Raise progress within the current phase
    Progress(u8),

    /// Workflow finished
    Complete,

    /// Workflow aborted
    Fail(String),
}

impl Operation {
    /// Process a transition, rejecting anything invalid for the current status
    pub fn process(&mut self, transition: OperationTransition) -> Result<(), StoreError> {
        let now = Utc::now();

        match (self.status, &transition) {
            (OperationStatus::Queued, OperationTransition::Start) => {
                self.status = OperationStatus::Running;
                self.started_at = Some(now);
                self.current_step = OperationStep::Start;
                self.raise_progress(1);
            }

            (OperationStatus::Running, OperationTransition::Advance { step, progress }) => {
                self.current_step = *step;
                self.raise_progress(*progress);
            }
            (OperationStatus::Running, OperationTransition::Progress(progress)) => {
                self.raise_progress(*progress);
            }
            (OperationStatus::Running, OperationTransition::Complete) => {
                self.status = OperationStatus::Success;
                self.current_step = OperationStep::Complete;
                self.progress_percent = 100;
                self.error_message = None;
                self.finished_at = Some(now);
            }

            (
                OperationStatus::Queued | OperationStatus::Running,
                OperationTransition::Fail(message),
            ) => {
                self.status = OperationStatus::Error;
                self.error_message = Some(message.clone());
                self.finished_at = Some(now);
            }

            (status, transition) => {
                return Err(StoreError::InvalidTransition(format!(
                    "operation {}: {:?} -> {:?}",
                    self.id, status, transition
                )));
            }
        }

        self.updated_at = now;
        Ok(())
    }

    /// Monotonic, clamped below 100 until completion
    fn raise_progress(&mut self, progress: u8) {
        let progress = progress.min(MAX_RUNNING_PROGRESS);
        self.progress_percent = self.progress_percent.max(progress);
    }
}

/// Clamp a fractional percentage into 0..=100
pub fn clamp_percent(value: f64) -> u8 {
    if value.is_nan() {
        return 0;
    }
    value.round().clamp(0.0, 100.0) as u8
}

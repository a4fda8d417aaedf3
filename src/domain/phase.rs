//! Phase run records and the phase state machine.
//!
//! ```text
//! Pending -> Ready -> Running -> Completed
//!                        |
//!                        +-> TransientlyFailed -> Ready   (attempt_count < max_retries)
//!                        |                    -> Failed  (retries exhausted)
//!                        +-> Failed                      (fatal)
//! Pending -> Skipped     (alternate whose primary completed)
//! ```
//!
//! The retry decision is a pure function of the attempt count and the
//! outcome so it can be tested without running agents.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::artifact::ArtifactType;

/// Status of a single phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    /// Waiting for required inputs
    Pending,

    /// All inputs present, waiting for dispatch
    Ready,

    /// An attempt is in flight
    Running,

    /// Completed successfully
    Completed,

    /// Last attempt failed with a retryable error
    TransientlyFailed,

    /// Failed permanently
    Failed,

    /// Never run: an alternate whose primary completed
    Skipped,
}

impl Default for PhaseStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl PhaseStatus {
    /// Terminal states never change during a run
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped)
    }

    /// Whether the state machine allows `self -> next`
    pub fn can_transition_to(self, next: PhaseStatus) -> bool {
        use PhaseStatus::*;
        matches!(
            (self, next),
            (Pending, Ready)
                | (Pending, Skipped)
                | (Ready, Running)
                | (Running, Completed)
                | (Running, TransientlyFailed)
                | (Running, Failed)
                | (TransientlyFailed, Ready)
                | (TransientlyFailed, Failed)
        )
    }
}

/// Rejected state machine transition
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("Invalid transition for phase '{phase}': {from:?} -> {to:?}")]
pub struct InvalidTransition {
    pub phase: String,
    pub from: PhaseStatus,
    pub to: PhaseStatus,
}

/// Why a phase attempt did not complete
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "detail")]
pub enum PhaseError {
    /// Required artifacts are missing (a scheduling signal, not a failure)
    #[error("Required artifacts missing: {0:?}")]
    NotReady(Vec<ArtifactType>),

    /// Retryable agent failure
    #[error("Transient failure: {0}")]
    Transient(String),

    /// Non-retryable agent failure
    #[error("Fatal failure: {0}")]
    Fatal(String),

    /// The attempt exceeded the phase timeout
    #[error("Timed out after {0}ms")]
    Timeout(u64),

    /// An output artifact could not be persisted
    #[error("Artifact store write failed: {0}")]
    StoreWrite(String),

    /// The attempt was cancelled
    #[error("Cancelled")]
    Cancelled,
}

impl PhaseError {
    /// Everything but a fatal failure may be retried
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Fatal(_))
    }

    pub fn timeout(after: Duration) -> Self {
        Self::Timeout(after.as_millis() as u64)
    }
}

/// Outcome class of one attempt, as seen by the state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOutcome {
    Succeeded,
    Retryable,
    Fatal,
}

impl From<&Result<(), PhaseError>> for AttemptOutcome {
    fn from(result: &Result<(), PhaseError>) -> Self {
        match result {
            Ok(()) => Self::Succeeded,
            Err(e) if e.is_retryable() => Self::Retryable,
            Err(_) => Self::Fatal,
        }
    }
}

/// Status a `Running` phase moves to once an attempt finishes
pub fn status_after_attempt(outcome: AttemptOutcome) -> PhaseStatus {
    match outcome {
        AttemptOutcome::Succeeded => PhaseStatus::Completed,
        AttemptOutcome::Retryable => PhaseStatus::TransientlyFailed,
        AttemptOutcome::Fatal => PhaseStatus::Failed,
    }
}

/// Status a `TransientlyFailed` phase moves to
pub fn retry_decision(attempt_count: u32, max_retries: u32) -> PhaseStatus {
    if attempt_count < max_retries {
        PhaseStatus::Ready
    } else {
        PhaseStatus::Failed
    }
}

/// Where a phase settles after an attempt: `Completed`, `Ready` (will retry)
/// or `Failed`
pub fn settle(outcome: AttemptOutcome, attempt_count: u32, max_retries: u32) -> PhaseStatus {
    match status_after_attempt(outcome) {
        PhaseStatus::TransientlyFailed => retry_decision(attempt_count, max_retries),
        other => other,
    }
}

/// Mutable run record of one phase within a project
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseInstance {
    pub phase_name: String,

    pub status: PhaseStatus,

    /// Number of attempts dispatched so far
    pub attempt_count: u32,

    pub started_at: Option<DateTime<Utc>>,

    pub finished_at: Option<DateTime<Utc>>,

    /// Last error seen for this phase
    pub error_detail: Option<PhaseError>,

    /// Earliest time the next attempt may be dispatched (backoff)
    #[serde(default)]
    pub retry_at: Option<DateTime<Utc>>,
}

impl PhaseInstance {
    pub fn new(phase_name: impl Into<String>) -> Self {
        Self {
            phase_name: phase_name.into(),
            status: PhaseStatus::Pending,
            attempt_count: 0,
            started_at: None,
            finished_at: None,
            error_detail: None,
            retry_at: None,
        }
    }

    /// Move to `next`, enforcing the state machine
    pub fn transition(&mut self, next: PhaseStatus) -> Result<(), InvalidTransition> {
        if !self.status.can_transition_to(next) {
            return Err(InvalidTransition {
                phase: self.phase_name.clone(),
                from: self.status,
                to: next,
            });
        }

        let now = Utc::now();
        match next {
            PhaseStatus::Running => {
                self.attempt_count += 1;
                self.retry_at = None;
                if self.started_at.is_none() {
                    self.started_at = Some(now);
                }
            }
            PhaseStatus::Completed | PhaseStatus::Failed | PhaseStatus::Skipped => {
                self.finished_at = Some(now);
                self.retry_at = None;
            }
            _ => {}
        }
        self.status = next;
        Ok(())
    }

    /// Whether the phase may be dispatched at `now`
    pub fn is_dispatchable(&self, now: DateTime<Utc>) -> bool {
        self.status == PhaseStatus::Ready && self.retry_at.map_or(true, |at| at <= now)
    }

    /// Put an interrupted or failed phase back into play after a restart
    ///
    /// An attempt that was in flight when the process stopped never reported
    /// an outcome, so it is not counted.
    pub fn rearm_for_resume(&mut self, reset_failed: bool) {
        match self.status {
            PhaseStatus::Running => {
                self.attempt_count = self.attempt_count.saturating_sub(1);
                self.status = PhaseStatus::Ready;
            }
            PhaseStatus::TransientlyFailed => {
                self.status = PhaseStatus::Ready;
            }
            PhaseStatus::Failed if reset_failed => {
                self.status = PhaseStatus::Pending;
                self.attempt_count = 0;
                self.finished_at = None;
            }
            _ => {}
        }
        self.retry_at = None;
    }
}

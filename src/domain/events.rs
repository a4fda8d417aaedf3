//! Transition log for projects.
//!
//! Every phase or project transition is appended to the project's event log
//! before the snapshot is rewritten, giving an audit trail next to the
//! checkpoint.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::phase::PhaseStatus;

/// A single entry in the append-only event log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Unique identifier for this event
    pub id: Uuid,

    /// When this event occurred (ISO 8601)
    pub timestamp: DateTime<Utc>,

    /// The project this event belongs to
    pub project_id: Uuid,

    /// Phase name (if applicable)
    pub phase: Option<String>,

    /// Type of event
    pub event_type: EventType,

    /// Attempt number of the phase (if applicable)
    pub attempt: Option<u32>,

    /// Human-readable summary (NO payload content)
    pub summary: String,

    /// Phase status after the transition (if applicable)
    pub status: Option<PhaseStatus>,

    /// Time taken in milliseconds (for finished attempts)
    pub duration_ms: Option<u64>,

    /// Error message if failed
    pub error: Option<String>,
}

impl Event {
    /// Create a project-level event
    pub fn project(project_id: Uuid, event_type: EventType, summary: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            project_id,
            phase: None,
            event_type,
            attempt: None,
            summary: summary.into(),
            status: None,
            duration_ms: None,
            error: None,
        }
    }

    /// Create a phase-level event
    pub fn phase(
        project_id: Uuid,
        phase: impl Into<String>,
        event_type: EventType,
        status: PhaseStatus,
        summary: impl Into<String>,
    ) -> Self {
        Self {
            phase: Some(phase.into()),
            status: Some(status),
            ..Self::project(project_id, event_type, summary)
        }
    }

    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = Some(attempt);
        self
    }

    pub fn with_duration(mut self, duration_ms: u64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}

/// Types of events that can occur during a project run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    ProjectStarted,

    ProjectResumed,

    ProjectCompleted,

    ProjectAborted,

    /// A phase failed but an alternate can still cover it
    ProjectPhaseFailed,

    /// All required inputs became available
    PhaseReady,

    /// An attempt was dispatched
    PhaseStarted,

    PhaseCompleted,

    /// An attempt failed and will be retried after backoff
    PhaseRetrying,

    /// An attempt failed with a retryable error
    PhaseTransientlyFailed,

    /// The phase failed permanently
    PhaseFailed,

    /// An alternate phase was not needed
    PhaseSkipped,

    /// An output artifact version was written
    ArtifactStored,
}

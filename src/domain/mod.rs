//! Domain types for the swarm-forge orchestrator.
//!
//! This module contains the core data structures:
//! - Artifact: Immutable, versioned phase outputs
//! - Phase: Per-phase run records and their state machine
//! - Project: The aggregate root and overall status
//! - Events: Transition log entries

pub mod artifact;
pub mod events;
pub mod phase;
pub mod project;

// Re-export commonly used types
pub use artifact::{Artifact, ArtifactType, SEED_PHASE};
pub use events::{Event, EventType};
pub use phase::{
    retry_decision, settle, status_after_attempt, AttemptOutcome, InvalidTransition, PhaseError,
    PhaseInstance, PhaseStatus,
};
pub use project::{
    OverallStatus, Project, ProjectBrief, ProjectSnapshot, ProjectStatusSnapshot, ProjectType,
};

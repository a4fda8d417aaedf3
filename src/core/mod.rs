//! Core orchestration logic.
//!
//! This module contains:
//! - ArtifactStore: Versioned, durable artifact history
//! - PhaseGraph: Phase graph definitions and loading
//! - Limits: Worker pool, payload and deadline limits
//! - ProjectStore: Checkpoints, transition logs, locks
//! - Orchestrator: The scheduling loop

pub mod artifact_store;
pub mod graph;
pub mod limits;
pub mod orchestrator;
pub mod project_store;

// Re-export commonly used types
pub use artifact_store::{ArtifactStore, StoreError};
pub use graph::{AgentSpec, PhaseDefinition, PhaseGraph, RetryPolicy};
pub use limits::{LimitViolation, OrchestratorLimits};
pub use orchestrator::Orchestrator;
pub use project_store::{FileProjectStore, ProjectLock, ProjectStore};

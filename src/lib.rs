//! swarm-forge - Agent pipeline orchestrator
//!
//! Drives a team of role agents (product manager, architect, developers,
//! DevOps, technical writer) through a dependency graph of phases. Each
//! phase consumes artifacts produced by earlier phases and produces new,
//! versioned artifacts.
//!
//! # Architecture
//!
//! - A static phase graph declares which artifact types each phase requires
//!   and produces; dependency edges follow from those declarations
//! - The orchestrator dispatches every phase whose inputs exist, in parallel
//!   up to a worker limit, retrying transient failures with backoff
//! - Project state is checkpointed after every transition, so an
//!   interrupted project resumes without re-running completed phases
//!
//! # Modules
//!
//! - `adapters`: The agent capability and its implementations
//! - `core`: Orchestration logic (ArtifactStore, PhaseGraph, ProjectStore, Orchestrator)
//! - `domain`: Data structures (Artifact, PhaseInstance, Project, Event)
//! - `config`: Layered configuration
//! - `cli`: Command-line interface
//!
//! # Usage
//!
//! ```bash
//! # Start a project
//! forge run todo_app -d "Tracks todos" -f "lists,reminders"
//!
//! # Check project status
//! forge status <project-id>
//!
//! # Resume an interrupted or aborted project
//! forge resume <project-id>
//! ```

pub mod adapters;
pub mod cli;
pub mod config;
pub mod core;
pub mod domain;

// Re-export main types at crate root for convenience
pub use adapters::{AgentAdapter, AgentContext, AgentOutcome, AgentRegistry};
pub use core::{FileProjectStore, Orchestrator, PhaseGraph, ProjectStore};
pub use domain::{Artifact, ArtifactType, OverallStatus, PhaseStatus, ProjectBrief, ProjectStatusSnapshot};

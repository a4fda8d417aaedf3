//! Project aggregate and overall status.
//!
//! A Project is one run of the phase graph for one brief. It is owned by the
//! orchestrator and checkpointed as a [`ProjectSnapshot`] after every
//! transition.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::artifact::{Artifact, ArtifactType};
use super::phase::{PhaseInstance, PhaseStatus};

/// Snapshot format version written to disk
pub const SNAPSHOT_FORMAT_VERSION: u32 = 1;

/// What the user asked to build
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectBrief {
    pub name: String,

    pub description: String,

    #[serde(default, rename = "type")]
    pub project_type: ProjectType,

    #[serde(default)]
    pub features: Vec<String>,

    #[serde(default)]
    pub technical_requirements: BTreeMap<String, String>,
}

impl ProjectBrief {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            project_type: ProjectType::default(),
            features: Vec::new(),
            technical_requirements: BTreeMap::new(),
        }
    }

    pub fn with_features<I, S>(mut self, features: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.features = features.into_iter().map(Into::into).collect();
        self
    }

    /// Names must be identifier-like: they become directory names and
    /// package names downstream.
    pub fn validate(&self) -> Result<()> {
        let mut chars = self.name.chars();
        match chars.next() {
            None => anyhow::bail!("Project name cannot be empty"),
            Some(c) if !c.is_ascii_alphabetic() && c != '_' => {
                anyhow::bail!("Project name '{}' must start with a letter or '_'", self.name)
            }
            _ => {}
        }
        if !chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-') {
            anyhow::bail!(
                "Project name '{}' may only contain letters, digits, '_' and '-'",
                self.name
            );
        }
        if self.description.trim().is_empty() {
            anyhow::bail!("Project description cannot be empty");
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectType {
    #[default]
    Web,
    Mobile,
    Cli,
    Desktop,
}

impl fmt::Display for ProjectType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Web => "web",
            Self::Mobile => "mobile",
            Self::Cli => "cli",
            Self::Desktop => "desktop",
        };
        f.write_str(s)
    }
}

/// Overall project status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverallStatus {
    #[default]
    NotStarted,

    InProgress,

    /// A phase failed but an alternate producer can still cover it
    PhaseFailed,

    Completed,

    Aborted,
}

impl OverallStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Aborted)
    }
}

impl fmt::Display for OverallStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::NotStarted => "not-started",
            Self::InProgress => "in-progress",
            Self::PhaseFailed => "phase-failed",
            Self::Completed => "completed",
            Self::Aborted => "aborted",
        };
        f.write_str(s)
    }
}

/// Aggregate root for one pipeline run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Project {
    pub project_id: Uuid,

    pub brief: ProjectBrief,

    /// Name of the phase graph this project runs
    pub graph_name: String,

    /// One record per phase, in graph declaration order
    pub phase_instances: Vec<PhaseInstance>,

    /// Current version of every artifact type produced so far
    pub artifacts: BTreeMap<ArtifactType, Artifact>,

    pub overall_status: OverallStatus,

    /// Why the project was aborted (failure, cancel, deadline)
    pub abort_reason: Option<String>,

    pub created_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,

    pub finished_at: Option<DateTime<Utc>>,
}

impl Project {
    pub fn new<I, S>(project_id: Uuid, brief: ProjectBrief, graph_name: String, phases: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let now = Utc::now();
        Self {
            project_id,
            brief,
            graph_name,
            phase_instances: phases.into_iter().map(PhaseInstance::new).collect(),
            artifacts: BTreeMap::new(),
            overall_status: OverallStatus::NotStarted,
            abort_reason: None,
            created_at: now,
            updated_at: now,
            finished_at: None,
        }
    }

    pub fn phase(&self, name: &str) -> Option<&PhaseInstance> {
        self.phase_instances.iter().find(|p| p.phase_name == name)
    }

    pub fn phase_mut(&mut self, name: &str) -> Option<&mut PhaseInstance> {
        self.phase_instances.iter_mut().find(|p| p.phase_name == name)
    }

    pub fn phase_status(&self, name: &str) -> Option<PhaseStatus> {
        self.phase(name).map(|p| p.status)
    }

    pub fn has_artifact(&self, artifact_type: &ArtifactType) -> bool {
        self.artifacts.contains_key(artifact_type)
    }

    /// Make `artifact` the current version of its type
    pub fn record_artifact(&mut self, artifact: Artifact) {
        self.artifacts.insert(artifact.artifact_type.clone(), artifact);
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Whether a failed phase has (or may still get) its outputs from an
    /// alternate producer
    fn is_recoverable(&self, phase: &str, alternates: &HashMap<String, String>, depth: usize) -> bool {
        if depth > self.phase_instances.len() {
            return false;
        }
        match alternates.get(phase).and_then(|alt| self.phase(alt)) {
            None => false,
            Some(alt) => match alt.status {
                PhaseStatus::Failed => self.is_recoverable(&alt.phase_name, alternates, depth + 1),
                _ => true,
            },
        }
    }

    /// Whether a failed phase's outputs were produced by a completed alternate
    fn is_covered(&self, phase: &str, alternates: &HashMap<String, String>, depth: usize) -> bool {
        if depth > self.phase_instances.len() {
            return false;
        }
        match alternates.get(phase).and_then(|alt| self.phase(alt)) {
            None => false,
            Some(alt) => match alt.status {
                PhaseStatus::Completed => true,
                PhaseStatus::Failed => self.is_covered(&alt.phase_name, alternates, depth + 1),
                _ => false,
            },
        }
    }

    /// Whether a failed phase was covered by a completed alternate
    pub fn failure_covered(&self, phase: &str, alternates: &HashMap<String, String>) -> bool {
        self.is_covered(phase, alternates, 0)
    }

    /// First failed phase that no alternate can cover
    pub fn unrecoverable_failure(&self, alternates: &HashMap<String, String>) -> Option<&PhaseInstance> {
        self.phase_instances
            .iter()
            .find(|p| p.status == PhaseStatus::Failed && !self.is_recoverable(&p.phase_name, alternates, 0))
    }

    /// Derive the overall status from the phase records
    ///
    /// `alternates` maps a primary phase name to its alternate producer.
    pub fn derive_status(&self, alternates: &HashMap<String, String>) -> OverallStatus {
        if self.abort_reason.is_some() || self.unrecoverable_failure(alternates).is_some() {
            return OverallStatus::Aborted;
        }

        let resolved = self.phase_instances.iter().all(|p| match p.status {
            PhaseStatus::Completed | PhaseStatus::Skipped => true,
            PhaseStatus::Failed => self.is_covered(&p.phase_name, alternates, 0),
            _ => false,
        });
        if resolved {
            return OverallStatus::Completed;
        }

        let any_failed = self
            .phase_instances
            .iter()
            .any(|p| p.status == PhaseStatus::Failed && !self.is_covered(&p.phase_name, alternates, 0));
        if any_failed {
            return OverallStatus::PhaseFailed;
        }

        let untouched = self
            .phase_instances
            .iter()
            .all(|p| p.status == PhaseStatus::Pending && p.attempt_count == 0);
        if untouched && self.overall_status == OverallStatus::NotStarted {
            OverallStatus::NotStarted
        } else {
            OverallStatus::InProgress
        }
    }

    /// Recompute `overall_status`, recording an abort reason for
    /// unrecoverable failures
    pub fn refresh_status(&mut self, alternates: &HashMap<String, String>) -> OverallStatus {
        let status = self.derive_status(alternates);
        if status == OverallStatus::Aborted && self.abort_reason.is_none() {
            if let Some(failed) = self.unrecoverable_failure(alternates) {
                let detail = failed
                    .error_detail
                    .as_ref()
                    .map(|e| e.to_string())
                    .unwrap_or_else(|| "unknown error".to_string());
                self.abort_reason = Some(format!(
                    "Phase '{}' failed after {} attempt(s): {}",
                    failed.phase_name, failed.attempt_count, detail
                ));
            }
        }
        if status.is_terminal() && self.finished_at.is_none() {
            self.finished_at = Some(Utc::now());
        }
        self.overall_status = status;
        self.touch();
        status
    }

    /// Read-only view for progress reporting
    ///
    /// `failed_phase` names the first failure no completed alternate covers.
    pub fn status_snapshot(&self, alternates: &HashMap<String, String>) -> ProjectStatusSnapshot {
        let failed_phase = self
            .phase_instances
            .iter()
            .find(|p| p.status == PhaseStatus::Failed && !self.failure_covered(&p.phase_name, alternates))
            .map(|p| p.phase_name.clone());

        ProjectStatusSnapshot {
            project_id: self.project_id,
            name: self.brief.name.clone(),
            graph_name: self.graph_name.clone(),
            overall_status: self.overall_status,
            abort_reason: self.abort_reason.clone(),
            failed_phase,
            phases: self.phase_instances.clone(),
            artifacts: self
                .artifacts
                .values()
                .map(|a| (a.artifact_type.clone(), a.version))
                .collect(),
            created_at: self.created_at,
            updated_at: self.updated_at,
            finished_at: self.finished_at,
        }
    }
}

/// Durable checkpoint of a project
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectSnapshot {
    pub format_version: u32,

    pub saved_at: DateTime<Utc>,

    pub project: Project,
}

impl ProjectSnapshot {
    pub fn of(project: &Project) -> Self {
        Self {
            format_version: SNAPSHOT_FORMAT_VERSION,
            saved_at: Utc::now(),
            project: project.clone(),
        }
    }
}

/// Read-only status view consumed by the CLI
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectStatusSnapshot {
    pub project_id: Uuid,
    pub name: String,
    pub graph_name: String,
    pub overall_status: OverallStatus,
    pub abort_reason: Option<String>,
    pub failed_phase: Option<String>,
    pub phases: Vec<PhaseInstance>,
    /// Current artifact types and their versions
    pub artifacts: Vec<(ArtifactType, u32)>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

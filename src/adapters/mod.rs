//! Agent adapters.
//!
//! Every agent, whatever it does internally, is driven through the single
//! [`AgentAdapter`] capability: it receives the current versions of its
//! required artifacts and returns an explicit [`AgentOutcome`]. Agents never
//! touch project state; the orchestrator routes their outputs by declared
//! artifact type.

pub mod builtin;
pub mod command;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::core::graph::{AgentSpec, PhaseGraph};
use crate::domain::{Artifact, ArtifactType, PhaseError, ProjectBrief};

pub use builtin::{BuiltinAgent, Role};
pub use command::CommandAgent;

/// Read-only inputs handed to an agent
pub type ArtifactInputs = BTreeMap<ArtifactType, Arc<Artifact>>;

/// Payloads returned by an agent, keyed by artifact type
pub type ArtifactOutputs = BTreeMap<ArtifactType, serde_json::Value>;

/// Result of one agent execution
#[derive(Debug, Clone, PartialEq)]
pub enum AgentOutcome {
    Success(ArtifactOutputs),

    /// Retryable under the phase's policy
    TransientFailure(String),

    /// Never retried
    FatalFailure(String),
}

impl AgentOutcome {
    /// Success with the given `(type, payload)` pairs
    pub fn success<I, K>(outputs: I) -> Self
    where
        I: IntoIterator<Item = (K, serde_json::Value)>,
        K: Into<ArtifactType>,
    {
        Self::Success(outputs.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    pub fn transient(reason: impl Into<String>) -> Self {
        Self::TransientFailure(reason.into())
    }

    pub fn fatal(reason: impl Into<String>) -> Self {
        Self::FatalFailure(reason.into())
    }

    /// Map onto the orchestrator's error taxonomy
    pub fn into_result(self) -> Result<ArtifactOutputs, PhaseError> {
        match self {
            Self::Success(outputs) => Ok(outputs),
            Self::TransientFailure(reason) => Err(PhaseError::Transient(reason)),
            Self::FatalFailure(reason) => Err(PhaseError::Fatal(reason)),
        }
    }
}

/// Per-agent model settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentSettings {
    #[serde(default = "default_model")]
    pub model: String,

    /// Sampling temperature in [0, 1]
    #[serde(default = "default_temperature")]
    pub temperature: f32,

    #[serde(default)]
    pub max_tokens: Option<u32>,

    #[serde(default)]
    pub custom_instructions: Option<String>,
}

fn default_model() -> String {
    "gpt-4".to_string()
}
fn default_temperature() -> f32 {
    0.7
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            model: default_model(),
            temperature: default_temperature(),
            max_tokens: None,
            custom_instructions: None,
        }
    }
}

impl AgentSettings {
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.temperature) {
            anyhow::bail!("Temperature must be between 0 and 1, got {}", self.temperature);
        }
        if self.model.trim().is_empty() {
            anyhow::bail!("Model name cannot be empty");
        }
        Ok(())
    }
}

/// Everything an agent may know about the attempt it is running
#[derive(Debug, Clone)]
pub struct AgentContext {
    pub project_id: Uuid,

    pub phase: String,

    /// 1-based attempt number
    pub attempt: u32,

    /// Output types the phase declares
    pub outputs: Vec<ArtifactType>,

    pub brief: Arc<ProjectBrief>,

    pub settings: AgentSettings,

    /// Cancelled on timeout or project cancel; agents must stop promptly
    pub cancel: CancellationToken,
}

impl AgentContext {
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Capability implemented by every agent
#[async_trait]
pub trait AgentAdapter: Send + Sync {
    /// Human-readable agent name
    fn name(&self) -> &str;

    /// Run the agent once
    async fn execute(&self, inputs: &ArtifactInputs, ctx: &AgentContext) -> AgentOutcome;
}

/// Agents bound to phases, by phase name
#[derive(Default, Clone)]
pub struct AgentRegistry {
    agents: HashMap<String, Arc<dyn AgentAdapter>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build agents for every builtin or command phase in the graph
    ///
    /// Phases declared `external` must be registered afterwards.
    pub fn from_graph(graph: &PhaseGraph) -> Self {
        let mut registry = Self::new();
        for phase in &graph.phases {
            let agent: Arc<dyn AgentAdapter> = match &phase.agent {
                AgentSpec::Builtin(role) => Arc::new(BuiltinAgent::new(*role)),
                AgentSpec::Command(argv) => match CommandAgent::from_argv(argv) {
                    Some(agent) => Arc::new(agent),
                    None => continue,
                },
                AgentSpec::External => continue,
            };
            registry.register(phase.name.clone(), agent);
        }
        registry
    }

    /// Bind an agent to a phase, replacing any previous binding
    pub fn register(&mut self, phase: impl Into<String>, agent: Arc<dyn AgentAdapter>) -> &mut Self {
        self.agents.insert(phase.into(), agent);
        self
    }

    /// Builder-style [`register`](Self::register)
    pub fn with(mut self, phase: impl Into<String>, agent: Arc<dyn AgentAdapter>) -> Self {
        self.register(phase, agent);
        self
    }

    pub fn get(&self, phase: &str) -> Option<Arc<dyn AgentAdapter>> {
        self.agents.get(phase).cloned()
    }

    /// Phases of `graph` with no bound agent
    pub fn missing_for(&self, graph: &PhaseGraph) -> Vec<String> {
        graph
            .phase_names()
            .filter(|name| !self.agents.contains_key(*name))
            .map(str::to_string)
            .collect()
    }
}

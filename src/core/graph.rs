//! Phase graph definitions and loading.
//!
//! A phase graph is defined in YAML and declares, per phase, the artifact
//! types it requires and produces. Dependency edges are implied: a phase
//! depends on every phase that produces one of its required types.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::adapters::Role;
use crate::domain::ArtifactType;

/// The default software-development graph shipped with the binary
const DEFAULT_SDLC_GRAPH: &str = include_str!("../../pipelines/sdlc.yaml");

/// A complete phase graph definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseGraph {
    /// Graph name (recorded on every project that runs it)
    pub name: String,

    /// Human-readable description
    #[serde(default)]
    pub description: String,

    /// Artifact types supplied from outside the graph when a project starts
    #[serde(default = "default_seeds")]
    pub seeds: Vec<ArtifactType>,

    /// Phases in declaration order (the dispatch tie-break order)
    pub phases: Vec<PhaseDefinition>,
}

fn default_seeds() -> Vec<ArtifactType> {
    vec![ArtifactType::new(ArtifactType::PROJECT_BRIEF)]
}

impl PhaseGraph {
    /// Create a graph from phases, seeded with `project_brief`
    pub fn new(name: impl Into<String>, phases: Vec<PhaseDefinition>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            seeds: default_seeds(),
            phases,
        }
    }

    /// Load a graph from a YAML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read phase graph file: {}", path.display()))?;

        Self::from_yaml(&content)
            .with_context(|| format!("Invalid phase graph: {}", path.display()))
    }

    /// Parse and validate a graph from YAML content
    pub fn from_yaml(content: &str) -> Result<Self> {
        let graph: Self = serde_yaml::from_str(content).context("Failed to parse phase graph YAML")?;
        graph.validate()?;
        Ok(graph)
    }

    /// The built-in product manager -> technical writer graph
    pub fn default_sdlc() -> Result<Self> {
        Self::from_yaml(DEFAULT_SDLC_GRAPH)
    }

    /// Validate the graph definition
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            anyhow::bail!("Phase graph name cannot be empty");
        }

        if self.phases.is_empty() {
            anyhow::bail!("Phase graph must have at least one phase");
        }

        if let Some(seed) = self.seeds.iter().find(|ty| !ty.is_valid()) {
            anyhow::bail!("Invalid seed artifact type '{}' (use letters, digits, '_' and '-')", seed);
        }

        let mut seen = BTreeSet::new();
        for (i, phase) in self.phases.iter().enumerate() {
            if phase.name.is_empty() {
                anyhow::bail!("Phase {} has an empty name", i);
            }
            if !ArtifactType::is_valid_name(&phase.name) {
                anyhow::bail!("Invalid phase name '{}' (use letters, digits, '_' and '-')", phase.name);
            }
            if let Some(ty) = phase.requires.iter().chain(&phase.produces).find(|ty| !ty.is_valid()) {
                anyhow::bail!(
                    "Phase '{}' names invalid artifact type '{}' (use letters, digits, '_' and '-')",
                    phase.name,
                    ty
                );
            }
            if !seen.insert(phase.name.as_str()) {
                anyhow::bail!("Duplicate phase name '{}'", phase.name);
            }
            if phase.produces.is_empty() {
                anyhow::bail!("Phase '{}' must produce at least one artifact type", phase.name);
            }
            if phase.max_retries == 0 {
                anyhow::bail!("Phase '{}' must allow at least one attempt (max_retries >= 1)", phase.name);
            }
            if phase.timeout().is_zero() {
                anyhow::bail!("Phase '{}' has a zero timeout", phase.name);
            }
            if let Some(own) = phase.requires.intersection(&phase.produces).next() {
                anyhow::bail!("Phase '{}' requires its own output '{}'", phase.name, own);
            }
        }

        // Every required type needs a producer or must be seeded
        for phase in &self.phases {
            for required in &phase.requires {
                let seeded = self.seeds.contains(required);
                if !seeded && self.producers_of(required).next().is_none() {
                    anyhow::bail!(
                        "Phase '{}' requires '{}', which no phase produces",
                        phase.name,
                        required
                    );
                }
            }
        }

        self.validate_alternates()?;
        self.topological_order()?;

        Ok(())
    }

    fn validate_alternates(&self) -> Result<()> {
        let mut primaries: BTreeMap<&str, &str> = BTreeMap::new();

        for phase in &self.phases {
            let Some(primary_name) = phase.alternate_for.as_deref() else {
                continue;
            };
            if primary_name == phase.name {
                anyhow::bail!("Phase '{}' cannot be its own alternate", phase.name);
            }
            let primary = self.get(primary_name).with_context(|| {
                format!(
                    "Phase '{}' is an alternate for non-existent phase '{}'",
                    phase.name, primary_name
                )
            })?;
            if let Some(existing) = primaries.insert(primary_name, phase.name.as_str()) {
                anyhow::bail!(
                    "Phase '{}' already has alternate '{}'; '{}' cannot be another",
                    primary_name,
                    existing,
                    phase.name
                );
            }
            if let Some(missing) = primary.produces.difference(&phase.produces).next() {
                anyhow::bail!(
                    "Alternate '{}' does not produce '{}' declared by '{}'",
                    phase.name,
                    missing,
                    primary_name
                );
            }
        }

        // Alternate chains must end
        for start in primaries.keys() {
            let mut current = *start;
            let mut hops = 0;
            while let Some(next) = self.get(current).and_then(|p| p.alternate_for.as_deref()) {
                hops += 1;
                if hops > self.phases.len() {
                    anyhow::bail!("Alternate chain through '{}' is cyclic", start);
                }
                current = next;
            }
        }

        Ok(())
    }

    /// Phases ordered so every producer precedes its consumers
    ///
    /// Ties are broken by declaration order, so the order is deterministic.
    pub fn topological_order(&self) -> Result<Vec<&PhaseDefinition>> {
        let deps = self.dependencies();
        let mut placed: BTreeSet<&str> = BTreeSet::new();
        let mut order = Vec::with_capacity(self.phases.len());

        while order.len() < self.phases.len() {
            let next = self.phases.iter().find(|p| {
                !placed.contains(p.name.as_str())
                    && deps[p.name.as_str()].iter().all(|d| placed.contains(d))
            });

            match next {
                Some(phase) => {
                    placed.insert(phase.name.as_str());
                    order.push(phase);
                }
                None => {
                    let stuck: Vec<&str> = self
                        .phases
                        .iter()
                        .map(|p| p.name.as_str())
                        .filter(|n| !placed.contains(n))
                        .collect();
                    anyhow::bail!("Phase graph has a dependency cycle among: {}", stuck.join(", "));
                }
            }
        }

        Ok(order)
    }

    /// For each phase, the phases producing at least one of its inputs
    pub fn dependencies(&self) -> HashMap<&str, BTreeSet<&str>> {
        self.phases
            .iter()
            .map(|phase| {
                let deps = phase
                    .requires
                    .iter()
                    .flat_map(|ty| self.producers_of(ty))
                    .map(|p| p.name.as_str())
                    .filter(|n| *n != phase.name)
                    .collect();
                (phase.name.as_str(), deps)
            })
            .collect()
    }

    /// Phases that declare `artifact_type` among their outputs
    pub fn producers_of<'a>(
        &'a self,
        artifact_type: &'a ArtifactType,
    ) -> impl Iterator<Item = &'a PhaseDefinition> + 'a {
        self.phases.iter().filter(move |p| p.produces.contains(artifact_type))
    }

    /// Map of primary phase name -> alternate phase name
    pub fn alternates(&self) -> HashMap<String, String> {
        self.phases
            .iter()
            .filter_map(|p| p.alternate_for.clone().map(|primary| (primary, p.name.clone())))
            .collect()
    }

    /// Get a phase by name
    pub fn get(&self, name: &str) -> Option<&PhaseDefinition> {
        self.phases.iter().find(|p| p.name == name)
    }

    /// Phase names in declaration order
    pub fn phase_names(&self) -> impl Iterator<Item = &str> {
        self.phases.iter().map(|p| p.name.as_str())
    }
}

/// Static descriptor of one phase
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseDefinition {
    /// Phase name (unique within the graph)
    pub name: String,

    /// Agent bound to this phase
    #[serde(default, with = "serde_yaml::with::singleton_map")]
    pub agent: AgentSpec,

    /// Artifact types that must exist before the phase may run
    #[serde(default)]
    pub requires: BTreeSet<ArtifactType>,

    /// Artifact types the phase writes on success
    pub produces: BTreeSet<ArtifactType>,

    /// Maximum number of attempts, including the first
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Per-attempt timeout in seconds
    #[serde(default)]
    pub timeout_seconds: Option<u64>,

    /// Per-attempt timeout in milliseconds (takes precedence)
    #[serde(default)]
    pub timeout_ms: Option<u64>,

    /// Backoff between attempts
    #[serde(default)]
    pub retry_policy: RetryPolicy,

    /// Primary phase this one stands in for when the primary fails
    #[serde(default)]
    pub alternate_for: Option<String>,
}

fn default_max_retries() -> u32 {
    3
}

const DEFAULT_TIMEOUT_SECONDS: u64 = 300;

impl PhaseDefinition {
    pub fn new(name: impl Into<String>, requires: &[&str], produces: &[&str]) -> Self {
        Self {
            name: name.into(),
            agent: AgentSpec::default(),
            requires: requires.iter().map(|t| ArtifactType::new(*t)).collect(),
            produces: produces.iter().map(|t| ArtifactType::new(*t)).collect(),
            max_retries: default_max_retries(),
            timeout_seconds: None,
            timeout_ms: None,
            retry_policy: RetryPolicy::default(),
            alternate_for: None,
        }
    }

    pub fn with_agent(mut self, agent: AgentSpec) -> Self {
        self.agent = agent;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    pub fn alternate_for(mut self, primary: impl Into<String>) -> Self {
        self.alternate_for = Some(primary.into());
        self
    }

    /// Effective per-attempt timeout
    pub fn timeout(&self) -> Duration {
        match (self.timeout_ms, self.timeout_seconds) {
            (Some(ms), _) => Duration::from_millis(ms),
            (None, Some(secs)) => Duration::from_secs(secs),
            (None, None) => Duration::from_secs(DEFAULT_TIMEOUT_SECONDS),
        }
    }
}

/// How a phase's agent is provided
///
/// Supports these YAML forms:
/// - `agent: { builtin: product_manager }`
/// - `agent: { command: ["my-agent", "--role", "architect"] }`
/// - `agent: external` (registered by the embedding application)
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentSpec {
    Builtin(Role),
    Command(Vec<String>),
    #[default]
    External,
}

/// Backoff between attempts of a phase
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Delay before the second attempt in milliseconds
    #[serde(default = "default_initial_delay")]
    pub initial_delay_ms: u64,

    /// Maximum delay between attempts in milliseconds
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,

    /// Backoff multiplier (delay *= multiplier after each retry)
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
}

fn default_initial_delay() -> u64 {
    1000
}
fn default_max_delay() -> u64 {
    30000
}
fn default_backoff_multiplier() -> f64 {
    2.0
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay_ms: default_initial_delay(),
            max_delay_ms: default_max_delay(),
            backoff_multiplier: default_backoff_multiplier(),
        }
    }
}

impl RetryPolicy {
    /// No delay between attempts
    pub fn immediate() -> Self {
        Self {
            initial_delay_ms: 0,
            max_delay_ms: 0,
            backoff_multiplier: 1.0,
        }
    }

    /// Delay after the given failed attempt (1-indexed)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::from_millis(self.initial_delay_ms.min(self.max_delay_ms));
        }

        let delay =
            self.initial_delay_ms as f64 * self.backoff_multiplier.powi((attempt - 1) as i32);

        let capped = delay.min(self.max_delay_ms as f64) as u64;
        Duration::from_millis(capped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_graph_parses() {
        let graph = PhaseGraph::default_sdlc().unwrap();

        assert_eq!(graph.name, "sdlc");
        assert_eq!(graph.phases.len(), 6);
        assert_eq!(
            graph.get("product_manager").unwrap().agent,
            AgentSpec::Builtin(Role::ProductManager)
        );
        assert_eq!(
            graph.get("backend_developer").unwrap().timeout(),
            Duration::from_secs(600)
        );
    }

    #[test]
    fn test_agent_spec_yaml_forms() {
        let yaml = r#"
name: forms
phases:
  - name: pm
    agent:
      builtin: product_manager
    requires: [project_brief]
    produces: [requirements]
  - name: ops
    agent:
      builtin: devops_engineer
    requires: [requirements]
    produces: [deployment_config]
  - name: reviewer
    agent: external
    requires: [requirements]
    produces: [review]
  - name: writer
    requires: [requirements]
    produces: [documentation]
"#;
        let graph = PhaseGraph::from_yaml(yaml).unwrap();

        assert_eq!(graph.get("pm").unwrap().agent, AgentSpec::Builtin(Role::ProductManager));
        assert_eq!(graph.get("ops").unwrap().agent, AgentSpec::Builtin(Role::DevOpsEngineer));
        assert_eq!(graph.get("reviewer").unwrap().agent, AgentSpec::External);
        assert_eq!(graph.get("writer").unwrap().agent, AgentSpec::External);

        // Written graphs load back unchanged
        let written = serde_yaml::to_string(&graph).unwrap();
        assert!(written.contains("builtin: product_manager"), "{}", written);
        let reloaded = PhaseGraph::from_yaml(&written).unwrap();
        assert_eq!(reloaded.get("pm").unwrap().agent, AgentSpec::Builtin(Role::ProductManager));
    }

    #[test]
    fn test_topological_order_respects_dependencies() {
        let graph = PhaseGraph::default_sdlc().unwrap();
        let order: Vec<&str> = graph
            .topological_order()
            .unwrap()
            .iter()
            .map(|p| p.name.as_str())
            .collect();

        assert_eq!(
            order,
            vec![
                "product_manager",
                "system_architect",
                "backend_developer",
                "frontend_developer",
                "devops_engineer",
                "technical_writer",
            ]
        );
    }

    #[test]
    fn test_cycle_is_rejected() {
        let graph = PhaseGraph::new(
            "cyclic",
            vec![
                PhaseDefinition::new("a", &["project_brief", "y"], &["x"]),
                PhaseDefinition::new("b", &["x"], &["y"]),
            ],
        );
        let err = graph.validate().unwrap_err().to_string();
        assert!(err.contains("cycle"), "{}", err);
    }

    #[test]
    fn test_unproduced_input_is_rejected() {
        let graph = PhaseGraph::new(
            "broken",
            vec![PhaseDefinition::new("a", &["nothing_makes_this"], &["x"])],
        );
        assert!(graph.validate().is_err());
    }

    #[test]
    fn test_path_like_names_are_rejected() {
        for bad in ["docs/api", "../escaped", "has space", ""] {
            let graph = PhaseGraph::new(
                "paths",
                vec![PhaseDefinition::new("a", &["project_brief"], &[bad])],
            );
            assert!(graph.validate().is_err(), "{:?} accepted", bad);
        }

        let graph = PhaseGraph::new(
            "paths",
            vec![PhaseDefinition::new("../a", &["project_brief"], &["x"])],
        );
        let err = graph.validate().unwrap_err();
        assert!(err.to_string().contains("Invalid phase name"));

        let mut graph = PhaseGraph::new(
            "paths",
            vec![PhaseDefinition::new("a", &["project_brief"], &["api-docs_v2"])],
        );
        assert!(graph.validate().is_ok());
        graph.seeds.push(ArtifactType::new("in/put"));
        assert!(graph.validate().is_err());
    }

    #[test]
    fn test_alternate_must_cover_primary_outputs() {
        let graph = PhaseGraph::new(
            "alt",
            vec![
                PhaseDefinition::new("dev", &["project_brief"], &["code", "tests"]),
                PhaseDefinition::new("dev_fallback", &["project_brief"], &["code"])
                    .alternate_for("dev"),
            ],
        );
        assert!(graph.validate().is_err());

        let graph = PhaseGraph::new(
            "alt",
            vec![
                PhaseDefinition::new("dev", &["project_brief"], &["code"]),
                PhaseDefinition::new("dev_fallback", &["project_brief"], &["code"])
                    .alternate_for("dev"),
            ],
        );
        assert!(graph.validate().is_ok());
        assert_eq!(graph.alternates().get("dev").map(String::as_str), Some("dev_fallback"));
    }

    #[test]
    fn test_zero_retries_rejected() {
        let graph = PhaseGraph::new(
            "g",
            vec![PhaseDefinition::new("a", &["project_brief"], &["x"]).with_max_retries(0)],
        );
        assert!(graph.validate().is_err());
    }

    #[test]
    fn test_retry_policy_delays() {
        let policy = RetryPolicy {
            initial_delay_ms: 1000,
            backoff_multiplier: 2.0,
            max_delay_ms: 10000,
        };

        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(1000));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(2000));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(4000));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_millis(8000));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(10000)); // Capped
    }

    #[test]
    fn test_command_agent_yaml() {
        let yaml = r#"
name: custom
phases:
  - name: writer
    agent:
      command: ["my-writer", "--fast"]
    requires: [project_brief]
    produces: [documentation]
    timeout_ms: 250
"#;
        let graph = PhaseGraph::from_yaml(yaml).unwrap();
        let phase = graph.get("writer").unwrap();

        assert_eq!(
            phase.agent,
            AgentSpec::Command(vec!["my-writer".to_string(), "--fast".to_string()])
        );
        assert_eq!(phase.timeout(), Duration::from_millis(250));
        assert_eq!(phase.max_retries, 3);
    }
}

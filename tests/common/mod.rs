//! Shared test fixtures: scripted agents and orchestrator wiring.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use swarm_forge::adapters::{AgentAdapter, AgentContext, AgentOutcome, AgentRegistry, ArtifactInputs};
use swarm_forge::core::{
    FileProjectStore, Orchestrator, OrchestratorLimits, PhaseDefinition, PhaseGraph, RetryPolicy,
};
use swarm_forge::domain::{ArtifactType, PhaseInstance, ProjectBrief, ProjectStatusSnapshot};

/// What a scripted agent does on one attempt
#[derive(Debug, Clone)]
pub enum Step {
    Succeed,
    Transient(&'static str),
    Fatal(&'static str),
    /// Block until cancelled
    Hang,
}

/// Agent that plays back a script, one step per attempt
///
/// Once the script runs out every attempt succeeds.
pub struct ScriptedAgent {
    name: String,
    script: Mutex<VecDeque<Step>>,
    delay: Duration,
    calls: AtomicU32,
    running: AtomicUsize,
    max_running: AtomicUsize,
    gauge: Option<Arc<Gauge>>,
    inputs_seen: Mutex<Vec<Vec<ArtifactType>>>,
}

/// Concurrency gauge shared by several agents
#[derive(Default)]
pub struct Gauge {
    current: AtomicUsize,
    peak: AtomicUsize,
}

impl Gauge {
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    fn enter(&self) {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
    }

    fn exit(&self) {
        self.current.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Decrements the in-flight counters even if the attempt is aborted
struct InFlight<'a> {
    agent: &'a ScriptedAgent,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.agent.running.fetch_sub(1, Ordering::SeqCst);
        if let Some(gauge) = &self.agent.gauge {
            gauge.exit();
        }
    }
}

impl ScriptedAgent {
    pub fn new(name: &str, script: Vec<Step>) -> Self {
        Self {
            name: name.to_string(),
            script: Mutex::new(script.into()),
            delay: Duration::ZERO,
            calls: AtomicU32::new(0),
            running: AtomicUsize::new(0),
            max_running: AtomicUsize::new(0),
            gauge: None,
            inputs_seen: Mutex::new(Vec::new()),
        }
    }

    pub fn ok(name: &str) -> Self {
        Self::new(name, Vec::new())
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_gauge(mut self, gauge: Arc<Gauge>) -> Self {
        self.gauge = Some(gauge);
        self
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Most attempts of this agent ever in flight at once
    pub fn max_running(&self) -> usize {
        self.max_running.load(Ordering::SeqCst)
    }

    /// Input types received, per attempt
    pub fn inputs_seen(&self) -> Vec<Vec<ArtifactType>> {
        self.inputs_seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl AgentAdapter for ScriptedAgent {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, inputs: &ArtifactInputs, ctx: &AgentContext) -> AgentOutcome {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_running.fetch_max(now, Ordering::SeqCst);
        if let Some(gauge) = &self.gauge {
            gauge.enter();
        }
        let _in_flight = InFlight { agent: self };

        self.inputs_seen
            .lock()
            .unwrap()
            .push(inputs.keys().cloned().collect());

        if !self.delay.is_zero() {
            tokio::select! {
                _ = tokio::time::sleep(self.delay) => {}
                _ = ctx.cancel.cancelled() => return AgentOutcome::transient("cancelled"),
            }
        }

        let step = self.script.lock().unwrap().pop_front().unwrap_or(Step::Succeed);
        match step {
            Step::Succeed => AgentOutcome::success(ctx.outputs.iter().map(|ty| {
                (ty.clone(), json!({ "phase": ctx.phase, "attempt": ctx.attempt }))
            })),
            Step::Transient(reason) => AgentOutcome::transient(reason),
            Step::Fatal(reason) => AgentOutcome::fatal(reason),
            Step::Hang => {
                ctx.cancel.cancelled().await;
                AgentOutcome::transient("cancelled")
            }
        }
    }
}

/// Phase with no backoff, so retries run immediately
pub fn phase(name: &str, requires: &[&str], produces: &[&str]) -> PhaseDefinition {
    PhaseDefinition::new(name, requires, produces).with_retry_policy(RetryPolicy::immediate())
}

/// PM -> Architect -> Developer
pub fn linear_graph() -> PhaseGraph {
    PhaseGraph::new(
        "linear",
        vec![
            phase("product_manager", &["project_brief"], &["requirements"]),
            phase("system_architect", &["requirements"], &["architecture"]),
            phase("developer", &["architecture"], &["source_code"]),
        ],
    )
}

/// PM -> Architect -> Developer -> {DevOps, TechWriter}
pub fn sdlc_graph() -> PhaseGraph {
    PhaseGraph::new(
        "sdlc-test",
        vec![
            phase("product_manager", &["project_brief"], &["requirements"]),
            phase("system_architect", &["requirements"], &["architecture"]),
            phase("developer", &["architecture"], &["source_code"]),
            phase("devops_engineer", &["source_code"], &["deployment_config"]),
            phase(
                "technical_writer",
                &["requirements", "architecture", "source_code"],
                &["documentation"],
            ),
        ],
    )
}

/// Register scripted agents by phase name
pub fn registry(agents: &[(&str, &Arc<ScriptedAgent>)]) -> AgentRegistry {
    let mut registry = AgentRegistry::new();
    for (phase, agent) in agents {
        registry.register(*phase, Arc::clone(agent) as Arc<dyn AgentAdapter>);
    }
    registry
}

/// Limits tuned for fast tests
pub fn test_limits() -> OrchestratorLimits {
    OrchestratorLimits {
        cancel_poll_ms: 20,
        ..Default::default()
    }
}

pub fn orchestrator(graph: PhaseGraph, agents: AgentRegistry, root: &Path) -> Orchestrator {
    Orchestrator::new(graph, agents, Arc::new(FileProjectStore::new(root)))
        .unwrap()
        .with_limits(test_limits())
}

pub fn brief() -> ProjectBrief {
    ProjectBrief::new("demo", "A demo project").with_features(["lists"])
}

pub fn phase_of<'a>(snapshot: &'a ProjectStatusSnapshot, name: &str) -> &'a PhaseInstance {
    snapshot
        .phases
        .iter()
        .find(|p| p.phase_name == name)
        .unwrap_or_else(|| panic!("no phase '{}'", name))
}

//! Main orchestrator for project execution.
//!
//! Drives a project through its phase graph as a single scheduling loop:
//! promote phases whose inputs exist, dispatch ready phases onto a bounded
//! pool of attempt tasks, fold their reports back into the project, and
//! checkpoint after every transition.
//!
//! The loop only ever waits on one of: an attempt finishing, the earliest
//! retry backoff elapsing, the project deadline, or a cancel request.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::adapters::{
    AgentAdapter, AgentContext, AgentRegistry, AgentSettings, ArtifactInputs, ArtifactOutputs,
};
use crate::domain::artifact::payload_size;
use crate::domain::{
    settle, Artifact, ArtifactType, AttemptOutcome, Event, EventType, OverallStatus, PhaseError,
    PhaseStatus, Project, ProjectBrief, ProjectSnapshot, ProjectStatusSnapshot, SEED_PHASE,
};

use super::artifact_store::ArtifactStore;
use super::graph::{AgentSpec, PhaseDefinition, PhaseGraph};
use super::limits::OrchestratorLimits;
use super::project_store::{ProjectLock, ProjectStore};

/// Drives projects through a phase graph
pub struct Orchestrator {
    graph: Arc<PhaseGraph>,
    agents: AgentRegistry,
    store: Arc<dyn ProjectStore>,
    limits: OrchestratorLimits,

    /// Settings by phase name or builtin role name
    agent_settings: HashMap<String, AgentSettings>,

    /// Cancels every project this orchestrator is driving
    cancel: CancellationToken,
}

/// What one attempt task reports back to the loop
struct AttemptReport {
    phase: String,
    attempt: u32,
    elapsed: Duration,
    result: Result<Vec<Arc<Artifact>>, PhaseError>,
}

/// Everything an attempt task needs, owned
struct AttemptJob {
    definition: PhaseDefinition,
    agent: Arc<dyn AgentAdapter>,
    inputs: ArtifactInputs,
    ctx: AgentContext,
    artifacts: Arc<ArtifactStore>,
    limits: OrchestratorLimits,
}

/// Loop-local state of one project being driven
struct ProjectRun {
    project: Project,
    artifacts: Arc<ArtifactStore>,
    brief: Arc<ProjectBrief>,
    alternates: HashMap<String, String>,
    workers: JoinSet<AttemptReport>,
    in_flight: HashSet<String>,
    token: CancellationToken,

    /// No further dispatch; only drain in-flight attempts
    halted: bool,
}

impl Orchestrator {
    /// Create an orchestrator for `graph`
    ///
    /// Fails if the graph is invalid or a phase has no agent.
    pub fn new(graph: PhaseGraph, agents: AgentRegistry, store: Arc<dyn ProjectStore>) -> Result<Self> {
        graph.validate()?;

        let missing = agents.missing_for(&graph);
        if !missing.is_empty() {
            anyhow::bail!("No agent registered for phase(s): {}", missing.join(", "));
        }

        Ok(Self {
            graph: Arc::new(graph),
            agents,
            store,
            limits: OrchestratorLimits::default(),
            agent_settings: HashMap::new(),
            cancel: CancellationToken::new(),
        })
    }

    pub fn with_limits(mut self, limits: OrchestratorLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_agent_settings(mut self, settings: HashMap<String, AgentSettings>) -> Self {
        self.agent_settings = settings;
        self
    }

    pub fn graph(&self) -> &PhaseGraph {
        &self.graph
    }

    pub fn limits(&self) -> &OrchestratorLimits {
        &self.limits
    }

    /// Token that aborts every project this orchestrator drives
    ///
    /// Once cancelled, later runs on this orchestrator abort immediately.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Start a new project for `brief` and drive it to a terminal status
    #[instrument(skip(self, brief), fields(project = %brief.name, graph = %self.graph.name))]
    pub async fn start_project(&self, brief: ProjectBrief) -> Result<ProjectStatusSnapshot> {
        self.start_project_with_seeds(brief, ArtifactOutputs::new()).await
    }

    /// Start a project, supplying payloads for seed types beyond the brief
    pub async fn start_project_with_seeds(
        &self,
        brief: ProjectBrief,
        mut seeds: ArtifactOutputs,
    ) -> Result<ProjectStatusSnapshot> {
        brief.validate().context("Invalid project brief")?;

        let brief_type = ArtifactType::new(ArtifactType::PROJECT_BRIEF);
        if self.graph.seeds.contains(&brief_type) && !seeds.contains_key(&brief_type) {
            let payload = serde_json::to_value(&brief).context("Failed to serialize project brief")?;
            seeds.insert(brief_type, payload);
        }
        if let Some(invalid) = seeds.keys().find(|ty| !ty.is_valid()) {
            anyhow::bail!(
                "Invalid seed artifact type '{}' (use letters, digits, '_' and '-')",
                invalid
            );
        }
        let missing: Vec<String> = self
            .graph
            .seeds
            .iter()
            .filter(|ty| !seeds.contains_key(*ty))
            .map(ToString::to_string)
            .collect();
        if !missing.is_empty() {
            anyhow::bail!("Missing seed artifact(s): {}", missing.join(", "));
        }

        let project_id = Uuid::new_v4();
        let lock = self.store.lock(project_id)?;
        info!(%project_id, "Starting project");

        let mut project = Project::new(
            project_id,
            brief,
            self.graph.name.clone(),
            self.graph.phase_names().map(str::to_string),
        );
        project.overall_status = OverallStatus::InProgress;

        let artifacts = self.open_artifacts(project_id).await?;

        let summary = format!("Project '{}' started on graph '{}'", project.brief.name, self.graph.name);
        self.record(
            &mut project,
            Event::project(project_id, EventType::ProjectStarted, summary),
        )
        .await?;

        for (artifact_type, payload) in seeds {
            let artifact = artifacts
                .put(SEED_PHASE, artifact_type, payload)
                .await
                .context("Failed to store seed artifact")?;
            let summary = format!("Seeded {} v{}", artifact.artifact_type, artifact.version);
            project.record_artifact((*artifact).clone());
            self.record(
                &mut project,
                Event::project(project_id, EventType::ArtifactStored, summary),
            )
            .await?;
        }

        self.drive(project, artifacts, lock).await
    }

    /// Resume a persisted project from its last checkpoint
    ///
    /// Completed phases never run again. An attempt that was in flight when
    /// the checkpoint was written is dispatched once more. An aborted project
    /// gets its uncovered failed phases back with a fresh attempt budget.
    #[instrument(skip(self), fields(graph = %self.graph.name))]
    pub async fn resume_project(&self, project_id: Uuid) -> Result<ProjectStatusSnapshot> {
        let snapshot = self
            .store
            .load(project_id)
            .await?
            .with_context(|| format!("Project {} not found", project_id))?;
        let mut project = snapshot.project;

        if project.graph_name != self.graph.name {
            anyhow::bail!(
                "Project {} runs graph '{}', not '{}'",
                project_id,
                project.graph_name,
                self.graph.name
            );
        }
        let expected: Vec<&str> = self.graph.phase_names().collect();
        let actual: Vec<&str> = project
            .phase_instances
            .iter()
            .map(|p| p.phase_name.as_str())
            .collect();
        if expected != actual {
            anyhow::bail!(
                "Project {} has phases [{}] but graph '{}' declares [{}]",
                project_id,
                actual.join(", "),
                self.graph.name,
                expected.join(", ")
            );
        }

        if project.overall_status == OverallStatus::Completed {
            info!(%project_id, "Project already completed");
            return Ok(project.status_snapshot(&self.graph.alternates()));
        }

        let lock = self.store.lock(project_id)?;
        self.store.clear_cancel(project_id).await?;

        let alternates = self.graph.alternates();
        let was_aborted = project.overall_status == OverallStatus::Aborted;
        let covered: HashSet<String> = project
            .phase_instances
            .iter()
            .filter(|p| project.failure_covered(&p.phase_name, &alternates))
            .map(|p| p.phase_name.clone())
            .collect();
        for phase in &mut project.phase_instances {
            let reset_failed = was_aborted && !covered.contains(&phase.phase_name);
            phase.rearm_for_resume(reset_failed);
        }
        project.abort_reason = None;
        project.finished_at = None;
        project.overall_status = OverallStatus::InProgress;

        info!(%project_id, was_aborted, "Resuming project");
        let summary = format!("Project '{}' resumed", project.brief.name);
        self.record(
            &mut project,
            Event::project(project_id, EventType::ProjectResumed, summary),
        )
        .await?;

        let artifacts = self.open_artifacts(project_id).await?;
        self.drive(project, artifacts, lock).await
    }

    /// Read-only status of a stored project
    pub async fn status(&self, project_id: Uuid) -> Result<ProjectStatusSnapshot> {
        let snapshot = self
            .store
            .load(project_id)
            .await?
            .with_context(|| format!("Project {} not found", project_id))?;
        Ok(snapshot.project.status_snapshot(&self.graph.alternates()))
    }

    /// Stored projects, most recently created first
    pub async fn list_projects(&self, limit: usize) -> Result<Vec<ProjectStatusSnapshot>> {
        let alternates = self.graph.alternates();
        let mut projects = Vec::new();
        for project_id in self.store.list().await? {
            match self.store.load(project_id).await {
                Ok(Some(snapshot)) => projects.push(snapshot.project.status_snapshot(&alternates)),
                Ok(None) => {}
                Err(e) => warn!(%project_id, error = %e, "Skipping unreadable project"),
            }
        }

        projects.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        projects.truncate(limit);
        Ok(projects)
    }

    /// Ask whichever orchestrator is driving the project to abort it
    pub async fn cancel_project(&self, project_id: Uuid) -> Result<()> {
        self.store.request_cancel(project_id).await?;
        info!(%project_id, "Cancel requested");
        Ok(())
    }

    async fn open_artifacts(&self, project_id: Uuid) -> Result<Arc<ArtifactStore>> {
        let dir = self.store.artifacts_dir(project_id);
        let store = ArtifactStore::open(&dir)
            .await
            .with_context(|| format!("Failed to open artifact store: {}", dir.display()))?;
        Ok(Arc::new(store))
    }

    /// The scheduling loop
    async fn drive(
        &self,
        project: Project,
        artifacts: Arc<ArtifactStore>,
        _lock: ProjectLock,
    ) -> Result<ProjectStatusSnapshot> {
        let project_id = project.project_id;
        let started = Instant::now();
        let deadline = tokio::time::Instant::now()
            .checked_add(self.limits.project_timeout())
            .unwrap_or_else(far_future);

        let mut run = ProjectRun {
            brief: Arc::new(project.brief.clone()),
            project,
            artifacts,
            alternates: self.graph.alternates(),
            workers: JoinSet::new(),
            in_flight: HashSet::new(),
            token: self.cancel.child_token(),
            halted: false,
        };

        let mut cancel_poll = tokio::time::interval(self.limits.cancel_poll_interval());
        cancel_poll.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            if !run.halted {
                if let Err(violation) = self.limits.check_deadline(started) {
                    self.abort(&mut run, violation.to_string(), true).await?;
                }
            }

            if !run.halted {
                self.promote(&mut run).await?;
                self.dispatch(&mut run).await?;
                self.update_overall(&mut run).await?;
            }

            if run.workers.is_empty() {
                if run.halted {
                    break;
                }
                let has_ready = run
                    .project
                    .phase_instances
                    .iter()
                    .any(|p| p.status == PhaseStatus::Ready);
                if !has_ready {
                    let waiting: Vec<&str> = run
                        .project
                        .phase_instances
                        .iter()
                        .filter(|p| !p.status.is_terminal())
                        .map(|p| p.phase_name.as_str())
                        .collect();
                    let reason = format!(
                        "No phase can make progress; waiting: {}",
                        waiting.join(", ")
                    );
                    self.abort(&mut run, reason, false).await?;
                    break;
                }
            }

            let wake = if run.halted || run.workers.len() >= self.limits.worker_slots() {
                None
            } else {
                next_retry_at(&run.project)
            };
            let wake_at = wake.map(instant_at).unwrap_or_else(far_future);

            tokio::select! {
                joined = run.workers.join_next(), if !run.workers.is_empty() => {
                    if let Some(joined) = joined {
                        let report = joined.context("Phase attempt task panicked")?;
                        self.handle_report(&mut run, report).await?;
                    }
                }
                _ = run.token.cancelled(), if !run.halted => {
                    self.abort(&mut run, "Cancelled".to_string(), true).await?;
                }
                _ = tokio::time::sleep_until(wake_at), if wake.is_some() => {}
                _ = tokio::time::sleep_until(deadline), if !run.halted => {}
                _ = cancel_poll.tick(), if !run.halted => {
                    if self.store.cancel_requested(project_id).await? {
                        self.abort(&mut run, "Cancel requested".to_string(), true).await?;
                        self.store.clear_cancel(project_id).await?;
                    }
                }
            }
        }

        let status = run.project.overall_status;
        match status {
            OverallStatus::Completed => info!(
                %project_id,
                duration_ms = started.elapsed().as_millis() as u64,
                "Project completed"
            ),
            _ => error!(
                %project_id,
                status = %status,
                reason = run.project.abort_reason.as_deref().unwrap_or("unknown"),
                "Project did not complete"
            ),
        }

        Ok(run.project.status_snapshot(&run.alternates))
    }

    /// Move Pending phases to Ready once their inputs exist, and settle
    /// alternates whose primary no longer needs them
    async fn promote(&self, run: &mut ProjectRun) -> Result<()> {
        let project_id = run.project.project_id;

        for definition in &self.graph.phases {
            if run.project.phase_status(&definition.name) != Some(PhaseStatus::Pending) {
                continue;
            }

            if let Some(primary) = &definition.alternate_for {
                match run.project.phase_status(primary) {
                    Some(PhaseStatus::Completed) | Some(PhaseStatus::Skipped) => {
                        self.transition(run, &definition.name, PhaseStatus::Skipped)?;
                        debug!(phase = %definition.name, %primary, "Alternate not needed");
                        self.record(
                            &mut run.project,
                            Event::phase(
                                project_id,
                                &definition.name,
                                EventType::PhaseSkipped,
                                PhaseStatus::Skipped,
                                format!("Alternate '{}' skipped; '{}' succeeded", definition.name, primary),
                            ),
                        )
                        .await?;
                        continue;
                    }
                    Some(PhaseStatus::Failed) => {}
                    _ => continue,
                }
            }

            if !definition.requires.iter().all(|ty| run.project.has_artifact(ty)) {
                continue;
            }

            self.transition(run, &definition.name, PhaseStatus::Ready)?;
            debug!(phase = %definition.name, "Phase ready");
            self.record(
                &mut run.project,
                Event::phase(
                    project_id,
                    &definition.name,
                    EventType::PhaseReady,
                    PhaseStatus::Ready,
                    format!("Phase '{}' ready", definition.name),
                ),
            )
            .await?;
        }

        Ok(())
    }

    /// Start attempts for ready phases in declaration order, up to the
    /// worker pool size
    async fn dispatch(&self, run: &mut ProjectRun) -> Result<()> {
        let project_id = run.project.project_id;
        let now = Utc::now();

        for definition in &self.graph.phases {
            if run.workers.len() >= self.limits.worker_slots() {
                break;
            }
            if run.in_flight.contains(&definition.name) {
                continue;
            }
            let dispatchable = run
                .project
                .phase(&definition.name)
                .is_some_and(|p| p.is_dispatchable(now));
            if !dispatchable {
                continue;
            }

            let missing: Vec<ArtifactType> = definition
                .requires
                .iter()
                .filter(|ty| !run.project.has_artifact(ty))
                .cloned()
                .collect();
            if !missing.is_empty() {
                let signal = PhaseError::NotReady(missing);
                warn!(phase = %definition.name, %signal, "Ready phase lost an input");
                continue;
            }

            let inputs: ArtifactInputs = definition
                .requires
                .iter()
                .filter_map(|ty| {
                    run.project
                        .artifacts
                        .get(ty)
                        .map(|a| (ty.clone(), Arc::new(a.clone())))
                })
                .collect();

            let agent = self
                .agents
                .get(&definition.name)
                .with_context(|| format!("No agent registered for phase '{}'", definition.name))?;

            self.transition(run, &definition.name, PhaseStatus::Running)?;
            let attempt = run
                .project
                .phase(&definition.name)
                .map_or(1, |p| p.attempt_count);

            info!(
                %project_id,
                phase = %definition.name,
                attempt,
                agent = agent.name(),
                "Dispatching phase"
            );
            self.record(
                &mut run.project,
                Event::phase(
                    project_id,
                    &definition.name,
                    EventType::PhaseStarted,
                    PhaseStatus::Running,
                    format!("Phase '{}' attempt {}", definition.name, attempt),
                )
                .with_attempt(attempt),
            )
            .await?;

            let ctx = AgentContext {
                project_id,
                phase: definition.name.clone(),
                attempt,
                outputs: definition.produces.iter().cloned().collect(),
                brief: run.brief.clone(),
                settings: self.settings_for(definition),
                cancel: run.token.child_token(),
            };
            let job = AttemptJob {
                definition: definition.clone(),
                agent,
                inputs,
                ctx,
                artifacts: run.artifacts.clone(),
                limits: self.limits.clone(),
            };

            run.in_flight.insert(definition.name.clone());
            run.workers.spawn(run_attempt(job));
        }

        Ok(())
    }

    /// Fold a finished attempt into the project
    async fn handle_report(&self, run: &mut ProjectRun, report: AttemptReport) -> Result<()> {
        let project_id = run.project.project_id;
        let definition = self
            .graph
            .get(&report.phase)
            .with_context(|| format!("Report for unknown phase '{}'", report.phase))?;
        run.in_flight.remove(&report.phase);
        let duration_ms = report.elapsed.as_millis() as u64;

        match report.result {
            Ok(stored) => {
                for artifact in stored {
                    let summary = format!(
                        "Stored {} v{} from '{}'",
                        artifact.artifact_type, artifact.version, report.phase
                    );
                    run.project.record_artifact((*artifact).clone());
                    self.record(
                        &mut run.project,
                        Event::phase(
                            project_id,
                            &report.phase,
                            EventType::ArtifactStored,
                            PhaseStatus::Running,
                            summary,
                        )
                        .with_attempt(report.attempt),
                    )
                    .await?;
                }

                self.transition(run, &report.phase, PhaseStatus::Completed)?;
                if let Some(phase) = run.project.phase_mut(&report.phase) {
                    phase.error_detail = None;
                }
                info!(
                    %project_id,
                    phase = %report.phase,
                    attempt = report.attempt,
                    duration_ms,
                    "Phase completed"
                );
                self.record(
                    &mut run.project,
                    Event::phase(
                        project_id,
                        &report.phase,
                        EventType::PhaseCompleted,
                        PhaseStatus::Completed,
                        format!("Phase '{}' completed in {}ms", report.phase, duration_ms),
                    )
                    .with_attempt(report.attempt)
                    .with_duration(duration_ms),
                )
                .await?;
            }
            Err(failure) => {
                let result: Result<(), PhaseError> = Err(failure.clone());
                let outcome = AttemptOutcome::from(&result);
                let next = settle(outcome, report.attempt, definition.max_retries);

                if let Some(phase) = run.project.phase_mut(&report.phase) {
                    phase.error_detail = Some(failure.clone());
                }

                if outcome == AttemptOutcome::Retryable {
                    self.transition(run, &report.phase, PhaseStatus::TransientlyFailed)?;
                    self.record(
                        &mut run.project,
                        Event::phase(
                            project_id,
                            &report.phase,
                            EventType::PhaseTransientlyFailed,
                            PhaseStatus::TransientlyFailed,
                            format!("Phase '{}' attempt {} failed", report.phase, report.attempt),
                        )
                        .with_attempt(report.attempt)
                        .with_duration(duration_ms)
                        .with_error(failure.to_string()),
                    )
                    .await?;
                }

                if next == PhaseStatus::Ready {
                    let delay = definition.retry_policy.delay_for_attempt(report.attempt);
                    self.transition(run, &report.phase, PhaseStatus::Ready)?;
                    if let Some(phase) = run.project.phase_mut(&report.phase) {
                        phase.retry_at = Some(Utc::now() + chrono_delay(delay));
                    }
                    warn!(
                        %project_id,
                        phase = %report.phase,
                        attempt = report.attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %failure,
                        "Phase failed, retrying"
                    );
                    self.record(
                        &mut run.project,
                        Event::phase(
                            project_id,
                            &report.phase,
                            EventType::PhaseRetrying,
                            PhaseStatus::Ready,
                            format!("Phase '{}' retrying in {:?}", report.phase, delay),
                        )
                        .with_attempt(report.attempt),
                    )
                    .await?;
                } else {
                    self.transition(run, &report.phase, PhaseStatus::Failed)?;
                    error!(
                        %project_id,
                        phase = %report.phase,
                        attempt = report.attempt,
                        error = %failure,
                        "Phase failed permanently"
                    );
                    self.record(
                        &mut run.project,
                        Event::phase(
                            project_id,
                            &report.phase,
                            EventType::PhaseFailed,
                            PhaseStatus::Failed,
                            format!(
                                "Phase '{}' failed after {} attempt(s)",
                                report.phase, report.attempt
                            ),
                        )
                        .with_attempt(report.attempt)
                        .with_duration(duration_ms)
                        .with_error(failure.to_string()),
                    )
                    .await?;
                }
            }
        }

        // An unrecoverable failure must stop dispatch before the next pass
        self.update_overall(run).await
    }

    /// Recompute the overall status, halting on a terminal one
    async fn update_overall(&self, run: &mut ProjectRun) -> Result<()> {
        let before = run.project.overall_status;
        let after = run.project.refresh_status(&run.alternates);
        if after.is_terminal() {
            run.halted = true;
        }
        if before == after {
            return Ok(());
        }

        let project_id = run.project.project_id;
        let event = match after {
            OverallStatus::Completed => Some(Event::project(
                project_id,
                EventType::ProjectCompleted,
                format!("Project '{}' completed", run.project.brief.name),
            )),
            OverallStatus::Aborted => {
                let reason = run
                    .project
                    .abort_reason
                    .clone()
                    .unwrap_or_else(|| "unknown".to_string());
                Some(
                    Event::project(project_id, EventType::ProjectAborted, "Project aborted")
                        .with_error(reason),
                )
            }
            OverallStatus::PhaseFailed => Some(Event::project(
                project_id,
                EventType::ProjectPhaseFailed,
                "A phase failed; waiting on its alternate",
            )),
            OverallStatus::NotStarted | OverallStatus::InProgress => None,
        };

        match event {
            Some(event) => self.record(&mut run.project, event).await,
            None => self.save(&mut run.project).await,
        }
    }

    /// Abort the project; `cancel_in_flight` also cancels running attempts
    async fn abort(&self, run: &mut ProjectRun, reason: String, cancel_in_flight: bool) -> Result<()> {
        warn!(project_id = %run.project.project_id, %reason, "Aborting project");
        if run.project.abort_reason.is_none() {
            run.project.abort_reason = Some(reason);
        }
        if cancel_in_flight {
            run.token.cancel();
        }
        self.update_overall(run).await
    }

    fn transition(&self, run: &mut ProjectRun, phase: &str, next: PhaseStatus) -> Result<()> {
        run.project
            .phase_mut(phase)
            .with_context(|| format!("Unknown phase '{}'", phase))?
            .transition(next)?;
        Ok(())
    }

    fn settings_for(&self, definition: &PhaseDefinition) -> AgentSettings {
        let by_role = match &definition.agent {
            AgentSpec::Builtin(role) => self.agent_settings.get(role.as_str()),
            _ => None,
        };
        self.agent_settings
            .get(&definition.name)
            .or(by_role)
            .cloned()
            .unwrap_or_default()
    }

    /// Checkpoint: log the transition, then persist the snapshot
    async fn record(&self, project: &mut Project, event: Event) -> Result<()> {
        self.store
            .append_event(&event)
            .await
            .with_context(|| format!("Failed to log event for project {}", project.project_id))?;
        self.save(project).await
    }

    async fn save(&self, project: &mut Project) -> Result<()> {
        project.touch();
        self.store
            .save(&ProjectSnapshot::of(project))
            .await
            .with_context(|| format!("Failed to checkpoint project {}", project.project_id))
    }
}

/// Run one attempt: invoke the agent under the phase timeout, validate its
/// outputs, and persist them
async fn run_attempt(job: AttemptJob) -> AttemptReport {
    let started = Instant::now();
    let phase = job.definition.name.clone();
    let attempt = job.ctx.attempt;
    let result = execute_attempt(job).await;

    AttemptReport {
        phase,
        attempt,
        elapsed: started.elapsed(),
        result,
    }
}

async fn execute_attempt(job: AttemptJob) -> Result<Vec<Arc<Artifact>>, PhaseError> {
    let AttemptJob {
        definition,
        agent,
        inputs,
        ctx,
        artifacts,
        limits,
    } = job;

    let limit = definition.timeout();
    let cancel = ctx.cancel.clone();
    let mut handle = tokio::spawn(async move { agent.execute(&inputs, &ctx).await });

    let waited = tokio::select! {
        joined = tokio::time::timeout(limit, &mut handle) => Some(joined),
        _ = cancel.cancelled() => None,
    };

    let outcome = match waited {
        Some(Ok(Ok(outcome))) => outcome,
        Some(Ok(Err(join_error))) => {
            return Err(PhaseError::Fatal(format!("Agent task failed: {}", join_error)));
        }
        Some(Err(_elapsed)) => {
            cancel.cancel();
            handle.abort();
            return Err(PhaseError::timeout(limit));
        }
        None => {
            handle.abort();
            return Err(PhaseError::Cancelled);
        }
    };

    let mut outputs = outcome.into_result()?;

    let missing: Vec<String> = definition
        .produces
        .iter()
        .filter(|ty| !outputs.contains_key(*ty))
        .map(ToString::to_string)
        .collect();
    if !missing.is_empty() {
        return Err(PhaseError::Transient(format!(
            "Agent did not produce declared output(s): {}",
            missing.join(", ")
        )));
    }

    outputs.retain(|ty, _| {
        let declared = definition.produces.contains(ty);
        if !declared {
            warn!(phase = %definition.name, artifact_type = %ty, "Ignoring undeclared output");
        }
        declared
    });

    for (ty, payload) in &outputs {
        limits
            .validate_payload(payload_size(payload))
            .map_err(|violation| PhaseError::Fatal(format!("Output '{}': {}", ty, violation)))?;
    }

    let mut stored = Vec::with_capacity(outputs.len());
    for (ty, payload) in outputs {
        let artifact = artifacts
            .put(&definition.name, ty, payload)
            .await
            .map_err(|e| PhaseError::StoreWrite(e.to_string()))?;
        stored.push(artifact);
    }

    Ok(stored)
}

/// Earliest pending retry among Ready phases
fn next_retry_at(project: &Project) -> Option<DateTime<Utc>> {
    project
        .phase_instances
        .iter()
        .filter(|p| p.status == PhaseStatus::Ready)
        .filter_map(|p| p.retry_at)
        .min()
}

fn instant_at(at: DateTime<Utc>) -> tokio::time::Instant {
    let delay = (at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
    tokio::time::Instant::now() + delay
}

fn far_future() -> tokio::time::Instant {
    tokio::time::Instant::now() + Duration::from_secs(86400 * 365)
}

fn chrono_delay(delay: Duration) -> chrono::Duration {
    chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero())
}

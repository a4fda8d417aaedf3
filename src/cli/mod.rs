//! Command-line interface for swarm-forge.
//!
//! Provides commands for starting projects, checking status, listing
//! projects, resuming or cancelling them, and inspecting their events and
//! artifacts.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tracing::warn;
use uuid::Uuid;

use crate::adapters::AgentRegistry;
use crate::config::{self, ResolvedConfig};
use crate::core::{ArtifactStore, FileProjectStore, Orchestrator, PhaseGraph, ProjectStore};
use crate::domain::{ArtifactType, OverallStatus, ProjectBrief, ProjectStatusSnapshot, ProjectType};

/// forge - Agent pipeline orchestrator
#[derive(Parser, Debug)]
#[command(name = "forge")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start a new project and run it to completion
    Run {
        /// Project name (letters, digits, '_' and '-')
        name: String,

        /// What the project should do
        #[arg(short, long)]
        description: String,

        /// Project type
        #[arg(short = 't', long = "type", value_enum, default_value = "web")]
        project_type: ProjectTypeArg,

        /// Features (comma-separated or repeated)
        #[arg(short, long, value_delimiter = ',')]
        features: Vec<String>,

        /// Technical requirement as key=value (repeatable)
        #[arg(long = "tech", value_parser = parse_key_value)]
        technical_requirements: Vec<(String, String)>,

        /// Phase graph file (overrides configuration)
        #[arg(short, long, env = "FORGE_GRAPH")]
        graph: Option<PathBuf>,
    },

    /// Show the status of a project
    Status {
        /// Project ID (UUID)
        project_id: String,
    },

    /// List recent projects
    Projects {
        /// Maximum number of projects to show
        #[arg(short, long, default_value = "10")]
        limit: usize,
    },

    /// Resume an interrupted or aborted project
    Resume {
        /// Project ID to resume
        project_id: String,

        /// Phase graph file (must be the graph the project started with)
        #[arg(short, long, env = "FORGE_GRAPH")]
        graph: Option<PathBuf>,
    },

    /// Ask a running project to stop
    Cancel {
        /// Project ID to cancel
        project_id: String,
    },

    /// Show the transition log of a project
    Events {
        /// Project ID
        project_id: String,
    },

    /// List artifacts of a project, or show one type's history
    Artifacts {
        /// Project ID
        project_id: String,

        /// Artifact type to show
        artifact_type: Option<String>,

        /// Show a specific version instead of the latest
        #[arg(short, long)]
        version: Option<u32>,
    },

    /// Show the phase graph and its execution order
    Graph {
        /// Phase graph file (overrides configuration)
        #[arg(short, long, env = "FORGE_GRAPH")]
        graph: Option<PathBuf>,
    },

    /// Show resolved configuration (debug)
    Config,
}

/// Project type for CLI (maps to ProjectType)
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum ProjectTypeArg {
    Web,
    Mobile,
    Cli,
    Desktop,
}

impl From<ProjectTypeArg> for ProjectType {
    fn from(t: ProjectTypeArg) -> Self {
        match t {
            ProjectTypeArg::Web => ProjectType::Web,
            ProjectTypeArg::Mobile => ProjectType::Mobile,
            ProjectTypeArg::Cli => ProjectType::Cli,
            ProjectTypeArg::Desktop => ProjectType::Desktop,
        }
    }
}

fn parse_key_value(s: &str) -> Result<(String, String), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got '{}'", s))?;
    Ok((key.trim().to_string(), value.trim().to_string()))
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(self) -> Result<()> {
        match self.command {
            Commands::Run {
                name,
                description,
                project_type,
                features,
                technical_requirements,
                graph,
            } => {
                let mut brief = ProjectBrief::new(name, description).with_features(
                    features.into_iter().map(|f| f.trim().to_string()).filter(|f| !f.is_empty()),
                );
                brief.project_type = project_type.into();
                brief.technical_requirements = technical_requirements.into_iter().collect();
                run_project(brief, graph).await
            }
            Commands::Status { project_id } => show_status(&project_id).await,
            Commands::Projects { limit } => list_projects(limit).await,
            Commands::Resume { project_id, graph } => resume_project(&project_id, graph).await,
            Commands::Cancel { project_id } => cancel_project(&project_id).await,
            Commands::Events { project_id } => show_events(&project_id).await,
            Commands::Artifacts {
                project_id,
                artifact_type,
                version,
            } => show_artifacts(&project_id, artifact_type, version).await,
            Commands::Graph { graph } => show_graph(graph),
            Commands::Config => show_config(),
        }
    }
}

fn parse_project_id(s: &str) -> Result<Uuid> {
    Uuid::parse_str(s).with_context(|| format!("Invalid project ID: {}", s))
}

fn load_graph(cfg: &ResolvedConfig, graph: Option<PathBuf>) -> Result<PhaseGraph> {
    match graph {
        Some(path) => PhaseGraph::from_file(&path),
        None => cfg.load_graph(),
    }
}

/// Orchestrator wired from configuration
fn build_orchestrator(graph: Option<PathBuf>) -> Result<Orchestrator> {
    let cfg = config::config()?;
    let graph = load_graph(cfg, graph)?;
    let agents = AgentRegistry::from_graph(&graph);
    let store = Arc::new(FileProjectStore::new(cfg.projects.clone()));

    Ok(Orchestrator::new(graph, agents, store)?
        .with_limits(cfg.limits.clone())
        .with_agent_settings(cfg.agents.clone()))
}

/// Cancel the orchestrator's projects on Ctrl-C
fn cancel_on_ctrl_c(orchestrator: &Orchestrator) {
    let token = orchestrator.cancel_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling project");
            token.cancel();
        }
    });
}

/// Print the outcome of a run and exit non-zero if it aborted
fn finish(snapshot: &ProjectStatusSnapshot) {
    print_status(snapshot);
    match snapshot.overall_status {
        OverallStatus::Completed => {
            eprintln!("\n[Project {} completed successfully]", snapshot.project_id);
        }
        _ => {
            eprintln!(
                "\n[Project {} {}: {}]",
                snapshot.project_id,
                snapshot.overall_status,
                snapshot.abort_reason.as_deref().unwrap_or("unknown reason")
            );
            eprintln!("[Resume with: forge resume {}]", snapshot.project_id);
            std::process::exit(1);
        }
    }
}

async fn run_project(brief: ProjectBrief, graph: Option<PathBuf>) -> Result<()> {
    let orchestrator = build_orchestrator(graph)?;
    cancel_on_ctrl_c(&orchestrator);

    let snapshot = orchestrator.start_project(brief).await?;
    finish(&snapshot);
    Ok(())
}

async fn resume_project(project_id: &str, graph: Option<PathBuf>) -> Result<()> {
    let project_id = parse_project_id(project_id)?;
    let orchestrator = build_orchestrator(graph)?;
    cancel_on_ctrl_c(&orchestrator);

    let snapshot = orchestrator.resume_project(project_id).await?;
    finish(&snapshot);
    Ok(())
}

async fn cancel_project(project_id: &str) -> Result<()> {
    let project_id = parse_project_id(project_id)?;
    let orchestrator = build_orchestrator(None)?;

    orchestrator.cancel_project(project_id).await?;
    println!("Cancel requested for project {}", project_id);
    Ok(())
}

async fn show_status(project_id: &str) -> Result<()> {
    let project_id = parse_project_id(project_id)?;
    let orchestrator = build_orchestrator(None)?;

    print_status(&orchestrator.status(project_id).await?);
    Ok(())
}

fn print_status(snapshot: &ProjectStatusSnapshot) {
    println!("Project ID: {}", snapshot.project_id);
    println!("Name: {}", snapshot.name);
    println!("Graph: {}", snapshot.graph_name);
    println!("Status: {}", snapshot.overall_status);
    println!("Created: {}", snapshot.created_at);
    if let Some(finished) = snapshot.finished_at {
        println!("Finished: {}", finished);
    }
    if let Some(phase) = &snapshot.failed_phase {
        println!("Failed phase: {}", phase);
    }
    if let Some(reason) = &snapshot.abort_reason {
        println!("Reason: {}", reason);
    }

    println!("\n{:<22} {:<20} {:<8} {}", "PHASE", "STATUS", "ATTEMPTS", "LAST ERROR");
    println!("{}", "-".repeat(75));
    for phase in &snapshot.phases {
        let error = phase
            .error_detail
            .as_ref()
            .map(|e| e.to_string())
            .unwrap_or_default();
        println!(
            "{:<22} {:<20} {:<8} {}",
            phase.phase_name,
            format!("{:?}", phase.status),
            phase.attempt_count,
            error
        );
    }

    if !snapshot.artifacts.is_empty() {
        println!("\nArtifacts:");
        for (artifact_type, version) in &snapshot.artifacts {
            println!("  {} (v{})", artifact_type, version);
        }
    }
}

async fn list_projects(limit: usize) -> Result<()> {
    let orchestrator = build_orchestrator(None)?;
    let projects = orchestrator.list_projects(limit).await?;

    if projects.is_empty() {
        println!("No projects found");
        return Ok(());
    }

    println!("{:<38} {:<20} {:<14} {}", "PROJECT ID", "NAME", "STATUS", "CREATED");
    println!("{}", "-".repeat(95));

    for project in projects {
        println!(
            "{:<38} {:<20} {:<14} {}",
            project.project_id,
            project.name,
            project.overall_status.to_string(),
            project.created_at.format("%Y-%m-%d %H:%M:%S")
        );
    }

    Ok(())
}

/// Store for commands that only read project files
fn project_store() -> Result<FileProjectStore> {
    FileProjectStore::from_config()
}

async fn show_events(project_id: &str) -> Result<()> {
    let project_id = parse_project_id(project_id)?;
    let store = project_store()?;
    let events = store.events(project_id).await?;

    if events.is_empty() {
        println!("No events found for project {}", project_id);
        return Ok(());
    }

    for event in events {
        let phase = event.phase.as_deref().unwrap_or("-");
        let attempt = event.attempt.map(|a| format!("#{}", a)).unwrap_or_default();
        print!(
            "{} {:<26} {:<20} {:<4} {}",
            event.timestamp.format("%H:%M:%S%.3f"),
            format!("{:?}", event.event_type),
            phase,
            attempt,
            event.summary
        );
        if let Some(error) = &event.error {
            print!(" ({})", error);
        }
        println!();
    }

    Ok(())
}

async fn show_artifacts(project_id: &str, artifact_type: Option<String>, version: Option<u32>) -> Result<()> {
    let project_id = parse_project_id(project_id)?;
    let store = project_store()?;
    if store.load(project_id).await?.is_none() {
        anyhow::bail!("Project {} not found", project_id);
    }

    let artifacts = ArtifactStore::open(store.artifacts_dir(project_id)).await?;

    let Some(artifact_type) = artifact_type else {
        println!("{:<22} {:<9} {:<22} {}", "TYPE", "VERSIONS", "LAST PHASE", "DIGEST");
        println!("{}", "-".repeat(75));
        for ty in artifacts.types() {
            let history = artifacts.history(&ty);
            if let Some(latest) = history.last() {
                println!(
                    "{:<22} {:<9} {:<22} {}",
                    ty,
                    history.len(),
                    latest.phase_of_origin,
                    &latest.digest[..latest.digest.len().min(12)]
                );
            }
        }
        return Ok(());
    };

    let artifact_type = ArtifactType::new(artifact_type);
    let artifact = match version {
        Some(version) => artifacts.version(&artifact_type, version)?,
        None => artifacts.get(&artifact_type)?,
    };

    eprintln!(
        "[{} v{} from '{}' at {}]",
        artifact.artifact_type, artifact.version, artifact.phase_of_origin, artifact.created_at
    );
    println!(
        "{}",
        serde_json::to_string_pretty(&artifact.payload).context("Failed to format payload")?
    );

    Ok(())
}

fn show_graph(graph: Option<PathBuf>) -> Result<()> {
    let cfg = config::config()?;
    let graph = load_graph(cfg, graph)?;

    println!("Graph: {}", graph.name);
    if !graph.description.is_empty() {
        println!("{}", graph.description);
    }
    let seeds: Vec<&str> = graph.seeds.iter().map(ArtifactType::as_str).collect();
    println!("Seeds: {}", seeds.join(", "));
    println!();

    for (i, phase) in graph.topological_order()?.into_iter().enumerate() {
        let requires: Vec<&str> = phase.requires.iter().map(ArtifactType::as_str).collect();
        let produces: Vec<&str> = phase.produces.iter().map(ArtifactType::as_str).collect();
        println!("{}. {}", i + 1, phase.name);
        println!("   requires: {}", requires.join(", "));
        println!("   produces: {}", produces.join(", "));
        println!(
            "   attempts: {}, timeout: {:?}",
            phase.max_retries,
            phase.timeout()
        );
        if let Some(primary) = &phase.alternate_for {
            println!("   alternate for: {}", primary);
        }
    }

    Ok(())
}

fn show_config() -> Result<()> {
    let cfg = config::config()?;

    println!("swarm-forge configuration");
    println!();
    println!(
        "Config file: {}",
        cfg.config_file
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "(none - using defaults)".to_string())
    );
    println!();
    println!("Paths:");
    println!("  Home:     {}", cfg.home.display());
    println!("  Projects: {}", cfg.projects.display());
    println!(
        "  Graph:    {}",
        cfg.graph_file
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "(built-in sdlc)".to_string())
    );
    println!();
    println!("Log level: {}", cfg.log_level);
    println!();
    println!("Limits:");
    println!("  Max concurrent phases: {}", cfg.limits.max_concurrent_phases);
    println!("  Max payload size:      {} bytes", cfg.limits.max_payload_bytes);
    println!("  Project timeout:       {}s", cfg.limits.project_timeout_seconds);
    println!("  Cancel poll interval:  {}ms", cfg.limits.cancel_poll_ms);
    println!();
    println!("Agents:");
    if cfg.agents.is_empty() {
        println!("  (using defaults)");
    } else {
        let mut names: Vec<&String> = cfg.agents.keys().collect();
        names.sort();
        for name in names {
            let settings = &cfg.agents[name];
            println!(
                "  {}: model={}, temperature={}",
                name, settings.model, settings.temperature
            );
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_run_command() {
        let cli = Cli::try_parse_from([
            "forge",
            "run",
            "todo_app",
            "-d",
            "Tracks todos",
            "--type",
            "cli",
            "-f",
            "lists,reminders",
            "--tech",
            "backend=rust",
        ])
        .unwrap();

        let Commands::Run {
            name,
            project_type,
            features,
            technical_requirements,
            ..
        } = cli.command
        else {
            panic!("expected run command");
        };
        assert_eq!(name, "todo_app");
        assert!(matches!(project_type, ProjectTypeArg::Cli));
        assert_eq!(features, vec!["lists", "reminders"]);
        assert_eq!(technical_requirements, vec![("backend".to_string(), "rust".to_string())]);
    }

    #[test]
    fn test_parse_key_value() {
        assert_eq!(parse_key_value("a = b").unwrap(), ("a".to_string(), "b".to_string()));
        assert!(parse_key_value("novalue").is_err());
    }

    #[test]
    fn test_invalid_project_id() {
        assert!(parse_project_id("not-a-uuid").is_err());
    }
}

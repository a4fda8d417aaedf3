//! Configuration for swarm-forge.
//!
//! Configuration sources (highest priority first):
//! 1. Environment variables (FORGE_HOME, FORGE_PROJECTS_ROOT, FORGE_LOG_DIR, FORGE_LOG_LEVEL, FORGE_GRAPH)
//! 2. Config file (.forge/config.yaml)
//! 3. Defaults (~/.swarm-forge, embedded SDLC graph)
//!
//! Config file discovery:
//! - Searches current directory and parents for .forge/config.yaml
//! - Paths in config file are relative to the directory containing .forge/

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use serde::Deserialize;

use crate::adapters::AgentSettings;
use crate::core::{OrchestratorLimits, PhaseGraph};

/// Global cached configuration (stores Result to handle init errors)
static CONFIG: OnceLock<Result<ResolvedConfig, String>> = OnceLock::new();

const CONFIG_DIR: &str = ".forge";
const CONFIG_FILE: &str = "config.yaml";

/// Raw config file schema (matches YAML structure)
#[derive(Debug, Clone, Deserialize)]
pub struct ConfigFile {
    pub version: String,
    #[serde(default)]
    pub paths: PathsConfig,
    /// Phase graph file
    #[serde(default)]
    pub graph: Option<String>,
    #[serde(default)]
    pub log_level: Option<String>,
    #[serde(default)]
    pub limits: Option<OrchestratorLimits>,
    /// Agent settings by role or phase name
    #[serde(default)]
    pub agents: HashMap<String, AgentSettings>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PathsConfig {
    /// State directory
    pub home: Option<String>,
    /// Projects directory (defaults to <home>/projects)
    pub projects: Option<String>,
    /// Per-run debug logs (defaults to <home>/logs)
    pub logs: Option<String>,
}

/// Resolved configuration with absolute paths
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub home: PathBuf,
    pub projects: PathBuf,
    pub log_dir: PathBuf,
    /// Phase graph file; `None` means the embedded default graph
    pub graph_file: Option<PathBuf>,
    pub log_level: String,
    pub limits: OrchestratorLimits,
    pub agents: HashMap<String, AgentSettings>,
    /// Path to config file (if found)
    pub config_file: Option<PathBuf>,
}

impl ResolvedConfig {
    /// Load the configured phase graph, or the default one
    pub fn load_graph(&self) -> Result<PhaseGraph> {
        match &self.graph_file {
            Some(path) => PhaseGraph::from_file(path),
            None => PhaseGraph::default_sdlc(),
        }
    }

    /// Debug log file for a run started at `at`
    pub fn log_file(&self, at: DateTime<Local>) -> PathBuf {
        self.log_dir
            .join(format!("forge_{}.log", at.format("%Y%m%d_%H%M%S")))
    }
}

/// Find config file by searching `start` and its parents
fn find_config_file(start: &Path) -> Option<PathBuf> {
    let mut current = start.to_path_buf();

    loop {
        let config_path = current.join(CONFIG_DIR).join(CONFIG_FILE);
        if config_path.exists() {
            return Some(config_path);
        }

        if !current.pop() {
            break;
        }
    }

    None
}

/// Load and parse config file
fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Resolve a path that may be relative to the config file's project root
fn resolve_path(base: &Path, path_str: &str) -> PathBuf {
    let path = PathBuf::from(path_str);
    if path.is_absolute() {
        path
    } else {
        base.join(path)
            .canonicalize()
            .unwrap_or_else(|_| base.join(path_str))
    }
}

/// Merge defaults, the config file and environment overrides
fn resolve(
    default_home: PathBuf,
    file: Option<(PathBuf, ConfigFile)>,
    env: impl Fn(&str) -> Option<String>,
) -> Result<ResolvedConfig> {
    let (config_file, file) = match file {
        Some((path, file)) => (Some(path), Some(file)),
        None => (None, None),
    };

    // Base directory is the parent of .forge/
    let base_dir = config_file
        .as_deref()
        .and_then(Path::parent)
        .and_then(Path::parent)
        .unwrap_or(Path::new("."))
        .to_path_buf();
    let from_file = |pick: fn(&ConfigFile) -> Option<&String>| {
        file.as_ref().and_then(pick).map(|p| resolve_path(&base_dir, p))
    };

    let home = env("FORGE_HOME")
        .map(PathBuf::from)
        .or_else(|| from_file(|f| f.paths.home.as_ref()))
        .unwrap_or(default_home);

    let projects = env("FORGE_PROJECTS_ROOT")
        .map(PathBuf::from)
        .or_else(|| from_file(|f| f.paths.projects.as_ref()))
        .unwrap_or_else(|| home.join("projects"));

    let log_dir = env("FORGE_LOG_DIR")
        .map(PathBuf::from)
        .or_else(|| from_file(|f| f.paths.logs.as_ref()))
        .unwrap_or_else(|| home.join("logs"));

    let graph_file = env("FORGE_GRAPH")
        .map(PathBuf::from)
        .or_else(|| from_file(|f| f.graph.as_ref()));

    let log_level = env("FORGE_LOG_LEVEL")
        .or_else(|| file.as_ref().and_then(|f| f.log_level.clone()))
        .unwrap_or_else(|| "info".to_string());

    let (limits, agents) = match file {
        Some(file) => (file.limits.unwrap_or_default(), file.agents),
        None => (OrchestratorLimits::default(), HashMap::new()),
    };

    for (name, settings) in &agents {
        settings
            .validate()
            .with_context(|| format!("Invalid settings for agent '{}'", name))?;
    }

    Ok(ResolvedConfig {
        home,
        projects,
        log_dir,
        graph_file,
        log_level,
        limits,
        agents,
        config_file,
    })
}

/// Load configuration from all sources
fn load_config() -> Result<ResolvedConfig> {
    let default_home = dirs::home_dir()
        .context("Failed to determine home directory")?
        .join(".swarm-forge");

    let cwd = std::env::current_dir().context("Failed to determine current directory")?;
    let file = match find_config_file(&cwd) {
        Some(path) => {
            let parsed = load_config_file(&path)?;
            Some((path, parsed))
        }
        None => None,
    };

    resolve(default_home, file, |key| std::env::var(key).ok())
}

/// Get the global configuration (loads once, then cached)
pub fn config() -> Result<&'static ResolvedConfig> {
    let result = CONFIG.get_or_init(|| load_config().map_err(|e| format!("{:#}", e)));

    match result {
        Ok(config) => Ok(config),
        Err(e) => anyhow::bail!("{}", e),
    }
}

/// Force reload configuration (useful for testing)
pub fn reload_config() -> Result<ResolvedConfig> {
    load_config()
}

/// State directory
pub fn forge_home() -> Result<PathBuf> {
    Ok(config()?.home.clone())
}

/// Directory holding one subdirectory per project
pub fn projects_dir() -> Result<PathBuf> {
    Ok(config()?.projects.clone())
}

pub fn log_level() -> Result<String> {
    Ok(config()?.log_level.clone())
}

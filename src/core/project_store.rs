//! Project checkpoints and transition logs.
//!
//! The orchestrator only sees the [`ProjectStore`] trait. The file-backed
//! implementation keeps one directory per project:
//!
//! ```text
//! <root>/<project_id>/
//!   snapshot.json        latest checkpoint (atomic replace)
//!   events.jsonl         append-only transition log
//!   artifacts/           artifact versions (see ArtifactStore)
//!   .lock                held while an orchestrator drives the project
//!   cancel.requested     external cancel marker
//! ```

use std::fs::File as StdFile;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use fs2::FileExt;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use uuid::Uuid;

use crate::domain::project::SNAPSHOT_FORMAT_VERSION;
use crate::domain::{Event, ProjectSnapshot};

use super::artifact_store::write_durably;

const SNAPSHOT_FILE: &str = "snapshot.json";
const EVENTS_FILE: &str = "events.jsonl";
const LOCK_FILE: &str = ".lock";
const CANCEL_FILE: &str = "cancel.requested";

/// Persistence backend consumed by the orchestrator
#[async_trait]
pub trait ProjectStore: Send + Sync {
    /// Durably replace the project's checkpoint
    async fn save(&self, snapshot: &ProjectSnapshot) -> Result<()>;

    /// Load the latest checkpoint, if the project exists
    async fn load(&self, project_id: Uuid) -> Result<Option<ProjectSnapshot>>;

    /// IDs of all stored projects
    async fn list(&self) -> Result<Vec<Uuid>>;

    /// Append a transition to the project's log
    async fn append_event(&self, event: &Event) -> Result<()>;

    /// Replay the project's log in order
    async fn events(&self, project_id: Uuid) -> Result<Vec<Event>>;

    /// Directory holding the project's artifact versions
    fn artifacts_dir(&self, project_id: Uuid) -> PathBuf;

    /// Take exclusive ownership of a project for the lifetime of the guard
    fn lock(&self, project_id: Uuid) -> Result<ProjectLock>;

    /// Whether someone asked for the project to be cancelled
    async fn cancel_requested(&self, _project_id: Uuid) -> Result<bool> {
        Ok(false)
    }

    /// Ask a running orchestrator to cancel the project
    async fn request_cancel(&self, project_id: Uuid) -> Result<()>;

    /// Forget a previous cancel request
    async fn clear_cancel(&self, _project_id: Uuid) -> Result<()> {
        Ok(())
    }
}

/// Exclusive ownership of a project; released on drop
#[derive(Debug)]
pub struct ProjectLock {
    file: Option<StdFile>,
}

impl ProjectLock {
    /// A lock for backends that need no cross-process exclusion
    pub fn unlocked() -> Self {
        Self { file: None }
    }
}

impl Drop for ProjectLock {
    fn drop(&mut self) {
        if let Some(file) = self.file.take() {
            let _ = file.unlock();
        }
    }
}

/// File-based project store
pub struct FileProjectStore {
    root: PathBuf,
}

impl FileProjectStore {
    /// Store rooted at an explicit directory
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Store rooted at the configured projects directory
    pub fn from_config() -> Result<Self> {
        Ok(Self::new(crate::config::projects_dir()?))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory of one project
    pub fn project_dir(&self, project_id: Uuid) -> PathBuf {
        self.root.join(project_id.to_string())
    }

    fn snapshot_path(&self, project_id: Uuid) -> PathBuf {
        self.project_dir(project_id).join(SNAPSHOT_FILE)
    }

    fn events_path(&self, project_id: Uuid) -> PathBuf {
        self.project_dir(project_id).join(EVENTS_FILE)
    }

    fn cancel_path(&self, project_id: Uuid) -> PathBuf {
        self.project_dir(project_id).join(CANCEL_FILE)
    }

    async fn ensure_project_dir(&self, project_id: Uuid) -> Result<PathBuf> {
        let dir = self.project_dir(project_id);
        fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("Failed to create project directory: {}", dir.display()))?;
        Ok(dir)
    }
}

#[async_trait]
impl ProjectStore for FileProjectStore {
    async fn save(&self, snapshot: &ProjectSnapshot) -> Result<()> {
        let project_id = snapshot.project.project_id;
        let dir = self.ensure_project_dir(project_id).await?;

        let json = serde_json::to_vec_pretty(snapshot).context("Failed to serialize snapshot")?;
        write_durably(&dir.join("snapshot.json.tmp"), &dir.join(SNAPSHOT_FILE), &json)
            .await
            .with_context(|| format!("Failed to write checkpoint for project {}", project_id))?;

        Ok(())
    }

    async fn load(&self, project_id: Uuid) -> Result<Option<ProjectSnapshot>> {
        let path = self.snapshot_path(project_id);
        if !path.exists() {
            return Ok(None);
        }

        let content = fs::read_to_string(&path)
            .await
            .with_context(|| format!("Failed to read snapshot: {}", path.display()))?;
        let snapshot: ProjectSnapshot = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse snapshot: {}", path.display()))?;

        if snapshot.format_version > SNAPSHOT_FORMAT_VERSION {
            anyhow::bail!(
                "Snapshot {} has format version {}, newer than supported version {}",
                path.display(),
                snapshot.format_version,
                SNAPSHOT_FORMAT_VERSION
            );
        }

        Ok(Some(snapshot))
    }

    async fn list(&self) -> Result<Vec<Uuid>> {
        if !self.root.exists() {
            return Ok(Vec::new());
        }

        let mut projects = Vec::new();
        let mut entries = fs::read_dir(&self.root)
            .await
            .with_context(|| format!("Failed to read projects directory: {}", self.root.display()))?;

        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                if let Ok(uuid) = Uuid::parse_str(name) {
                    if entry.path().join(SNAPSHOT_FILE).exists() {
                        projects.push(uuid);
                    }
                }
            }
        }

        Ok(projects)
    }

    async fn append_event(&self, event: &Event) -> Result<()> {
        self.ensure_project_dir(event.project_id).await?;
        let path = self.events_path(event.project_id);

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .with_context(|| format!("Failed to open events file: {}", path.display()))?;

        let json = serde_json::to_string(event).context("Failed to serialize event")?;
        file.write_all(format!("{}\n", json).as_bytes())
            .await
            .context("Failed to write event")?;
        file.sync_data().await.context("Failed to sync event")?;

        Ok(())
    }

    async fn events(&self, project_id: Uuid) -> Result<Vec<Event>> {
        let path = self.events_path(project_id);
        if !path.exists() {
            return Ok(Vec::new());
        }

        let file = File::open(&path)
            .await
            .with_context(|| format!("Failed to open events file: {}", path.display()))?;

        let reader = BufReader::new(file);
        let mut lines = reader.lines();
        let mut events = Vec::new();

        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            let event: Event = serde_json::from_str(&line)
                .with_context(|| format!("Failed to parse event: {}", line))?;
            events.push(event);
        }

        Ok(events)
    }

    fn artifacts_dir(&self, project_id: Uuid) -> PathBuf {
        self.project_dir(project_id).join("artifacts")
    }

    fn lock(&self, project_id: Uuid) -> Result<ProjectLock> {
        let dir = self.project_dir(project_id);
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create project directory: {}", dir.display()))?;

        let path = dir.join(LOCK_FILE);
        let file = std::fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .with_context(|| format!("Failed to open lock file: {}", path.display()))?;

        file.try_lock_exclusive().with_context(|| {
            format!("Project {} is already being driven by another orchestrator", project_id)
        })?;

        Ok(ProjectLock { file: Some(file) })
    }

    async fn cancel_requested(&self, project_id: Uuid) -> Result<bool> {
        Ok(fs::try_exists(self.cancel_path(project_id)).await.unwrap_or(false))
    }

    async fn request_cancel(&self, project_id: Uuid) -> Result<()> {
        if !self.snapshot_path(project_id).exists() {
            anyhow::bail!("Project {} not found", project_id);
        }
        let path = self.cancel_path(project_id);
        fs::write(&path, chrono::Utc::now().to_rfc3339())
            .await
            .with_context(|| format!("Failed to write cancel marker: {}", path.display()))?;
        Ok(())
    }

    async fn clear_cancel(&self, project_id: Uuid) -> Result<()> {
        let path = self.cancel_path(project_id);
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("Failed to remove cancel marker: {}", path.display())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{EventType, PhaseStatus, Project, ProjectBrief};
    use tempfile::TempDir;

    fn sample_project() -> Project {
        Project::new(
            Uuid::new_v4(),
            ProjectBrief::new("demo", "A demo"),
            "sdlc".to_string(),
            ["product_manager", "system_architect"],
        )
    }

    #[tokio::test]
    async fn test_save_and_load_snapshot() {
        let temp = TempDir::new().unwrap();
        let store = FileProjectStore::new(temp.path());
        let mut project = sample_project();

        store.save(&ProjectSnapshot::of(&project)).await.unwrap();

        project.phase_mut("product_manager").unwrap().status = PhaseStatus::Completed;
        store.save(&ProjectSnapshot::of(&project)).await.unwrap();

        let loaded = store.load(project.project_id).await.unwrap().unwrap();
        assert_eq!(loaded.project, project);
        assert_eq!(store.list().await.unwrap(), vec![project.project_id]);
        assert!(!store.project_dir(project.project_id).join("snapshot.json.tmp").exists());
    }

    #[tokio::test]
    async fn test_load_missing_project() {
        let temp = TempDir::new().unwrap();
        let store = FileProjectStore::new(temp.path());
        assert!(store.load(Uuid::new_v4()).await.unwrap().is_none());
        assert!(store.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_event_append_and_replay_order() {
        let temp = TempDir::new().unwrap();
        let store = FileProjectStore::new(temp.path());
        let project_id = Uuid::new_v4();

        for i in 0..5 {
            let event = Event::phase(
                project_id,
                format!("phase{}", i),
                EventType::PhaseStarted,
                PhaseStatus::Running,
                format!("Phase {} started", i),
            );
            store.append_event(&event).await.unwrap();
        }

        let events = store.events(project_id).await.unwrap();
        assert_eq!(events.len(), 5);
        for (i, event) in events.iter().enumerate() {
            assert_eq!(event.phase, Some(format!("phase{}", i)));
        }
    }

    #[tokio::test]
    async fn test_lock_is_exclusive() {
        let temp = TempDir::new().unwrap();
        let store = FileProjectStore::new(temp.path());
        let project_id = Uuid::new_v4();

        let guard = store.lock(project_id).unwrap();
        assert!(store.lock(project_id).is_err());

        drop(guard);
        assert!(store.lock(project_id).is_ok());
    }

    #[tokio::test]
    async fn test_cancel_marker() {
        let temp = TempDir::new().unwrap();
        let store = FileProjectStore::new(temp.path());
        let project = sample_project();

        // Unknown project cannot be cancelled
        assert!(store.request_cancel(project.project_id).await.is_err());

        store.save(&ProjectSnapshot::of(&project)).await.unwrap();
        assert!(!store.cancel_requested(project.project_id).await.unwrap());

        store.request_cancel(project.project_id).await.unwrap();
        assert!(store.cancel_requested(project.project_id).await.unwrap());

        store.clear_cancel(project.project_id).await.unwrap();
        assert!(!store.cancel_requested(project.project_id).await.unwrap());
        store.clear_cancel(project.project_id).await.unwrap();
    }
}

//! Versioned artifact store with file-based persistence.
//!
//! Each artifact version is written to `<root>/<type>/vNNNN.json` and synced
//! to disk before `put` returns. Writes never overwrite an existing version,
//! and concurrent `put` calls for the same type are serialized so version
//! numbers are never lost or reused.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::domain::{Artifact, ArtifactType};

/// Errors raised by the artifact store
#[derive(Debug, Error)]
pub enum StoreError {
    /// The type has never been produced
    #[error("No artifact of type '{0}'")]
    NotFound(ArtifactType),

    /// The type name cannot be used as a directory name
    #[error("Invalid artifact type name '{0}'")]
    InvalidType(ArtifactType),

    #[error("Artifact version {version} of type '{artifact_type}' not found")]
    VersionNotFound {
        artifact_type: ArtifactType,
        version: u32,
    },

    #[error("IO error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Durable, append-only artifact history for one project
pub struct ArtifactStore {
    root: PathBuf,

    /// In-memory index of every version, ordered by version
    history: Mutex<HashMap<ArtifactType, Vec<Arc<Artifact>>>>,

    /// One async lock per artifact type; serializes `put` per type
    type_locks: Mutex<HashMap<ArtifactType, Arc<tokio::sync::Mutex<()>>>>,
}

impl ArtifactStore {
    /// Open a store rooted at `root`, loading any versions already on disk
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        fs::create_dir_all(&root)
            .await
            .map_err(|e| StoreError::io(&root, e))?;

        let mut history: HashMap<ArtifactType, Vec<Arc<Artifact>>> = HashMap::new();
        let mut types = fs::read_dir(&root).await.map_err(|e| StoreError::io(&root, e))?;

        while let Some(entry) = types.next_entry().await.map_err(|e| StoreError::io(&root, e))? {
            let type_dir = entry.path();
            if !type_dir.is_dir() {
                continue;
            }

            let mut versions = Vec::new();
            let mut files = fs::read_dir(&type_dir)
                .await
                .map_err(|e| StoreError::io(&type_dir, e))?;
            while let Some(file) = files
                .next_entry()
                .await
                .map_err(|e| StoreError::io(&type_dir, e))?
            {
                let path = file.path();
                if path.extension().and_then(|e| e.to_str()) != Some("json") {
                    // Leftover temp files from an interrupted write
                    continue;
                }
                let content = fs::read_to_string(&path)
                    .await
                    .map_err(|e| StoreError::io(&path, e))?;
                let artifact: Artifact = serde_json::from_str(&content)?;
                versions.push(Arc::new(artifact));
            }

            versions.sort_by_key(|a| a.version);
            if let Some(first) = versions.first() {
                history.insert(first.artifact_type.clone(), versions);
            }
        }

        debug!(root = %root.display(), types = history.len(), "Opened artifact store");

        Ok(Self {
            root,
            history: Mutex::new(history),
            type_locks: Mutex::new(HashMap::new()),
        })
    }

    /// Root directory of the store
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn type_lock(&self, artifact_type: &ArtifactType) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.type_locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.entry(artifact_type.clone()).or_default().clone()
    }

    fn next_version(&self, artifact_type: &ArtifactType) -> u32 {
        let history = self.history.lock().unwrap_or_else(|e| e.into_inner());
        history
            .get(artifact_type)
            .and_then(|v| v.last())
            .map_or(1, |a| a.version + 1)
    }

    /// Append a new version of `artifact_type`
    ///
    /// The artifact is on disk (written, synced, renamed into place) before
    /// this returns.
    pub async fn put(
        &self,
        phase_of_origin: &str,
        artifact_type: ArtifactType,
        payload: serde_json::Value,
    ) -> Result<Arc<Artifact>, StoreError> {
        if !artifact_type.is_valid() {
            return Err(StoreError::InvalidType(artifact_type));
        }
        let lock = self.type_lock(&artifact_type);
        let _guard = lock.lock().await;

        let version = self.next_version(&artifact_type);
        let artifact = Artifact::new(phase_of_origin, artifact_type.clone(), payload, version);

        let type_dir = self.root.join(artifact_type.as_str());
        fs::create_dir_all(&type_dir)
            .await
            .map_err(|e| StoreError::io(&type_dir, e))?;

        let final_path = type_dir.join(format!("v{:04}.json", version));
        let tmp_path = type_dir.join(format!("v{:04}.json.tmp", version));
        let json = serde_json::to_vec_pretty(&artifact)?;

        write_durably(&tmp_path, &final_path, &json).await?;

        let artifact = Arc::new(artifact);
        self.history
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(artifact_type)
            .or_default()
            .push(artifact.clone());

        debug!(
            artifact_type = %artifact.artifact_type,
            version,
            phase = phase_of_origin,
            "Stored artifact"
        );

        Ok(artifact)
    }

    /// Current version of a type
    ///
    /// `NotFound` means the type has never been produced.
    pub fn get(&self, artifact_type: &ArtifactType) -> Result<Arc<Artifact>, StoreError> {
        self.latest(artifact_type)
            .ok_or_else(|| StoreError::NotFound(artifact_type.clone()))
    }

    /// Highest version of a type, if any
    pub fn latest(&self, artifact_type: &ArtifactType) -> Option<Arc<Artifact>> {
        let history = self.history.lock().unwrap_or_else(|e| e.into_inner());
        history.get(artifact_type).and_then(|v| v.last().cloned())
    }

    /// A specific version of a type
    pub fn version(&self, artifact_type: &ArtifactType, version: u32) -> Result<Arc<Artifact>, StoreError> {
        let history = self.history.lock().unwrap_or_else(|e| e.into_inner());
        history
            .get(artifact_type)
            .and_then(|v| v.iter().find(|a| a.version == version).cloned())
            .ok_or_else(|| StoreError::VersionNotFound {
                artifact_type: artifact_type.clone(),
                version,
            })
    }

    /// Every version of a type, oldest first
    pub fn history(&self, artifact_type: &ArtifactType) -> Vec<Arc<Artifact>> {
        let history = self.history.lock().unwrap_or_else(|e| e.into_inner());
        history.get(artifact_type).cloned().unwrap_or_default()
    }

    /// All types with at least one version, sorted
    pub fn types(&self) -> Vec<ArtifactType> {
        let history = self.history.lock().unwrap_or_else(|e| e.into_inner());
        let mut types: Vec<ArtifactType> = history.keys().cloned().collect();
        types.sort();
        types
    }
}

/// Write `bytes` to `tmp`, fsync, then rename over `target`
pub(crate) async fn write_durably(tmp: &Path, target: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(tmp)
        .await
        .map_err(|e| StoreError::io(tmp, e))?;
    file.write_all(bytes).await.map_err(|e| StoreError::io(tmp, e))?;
    file.sync_all().await.map_err(|e| StoreError::io(tmp, e))?;
    drop(file);

    fs::rename(tmp, target)
        .await
        .map_err(|e| StoreError::io(target, e))?;

    if let Some(dir) = target.parent() {
        // Persist the rename itself; not supported on every platform
        if let Ok(dir) = fs::File::open(dir).await {
            let _ = dir.sync_all().await;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn ty(name: &str) -> ArtifactType {
        ArtifactType::new(name)
    }

    #[tokio::test]
    async fn test_put_appends_versions() {
        let temp = TempDir::new().unwrap();
        let store = ArtifactStore::open(temp.path()).await.unwrap();

        let v1 = store.put("pm", ty("requirements"), json!({"n": 1})).await.unwrap();
        let v2 = store.put("pm", ty("requirements"), json!({"n": 2})).await.unwrap();

        assert_eq!(v1.version, 1);
        assert_eq!(v2.version, 2);
        assert_eq!(store.history(&ty("requirements")).len(), 2);
        assert_eq!(store.get(&ty("requirements")).unwrap().payload, json!({"n": 2}));
        assert_eq!(store.version(&ty("requirements"), 1).unwrap().payload, json!({"n": 1}));
    }

    #[tokio::test]
    async fn test_missing_type_is_not_found() {
        let temp = TempDir::new().unwrap();
        let store = ArtifactStore::open(temp.path()).await.unwrap();

        let err = store.get(&ty("architecture")).unwrap_err();
        assert!(matches!(err, StoreError::NotFound(t) if t.as_str() == "architecture"));
        assert!(store.latest(&ty("architecture")).is_none());
        assert!(store.history(&ty("architecture")).is_empty());
    }

    #[tokio::test]
    async fn test_path_like_type_is_rejected() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().join("artifacts");
        let store = ArtifactStore::open(&root).await.unwrap();

        for name in ["../escaped", "docs/api"] {
            let err = store.put("pm", ty(name), json!("x")).await.unwrap_err();
            assert!(matches!(err, StoreError::InvalidType(_)), "{}", name);
        }
        assert!(!temp.path().join("escaped").exists());
        assert!(!root.join("docs").exists());
        assert!(store.types().is_empty());
    }

    #[tokio::test]
    async fn test_reopen_restores_history() {
        let temp = TempDir::new().unwrap();
        {
            let store = ArtifactStore::open(temp.path()).await.unwrap();
            store.put("pm", ty("requirements"), json!("a")).await.unwrap();
            store.put("pm", ty("requirements"), json!("b")).await.unwrap();
            store.put("arch", ty("architecture"), json!("c")).await.unwrap();
        }

        let store = ArtifactStore::open(temp.path()).await.unwrap();
        let history = store.history(&ty("requirements"));
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].payload, json!("a"));
        assert_eq!(history[1].payload, json!("b"));
        assert_eq!(store.types(), vec![ty("architecture"), ty("requirements")]);

        // Versions continue after reopen
        let v3 = store.put("pm", ty("requirements"), json!("d")).await.unwrap();
        assert_eq!(v3.version, 3);
    }

    #[tokio::test]
    async fn test_leftover_temp_files_are_ignored() {
        let temp = TempDir::new().unwrap();
        let dir = temp.path().join("requirements");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("v0001.json.tmp"), "{ half written").unwrap();

        let store = ArtifactStore::open(temp.path()).await.unwrap();
        assert!(store.latest(&ty("requirements")).is_none());
    }

    #[tokio::test]
    async fn test_concurrent_puts_same_type_linearized() {
        let temp = TempDir::new().unwrap();
        let store = Arc::new(ArtifactStore::open(temp.path()).await.unwrap());

        let mut handles = Vec::new();
        for i in 0..16 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.put("dev", ty("backend_code"), json!(i)).await.unwrap().version
            }));
        }

        let mut versions = Vec::new();
        for handle in handles {
            versions.push(handle.await.unwrap());
        }
        versions.sort();

        assert_eq!(versions, (1..=16).collect::<Vec<u32>>());
        assert_eq!(store.history(&ty("backend_code")).len(), 16);
    }
}

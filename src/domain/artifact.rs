//! Artifacts produced by pipeline phases.
//!
//! Artifacts are immutable: a phase that runs again produces a new version
//! rather than changing an existing one.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Phase name recorded on artifacts supplied from outside the graph
pub const SEED_PHASE: &str = "input";

/// An immutable, versioned output of a phase
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    /// Unique identifier for this version
    pub id: Uuid,

    /// Name of the phase that produced this artifact
    pub phase_of_origin: String,

    /// Type of artifact
    #[serde(rename = "type")]
    pub artifact_type: ArtifactType,

    /// Opaque payload; the orchestrator never inspects it
    pub payload: serde_json::Value,

    /// When the artifact was created
    pub created_at: DateTime<Utc>,

    /// Version number within its type (1-based)
    pub version: u32,

    /// SHA-256 of the canonical JSON payload (hex)
    pub digest: String,
}

impl Artifact {
    /// Create a new artifact version
    pub fn new(
        phase_of_origin: impl Into<String>,
        artifact_type: ArtifactType,
        payload: serde_json::Value,
        version: u32,
    ) -> Self {
        let digest = payload_digest(&payload);
        Self {
            id: Uuid::new_v4(),
            phase_of_origin: phase_of_origin.into(),
            artifact_type,
            payload,
            created_at: Utc::now(),
            version,
            digest,
        }
    }

    /// Size of the serialized payload in bytes
    pub fn size_bytes(&self) -> u64 {
        payload_size(&self.payload)
    }
}

/// Artifact type key (e.g. `requirements`, `architecture`)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ArtifactType(String);

impl ArtifactType {
    pub const PROJECT_BRIEF: &'static str = "project_brief";
    pub const REQUIREMENTS: &'static str = "requirements";
    pub const ARCHITECTURE: &'static str = "architecture";
    pub const BACKEND_CODE: &'static str = "backend_code";
    pub const FRONTEND_CODE: &'static str = "frontend_code";
    pub const DEPLOYMENT_CONFIG: &'static str = "deployment_config";
    pub const DOCUMENTATION: &'static str = "documentation";

    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Type names become directory names, so only `[A-Za-z0-9_-]+` is allowed
    pub fn is_valid_name(name: &str) -> bool {
        !name.is_empty()
            && name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    }

    pub fn is_valid(&self) -> bool {
        Self::is_valid_name(&self.0)
    }
}

impl fmt::Display for ArtifactType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ArtifactType {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for ArtifactType {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl AsRef<str> for ArtifactType {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// SHA-256 of the serialized payload, hex encoded
///
/// `serde_json` maps are ordered, so equal payloads hash equally.
pub fn payload_digest(payload: &serde_json::Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(payload.to_string().as_bytes());
    hex::encode(hasher.finalize())
}

/// Serialized size of a payload
pub fn payload_size(payload: &serde_json::Value) -> u64 {
    payload.to_string().len() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_artifact_creation() {
        let artifact = Artifact::new(
            "product_manager",
            ArtifactType::from(ArtifactType::REQUIREMENTS),
            json!({"features": ["auth"]}),
            1,
        );

        assert_eq!(artifact.phase_of_origin, "product_manager");
        assert_eq!(artifact.artifact_type.as_str(), "requirements");
        assert_eq!(artifact.version, 1);
        assert_eq!(artifact.digest.len(), 64);
    }

    #[test]
    fn test_digest_is_content_addressed() {
        let a = Artifact::new("a", "t".into(), json!({"x": 1}), 1);
        let b = Artifact::new("b", "t".into(), json!({"x": 1}), 2);
        let c = Artifact::new("a", "t".into(), json!({"x": 2}), 1);

        assert_eq!(a.digest, b.digest);
        assert_ne!(a.digest, c.digest);
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn test_artifact_type_serializes_as_string() {
        let ty = ArtifactType::new("architecture");
        assert_eq!(serde_json::to_string(&ty).unwrap(), "\"architecture\"");
    }
}

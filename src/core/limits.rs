//! Resource limits for project execution.
//!
//! Bounds the orchestrator through configurable limits on:
//! - Concurrent phase attempts (the worker pool size)
//! - Artifact payload size
//! - Total project wall-clock time

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Limits applied to every project an orchestrator drives
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorLimits {
    /// Maximum phase attempts in flight at once (default: 4)
    #[serde(default = "default_max_concurrent_phases")]
    pub max_concurrent_phases: usize,

    /// Maximum serialized size of one output payload (default: 10MB)
    #[serde(default = "default_max_payload_bytes")]
    pub max_payload_bytes: u64,

    /// Total project timeout in seconds (default: 7200 = 2 hours)
    #[serde(default = "default_project_timeout")]
    pub project_timeout_seconds: u64,

    /// How often a running project checks for an external cancel request
    #[serde(default = "default_cancel_poll_ms")]
    pub cancel_poll_ms: u64,
}

fn default_max_concurrent_phases() -> usize {
    4
}
fn default_max_payload_bytes() -> u64 {
    10 * 1024 * 1024
} // 10MB
fn default_project_timeout() -> u64 {
    7200
} // 2 hours
fn default_cancel_poll_ms() -> u64 {
    500
}

impl Default for OrchestratorLimits {
    fn default() -> Self {
        Self {
            max_concurrent_phases: default_max_concurrent_phases(),
            max_payload_bytes: default_max_payload_bytes(),
            project_timeout_seconds: default_project_timeout(),
            cancel_poll_ms: default_cancel_poll_ms(),
        }
    }
}

impl OrchestratorLimits {
    /// Worker pool size, never zero
    pub fn worker_slots(&self) -> usize {
        self.max_concurrent_phases.max(1)
    }

    pub fn project_timeout(&self) -> Duration {
        Duration::from_secs(self.project_timeout_seconds)
    }

    pub fn cancel_poll_interval(&self) -> Duration {
        Duration::from_millis(self.cancel_poll_ms.max(10))
    }

    /// Validate an output payload against the size limit
    pub fn validate_payload(&self, size_bytes: u64) -> Result<(), LimitViolation> {
        if size_bytes > self.max_payload_bytes {
            return Err(LimitViolation::MaxPayloadBytes {
                actual: size_bytes,
                limit: self.max_payload_bytes,
            });
        }
        Ok(())
    }

    /// Check a project's elapsed time against the project timeout
    pub fn check_deadline(&self, started: Instant) -> Result<(), LimitViolation> {
        let elapsed = started.elapsed().as_secs();
        if elapsed >= self.project_timeout_seconds {
            return Err(LimitViolation::ProjectTimeout {
                elapsed_seconds: elapsed,
                limit_seconds: self.project_timeout_seconds,
            });
        }
        Ok(())
    }
}

/// Limit violation errors
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LimitViolation {
    #[error("Maximum payload bytes exceeded: {actual} > {limit}")]
    MaxPayloadBytes { actual: u64, limit: u64 },

    #[error("Project timeout: {elapsed_seconds}s >= {limit_seconds}s")]
    ProjectTimeout {
        elapsed_seconds: u64,
        limit_seconds: u64,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_limits() {
        let limits = OrchestratorLimits::default();
        assert_eq!(limits.max_concurrent_phases, 4);
        assert_eq!(limits.max_payload_bytes, 10 * 1024 * 1024);
        assert_eq!(limits.project_timeout(), Duration::from_secs(7200));
    }

    #[test]
    fn test_payload_validation() {
        let limits = OrchestratorLimits {
            max_payload_bytes: 100,
            ..Default::default()
        };

        assert!(limits.validate_payload(100).is_ok());
        let result = limits.validate_payload(101);
        assert!(matches!(result, Err(LimitViolation::MaxPayloadBytes { actual: 101, .. })));
    }

    #[test]
    fn test_deadline() {
        let limits = OrchestratorLimits {
            project_timeout_seconds: 0,
            ..Default::default()
        };
        assert!(matches!(
            limits.check_deadline(Instant::now()),
            Err(LimitViolation::ProjectTimeout { .. })
        ));

        assert!(OrchestratorLimits::default().check_deadline(Instant::now()).is_ok());
    }

    #[test]
    fn test_worker_slots_never_zero() {
        let limits = OrchestratorLimits {
            max_concurrent_phases: 0,
            ..Default::default()
        };
        assert_eq!(limits.worker_slots(), 1);
    }

    #[test]
    fn test_limits_yaml_defaults() {
        let limits: OrchestratorLimits = serde_yaml::from_str("max_concurrent_phases: 2").unwrap();
        assert_eq!(limits.max_concurrent_phases, 2);
        assert_eq!(limits.cancel_poll_ms, 500);
    }
}

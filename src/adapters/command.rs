//! Subprocess agent.
//!
//! Runs an external program once per attempt. The program receives a JSON
//! request on stdin and must print a JSON object mapping output artifact
//! types to payloads on stdout.
//!
//! Exit codes: 0 is success, 75 (`EX_TEMPFAIL`) is a transient failure, any
//! other code is fatal. A process killed by a signal counts as transient.

use std::io::ErrorKind;
use std::process::Stdio;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

use super::{AgentAdapter, AgentContext, AgentOutcome, ArtifactInputs, ArtifactOutputs};

/// Exit code a command uses to ask for a retry
pub const EXIT_TEMPFAIL: i32 = 75;

/// Agent backed by an external command
#[derive(Debug, Clone)]
pub struct CommandAgent {
    name: String,
    program: String,
    args: Vec<String>,
}

impl CommandAgent {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        let program = program.into();
        Self {
            name: program.clone(),
            program,
            args,
        }
    }

    /// Build from an argv list; `None` when empty
    pub fn from_argv(argv: &[String]) -> Option<Self> {
        let (program, args) = argv.split_first()?;
        Some(Self::new(program.clone(), args.to_vec()))
    }

    fn request(inputs: &ArtifactInputs, ctx: &AgentContext) -> Value {
        let inputs: serde_json::Map<String, Value> = inputs
            .iter()
            .map(|(ty, artifact)| (ty.to_string(), artifact.payload.clone()))
            .collect();

        json!({
            "project_id": ctx.project_id,
            "phase": ctx.phase,
            "attempt": ctx.attempt,
            "outputs": ctx.outputs,
            "brief": ctx.brief.as_ref(),
            "settings": ctx.settings,
            "inputs": inputs,
        })
    }

    async fn run(&self, request: &[u8], ctx: &AgentContext) -> AgentOutcome {
        let mut child = match Command::new(&self.program)
            .args(&self.args)
            .env("FORGE_PROJECT_ID", ctx.project_id.to_string())
            .env("FORGE_PHASE", &ctx.phase)
            .env("FORGE_ATTEMPT", ctx.attempt.to_string())
            .env("FORGE_MODEL", &ctx.settings.model)
            .env("FORGE_TEMPERATURE", ctx.settings.temperature.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
        {
            Ok(child) => child,
            Err(e) => {
                return AgentOutcome::fatal(format!("Failed to spawn '{}': {}", self.program, e));
            }
        };

        // Feed stdin while stdout and stderr drain, so a child that streams
        // output before reading all of its input cannot stall on a full pipe
        let stdin = child.stdin.take();
        // Dropping stdin at the end of the block signals EOF
        let feed = async move {
            let Some(mut stdin) = stdin else {
                return Ok(());
            };
            match stdin.write_all(request).await {
                // The child exited or closed stdin without reading everything
                Err(e) if e.kind() == ErrorKind::BrokenPipe => Ok(()),
                result => result,
            }
        };

        // Dropping the child on cancel kills it
        let (fed, output) = tokio::select! {
            both = async { tokio::join!(feed, child.wait_with_output()) } => both,
            _ = ctx.cancel.cancelled() => {
                debug!(program = %self.program, phase = %ctx.phase, "Command cancelled");
                return AgentOutcome::transient("cancelled");
            }
        };

        let output = match output {
            Ok(output) => output,
            Err(e) => return AgentOutcome::transient(format!("Failed to wait for '{}': {}", self.program, e)),
        };
        if let Err(e) = fed {
            return AgentOutcome::transient(format!("Failed to write to '{}' stdin: {}", self.program, e));
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        match output.status.code() {
            Some(0) => parse_outputs(&output.stdout),
            Some(EXIT_TEMPFAIL) => AgentOutcome::transient(format!(
                "'{}' asked for a retry: {}",
                self.program,
                stderr.trim()
            )),
            Some(code) => AgentOutcome::fatal(format!(
                "'{}' failed with exit code {}: {}",
                self.program,
                code,
                stderr.trim()
            )),
            None => {
                warn!(program = %self.program, "Command terminated by signal");
                AgentOutcome::transient(format!("'{}' terminated by signal", self.program))
            }
        }
    }
}

/// A malformed response may be a one-off, so it is retried
fn parse_outputs(stdout: &[u8]) -> AgentOutcome {
    match serde_json::from_slice::<ArtifactOutputs>(stdout) {
        Ok(outputs) => AgentOutcome::Success(outputs),
        Err(e) => AgentOutcome::transient(format!("Command output is not a JSON object of artifacts: {}", e)),
    }
}

#[async_trait]
impl AgentAdapter for CommandAgent {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, inputs: &ArtifactInputs, ctx: &AgentContext) -> AgentOutcome {
        let request = match serde_json::to_vec(&Self::request(inputs, ctx)) {
            Ok(bytes) => bytes,
            Err(e) => return AgentOutcome::fatal(format!("Failed to encode request: {}", e)),
        };
        self.run(&request, ctx).await
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::domain::{Artifact, ArtifactType, ProjectBrief};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;
    use uuid::Uuid;

    fn sh(script: &str) -> CommandAgent {
        CommandAgent::new("sh", vec!["-c".to_string(), script.to_string()])
    }

    fn ctx() -> AgentContext {
        AgentContext {
            project_id: Uuid::new_v4(),
            phase: "writer".to_string(),
            attempt: 1,
            outputs: vec![ArtifactType::new("documentation")],
            brief: Arc::new(ProjectBrief::new("demo", "A demo")),
            settings: Default::default(),
            cancel: CancellationToken::new(),
        }
    }

    #[test]
    fn test_from_argv() {
        assert!(CommandAgent::from_argv(&[]).is_none());
        let agent = CommandAgent::from_argv(&["writer".to_string(), "--fast".to_string()]).unwrap();
        assert_eq!(agent.name(), "writer");
    }

    #[tokio::test]
    async fn test_success_parses_stdout() {
        let agent = sh(r#"cat > /dev/null; echo '{"documentation": {"readme": "hi"}}'"#);
        let outcome = agent.execute(&ArtifactInputs::new(), &ctx()).await;

        let AgentOutcome::Success(outputs) = outcome else {
            panic!("expected success, got {:?}", outcome);
        };
        assert_eq!(outputs[&ArtifactType::new("documentation")]["readme"], "hi");
    }

    #[tokio::test]
    async fn test_request_reaches_stdin() {
        let agent = sh(r#"grep -q '"phase":"writer"' && echo '{"documentation": 1}'"#);
        let outcome = agent.execute(&ArtifactInputs::new(), &ctx()).await;
        assert!(matches!(outcome, AgentOutcome::Success(_)), "{:?}", outcome);
    }

    #[tokio::test]
    async fn test_exit_codes() {
        let transient = sh("cat > /dev/null; echo busy >&2; exit 75")
            .execute(&ArtifactInputs::new(), &ctx())
            .await;
        assert!(matches!(transient, AgentOutcome::TransientFailure(ref r) if r.contains("busy")));

        let fatal = sh("cat > /dev/null; exit 2").execute(&ArtifactInputs::new(), &ctx()).await;
        assert!(matches!(fatal, AgentOutcome::FatalFailure(ref r) if r.contains("exit code 2")));
    }

    #[tokio::test]
    async fn test_garbage_output_is_transient() {
        let outcome = sh("cat > /dev/null; echo not-json")
            .execute(&ArtifactInputs::new(), &ctx())
            .await;
        assert!(matches!(outcome, AgentOutcome::TransientFailure(_)));
    }

    #[tokio::test]
    async fn test_missing_program_is_fatal() {
        let outcome = CommandAgent::new("/nonexistent/forge-agent", vec![])
            .execute(&ArtifactInputs::new(), &ctx())
            .await;
        assert!(matches!(outcome, AgentOutcome::FatalFailure(_)));
    }

    fn large_inputs() -> ArtifactInputs {
        let body = "x".repeat(1024 * 1024);
        let ty = ArtifactType::new("source_code");
        let artifact = Artifact::new("developer", ty.clone(), json!({ "body": body }), 1);
        ArtifactInputs::from([(ty, Arc::new(artifact))])
    }

    #[tokio::test]
    async fn test_large_request_with_streaming_child() {
        // cat writes its input back while still reading it
        let agent = CommandAgent::new("cat", vec![]);
        let outcome = tokio::time::timeout(Duration::from_secs(10), agent.execute(&large_inputs(), &ctx()))
            .await
            .expect("command agent stalled on a large request");

        let AgentOutcome::Success(outputs) = outcome else {
            panic!("expected success, got {:?}", outcome);
        };
        assert_eq!(outputs[&ArtifactType::new("phase")], "writer");
        let echoed = outputs[&ArtifactType::new("inputs")]["source_code"]["body"].as_str().unwrap();
        assert_eq!(echoed.len(), 1024 * 1024);
    }

    #[tokio::test]
    async fn test_child_ignoring_stdin_succeeds() {
        let agent = sh(r#"echo '{"documentation": "ignored input"}'"#);
        let outcome = tokio::time::timeout(Duration::from_secs(10), agent.execute(&large_inputs(), &ctx()))
            .await
            .unwrap();

        assert!(matches!(outcome, AgentOutcome::Success(_)), "{:?}", outcome);
    }

    #[tokio::test]
    async fn test_cancel_stops_command() {
        let context = ctx();
        let cancel = context.cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            cancel.cancel();
        });

        let started = std::time::Instant::now();
        let outcome = sh("sleep 30").execute(&ArtifactInputs::new(), &context).await;

        assert!(matches!(outcome, AgentOutcome::TransientFailure(ref r) if r == "cancelled"));
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}

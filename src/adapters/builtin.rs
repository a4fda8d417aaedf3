//! Built-in role agents.
//!
//! Deterministic agents for the default software-development graph. They
//! need no external service: each derives a structured JSON payload from its
//! input artifacts. The product manager carries the real requirements logic
//! (user stories, acceptance criteria, impact/effort prioritisation); the
//! other roles produce skeletal but well-formed documents.

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::{AgentAdapter, AgentContext, AgentOutcome, ArtifactInputs};
use crate::domain::{ArtifactType, ProjectBrief, ProjectType};

/// SDLC role played by a built-in agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    ProductManager,
    SystemArchitect,
    BackendDeveloper,
    FrontendDeveloper,
    #[serde(rename = "devops_engineer")]
    DevOpsEngineer,
    TechnicalWriter,
}

impl Role {
    pub const ALL: [Role; 6] = [
        Role::ProductManager,
        Role::SystemArchitect,
        Role::BackendDeveloper,
        Role::FrontendDeveloper,
        Role::DevOpsEngineer,
        Role::TechnicalWriter,
    ];

    /// Config key of the role
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ProductManager => "product_manager",
            Self::SystemArchitect => "system_architect",
            Self::BackendDeveloper => "backend_developer",
            Self::FrontendDeveloper => "frontend_developer",
            Self::DevOpsEngineer => "devops_engineer",
            Self::TechnicalWriter => "technical_writer",
        }
    }

    pub fn display_name(self) -> &'static str {
        match self {
            Self::ProductManager => "Product Manager",
            Self::SystemArchitect => "System Architect",
            Self::BackendDeveloper => "Backend Developer",
            Self::FrontendDeveloper => "Frontend Developer",
            Self::DevOpsEngineer => "DevOps Engineer",
            Self::TechnicalWriter => "Technical Writer",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Agent that plays one SDLC role without external calls
#[derive(Debug, Clone)]
pub struct BuiltinAgent {
    role: Role,
}

impl BuiltinAgent {
    pub fn new(role: Role) -> Self {
        Self { role }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    fn produce(&self, inputs: &ArtifactInputs, ctx: &AgentContext) -> Result<Value, String> {
        match self.role {
            Role::ProductManager => {
                let brief: ProjectBrief = input(inputs, ArtifactType::PROJECT_BRIEF)?;
                let requirements = gather_requirements(&brief)?;
                to_value(&requirements)
            }
            Role::SystemArchitect => {
                let requirements: Requirements = input(inputs, ArtifactType::REQUIREMENTS)?;
                to_value(&design_architecture(&requirements, &ctx.brief))
            }
            Role::BackendDeveloper => {
                let architecture: Architecture = input(inputs, ArtifactType::ARCHITECTURE)?;
                Ok(implement_backend(&architecture, &ctx.brief))
            }
            Role::FrontendDeveloper => {
                let architecture: Architecture = input(inputs, ArtifactType::ARCHITECTURE)?;
                Ok(implement_frontend(&architecture, &ctx.brief))
            }
            Role::DevOpsEngineer => {
                let backend: Value = input(inputs, ArtifactType::BACKEND_CODE)?;
                let frontend: Value = input(inputs, ArtifactType::FRONTEND_CODE)?;
                Ok(setup_deployment(&backend, &frontend, &ctx.brief))
            }
            Role::TechnicalWriter => {
                let requirements: Requirements = input(inputs, ArtifactType::REQUIREMENTS)?;
                let architecture: Architecture = input(inputs, ArtifactType::ARCHITECTURE)?;
                let deployment: Value = input(inputs, ArtifactType::DEPLOYMENT_CONFIG)?;
                Ok(create_documentation(&requirements, &architecture, &deployment, &ctx.brief))
            }
        }
    }
}

#[async_trait]
impl AgentAdapter for BuiltinAgent {
    fn name(&self) -> &str {
        self.role.as_str()
    }

    async fn execute(&self, inputs: &ArtifactInputs, ctx: &AgentContext) -> AgentOutcome {
        if ctx.is_cancelled() {
            return AgentOutcome::transient("cancelled before start");
        }

        match self.produce(inputs, ctx) {
            // Every declared output receives the role's document
            Ok(payload) => {
                AgentOutcome::success(ctx.outputs.iter().map(|ty| (ty.clone(), payload.clone())))
            }
            Err(reason) => AgentOutcome::fatal(format!("{}: {}", self.role.display_name(), reason)),
        }
    }
}

/// Decode a required input artifact; a missing or malformed input is fatal
fn input<T: DeserializeOwned>(inputs: &ArtifactInputs, artifact_type: &str) -> Result<T, String> {
    let artifact = inputs
        .get(&ArtifactType::new(artifact_type))
        .ok_or_else(|| format!("missing input '{}'", artifact_type))?;
    serde_json::from_value(artifact.payload.clone())
        .map_err(|e| format!("invalid '{}' artifact: {}", artifact_type, e))
}

fn to_value<T: Serialize>(value: &T) -> Result<Value, String> {
    serde_json::to_value(value).map_err(|e| e.to_string())
}

/// Product requirements document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Requirements {
    pub project: String,
    pub description: String,
    pub features: Vec<String>,
    pub user_stories: Vec<String>,
    pub acceptance_criteria: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub prioritized_features: Vec<FeaturePriority>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeaturePriority {
    pub feature: String,
    pub priority: f64,
}

/// Features assumed when a brief lists none
const DEFAULT_FEATURES: [&str; 3] = ["User authentication", "Data storage", "API endpoints"];

/// Derive requirements from a brief
pub fn gather_requirements(brief: &ProjectBrief) -> Result<Requirements, String> {
    if brief.name.trim().is_empty() || brief.description.trim().is_empty() {
        return Err("project name and description are required".to_string());
    }

    let features: Vec<String> = if brief.features.is_empty() {
        DEFAULT_FEATURES.iter().map(|f| f.to_string()).collect()
    } else {
        brief.features.clone()
    };

    let user_stories = features
        .iter()
        .map(|feature| format_user_story("user", &format!("use {}", feature), "I can achieve my goals"))
        .collect();

    let acceptance_criteria = features
        .iter()
        .map(|feature| {
            let criteria = vec![
                format!("Must implement {} functionality", feature),
                "Must be user-friendly and intuitive".to_string(),
                "Must handle errors gracefully".to_string(),
            ];
            (feature.clone(), criteria)
        })
        .collect();

    // Earlier features matter more; longer names are read as more effort
    let count = features.len();
    let impact: BTreeMap<String, f64> = features
        .iter()
        .enumerate()
        .map(|(i, f)| (f.clone(), (count - i) as f64))
        .collect();
    let effort: BTreeMap<String, f64> = features
        .iter()
        .map(|f| (f.clone(), f.split_whitespace().count().max(1) as f64))
        .collect();

    let requirements = Requirements {
        project: brief.name.clone(),
        description: brief.description.clone(),
        prioritized_features: prioritize_features(&features, &impact, &effort),
        features,
        user_stories,
        acceptance_criteria,
    };

    if !validate_requirements(&requirements) {
        return Err("generated requirements are inconsistent".to_string());
    }
    Ok(requirements)
}

/// Every feature needs acceptance criteria
pub fn validate_requirements(requirements: &Requirements) -> bool {
    requirements
        .features
        .iter()
        .all(|f| requirements.acceptance_criteria.contains_key(f))
}

pub fn format_user_story(role: &str, action: &str, benefit: &str) -> String {
    format!("As a {}, I want to {}, so that {}", role, action, benefit)
}

/// Split a user story into `(role, action, benefit)`
pub fn parse_user_story(story: &str) -> Option<(String, String, String)> {
    let rest = story.strip_prefix("As a ")?;
    let (role, rest) = rest.split_once(", I want to ")?;
    let (action, benefit) = rest.split_once(", so that ")?;
    Some((role.to_string(), action.to_string(), benefit.to_string()))
}

/// Rank features by impact / effort, highest first
///
/// Missing impact counts as 0, missing effort as 1.
pub fn prioritize_features(
    features: &[String],
    impact: &BTreeMap<String, f64>,
    effort: &BTreeMap<String, f64>,
) -> Vec<FeaturePriority> {
    let mut priorities: Vec<FeaturePriority> = features
        .iter()
        .map(|feature| {
            let impact = impact.get(feature).copied().unwrap_or(0.0);
            let effort = effort.get(feature).copied().filter(|e| *e > 0.0).unwrap_or(1.0);
            FeaturePriority {
                feature: feature.clone(),
                priority: impact / effort,
            }
        })
        .collect();

    // Stable sort keeps declaration order among equal priorities
    priorities.sort_by(|a, b| b.priority.total_cmp(&a.priority));
    priorities
}

/// Architecture document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Architecture {
    pub style: String,
    pub components: Vec<Component>,
    #[serde(default)]
    pub technical_requirements: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Component {
    pub name: String,
    pub feature: String,
    pub responsibility: String,
}

fn design_architecture(requirements: &Requirements, brief: &ProjectBrief) -> Architecture {
    let style = match brief.project_type {
        ProjectType::Web => "client-server",
        ProjectType::Mobile => "mobile client with backend API",
        ProjectType::Cli => "single binary",
        ProjectType::Desktop => "desktop application",
    };

    let components = requirements
        .prioritized_features
        .iter()
        .map(|p| p.feature.as_str())
        .chain(requirements.features.iter().map(String::as_str))
        .fold(Vec::<&str>::new(), |mut seen, f| {
            if !seen.contains(&f) {
                seen.push(f);
            }
            seen
        })
        .into_iter()
        .map(|feature| Component {
            name: slug(feature),
            feature: feature.to_string(),
            responsibility: format!("Implements {}", feature),
        })
        .collect();

    Architecture {
        style: style.to_string(),
        components,
        technical_requirements: brief.technical_requirements.clone(),
    }
}

fn implement_backend(architecture: &Architecture, brief: &ProjectBrief) -> Value {
    let language = architecture
        .technical_requirements
        .get("backend")
        .cloned()
        .unwrap_or_else(|| "python".to_string());

    let modules: Vec<Value> = architecture
        .components
        .iter()
        .map(|c| {
            json!({
                "name": c.name,
                "path": format!("backend/{}/{}", brief.name, c.name),
                "endpoints": [format!("/api/{}", c.name)],
                "summary": c.responsibility,
            })
        })
        .collect();

    json!({ "language": language, "modules": modules })
}

fn implement_frontend(architecture: &Architecture, brief: &ProjectBrief) -> Value {
    let default_framework = match brief.project_type {
        ProjectType::Web => "react",
        ProjectType::Mobile => "react-native",
        ProjectType::Desktop => "electron",
        ProjectType::Cli => "terminal",
    };
    let framework = architecture
        .technical_requirements
        .get("frontend")
        .cloned()
        .unwrap_or_else(|| default_framework.to_string());

    let views: Vec<Value> = architecture
        .components
        .iter()
        .map(|c| json!({ "name": c.name, "path": format!("frontend/{}", c.name), "feature": c.feature }))
        .collect();

    json!({ "framework": framework, "views": views })
}

fn setup_deployment(backend: &Value, frontend: &Value, brief: &ProjectBrief) -> Value {
    let mut services = Vec::new();
    if let Some(language) = backend.get("language").and_then(Value::as_str) {
        services.push(json!({
            "name": format!("{}-backend", brief.name),
            "runtime": language,
            "port": 8000,
        }));
    }
    if let Some(framework) = frontend.get("framework").and_then(Value::as_str) {
        services.push(json!({
            "name": format!("{}-frontend", brief.name),
            "runtime": framework,
            "port": 3000,
        }));
    }

    json!({
        "services": services,
        "pipeline": ["lint", "test", "build", "deploy"],
        "environments": ["staging", "production"],
    })
}

fn create_documentation(
    requirements: &Requirements,
    architecture: &Architecture,
    deployment: &Value,
    brief: &ProjectBrief,
) -> Value {
    let mut readme = format!("# {}\n\n{}\n\n## Features\n\n", brief.name, brief.description);
    for feature in &requirements.features {
        readme.push_str(&format!("- {}\n", feature));
    }

    readme.push_str(&format!("\n## Architecture\n\nStyle: {}\n\n", architecture.style));
    for component in &architecture.components {
        readme.push_str(&format!("- `{}`: {}\n", component.name, component.responsibility));
    }

    readme.push_str("\n## Deployment\n\n");
    let services = deployment
        .get("services")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default();
    for service in services {
        if let Some(name) = service.get("name").and_then(Value::as_str) {
            readme.push_str(&format!("- {}\n", name));
        }
    }

    json!({
        "readme": readme,
        "user_stories": requirements.user_stories,
    })
}

/// Lowercase identifier for a feature name
fn slug(feature: &str) -> String {
    let mut out = String::with_capacity(feature.len());
    for c in feature.chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c.to_ascii_lowercase());
        } else if !out.ends_with('_') && !out.is_empty() {
            out.push('_');
        }
    }
    out.trim_end_matches('_').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Artifact;
    use std::sync::Arc;
    use tokio_util::sync::CancellationToken;
    use uuid::Uuid;

    fn ctx(brief: &ProjectBrief, outputs: &[&str]) -> AgentContext {
        AgentContext {
            project_id: Uuid::new_v4(),
            phase: "test".to_string(),
            attempt: 1,
            outputs: outputs.iter().map(|t| ArtifactType::new(*t)).collect(),
            brief: Arc::new(brief.clone()),
            settings: Default::default(),
            cancel: CancellationToken::new(),
        }
    }

    fn inputs(pairs: Vec<(&str, Value)>) -> ArtifactInputs {
        pairs
            .into_iter()
            .map(|(ty, payload)| {
                let ty = ArtifactType::new(ty);
                (ty.clone(), Arc::new(Artifact::new("input", ty, payload, 1)))
            })
            .collect()
    }

    #[test]
    fn test_gather_requirements_follows_features() {
        let brief = ProjectBrief::new("todo", "Tracks todos").with_features(["Task lists", "Reminders"]);
        let requirements = gather_requirements(&brief).unwrap();

        assert_eq!(requirements.features, vec!["Task lists", "Reminders"]);
        assert_eq!(
            requirements.user_stories[0],
            "As a user, I want to use Task lists, so that I can achieve my goals"
        );
        assert_eq!(
            requirements.acceptance_criteria["Reminders"],
            vec![
                "Must implement Reminders functionality",
                "Must be user-friendly and intuitive",
                "Must handle errors gracefully",
            ]
        );
        assert!(validate_requirements(&requirements));
    }

    #[test]
    fn test_gather_requirements_defaults_features() {
        let requirements = gather_requirements(&ProjectBrief::new("app", "An app")).unwrap();
        assert_eq!(requirements.features.len(), 3);
        assert_eq!(requirements.features[0], "User authentication");
    }

    #[test]
    fn test_gather_requirements_rejects_empty_description() {
        assert!(gather_requirements(&ProjectBrief::new("app", " ")).is_err());
    }

    #[test]
    fn test_prioritize_features() {
        let features: Vec<String> = ["auth", "profile", "search"].iter().map(|s| s.to_string()).collect();
        let impact = [("auth", 8.0), ("profile", 6.0), ("search", 5.0)]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect();
        let effort = [("auth", 5.0), ("profile", 3.0)]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect();

        let ranked = prioritize_features(&features, &impact, &effort);
        let order: Vec<&str> = ranked.iter().map(|p| p.feature.as_str()).collect();

        // search has no effort estimate, so 5 / 1
        assert_eq!(order, vec!["search", "profile", "auth"]);
        assert_eq!(ranked[1].priority, 2.0);
    }

    #[test]
    fn test_user_story_round_trip() {
        let story = format_user_story("admin", "reset passwords", "users regain access");
        assert_eq!(
            parse_user_story(&story),
            Some(("admin".to_string(), "reset passwords".to_string(), "users regain access".to_string()))
        );
        assert_eq!(parse_user_story("not a story"), None);
    }

    #[test]
    fn test_slug() {
        assert_eq!(slug("User authentication"), "user_authentication");
        assert_eq!(slug("API / endpoints!"), "api_endpoints");
    }

    #[test]
    fn test_role_serde_names() {
        for role in Role::ALL {
            let json = serde_json::to_string(&role).unwrap();
            assert_eq!(json, format!("\"{}\"", role.as_str()));
        }
    }

    #[tokio::test]
    async fn test_product_manager_agent() {
        let brief = ProjectBrief::new("todo", "Tracks todos").with_features(["Task lists"]);
        let agent = BuiltinAgent::new(Role::ProductManager);
        let inputs = inputs(vec![("project_brief", serde_json::to_value(&brief).unwrap())]);

        let outcome = agent.execute(&inputs, &ctx(&brief, &["requirements"])).await;
        let AgentOutcome::Success(outputs) = outcome else {
            panic!("expected success, got {:?}", outcome);
        };
        let requirements: Requirements =
            serde_json::from_value(outputs[&ArtifactType::new("requirements")].clone()).unwrap();
        assert_eq!(requirements.project, "todo");
    }

    #[tokio::test]
    async fn test_malformed_input_is_fatal() {
        let brief = ProjectBrief::new("todo", "Tracks todos");
        let agent = BuiltinAgent::new(Role::SystemArchitect);
        let inputs = inputs(vec![("requirements", json!("not a document"))]);

        let outcome = agent.execute(&inputs, &ctx(&brief, &["architecture"])).await;
        assert!(matches!(outcome, AgentOutcome::FatalFailure(reason) if reason.contains("requirements")));
    }

    #[tokio::test]
    async fn test_cancelled_agent_is_transient() {
        let brief = ProjectBrief::new("todo", "Tracks todos");
        let context = ctx(&brief, &["requirements"]);
        context.cancel.cancel();

        let outcome = BuiltinAgent::new(Role::ProductManager)
            .execute(&ArtifactInputs::new(), &context)
            .await;
        assert!(matches!(outcome, AgentOutcome::TransientFailure(_)));
    }
}

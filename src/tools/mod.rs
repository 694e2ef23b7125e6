//! Tool system for agent sessions.
//!
//! A tool is a named capability with a typed parameter contract. The
//! [`ToolRegistry`] validates arguments against that contract before dispatch
//! and turns every failure (unknown tool, bad arguments, executor error,
//! executor panic) into a failed [`ToolResult`], so the session loop treats
//! every call the same way.

mod code;

pub use code::RunCode;

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

/// Tool arguments after validation.
pub type ToolArgs = Map<String, Value>;

/// Declared type of one parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamKind {
    String,
    Integer,
    Number,
    Boolean,
    Object,
    Array,
}

impl ParamKind {
    /// JSON-schema type name.
    pub fn as_str(&self) -> &'static str {
        match self {
            ParamKind::String => "string",
            ParamKind::Integer => "integer",
            ParamKind::Number => "number",
            ParamKind::Boolean => "boolean",
            ParamKind::Object => "object",
            ParamKind::Array => "array",
        }
    }

    pub fn matches(&self, value: &Value) -> bool {
        match self {
            ParamKind::String => value.is_string(),
            ParamKind::Integer => value.is_i64() || value.is_u64(),
            ParamKind::Number => value.is_number(),
            ParamKind::Boolean => value.is_boolean(),
            ParamKind::Object => value.is_object(),
            ParamKind::Array => value.is_array(),
        }
    }
}

/// Contract for one tool parameter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParamSpec {
    pub name: String,
    pub kind: ParamKind,
    pub required: bool,
    /// Applied when an optional parameter is missing
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    pub description: String,
}

impl ParamSpec {
    pub fn required(name: &str, kind: ParamKind, description: &str) -> Self {
        Self {
            name: name.to_string(),
            kind,
            required: true,
            default: None,
            description: description.to_string(),
        }
    }

    pub fn optional(name: &str, kind: ParamKind, description: &str) -> Self {
        Self {
            required: false,
            ..Self::required(name, kind, description)
        }
    }

    pub fn with_default(mut self, default: Value) -> Self {
        self.default = Some(default);
        self
    }
}

/// Who is calling a tool, and on behalf of which session.
#[derive(Debug, Clone, Default)]
pub struct ToolContext {
    /// Caller identity (task owner)
    pub owner: Option<String>,
    /// Session id; also the sandbox lease key
    pub session_id: String,
    pub task_id: Option<String>,
}

impl ToolContext {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            ..Self::default()
        }
    }
}

/// A typed byproduct of a tool call (generated file, image, ...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    /// `file`, `image`, `text`, ...
    pub kind: String,
    pub name: String,
    /// Path or URL where the artifact can be fetched
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    /// Inline content for small text artifacts
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

/// Outcome of one tool invocation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolResult {
    pub success: bool,
    pub output: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub artifacts: Vec<Artifact>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
    /// Wall-clock time of the call, measured by the registry
    #[serde(default)]
    pub duration_ms: u64,
}

impl ToolResult {
    pub fn ok(output: impl Into<String>) -> Self {
        Self {
            success: true,
            output: output.into(),
            ..Self::default()
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Self::default()
        }
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn with_artifact(mut self, artifact: Artifact) -> Self {
        self.artifacts.push(artifact);
        self
    }

    /// Short text for the session memory log.
    pub fn summary(&self) -> String {
        match (&self.error, self.success) {
            (Some(err), false) => format!("error: {}", err),
            _ => self.output.clone(),
        }
    }
}

/// Tool contract as shown to the model.
#[derive(Debug, Clone, Serialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    /// JSON schema of the parameters
    pub parameters: Value,
}

/// Trait for implementing tools.
#[async_trait]
pub trait Tool: Send + Sync {
    /// The unique name of this tool.
    fn name(&self) -> &str;

    /// A description of what this tool does.
    fn description(&self) -> &str;

    /// Parameter contract, checked by the registry before `execute`.
    fn parameters(&self) -> Vec<ParamSpec>;

    /// Execute the tool with validated arguments (defaults already applied).
    async fn execute(&self, args: ToolArgs, ctx: &ToolContext) -> anyhow::Result<ToolResult>;
}

/// Information about a tool for display purposes.
#[derive(Debug, Clone)]
pub struct ToolInfo {
    pub name: String,
    pub description: String,
}

/// Registry of available tools.
#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool under its own name, replacing any previous one.
    pub fn register(&mut self, tool: Arc<dyn Tool>) -> Option<Arc<dyn Tool>> {
        let name = tool.name().to_string();
        let previous = self.tools.insert(name.clone(), tool);
        if previous.is_some() {
            tracing::debug!(tool = %name, "Replaced registered tool");
        }
        previous
    }

    /// List all available tools.
    pub fn list_tools(&self) -> Vec<ToolInfo> {
        let mut tools: Vec<ToolInfo> = self
            .tools
            .values()
            .map(|t| ToolInfo {
                name: t.name().to_string(),
                description: t.description().to_string(),
            })
            .collect();
        tools.sort_by(|a, b| a.name.cmp(&b.name));
        tools
    }

    pub fn has_tool(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// Tool contracts in JSON-schema form, sorted by name.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        let mut defs: Vec<ToolDefinition> = self
            .tools
            .values()
            .map(|t| {
                let params = t.parameters();
                let properties: Map<String, Value> = params
                    .iter()
                    .map(|p| {
                        let mut prop = json!({
                            "type": p.kind.as_str(),
                            "description": p.description,
                        });
                        if let Some(default) = &p.default {
                            prop["default"] = default.clone();
                        }
                        (p.name.clone(), prop)
                    })
                    .collect();
                let required: Vec<&str> = params
                    .iter()
                    .filter(|p| p.required)
                    .map(|p| p.name.as_str())
                    .collect();
                ToolDefinition {
                    name: t.name().to_string(),
                    description: t.description().to_string(),
                    parameters: json!({
                        "type": "object",
                        "properties": properties,
                        "required": required,
                    }),
                }
            })
            .collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    /// Invoke a tool by name. Never fails: every problem becomes a failed result.
    pub async fn invoke(&self, name: &str, args: Value, ctx: &ToolContext) -> ToolResult {
        let started = Instant::now();
        let mut result = self.dispatch(name, args, ctx).await;
        result.duration_ms = started.elapsed().as_millis() as u64;

        if result.success {
            tracing::debug!(
                tool = name,
                session_id = %ctx.session_id,
                duration_ms = result.duration_ms,
                "Tool call succeeded"
            );
        } else {
            tracing::warn!(
                tool = name,
                session_id = %ctx.session_id,
                duration_ms = result.duration_ms,
                "Tool call failed: {}",
                result.error.as_deref().unwrap_or("unknown error")
            );
        }
        result
    }

    async fn dispatch(&self, name: &str, args: Value, ctx: &ToolContext) -> ToolResult {
        let Some(tool) = self.tools.get(name) else {
            return ToolResult::failure(format!("Tool not found: {}", name));
        };

        let args = match validate_args(&tool.parameters(), args) {
            Ok(args) => args,
            Err(message) => return ToolResult::failure(message),
        };

        match AssertUnwindSafe(tool.execute(args, ctx)).catch_unwind().await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => ToolResult::failure(e.to_string()),
            Err(panic) => ToolResult::failure(format!("Tool panicked: {}", panic_message(&*panic))),
        }
    }
}

/// Check arguments against a parameter contract and apply defaults.
pub fn validate_args(params: &[ParamSpec], args: Value) -> Result<ToolArgs, String> {
    let mut args = match args {
        Value::Object(map) => map,
        Value::Null => Map::new(),
        other => {
            return Err(format!(
                "Invalid arguments: expected an object, got {}",
                other
            ))
        }
    };

    for spec in params {
        match args.get(&spec.name) {
            Some(value) if !value.is_null() => {
                if !spec.kind.matches(value) {
                    return Err(format!(
                        "Invalid type for parameter '{}': expected {}",
                        spec.name,
                        spec.kind.as_str()
                    ));
                }
            }
            _ if spec.required => {
                return Err(format!("Missing required parameter: {}", spec.name));
            }
            _ => {
                if let Some(default) = &spec.default {
                    args.insert(spec.name.clone(), default.clone());
                }
            }
        }
    }
    Ok(args)
}

pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;

    #[async_trait]
    impl Tool for Echo {
        fn name(&self) -> &str {
            "echo"
        }

        fn description(&self) -> &str {
            "Echo text back"
        }

        fn parameters(&self) -> Vec<ParamSpec> {
            vec![
                ParamSpec::required("text", ParamKind::String, "Text to echo"),
                ParamSpec::optional("times", ParamKind::Integer, "Repetitions")
                    .with_default(json!(1)),
            ]
        }

        async fn execute(&self, args: ToolArgs, ctx: &ToolContext) -> anyhow::Result<ToolResult> {
            let text = args["text"].as_str().unwrap_or_default();
            let times = args["times"].as_u64().unwrap_or(0) as usize;
            Ok(ToolResult::ok(text.repeat(times))
                .with_metadata(json!({ "session_id": ctx.session_id })))
        }
    }

    struct Faulty {
        panic: bool,
    }

    #[async_trait]
    impl Tool for Faulty {
        fn name(&self) -> &str {
            "faulty"
        }

        fn description(&self) -> &str {
            "Always breaks"
        }

        fn parameters(&self) -> Vec<ParamSpec> {
            Vec::new()
        }

        async fn execute(&self, _args: ToolArgs, _ctx: &ToolContext) -> anyhow::Result<ToolResult> {
            if self.panic {
                panic!("index out of bounds");
            }
            anyhow::bail!("search backend unavailable")
        }
    }

    fn registry() -> ToolRegistry {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(Echo));
        registry
    }

    #[tokio::test]
    async fn test_unknown_tool_is_a_failed_result() {
        let result = registry()
            .invoke("nope", json!({}), &ToolContext::new("s1"))
            .await;
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("Tool not found: nope"));
    }

    #[tokio::test]
    async fn test_defaults_and_context_reach_executor() {
        let result = registry()
            .invoke("echo", json!({"text": "hi"}), &ToolContext::new("s1"))
            .await;
        assert!(result.success);
        assert_eq!(result.output, "hi");
        assert_eq!(result.metadata.unwrap()["session_id"], "s1");
    }

    #[tokio::test]
    async fn test_missing_required_parameter() {
        let result = registry()
            .invoke("echo", json!({"times": 2}), &ToolContext::new("s1"))
            .await;
        assert!(!result.success);
        assert_eq!(
            result.error.as_deref(),
            Some("Missing required parameter: text")
        );
    }

    #[tokio::test]
    async fn test_wrong_parameter_type() {
        let result = registry()
            .invoke("echo", json!({"text": "a", "times": "two"}), &ToolContext::new("s1"))
            .await;
        assert!(!result.success);
        assert!(result.error.unwrap().contains("expected integer"));
    }

    #[tokio::test]
    async fn test_executor_error_becomes_failed_result() {
        let mut registry = registry();
        registry.register(Arc::new(Faulty { panic: false }));
        let result = registry
            .invoke("faulty", Value::Null, &ToolContext::new("s1"))
            .await;
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("search backend unavailable"));
    }

    #[tokio::test]
    async fn test_executor_panic_becomes_failed_result() {
        let mut registry = registry();
        registry.register(Arc::new(Faulty { panic: true }));
        let result = registry
            .invoke("faulty", json!({}), &ToolContext::new("s1"))
            .await;
        assert!(!result.success);
        assert!(result.error.unwrap().contains("index out of bounds"));
    }

    #[tokio::test]
    async fn test_reregistration_overwrites() {
        let mut registry = registry();
        registry.register(Arc::new(Faulty { panic: false }));
        let previous = registry.register(Arc::new(Faulty { panic: true }));
        assert!(previous.is_some());
        assert_eq!(registry.list_tools().len(), 2);
    }

    #[test]
    fn test_definitions_schema() {
        let defs = registry().definitions();
        assert_eq!(defs.len(), 1);
        let params = &defs[0].parameters;
        assert_eq!(params["properties"]["text"]["type"], "string");
        assert_eq!(params["properties"]["times"]["default"], 1);
        assert_eq!(params["required"], json!(["text"]));
    }

    #[test]
    fn test_non_object_arguments_rejected() {
        let err = validate_args(&[], json!([1, 2])).unwrap_err();
        assert!(err.starts_with("Invalid arguments"));
    }
}

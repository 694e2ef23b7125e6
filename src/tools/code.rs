//! Code execution inside the session's leased sandbox.

use async_trait::async_trait;
use serde_json::json;

use super::{ParamKind, ParamSpec, Tool, ToolArgs, ToolContext, ToolResult};
use crate::sandbox::SharedSandboxPool;
use crate::util::truncate_chars;

/// Maximum characters of stdout/stderr kept in the tool output.
const MAX_OUTPUT_CHARS: usize = 10_000;

/// Run a code snippet in a remote sandbox.
///
/// The sandbox is leased under the calling session's id, so consecutive
/// calls from one session share interpreter state.
pub struct RunCode {
    pool: SharedSandboxPool,
}

impl RunCode {
    pub fn new(pool: SharedSandboxPool) -> Self {
        Self { pool }
    }
}

fn truncate(text: &str) -> String {
    if text.chars().count() <= MAX_OUTPUT_CHARS {
        return text.to_string();
    }
    format!("{}\n[output truncated]", truncate_chars(text, MAX_OUTPUT_CHARS))
}

#[async_trait]
impl Tool for RunCode {
    fn name(&self) -> &str {
        "run_code"
    }

    fn description(&self) -> &str {
        "Execute code in an isolated sandbox. State persists between calls within the same task."
    }

    fn parameters(&self) -> Vec<ParamSpec> {
        vec![
            ParamSpec::required("code", ParamKind::String, "Source code to execute"),
            ParamSpec::optional("language", ParamKind::String, "Language of the code")
                .with_default(json!("python")),
        ]
    }

    async fn execute(&self, args: ToolArgs, ctx: &ToolContext) -> anyhow::Result<ToolResult> {
        let code = args.get("code").and_then(|v| v.as_str()).unwrap_or_default();
        let language = args
            .get("language")
            .and_then(|v| v.as_str())
            .unwrap_or("python");

        let out = self.pool.run_code(&ctx.session_id, code, language).await?;

        let mut output = truncate(&out.stdout);
        if !out.stderr.is_empty() {
            output.push_str("\n\n--- stderr ---\n");
            output.push_str(&truncate(&out.stderr));
        }

        let metadata = json!({
            "language": language,
            "stdout_len": out.stdout.len(),
            "stderr_len": out.stderr.len(),
        });

        let result = match out.error {
            Some(error) => ToolResult {
                output,
                ..ToolResult::failure(error)
            },
            None => ToolResult::ok(output),
        };
        Ok(result.with_metadata(metadata))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use crate::config::SandboxConfig;
    use crate::credentials::{Credential, CredentialPool};
    use crate::sandbox::SandboxPool;
    use crate::test_support::MockSandboxProvider;
    use crate::tools::ToolRegistry;

    fn registry(provider: Arc<MockSandboxProvider>, creds: usize) -> (ToolRegistry, SharedSandboxPool) {
        let credentials = (0..creds)
            .map(|i| Credential::new(format!("c{}", i), "t"))
            .collect();
        let pool = Arc::new(SandboxPool::new(
            provider,
            Arc::new(CredentialPool::new(credentials, Duration::from_secs(300))),
            &SandboxConfig::default(),
        ));
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(RunCode::new(pool.clone())));
        (registry, pool)
    }

    #[tokio::test]
    async fn test_run_code_defaults_to_python() {
        let provider = Arc::new(MockSandboxProvider::new());
        let (registry, pool) = registry(provider, 1);

        let result = registry
            .invoke("run_code", json!({"code": "1+1"}), &ToolContext::new("s1"))
            .await;
        assert!(result.success);
        assert_eq!(result.output, "ran python: 1+1");
        assert!(pool.lease("s1").await.is_some());
    }

    #[tokio::test]
    async fn test_sandbox_failure_is_a_failed_result() {
        let provider = Arc::new(MockSandboxProvider::new());
        let (registry, _pool) = registry(provider, 0);

        let result = registry
            .invoke("run_code", json!({"code": "1+1"}), &ToolContext::new("s1"))
            .await;
        assert!(!result.success);
        assert_eq!(
            result.error.as_deref(),
            Some("no sandbox credentials configured")
        );
    }

    #[tokio::test]
    async fn test_runtime_error_keeps_output() {
        let provider = Arc::new(MockSandboxProvider::new());
        provider.set_run_error("NameError: x is not defined");
        let (registry, _pool) = registry(provider, 1);

        let result = registry
            .invoke("run_code", json!({"code": "x"}), &ToolContext::new("s1"))
            .await;
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("NameError: x is not defined"));
        assert!(result.output.starts_with("ran python"));
    }

    #[test]
    fn test_truncate_long_output() {
        let long = "x".repeat(MAX_OUTPUT_CHARS + 5);
        assert!(truncate(&long).ends_with("[output truncated]"));
        assert_eq!(truncate("short"), "short");
    }
}

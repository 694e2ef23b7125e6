//! Language-model collaborator.
//!
//! The session loop only needs `complete(messages)`; everything about the
//! vendor (endpoint, auth, retries) lives behind [`LanguageModel`], with
//! OpenRouter as the production implementation.

mod error;
mod openrouter;

pub use error::{classify_http_status, LlmError, LlmErrorKind, RetryConfig};
pub use openrouter::OpenRouterClient;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Role in a chat conversation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// A message in a chat conversation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }
}

/// Result of one completion: free text, plus the parsed JSON object when the
/// model answered in structured form.
#[derive(Debug, Clone, Default)]
pub struct Completion {
    pub text: String,
    pub structured: Option<serde_json::Value>,
}

impl Completion {
    /// Build from raw model text, parsing it as JSON when possible.
    pub fn from_text(text: impl Into<String>) -> Self {
        let text = text.into();
        let structured = extract_json(&text);
        Self { text, structured }
    }
}

/// Find a JSON object in model output.
///
/// Accepts a bare object, a fenced ```json block, or an object embedded in prose.
pub fn extract_json(text: &str) -> Option<serde_json::Value> {
    let trimmed = text.trim();
    if let Ok(value @ serde_json::Value::Object(_)) = serde_json::from_str(trimmed) {
        return Some(value);
    }

    let unfenced = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|s| s.strip_suffix("```"))
        .map(str::trim);
    if let Some(inner) = unfenced {
        if let Ok(value @ serde_json::Value::Object(_)) = serde_json::from_str(inner) {
            return Some(value);
        }
    }

    let start = trimmed.find('{')?;
    let end = trimmed.rfind('}')?;
    if end <= start {
        return None;
    }
    match serde_json::from_str(&trimmed[start..=end]) {
        Ok(value @ serde_json::Value::Object(_)) => Some(value),
        _ => None,
    }
}

/// Opaque language-model call used by the session loop.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// Complete a conversation.
    ///
    /// Rate-limit failures must come back as `LlmErrorKind::RateLimited` so
    /// the caller can defer instead of failing.
    async fn complete(&self, messages: &[ChatMessage]) -> Result<Completion, LlmError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_extract_bare_object() {
        assert_eq!(
            extract_json(r#" {"action": "answer", "answer": "42"} "#),
            Some(json!({"action": "answer", "answer": "42"}))
        );
    }

    #[test]
    fn test_extract_fenced_and_embedded() {
        let fenced = "```json\n{\"a\": 1}\n```";
        assert_eq!(extract_json(fenced), Some(json!({"a": 1})));

        let prose = "Sure, here you go: {\"a\": 2} hope that helps";
        assert_eq!(extract_json(prose), Some(json!({"a": 2})));
    }

    #[test]
    fn test_extract_rejects_non_objects() {
        assert_eq!(extract_json("[1, 2]"), None);
        assert_eq!(extract_json("no json here"), None);
        assert!(Completion::from_text("plain").structured.is_none());
    }
}

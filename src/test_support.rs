//! Test doubles shared by the unit tests.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::credentials::Credential;
use crate::llm::{ChatMessage, Completion, LanguageModel, LlmError};
use crate::sandbox::{ExecutionOutput, ProvisionError, SandboxHandle, SandboxProvider};

pub(crate) type Reply = Result<Completion, LlmError>;

pub(crate) fn answer(text: &str) -> Reply {
    Ok(Completion::from_text(
        json!({"action": "answer", "answer": text}).to_string(),
    ))
}

pub(crate) fn tool_call(tool: &str, args: Value) -> Reply {
    Ok(Completion::from_text(
        json!({"action": "tool", "tool": tool, "args": args}).to_string(),
    ))
}

pub(crate) fn step_complete(summary: &str) -> Reply {
    Ok(Completion::from_text(
        json!({"action": "step_complete", "summary": summary}).to_string(),
    ))
}

/// Language model that replays a fixed script, then repeats a fallback reply.
pub(crate) struct ScriptedModel {
    script: Mutex<VecDeque<Reply>>,
    fallback: Reply,
    delay: Option<Duration>,
    calls: Mutex<Vec<Vec<ChatMessage>>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl ScriptedModel {
    pub(crate) fn new(script: Vec<Reply>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            fallback: answer("done"),
            delay: None,
            calls: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    /// Same reply forever.
    pub(crate) fn repeating(reply: Reply) -> Self {
        Self {
            fallback: reply,
            ..Self::new(Vec::new())
        }
    }

    /// Fail every call once the script runs out.
    pub(crate) fn then_error(mut self, error: LlmError) -> Self {
        self.fallback = Err(error);
        self
    }

    /// Simulate a slow model.
    pub(crate) fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub(crate) fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub(crate) fn calls(&self) -> Vec<Vec<ChatMessage>> {
        self.calls.lock().unwrap().clone()
    }

    /// Highest number of overlapping `complete` calls seen.
    pub(crate) fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LanguageModel for ScriptedModel {
    async fn complete(&self, messages: &[ChatMessage]) -> Result<Completion, LlmError> {
        self.calls.lock().unwrap().push(messages.to_vec());
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        let next = self.script.lock().unwrap().pop_front();
        next.unwrap_or_else(|| self.fallback.clone())
    }
}

/// Language model backed by a closure over the request messages.
pub(crate) struct FnModel<F>(pub F);

#[async_trait]
impl<F> LanguageModel for FnModel<F>
where
    F: Fn(&[ChatMessage]) -> Reply + Send + Sync,
{
    async fn complete(&self, messages: &[ChatMessage]) -> Result<Completion, LlmError> {
        tokio::task::yield_now().await;
        (self.0)(messages)
    }
}

#[derive(Default)]
struct ProviderState {
    quota: HashSet<String>,
    errors: HashMap<String, String>,
    fail_destroy: bool,
    run_error: Option<String>,
    /// One-shot non-quota failures, consumed by the next creates
    fail_next: VecDeque<String>,
    create_delay: Option<Duration>,
}

/// Sandbox provider that keeps everything in memory.
#[derive(Default)]
pub(crate) struct MockSandboxProvider {
    state: Mutex<ProviderState>,
    attempts: AtomicUsize,
    created: AtomicUsize,
    destroyed: AtomicUsize,
}

impl MockSandboxProvider {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Every create with this credential fails with a quota error.
    pub(crate) fn fail_with_quota(&self, credential_id: &str) {
        self.state.lock().unwrap().quota.insert(credential_id.to_string());
    }

    /// Every create with this credential fails with a non-quota error.
    pub(crate) fn fail_with_error(&self, credential_id: &str, message: &str) {
        self.state
            .lock()
            .unwrap()
            .errors
            .insert(credential_id.to_string(), message.to_string());
    }

    /// The next create (with any credential) fails with a non-quota error.
    pub(crate) fn fail_next_create(&self, message: &str) {
        self.state
            .lock()
            .unwrap()
            .fail_next
            .push_back(message.to_string());
    }

    /// Every create takes `delay` before answering.
    pub(crate) fn set_create_delay(&self, delay: Duration) {
        self.state.lock().unwrap().create_delay = Some(delay);
    }

    pub(crate) fn fail_destroy(&self) {
        self.state.lock().unwrap().fail_destroy = true;
    }

    pub(crate) fn set_run_error(&self, error: &str) {
        self.state.lock().unwrap().run_error = Some(error.to_string());
    }

    pub(crate) fn create_attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub(crate) fn created_count(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub(crate) fn destroyed_count(&self) -> usize {
        self.destroyed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SandboxProvider for MockSandboxProvider {
    async fn create(
        &self,
        credential: &Credential,
        _timeout: Duration,
    ) -> Result<SandboxHandle, ProvisionError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let delay = self.state.lock().unwrap().create_delay;
        match delay {
            Some(delay) => tokio::time::sleep(delay).await,
            None => tokio::task::yield_now().await,
        }

        {
            let mut state = self.state.lock().unwrap();
            if let Some(message) = state.fail_next.pop_front() {
                return Err(ProvisionError::Other(message));
            }
            if state.quota.contains(&credential.id) {
                return Err(ProvisionError::Quota(format!(
                    "monthly quota exceeded for {}",
                    credential.id
                )));
            }
            if let Some(message) = state.errors.get(&credential.id) {
                return Err(ProvisionError::Other(message.clone()));
            }
        }

        let n = self.created.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(SandboxHandle {
            id: format!("sb-{}", n),
            credential_id: credential.id.clone(),
            token: credential.token.clone(),
        })
    }

    async fn destroy(&self, _handle: &SandboxHandle) -> Result<(), ProvisionError> {
        self.destroyed.fetch_add(1, Ordering::SeqCst);
        if self.state.lock().unwrap().fail_destroy {
            return Err(ProvisionError::Other("sandbox already gone".to_string()));
        }
        Ok(())
    }

    async fn run_code(
        &self,
        _handle: &SandboxHandle,
        code: &str,
        language: &str,
    ) -> Result<ExecutionOutput, ProvisionError> {
        Ok(ExecutionOutput {
            stdout: format!("ran {}: {}", language, code),
            stderr: String::new(),
            error: self.state.lock().unwrap().run_error.clone(),
        })
    }
}

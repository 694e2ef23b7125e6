//! The think/act/observe loop.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{broadcast, watch};
use tokio::time::Instant;

use super::context::{build_messages, parse_plan, plan_messages, replan_messages, Decision};
use super::control::{stopped, ControlSignal, SessionControl};
use super::{AgentSession, SessionEvent, SessionEventKind, SessionStatus};
use crate::config::SessionConfig;
use crate::llm::{ChatMessage, Completion, LanguageModel, LlmError};
use crate::tools::{ToolContext, ToolRegistry};
use crate::util::{now_string, truncate_chars};

/// How a run of the loop ended.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionOutcome {
    /// Final answer, last step finished, or iteration cap reached
    Completed {
        result: String,
        max_iterations_reached: bool,
    },
    /// Unrecoverable fault (model unreachable, timeout)
    Failed { error: String },
    /// Rate limited; session is paused with its memory intact
    Deferred {
        reason: String,
        retry_after: Option<Duration>,
    },
    /// Stopped from outside
    Stopped,
}

/// Persists session progress after every iteration.
#[async_trait]
pub trait Checkpoint: Send + Sync {
    async fn save(&self, session: &AgentSession) -> Result<(), String>;
}

/// Why a model call did not produce a completion.
enum Interrupt {
    Stopped,
    Model(LlmError),
}

/// Drives sessions to a terminal (or deferred) state.
pub struct SessionRunner {
    model: Arc<dyn LanguageModel>,
    tools: Arc<ToolRegistry>,
    config: SessionConfig,
    events: Option<broadcast::Sender<SessionEvent>>,
    checkpoint: Option<Arc<dyn Checkpoint>>,
}

impl SessionRunner {
    pub fn new(
        model: Arc<dyn LanguageModel>,
        tools: Arc<ToolRegistry>,
        config: SessionConfig,
    ) -> Self {
        Self {
            model,
            tools,
            config,
            events: None,
            checkpoint: None,
        }
    }

    pub fn with_events(mut self, events: broadcast::Sender<SessionEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn with_checkpoint(mut self, checkpoint: Arc<dyn Checkpoint>) -> Self {
        self.checkpoint = Some(checkpoint);
        self
    }

    /// Run `session` until it reaches a terminal state, is deferred, or times out.
    ///
    /// A fresh session starts from `Idle`; a paused or interrupted one resumes
    /// at its next unexecuted step with its memory intact.
    pub async fn run(
        &self,
        session: &mut AgentSession,
        ctx: &ToolContext,
        control: &SessionControl,
    ) -> SessionOutcome {
        if session.is_terminal() {
            return match session.status {
                SessionStatus::Failed => SessionOutcome::Failed {
                    error: session.error_message.clone().unwrap_or_default(),
                },
                _ => SessionOutcome::Completed {
                    result: session.result.clone().unwrap_or_default(),
                    max_iterations_reached: false,
                },
            };
        }

        let timeout = self.config.timeout;
        let deadline = Instant::now() + timeout;
        tracing::info!(
            session_id = %session.id,
            iteration = session.iteration,
            current_step = session.current_step,
            "Session starting"
        );

        match tokio::time::timeout_at(deadline, self.drive(session, ctx, control)).await {
            Ok(outcome) => outcome,
            Err(_) => {
                let error = format!("session timed out after {}s", timeout.as_secs());
                tracing::warn!(session_id = %session.id, "{}", error);
                self.finish(session, control, SessionOutcome::Failed { error })
                    .await
            }
        }
    }

    async fn drive(
        &self,
        session: &mut AgentSession,
        ctx: &ToolContext,
        control: &SessionControl,
    ) -> SessionOutcome {
        let mut signals = control.signals();
        session.mark_interrupted();
        self.set_status(session, control, SessionStatus::Thinking);

        if self.config.plan_before_execute && session.steps.is_empty() && session.iteration == 0 {
            let messages = plan_messages(&session.goal, &self.tools.definitions());
            match self.ask(&messages, &mut signals).await {
                Ok(completion) => match parse_plan(&completion) {
                    Some(steps) => {
                        session.replace_remaining_steps(steps);
                        self.emit_plan(session);
                        self.save(session).await;
                    }
                    None => tracing::warn!(
                        session_id = %session.id,
                        "Model returned no usable plan, continuing without one"
                    ),
                },
                Err(interrupt) => return self.interrupted(session, control, interrupt).await,
            }
        }

        loop {
            if let Some(outcome) = self.check_control(session, control, &mut signals).await {
                return outcome;
            }

            if session.iteration >= session.max_iterations {
                let last = session
                    .memory
                    .last()
                    .map(|e| truncate_chars(&e.result, 500))
                    .unwrap_or_else(|| "no observations".to_string());
                let result = format!(
                    "max iterations reached ({}). Last observation: {}",
                    session.max_iterations, last
                );
                tracing::info!(session_id = %session.id, "Session hit iteration cap");
                return self
                    .finish(
                        session,
                        control,
                        SessionOutcome::Completed {
                            result,
                            max_iterations_reached: true,
                        },
                    )
                    .await;
            }

            // Think
            session.iteration += 1;
            self.set_status(session, control, SessionStatus::Thinking);
            self.emit(
                session,
                SessionEventKind::Thinking {
                    iteration: session.iteration,
                },
            );

            let messages = build_messages(
                session,
                &self.tools.definitions(),
                self.config.context_window,
            );
            let completion = match self.ask(&messages, &mut signals).await {
                Ok(completion) => completion,
                Err(interrupt) => return self.interrupted(session, control, interrupt).await,
            };

            // Act
            let decision = match Decision::from_completion(&completion) {
                Ok(decision) => decision,
                Err(message) => {
                    tracing::warn!(session_id = %session.id, "Invalid decision: {}", message);
                    session.record("invalid_decision", None, message, false);
                    self.save(session).await;
                    continue;
                }
            };

            match decision {
                Decision::Answer { answer } => {
                    session.record("answer", None, answer.clone(), true);
                    return self
                        .finish(
                            session,
                            control,
                            SessionOutcome::Completed {
                                result: answer,
                                max_iterations_reached: false,
                            },
                        )
                        .await;
                }
                Decision::StepComplete { summary } => {
                    let step = session.current_step + 1;
                    session.record("step_complete", None, summary.clone(), true);
                    let finished = session.complete_step(&summary);
                    self.emit(
                        session,
                        SessionEventKind::StepCompleted {
                            step,
                            summary: summary.clone(),
                        },
                    );
                    if finished {
                        return self
                            .finish(
                                session,
                                control,
                                SessionOutcome::Completed {
                                    result: summary,
                                    max_iterations_reached: false,
                                },
                            )
                            .await;
                    }
                }
                Decision::Tool { tool, args } => {
                    self.set_status(session, control, SessionStatus::Executing);
                    self.emit(
                        session,
                        SessionEventKind::ToolCall {
                            iteration: session.iteration,
                            tool: tool.clone(),
                            args: args.clone(),
                        },
                    );

                    let result = tokio::select! {
                        biased;
                        _ = stopped(&mut signals) => {
                            return self.finish(session, control, SessionOutcome::Stopped).await;
                        }
                        result = self.tools.invoke(&tool, args.clone(), ctx) => result,
                    };

                    // Observe
                    self.set_status(session, control, SessionStatus::Observing);
                    let summary = result.summary();
                    session.record(tool.clone(), Some(args), summary.clone(), result.success);
                    session.artifacts.extend(result.artifacts.iter().cloned());
                    self.emit(
                        session,
                        SessionEventKind::ToolResult {
                            iteration: session.iteration,
                            tool,
                            success: result.success,
                            summary: truncate_chars(&summary, 500),
                            duration_ms: result.duration_ms,
                        },
                    );

                    if !result.success && self.config.replan_on_error && !session.steps.is_empty()
                    {
                        let messages = replan_messages(
                            session,
                            &self.tools.definitions(),
                            self.config.context_window,
                            &summary,
                        );
                        match self.ask(&messages, &mut signals).await {
                            Ok(completion) => self.apply_replan(session, &completion),
                            Err(interrupt) => {
                                return self.interrupted(session, control, interrupt).await
                            }
                        }
                    }
                }
            }

            self.save(session).await;
        }
    }

    /// Call the model, giving up early if the session is stopped.
    async fn ask(
        &self,
        messages: &[ChatMessage],
        signals: &mut watch::Receiver<ControlSignal>,
    ) -> Result<Completion, Interrupt> {
        tokio::select! {
            biased;
            _ = stopped(signals) => Err(Interrupt::Stopped),
            result = self.model.complete(messages) => result.map_err(Interrupt::Model),
        }
    }

    fn apply_replan(&self, session: &mut AgentSession, completion: &Completion) {
        match parse_plan(completion) {
            Some(steps) => {
                tracing::info!(
                    session_id = %session.id,
                    new_steps = steps.len(),
                    "Replanning remaining steps after failure"
                );
                session.replace_remaining_steps(steps);
                self.emit_plan(session);
            }
            None => tracing::warn!(session_id = %session.id, "Replan produced no steps, keeping plan"),
        }
    }

    async fn interrupted(
        &self,
        session: &mut AgentSession,
        control: &SessionControl,
        interrupt: Interrupt,
    ) -> SessionOutcome {
        let outcome = match interrupt {
            Interrupt::Stopped => SessionOutcome::Stopped,
            Interrupt::Model(e) if e.is_rate_limited() => SessionOutcome::Deferred {
                reason: e.to_string(),
                retry_after: e.retry_after,
            },
            Interrupt::Model(e) => SessionOutcome::Failed {
                error: format!("Model call failed: {}", e),
            },
        };
        self.finish(session, control, outcome).await
    }

    /// Apply pause/stop requests between iterations.
    async fn check_control(
        &self,
        session: &mut AgentSession,
        control: &SessionControl,
        signals: &mut watch::Receiver<ControlSignal>,
    ) -> Option<SessionOutcome> {
        let signal = *signals.borrow_and_update();
        match signal {
            ControlSignal::Run => None,
            ControlSignal::Stop => Some(self.finish(session, control, SessionOutcome::Stopped).await),
            ControlSignal::Pause => {
                self.set_status(session, control, SessionStatus::Paused);
                self.save(session).await;
                tracing::info!(session_id = %session.id, "Session paused");

                loop {
                    if signals.changed().await.is_err() {
                        return Some(self.finish(session, control, SessionOutcome::Stopped).await);
                    }
                    let signal = *signals.borrow_and_update();
                    match signal {
                        ControlSignal::Run => {
                            tracing::info!(session_id = %session.id, "Session resumed");
                            self.set_status(session, control, SessionStatus::Thinking);
                            return None;
                        }
                        ControlSignal::Stop => {
                            return Some(
                                self.finish(session, control, SessionOutcome::Stopped).await,
                            )
                        }
                        ControlSignal::Pause => continue,
                    }
                }
            }
        }
    }

    /// Record the outcome on the session, publish it and checkpoint.
    async fn finish(
        &self,
        session: &mut AgentSession,
        control: &SessionControl,
        outcome: SessionOutcome,
    ) -> SessionOutcome {
        match &outcome {
            SessionOutcome::Completed { result, .. } => {
                session.result = Some(result.clone());
                self.set_status(session, control, SessionStatus::Completed);
                self.emit(
                    session,
                    SessionEventKind::Completed {
                        result: result.clone(),
                    },
                );
            }
            SessionOutcome::Stopped => {
                let result = session
                    .result
                    .get_or_insert_with(|| "Stopped by user".to_string())
                    .clone();
                self.set_status(session, control, SessionStatus::Completed);
                self.emit(session, SessionEventKind::Completed { result });
            }
            SessionOutcome::Failed { error } => {
                session.error_message = Some(error.clone());
                self.set_status(session, control, SessionStatus::Failed);
                self.emit(
                    session,
                    SessionEventKind::Failed {
                        error: error.clone(),
                    },
                );
            }
            SessionOutcome::Deferred { reason, .. } => {
                tracing::warn!(session_id = %session.id, "Session deferred: {}", reason);
                self.set_status(session, control, SessionStatus::Paused);
            }
        }
        self.save(session).await;
        tracing::info!(
            session_id = %session.id,
            status = %session.status,
            iterations = session.iteration,
            "Session finished run"
        );
        outcome
    }

    fn set_status(&self, session: &mut AgentSession, control: &SessionControl, status: SessionStatus) {
        if session.status == status {
            return;
        }
        if let Err(e) = session.transition(status) {
            tracing::error!(session_id = %session.id, "{}", e);
            return;
        }
        control.publish_status(status);
        self.emit(session, SessionEventKind::StatusChanged { status });
    }

    fn emit_plan(&self, session: &AgentSession) {
        let steps = session.steps.iter().map(|s| s.description.clone()).collect();
        self.emit(session, SessionEventKind::PlanUpdated { steps });
    }

    fn emit(&self, session: &AgentSession, kind: SessionEventKind) {
        if let Some(events) = &self.events {
            let _ = events.send(SessionEvent {
                session_id: session.id.clone(),
                task_id: session.task_id,
                kind,
                timestamp: now_string(),
            });
        }
    }

    async fn save(&self, session: &AgentSession) {
        if let Some(checkpoint) = &self.checkpoint {
            if let Err(e) = checkpoint.save(session).await {
                tracing::warn!(session_id = %session.id, "Failed to checkpoint session: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{answer, step_complete, tool_call, ScriptedModel};
    use crate::tools::{ParamKind, ParamSpec, Tool, ToolArgs, ToolResult};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Mutex;

    struct Counter {
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl Tool for Counter {
        fn name(&self) -> &str {
            "count"
        }

        fn description(&self) -> &str {
            "Increment a counter"
        }

        fn parameters(&self) -> Vec<ParamSpec> {
            vec![ParamSpec::optional("by", ParamKind::Integer, "Amount").with_default(json!(1))]
        }

        async fn execute(&self, args: ToolArgs, _ctx: &ToolContext) -> anyhow::Result<ToolResult> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if self.fail {
                anyhow::bail!("counter jammed");
            }
            Ok(ToolResult::ok(format!("{} (+{})", n, args["by"])))
        }
    }

    fn registry(fail: bool) -> Arc<ToolRegistry> {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(Counter {
            calls: AtomicUsize::new(0),
            fail,
        }));
        Arc::new(registry)
    }

    fn config(max_iterations: usize) -> SessionConfig {
        SessionConfig {
            max_iterations,
            plan_before_execute: false,
            ..SessionConfig::default()
        }
    }

    #[derive(Default)]
    struct Recorder {
        saved: Mutex<Vec<AgentSession>>,
    }

    #[async_trait]
    impl Checkpoint for Recorder {
        async fn save(&self, session: &AgentSession) -> Result<(), String> {
            self.saved.lock().await.push(session.clone());
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_tool_then_answer() {
        let model = Arc::new(ScriptedModel::new(vec![
            tool_call("count", json!({})),
            answer("counted once"),
        ]));
        let runner = SessionRunner::new(model, registry(false), config(5));
        let mut session = AgentSession::new("count", 5);

        let outcome = runner
            .run(&mut session, &ToolContext::new("s"), &SessionControl::new())
            .await;

        assert_eq!(
            outcome,
            SessionOutcome::Completed {
                result: "counted once".into(),
                max_iterations_reached: false
            }
        );
        assert_eq!(session.status, SessionStatus::Completed);
        assert_eq!(session.iteration, 2);
        assert_eq!(session.memory[0].action, "count");
        assert_eq!(session.memory[0].result, "1 (+1)");
    }

    #[tokio::test]
    async fn test_iteration_cap_completes_not_fails() {
        let model = Arc::new(ScriptedModel::repeating(tool_call("count", json!({}))));
        let runner = SessionRunner::new(model.clone(), registry(false), config(3));
        let mut session = AgentSession::new("count forever", 3);

        let outcome = runner
            .run(&mut session, &ToolContext::new("s"), &SessionControl::new())
            .await;

        match outcome {
            SessionOutcome::Completed {
                result,
                max_iterations_reached,
            } => {
                assert!(max_iterations_reached);
                assert!(result.starts_with("max iterations reached"));
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        assert_eq!(session.iteration, 3);
        assert_eq!(model.call_count(), 3);
        assert_eq!(session.status, SessionStatus::Completed);
    }

    #[tokio::test]
    async fn test_failed_tool_is_an_observation() {
        let model = Arc::new(ScriptedModel::new(vec![
            tool_call("count", json!({})),
            tool_call("missing_tool", json!({})),
            answer("gave up gracefully"),
        ]));
        let runner = SessionRunner::new(model, registry(true), config(5));
        let mut session = AgentSession::new("count", 5);

        let outcome = runner
            .run(&mut session, &ToolContext::new("s"), &SessionControl::new())
            .await;

        assert!(matches!(outcome, SessionOutcome::Completed { .. }));
        assert!(!session.memory[0].success);
        assert_eq!(session.memory[0].result, "error: counter jammed");
        assert_eq!(session.memory[1].result, "error: Tool not found: missing_tool");
    }

    #[tokio::test]
    async fn test_model_failure_fails_session() {
        let model = Arc::new(ScriptedModel::new(vec![]).then_error(LlmError::client_error(
            401,
            "bad key",
        )));
        let runner = SessionRunner::new(model, registry(false), config(5));
        let mut session = AgentSession::new("count", 5);

        let outcome = runner
            .run(&mut session, &ToolContext::new("s"), &SessionControl::new())
            .await;

        assert!(matches!(outcome, SessionOutcome::Failed { .. }));
        assert_eq!(session.status, SessionStatus::Failed);
        assert!(session.error_message.unwrap().contains("bad key"));
    }

    #[tokio::test]
    async fn test_rate_limit_defers_and_keeps_memory() {
        let model = Arc::new(
            ScriptedModel::new(vec![tool_call("count", json!({}))])
                .then_error(LlmError::rate_limited("slow down", None)),
        );
        let runner = SessionRunner::new(model, registry(false), config(5));
        let mut session = AgentSession::new("count", 5);

        let outcome = runner
            .run(&mut session, &ToolContext::new("s"), &SessionControl::new())
            .await;

        assert!(matches!(outcome, SessionOutcome::Deferred { .. }));
        assert_eq!(session.status, SessionStatus::Paused);
        assert_eq!(session.memory.len(), 1);
    }

    #[tokio::test]
    async fn test_plan_then_steps_complete_session() {
        let model = Arc::new(ScriptedModel::new(vec![
            answer_json(json!({"steps": ["fetch", "report"]})),
            step_complete("fetched"),
            step_complete("reported"),
        ]));
        let runner = SessionRunner::new(
            model,
            registry(false),
            SessionConfig {
                plan_before_execute: true,
                ..config(5)
            },
        );
        let mut session = AgentSession::new("fetch and report", 5);

        let outcome = runner
            .run(&mut session, &ToolContext::new("s"), &SessionControl::new())
            .await;

        assert_eq!(
            outcome,
            SessionOutcome::Completed {
                result: "reported".into(),
                max_iterations_reached: false
            }
        );
        assert_eq!(session.current_step, 2);
        assert!(session.steps.iter().all(|s| s.done));
    }

    fn answer_json(value: serde_json::Value) -> Result<Completion, LlmError> {
        Ok(Completion::from_text(value.to_string()))
    }

    #[tokio::test]
    async fn test_replan_after_failed_tool() {
        let model = Arc::new(ScriptedModel::new(vec![
            tool_call("count", json!({})),
            answer_json(json!({"steps": ["try another way"]})),
            answer("done"),
        ]));
        let runner = SessionRunner::new(model, registry(true), config(5));
        let mut session = AgentSession::new("goal", 5);
        session.replace_remaining_steps(vec!["count".into(), "report".into()]);

        runner
            .run(&mut session, &ToolContext::new("s"), &SessionControl::new())
            .await;

        let steps: Vec<&str> = session.steps.iter().map(|s| s.description.as_str()).collect();
        assert_eq!(steps, vec!["try another way"]);
    }

    #[tokio::test]
    async fn test_checkpoint_after_each_iteration() {
        let model = Arc::new(ScriptedModel::new(vec![
            tool_call("count", json!({})),
            tool_call("count", json!({})),
            answer("done"),
        ]));
        let recorder = Arc::new(Recorder::default());
        let runner = SessionRunner::new(model, registry(false), config(5))
            .with_checkpoint(recorder.clone());
        let mut session = AgentSession::new("goal", 5);

        runner
            .run(&mut session, &ToolContext::new("s"), &SessionControl::new())
            .await;

        let saved = recorder.saved.lock().await;
        let iterations: Vec<usize> = saved.iter().map(|s| s.iteration).collect();
        assert_eq!(iterations, vec![1, 2, 3]);
        assert_eq!(saved[2].status, SessionStatus::Completed);
    }

    #[tokio::test]
    async fn test_events_are_ordered() {
        let model = Arc::new(ScriptedModel::new(vec![
            tool_call("count", json!({})),
            answer("done"),
        ]));
        let (tx, mut rx) = broadcast::channel(64);
        let runner = SessionRunner::new(model, registry(false), config(5)).with_events(tx);
        let mut session = AgentSession::new("goal", 5);

        runner
            .run(&mut session, &ToolContext::new("s"), &SessionControl::new())
            .await;

        let mut kinds = Vec::new();
        while let Ok(event) = rx.try_recv() {
            kinds.push(serde_json::to_value(&event.kind).unwrap()["type"].clone());
        }
        let kinds: Vec<&str> = kinds.iter().filter_map(|k| k.as_str()).collect();
        assert_eq!(
            kinds,
            vec![
                "status_changed", // thinking
                "thinking",
                "status_changed", // executing
                "tool_call",
                "status_changed", // observing
                "tool_result",
                "status_changed", // thinking
                "thinking",
                "status_changed", // completed
                "completed",
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_fails_session() {
        let model = Arc::new(
            ScriptedModel::repeating(tool_call("count", json!({})))
                .with_delay(Duration::from_secs(60)),
        );
        let runner = SessionRunner::new(
            model,
            registry(false),
            SessionConfig {
                timeout: Duration::from_secs(90),
                ..config(10)
            },
        );
        let mut session = AgentSession::new("slow", 10);

        let outcome = runner
            .run(&mut session, &ToolContext::new("s"), &SessionControl::new())
            .await;

        assert_eq!(
            outcome,
            SessionOutcome::Failed {
                error: "session timed out after 90s".into()
            }
        );
        assert_eq!(session.status, SessionStatus::Failed);
        assert_eq!(session.iteration, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pause_resume_and_stop() {
        let model = Arc::new(
            ScriptedModel::repeating(tool_call("count", json!({})))
                .with_delay(Duration::from_secs(1)),
        );
        let runner = Arc::new(SessionRunner::new(model, registry(false), config(100)));
        let control = SessionControl::new();
        let handle = tokio::spawn({
            let runner = runner.clone();
            let control = control.clone();
            async move {
                let mut session = AgentSession::new("loop", 100);
                let outcome = runner
                    .run(&mut session, &ToolContext::new("s"), &control)
                    .await;
                (outcome, session)
            }
        });

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(control.pause());
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(control.status(), SessionStatus::Paused);

        assert!(control.resume());
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(control.status().is_running());

        control.stop();
        let (outcome, session) = handle.await.unwrap();
        assert_eq!(outcome, SessionOutcome::Stopped);
        assert_eq!(session.status, SessionStatus::Completed);
        assert_eq!(session.result.as_deref(), Some("Stopped by user"));
    }
}

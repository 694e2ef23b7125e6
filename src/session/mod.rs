//! Agent sessions - one goal driven through think, act, observe.
//!
//! ```text
//! idle -> thinking -> executing -> observing -> thinking ...
//!            |            |            |
//!            +------------+------------+--> completed | failed   (terminal)
//!            +------------+------------+--> paused -> thinking   (resume)
//! ```
//!
//! The [`SessionRunner`] owns the loop. Sessions are plain serialisable data
//! so the scheduler can persist them after every iteration and resume them
//! after a restart.

mod context;
mod control;
mod runner;

pub use context::{build_messages, parse_plan, Decision};
pub use control::{ControlSignal, SessionControl};
pub use runner::{Checkpoint, SessionOutcome, SessionRunner};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::task::{TaskId, TaskStep};
use crate::tools::Artifact;
use crate::util::now_string;

/// Session state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Idle,
    Thinking,
    Executing,
    Observing,
    Paused,
    Completed,
    Failed,
}

impl SessionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionStatus::Completed | SessionStatus::Failed)
    }

    /// Inside an iteration (what `pause()` requires).
    pub fn is_running(&self) -> bool {
        matches!(
            self,
            SessionStatus::Thinking | SessionStatus::Executing | SessionStatus::Observing
        )
    }

    /// Whether `self -> next` is a legal transition.
    ///
    /// # Property
    /// `is_terminal() => !can_transition_to(_)`
    pub fn can_transition_to(&self, next: SessionStatus) -> bool {
        use SessionStatus::*;
        if self.is_terminal() {
            return false;
        }
        match next {
            Idle => false,
            Thinking => matches!(self, Idle | Observing | Paused),
            Executing => *self == Thinking,
            Observing => *self == Executing,
            Paused => self.is_running(),
            Completed | Failed => true,
        }
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SessionStatus::Idle => "idle",
            SessionStatus::Thinking => "thinking",
            SessionStatus::Executing => "executing",
            SessionStatus::Observing => "observing",
            SessionStatus::Paused => "paused",
            SessionStatus::Completed => "completed",
            SessionStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Errors raised by session bookkeeping.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("invalid session transition from {from} to {to}")]
    InvalidTransition {
        from: SessionStatus,
        to: SessionStatus,
    },
}

/// One observation in the session's memory log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryEntry {
    pub iteration: usize,
    /// Tool name, or a pseudo-action such as `step_complete`
    pub action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<serde_json::Value>,
    pub result: String,
    pub success: bool,
    pub timestamp: String,
}

/// A running (or persisted) agent session.
///
/// # Invariants
/// - `iteration <= max_iterations`
/// - once `status.is_terminal()`, no field changes any more
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentSession {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<TaskId>,
    pub goal: String,
    pub status: SessionStatus,
    pub iteration: usize,
    pub max_iterations: usize,
    #[serde(default)]
    pub steps: Vec<TaskStep>,
    /// Index of the next unexecuted step
    #[serde(default)]
    pub current_step: usize,
    #[serde(default)]
    pub memory: Vec<MemoryEntry>,
    #[serde(default)]
    pub artifacts: Vec<Artifact>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl AgentSession {
    pub fn new(goal: impl Into<String>, max_iterations: usize) -> Self {
        let now = now_string();
        Self {
            id: Uuid::new_v4().to_string(),
            task_id: None,
            goal: goal.into(),
            status: SessionStatus::Idle,
            iteration: 0,
            max_iterations,
            steps: Vec::new(),
            current_step: 0,
            memory: Vec::new(),
            artifacts: Vec::new(),
            result: None,
            error_message: None,
            created_at: now.clone(),
            updated_at: now,
        }
    }

    /// Session for a task, carrying over its plan and progress.
    pub fn for_task(task: &crate::task::Task, max_iterations: usize) -> Self {
        Self {
            task_id: Some(task.id),
            steps: task.steps.clone(),
            current_step: task.current_step.min(task.steps.len()),
            ..Self::new(task.objective.clone(), max_iterations)
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Move to `next` if the state machine allows it.
    pub fn transition(&mut self, next: SessionStatus) -> Result<(), SessionError> {
        if self.status == next {
            return Ok(());
        }
        if !self.status.can_transition_to(next) {
            return Err(SessionError::InvalidTransition {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        self.updated_at = now_string();
        Ok(())
    }

    /// Treat an in-flight status left by a crash as paused, so it can resume.
    pub fn mark_interrupted(&mut self) {
        if self.status.is_running() {
            self.status = SessionStatus::Paused;
            self.updated_at = now_string();
        }
    }

    pub fn record(
        &mut self,
        action: impl Into<String>,
        args: Option<serde_json::Value>,
        result: impl Into<String>,
        success: bool,
    ) {
        self.memory.push(MemoryEntry {
            iteration: self.iteration,
            action: action.into(),
            args,
            result: result.into(),
            success,
            timestamp: now_string(),
        });
        self.updated_at = now_string();
    }

    /// Mark the current step done. Returns `true` when that was the last one.
    pub fn complete_step(&mut self, summary: &str) -> bool {
        if let Some(step) = self.steps.get_mut(self.current_step) {
            step.done = true;
            step.result = Some(summary.to_string());
            self.current_step += 1;
        }
        !self.steps.is_empty() && self.current_step >= self.steps.len()
    }

    /// Replace every not-yet-executed step with a new plan.
    pub fn replace_remaining_steps(&mut self, steps: Vec<String>) {
        self.steps.truncate(self.current_step);
        self.steps.extend(steps.into_iter().map(TaskStep::new));
    }

    /// Step the session is working on, as `(1-based index, total, description)`.
    pub fn current_step_info(&self) -> Option<(usize, usize, &str)> {
        self.steps
            .get(self.current_step)
            .map(|s| (self.current_step + 1, self.steps.len(), s.description.as_str()))
    }
}

/// What happened inside a session.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEventKind {
    StatusChanged { status: SessionStatus },
    PlanUpdated { steps: Vec<String> },
    Thinking { iteration: usize },
    ToolCall {
        iteration: usize,
        tool: String,
        args: serde_json::Value,
    },
    ToolResult {
        iteration: usize,
        tool: String,
        success: bool,
        summary: String,
        duration_ms: u64,
    },
    StepCompleted {
        step: usize,
        summary: String,
    },
    Completed { result: String },
    Failed { error: String },
}

/// One entry of a session's ordered event stream.
#[derive(Debug, Clone, Serialize)]
pub struct SessionEvent {
    pub session_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<TaskId>,
    #[serde(flatten)]
    pub kind: SessionEventKind,
    pub timestamp: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states_are_final() {
        for next in [
            SessionStatus::Thinking,
            SessionStatus::Paused,
            SessionStatus::Failed,
        ] {
            assert!(!SessionStatus::Completed.can_transition_to(next));
        }
        assert!(!SessionStatus::Failed.can_transition_to(SessionStatus::Completed));
    }

    #[test]
    fn test_pause_only_while_running() {
        assert!(!SessionStatus::Idle.can_transition_to(SessionStatus::Paused));
        assert!(SessionStatus::Thinking.can_transition_to(SessionStatus::Paused));
        assert!(SessionStatus::Observing.can_transition_to(SessionStatus::Paused));
        assert!(SessionStatus::Paused.can_transition_to(SessionStatus::Thinking));
    }

    #[test]
    fn test_transition_rejects_skips() {
        let mut session = AgentSession::new("goal", 5);
        let err = session.transition(SessionStatus::Observing).unwrap_err();
        assert_eq!(
            err,
            SessionError::InvalidTransition {
                from: SessionStatus::Idle,
                to: SessionStatus::Observing
            }
        );
        session.transition(SessionStatus::Thinking).unwrap();
        session.transition(SessionStatus::Executing).unwrap();
        session.transition(SessionStatus::Observing).unwrap();
        session.transition(SessionStatus::Completed).unwrap();
        assert!(session.transition(SessionStatus::Thinking).is_err());
    }

    #[test]
    fn test_step_progress_and_replan() {
        let mut session = AgentSession::new("goal", 5);
        session.replace_remaining_steps(vec!["a".into(), "b".into(), "c".into()]);
        assert!(!session.complete_step("did a"));
        assert_eq!(session.current_step_info(), Some((2, 3, "b")));

        session.replace_remaining_steps(vec!["b2".into()]);
        assert_eq!(session.steps.len(), 2);
        assert!(session.steps[0].done);
        assert!(session.complete_step("did b2"));
        assert_eq!(session.current_step_info(), None);
    }

    #[test]
    fn test_interrupted_session_becomes_paused() {
        let mut session = AgentSession::new("goal", 5);
        session.transition(SessionStatus::Thinking).unwrap();
        session.transition(SessionStatus::Executing).unwrap();
        session.mark_interrupted();
        assert_eq!(session.status, SessionStatus::Paused);
    }

    #[test]
    fn test_session_round_trips_through_json() {
        let mut session = AgentSession::new("goal", 5);
        session.iteration = 2;
        session.record("run_code", None, "4", true);
        session.error_message = Some("boom".into());
        let json = serde_json::to_string(&session).unwrap();
        let back: AgentSession = serde_json::from_str(&json).unwrap();
        assert_eq!(back, session);
    }

    #[test]
    fn test_event_serialises_flat() {
        let event = SessionEvent {
            session_id: "s1".into(),
            task_id: None,
            kind: SessionEventKind::Thinking { iteration: 3 },
            timestamp: now_string(),
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "thinking");
        assert_eq!(value["iteration"], 3);
    }
}

//! Durable task record.
//!
//! # Invariants
//! - `current_step <= steps.len()`
//! - `steps[..current_step]` are all `done`
//! - at most one session runs against a task (claiming flips `Pending -> InProgress`)

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::session::AgentSession;
use crate::util::now_string;

/// Unique identifier for a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(Uuid);

impl TaskId {
    /// Create a new unique task ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }

    pub fn parse(s: &str) -> Result<Self, TaskError> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| TaskError::InvalidId(format!("{}: {}", s, e)))
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Status of a task in its lifecycle.
///
/// ```text
/// Pending -> InProgress -> Completed
///    ^           |     \-> Failed
///    \-- requeue-/
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Result<Self, TaskError> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "in_progress" => Ok(TaskStatus::InProgress),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            other => Err(TaskError::InvalidStatus(other.to_string())),
        }
    }

    /// # Property
    /// `is_terminal() => no further transitions`
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }

    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, next),
            (Pending, InProgress)
                | (Pending, Failed)
                | (Pending, Completed)
                | (InProgress, Pending)
                | (InProgress, Completed)
                | (InProgress, Failed)
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One step of a task's plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskStep {
    pub description: String,
    #[serde(default)]
    pub done: bool,
    /// Summary recorded when the step was completed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
}

impl TaskStep {
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            done: false,
            result: None,
        }
    }
}

/// A unit of work picked up by the scheduler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub objective: String,
    pub status: TaskStatus,
    /// Identity of whoever submitted the task
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    #[serde(default)]
    pub steps: Vec<TaskStep>,
    /// Index of the next unexecuted step
    #[serde(default)]
    pub current_step: usize,
    /// Times the task was requeued after a deferral
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    /// Last persisted session state, used to resume after a restart
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session: Option<AgentSession>,
    pub created_at: String,
    pub updated_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archived_at: Option<String>,
}

impl Task {
    /// Create a pending task.
    ///
    /// # Errors
    /// Returns `Err` if `objective` is blank.
    pub fn new(objective: impl Into<String>, owner: Option<String>) -> Result<Self, TaskError> {
        let objective = objective.into();
        if objective.trim().is_empty() {
            return Err(TaskError::EmptyObjective);
        }
        let now = now_string();
        Ok(Self {
            id: TaskId::new(),
            objective,
            status: TaskStatus::Pending,
            owner,
            steps: Vec::new(),
            current_step: 0,
            retry_count: 0,
            error_message: None,
            result: None,
            session: None,
            created_at: now.clone(),
            updated_at: now,
            started_at: None,
            completed_at: None,
            archived_at: None,
        })
    }

    pub fn with_steps<I, S>(mut self, steps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.steps = steps.into_iter().map(TaskStep::new).collect();
        self
    }

    /// Steps not yet executed.
    pub fn remaining_steps(&self) -> &[TaskStep] {
        &self.steps[self.current_step.min(self.steps.len())..]
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Fields written together with a status change.
#[derive(Debug, Clone, Default)]
pub struct TaskUpdate {
    pub error_message: Option<String>,
    pub result: Option<String>,
    pub session: Option<AgentSession>,
    /// Stamp `archived_at` (terminal tasks only)
    pub archive: bool,
}

impl TaskUpdate {
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            error_message: Some(error.into()),
            ..Self::default()
        }
    }

    pub fn completed(result: impl Into<String>) -> Self {
        Self {
            result: Some(result.into()),
            ..Self::default()
        }
    }

    pub fn with_session(mut self, session: AgentSession) -> Self {
        self.session = Some(session);
        self
    }

    pub fn archived(mut self) -> Self {
        self.archive = true;
        self
    }
}

/// Errors that can occur during task operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TaskError {
    #[error("Task objective cannot be empty")]
    EmptyObjective,

    #[error("Invalid task id {0}")]
    InvalidId(String),

    #[error("Unknown task status: {0}")]
    InvalidStatus(String),
}

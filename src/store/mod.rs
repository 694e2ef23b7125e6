//! Task storage with pluggable backends.
//!
//! Supports:
//! - `memory`: In-memory storage (non-persistent, for testing)
//! - `sqlite`: SQLite database, survives restarts
//!
//! Claiming a task is the only mutual-exclusion mechanism between pollers:
//! `claim` flips `pending -> in_progress` atomically and reports whether this
//! caller won.

mod memory;
mod sqlite;

pub use memory::InMemoryTaskStore;
pub use sqlite::SqliteTaskStore;

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;

use crate::session::AgentSession;
use crate::task::{Task, TaskId, TaskStatus, TaskStep, TaskUpdate};
use crate::util::now_string;

/// Task store trait - implemented by all storage backends.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Whether this store persists data across restarts.
    fn is_persistent(&self) -> bool;

    /// Insert a new task.
    async fn create_task(&self, task: Task) -> Result<Task, String>;

    /// Pending tasks, oldest first.
    async fn list_pending(&self, limit: usize) -> Result<Vec<Task>, String>;

    /// All tasks in `status`, oldest first.
    async fn list_by_status(&self, status: TaskStatus) -> Result<Vec<Task>, String>;

    async fn load_by_id(&self, id: TaskId) -> Result<Option<Task>, String>;

    /// Atomically move a pending task to `in_progress`.
    ///
    /// Returns `false` if the task is missing or was not pending.
    async fn claim(&self, id: TaskId) -> Result<bool, String>;

    /// Change status and write the accompanying fields.
    ///
    /// Same-status updates only write fields. Transitions out of a terminal
    /// state are rejected.
    async fn update_status(
        &self,
        id: TaskId,
        status: TaskStatus,
        update: TaskUpdate,
    ) -> Result<(), String>;

    /// Apply a status change only if the task is still `pending`.
    ///
    /// Checked and written atomically with respect to `claim`, so a task
    /// claimed in the meantime is left alone. Returns whether it applied.
    async fn update_if_pending(
        &self,
        id: TaskId,
        status: TaskStatus,
        update: TaskUpdate,
    ) -> Result<bool, String>;

    /// Persist step progress and the latest session snapshot.
    async fn save_progress(
        &self,
        id: TaskId,
        steps: &[TaskStep],
        current_step: usize,
        session: &AgentSession,
    ) -> Result<(), String>;

    /// Put an in-progress task back to `pending`, keeping its progress.
    async fn requeue(
        &self,
        id: TaskId,
        retry_count: u32,
        session: Option<&AgentSession>,
    ) -> Result<(), String>;

    /// Delete a task.
    async fn delete_task(&self, id: TaskId) -> Result<bool, String>;
}

/// Apply a status change to an in-memory record.
///
/// Shared by the backends so both enforce the same lifecycle.
pub(crate) fn apply_update(
    task: &mut Task,
    status: TaskStatus,
    update: TaskUpdate,
) -> Result<(), String> {
    if task.status != status && !task.status.can_transition_to(status) {
        return Err(format!(
            "Task {} cannot move from {} to {}",
            task.id, task.status, status
        ));
    }
    if task.status.is_terminal() && task.status == status && !update.archive {
        return Err(format!("Task {} is already {}", task.id, status));
    }

    let now = now_string();
    if status == TaskStatus::InProgress && task.started_at.is_none() {
        task.started_at = Some(now.clone());
    }
    if status.is_terminal() && task.completed_at.is_none() {
        task.completed_at = Some(now.clone());
    }
    if update.archive && status.is_terminal() {
        task.archived_at = Some(now.clone());
    }
    if let Some(error) = update.error_message {
        task.error_message = Some(error);
    }
    if let Some(result) = update.result {
        task.result = Some(result);
    }
    if let Some(session) = update.session {
        task.steps = session.steps.clone();
        task.current_step = session.current_step;
        task.session = Some(session);
    }
    task.status = status;
    task.updated_at = now;
    Ok(())
}

/// Task store type selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TaskStoreType {
    Memory,
    #[default]
    Sqlite,
}

impl TaskStoreType {
    /// Parse from environment variable value.
    pub fn from_str(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "memory" => Self::Memory,
            "sqlite" | "db" => Self::Sqlite,
            _ => Self::default(),
        }
    }
}

/// Create a task store based on type and configuration.
pub async fn create_task_store(
    store_type: TaskStoreType,
    base_dir: PathBuf,
) -> Result<Arc<dyn TaskStore>, String> {
    match store_type {
        TaskStoreType::Memory => Ok(Arc::new(InMemoryTaskStore::new())),
        TaskStoreType::Sqlite => {
            let store = SqliteTaskStore::new(base_dir).await?;
            Ok(Arc::new(store))
        }
    }
}

//! In-memory task store (non-persistent).

use super::{apply_update, TaskStore};
use crate::session::AgentSession;
use crate::task::{Task, TaskId, TaskStatus, TaskStep, TaskUpdate};
use crate::util::now_string;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Clone)]
pub struct InMemoryTaskStore {
    tasks: Arc<RwLock<HashMap<TaskId, Task>>>,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self {
            tasks: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    async fn with_status(&self, status: TaskStatus, limit: usize) -> Vec<Task> {
        let mut tasks: Vec<Task> = self
            .tasks
            .read()
            .await
            .values()
            .filter(|t| t.status == status)
            .cloned()
            .collect();
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        tasks.truncate(limit);
        tasks
    }
}

impl Default for InMemoryTaskStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    fn is_persistent(&self) -> bool {
        false
    }

    async fn create_task(&self, task: Task) -> Result<Task, String> {
        let mut tasks = self.tasks.write().await;
        if tasks.contains_key(&task.id) {
            return Err(format!("Task {} already exists", task.id));
        }
        tasks.insert(task.id, task.clone());
        Ok(task)
    }

    async fn list_pending(&self, limit: usize) -> Result<Vec<Task>, String> {
        Ok(self.with_status(TaskStatus::Pending, limit).await)
    }

    async fn list_by_status(&self, status: TaskStatus) -> Result<Vec<Task>, String> {
        Ok(self.with_status(status, usize::MAX).await)
    }

    async fn load_by_id(&self, id: TaskId) -> Result<Option<Task>, String> {
        Ok(self.tasks.read().await.get(&id).cloned())
    }

    async fn claim(&self, id: TaskId) -> Result<bool, String> {
        let mut tasks = self.tasks.write().await;
        match tasks.get_mut(&id) {
            Some(task) if task.status == TaskStatus::Pending => {
                apply_update(task, TaskStatus::InProgress, TaskUpdate::default())?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn update_status(
        &self,
        id: TaskId,
        status: TaskStatus,
        update: TaskUpdate,
    ) -> Result<(), String> {
        let mut tasks = self.tasks.write().await;
        let task = tasks
            .get_mut(&id)
            .ok_or_else(|| format!("Task {} not found", id))?;
        apply_update(task, status, update)
    }

    async fn update_if_pending(
        &self,
        id: TaskId,
        status: TaskStatus,
        update: TaskUpdate,
    ) -> Result<bool, String> {
        let mut tasks = self.tasks.write().await;
        match tasks.get_mut(&id) {
            Some(task) if task.status == TaskStatus::Pending => {
                apply_update(task, status, update)?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn save_progress(
        &self,
        id: TaskId,
        steps: &[TaskStep],
        current_step: usize,
        session: &AgentSession,
    ) -> Result<(), String> {
        let mut tasks = self.tasks.write().await;
        let task = tasks
            .get_mut(&id)
            .ok_or_else(|| format!("Task {} not found", id))?;
        if task.is_terminal() {
            return Err(format!("Task {} is already {}", id, task.status));
        }
        task.steps = steps.to_vec();
        task.current_step = current_step.min(steps.len());
        task.session = Some(session.clone());
        task.updated_at = now_string();
        Ok(())
    }

    async fn requeue(
        &self,
        id: TaskId,
        retry_count: u32,
        session: Option<&AgentSession>,
    ) -> Result<(), String> {
        let mut tasks = self.tasks.write().await;
        let task = tasks
            .get_mut(&id)
            .ok_or_else(|| format!("Task {} not found", id))?;
        let update = TaskUpdate {
            session: session.cloned(),
            ..TaskUpdate::default()
        };
        apply_update(task, TaskStatus::Pending, update)?;
        task.retry_count = retry_count;
        Ok(())
    }

    async fn delete_task(&self, id: TaskId) -> Result<bool, String> {
        Ok(self.tasks.write().await.remove(&id).is_some())
    }
}

//! SQLite-based task store.

use super::{apply_update, TaskStore};
use crate::session::AgentSession;
use crate::task::{Task, TaskId, TaskStatus, TaskStep, TaskUpdate};
use crate::util::now_string;
use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;

const SCHEMA: &str = r#"
PRAGMA journal_mode = WAL;

CREATE TABLE IF NOT EXISTS tasks (
    id TEXT PRIMARY KEY NOT NULL,
    objective TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'pending',
    owner TEXT,
    steps TEXT NOT NULL DEFAULT '[]',
    current_step INTEGER NOT NULL DEFAULT 0,
    retry_count INTEGER NOT NULL DEFAULT 0,
    error_message TEXT,
    result TEXT,
    session TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    started_at TEXT,
    completed_at TEXT,
    archived_at TEXT
);

CREATE INDEX IF NOT EXISTS idx_tasks_status_created ON tasks(status, created_at);
"#;

const SELECT_TASK: &str = "SELECT id, objective, status, owner, steps, current_step, retry_count,
        error_message, result, session, created_at, updated_at, started_at,
        completed_at, archived_at
 FROM tasks";

pub struct SqliteTaskStore {
    conn: Arc<Mutex<Connection>>,
}

/// Raw column values, decoded into a [`Task`] outside the row callback.
struct TaskRow {
    id: String,
    objective: String,
    status: String,
    owner: Option<String>,
    steps: String,
    current_step: i64,
    retry_count: i64,
    error_message: Option<String>,
    result: Option<String>,
    session: Option<String>,
    created_at: String,
    updated_at: String,
    started_at: Option<String>,
    completed_at: Option<String>,
    archived_at: Option<String>,
}

impl TaskRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            objective: row.get(1)?,
            status: row.get(2)?,
            owner: row.get(3)?,
            steps: row.get(4)?,
            current_step: row.get(5)?,
            retry_count: row.get(6)?,
            error_message: row.get(7)?,
            result: row.get(8)?,
            session: row.get(9)?,
            created_at: row.get(10)?,
            updated_at: row.get(11)?,
            started_at: row.get(12)?,
            completed_at: row.get(13)?,
            archived_at: row.get(14)?,
        })
    }

    fn into_task(self) -> Result<Task, String> {
        let steps: Vec<TaskStep> = serde_json::from_str(&self.steps)
            .map_err(|e| format!("Corrupt steps for task {}: {}", self.id, e))?;
        let session = match self.session {
            Some(json) => Some(
                serde_json::from_str::<AgentSession>(&json)
                    .map_err(|e| format!("Corrupt session for task {}: {}", self.id, e))?,
            ),
            None => None,
        };
        Ok(Task {
            id: TaskId::parse(&self.id).map_err(|e| e.to_string())?,
            objective: self.objective,
            status: TaskStatus::parse(&self.status).map_err(|e| e.to_string())?,
            owner: self.owner,
            steps,
            current_step: self.current_step.max(0) as usize,
            retry_count: self.retry_count.max(0) as u32,
            error_message: self.error_message,
            result: self.result,
            session,
            created_at: self.created_at,
            updated_at: self.updated_at,
            started_at: self.started_at,
            completed_at: self.completed_at,
            archived_at: self.archived_at,
        })
    }
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String, String> {
    serde_json::to_string(value).map_err(|e| e.to_string())
}

fn load(conn: &Connection, id: &str) -> Result<Option<Task>, String> {
    let row = conn
        .query_row(
            &format!("{} WHERE id = ?1", SELECT_TASK),
            params![id],
            TaskRow::from_row,
        )
        .optional()
        .map_err(|e| e.to_string())?;
    row.map(TaskRow::into_task).transpose()
}

/// Fail a live task whose row can no longer be decoded, so it stops
/// occupying poll batches.
fn quarantine(conn: &Connection, id: &str, error: &str) {
    let now = now_string();
    let result = conn.execute(
        "UPDATE tasks SET status = 'failed', error_message = ?2, completed_at = ?3, updated_at = ?3
         WHERE id = ?1 AND status IN ('pending', 'in_progress')",
        params![id, error, now],
    );
    if let Err(e) = result {
        tracing::warn!(task_id = %id, "Failed to mark undecodable task as failed: {}", e);
    }
}

/// Write every mutable column of `task` back.
fn write(conn: &Connection, task: &Task) -> Result<(), String> {
    let session = task.session.as_ref().map(to_json).transpose()?;
    conn.execute(
        "UPDATE tasks SET status = ?2, steps = ?3, current_step = ?4, retry_count = ?5,
                error_message = ?6, result = ?7, session = ?8, updated_at = ?9,
                started_at = ?10, completed_at = ?11, archived_at = ?12
         WHERE id = ?1",
        params![
            task.id.to_string(),
            task.status.as_str(),
            to_json(&task.steps)?,
            task.current_step as i64,
            task.retry_count as i64,
            task.error_message,
            task.result,
            session,
            task.updated_at,
            task.started_at,
            task.completed_at,
            task.archived_at,
        ],
    )
    .map_err(|e| e.to_string())?;
    Ok(())
}

impl SqliteTaskStore {
    pub async fn new(base_dir: PathBuf) -> Result<Self, String> {
        let db_path = base_dir.join("tasks.db");

        tokio::fs::create_dir_all(&base_dir)
            .await
            .map_err(|e| format!("Failed to create task store dir: {}", e))?;

        let conn = tokio::task::spawn_blocking(move || {
            let conn = Connection::open(&db_path)
                .map_err(|e| format!("Failed to open SQLite database: {}", e))?;

            conn.execute_batch(SCHEMA)
                .map_err(|e| format!("Failed to run schema: {}", e))?;

            Self::run_migrations(&conn)?;

            Ok::<_, String>(conn)
        })
        .await
        .map_err(|e| format!("Task join error: {}", e))??;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Add columns introduced after the first schema.
    fn run_migrations(conn: &Connection) -> Result<(), String> {
        for (column, ddl) in [
            (
                "retry_count",
                "ALTER TABLE tasks ADD COLUMN retry_count INTEGER NOT NULL DEFAULT 0",
            ),
            ("archived_at", "ALTER TABLE tasks ADD COLUMN archived_at TEXT"),
        ] {
            let exists: bool = conn
                .prepare("SELECT 1 FROM pragma_table_info('tasks') WHERE name = ?1")
                .map_err(|e| format!("Failed to check for {} column: {}", column, e))?
                .exists(params![column])
                .map_err(|e| format!("Failed to query table info: {}", e))?;

            if !exists {
                tracing::info!("Running migration: adding '{}' column to tasks table", column);
                conn.execute(ddl, [])
                    .map_err(|e| format!("Failed to add {} column: {}", column, e))?;
            }
        }
        Ok(())
    }

    /// Load a task, mutate it under the connection lock, and write it back.
    async fn modify<F>(&self, id: TaskId, f: F) -> Result<(), String>
    where
        F: FnOnce(&mut Task) -> Result<(), String> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.blocking_lock();
            let mut task =
                load(&conn, &id.to_string())?.ok_or_else(|| format!("Task {} not found", id))?;
            f(&mut task)?;
            write(&conn, &task)
        })
        .await
        .map_err(|e| e.to_string())?
    }

    async fn query(&self, status: TaskStatus, limit: usize) -> Result<Vec<Task>, String> {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.blocking_lock();
            let mut stmt = conn
                .prepare(&format!(
                    "{} WHERE status = ?1 ORDER BY created_at ASC LIMIT ?2",
                    SELECT_TASK
                ))
                .map_err(|e| e.to_string())?;
            let limit = i64::try_from(limit).unwrap_or(i64::MAX);
            let rows = stmt
                .query_map(params![status.as_str(), limit], TaskRow::from_row)
                .map_err(|e| e.to_string())?
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| e.to_string())?;
            let mut tasks = Vec::with_capacity(rows.len());
            for row in rows {
                let id = row.id.clone();
                match row.into_task() {
                    Ok(task) => tasks.push(task),
                    Err(e) => {
                        tracing::error!(task_id = %id, "Skipping undecodable task row: {}", e);
                        quarantine(&conn, &id, &e);
                    }
                }
            }
            Ok(tasks)
        })
        .await
        .map_err(|e| e.to_string())?
    }
}

#[async_trait]
impl TaskStore for SqliteTaskStore {
    fn is_persistent(&self) -> bool {
        true
    }

    async fn create_task(&self, task: Task) -> Result<Task, String> {
        let conn = self.conn.clone();
        let steps = to_json(&task.steps)?;
        let session = task.session.as_ref().map(to_json).transpose()?;
        let row = task.clone();

        tokio::task::spawn_blocking(move || {
            let conn = conn.blocking_lock();
            conn.execute(
                "INSERT INTO tasks (id, objective, status, owner, steps, current_step, retry_count,
                                    error_message, result, session, created_at, updated_at,
                                    started_at, completed_at, archived_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
                params![
                    row.id.to_string(),
                    row.objective,
                    row.status.as_str(),
                    row.owner,
                    steps,
                    row.current_step as i64,
                    row.retry_count as i64,
                    row.error_message,
                    row.result,
                    session,
                    row.created_at,
                    row.updated_at,
                    row.started_at,
                    row.completed_at,
                    row.archived_at,
                ],
            )
            .map_err(|e| format!("Failed to insert task: {}", e))?;
            Ok::<_, String>(())
        })
        .await
        .map_err(|e| e.to_string())??;

        Ok(task)
    }

    async fn list_pending(&self, limit: usize) -> Result<Vec<Task>, String> {
        self.query(TaskStatus::Pending, limit).await
    }

    async fn list_by_status(&self, status: TaskStatus) -> Result<Vec<Task>, String> {
        self.query(status, usize::MAX).await
    }

    async fn load_by_id(&self, id: TaskId) -> Result<Option<Task>, String> {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.blocking_lock();
            load(&conn, &id.to_string())
        })
        .await
        .map_err(|e| e.to_string())?
    }

    async fn claim(&self, id: TaskId) -> Result<bool, String> {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.blocking_lock();
            let now = now_string();
            let changed = conn
                .execute(
                    "UPDATE tasks
                     SET status = 'in_progress', updated_at = ?2,
                         started_at = COALESCE(started_at, ?2)
                     WHERE id = ?1 AND status = 'pending'",
                    params![id.to_string(), now],
                )
                .map_err(|e| e.to_string())?;
            Ok(changed == 1)
        })
        .await
        .map_err(|e| e.to_string())?
    }

    async fn update_status(
        &self,
        id: TaskId,
        status: TaskStatus,
        update: TaskUpdate,
    ) -> Result<(), String> {
        self.modify(id, move |task| apply_update(task, status, update))
            .await
    }

    async fn update_if_pending(
        &self,
        id: TaskId,
        status: TaskStatus,
        update: TaskUpdate,
    ) -> Result<bool, String> {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            // Same connection lock as `claim`, so check and write cannot interleave with it.
            let conn = conn.blocking_lock();
            match load(&conn, &id.to_string())? {
                Some(mut task) if task.status == TaskStatus::Pending => {
                    apply_update(&mut task, status, update)?;
                    write(&conn, &task)?;
                    Ok(true)
                }
                _ => Ok(false),
            }
        })
        .await
        .map_err(|e| e.to_string())?
    }

    async fn save_progress(
        &self,
        id: TaskId,
        steps: &[TaskStep],
        current_step: usize,
        session: &AgentSession,
    ) -> Result<(), String> {
        let steps = steps.to_vec();
        let session = session.clone();
        self.modify(id, move |task| {
            if task.is_terminal() {
                return Err(format!("Task {} is already {}", task.id, task.status));
            }
            task.current_step = current_step.min(steps.len());
            task.steps = steps;
            task.session = Some(session);
            task.updated_at = now_string();
            Ok(())
        })
        .await
    }

    async fn requeue(
        &self,
        id: TaskId,
        retry_count: u32,
        session: Option<&AgentSession>,
    ) -> Result<(), String> {
        let update = TaskUpdate {
            session: session.cloned(),
            ..TaskUpdate::default()
        };
        self.modify(id, move |task| {
            apply_update(task, TaskStatus::Pending, update)?;
            task.retry_count = retry_count;
            Ok(())
        })
        .await
    }

    async fn delete_task(&self, id: TaskId) -> Result<bool, String> {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.blocking_lock();
            let deleted = conn
                .execute("DELETE FROM tasks WHERE id = ?1", params![id.to_string()])
                .map_err(|e| e.to_string())?;
            Ok(deleted > 0)
        })
        .await
        .map_err(|e| e.to_string())?
    }
}

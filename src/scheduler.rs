//! Task scheduler - turns pending tasks into running sessions.
//!
//! A fixed-interval poll claims up to `batch_size` pending tasks and launches
//! one session per task while a slot is free. Slots are semaphore permits, so
//! the number of live sessions never exceeds `max_concurrent`.
//!
//! Every session runs in its own spawned task; the scheduler awaits its
//! `JoinHandle`, so a panicking session marks only its own task failed.
//! Progress is checkpointed after every iteration, which lets [`TaskScheduler::recover`]
//! resume an interrupted task at its next unexecuted step after a restart.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{broadcast, OwnedSemaphorePermit, RwLock, Semaphore};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::config::{SchedulerConfig, SessionConfig};
use crate::llm::LanguageModel;
use crate::sandbox::SharedSandboxPool;
use crate::session::{
    AgentSession, Checkpoint, SessionControl, SessionEvent, SessionOutcome, SessionRunner,
};
use crate::store::TaskStore;
use crate::task::{Task, TaskError, TaskId, TaskStatus, TaskUpdate};
use crate::tools::{panic_message, ToolContext, ToolRegistry};
use crate::util::now_string;

const EVENT_CAPACITY: usize = 1024;

/// What happened to a task.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskEventKind {
    /// A session was launched (fresh or resumed from a snapshot)
    Started { session_id: String, resumed: bool },
    /// Forwarded session step event
    Session { event: SessionEvent },
    /// Rate limited; back to pending
    Requeued { retry_count: u32, reason: String },
    /// Final status persisted
    Finished {
        status: TaskStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        result: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskEvent {
    pub task_id: TaskId,
    #[serde(flatten)]
    pub event: TaskEventKind,
    pub timestamp: String,
}

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error(transparent)]
    InvalidTask(#[from] TaskError),

    #[error("Task store error: {0}")]
    Store(String),
}

/// Writes session progress to the task row.
struct StoreCheckpoint {
    store: Arc<dyn TaskStore>,
    task_id: TaskId,
}

#[async_trait]
impl Checkpoint for StoreCheckpoint {
    async fn save(&self, session: &AgentSession) -> Result<(), String> {
        self.store
            .save_progress(self.task_id, &session.steps, session.current_step, session)
            .await
    }
}

struct RunningTask {
    session_id: String,
    control: SessionControl,
}

/// Polls the task store and runs sessions under a concurrency ceiling.
#[derive(Clone)]
pub struct TaskScheduler {
    store: Arc<dyn TaskStore>,
    model: Arc<dyn LanguageModel>,
    tools: Arc<ToolRegistry>,
    sandboxes: Option<SharedSandboxPool>,
    config: SchedulerConfig,
    session_config: SessionConfig,
    slots: Arc<Semaphore>,
    running: Arc<RwLock<HashMap<TaskId, RunningTask>>>,
    events: broadcast::Sender<TaskEvent>,
}

impl TaskScheduler {
    pub fn new(
        store: Arc<dyn TaskStore>,
        model: Arc<dyn LanguageModel>,
        tools: Arc<ToolRegistry>,
        config: SchedulerConfig,
        session_config: SessionConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            store,
            model,
            tools,
            sandboxes: None,
            slots: Arc::new(Semaphore::new(config.max_concurrent.max(1))),
            config,
            session_config,
            running: Arc::new(RwLock::new(HashMap::new())),
            events,
        }
    }

    /// Release each session's sandbox lease when its task terminates.
    pub fn with_sandbox_pool(mut self, pool: SharedSandboxPool) -> Self {
        self.sandboxes = Some(pool);
        self
    }

    pub fn store(&self) -> &Arc<dyn TaskStore> {
        &self.store
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.events.subscribe()
    }

    /// Number of sessions currently running.
    pub async fn running_count(&self) -> usize {
        self.running.read().await.len()
    }

    pub async fn is_running(&self, id: TaskId) -> bool {
        self.running.read().await.contains_key(&id)
    }

    /// Create a pending task.
    pub async fn submit(
        &self,
        objective: impl Into<String>,
        owner: Option<String>,
        steps: Vec<String>,
    ) -> Result<Task, SchedulerError> {
        let task = Task::new(objective, owner)?.with_steps(steps);
        let task = self
            .store
            .create_task(task)
            .await
            .map_err(SchedulerError::Store)?;
        tracing::info!(task_id = %task.id, steps = task.steps.len(), "Task submitted");
        Ok(task)
    }

    /// Stop a task.
    ///
    /// A running session is stopped at its next await point and the task is
    /// completed with "Stopped by user"; a pending task is completed directly.
    /// Returns `false` if the task is unknown or already terminal.
    pub async fn cancel(&self, id: TaskId) -> Result<bool, SchedulerError> {
        if self.stop_running(id).await {
            return Ok(true);
        }

        let result = "Stopped by user".to_string();
        let cancelled = self
            .store
            .update_if_pending(
                id,
                TaskStatus::Completed,
                TaskUpdate::completed(result.clone()).archived(),
            )
            .await
            .map_err(SchedulerError::Store)?;
        if !cancelled {
            // Claimed by a poll since we looked; stop it as a running task.
            return Ok(self.stop_running(id).await);
        }

        tracing::info!(task_id = %id, "Cancelled pending task");
        self.emit(
            id,
            TaskEventKind::Finished {
                status: TaskStatus::Completed,
                result: Some(result),
                error: None,
            },
        );
        Ok(true)
    }

    async fn stop_running(&self, id: TaskId) -> bool {
        match self.running.read().await.get(&id) {
            Some(running) => {
                tracing::info!(task_id = %id, session_id = %running.session_id, "Stopping task");
                running.control.stop();
                true
            }
            None => false,
        }
    }

    /// One scheduling tick. Returns how many sessions were launched.
    pub async fn poll_once(&self) -> Result<usize, String> {
        if self.slots.available_permits() == 0 {
            return Ok(0);
        }

        let pending = self.store.list_pending(self.config.batch_size).await?;
        let mut launched = 0;

        for task in pending {
            let permit = match self.slots.clone().try_acquire_owned() {
                Ok(permit) => permit,
                Err(_) => break,
            };
            if !self.store.claim(task.id).await? {
                tracing::debug!(task_id = %task.id, "Task claimed elsewhere, skipping");
                continue;
            }
            self.launch(task, permit).await;
            launched += 1;
        }

        if launched > 0 {
            tracing::debug!(launched, "Scheduler tick launched sessions");
        }
        Ok(launched)
    }

    /// Pick up tasks left `in_progress` by a previous process.
    ///
    /// Each is resumed from its last snapshot while a slot is free; the rest
    /// go back to pending with their progress kept.
    pub async fn recover(&self) -> Result<usize, String> {
        let orphaned = self.store.list_by_status(TaskStatus::InProgress).await?;
        let mut resumed = 0;

        for task in orphaned {
            if self.is_running(task.id).await {
                continue;
            }
            match self.slots.clone().try_acquire_owned() {
                Ok(permit) => {
                    tracing::info!(
                        task_id = %task.id,
                        current_step = task.current_step,
                        total_steps = task.steps.len(),
                        "Resuming interrupted task"
                    );
                    self.launch(task, permit).await;
                    resumed += 1;
                }
                Err(_) => {
                    tracing::info!(task_id = %task.id, "No free slot, requeueing interrupted task");
                    self.store
                        .requeue(task.id, task.retry_count, task.session.as_ref())
                        .await?;
                }
            }
        }
        Ok(resumed)
    }

    /// Start the poll loop. Recovery runs once before the first tick.
    pub fn start(&self) -> SchedulerHandle {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let scheduler = self.clone();
        let period = self.config.poll_interval;

        let join = tokio::spawn(async move {
            match scheduler.recover().await {
                Ok(0) => {}
                Ok(n) => tracing::info!(resumed = n, "Recovered interrupted tasks"),
                Err(e) => tracing::error!("Task recovery failed: {}", e),
            }

            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            tracing::info!(
                period_secs = period.as_secs(),
                max_concurrent = scheduler.config.max_concurrent,
                "Task scheduler started"
            );

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = interval.tick() => {
                        if let Err(e) = scheduler.poll_once().await {
                            tracing::error!("Scheduler tick failed: {}", e);
                        }
                    }
                }
            }

            let running = scheduler.running_count().await;
            tracing::info!(running, "Task scheduler stopped");
        });

        SchedulerHandle { cancel, join }
    }

    async fn launch(&self, task: Task, permit: OwnedSemaphorePermit) {
        let max_iterations = self.session_config.max_iterations;
        let (mut session, resumed) = match task.session.clone().filter(|s| !s.is_terminal()) {
            Some(mut snapshot) => {
                snapshot.mark_interrupted();
                snapshot.max_iterations = snapshot.max_iterations.max(max_iterations);
                (snapshot, true)
            }
            None => (AgentSession::for_task(&task, max_iterations), false),
        };
        session.task_id = Some(task.id);

        let control = SessionControl::new();
        let session_id = session.id.clone();
        self.running.write().await.insert(
            task.id,
            RunningTask {
                session_id: session_id.clone(),
                control: control.clone(),
            },
        );
        self.emit(
            task.id,
            TaskEventKind::Started {
                session_id: session_id.clone(),
                resumed,
            },
        );

        let ctx = ToolContext {
            owner: task.owner.clone(),
            session_id: session_id.clone(),
            task_id: Some(task.id.to_string()),
        };
        let worker = self.spawn_session(task.id, session, ctx, control);

        let scheduler = self.clone();
        tokio::spawn(async move {
            let _permit = permit;
            let joined = worker.await;
            scheduler.settle(&task, &session_id, joined).await;
            scheduler.running.write().await.remove(&task.id);
        });
    }

    fn spawn_session(
        &self,
        task_id: TaskId,
        mut session: AgentSession,
        ctx: ToolContext,
        control: SessionControl,
    ) -> JoinHandle<(SessionOutcome, AgentSession)> {
        let (tx, mut rx) = broadcast::channel::<SessionEvent>(EVENT_CAPACITY);
        let runner = SessionRunner::new(
            self.model.clone(),
            self.tools.clone(),
            self.session_config.clone(),
        )
        .with_events(tx)
        .with_checkpoint(Arc::new(StoreCheckpoint {
            store: self.store.clone(),
            task_id,
        }));

        let events = self.events.clone();
        tokio::spawn(async move {
            let forwarder = tokio::spawn(async move {
                loop {
                    match rx.recv().await {
                        Ok(event) => {
                            let _ = events.send(TaskEvent {
                                task_id,
                                event: TaskEventKind::Session { event },
                                timestamp: now_string(),
                            });
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            tracing::warn!(task_id = %task_id, skipped = n, "Session events lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            });

            let outcome = runner.run(&mut session, &ctx, &control).await;
            drop(runner);
            let _ = forwarder.await;
            (outcome, session)
        })
    }

    /// Persist how a session ended.
    async fn settle(
        &self,
        task: &Task,
        session_id: &str,
        joined: Result<(SessionOutcome, AgentSession), JoinError>,
    ) {
        let (status, update) = match joined {
            Ok((SessionOutcome::Deferred { reason, .. }, session)) => {
                let retry_count = task.retry_count + 1;
                if retry_count <= self.config.max_retries {
                    self.requeue(task.id, retry_count, reason, &session).await;
                    return;
                }
                let error = format!(
                    "Gave up after {} rate-limited attempts: {}",
                    retry_count, reason
                );
                (TaskStatus::Failed, TaskUpdate::failed(error).with_session(session))
            }
            Ok((SessionOutcome::Failed { error }, session)) => {
                (TaskStatus::Failed, TaskUpdate::failed(error).with_session(session))
            }
            Ok((SessionOutcome::Completed { result, .. }, session)) => (
                TaskStatus::Completed,
                TaskUpdate::completed(result).with_session(session),
            ),
            Ok((SessionOutcome::Stopped, session)) => {
                let result = session
                    .result
                    .clone()
                    .unwrap_or_else(|| "Stopped by user".to_string());
                (
                    TaskStatus::Completed,
                    TaskUpdate::completed(result).with_session(session),
                )
            }
            Err(e) => {
                let error = if e.is_panic() {
                    format!("Session panicked: {}", panic_message(&*e.into_panic()))
                } else {
                    format!("Session aborted: {}", e)
                };
                tracing::error!(task_id = %task.id, "{}", error);
                (TaskStatus::Failed, TaskUpdate::failed(error))
            }
        };

        let result = update.result.clone();
        let error = update.error_message.clone();
        if let Err(e) = self
            .store
            .update_status(task.id, status, update.archived())
            .await
        {
            tracing::error!(task_id = %task.id, "Failed to persist final status: {}", e);
        }

        if let Some(pool) = &self.sandboxes {
            pool.release(session_id).await;
        }

        tracing::info!(task_id = %task.id, status = %status, "Task finished");
        self.emit(
            task.id,
            TaskEventKind::Finished {
                status,
                result,
                error,
            },
        );
    }

    async fn requeue(&self, id: TaskId, retry_count: u32, reason: String, session: &AgentSession) {
        tracing::warn!(
            task_id = %id,
            retry_count,
            max_retries = self.config.max_retries,
            "Session deferred, requeueing task: {}",
            reason
        );
        if let Err(e) = self.store.requeue(id, retry_count, Some(session)).await {
            tracing::error!(task_id = %id, "Failed to requeue task: {}", e);
            return;
        }
        self.emit(id, TaskEventKind::Requeued { retry_count, reason });
    }

    fn emit(&self, task_id: TaskId, event: TaskEventKind) {
        let _ = self.events.send(TaskEvent {
            task_id,
            event,
            timestamp: now_string(),
        });
    }
}

/// Owns the poll loop.
pub struct SchedulerHandle {
    cancel: CancellationToken,
    join: JoinHandle<()>,
}

impl SchedulerHandle {
    /// Stop polling and wait for the loop to exit. Running sessions keep going.
    pub async fn stop(self) {
        self.cancel.cancel();
        if let Err(e) = self.join.await {
            tracing::warn!("Scheduler loop ended abnormally: {}", e);
        }
    }
}

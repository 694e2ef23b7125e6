//! # autotask
//!
//! Autonomous task execution core: a background scheduler that drives
//! goal-directed agent sessions, whose tools run inside leased remote sandboxes
//! provisioned from a rotating pool of credentials.
//!
//! ## Architecture
//!
//! ```text
//!   ┌────────────────┐  poll / claim   ┌─────────────┐
//!   │ TaskScheduler  │◄───────────────►│  TaskStore  │
//!   └───────┬────────┘   checkpoints   └─────────────┘
//!           │ one per task, bounded by a semaphore
//!           ▼
//!   ┌────────────────┐   complete()    ┌───────────────┐
//!   │ SessionRunner  │────────────────►│ LanguageModel │
//!   └───────┬────────┘                 └───────────────┘
//!           │ invoke(name, args)
//!           ▼
//!   ┌────────────────┐  get_or_create  ┌─────────────┐  acquire   ┌────────────────┐
//!   │  ToolRegistry  │────────────────►│ SandboxPool │───────────►│ CredentialPool │
//!   └────────────────┘                 └─────────────┘            └────────────────┘
//! ```
//!
//! ## Modules
//! - `credentials`: credential rotation with quota cooldown
//! - `sandbox`: lease table, provisioning with failover, reclamation sweep
//! - `tools`: typed tool contracts and the dispatch registry
//! - `session`: the think/act/observe loop
//! - `scheduler`: polling, concurrency ceiling, crash recovery
//! - `store`: durable task storage

pub mod config;
pub mod credentials;
pub mod llm;
pub mod sandbox;
pub mod scheduler;
pub mod session;
pub mod store;
pub mod task;
pub mod tools;
pub mod util;

#[cfg(test)]
pub(crate) mod test_support;

pub use config::Config;
pub use scheduler::{TaskEvent, TaskEventKind, TaskScheduler};

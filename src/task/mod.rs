//! Task module - the durable unit of work the scheduler drives.

#[allow(clippy::module_inception)]
mod task;

pub use task::{Task, TaskError, TaskId, TaskStatus, TaskStep, TaskUpdate};

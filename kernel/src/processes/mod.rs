//! Kernel tasks and their scheduling.

pub mod ready_queue;
pub mod registers;
pub mod scheduler;
pub mod task;

pub use scheduler::{Scheduler, SpawnError};
pub use task::{Task, TaskEntry, TaskId, TaskState};

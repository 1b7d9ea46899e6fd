//! Task table configuration.

/// Capacity of the task table and the ready queue.
pub const MAX_TASKS: usize = 16;

pub const DEFAULT_STACK_SIZE: u64 = 4 * 4096;

/// IF set, reserved bit 1 set.
pub const DEFAULT_RFLAGS: u64 = 0x202;

pub const MAX_TASK_NAME: usize = 32;

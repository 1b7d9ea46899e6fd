//! Task control blocks.

use core::fmt;

use arrayvec::ArrayString;
use x86_64::{structures::paging::PhysFrame, VirtAddr};

use crate::{
    constants::{
        memory::{PAGE_SIZE, TASK_STACK_REGION, TASK_STACK_STRIDE},
        processes::MAX_TASK_NAME,
    },
    processes::registers::CpuContext,
};

/// Entry point of a kernel task. Tasks never return; they end through
/// [`Kernel::exit_current`](crate::kernel::Kernel::exit_current).
pub type TaskEntry = extern "C" fn() -> !;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskId(pub u32);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskState {
    Ready,
    Running,
    Waiting,
    Terminated,
}

/// A task's stack window: `pages` mapped pages above one guard page.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TaskStack {
    bottom: VirtAddr,
    pages: u64,
}

impl TaskStack {
    /// Window reserved for task table slot `slot`.
    pub fn for_slot(slot: usize, pages: u64) -> Self {
        let guard = TASK_STACK_REGION + slot as u64 * TASK_STACK_STRIDE;
        Self {
            bottom: VirtAddr::new(guard + PAGE_SIZE),
            pages,
        }
    }

    pub fn bottom(&self) -> VirtAddr {
        self.bottom
    }

    pub fn top(&self) -> VirtAddr {
        self.bottom + self.pages * PAGE_SIZE
    }

    pub fn pages(&self) -> impl Iterator<Item = VirtAddr> {
        let bottom = self.bottom;
        (0..self.pages).map(move |i| bottom + i * PAGE_SIZE)
    }
}

#[derive(Debug)]
pub struct Task {
    pub id: TaskId,
    pub name: ArrayString<MAX_TASK_NAME>,
    pub state: TaskState,
    pub context: CpuContext,
    pub stack: TaskStack,
}

impl Task {
    /// A ready task that will start at `entry` on `stack`. Names longer than
    /// the limit are truncated.
    pub fn new(id: TaskId, name: &str, entry: u64, stack: TaskStack, root: PhysFrame) -> Self {
        let mut short = ArrayString::new();
        for c in name.chars() {
            if short.try_push(c).is_err() {
                break;
            }
        }
        Self {
            id,
            name: short,
            state: TaskState::Ready,
            context: CpuContext::for_entry(entry, stack.top().as_u64(), root),
            stack,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use x86_64::PhysAddr;

    #[test]
    fn stack_windows_do_not_overlap() {
        let a = TaskStack::for_slot(0, 4);
        let b = TaskStack::for_slot(1, 16);
        assert_eq!(a.bottom().as_u64(), TASK_STACK_REGION + PAGE_SIZE);
        assert!(a.top() < b.bottom() - PAGE_SIZE);
        assert_eq!(b.pages().count(), 16);
        assert_eq!(b.pages().last(), Some(b.top() - PAGE_SIZE));
    }

    #[test]
    fn new_task_is_ready_at_its_entry() {
        let root = PhysFrame::containing_address(PhysAddr::new(0x4000));
        let stack = TaskStack::for_slot(2, 4);
        let task = Task::new(TaskId(7), "a-rather-long-task-name-that-keeps-going", 0x1234, stack, root);
        assert_eq!(task.state, TaskState::Ready);
        assert_eq!(task.context.rip, 0x1234);
        assert_eq!(task.context.rsp, stack.top().as_u64() - 8);
        assert_eq!(task.name.len(), MAX_TASK_NAME);
    }
}

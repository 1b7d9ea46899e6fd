//! Preemptive round-robin scheduling on the timer tick.
//!
//! A switch never happens on a kernel stack of its own: the interrupted
//! context is copied out of the trap frame and the next one is written over
//! it, so the common `iretq` lands in the selected task.

use log::{debug, trace};
use x86_64::structures::paging::PhysFrame;

use crate::{
    constants::processes::MAX_TASKS,
    hal::Hal,
    interrupts::TrapFrame,
    memory::{FrameError, MapError},
    processes::{
        ready_queue::ReadyQueue,
        registers::CpuContext,
        task::{Task, TaskId, TaskState},
    },
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SpawnError {
    #[error("task table is full")]
    TableFull,
    #[error("stack of {0} bytes exceeds the per-task window")]
    StackTooLarge(u64),
    #[error("no frame for the task stack: {0}")]
    Frame(#[from] FrameError),
    #[error("could not map the task stack: {0}")]
    Map(#[from] MapError),
}

pub struct Scheduler {
    tasks: [Option<Task>; MAX_TASKS],
    queue: ReadyQueue,
    /// `None` while the boot thread (idle context) owns the CPU.
    current: Option<TaskId>,
    idle: CpuContext,
    next_id: u32,
    ticks: u64,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler {
    pub const fn new() -> Self {
        Self {
            tasks: [const { None }; MAX_TASKS],
            queue: ReadyQueue::new(),
            current: None,
            idle: CpuContext::new(),
            next_id: 1,
            ticks: 0,
        }
    }

    pub fn vacant_slot(&self) -> Option<usize> {
        self.tasks.iter().position(Option::is_none)
    }

    /// Ids are never reused; running out of them is reported as a full table.
    pub fn allocate_id(&mut self) -> Result<TaskId, SpawnError> {
        let id = TaskId(self.next_id);
        self.next_id = self.next_id.checked_add(1).ok_or(SpawnError::TableFull)?;
        Ok(id)
    }

    /// Stores `task` in table slot `slot` and queues it if it is ready.
    pub fn admit(&mut self, slot: usize, task: Task) -> Result<TaskId, SpawnError> {
        let entry = self.tasks.get_mut(slot).ok_or(SpawnError::TableFull)?;
        if entry.is_some() {
            return Err(SpawnError::TableFull);
        }
        let id = task.id;
        let ready = task.state == TaskState::Ready;
        debug!("admitting task {} ({}) in slot {}", id, task.name, slot);
        *entry = Some(task);
        if ready {
            self.add_task(id);
        }
        Ok(id)
    }

    /// Appends a known task to the tail of the ready queue. The running task
    /// is never queued; it goes back to the tail when it is preempted.
    pub fn add_task(&mut self, id: TaskId) -> bool {
        self.current != Some(id) && self.task(id).is_some() && self.queue.add_task(id)
    }

    /// Round-robin selection: a task that is still running goes back to the
    /// tail, then the head of the ready queue is taken off.
    pub fn next_task(&mut self) -> Option<TaskId> {
        let running = self.current.filter(|&id| {
            self.task(id)
                .is_some_and(|task| task.state == TaskState::Running)
        });
        if let Some(id) = running {
            if let Some(task) = self.task_mut(id) {
                task.state = TaskState::Ready;
            }
            self.queue.add_task(id);
        }
        self.queue.pop()
    }

    /// One scheduling decision, made from inside the timer interrupt.
    ///
    /// Saves the interrupted state into the running task (or the idle
    /// context), picks the next task and writes its state into `frame`.
    /// The page-table root is only reloaded when it actually changes. With
    /// nothing else ready, a running task keeps the CPU and a task that can
    /// no longer run hands it back to the idle context.
    pub fn on_tick(&mut self, frame: &mut TrapFrame, hal: &mut impl Hal) {
        self.ticks += 1;
        let loaded_root = hal.read_root();

        let previous = self.current;
        match previous.and_then(|id| self.task_mut(id)) {
            Some(task) => task.context.save(frame, loaded_root),
            None => self.idle.save(frame, loaded_root),
        }

        let next = self.next_task();
        if next == previous {
            if let Some(task) = next.and_then(|id| self.task_mut(id)) {
                task.state = TaskState::Running;
            }
            return;
        }

        let context = match next.and_then(|id| self.task_mut(id)) {
            Some(task) => {
                task.state = TaskState::Running;
                task.context
            }
            None => self.idle,
        };

        context.restore(frame);
        let root = PhysFrame::containing_address(x86_64::PhysAddr::new(context.cr3));
        if root != loaded_root {
            unsafe { hal.write_root(root) };
        }

        trace!(
            "tick {}: {} -> {}",
            self.ticks,
            DisplayTask(previous),
            DisplayTask(next)
        );
        self.current = next;
    }

    pub fn current(&self) -> Option<TaskId> {
        self.current
    }

    /// Marks the running task terminated. It keeps the CPU until the next
    /// tick switches away, and is reaped after that.
    pub fn exit_current(&mut self) -> Option<TaskId> {
        let id = self.current?;
        self.terminate(id).then_some(id)
    }

    pub fn terminate(&mut self, id: TaskId) -> bool {
        self.queue.remove(id);
        match self.task_mut(id) {
            Some(task) => {
                task.state = TaskState::Terminated;
                true
            }
            None => false,
        }
    }

    /// Takes a task off the ready queue until it is woken.
    pub fn block(&mut self, id: TaskId) -> bool {
        match self.task_mut(id) {
            Some(task) if task.state != TaskState::Terminated => {
                task.state = TaskState::Waiting;
                self.queue.remove(id);
                true
            }
            _ => false,
        }
    }

    /// Makes a waiting task runnable. A task woken before it was switched
    /// away simply keeps running.
    pub fn wake(&mut self, id: TaskId) -> bool {
        let running = self.current == Some(id);
        match self.task_mut(id) {
            Some(task) if task.state == TaskState::Waiting => {
                if running {
                    task.state = TaskState::Running;
                    true
                } else {
                    task.state = TaskState::Ready;
                    self.queue.add_task(id)
                }
            }
            _ => false,
        }
    }

    /// Removes one terminated task that is no longer executing, so its
    /// resources can be released.
    pub fn take_terminated(&mut self) -> Option<Task> {
        let current = self.current;
        self.tasks
            .iter_mut()
            .find(|slot| {
                slot.as_ref().is_some_and(|task| {
                    task.state == TaskState::Terminated && Some(task.id) != current
                })
            })
            .and_then(Option::take)
    }

    pub fn task(&self, id: TaskId) -> Option<&Task> {
        self.tasks.iter().flatten().find(|task| task.id == id)
    }

    fn task_mut(&mut self, id: TaskId) -> Option<&mut Task> {
        self.tasks.iter_mut().flatten().find(|task| task.id == id)
    }

    pub fn tasks(&self) -> impl Iterator<Item = &Task> + '_ {
        self.tasks.iter().flatten()
    }

    pub fn ready(&self) -> impl Iterator<Item = TaskId> + '_ {
        self.queue.iter()
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }
}

struct DisplayTask(Option<TaskId>);

impl core::fmt::Display for DisplayTask {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        match self.0 {
            Some(id) => write!(f, "task {}", id),
            None => f.write_str("idle"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{processes::task::TaskStack, testing::MockHal};
    use x86_64::PhysAddr;

    fn frame_at(addr: u64) -> PhysFrame {
        PhysFrame::containing_address(PhysAddr::new(addr))
    }

    /// A task whose entry point doubles as its label.
    fn spawn(scheduler: &mut Scheduler, rip: u64, root: PhysFrame) -> TaskId {
        let slot = scheduler.vacant_slot().unwrap();
        let id = scheduler.allocate_id().unwrap();
        let task = Task::new(id, "t", rip, TaskStack::for_slot(slot, 1), root);
        scheduler.admit(slot, task).unwrap()
    }

    fn idle_frame() -> TrapFrame {
        TrapFrame {
            vector: 32,
            rip: 0x1D1E,
            rsp: 0x9000,
            rflags: 0x202,
            cs: 0x08,
            ss: 0x10,
            ..TrapFrame::default()
        }
    }

    #[test]
    fn round_robin_over_nine_ticks() {
        let root = frame_at(0x1000);
        let mut hal = MockHal::new(root);
        let mut scheduler = Scheduler::new();
        let a = spawn(&mut scheduler, 0xA, root);
        let b = spawn(&mut scheduler, 0xB, root);
        let c = spawn(&mut scheduler, 0xC, root);

        let mut frame = idle_frame();
        let mut ran = Vec::new();
        for _ in 0..9 {
            scheduler.on_tick(&mut frame, &mut hal);
            ran.push(scheduler.current().unwrap());
            // The frame now holds the selected task's state.
            assert_eq!(frame.rip, scheduler.task(*ran.last().unwrap()).unwrap().context.rip);
        }
        assert_eq!(ran, vec![a, b, c, a, b, c, a, b, c]);
        assert!(hal.root_writes.is_empty());
        assert_eq!(scheduler.ticks(), 9);
    }

    #[test]
    fn interrupted_registers_survive_a_round_trip() {
        let root = frame_at(0x1000);
        let mut hal = MockHal::new(root);
        let mut scheduler = Scheduler::new();
        let a = spawn(&mut scheduler, 0xA, root);
        spawn(&mut scheduler, 0xB, root);

        let mut frame = idle_frame();
        scheduler.on_tick(&mut frame, &mut hal);
        assert_eq!(scheduler.current(), Some(a));

        // A runs for a while and is interrupted mid-computation.
        frame.rax = 0x1111;
        frame.r12 = 0x2222;
        frame.rip = 0xA0A0;
        frame.rsp -= 0x40;
        let snapshot = frame;

        scheduler.on_tick(&mut frame, &mut hal);
        assert_ne!(frame.rip, 0xA0A0);
        scheduler.on_tick(&mut frame, &mut hal);
        assert_eq!(scheduler.current(), Some(a));
        assert_eq!(frame, snapshot);
    }

    #[test]
    fn single_task_resumes_itself() {
        let root = frame_at(0x1000);
        let mut hal = MockHal::new(root);
        let mut scheduler = Scheduler::new();
        let a = spawn(&mut scheduler, 0xA, root);

        let mut frame = idle_frame();
        scheduler.on_tick(&mut frame, &mut hal);
        frame.rip = 0xA5;
        let before = frame;
        scheduler.on_tick(&mut frame, &mut hal);
        assert_eq!(scheduler.current(), Some(a));
        assert_eq!(frame, before);
        assert_eq!(scheduler.task(a).unwrap().state, TaskState::Running);
    }

    #[test]
    fn empty_queue_keeps_idle_running() {
        let mut hal = MockHal::new(frame_at(0x1000));
        let mut scheduler = Scheduler::new();
        let mut frame = idle_frame();
        scheduler.on_tick(&mut frame, &mut hal);
        assert_eq!(scheduler.current(), None);
        assert_eq!(frame, idle_frame());
    }

    #[test]
    fn root_is_reloaded_only_when_it_changes() {
        let kernel_root = frame_at(0x1000);
        let other_root = frame_at(0x2000);
        let mut hal = MockHal::new(kernel_root);
        let mut scheduler = Scheduler::new();
        spawn(&mut scheduler, 0xA, kernel_root);
        spawn(&mut scheduler, 0xB, other_root);

        let mut frame = idle_frame();
        scheduler.on_tick(&mut frame, &mut hal); // idle -> A, same root
        assert!(hal.root_writes.is_empty());
        scheduler.on_tick(&mut frame, &mut hal); // A -> B
        assert_eq!(hal.root_writes, vec![other_root]);
        scheduler.on_tick(&mut frame, &mut hal); // B -> A
        assert_eq!(hal.root_writes, vec![other_root, kernel_root]);
    }

    #[test]
    fn exited_task_hands_back_to_idle_and_is_reaped() {
        let root = frame_at(0x1000);
        let mut hal = MockHal::new(root);
        let mut scheduler = Scheduler::new();
        let a = spawn(&mut scheduler, 0xA, root);

        let mut frame = idle_frame();
        scheduler.on_tick(&mut frame, &mut hal);
        assert_eq!(scheduler.exit_current(), Some(a));

        // Still executing on its own stack: not reapable yet.
        assert!(scheduler.take_terminated().is_none());

        scheduler.on_tick(&mut frame, &mut hal);
        assert_eq!(scheduler.current(), None);
        assert_eq!(frame, idle_frame());

        let reaped = scheduler.take_terminated().unwrap();
        assert_eq!(reaped.id, a);
        assert!(scheduler.task(a).is_none());
        assert_eq!(scheduler.vacant_slot(), Some(0));
    }

    #[test]
    fn blocked_task_is_skipped_until_woken() {
        let root = frame_at(0x1000);
        let mut hal = MockHal::new(root);
        let mut scheduler = Scheduler::new();
        let a = spawn(&mut scheduler, 0xA, root);
        let b = spawn(&mut scheduler, 0xB, root);
        let c = spawn(&mut scheduler, 0xC, root);

        assert!(scheduler.block(b));
        let mut frame = idle_frame();
        let mut ran = Vec::new();
        for _ in 0..4 {
            scheduler.on_tick(&mut frame, &mut hal);
            ran.push(scheduler.current().unwrap());
        }
        assert_eq!(ran, vec![a, c, a, c]);

        assert!(scheduler.wake(b));
        assert!(!scheduler.wake(b));
        ran.clear();
        for _ in 0..3 {
            scheduler.on_tick(&mut frame, &mut hal);
            ran.push(scheduler.current().unwrap());
        }
        // Woken while C runs: B is queued ahead of it.
        assert_eq!(ran, vec![a, b, c]);
    }

    #[test]
    fn task_added_mid_run_goes_ahead_of_the_running_one() {
        let root = frame_at(0x1000);
        let mut hal = MockHal::new(root);
        let mut scheduler = Scheduler::new();
        let a = spawn(&mut scheduler, 0xA, root);
        let b = spawn(&mut scheduler, 0xB, root);

        let mut frame = idle_frame();
        scheduler.on_tick(&mut frame, &mut hal);
        assert_eq!(scheduler.current(), Some(a));
        assert!(!scheduler.ready().any(|id| id == a));

        let c = spawn(&mut scheduler, 0xC, root);
        let mut ran = Vec::new();
        for _ in 0..3 {
            scheduler.on_tick(&mut frame, &mut hal);
            ran.push(scheduler.current().unwrap());
        }
        assert_eq!(ran, vec![b, c, a]);
    }

    #[test]
    fn running_task_cannot_be_queued_twice() {
        let root = frame_at(0x1000);
        let mut hal = MockHal::new(root);
        let mut scheduler = Scheduler::new();
        let a = spawn(&mut scheduler, 0xA, root);
        let b = spawn(&mut scheduler, 0xB, root);

        let mut frame = idle_frame();
        scheduler.on_tick(&mut frame, &mut hal);
        assert!(!scheduler.add_task(a));
        assert_eq!(scheduler.ready().collect::<Vec<_>>(), vec![b]);
    }

    #[test]
    fn task_woken_before_switching_away_keeps_running() {
        let root = frame_at(0x1000);
        let mut hal = MockHal::new(root);
        let mut scheduler = Scheduler::new();
        let a = spawn(&mut scheduler, 0xA, root);
        let b = spawn(&mut scheduler, 0xB, root);

        let mut frame = idle_frame();
        scheduler.on_tick(&mut frame, &mut hal);
        assert!(scheduler.block(a));
        assert!(scheduler.wake(a));
        assert_eq!(scheduler.task(a).unwrap().state, TaskState::Running);
        assert_eq!(scheduler.ready().collect::<Vec<_>>(), vec![b]);

        scheduler.on_tick(&mut frame, &mut hal);
        scheduler.on_tick(&mut frame, &mut hal);
        assert_eq!(scheduler.current(), Some(a));
    }

    #[test]
    fn id_space_exhaustion_is_reported() {
        let mut scheduler = Scheduler::new();
        scheduler.next_id = u32::MAX;
        assert_eq!(scheduler.allocate_id(), Err(SpawnError::TableFull));
    }

    #[test]
    fn table_capacity_is_enforced() {
        let root = frame_at(0x1000);
        let mut scheduler = Scheduler::new();
        for i in 0..MAX_TASKS as u64 {
            spawn(&mut scheduler, i, root);
        }
        assert_eq!(scheduler.vacant_slot(), None);
        let task = Task::new(TaskId(100), "x", 0, TaskStack::for_slot(0, 1), root);
        assert_eq!(scheduler.admit(0, task).map(|_| ()), Err(SpawnError::TableFull));
    }
}

use arrayvec::ArrayVec;

use crate::{constants::processes::MAX_TASKS, processes::task::TaskId};

/// Round-robin order of runnable tasks.
#[derive(Debug, Default)]
pub struct ReadyQueue {
    ids: ArrayVec<TaskId, MAX_TASKS>,
}

impl ReadyQueue {
    pub const fn new() -> Self {
        Self {
            ids: ArrayVec::new_const(),
        }
    }

    /// Appends `id` at the tail. Returns false when the queue is full or the
    /// task is already queued.
    pub fn add_task(&mut self, id: TaskId) -> bool {
        if self.contains(id) {
            return false;
        }
        self.ids.try_push(id).is_ok()
    }

    /// Takes the head off the queue.
    pub fn pop(&mut self) -> Option<TaskId> {
        if self.ids.is_empty() {
            return None;
        }
        Some(self.ids.remove(0))
    }

    pub fn remove(&mut self, id: TaskId) -> bool {
        match self.ids.iter().position(|&queued| queued == id) {
            Some(index) => {
                self.ids.remove(index);
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, id: TaskId) -> bool {
        self.ids.contains(&id)
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = TaskId> + '_ {
        self.ids.iter().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pop_takes_tasks_in_insertion_order() {
        let mut queue = ReadyQueue::new();
        for id in 1..=3 {
            assert!(queue.add_task(TaskId(id)));
        }
        let order: Vec<_> = (0..4).filter_map(|_| queue.pop()).map(|t| t.0).collect();
        assert_eq!(order, vec![1, 2, 3]);
        assert!(queue.is_empty());
    }

    #[test]
    fn empty_queue_yields_nothing() {
        let mut queue = ReadyQueue::new();
        assert_eq!(queue.pop(), None);
    }

    #[test]
    fn popped_task_can_be_queued_again() {
        let mut queue = ReadyQueue::new();
        queue.add_task(TaskId(4));
        assert_eq!(queue.pop(), Some(TaskId(4)));
        assert!(queue.add_task(TaskId(4)));
        assert_eq!(queue.pop(), Some(TaskId(4)));
    }

    #[test]
    fn duplicates_and_overflow_are_refused() {
        let mut queue = ReadyQueue::new();
        assert!(queue.add_task(TaskId(1)));
        assert!(!queue.add_task(TaskId(1)));
        for id in 2..=MAX_TASKS as u32 {
            assert!(queue.add_task(TaskId(id)));
        }
        assert!(!queue.add_task(TaskId(99)));
        assert_eq!(queue.len(), MAX_TASKS);
    }

    #[test]
    fn removed_task_is_skipped() {
        let mut queue = ReadyQueue::new();
        for id in 1..=3 {
            queue.add_task(TaskId(id));
        }
        assert!(queue.remove(TaskId(2)));
        assert!(!queue.remove(TaskId(2)));
        assert_eq!(queue.iter().collect::<Vec<_>>(), vec![TaskId(1), TaskId(3)]);
    }
}

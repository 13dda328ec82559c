use slab::Slab;

use crate::task::Task;

/// Bounded FIFO of pending tasks.
///
/// Tasks live in a slot arena and are threaded head to tail through their
/// `next` indices, so slots are recycled without touching the allocator once
/// the queue has warmed up. `allocated` is a high-water mark: it only ever
/// grows, and once it reaches `capacity` a submission must wait for a queued
/// task to drain before a slot becomes available again.
pub(crate) struct TaskQueue {
    slots: Slab<Task>,
    head: Option<usize>,
    tail: Option<usize>,
    pending: usize,
    allocated: usize,
    capacity: usize,
}

impl TaskQueue {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            slots: Slab::new(),
            head: None,
            tail: None,
            pending: 0,
            allocated: 0,
            capacity,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.pending
    }

    /// Whether the queue can accept no further tasks: every slot ever
    /// allocated is occupied and the arena is at its configured capacity.
    pub(crate) fn is_full(&self) -> bool {
        self.pending == self.allocated && self.allocated >= self.capacity
    }

    /// Append a task at the tail. Returns the task's rank: its 1-based
    /// position in the queue at enqueue time.
    pub(crate) fn push(&mut self, task: Task) -> usize {
        debug_assert!(!self.is_full());

        let key = self.slots.insert(task);
        self.allocated = self.allocated.max(self.slots.len());

        match self.tail {
            Some(tail) => self.slots[tail].next = Some(key),
            None => self.head = Some(key),
        }
        self.tail = Some(key);

        self.pending += 1;
        self.pending
    }

    /// Remove and return the task at the head, preserving FIFO order.
    pub(crate) fn pop(&mut self) -> Option<Task> {
        let key = self.head?;
        let task = self.slots.remove(key);

        self.head = task.next;
        if self.head.is_none() {
            self.tail = None;
        }

        self.pending -= 1;
        Some(task)
    }

    /// Drop every queued task without running it. Cleanup closures are tied
    /// to execution and do not run for tasks that never started.
    pub(crate) fn clear(&mut self) {
        self.slots.clear();
        self.head = None;
        self.tail = None;
        self.pending = 0;
    }
}

use std::{
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{atomic::Ordering, Arc},
    thread::{self, ThreadId},
};

use slab::Slab;

use crate::{
    pool::{Lifecycle, Shared},
    task::Task,
};

/// The set of live worker threads.
///
/// Records live in a slot arena so handles are recycled without allocator
/// churn. The live count is the arena occupancy itself, so it cannot drift
/// out of sync with the records.
pub(crate) struct WorkerSet {
    slots: Slab<WorkerRecord>,
    min: usize,
    max: usize,
}

struct WorkerRecord {
    thread: ThreadId,
}

impl WorkerSet {
    pub(crate) fn new(min: usize, max: usize) -> Self {
        Self {
            slots: Slab::new(),
            min,
            max,
        }
    }

    pub(crate) fn live(&self) -> usize {
        self.slots.len()
    }

    pub(crate) fn min(&self) -> usize {
        self.min
    }

    pub(crate) fn max(&self) -> usize {
        self.max
    }

    /// Insert a record for a newly spawned worker thread. Callers must hold
    /// the pool lock across the spawn and the registration.
    pub(crate) fn register(&mut self, thread: ThreadId) -> usize {
        self.slots.insert(WorkerRecord { thread })
    }

    /// Remove the record for the given thread. Workers deregister themselves
    /// on exit, while still holding the pool lock.
    pub(crate) fn deregister(&mut self, thread: ThreadId) {
        let key = self
            .slots
            .iter()
            .find(|(_, record)| record.thread == thread)
            .map(|(key, _)| key);

        if let Some(key) = key {
            self.slots.remove(key);
        }
    }
}

/// A worker thread belonging to a thread pool.
pub(crate) struct Worker {
    shared: Arc<Shared>,
}

impl Worker {
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        Self { shared }
    }

    /// The worker loop: dequeue and execute tasks until told to exit.
    pub(crate) fn run(self) {
        let thread = thread::current();

        loop {
            let mut state = self.shared.state.lock().unwrap();

            let task = loop {
                // A forced shutdown overrides any work still queued.
                if state.lifecycle == Lifecycle::Halted {
                    break None;
                }

                if let Some(task) = state.queue.pop() {
                    // A queue slot opened up; unblock one waiting submitter.
                    self.shared.slot_freed.notify_one();
                    break Some(task);
                }

                // Idle. Shed this thread if the pool is draining or over its
                // floor. The decision and the record removal below happen
                // under one lock hold, so the set never dips under the
                // minimum.
                if state.lifecycle == Lifecycle::Draining
                    || state.workers.live() > state.workers.min()
                {
                    break None;
                }

                state = self.shared.work_available.wait(state).unwrap();
            };

            let task = match task {
                Some(task) => task,
                None => {
                    state.workers.deregister(thread.id());
                    if state.workers.live() == 0 {
                        self.shared.all_exited.notify_all();
                    }
                    log::trace!("worker {:?} exiting", thread.id());
                    return;
                }
            };

            drop(state);

            self.execute(task);
        }
    }

    /// Run one task outside the lock, containing any panic it raises.
    fn execute(&self, task: Task) {
        self.shared.running_tasks.fetch_add(1, Ordering::Relaxed);

        let result = catch_unwind(AssertUnwindSafe(|| task.run()));

        self.shared.running_tasks.fetch_sub(1, Ordering::Relaxed);
        self.shared.completed_tasks.fetch_add(1, Ordering::Relaxed);

        if result.is_err() {
            self.shared.panicked_tasks.fetch_add(1, Ordering::Relaxed);
        }
    }
}

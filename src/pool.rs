//! Implementation of the thread pool itself.

use std::{
    fmt,
    ops::{Range, RangeInclusive},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
        Condvar,
        Mutex,
    },
    thread,
    time::{Duration, Instant},
};

use once_cell::sync::Lazy;

use crate::{
    error::{ConfigError, DispatchError},
    queue::TaskQueue,
    task::{Task, Thunk},
    worker::{Worker, WorkerSet},
};

#[cfg(target_has_atomic = "64")]
pub(crate) type AtomicCounter = std::sync::atomic::AtomicU64;

#[cfg(not(target_has_atomic = "64"))]
pub(crate) type AtomicCounter = std::sync::atomic::AtomicU32;

/// Hard ceiling on the number of worker threads a single pool may be
/// configured with.
///
/// [`Builder::build`] rejects any maximum size above this value, so callers
/// can validate their own inputs against it up front.
pub const MAX_POOL_SIZE: usize = 200;

/// A value describing a size constraint for a thread pool.
///
/// Any size constraint can be wrapped in [`PerCore`] to be made relative to
/// the number of available CPU cores on the current system.
///
/// See [`Builder::size`] for details.
pub trait SizeConstraint {
    /// Get the minimum number of threads to be in the thread pool.
    fn min(&self) -> usize;

    /// Get the maximum number of threads to be in the thread pool.
    fn max(&self) -> usize;
}

impl SizeConstraint for usize {
    fn min(&self) -> usize {
        *self
    }

    fn max(&self) -> usize {
        *self
    }
}

impl SizeConstraint for Range<usize> {
    fn min(&self) -> usize {
        self.start
    }

    fn max(&self) -> usize {
        self.end
    }
}

impl SizeConstraint for RangeInclusive<usize> {
    fn min(&self) -> usize {
        *self.start()
    }

    fn max(&self) -> usize {
        *self.end()
    }
}

/// Modifies a size constraint to be per available CPU core.
///
/// # Examples
///
/// ```
/// # use tidepool::PerCore;
/// // one thread per core
/// let size = PerCore(1);
///
/// // four threads per core
/// let size = PerCore(4);
///
/// // at least 1 thread per core and at most 2 threads per core
/// let size = PerCore(1..2);
/// ```
pub struct PerCore<T>(pub T);

static CORE_COUNT: Lazy<usize> = Lazy::new(|| num_cpus::get().max(1));

impl<T> From<T> for PerCore<T> {
    fn from(size: T) -> Self {
        Self(size)
    }
}

impl<T: SizeConstraint> SizeConstraint for PerCore<T> {
    fn min(&self) -> usize {
        *CORE_COUNT * self.0.min()
    }

    fn max(&self) -> usize {
        *CORE_COUNT * self.0.max()
    }
}

/// A builder for constructing a customized [`ThreadPool`].
///
/// # Examples
///
/// ```
/// let custom_pool = tidepool::builder()
///     .name("my-pool")
///     .size(2)
///     .build()
///     .unwrap();
/// # custom_pool.join();
/// ```
#[derive(Debug)]
pub struct Builder {
    name: Option<String>,
    size: Option<(usize, usize)>,
    stack_size: Option<usize>,
    queue_capacity: Option<usize>,
    shutdown_grace: Duration,
}

impl Default for Builder {
    fn default() -> Self {
        Self {
            name: None,
            size: None,
            stack_size: None,
            queue_capacity: None,
            shutdown_grace: Duration::from_secs(1),
        }
    }
}

impl Builder {
    /// Set a custom thread name for threads spawned by this thread pool.
    ///
    /// # Panics
    ///
    /// Panics if the name contains null bytes (`\0`).
    ///
    /// # Examples
    ///
    /// ```
    /// let pool = tidepool::builder().name("my-pool").build().unwrap();
    /// # pool.join();
    /// ```
    pub fn name<T: Into<String>>(mut self, name: T) -> Self {
        let name = name.into();

        if name.as_bytes().contains(&0) {
            panic!("thread pool name must not contain null bytes");
        }

        self.name = Some(name);
        self
    }

    /// Set the number of threads to be managed by this thread pool.
    ///
    /// If a `usize` is supplied, the pool will have a fixed number of
    /// threads. If a range is supplied, the lower bound is the number of
    /// threads kept alive at all times while the upper bound is a maximum
    /// the pool is allowed to burst up to when the queue backs up.
    ///
    /// Any size constraint can be wrapped in [`PerCore`] to be made relative
    /// to the number of available CPU cores on the current system.
    ///
    /// If not set, a reasonable size is selected based on the number of CPU
    /// cores on the current system.
    ///
    /// The bounds are validated by [`build`](Builder::build): the minimum
    /// must be at least one, no larger than the maximum, and the maximum
    /// must not exceed [`MAX_POOL_SIZE`].
    ///
    /// # Examples
    ///
    /// ```
    /// // Create a thread pool with exactly 2 threads.
    /// let pool = tidepool::builder().size(2).build().unwrap();
    /// # pool.join();
    /// ```
    ///
    /// ```
    /// // Create a thread pool with one resident thread, bursting up to 4.
    /// let pool = tidepool::builder().size(1..=4).build().unwrap();
    /// # pool.join();
    /// ```
    ///
    /// ```
    /// use tidepool::PerCore;
    ///
    /// // Create a thread pool with one to two threads per core.
    /// let pool = tidepool::builder().size(PerCore(1..2)).build().unwrap();
    /// # pool.join();
    /// ```
    pub fn size<S: SizeConstraint>(mut self, size: S) -> Self {
        self.size = Some((size.min(), size.max()));
        self
    }

    /// Set the size of the stack (in bytes) for threads in this thread pool.
    ///
    /// The actual stack size may be greater than this value if the platform
    /// enforces a larger minimum stack size.
    ///
    /// The stack size if not specified will be the default size for new Rust
    /// threads, currently 2 MiB. This can also be overridden by setting the
    /// `RUST_MIN_STACK` environment variable if not specified in code.
    pub fn stack_size(mut self, size: usize) -> Self {
        self.stack_size = Some(size);
        self
    }

    /// Set the maximum number of pending tasks the queue will hold.
    ///
    /// Once the queue holds this many tasks and the pool is at its maximum
    /// thread count, [`dispatch`](ThreadPool::dispatch) blocks until a worker
    /// removes a task, and [`try_dispatch`](ThreadPool::try_dispatch)
    /// rejects the submission.
    ///
    /// If set to zero or not set at all, the capacity defaults to the pool's
    /// maximum thread count.
    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = Some(capacity);
        self
    }

    /// Set how long a forced shutdown waits for workers to finish their
    /// current task before giving up on them.
    ///
    /// The default grace period is one second. See
    /// [`shutdown_now`](ThreadPool::shutdown_now).
    pub fn shutdown_grace(mut self, duration: Duration) -> Self {
        self.shutdown_grace = duration;
        self
    }

    /// Create a thread pool according to the configuration set with this
    /// builder.
    ///
    /// The pool's minimum number of worker threads is spawned before this
    /// method returns. Fails with a [`ConfigError`] if the configured size
    /// is invalid; no threads are spawned in that case.
    pub fn build(self) -> Result<ThreadPool, ConfigError> {
        let (min, max) = match self.size {
            Some(size) => size,
            None => {
                // One to two workers per core, clamped to the pool ceiling.
                let size = PerCore(1..2);
                (size.min().min(MAX_POOL_SIZE), size.max().min(MAX_POOL_SIZE))
            }
        };

        if min == 0 {
            return Err(ConfigError::MinSizeZero);
        }

        if min > max {
            return Err(ConfigError::MinExceedsMax);
        }

        if max > MAX_POOL_SIZE {
            return Err(ConfigError::MaxExceedsCeiling);
        }

        let capacity = match self.queue_capacity {
            Some(capacity) if capacity > 0 => capacity,
            _ => max,
        };

        let shared = Shared {
            state: Mutex::new(PoolState {
                queue: TaskQueue::new(capacity),
                workers: WorkerSet::new(min, max),
                lifecycle: Lifecycle::Running,
            }),
            work_available: Condvar::new(),
            slot_freed: Condvar::new(),
            all_exited: Condvar::new(),
            shutdown_grace: self.shutdown_grace,
            running_tasks: AtomicUsize::new(0),
            completed_tasks: AtomicCounter::new(0),
            panicked_tasks: AtomicCounter::new(0),
        };

        let pool = ThreadPool {
            thread_name: self.name,
            stack_size: self.stack_size,
            shared: Arc::new(shared),
        };

        let mut state = pool.shared.state.lock().unwrap();
        for _ in 0..min {
            pool.spawn_worker(&mut state);
        }
        drop(state);

        Ok(pool)
    }
}

/// A thread pool that executes submitted tasks on a bounded group of worker
/// threads.
///
/// # Pool size
///
/// Every pool has a minimum and maximum number of worker threads. The
/// minimum is spawned eagerly when the pool is created and kept alive for
/// the pool's whole lifetime; additional threads are spawned on demand while
/// the queue backs up, and shed again as soon as they find the queue empty.
///
/// # Queueing and backpressure
///
/// Submitted tasks go into a fixed-capacity FIFO queue. When the queue is
/// full, a submission first grows the pool if it is below its maximum size.
/// Once the pool is at its maximum, [`dispatch`](ThreadPool::dispatch)
/// blocks until a worker frees a queue slot, while
/// [`try_dispatch`](ThreadPool::try_dispatch) hands the task back to the
/// caller instead.
///
/// # Shutdown
///
/// [`join`](ThreadPool::join) drains the queue and waits for every worker to
/// exit; [`shutdown_now`](ThreadPool::shutdown_now) discards queued tasks
/// and waits only a bounded grace period. Dropping the pool handle stops it
/// accepting work and detaches the workers, which wind down on their own.
///
/// # Monitoring
///
/// Each pool instance provides methods for gathering various statistics on
/// the pool's usage, such as the current number of threads and tasks
/// completed over time. While these methods provide the most up-to-date
/// numbers upon invocation, they should not be used for controlling program
/// behavior since they can become immediately outdated.
pub struct ThreadPool {
    thread_name: Option<String>,
    stack_size: Option<usize>,
    shared: Arc<Shared>,
}

impl Default for ThreadPool {
    fn default() -> Self {
        Self::new()
    }
}

impl ThreadPool {
    /// Create a new thread pool with the default configuration.
    ///
    /// If you'd like to customize the thread pool's behavior then use
    /// [`ThreadPool::builder`].
    #[inline]
    pub fn new() -> Self {
        // The default size is clamped to the ceiling and cannot be rejected.
        Self::builder()
            .build()
            .expect("default pool configuration is valid")
    }

    /// Get a builder for creating a customized thread pool.
    #[inline]
    pub fn builder() -> Builder {
        Builder::default()
    }

    /// Get the number of worker threads currently alive in the pool.
    ///
    /// # Examples
    ///
    /// ```
    /// let pool = tidepool::builder().size(2..=4).build().unwrap();
    /// assert_eq!(pool.threads(), 2);
    /// # pool.join();
    /// ```
    pub fn threads(&self) -> usize {
        self.shared.state.lock().unwrap().workers.live()
    }

    /// Get the number of tasks queued for execution, but not yet started.
    ///
    /// This number is always less than or equal to the configured
    /// [`queue_capacity`](Builder::queue_capacity). Note that the number
    /// returned may become immediately outdated after invocation.
    pub fn queued_tasks(&self) -> usize {
        self.shared.state.lock().unwrap().queue.len()
    }

    /// Get the number of tasks currently being executed by workers.
    ///
    /// Note that the number returned may become immediately outdated after
    /// invocation.
    pub fn running_tasks(&self) -> usize {
        self.shared.running_tasks.load(Ordering::Relaxed)
    }

    /// Get the number of tasks completed (successfully or otherwise) by this
    /// pool since it was created.
    ///
    /// Note that the number returned may become immediately outdated after
    /// invocation.
    #[inline]
    #[allow(clippy::useless_conversion)]
    pub fn completed_tasks(&self) -> u64 {
        self.shared.completed_tasks.load(Ordering::Relaxed).into()
    }

    /// Get the number of tasks that have panicked since the pool was
    /// created.
    ///
    /// A panicking task does not take its worker thread down with it; the
    /// panic is contained, counted here, and the worker moves on to the next
    /// task.
    #[inline]
    #[allow(clippy::useless_conversion)]
    pub fn panicked_tasks(&self) -> u64 {
        self.shared.panicked_tasks.load(Ordering::Relaxed).into()
    }

    /// Submit a task to be executed by the thread pool, blocking under
    /// backpressure.
    ///
    /// If the queue is full but the pool is below its maximum size, an
    /// additional worker thread is spawned to help drain the backlog. If the
    /// queue is full and the pool is already at its maximum size, this call
    /// blocks until a worker removes a task from the queue.
    ///
    /// Returns the task's rank: its 1-based position in the queue at the
    /// moment it was enqueued. Fails with
    /// [`DispatchError::Terminated`] if the pool is shutting down; the
    /// closure is handed back inside the error.
    ///
    /// # Examples
    ///
    /// ```
    /// let pool = tidepool::ThreadPool::new();
    ///
    /// let rank = pool.dispatch(|| {
    ///     // some expensive computation
    /// }).unwrap();
    ///
    /// assert!(rank >= 1);
    /// # pool.join();
    /// ```
    pub fn dispatch<F>(&self, work: F) -> Result<usize, DispatchError<F>>
    where
        F: FnOnce() + Send + 'static,
    {
        self.submit(work, |work| Task::new(Box::new(work), None), true)
    }

    /// Submit a task along with a cleanup closure, blocking under
    /// backpressure.
    ///
    /// The cleanup closure is guaranteed to run exactly once after the work
    /// closure finishes, whether it returns normally, panics, or is
    /// interrupted by [`shutdown_now`](ThreadPool::shutdown_now) while
    /// mid-execution. A task discarded from the queue by a forced shutdown
    /// never started, so its cleanup does not run.
    ///
    /// # Examples
    ///
    /// ```
    /// use std::sync::atomic::{AtomicBool, Ordering};
    /// use std::sync::Arc;
    ///
    /// let pool = tidepool::ThreadPool::new();
    /// let done = Arc::new(AtomicBool::new(false));
    /// let flag = done.clone();
    ///
    /// pool.dispatch_with_cleanup(
    ///     || println!("working"),
    ///     move || flag.store(true, Ordering::SeqCst),
    /// ).unwrap();
    ///
    /// pool.join();
    /// assert!(done.load(Ordering::SeqCst));
    /// ```
    pub fn dispatch_with_cleanup<F, C>(
        &self,
        work: F,
        cleanup: C,
    ) -> Result<usize, DispatchError<(F, C)>>
    where
        F: FnOnce() + Send + 'static,
        C: FnOnce() + Send + 'static,
    {
        self.submit(
            (work, cleanup),
            |(work, cleanup)| Task::new(Box::new(work), Some(Box::new(cleanup) as Thunk)),
            true,
        )
    }

    /// Attempt to submit a task without blocking at the pool's ceiling.
    ///
    /// Like [`dispatch`](ThreadPool::dispatch), a full queue first grows the
    /// pool toward its maximum size, waiting for the new worker to pull a
    /// task. Once the pool is at its maximum size and the queue is still
    /// full, the submission is rejected with [`DispatchError::Full`] instead
    /// of blocking, and the closure can be extracted from the error.
    ///
    /// # Examples
    ///
    /// One use for this method is implementing load shedding: run the
    /// closure on the current thread if the pool is saturated.
    ///
    /// ```
    /// let pool = tidepool::ThreadPool::new();
    ///
    /// if let Err(error) = pool.try_dispatch(|| println!("busy work")) {
    ///     // The pool was full; invoke the closure here and now.
    ///     error.into_inner()();
    /// }
    /// # pool.join();
    /// ```
    pub fn try_dispatch<F>(&self, work: F) -> Result<usize, DispatchError<F>>
    where
        F: FnOnce() + Send + 'static,
    {
        self.submit(work, |work| Task::new(Box::new(work), None), false)
    }

    /// Attempt to submit a task and cleanup pair without blocking at the
    /// pool's ceiling.
    ///
    /// See [`try_dispatch`](ThreadPool::try_dispatch) and
    /// [`dispatch_with_cleanup`](ThreadPool::dispatch_with_cleanup).
    pub fn try_dispatch_with_cleanup<F, C>(
        &self,
        work: F,
        cleanup: C,
    ) -> Result<usize, DispatchError<(F, C)>>
    where
        F: FnOnce() + Send + 'static,
        C: FnOnce() + Send + 'static,
    {
        self.submit(
            (work, cleanup),
            |(work, cleanup)| Task::new(Box::new(work), Some(Box::new(cleanup) as Thunk)),
            false,
        )
    }

    /// Shut down the pool gracefully and block until every worker thread has
    /// exited.
    ///
    /// Workers finish every task already in the queue before exiting. New
    /// submissions are rejected with [`DispatchError::Terminated`] as soon
    /// as the drain begins, and any submitter blocked on a full queue is
    /// woken and rejected the same way. Calling this more than once is
    /// harmless.
    pub fn join(&self) {
        self.drain();
        self.await_workers(None);
    }

    /// Shut down the pool gracefully, waiting at most `timeout` for the
    /// workers to finish.
    ///
    /// Returns `true` if the pool shut down fully before the timeout.
    pub fn join_timeout(&self, timeout: Duration) -> bool {
        self.join_deadline(Instant::now() + timeout)
    }

    /// Shut down the pool gracefully, waiting until `deadline` at the latest
    /// for the workers to finish.
    ///
    /// Returns `true` if the pool shut down fully before the deadline.
    pub fn join_deadline(&self, deadline: Instant) -> bool {
        self.drain();
        self.await_workers(Some(deadline))
    }

    /// Shut down the pool immediately, discarding queued tasks.
    ///
    /// Tasks still waiting in the queue are dropped without being run (their
    /// cleanups do not run either, since cleanup is tied to execution). A
    /// worker that is mid-task cannot be interrupted; it observes the
    /// shutdown once its current task ends, and the cleanup registered for
    /// that task still runs exactly once. Submitters blocked on a full queue
    /// are woken and rejected.
    ///
    /// Blocks up to the configured
    /// [`shutdown_grace`](Builder::shutdown_grace) for the workers to exit.
    /// Returns `true` if every worker exited within the grace period;
    /// workers still inside a task at that point are left to wind down on
    /// their own.
    pub fn shutdown_now(&self) -> bool {
        let deadline = Instant::now() + self.shared.shutdown_grace;

        let mut state = self.shared.state.lock().unwrap();
        state.lifecycle = Lifecycle::Halted;
        state.queue.clear();
        drop(state);

        self.wake_all();

        let drained = self.await_workers(Some(deadline));

        if !drained {
            log::debug!("shutdown grace period expired with workers still live");
        }

        drained
    }

    fn submit<P>(
        &self,
        payload: P,
        into_task: fn(P) -> Task,
        block: bool,
    ) -> Result<usize, DispatchError<P>> {
        let mut state = self.shared.state.lock().unwrap();

        loop {
            if state.lifecycle != Lifecycle::Running {
                return Err(DispatchError::Terminated(payload));
            }

            if !state.queue.is_full() {
                break;
            }

            if state.workers.live() < state.workers.max() {
                // Grow: an extra worker helps drain the backlog.
                self.spawn_worker(&mut state);
            } else if !block {
                return Err(DispatchError::Full(payload));
            }

            // Wake an idle worker, then wait for it (or any busy worker) to
            // pull a task off the queue.
            self.shared.work_available.notify_one();
            state = self.shared.slot_freed.wait(state).unwrap();
        }

        let rank = state.queue.push(into_task(payload));

        // A backlog is building; add a worker ahead of demand if the set
        // still has room.
        if rank > 1 && state.workers.live() < state.workers.max() {
            self.spawn_worker(&mut state);
        }

        // Broadcast rather than signal: a single wakeup could land on a
        // worker that has already decided to exit, leaving the task
        // unclaimed.
        self.shared.work_available.notify_all();

        Ok(rank)
    }

    /// Spawn one additional worker thread, registering it in the worker set
    /// as a single atomic step under the pool lock.
    fn spawn_worker(&self, state: &mut PoolState) {
        debug_assert!(state.workers.live() < state.workers.max());

        let mut builder = thread::Builder::new();

        if let Some(name) = self.thread_name.as_ref() {
            builder = builder.name(name.clone());
        }

        if let Some(size) = self.stack_size {
            builder = builder.stack_size(size);
        }

        let worker = Worker::new(self.shared.clone());

        // The worker blocks on the pool mutex before anything else, so it
        // cannot observe the set before its record is inserted below.
        let handle = builder
            .spawn(move || worker.run())
            .expect("failed to spawn worker thread");

        let slot = state.workers.register(handle.thread().id());

        log::trace!("spawned worker {} ({:?})", slot, handle.thread().id());
    }

    /// Begin a graceful drain, if the pool is still running.
    fn drain(&self) {
        let mut state = self.shared.state.lock().unwrap();
        if state.lifecycle == Lifecycle::Running {
            state.lifecycle = Lifecycle::Draining;
        }
        drop(state);

        self.wake_all();
    }

    fn wake_all(&self) {
        // Parked workers re-check the lifecycle; blocked submitters bail out.
        self.shared.work_available.notify_all();
        self.shared.slot_freed.notify_all();
    }

    /// Block until the worker set is empty, or until the deadline passes.
    fn await_workers(&self, deadline: Option<Instant>) -> bool {
        let mut state = self.shared.state.lock().unwrap();

        while state.workers.live() > 0 {
            match deadline {
                Some(deadline) => {
                    if let Some(timeout) = deadline.checked_duration_since(Instant::now()) {
                        state = self
                            .shared
                            .all_exited
                            .wait_timeout(state, timeout)
                            .unwrap()
                            .0;
                    } else {
                        return false;
                    }
                }
                None => {
                    state = self.shared.all_exited.wait(state).unwrap();
                }
            }
        }

        true
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        // Stop accepting work and let the workers wind down on their own;
        // the shared state is freed once the last worker drops its handle.
        self.drain();
    }
}

impl fmt::Debug for ThreadPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadPool")
            .field("threads", &self.threads())
            .field("queued_tasks", &self.queued_tasks())
            .field("running_tasks", &self.running_tasks())
            .field("completed_tasks", &self.completed_tasks())
            .finish()
    }
}

/// Thread pool state shared by the pool handle and the worker threads.
pub(crate) struct Shared {
    pub(crate) state: Mutex<PoolState>,
    pub(crate) work_available: Condvar,
    pub(crate) slot_freed: Condvar,
    pub(crate) all_exited: Condvar,
    pub(crate) shutdown_grace: Duration,
    pub(crate) running_tasks: AtomicUsize,
    pub(crate) completed_tasks: AtomicCounter,
    pub(crate) panicked_tasks: AtomicCounter,
}

/// The queue, the worker set and the lifecycle, guarded by the one pool
/// mutex.
pub(crate) struct PoolState {
    pub(crate) queue: TaskQueue,
    pub(crate) workers: WorkerSet,
    pub(crate) lifecycle: Lifecycle,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Lifecycle {
    Running,
    Draining,
    Halted,
}

/// A boxed unit of work accepted by the pool.
pub(crate) type Thunk = Box<dyn FnOnce() + Send + 'static>;

/// A single submitted task: the work closure, an optional cleanup closure,
/// and the intrusive link threading it into the queue arena.
pub(crate) struct Task {
    work: Thunk,
    cleanup: Option<Thunk>,
    pub(crate) next: Option<usize>,
}

impl Task {
    pub(crate) fn new(work: Thunk, cleanup: Option<Thunk>) -> Self {
        Self {
            work,
            cleanup,
            next: None,
        }
    }

    /// Run the work closure.
    ///
    /// The cleanup closure, if one was registered, runs exactly once when the
    /// work returns, including when it unwinds from a panic.
    pub(crate) fn run(self) {
        let _cleanup = CleanupGuard(self.cleanup);

        (self.work)();
    }
}

struct CleanupGuard(Option<Thunk>);

impl Drop for CleanupGuard {
    fn drop(&mut self) {
        if let Some(cleanup) = self.0.take() {
            cleanup();
        }
    }
}

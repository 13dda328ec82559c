use std::{error::Error, fmt};

/// An error returned when a thread pool could not be created because its
/// configuration is invalid.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConfigError {
    /// The minimum pool size must be at least one.
    MinSizeZero,
    /// The minimum pool size cannot be larger than the maximum size.
    MinExceedsMax,
    /// The maximum pool size exceeds [`MAX_POOL_SIZE`](crate::MAX_POOL_SIZE).
    MaxExceedsCeiling,
}

impl Error for ConfigError {}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::MinSizeZero => f.write_str("thread pool minimum size must be non-zero"),
            ConfigError::MinExceedsMax => {
                f.write_str("thread pool minimum size cannot be larger than maximum size")
            }
            ConfigError::MaxExceedsCeiling => {
                f.write_str("thread pool maximum size exceeds the pool ceiling")
            }
        }
    }
}

/// An error returned when a task could not be submitted to a thread pool.
///
/// Contains the original closure (or work/cleanup pair) that failed to be
/// submitted. This allows you to try the submission again later or take some
/// other action, such as running the work on the current thread.
pub enum DispatchError<T> {
    /// The queue is full and the worker set is already at its maximum size.
    Full(T),
    /// The pool is draining or has been shut down.
    Terminated(T),
}

impl<T> DispatchError<T> {
    /// Extracts the inner task that could not be submitted.
    pub fn into_inner(self) -> T {
        match self {
            DispatchError::Full(task) | DispatchError::Terminated(task) => task,
        }
    }

    /// Whether the submission was rejected because the queue was full at the
    /// pool's maximum size.
    pub fn is_full(&self) -> bool {
        matches!(self, DispatchError::Full(_))
    }

    /// Whether the submission was rejected because the pool is shutting
    /// down.
    pub fn is_terminated(&self) -> bool {
        matches!(self, DispatchError::Terminated(_))
    }
}

impl<T> Error for DispatchError<T> {}

impl<T> fmt::Debug for DispatchError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DispatchError::Full(_) => f.write_str("DispatchError::Full(..)"),
            DispatchError::Terminated(_) => f.write_str("DispatchError::Terminated(..)"),
        }
    }
}

impl<T> fmt::Display for DispatchError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DispatchError::Full(_) => f.write_str("thread pool queue is full"),
            DispatchError::Terminated(_) => f.write_str("thread pool is shut down"),
        }
    }
}

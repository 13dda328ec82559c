#![doc = include_str!("../README.md")]

mod error;
mod pool;
mod queue;
mod task;
mod worker;

pub use crate::{
    error::{ConfigError, DispatchError},
    pool::{Builder, PerCore, SizeConstraint, ThreadPool, MAX_POOL_SIZE},
};

/// Get a builder for creating a customized thread pool.
pub fn builder() -> Builder {
    Builder::default()
}

//! Worker pool for job execution
//!
//! This module provides:
//! - [`WorkerPool`]: weighted dequeue, semaphore-bounded concurrent
//!   dispatch, retry/failure policy, drain on shutdown
//! - [`WorkerPoolConfig`]: concurrency, queue weights, retry policy,
//!   liveness tuning

mod pool;

pub use pool::{WorkerPool, WorkerPoolConfig, WorkerPoolError, WorkerPoolStatus};

//! # Ferroq
//!
//! A Redis-backed background-job engine: producers submit typed units of
//! work (immediate, delayed, or recurring) into a shared broker; a pool of
//! workers pulls work from priority-weighted queues and executes registered
//! handlers, with health-checked reconnection and graceful shutdown on both
//! sides.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌──────────────┐
//! │   Producer   │   │  Scheduler   │
//! │ (enqueue +   │   │ (cron/@every │
//! │  batch loop) │   │  tick loop)  │
//! └──────┬───────┘   └──────┬───────┘
//!        │    push / push_delayed
//!        ▼                  ▼
//! ┌─────────────────────────────────────┐
//! │               Broker                │
//! │ (queue LISTs, scheduled set, job    │
//! │  state: pending/active/retrying/…)  │
//! └──────────────────┬──────────────────┘
//!                    │ weighted pop
//!                    ▼
//! ┌─────────────────────────────────────┐
//! │             WorkerPool              │
//! │ (concurrent handlers, retry policy, │
//! │  ack / retry / archive)             │
//! └─────────────────────────────────────┘
//! ```
//!
//! Every long-running component is wrapped in [`supervisor::supervise`]:
//! restart-with-backoff driven by broker health checks, cooperating through
//! one process-wide shutdown signal.
//!
//! ## Example
//!
//! ```ignore
//! use ferroq_core::prelude::*;
//!
//! let mut registry = JobRegistry::new();
//! registry.register("email:welcome", |ctx| async move {
//!     let payload: WelcomePayload = ctx.decode()?;
//!     // send the email...
//!     Ok(())
//! })?;
//!
//! let connector = Arc::new(RedisConnector::new("redis://127.0.0.1:6379"));
//! let pool = WorkerPool::new(session, Arc::new(registry), WorkerPoolConfig::default());
//! pool.run(shutdown.subscribe()).await?;
//! ```

pub mod broker;
pub mod job;
pub mod producer;
pub mod registry;
pub mod retry;
pub mod scheduler;
pub mod supervisor;
pub mod worker;

/// Prelude for common imports
pub mod prelude {
    pub use crate::broker::{
        Broker, BrokerConnector, BrokerError, DequeuedJob, InMemoryBroker, QueueWeights,
        RedisBroker, RedisConnector,
    };
    pub use crate::job::{Job, JobContext, JobError, JobOptions, JobState};
    pub use crate::producer::{EnqueuedJob, JobSource, Producer, ProducerConfig, ProducerError};
    pub use crate::registry::{JobRegistry, RegistryError, CATCH_ALL_TYPE};
    pub use crate::retry::RetryPolicy;
    pub use crate::scheduler::{
        JobTemplate, ScheduleError, ScheduleSpec, Scheduler, SchedulerError,
    };
    pub use crate::supervisor::{supervise, ShutdownSignal, SuperviseConfig};
    pub use crate::worker::{WorkerPool, WorkerPoolConfig, WorkerPoolError, WorkerPoolStatus};
}

// Re-export key types at crate root
pub use broker::{
    Broker, BrokerConnector, BrokerError, DequeuedJob, InMemoryBroker, QueueWeights, RedisBroker,
    RedisConnector,
};
pub use job::{Job, JobContext, JobError, JobOptions, JobState};
pub use producer::{EnqueuedJob, JobSource, Producer, ProducerConfig, ProducerError};
pub use registry::{JobRegistry, RegistryError};
pub use retry::RetryPolicy;
pub use scheduler::{JobTemplate, ScheduleError, ScheduleSpec, Scheduler, SchedulerError};
pub use supervisor::{supervise, ShutdownSignal, SuperviseConfig};
pub use worker::{WorkerPool, WorkerPoolConfig, WorkerPoolError, WorkerPoolStatus};

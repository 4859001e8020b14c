//! Worker pool
//!
//! Runs up to `concurrency` jobs in parallel. The fetch loop claims a
//! capacity permit first, pings the broker before each fetch cycle, and
//! pauses dequeuing with linear backoff while the broker is unreachable.
//! Failures drive the retry policy: reschedule with exponential backoff
//! while the retry budget lasts, archive afterwards. Unknown job types and
//! poisoned payloads are drained (acked or archived) without ever blocking
//! the queue.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, error, info, warn};

use crate::broker::{Broker, BrokerError, DequeuedJob, QueueWeights};
use crate::job::JobError;
use crate::registry::JobRegistry;
use crate::retry::RetryPolicy;
use crate::supervisor::{sleep_or_shutdown, LinearBackoff};

/// Worker pool configuration
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Maximum concurrent job executions
    pub concurrency: usize,

    /// Queues to consume, with their priority weights
    pub queues: QueueWeights,

    /// Backoff applied between retries of a failed job
    pub retry_policy: RetryPolicy,

    /// Optional bound on a single handler execution
    pub handler_timeout: Option<Duration>,

    /// How long one dequeue attempt blocks waiting for work
    pub poll_timeout: Duration,

    /// Bounded timeout of the pre-fetch health check
    pub ping_timeout: Duration,

    /// Base interval of the linear unreachability backoff
    pub backoff_base: Duration,

    /// Graceful shutdown drain limit
    pub shutdown_timeout: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            concurrency: 10,
            queues: QueueWeights::default(),
            retry_policy: RetryPolicy::exponential(),
            handler_timeout: None,
            poll_timeout: Duration::from_secs(2),
            ping_timeout: Duration::from_secs(5),
            backoff_base: Duration::from_secs(5),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl WorkerPoolConfig {
    /// Create a configuration consuming the given queues
    pub fn new(queues: QueueWeights) -> Self {
        Self {
            queues,
            ..Default::default()
        }
    }

    /// Set maximum concurrency (at least 1)
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Set the retry policy
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    /// Bound every handler execution
    pub fn with_handler_timeout(mut self, timeout: Duration) -> Self {
        self.handler_timeout = Some(timeout);
        self
    }

    /// Set the dequeue blocking window
    pub fn with_poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = timeout;
        self
    }

    /// Set the health-check timeout
    pub fn with_ping_timeout(mut self, timeout: Duration) -> Self {
        self.ping_timeout = timeout;
        self
    }

    /// Set the unreachability backoff base
    pub fn with_backoff_base(mut self, base: Duration) -> Self {
        self.backoff_base = base;
        self
    }

    /// Set the drain limit
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }
}

/// Process-level worker pool state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerPoolStatus {
    /// Fetching and executing jobs
    Running,
    /// Shutdown observed; finishing in-flight jobs, not fetching
    Draining,
    /// Not running
    Stopped,
}

/// Worker pool errors
#[derive(Debug, thiserror::Error)]
pub enum WorkerPoolError {
    /// Broker operation failed
    #[error(transparent)]
    Broker(#[from] BrokerError),

    /// In-flight jobs did not finish within the drain limit
    #[error("graceful shutdown timed out with {remaining} jobs in flight")]
    ShutdownTimeout { remaining: usize },
}

/// Pool of concurrent job executors over one broker session
///
/// # Example
///
/// ```ignore
/// let config = WorkerPoolConfig::new(
///     QueueWeights::new()
///         .with_queue("critical", 6)
///         .with_queue("default", 3)
///         .with_queue("low", 1),
/// )
/// .with_concurrency(10);
///
/// let pool = WorkerPool::new(session, registry, config);
/// pool.run(shutdown.subscribe()).await?;
/// ```
pub struct WorkerPool {
    session: Arc<dyn Broker>,
    registry: Arc<JobRegistry>,
    config: WorkerPoolConfig,
    status: RwLock<WorkerPoolStatus>,
    active: Arc<Semaphore>,
}

impl WorkerPool {
    /// Create a pool over the given session and registry
    pub fn new(
        session: Arc<dyn Broker>,
        registry: Arc<JobRegistry>,
        config: WorkerPoolConfig,
    ) -> Self {
        let active = Arc::new(Semaphore::new(config.concurrency));
        Self {
            session,
            registry,
            config,
            status: RwLock::new(WorkerPoolStatus::Stopped),
            active,
        }
    }

    /// Current process-level status
    pub fn status(&self) -> WorkerPoolStatus {
        *self.status.read()
    }

    /// Number of jobs currently executing
    pub fn in_flight(&self) -> usize {
        self.config.concurrency - self.active.available_permits()
    }

    /// Fetch and execute jobs until shutdown, then drain
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<(), WorkerPoolError> {
        *self.status.write() = WorkerPoolStatus::Running;
        info!(
            concurrency = self.config.concurrency,
            queues = ?self.config.queues.queues().collect::<Vec<_>>(),
            "worker pool started"
        );

        let mut backoff = LinearBackoff::new(self.config.backoff_base);

        loop {
            if *shutdown.borrow() {
                break;
            }

            if let Err(e) = self.session.ping(self.config.ping_timeout).await {
                let delay = backoff.next_delay();
                warn!(error = %e, ?delay, "broker unreachable, pausing dequeue");
                if sleep_or_shutdown(delay, &mut shutdown).await {
                    break;
                }
                continue;
            }

            // Claim capacity before fetching so a popped job always has a slot
            let permit = tokio::select! {
                result = Arc::clone(&self.active).acquire_owned() => {
                    match result {
                        Ok(permit) => permit,
                        Err(_) => break,
                    }
                }
                _ = shutdown.changed() => break,
            };

            match self
                .session
                .pop(&self.config.queues, self.config.poll_timeout)
                .await
            {
                Ok(Some(dequeued)) => {
                    backoff.reset();
                    self.spawn_execution(dequeued, permit);
                }
                Ok(None) => {
                    backoff.reset();
                    drop(permit);
                }
                Err(e) => {
                    drop(permit);
                    let delay = backoff.next_delay();
                    warn!(error = %e, ?delay, "dequeue failed, backing off");
                    if sleep_or_shutdown(delay, &mut shutdown).await {
                        break;
                    }
                }
            }
        }

        self.drain().await
    }

    fn spawn_execution(&self, dequeued: DequeuedJob, permit: OwnedSemaphorePermit) {
        let session = Arc::clone(&self.session);
        let registry = Arc::clone(&self.registry);
        let retry_policy = self.config.retry_policy.clone();
        let handler_timeout = self.config.handler_timeout;

        tokio::spawn(async move {
            execute_one(session, registry, retry_policy, handler_timeout, dequeued).await;
            drop(permit);
        });
    }

    async fn drain(&self) -> Result<(), WorkerPoolError> {
        *self.status.write() = WorkerPoolStatus::Draining;
        info!(in_flight = self.in_flight(), "worker pool draining");

        let deadline = tokio::time::Instant::now() + self.config.shutdown_timeout;
        loop {
            if self.active.available_permits() == self.config.concurrency {
                break;
            }
            if tokio::time::Instant::now() >= deadline {
                let remaining = self.in_flight();
                warn!(remaining, "drain limit reached");
                *self.status.write() = WorkerPoolStatus::Stopped;
                return Err(WorkerPoolError::ShutdownTimeout { remaining });
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        *self.status.write() = WorkerPoolStatus::Stopped;
        info!("worker pool stopped");
        Ok(())
    }
}

async fn execute_one(
    session: Arc<dyn Broker>,
    registry: Arc<JobRegistry>,
    retry_policy: RetryPolicy,
    handler_timeout: Option<Duration>,
    dequeued: DequeuedJob,
) {
    let ctx = dequeued.context();
    let job_id = ctx.id;
    let job_type = ctx.job_type.clone();
    let retry_count = dequeued.retry_count;
    let max_retries = dequeued.job.max_retries;

    let Some(handler) = registry.lookup(&job_type) else {
        warn!(%job_id, %job_type, "no handler for job type, acknowledging");
        if let Err(e) = session.ack(job_id).await {
            error!(%job_id, error = %e, "failed to ack unhandled job");
        }
        return;
    };

    debug!(%job_id, %job_type, retry_count, "executing job");
    let outcome = match handler_timeout {
        Some(limit) => match tokio::time::timeout(limit, handler(ctx)).await {
            Ok(result) => result,
            Err(_) => Err(JobError::failed(format!("handler timed out after {limit:?}"))),
        },
        None => handler(ctx).await,
    };

    match outcome {
        Ok(()) => {
            debug!(%job_id, %job_type, "job completed");
            if let Err(e) = session.ack(job_id).await {
                error!(%job_id, error = %e, "failed to ack completed job");
            }
        }
        Err(decode_err @ JobError::Decode(_)) => {
            error!(%job_id, %job_type, error = %decode_err, "poisoned payload, archiving");
            if let Err(e) = session.archive(job_id, &decode_err.to_string()).await {
                error!(%job_id, error = %e, "failed to archive poisoned job");
            }
        }
        Err(failure) => {
            let message = failure.to_string();
            if retry_count < max_retries {
                let next_retry = retry_count + 1;
                let delay = retry_policy.delay_for(next_retry);
                warn!(
                    %job_id,
                    %job_type,
                    error = %message,
                    retry = next_retry,
                    max_retries,
                    ?delay,
                    "job failed, scheduling retry"
                );
                if let Err(e) = session.retry(job_id, &message, delay).await {
                    error!(%job_id, error = %e, "failed to schedule retry");
                }
            } else {
                warn!(%job_id, %job_type, error = %message, "retry budget exhausted, archiving");
                if let Err(e) = session.archive(job_id, &message).await {
                    error!(%job_id, error = %e, "failed to archive job");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::InMemoryBroker;
    use crate::job::{Job, JobState};
    use crate::supervisor::ShutdownSignal;
    use serde::Deserialize;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn pool_over(
        broker: &Arc<InMemoryBroker>,
        registry: JobRegistry,
        config: WorkerPoolConfig,
    ) -> Arc<WorkerPool> {
        Arc::new(WorkerPool::new(
            Arc::clone(broker) as Arc<dyn Broker>,
            Arc::new(registry),
            config,
        ))
    }

    fn spawn_run(
        pool: &Arc<WorkerPool>,
        signal: &ShutdownSignal,
    ) -> tokio::task::JoinHandle<Result<(), WorkerPoolError>> {
        let pool = Arc::clone(pool);
        let rx = signal.subscribe();
        tokio::spawn(async move { pool.run(rx).await })
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_acks_job() {
        let broker = Arc::new(InMemoryBroker::new());
        let mut registry = JobRegistry::new();
        registry
            .register("email:welcome", |_ctx| async { Ok(()) })
            .unwrap();

        let job = Job::new("email:welcome", vec![]);
        broker.push(&job).await.unwrap();

        let pool = pool_over(&broker, registry, WorkerPoolConfig::default());
        let signal = ShutdownSignal::new();
        let handle = spawn_run(&pool, &signal);

        tokio::time::sleep(Duration::from_secs(5)).await;
        signal.trigger();
        handle.await.unwrap().unwrap();

        assert_eq!(broker.state_of(job.id), Some(JobState::Completed));
        assert_eq!(pool.status(), WorkerPoolStatus::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_type_logged_and_acked() {
        let broker = Arc::new(InMemoryBroker::new());
        let mut registry = JobRegistry::new();
        registry
            .register("email:welcome", |_ctx| async { Ok(()) })
            .unwrap();

        let unknown = Job::new("video:transcode", vec![]);
        let known = Job::new("email:welcome", vec![]);
        broker.push(&unknown).await.unwrap();
        broker.push(&known).await.unwrap();

        let pool = pool_over(&broker, registry, WorkerPoolConfig::default());
        let signal = ShutdownSignal::new();
        let handle = spawn_run(&pool, &signal);

        tokio::time::sleep(Duration::from_secs(5)).await;
        signal.trigger();
        handle.await.unwrap().unwrap();

        // The unknown type is drained, not retried, and does not block the
        // job behind it
        assert_eq!(broker.state_of(unknown.id), Some(JobState::Completed));
        assert_eq!(broker.state_of(known.id), Some(JobState::Completed));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_retries_then_archives() {
        let broker = Arc::new(InMemoryBroker::new());
        let mut registry = JobRegistry::new();
        registry
            .register("email:welcome", |_ctx| async {
                Err(JobError::failed("smtp down"))
            })
            .unwrap();

        let job = Job::new("email:welcome", vec![]).with_max_retries(2);
        broker.push(&job).await.unwrap();

        let config = WorkerPoolConfig::default()
            .with_retry_policy(RetryPolicy::fixed(Duration::from_secs(1)));
        let pool = pool_over(&broker, registry, config);
        let signal = ShutdownSignal::new();
        let handle = spawn_run(&pool, &signal);

        tokio::time::sleep(Duration::from_secs(30)).await;
        signal.trigger();
        handle.await.unwrap().unwrap();

        assert_eq!(broker.state_of(job.id), Some(JobState::Archived));
        assert_eq!(broker.retry_count(job.id), Some(2));
        assert_eq!(broker.last_error(job.id), Some("smtp down".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_poisoned_payload_archived_immediately() {
        #[derive(Deserialize)]
        #[allow(dead_code)]
        struct Expected {
            user_id: u64,
        }

        let broker = Arc::new(InMemoryBroker::new());
        let mut registry = JobRegistry::new();
        registry
            .register("email:welcome", |ctx| async move {
                let _payload: Expected = ctx.decode()?;
                Ok(())
            })
            .unwrap();

        let job = Job::new("email:welcome", b"not json".to_vec());
        broker.push(&job).await.unwrap();

        let pool = pool_over(&broker, registry, WorkerPoolConfig::default());
        let signal = ShutdownSignal::new();
        let handle = spawn_run(&pool, &signal);

        tokio::time::sleep(Duration::from_secs(5)).await;
        signal.trigger();
        handle.await.unwrap().unwrap();

        assert_eq!(broker.state_of(job.id), Some(JobState::Archived));
        assert_eq!(broker.retry_count(job.id), Some(0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_handler_timeout_counts_as_failure() {
        let broker = Arc::new(InMemoryBroker::new());
        let mut registry = JobRegistry::new();
        registry
            .register("email:welcome", |_ctx| async {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(())
            })
            .unwrap();

        let job = Job::new("email:welcome", vec![]).with_max_retries(0);
        broker.push(&job).await.unwrap();

        let config = WorkerPoolConfig::default()
            .with_handler_timeout(Duration::from_secs(1))
            .with_retry_policy(RetryPolicy::fixed(Duration::from_secs(1)));
        let pool = pool_over(&broker, registry, config);
        let signal = ShutdownSignal::new();
        let handle = spawn_run(&pool, &signal);

        tokio::time::sleep(Duration::from_secs(10)).await;
        signal.trigger();
        handle.await.unwrap().unwrap();

        assert_eq!(broker.state_of(job.id), Some(JobState::Archived));
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_execution() {
        let broker = Arc::new(InMemoryBroker::new());
        let mut registry = JobRegistry::new();
        registry
            .register("slow", |_ctx| async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok(())
            })
            .unwrap();

        broker.push(&Job::new("slow", vec![1])).await.unwrap();
        broker.push(&Job::new("slow", vec![2])).await.unwrap();

        let config = WorkerPoolConfig::default().with_concurrency(2);
        let pool = pool_over(&broker, registry, config);
        let signal = ShutdownSignal::new();
        let handle = spawn_run(&pool, &signal);

        // Both jobs run in parallel: done well before 2 x 10s
        tokio::time::sleep(Duration::from_secs(15)).await;
        assert_eq!(broker.completed_count(), 2);

        signal.trigger();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_finishes_in_flight_jobs() {
        let broker = Arc::new(InMemoryBroker::new());
        let started = Arc::new(AtomicU32::new(0));
        let started_in_handler = Arc::clone(&started);
        let mut registry = JobRegistry::new();
        registry
            .register("slow", move |_ctx| {
                let started = Arc::clone(&started_in_handler);
                async move {
                    started.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    Ok(())
                }
            })
            .unwrap();

        broker.push(&Job::new("slow", vec![])).await.unwrap();

        let pool = pool_over(&broker, registry, WorkerPoolConfig::default());
        let signal = ShutdownSignal::new();
        let handle = spawn_run(&pool, &signal);

        // Let the job start, then shut down mid-execution
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(started.load(Ordering::SeqCst), 1);
        signal.trigger();
        handle.await.unwrap().unwrap();

        assert_eq!(broker.completed_count(), 1);
        assert_eq!(pool.status(), WorkerPoolStatus::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_outage_pauses_dequeue_with_backoff() {
        let broker = Arc::new(InMemoryBroker::new());
        let mut registry = JobRegistry::new();
        registry
            .register("email:welcome", |_ctx| async { Ok(()) })
            .unwrap();

        broker.set_unreachable(true);
        let pool = pool_over(&broker, registry, WorkerPoolConfig::default());
        let signal = ShutdownSignal::new();
        let handle = spawn_run(&pool, &signal);

        // 20s outage, 5s linear backoff: pings at 0, 5, 15 and no pops
        tokio::time::sleep(Duration::from_secs(20)).await;
        assert!(broker.ping_attempts() <= 3);
        assert_eq!(broker.pop_attempts(), 0);

        broker.set_unreachable(false);
        let job = Job::new("email:welcome", vec![]);
        broker.push(&job).await.unwrap();

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(broker.state_of(job.id), Some(JobState::Completed));

        signal.trigger();
        handle.await.unwrap().unwrap();
    }
}

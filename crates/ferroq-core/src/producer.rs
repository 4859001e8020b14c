//! Producer: job submission and the supervised enqueue loop
//!
//! [`Producer::enqueue`] submits one job, routing it to its queue or to the
//! scheduled set when a delay is requested. [`Producer::run`] drives a
//! [`JobSource`] in a health-checked loop: ping before every batch, linear
//! backoff while the broker is unreachable, and a wholesale session swap
//! after an enqueue failure instead of inline retries against a half-broken
//! connection.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{watch, RwLock};
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::broker::{Broker, BrokerConnector, BrokerError};
use crate::job::{Job, JobError, JobOptions};
use crate::supervisor::{sleep_or_shutdown, LinearBackoff};

/// Producer configuration
#[derive(Debug, Clone)]
pub struct ProducerConfig {
    /// Bounded timeout of the pre-batch health check
    pub ping_timeout: Duration,

    /// Base interval of the linear unreachability backoff
    pub backoff_base: Duration,

    /// Pause between enqueue batches
    pub enqueue_interval: Duration,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            ping_timeout: Duration::from_secs(5),
            backoff_base: Duration::from_secs(5),
            enqueue_interval: Duration::from_secs(15),
        }
    }
}

impl ProducerConfig {
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

    /// Set the pause between batches
    pub fn with_enqueue_interval(mut self, interval: Duration) -> Self {
        self.enqueue_interval = interval;
        self
    }
}

/// Producer errors
#[derive(Debug, thiserror::Error)]
pub enum ProducerError {
    /// Broker operation failed
    #[error(transparent)]
    Broker(#[from] BrokerError),

    /// Payload could not be encoded
    #[error(transparent)]
    Job(#[from] JobError),
}

/// Result of a successful enqueue
#[derive(Debug, Clone)]
pub struct EnqueuedJob {
    /// Broker-assigned job ID
    pub id: Uuid,

    /// Queue the job was assigned to after option overrides
    pub queue: String,
}

/// Supplies each cycle of the supervised enqueue loop with a batch of jobs
pub trait JobSource: Send {
    /// Jobs to submit this cycle; an empty batch is a no-op cycle
    fn next_batch(&mut self) -> Vec<(Job, JobOptions)>;
}

impl<F> JobSource for F
where
    F: FnMut() -> Vec<(Job, JobOptions)> + Send,
{
    fn next_batch(&mut self) -> Vec<(Job, JobOptions)> {
        self()
    }
}

/// Job producer with an owned, swappable broker session
pub struct Producer {
    connector: Arc<dyn BrokerConnector>,
    session: RwLock<Arc<dyn Broker>>,
    config: ProducerConfig,
}

impl Producer {
    /// Build a producer over an existing session
    ///
    /// The connector is kept for session recreation after enqueue failures.
    pub fn new(
        session: Arc<dyn Broker>,
        connector: Arc<dyn BrokerConnector>,
        config: ProducerConfig,
    ) -> Self {
        Self {
            connector,
            session: RwLock::new(session),
            config,
        }
    }

    /// Connect an initial session and build the producer
    pub async fn connect(
        connector: Arc<dyn BrokerConnector>,
        config: ProducerConfig,
    ) -> Result<Self, ProducerError> {
        let session = connector.connect().await?;
        Ok(Self::new(session, connector, config))
    }

    /// Submit a job, with per-enqueue option overrides
    ///
    /// Jobs whose effective `process_at` lies in the future go to the
    /// scheduled set; everything else lands on its queue immediately.
    pub async fn enqueue(&self, job: Job, options: JobOptions) -> Result<EnqueuedJob, ProducerError> {
        let job = options.apply(job);
        let session = Arc::clone(&*self.session.read().await);

        let id = match job.process_at {
            Some(at) if at > Utc::now() => session.push_delayed(&job, at).await?,
            _ => session.push(&job).await?,
        };

        debug!(job_id = %id, job_type = %job.job_type, queue = %job.queue, "job enqueued");
        Ok(EnqueuedJob {
            id,
            queue: job.queue,
        })
    }

    /// Discard the current session and connect a fresh one
    async fn recreate_session(&self) -> Result<(), BrokerError> {
        let fresh = self.connector.connect().await?;
        *self.session.write().await = fresh;
        Ok(())
    }

    /// Drive the supervised enqueue loop until shutdown
    ///
    /// Transient broker errors are logged and retried at the next cycle;
    /// the loop never crashes the process and returns `Ok(())` only when
    /// shutdown is observed.
    pub async fn run<S: JobSource>(
        &self,
        mut source: S,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), ProducerError> {
        let mut backoff = LinearBackoff::new(self.config.backoff_base);

        loop {
            if *shutdown.borrow() {
                return Ok(());
            }

            let session = Arc::clone(&*self.session.read().await);
            if let Err(e) = session.ping(self.config.ping_timeout).await {
                let delay = backoff.next_delay();
                warn!(error = %e, ?delay, "broker unreachable, delaying enqueue batch");
                if sleep_or_shutdown(delay, &mut shutdown).await {
                    return Ok(());
                }
                continue;
            }
            backoff.reset();

            for (job, options) in source.next_batch() {
                if *shutdown.borrow() {
                    return Ok(());
                }
                if let Err(e) = self.enqueue(job, options).await {
                    error!(error = %e, "enqueue failed, recreating broker session");
                    if let Err(e) = self.recreate_session().await {
                        warn!(error = %e, "session recreation failed, will retry next cycle");
                    }
                    break;
                }
            }

            if sleep_or_shutdown(self.config.enqueue_interval, &mut shutdown).await {
                return Ok(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::InMemoryBroker;
    use crate::job::JobState;
    use crate::supervisor::ShutdownSignal;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct CountingConnector {
        broker: Arc<InMemoryBroker>,
        connects: Arc<AtomicU32>,
    }

    #[async_trait]
    impl BrokerConnector for CountingConnector {
        async fn connect(&self) -> Result<Arc<dyn Broker>, BrokerError> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::clone(&self.broker) as Arc<dyn Broker>)
        }
    }

    async fn producer_over(broker: &Arc<InMemoryBroker>) -> Producer {
        Producer::connect(Arc::new(Arc::clone(broker)), ProducerConfig::default())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_enqueue_immediate() {
        let broker = Arc::new(InMemoryBroker::new());
        let producer = producer_over(&broker).await;

        let enqueued = producer
            .enqueue(Job::new("email:welcome", vec![]), JobOptions::new())
            .await
            .unwrap();

        assert_eq!(enqueued.queue, "default");
        assert_eq!(broker.pending_count("default"), 1);
        assert_eq!(broker.state_of(enqueued.id), Some(JobState::Pending));
    }

    #[tokio::test]
    async fn test_enqueue_with_delay_goes_to_scheduled_set() {
        let broker = Arc::new(InMemoryBroker::new());
        let producer = producer_over(&broker).await;

        let enqueued = producer
            .enqueue(
                Job::new("email:welcome", vec![]),
                JobOptions::new().process_in(Duration::from_secs(60)),
            )
            .await
            .unwrap();

        assert_eq!(broker.pending_count("default"), 0);
        assert_eq!(broker.scheduled_count(), 1);
        assert_eq!(broker.state_of(enqueued.id), Some(JobState::Scheduled));
    }

    #[tokio::test]
    async fn test_enqueue_options_override_queue_and_retries() {
        let broker = Arc::new(InMemoryBroker::new());
        let producer = producer_over(&broker).await;

        let enqueued = producer
            .enqueue(
                Job::new("image:resize", vec![]),
                JobOptions::new().queue("critical").max_retries(5),
            )
            .await
            .unwrap();

        assert_eq!(enqueued.queue, "critical");
        assert_eq!(broker.pending_count("critical"), 1);
    }

    #[tokio::test]
    async fn test_enqueue_surfaces_unreachable() {
        let broker = Arc::new(InMemoryBroker::new());
        let producer = producer_over(&broker).await;
        broker.set_unreachable(true);

        let result = producer
            .enqueue(Job::new("email:welcome", vec![]), JobOptions::new())
            .await;
        assert!(matches!(
            result,
            Err(ProducerError::Broker(BrokerError::Unreachable(_)))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_enqueues_batches_until_shutdown() {
        let broker = Arc::new(InMemoryBroker::new());
        let producer = Arc::new(producer_over(&broker).await);
        let signal = ShutdownSignal::new();

        let rx = signal.subscribe();
        let producer_for_run = Arc::clone(&producer);
        let handle = tokio::spawn(async move {
            producer_for_run
                .run(
                    || vec![(Job::new("email:welcome", vec![]), JobOptions::new())],
                    rx,
                )
                .await
        });

        // Two cycles: one at start, one after the 15s interval
        tokio::time::sleep(Duration::from_secs(20)).await;
        signal.trigger();
        handle.await.unwrap().unwrap();

        assert_eq!(broker.pending_count("default"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_backs_off_while_unreachable() {
        let broker = Arc::new(InMemoryBroker::new());
        let producer = Arc::new(producer_over(&broker).await);
        broker.set_unreachable(true);
        let signal = ShutdownSignal::new();

        let rx = signal.subscribe();
        let producer_for_run = Arc::clone(&producer);
        let batches = Arc::new(AtomicU32::new(0));
        let batches_in_source = Arc::clone(&batches);
        let handle = tokio::spawn(async move {
            producer_for_run
                .run(
                    move || {
                        batches_in_source.fetch_add(1, Ordering::SeqCst);
                        vec![]
                    },
                    rx,
                )
                .await
        });

        // 20s outage, 5s linear backoff: pings at 0, 5, 15 all fail, no batches
        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(batches.load(Ordering::SeqCst), 0);
        assert!(broker.ping_attempts() <= 3);

        broker.set_unreachable(false);
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(batches.load(Ordering::SeqCst) >= 1);

        signal.trigger();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_enqueue_failure_recreates_session() {
        let broker = Arc::new(InMemoryBroker::new());
        let connects = Arc::new(AtomicU32::new(0));
        let producer = Arc::new(
            Producer::connect(
                Arc::new(CountingConnector {
                    broker: Arc::clone(&broker),
                    connects: Arc::clone(&connects),
                }),
                ProducerConfig::default(),
            )
            .await
            .unwrap(),
        );
        broker.set_enqueue_unreachable(true);

        let signal = ShutdownSignal::new();
        let rx = signal.subscribe();
        let producer_for_run = Arc::clone(&producer);
        let handle = tokio::spawn(async move {
            producer_for_run
                .run(
                    || vec![(Job::new("email:welcome", vec![]), JobOptions::new())],
                    rx,
                )
                .await
        });

        // Ping succeeds, the push fails, and the session gets swapped
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(connects.load(Ordering::SeqCst) >= 2);

        signal.trigger();
        handle.await.unwrap().unwrap();
    }
}

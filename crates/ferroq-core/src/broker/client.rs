//! Broker client contract

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::Rng;
use uuid::Uuid;

use crate::job::{Job, JobContext};

/// Errors from broker operations
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    /// Connection lost or the broker did not answer in time
    ///
    /// Transient: components back off and retry, never crash.
    #[error("broker unreachable: {0}")]
    Unreachable(String),

    /// The referenced job does not exist on the broker
    #[error("job not found: {0}")]
    JobNotFound(Uuid),

    /// The broker answered with something the client cannot interpret
    #[error("broker protocol error: {0}")]
    Protocol(String),

    /// Job could not be serialized for the wire
    #[error("failed to encode job: {0}")]
    Encode(String),

    /// Stored job bytes could not be deserialized
    #[error("failed to decode job: {0}")]
    Decode(String),
}

/// Relative service frequency per queue
///
/// Weights steer how often each queue is consulted when several have work:
/// at every pop the queue order is sampled without replacement,
/// proportionally to weight, and the first non-empty queue in that order
/// wins. Under saturation the long-run service ratio converges to the
/// configured weights while the lowest-weight queue still gets nonzero
/// service.
///
/// # Example
///
/// ```
/// use ferroq_core::QueueWeights;
///
/// let weights = QueueWeights::new()
///     .with_queue("critical", 6)
///     .with_queue("default", 3)
///     .with_queue("low", 1);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueWeights {
    entries: Vec<(String, u32)>,
}

impl Default for QueueWeights {
    fn default() -> Self {
        Self::single(crate::job::DEFAULT_QUEUE)
    }
}

impl QueueWeights {
    /// Create an empty weight set
    pub fn new() -> Self {
        Self { entries: vec![] }
    }

    /// A single queue with weight 1
    pub fn single(queue: impl Into<String>) -> Self {
        Self::new().with_queue(queue, 1)
    }

    /// Add a queue; a zero weight is bumped to 1
    pub fn with_queue(mut self, queue: impl Into<String>, weight: u32) -> Self {
        self.entries.push((queue.into(), weight.max(1)));
        self
    }

    /// Number of queues
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if no queues are configured
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// All configured queues with their weights
    pub fn queues(&self) -> impl Iterator<Item = (&str, u32)> {
        self.entries.iter().map(|(q, w)| (q.as_str(), *w))
    }

    /// Sample a consultation order, proportionally to weight
    pub fn sampled_order<R: Rng>(&self, rng: &mut R) -> Vec<&str> {
        let mut remaining: Vec<(&str, u64)> = self
            .entries
            .iter()
            .map(|(q, w)| (q.as_str(), u64::from(*w)))
            .collect();
        let mut order = Vec::with_capacity(remaining.len());

        while !remaining.is_empty() {
            let total: u64 = remaining.iter().map(|(_, w)| w).sum();
            let mut pick = rng.gen_range(0..total);
            let idx = remaining
                .iter()
                .position(|(_, w)| {
                    if pick < *w {
                        true
                    } else {
                        pick -= *w;
                        false
                    }
                })
                .unwrap_or(remaining.len() - 1);
            order.push(remaining.remove(idx).0);
        }

        order
    }
}

/// A job claimed from the broker, with its retry state
#[derive(Debug, Clone)]
pub struct DequeuedJob {
    /// The job itself
    pub job: Job,

    /// Number of failed attempts so far (0 on first delivery)
    pub retry_count: u32,
}

impl DequeuedJob {
    /// Build the execution view handed to handlers
    pub fn context(&self) -> JobContext {
        JobContext {
            id: self.job.id,
            job_type: self.job.job_type.clone(),
            queue: self.job.queue.clone(),
            payload: self.job.payload.clone(),
            retry_count: self.retry_count,
            max_retries: self.job.max_retries,
        }
    }
}

/// Operation set the engine requires from the shared store
///
/// The broker is the sole owner of job state once a job is enqueued; all
/// cross-worker coordination is delegated to the atomicity of [`pop`].
/// Implementations must be safe for concurrent use.
///
/// [`pop`]: Broker::pop
#[async_trait]
pub trait Broker: Send + Sync + 'static {
    /// Health check with a bounded timeout
    async fn ping(&self, timeout: Duration) -> Result<(), BrokerError>;

    /// Enqueue a job on its target queue for immediate processing
    async fn push(&self, job: &Job) -> Result<Uuid, BrokerError>;

    /// Hold a job in the scheduled set until `process_at`
    async fn push_delayed(&self, job: &Job, process_at: DateTime<Utc>)
        -> Result<Uuid, BrokerError>;

    /// Claim the next eligible job, consulting queues in weighted order
    ///
    /// Promotes due scheduled jobs into their target queues first. Blocks up
    /// to `timeout` waiting for work; `Ok(None)` means nothing became
    /// eligible in time.
    async fn pop(
        &self,
        weights: &QueueWeights,
        timeout: Duration,
    ) -> Result<Option<DequeuedJob>, BrokerError>;

    /// Mark an active job completed
    async fn ack(&self, job_id: Uuid) -> Result<(), BrokerError>;

    /// Record a failure and reschedule the job after `delay`
    ///
    /// Increments the broker-side retry count and stores the error.
    async fn retry(&self, job_id: Uuid, error: &str, delay: Duration) -> Result<(), BrokerError>;

    /// Move a job to the terminal archived state
    ///
    /// Archived jobs are inspectable but never dequeued again.
    async fn archive(&self, job_id: Uuid, error: &str) -> Result<(), BrokerError>;
}

/// Session factory for supervised components
///
/// The supervisor holds an owned session per component and swaps it for a
/// fresh one on reconnect instead of sharing mutable connection state.
#[async_trait]
pub trait BrokerConnector: Send + Sync + 'static {
    /// Establish a fresh broker session
    async fn connect(&self) -> Result<Arc<dyn Broker>, BrokerError>;
}

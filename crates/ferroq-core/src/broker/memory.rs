//! In-memory broker for tests and local development
//!
//! Same semantics as the Redis implementation: FIFO order per queue, a
//! scheduled set ordered by due time, weighted pop, and full job-state
//! tracking. Adds instrumentation the tests rely on: reachability knobs to
//! simulate outages and per-operation counters.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use uuid::Uuid;

use super::client::{Broker, BrokerConnector, BrokerError, DequeuedJob, QueueWeights};
use crate::job::{Job, JobState};

const POP_POLL_STEP: Duration = Duration::from_millis(50);

struct JobRecord {
    job: Job,
    state: JobState,
    retry_count: u32,
    last_error: Option<String>,
    next_retry_at: Option<DateTime<Utc>>,
}

struct ScheduledEntry {
    at: DateTime<Utc>,
    seq: u64,
    id: Uuid,
}

#[derive(Default)]
struct Inner {
    jobs: HashMap<Uuid, JobRecord>,
    pending: HashMap<String, VecDeque<Uuid>>,
    scheduled: Vec<ScheduledEntry>,
    seq: u64,
    unreachable: bool,
    dequeue_unreachable: bool,
    enqueue_unreachable: bool,
}

impl Inner {
    fn next_seq(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }

    /// Move due scheduled jobs into their target queues in arrival order.
    fn promote_due(&mut self, now: DateTime<Utc>) {
        let mut due: Vec<ScheduledEntry> = vec![];
        let mut i = 0;
        while i < self.scheduled.len() {
            if self.scheduled[i].at <= now {
                due.push(self.scheduled.swap_remove(i));
            } else {
                i += 1;
            }
        }
        due.sort_by(|a, b| (a.at, a.seq).cmp(&(b.at, b.seq)));

        for entry in due {
            if let Some(record) = self.jobs.get_mut(&entry.id) {
                record.state = JobState::Pending;
                self.pending
                    .entry(record.job.queue.clone())
                    .or_default()
                    .push_back(entry.id);
            }
        }
    }
}

/// In-memory [`Broker`] implementation
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use ferroq_core::InMemoryBroker;
///
/// let broker = Arc::new(InMemoryBroker::new());
/// ```
pub struct InMemoryBroker {
    inner: RwLock<Inner>,
    pop_attempts: AtomicU64,
    ping_attempts: AtomicU64,
}

impl InMemoryBroker {
    /// Create a new empty broker
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            pop_attempts: AtomicU64::new(0),
            ping_attempts: AtomicU64::new(0),
        }
    }

    /// Make every operation fail with `Unreachable` (full outage)
    pub fn set_unreachable(&self, unreachable: bool) {
        self.inner.write().unreachable = unreachable;
    }

    /// Make only `pop` fail with `Unreachable` (consumer-side partition)
    pub fn set_dequeue_unreachable(&self, unreachable: bool) {
        self.inner.write().dequeue_unreachable = unreachable;
    }

    /// Make only `push`/`push_delayed` fail with `Unreachable`
    /// (producer-side partition)
    pub fn set_enqueue_unreachable(&self, unreachable: bool) {
        self.inner.write().enqueue_unreachable = unreachable;
    }

    /// Number of `pop` calls made so far
    pub fn pop_attempts(&self) -> u64 {
        self.pop_attempts.load(Ordering::Relaxed)
    }

    /// Number of `ping` calls made so far
    pub fn ping_attempts(&self) -> u64 {
        self.ping_attempts.load(Ordering::Relaxed)
    }

    /// Current state of a job, if the broker knows it
    pub fn state_of(&self, job_id: Uuid) -> Option<JobState> {
        self.inner.read().jobs.get(&job_id).map(|r| r.state)
    }

    /// Broker-side retry count of a job
    pub fn retry_count(&self, job_id: Uuid) -> Option<u32> {
        self.inner.read().jobs.get(&job_id).map(|r| r.retry_count)
    }

    /// Last recorded handler error of a job
    pub fn last_error(&self, job_id: Uuid) -> Option<String> {
        self.inner
            .read()
            .jobs
            .get(&job_id)
            .and_then(|r| r.last_error.clone())
    }

    /// Earliest time of the next attempt, when the job is awaiting retry
    pub fn next_retry_at(&self, job_id: Uuid) -> Option<DateTime<Utc>> {
        self.inner
            .read()
            .jobs
            .get(&job_id)
            .and_then(|r| r.next_retry_at)
    }

    /// Number of jobs waiting in a queue
    pub fn pending_count(&self, queue: &str) -> usize {
        self.inner
            .read()
            .pending
            .get(queue)
            .map(|q| q.len())
            .unwrap_or(0)
    }

    /// Number of jobs in the scheduled set
    pub fn scheduled_count(&self) -> usize {
        self.inner.read().scheduled.len()
    }

    fn count_state(&self, state: JobState) -> usize {
        self.inner
            .read()
            .jobs
            .values()
            .filter(|r| r.state == state)
            .count()
    }

    /// Number of archived jobs
    pub fn archived_count(&self) -> usize {
        self.count_state(JobState::Archived)
    }

    /// Number of completed jobs
    pub fn completed_count(&self) -> usize {
        self.count_state(JobState::Completed)
    }

    fn try_pop(&self, weights: &QueueWeights) -> Result<Option<DequeuedJob>, BrokerError> {
        let mut inner = self.inner.write();
        if inner.unreachable || inner.dequeue_unreachable {
            return Err(BrokerError::Unreachable("simulated outage".to_string()));
        }

        inner.promote_due(Utc::now());

        let order: Vec<String> = {
            let mut rng = rand::thread_rng();
            weights
                .sampled_order(&mut rng)
                .into_iter()
                .map(str::to_string)
                .collect()
        };

        for queue in order {
            let popped = inner.pending.get_mut(&queue).and_then(VecDeque::pop_front);
            if let Some(id) = popped {
                let record = inner
                    .jobs
                    .get_mut(&id)
                    .ok_or(BrokerError::JobNotFound(id))?;
                record.state = JobState::Active;
                return Ok(Some(DequeuedJob {
                    job: record.job.clone(),
                    retry_count: record.retry_count,
                }));
            }
        }

        Ok(None)
    }

    fn check_reachable(inner: &Inner) -> Result<(), BrokerError> {
        if inner.unreachable {
            Err(BrokerError::Unreachable("simulated outage".to_string()))
        } else {
            Ok(())
        }
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn ping(&self, _timeout: Duration) -> Result<(), BrokerError> {
        self.ping_attempts.fetch_add(1, Ordering::Relaxed);
        Self::check_reachable(&self.inner.read())
    }

    async fn push(&self, job: &Job) -> Result<Uuid, BrokerError> {
        let mut inner = self.inner.write();
        Self::check_reachable(&inner)?;
        if inner.enqueue_unreachable {
            return Err(BrokerError::Unreachable("simulated outage".to_string()));
        }

        inner.jobs.insert(
            job.id,
            JobRecord {
                job: job.clone(),
                state: JobState::Pending,
                retry_count: 0,
                last_error: None,
                next_retry_at: None,
            },
        );
        inner
            .pending
            .entry(job.queue.clone())
            .or_default()
            .push_back(job.id);
        Ok(job.id)
    }

    async fn push_delayed(
        &self,
        job: &Job,
        process_at: DateTime<Utc>,
    ) -> Result<Uuid, BrokerError> {
        let mut inner = self.inner.write();
        Self::check_reachable(&inner)?;
        if inner.enqueue_unreachable {
            return Err(BrokerError::Unreachable("simulated outage".to_string()));
        }

        let mut stored = job.clone();
        stored.process_at = Some(process_at);
        inner.jobs.insert(
            job.id,
            JobRecord {
                job: stored,
                state: JobState::Scheduled,
                retry_count: 0,
                last_error: None,
                next_retry_at: None,
            },
        );
        let seq = inner.next_seq();
        inner.scheduled.push(ScheduledEntry {
            at: process_at,
            seq,
            id: job.id,
        });
        Ok(job.id)
    }

    async fn pop(
        &self,
        weights: &QueueWeights,
        timeout: Duration,
    ) -> Result<Option<DequeuedJob>, BrokerError> {
        self.pop_attempts.fetch_add(1, Ordering::Relaxed);

        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(dequeued) = self.try_pop(weights)? {
                return Ok(Some(dequeued));
            }

            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(POP_POLL_STEP.min(deadline - now)).await;
        }
    }

    async fn ack(&self, job_id: Uuid) -> Result<(), BrokerError> {
        let mut inner = self.inner.write();
        Self::check_reachable(&inner)?;

        let record = inner
            .jobs
            .get_mut(&job_id)
            .ok_or(BrokerError::JobNotFound(job_id))?;
        record.state = JobState::Completed;
        Ok(())
    }

    async fn retry(&self, job_id: Uuid, error: &str, delay: Duration) -> Result<(), BrokerError> {
        let mut inner = self.inner.write();
        Self::check_reachable(&inner)?;

        let next_at = Utc::now() + chrono::Duration::milliseconds(delay.as_millis() as i64);
        let record = inner
            .jobs
            .get_mut(&job_id)
            .ok_or(BrokerError::JobNotFound(job_id))?;
        record.state = JobState::Retrying;
        record.retry_count += 1;
        record.last_error = Some(error.to_string());
        record.next_retry_at = Some(next_at);

        let seq = inner.next_seq();
        inner.scheduled.push(ScheduledEntry {
            at: next_at,
            seq,
            id: job_id,
        });
        Ok(())
    }

    async fn archive(&self, job_id: Uuid, error: &str) -> Result<(), BrokerError> {
        let mut inner = self.inner.write();
        Self::check_reachable(&inner)?;

        let record = inner
            .jobs
            .get_mut(&job_id)
            .ok_or(BrokerError::JobNotFound(job_id))?;
        record.state = JobState::Archived;
        record.last_error = Some(error.to_string());
        Ok(())
    }
}

#[async_trait]
impl BrokerConnector for Arc<InMemoryBroker> {
    async fn connect(&self) -> Result<Arc<dyn Broker>, BrokerError> {
        InMemoryBroker::check_reachable(&self.inner.read())?;
        Ok(Arc::clone(self) as Arc<dyn Broker>)
    }
}

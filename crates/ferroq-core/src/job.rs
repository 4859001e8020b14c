//! Job model and payload contract
//!
//! A [`Job`] is an immutable unit of work: a type name selecting a handler,
//! an opaque payload, and a delivery policy (queue, retry budget, optional
//! earliest-processing time). Jobs are created by producers or the scheduler
//! and owned by the broker once enqueued; the broker is the sole source of
//! truth for their state afterwards.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use uuid::Uuid;

/// Queue a job lands on when none is specified.
pub const DEFAULT_QUEUE: &str = "default";

/// Retry budget applied when none is specified.
pub const DEFAULT_MAX_RETRIES: u32 = 5;

/// Errors surfaced by payload handling and handler execution
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    /// Payload could not be serialized at job construction time
    #[error("failed to encode payload: {0}")]
    Encode(#[source] serde_json::Error),

    /// Payload could not be deserialized on the consume side
    ///
    /// Treated as non-retryable by the worker pool: a poisoned payload is
    /// archived so it never blocks the queue.
    #[error("failed to decode payload: {0}")]
    Decode(#[source] serde_json::Error),

    /// The handler itself failed
    #[error("{0}")]
    Failed(String),
}

impl JobError {
    /// Create a handler failure from any displayable error
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}

/// Broker-side lifecycle state of a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Waiting in its queue
    Pending,
    /// Held in the scheduled set until `process_at`
    Scheduled,
    /// Claimed by a worker, executing
    Active,
    /// Failed and waiting for its next attempt
    Retrying,
    /// Retry budget exhausted or payload poisoned; terminal, inspectable
    Archived,
    /// Handler succeeded; terminal
    Completed,
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Scheduled => write!(f, "scheduled"),
            Self::Active => write!(f, "active"),
            Self::Retrying => write!(f, "retrying"),
            Self::Archived => write!(f, "archived"),
            Self::Completed => write!(f, "completed"),
        }
    }
}

/// One unit of schedulable work
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Unique job ID (UUID v7, time-ordered)
    pub id: Uuid,

    /// Handler selector, e.g. `"email:welcome"`
    pub job_type: String,

    /// Opaque payload bytes
    pub payload: Vec<u8>,

    /// Target queue name
    pub queue: String,

    /// Maximum number of retries after the first failed attempt
    pub max_retries: u32,

    /// Earliest time the job may be dequeued; `None` means immediately
    pub process_at: Option<DateTime<Utc>>,

    /// Creation timestamp
    pub created_at: DateTime<Utc>,
}

impl Job {
    /// Create a job from raw payload bytes
    pub fn new(job_type: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            id: Uuid::now_v7(),
            job_type: job_type.into(),
            payload: payload.into(),
            queue: DEFAULT_QUEUE.to_string(),
            max_retries: DEFAULT_MAX_RETRIES,
            process_at: None,
            created_at: Utc::now(),
        }
    }

    /// Create a job with a JSON-encoded payload
    pub fn json<T: Serialize>(job_type: impl Into<String>, payload: &T) -> Result<Self, JobError> {
        let bytes = serde_json::to_vec(payload).map_err(JobError::Encode)?;
        Ok(Self::new(job_type, bytes))
    }

    /// Set the target queue
    pub fn with_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = queue.into();
        self
    }

    /// Set the retry budget
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Hold the job until the given time
    pub fn process_at(mut self, at: DateTime<Utc>) -> Self {
        self.process_at = Some(at);
        self
    }

    /// Hold the job for the given duration from now
    pub fn process_in(mut self, delay: Duration) -> Self {
        self.process_at = Some(Utc::now() + chrono::Duration::milliseconds(delay.as_millis() as i64));
        self
    }
}

/// Per-enqueue overrides applied on top of a job's own settings
///
/// # Example
///
/// ```ignore
/// producer.enqueue(
///     Job::json("image:resize", &payload)?,
///     JobOptions::new().queue("critical").max_retries(5),
/// ).await?;
/// ```
#[derive(Debug, Clone, Default)]
pub struct JobOptions {
    queue: Option<String>,
    max_retries: Option<u32>,
    process_at: Option<DateTime<Utc>>,
}

impl JobOptions {
    /// No overrides
    pub fn new() -> Self {
        Self::default()
    }

    /// Override the target queue
    pub fn queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = Some(queue.into());
        self
    }

    /// Override the retry budget
    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    /// Hold the job until the given time
    pub fn process_at(mut self, at: DateTime<Utc>) -> Self {
        self.process_at = Some(at);
        self
    }

    /// Hold the job for the given duration from now
    pub fn process_in(mut self, delay: Duration) -> Self {
        self.process_at =
            Some(Utc::now() + chrono::Duration::milliseconds(delay.as_millis() as i64));
        self
    }

    /// Apply the overrides to a job
    pub fn apply(&self, mut job: Job) -> Job {
        if let Some(queue) = &self.queue {
            job.queue = queue.clone();
        }
        if let Some(max_retries) = self.max_retries {
            job.max_retries = max_retries;
        }
        if let Some(process_at) = self.process_at {
            job.process_at = Some(process_at);
        }
        job
    }
}

/// Execution view of a dequeued job, handed to handlers
#[derive(Debug, Clone)]
pub struct JobContext {
    /// Job ID
    pub id: Uuid,

    /// Handler selector
    pub job_type: String,

    /// Queue the job was dequeued from
    pub queue: String,

    /// Opaque payload bytes
    pub payload: Vec<u8>,

    /// Number of failed attempts so far (0 on first delivery)
    pub retry_count: u32,

    /// Retry budget of the job
    pub max_retries: u32,
}

impl JobContext {
    /// Decode the payload as JSON
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, JobError> {
        serde_json::from_slice(&self.payload).map_err(JobError::Decode)
    }
}

//! Job type registry
//!
//! Maps a job-type name to its handler. The registry is populated once at
//! worker startup and shared read-only behind an `Arc` afterwards, so all
//! workers can look handlers up concurrently without locking.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::job::{JobContext, JobError};

/// Registering a handler under this name absorbs every job type that has no
/// exact registration.
pub const CATCH_ALL_TYPE: &str = "*";

/// Boxed future returned by a handler
pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<(), JobError>> + Send>>;

/// Type-erased handler callback bound to a job type
pub type JobHandler = Arc<dyn Fn(JobContext) -> HandlerFuture + Send + Sync>;

/// Errors from registry operations
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// The job type is already bound to a handler
    #[error("job type already registered: {0}")]
    DuplicateType(String),
}

/// Registry of job handlers
///
/// # Example
///
/// ```ignore
/// let mut registry = JobRegistry::new();
/// registry.register("email:welcome", |ctx| async move {
///     let payload: WelcomePayload = ctx.decode()?;
///     // send the email...
///     Ok(())
/// })?;
/// let registry = Arc::new(registry);
/// ```
#[derive(Default)]
pub struct JobRegistry {
    handlers: HashMap<String, JobHandler>,
}

impl JobRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Register a handler for a job type
    ///
    /// Fails if the type is already bound. Use [`CATCH_ALL_TYPE`] to absorb
    /// job types without an exact registration.
    pub fn register<F, Fut>(&mut self, job_type: &str, handler: F) -> Result<(), RegistryError>
    where
        F: Fn(JobContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), JobError>> + Send + 'static,
    {
        if self.handlers.contains_key(job_type) {
            return Err(RegistryError::DuplicateType(job_type.to_string()));
        }

        let handler: JobHandler = Arc::new(move |ctx| Box::pin(handler(ctx)));
        self.handlers.insert(job_type.to_string(), handler);
        Ok(())
    }

    /// Look up the handler for a job type
    ///
    /// Falls back to the catch-all registration when the exact type is
    /// absent. `None` means no handler at all; the worker pool treats that
    /// as a logged, acknowledged, non-retryable outcome.
    pub fn lookup(&self, job_type: &str) -> Option<JobHandler> {
        self.handlers
            .get(job_type)
            .or_else(|| self.handlers.get(CATCH_ALL_TYPE))
            .map(Arc::clone)
    }

    /// Check if a job type has an exact registration
    pub fn contains(&self, job_type: &str) -> bool {
        self.handlers.contains_key(job_type)
    }

    /// Number of registered types
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Check if the registry is empty
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// All registered type names
    pub fn job_types(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(|s| s.as_str())
    }
}

impl fmt::Debug for JobRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobRegistry")
            .field("job_types", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::Job;

    fn context_for(job: &Job) -> JobContext {
        JobContext {
            id: job.id,
            job_type: job.job_type.clone(),
            queue: job.queue.clone(),
            payload: job.payload.clone(),
            retry_count: 0,
            max_retries: job.max_retries,
        }
    }

    #[test]
    fn test_register_and_lookup() {
        let mut registry = JobRegistry::new();
        registry
            .register("email:welcome", |_ctx| async { Ok(()) })
            .unwrap();

        assert!(registry.contains("email:welcome"));
        assert!(registry.lookup("email:welcome").is_some());
        assert!(registry.lookup("image:resize").is_none());
    }

    #[test]
    fn test_duplicate_type_rejected() {
        let mut registry = JobRegistry::new();
        registry
            .register("email:welcome", |_ctx| async { Ok(()) })
            .unwrap();

        let result = registry.register("email:welcome", |_ctx| async { Ok(()) });
        assert!(matches!(result, Err(RegistryError::DuplicateType(_))));
    }

    #[test]
    fn test_catch_all_fallback() {
        let mut registry = JobRegistry::new();
        registry
            .register(CATCH_ALL_TYPE, |_ctx| async { Ok(()) })
            .unwrap();

        assert!(registry.lookup("anything:at:all").is_some());
        assert!(!registry.contains("anything:at:all"));
    }

    #[tokio::test]
    async fn test_handler_invocation() {
        let mut registry = JobRegistry::new();
        registry
            .register("email:welcome", |ctx| async move {
                if ctx.payload.is_empty() {
                    Err(JobError::failed("empty payload"))
                } else {
                    Ok(())
                }
            })
            .unwrap();

        let handler = registry.lookup("email:welcome").unwrap();

        let ok = handler(context_for(&Job::new("email:welcome", vec![1]))).await;
        assert!(ok.is_ok());

        let err = handler(context_for(&Job::new("email:welcome", vec![]))).await;
        assert!(matches!(err, Err(JobError::Failed(_))));
    }

    #[test]
    fn test_debug_lists_types() {
        let mut registry = JobRegistry::new();
        registry
            .register("email:welcome", |_ctx| async { Ok(()) })
            .unwrap();

        let debug = format!("{registry:?}");
        assert!(debug.contains("email:welcome"));
    }
}

//! Recurring schedules
//!
//! A [`Scheduler`] holds `(schedule expression, job template)` entries and,
//! at each due tick, materializes one job instance and enqueues it through
//! its broker session. The run loop suspends until the earliest due time
//! instead of polling on a fixed interval, so ticks do not drift. Missed
//! ticks during an outage are not backfilled: after every fire (and every
//! restart) the next due time is computed from the current clock.
//!
//! A broker failure tears the whole run down with an error; the supervisor
//! rebuilds the scheduler from scratch (entries re-registered by the
//! construction closure), so no partial registration state survives a
//! reconnect. A shutdown-triggered stop is clean and is not restarted.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tracing::{info, warn};
use uuid::Uuid;

use crate::broker::{Broker, BrokerError};
use crate::job::{Job, JobError, JobOptions};
use crate::supervisor::sleep_or_shutdown;

/// Errors from schedule registration
#[derive(Debug, thiserror::Error)]
pub enum ScheduleError {
    /// The expression is not valid cron or `@every` syntax
    #[error("invalid schedule expression {expr:?}: {reason}")]
    InvalidExpression { expr: String, reason: String },
}

/// Errors that tear down a running scheduler
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    /// Broker operation failed mid-run
    #[error(transparent)]
    Broker(#[from] BrokerError),

    /// Entry registration failed while (re)building the scheduler
    #[error(transparent)]
    Schedule(#[from] ScheduleError),
}

/// A parsed recurring-schedule expression
///
/// Two syntaxes are accepted:
/// - cron expressions: classic 5-field forms are padded with a leading
///   seconds field, 6/7-field forms pass through as-is
/// - `@every <duration>` with Go-style durations (`30s`, `1m30s`, `2h`)
#[derive(Debug, Clone)]
pub enum ScheduleSpec {
    /// Fires on cron occurrences
    Cron(Box<cron::Schedule>),
    /// Fires on a fixed interval from the previous fire
    Every(Duration),
}

impl FromStr for ScheduleSpec {
    type Err = ScheduleError;

    fn from_str(expr: &str) -> Result<Self, Self::Err> {
        let trimmed = expr.trim();

        if let Some(rest) = trimmed.strip_prefix("@every") {
            let interval = parse_go_duration(rest.trim()).map_err(|reason| {
                ScheduleError::InvalidExpression {
                    expr: expr.to_string(),
                    reason,
                }
            })?;
            if interval.is_zero() {
                return Err(ScheduleError::InvalidExpression {
                    expr: expr.to_string(),
                    reason: "interval must be positive".to_string(),
                });
            }
            return Ok(Self::Every(interval));
        }

        let normalized = if trimmed.split_whitespace().count() == 5 {
            format!("0 {trimmed}")
        } else {
            trimmed.to_string()
        };
        let schedule =
            cron::Schedule::from_str(&normalized).map_err(|e| ScheduleError::InvalidExpression {
                expr: expr.to_string(),
                reason: e.to_string(),
            })?;
        Ok(Self::Cron(Box::new(schedule)))
    }
}

impl ScheduleSpec {
    /// Next due time strictly after `now`
    pub fn next_after(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Self::Cron(schedule) => schedule.after(&now).next(),
            Self::Every(interval) => {
                Some(now + chrono::Duration::milliseconds(interval.as_millis() as i64))
            }
        }
    }
}

/// Go-style duration: concatenated `<number><unit>` segments, units
/// `h`, `m`, `s`, `ms`.
fn parse_go_duration(s: &str) -> Result<Duration, String> {
    if s.is_empty() {
        return Err("empty duration".to_string());
    }

    let mut total = Duration::ZERO;
    let mut number = String::new();
    let mut chars = s.chars().peekable();

    while let Some(c) = chars.next() {
        if c.is_ascii_digit() || c == '.' {
            number.push(c);
            continue;
        }

        let unit_millis = if c == 'm' && chars.peek() == Some(&'s') {
            chars.next();
            1.0
        } else {
            match c {
                'h' => 3_600_000.0,
                'm' => 60_000.0,
                's' => 1_000.0,
                _ => return Err(format!("unknown unit {c:?}")),
            }
        };

        let value: f64 = number
            .parse()
            .map_err(|_| format!("invalid number {number:?}"))?;
        number.clear();
        total += Duration::from_secs_f64(value * unit_millis / 1_000.0);
    }

    if !number.is_empty() {
        return Err(format!("number {number:?} has no unit"));
    }
    Ok(total)
}

#[derive(Clone)]
enum PayloadSource {
    Fixed(Vec<u8>),
    Generated(Arc<dyn Fn() -> Vec<u8> + Send + Sync>),
}

/// Template a recurring entry stamps job instances from
#[derive(Clone)]
pub struct JobTemplate {
    job_type: String,
    payload: PayloadSource,
    options: JobOptions,
}

impl JobTemplate {
    /// Template with a fixed raw payload
    pub fn new(job_type: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            job_type: job_type.into(),
            payload: PayloadSource::Fixed(payload.into()),
            options: JobOptions::new(),
        }
    }

    /// Template with a fixed JSON payload
    pub fn json<T: Serialize>(job_type: impl Into<String>, payload: &T) -> Result<Self, JobError> {
        let bytes = serde_json::to_vec(payload).map_err(JobError::Encode)?;
        Ok(Self::new(job_type, bytes))
    }

    /// Parameterized template: a fresh payload is generated per instance
    pub fn generated<F>(job_type: impl Into<String>, payload_fn: F) -> Self
    where
        F: Fn() -> Vec<u8> + Send + Sync + 'static,
    {
        Self {
            job_type: job_type.into(),
            payload: PayloadSource::Generated(Arc::new(payload_fn)),
            options: JobOptions::new(),
        }
    }

    /// Enqueue options applied to every instance
    pub fn with_options(mut self, options: JobOptions) -> Self {
        self.options = options;
        self
    }

    /// The job type instances are stamped with
    pub fn job_type(&self) -> &str {
        &self.job_type
    }

    fn instantiate(&self) -> Job {
        let payload = match &self.payload {
            PayloadSource::Fixed(bytes) => bytes.clone(),
            PayloadSource::Generated(f) => f(),
        };
        self.options.apply(Job::new(self.job_type.clone(), payload))
    }
}

impl fmt::Debug for JobTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobTemplate")
            .field("job_type", &self.job_type)
            .finish()
    }
}

struct Entry {
    id: Uuid,
    spec: ScheduleSpec,
    template: JobTemplate,
    next_at: DateTime<Utc>,
}

/// Recurring-job scheduler bound to one broker session
pub struct Scheduler {
    session: Arc<dyn Broker>,
    entries: Vec<Entry>,
}

impl Scheduler {
    /// Create a scheduler over the given session
    pub fn new(session: Arc<dyn Broker>) -> Self {
        Self {
            session,
            entries: vec![],
        }
    }

    /// Add a recurring entry
    ///
    /// Fails only this call on an unparsable expression; already-registered
    /// entries are unaffected.
    pub fn register(&mut self, expr: &str, template: JobTemplate) -> Result<Uuid, ScheduleError> {
        let spec: ScheduleSpec = expr.parse()?;
        let next_at =
            spec.next_after(Utc::now())
                .ok_or_else(|| ScheduleError::InvalidExpression {
                    expr: expr.to_string(),
                    reason: "no upcoming occurrence".to_string(),
                })?;

        let id = Uuid::now_v7();
        info!(entry_id = %id, job_type = %template.job_type(), expr, "recurring entry registered");
        self.entries.push(Entry {
            id,
            spec,
            template,
            next_at,
        });
        Ok(id)
    }

    /// Number of registered entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if no entries are registered
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drive the tick loop until shutdown or a broker failure
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) -> Result<(), SchedulerError> {
        let session = Arc::clone(&self.session);

        if self.entries.is_empty() {
            // Nothing will ever become due; park until shutdown
            if !*shutdown.borrow() {
                let _ = shutdown.changed().await;
            }
            return Ok(());
        }

        loop {
            if *shutdown.borrow() {
                return Ok(());
            }

            let Some(next) = self.entries.iter().map(|e| e.next_at).min() else {
                return Ok(());
            };
            let now = Utc::now();
            if next > now {
                let wait = (next - now).to_std().unwrap_or(Duration::ZERO);
                if sleep_or_shutdown(wait, &mut shutdown).await {
                    return Ok(());
                }
            }

            let now = Utc::now();
            for entry in &mut self.entries {
                if entry.next_at > now {
                    continue;
                }

                let job = entry.template.instantiate();
                session.push(&job).await?;
                info!(
                    entry_id = %entry.id,
                    job_id = %job.id,
                    job_type = %job.job_type,
                    "recurring job enqueued"
                );

                match entry.spec.next_after(now) {
                    Some(next_at) => entry.next_at = next_at,
                    None => {
                        warn!(entry_id = %entry.id, "schedule has no further occurrences");
                        entry.next_at = DateTime::<Utc>::MAX_UTC;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::InMemoryBroker;
    use crate::supervisor::ShutdownSignal;

    #[test]
    fn test_parse_every() {
        let spec: ScheduleSpec = "@every 30s".parse().unwrap();
        assert!(matches!(spec, ScheduleSpec::Every(d) if d == Duration::from_secs(30)));

        let spec: ScheduleSpec = "@every 1m30s".parse().unwrap();
        assert!(matches!(spec, ScheduleSpec::Every(d) if d == Duration::from_secs(90)));

        let spec: ScheduleSpec = "@every 2h".parse().unwrap();
        assert!(matches!(spec, ScheduleSpec::Every(d) if d == Duration::from_secs(7200)));
    }

    #[test]
    fn test_parse_five_field_cron() {
        let spec: ScheduleSpec = "*/5 * * * *".parse().unwrap();
        assert!(matches!(spec, ScheduleSpec::Cron(_)));

        let next = spec.next_after(Utc::now()).unwrap();
        assert!(next > Utc::now());
    }

    #[test]
    fn test_parse_six_field_cron_passes_through() {
        let spec: ScheduleSpec = "0 */5 * * * *".parse().unwrap();
        assert!(matches!(spec, ScheduleSpec::Cron(_)));
    }

    #[test]
    fn test_invalid_expressions_rejected() {
        for expr in ["not a cron", "@every", "@every squid", "@every 10", ""] {
            let result: Result<ScheduleSpec, _> = expr.parse();
            assert!(
                matches!(result, Err(ScheduleError::InvalidExpression { .. })),
                "accepted {expr:?}"
            );
        }
    }

    #[test]
    fn test_every_next_is_interval_from_now() {
        let spec = ScheduleSpec::Every(Duration::from_secs(30));
        let now = Utc::now();
        let next = spec.next_after(now).unwrap();
        assert_eq!(next - now, chrono::Duration::seconds(30));
    }

    #[test]
    fn test_register_rejects_bad_expression() {
        let broker = Arc::new(InMemoryBroker::new());
        let mut scheduler = Scheduler::new(broker);
        let result = scheduler.register("@every fast", JobTemplate::new("email:welcome", vec![]));
        assert!(matches!(
            result,
            Err(ScheduleError::InvalidExpression { .. })
        ));
        assert!(scheduler.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_three_ticks_in_ninety_seconds() {
        let broker = Arc::new(InMemoryBroker::new());
        let mut scheduler = Scheduler::new(Arc::clone(&broker) as Arc<dyn Broker>);
        scheduler
            .register("@every 30s", JobTemplate::new("email:welcome", vec![]))
            .unwrap();

        let signal = ShutdownSignal::new();
        let rx = signal.subscribe();
        let handle = tokio::spawn(async move { scheduler.run(rx).await });

        tokio::time::sleep(Duration::from_secs(95)).await;
        signal.trigger();
        handle.await.unwrap().unwrap();

        assert_eq!(broker.pending_count("default"), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_generated_payload_is_fresh_per_tick() {
        let broker = Arc::new(InMemoryBroker::new());
        let counter = Arc::new(std::sync::atomic::AtomicU32::new(0));
        let counter_in_template = Arc::clone(&counter);

        let mut scheduler = Scheduler::new(Arc::clone(&broker) as Arc<dyn Broker>);
        scheduler
            .register(
                "@every 10s",
                JobTemplate::generated("email:welcome", move || {
                    vec![counter_in_template.fetch_add(1, std::sync::atomic::Ordering::SeqCst) as u8]
                }),
            )
            .unwrap();

        let signal = ShutdownSignal::new();
        let rx = signal.subscribe();
        let handle = tokio::spawn(async move { scheduler.run(rx).await });

        tokio::time::sleep(Duration::from_secs(25)).await;
        signal.trigger();
        handle.await.unwrap().unwrap();

        assert_eq!(counter.load(std::sync::atomic::Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_broker_failure_tears_run_down() {
        let broker = Arc::new(InMemoryBroker::new());
        let mut scheduler = Scheduler::new(Arc::clone(&broker) as Arc<dyn Broker>);
        scheduler
            .register("@every 10s", JobTemplate::new("email:welcome", vec![]))
            .unwrap();
        broker.set_unreachable(true);

        let signal = ShutdownSignal::new();
        let rx = signal.subscribe();
        let handle = tokio::spawn(async move { scheduler.run(rx).await });

        tokio::time::sleep(Duration::from_secs(15)).await;
        let result = handle.await.unwrap();
        assert!(matches!(
            result,
            Err(SchedulerError::Broker(BrokerError::Unreachable(_)))
        ));
    }

    #[tokio::test]
    async fn test_empty_scheduler_parks_until_shutdown() {
        let broker = Arc::new(InMemoryBroker::new());
        let mut scheduler = Scheduler::new(Arc::clone(&broker) as Arc<dyn Broker>);

        let signal = ShutdownSignal::new();
        let rx = signal.subscribe();
        let handle = tokio::spawn(async move { scheduler.run(rx).await });

        signal.trigger();
        handle.await.unwrap().unwrap();
    }
}

//! Liveness supervision and process-wide shutdown
//!
//! Each long-running component (producer, scheduler, worker pool) runs
//! inside [`supervise`]: an infinite loop that establishes a fresh broker
//! session, health-checks it, backs off linearly while the broker is
//! unreachable, and restarts the component after a cool-down when it fails.
//! A clean (non-error) termination or the process-wide [`ShutdownSignal`]
//! ends the loop.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::broker::{Broker, BrokerConnector};

/// Process-wide cooperative shutdown signal
///
/// Components observe it at loop boundaries and before blocking calls,
/// never preemptively mid-handler.
#[derive(Debug)]
pub struct ShutdownSignal {
    tx: watch::Sender<bool>,
}

impl ShutdownSignal {
    /// Create an untriggered signal
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx }
    }

    /// Get a receiver to hand to a component
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }

    /// Fire the signal; all subscribers stop at their next check
    pub fn trigger(&self) {
        let _ = self.tx.send(true);
    }

    /// Check whether the signal has fired
    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }

    /// Fire the signal when the process receives an interrupt (ctrl-c)
    pub async fn trigger_on_interrupt(&self) -> std::io::Result<()> {
        tokio::signal::ctrl_c().await?;
        info!("interrupt received, shutting down");
        self.trigger();
        Ok(())
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// Sleep for `delay`, returning early if shutdown fires
///
/// Returns `true` when shutdown was observed.
pub async fn sleep_or_shutdown(delay: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    if *shutdown.borrow() {
        return true;
    }
    tokio::select! {
        _ = tokio::time::sleep(delay) => false,
        _ = shutdown.changed() => true,
    }
}

/// Linearly increasing delay between retries of an unreachable broker
///
/// `failures × base`, reset to zero on the first success.
#[derive(Debug)]
pub struct LinearBackoff {
    base: Duration,
    failures: u32,
}

impl LinearBackoff {
    /// Create a backoff with the given base interval
    pub fn new(base: Duration) -> Self {
        Self { base, failures: 0 }
    }

    /// Record a failure and return the delay to sleep before retrying
    pub fn next_delay(&mut self) -> Duration {
        self.failures += 1;
        self.base * self.failures
    }

    /// Reset after a success
    pub fn reset(&mut self) {
        self.failures = 0;
    }

    /// Consecutive failures so far
    pub fn failures(&self) -> u32 {
        self.failures
    }
}

/// Supervise loop configuration
#[derive(Debug, Clone)]
pub struct SuperviseConfig {
    /// Bounded timeout for the pre-start health check
    pub ping_timeout: Duration,

    /// Base interval of the linear unreachability backoff
    pub backoff_base: Duration,

    /// Cool-down before restarting a component that returned an error
    pub restart_cooldown: Duration,
}

impl Default for SuperviseConfig {
    fn default() -> Self {
        Self {
            ping_timeout: Duration::from_secs(5),
            backoff_base: Duration::from_secs(5),
            restart_cooldown: Duration::from_secs(10),
        }
    }
}

impl SuperviseConfig {
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

    /// Set the restart cool-down
    pub fn with_restart_cooldown(mut self, cooldown: Duration) -> Self {
        self.restart_cooldown = cooldown;
        self
    }
}

/// Run a component under restart-with-backoff supervision
///
/// Every iteration gets an owned, freshly connected session; a broken
/// session is discarded wholesale on restart, never shared or patched up.
/// The loop exits when the component terminates cleanly (`Ok`) or shutdown
/// fires; an `Err` return restarts the component after the cool-down.
pub async fn supervise<F, Fut, E>(
    name: &str,
    config: SuperviseConfig,
    connector: Arc<dyn BrokerConnector>,
    mut shutdown: watch::Receiver<bool>,
    mut component: F,
) where
    F: FnMut(Arc<dyn Broker>, watch::Receiver<bool>) -> Fut,
    Fut: Future<Output = Result<(), E>>,
    E: std::fmt::Display,
{
    let mut backoff = LinearBackoff::new(config.backoff_base);

    loop {
        if *shutdown.borrow() {
            break;
        }

        let session = match connector.connect().await {
            Ok(session) => session,
            Err(e) => {
                let delay = backoff.next_delay();
                warn!(component = name, error = %e, ?delay, "broker connect failed, backing off");
                if sleep_or_shutdown(delay, &mut shutdown).await {
                    break;
                }
                continue;
            }
        };

        if let Err(e) = session.ping(config.ping_timeout).await {
            let delay = backoff.next_delay();
            warn!(component = name, error = %e, ?delay, "broker health check failed, backing off");
            if sleep_or_shutdown(delay, &mut shutdown).await {
                break;
            }
            continue;
        }
        backoff.reset();

        info!(component = name, "starting");
        match component(session, shutdown.clone()).await {
            Ok(()) => {
                info!(component = name, "stopped cleanly");
                break;
            }
            Err(e) => {
                error!(
                    component = name,
                    error = %e,
                    cooldown = ?config.restart_cooldown,
                    "component failed, restarting after cool-down"
                );
                if sleep_or_shutdown(config.restart_cooldown, &mut shutdown).await {
                    break;
                }
            }
        }
    }

    debug!(component = name, "supervise loop exited");
}

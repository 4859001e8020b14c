use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, ValueEnum};
use ferroq_core::prelude::*;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod tasks;

/// Which components this process runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Mode {
    /// Producer and scheduler only
    Producer,
    /// Worker pool only
    Worker,
    /// Everything in one process
    Both,
}

#[derive(Debug, Parser)]
#[command(name = "ferroq", about = "Background-job service")]
struct Args {
    /// Broker address
    #[arg(
        long,
        default_value = "redis://127.0.0.1:6379",
        env = "FERROQ_BROKER_URL"
    )]
    broker: String,

    /// Components to run
    #[arg(long, value_enum, default_value_t = Mode::Both)]
    mode: Mode,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ferroq=info,ferroq_core=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    info!(broker = %args.broker, mode = ?args.mode, "ferroq starting");

    // A malformed initial schedule is a configuration error: fail fast,
    // before any component starts
    let _: ScheduleSpec = tasks::RECURRING_WELCOME_EXPR.parse()?;

    let connector: Arc<dyn BrokerConnector> = Arc::new(RedisConnector::new(&args.broker));
    let shutdown = ShutdownSignal::new();
    let mut handles = Vec::new();

    if matches!(args.mode, Mode::Producer | Mode::Both) {
        handles.push(tokio::spawn(supervise(
            "producer",
            SuperviseConfig::default(),
            Arc::clone(&connector),
            shutdown.subscribe(),
            {
                let connector = Arc::clone(&connector);
                move |session, shutdown| {
                    let connector = Arc::clone(&connector);
                    async move {
                        let producer =
                            Producer::new(session, connector, ProducerConfig::default());
                        producer.run(tasks::DemoSource, shutdown).await
                    }
                }
            },
        )));

        handles.push(tokio::spawn(supervise(
            "scheduler",
            SuperviseConfig::default(),
            Arc::clone(&connector),
            shutdown.subscribe(),
            |session, shutdown| async move {
                // Entries are re-registered on every restart, so no partial
                // registration state survives a reconnect
                let mut scheduler = Scheduler::new(session);
                scheduler.register(
                    tasks::RECURRING_WELCOME_EXPR,
                    tasks::recurring_welcome_template(),
                )?;
                scheduler.run(shutdown).await
            },
        )));
    }

    if matches!(args.mode, Mode::Worker | Mode::Both) {
        let registry = Arc::new(tasks::registry()?);
        handles.push(tokio::spawn(supervise(
            "worker-pool",
            SuperviseConfig::default(),
            Arc::clone(&connector),
            shutdown.subscribe(),
            move |session, shutdown| {
                let registry = Arc::clone(&registry);
                async move {
                    let config = WorkerPoolConfig::new(
                        QueueWeights::new()
                            .with_queue("critical", 6)
                            .with_queue("default", 3)
                            .with_queue("low", 1),
                    )
                    .with_concurrency(10);
                    let pool = WorkerPool::new(session, registry, config);
                    pool.run(shutdown).await
                }
            },
        )));
    }

    shutdown.trigger_on_interrupt().await?;
    for handle in handles {
        let _ = handle.await;
    }

    info!("shutdown complete");
    Ok(())
}

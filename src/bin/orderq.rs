//! orderq CLI — run the order producer or consumer against RabbitMQ.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use orderq::broker::QueueSpec;
use orderq::broker::amqp::AmqpTransport;
use orderq::broker::memory::MemoryBroker;
use orderq::config::{Config, Credentials, Endpoint, PipelineSettings};
use orderq::consumer::{Consumer, SimulatedWork};
use orderq::generator::generate;
use orderq::producer::Producer;
use orderq::telemetry::{TelemetryConfig, TelemetryGuard, init_telemetry};
use tracing::info;

#[derive(Parser)]
#[command(name = "orderq", about = "Durable order work-queue pipeline")]
struct Cli {
    /// Pipeline settings file (TOML)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Queue name (overrides the settings file)
    #[arg(long, global = true)]
    queue: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Publish a batch of synthetic orders, then exit
    Produce {
        /// Number of orders to publish
        #[arg(long)]
        count: Option<usize>,
        /// Pause between publishes, in milliseconds
        #[arg(long)]
        interval_ms: Option<u64>,
    },
    /// Process orders until interrupted
    Consume {
        /// Maximum unacknowledged deliveries
        #[arg(long)]
        prefetch: Option<u16>,
        /// Simulated work per order, in milliseconds
        #[arg(long)]
        work_delay_ms: Option<u64>,
        /// Drop a message after this many deliveries
        #[arg(long)]
        max_deliveries: Option<u32>,
    },
    /// Run producer and consumer in-process against an embedded broker
    Demo {
        /// Number of orders to push through
        #[arg(long, default_value_t = 3)]
        count: usize,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let mut settings = match &cli.config {
        Some(path) => PipelineSettings::load(path)?,
        None => PipelineSettings::default(),
    };
    if let Some(queue) = cli.queue {
        settings.queue = queue;
    }

    match cli.command {
        Command::Produce { count, interval_ms } => {
            if let Some(count) = count {
                settings.producer.batch_count = count;
            }
            if let Some(ms) = interval_ms {
                settings.producer.publish_interval_ms = ms;
            }
            cmd_produce(settings).await
        }
        Command::Consume {
            prefetch,
            work_delay_ms,
            max_deliveries,
        } => {
            if let Some(prefetch) = prefetch {
                settings.consumer.prefetch = prefetch;
            }
            if let Some(ms) = work_delay_ms {
                settings.consumer.work_delay_ms = ms;
            }
            if max_deliveries.is_some() {
                settings.consumer.max_deliveries = max_deliveries;
            }
            cmd_consume(settings).await
        }
        Command::Demo { count } => cmd_demo(settings, count).await,
    }
}

fn start_telemetry(config: &Config, service: &str) -> anyhow::Result<TelemetryGuard> {
    Ok(init_telemetry(TelemetryConfig {
        endpoint: config.otel_endpoint.clone(),
        service_name: service.to_string(),
        log_level: config.log_level.clone(),
    })?)
}

fn queue_spec(settings: &PipelineSettings) -> QueueSpec {
    QueueSpec::durable(&settings.queue).max_deliveries(settings.consumer.max_deliveries)
}

async fn cmd_produce(settings: PipelineSettings) -> anyhow::Result<()> {
    settings.validate()?;
    let config = Config::from_env()?;
    let _guard = start_telemetry(&config, "orderq-producer")?;

    let producer = Producer::connect(
        &AmqpTransport,
        &config.endpoint,
        &config.credentials,
        &queue_spec(&settings),
    )
    .await?;

    let report = producer.run(&settings.producer, generate).await?;
    println!(
        "Published {} order(s), {} unroutable.",
        report.published, report.unroutable
    );
    Ok(())
}

async fn cmd_consume(settings: PipelineSettings) -> anyhow::Result<()> {
    settings.validate()?;
    let config = Config::from_env()?;
    let _guard = start_telemetry(&config, "orderq-consumer")?;

    let consumer = Consumer::connect(
        &AmqpTransport,
        &config.endpoint,
        &config.credentials,
        &queue_spec(&settings),
        settings.consumer.prefetch,
    )
    .await?;

    let shutdown = consumer.shutdown_handle();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        shutdown.trigger();
    });

    let handler = SimulatedWork::new(settings.consumer.work_delay());
    let report = consumer.run(&handler).await?;
    println!(
        "Acknowledged {} order(s), discarded {} malformed.",
        report.acked, report.rejected
    );
    Ok(())
}

async fn cmd_demo(mut settings: PipelineSettings, count: usize) -> anyhow::Result<()> {
    let guard = init_telemetry(TelemetryConfig {
        endpoint: std::env::var("OTEL_ENDPOINT").ok(),
        service_name: "orderq-demo".to_string(),
        log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
    })?;

    settings.producer.batch_count = count;
    settings.validate()?;
    let broker = MemoryBroker::new();
    let endpoint = Endpoint::new("embedded");
    let credentials = Credentials::new("guest", "guest");
    let spec = queue_spec(&settings);

    let consumer = Consumer::connect(
        &broker,
        &endpoint,
        &credentials,
        &spec,
        settings.consumer.prefetch,
    )
    .await?;
    let shutdown = consumer.shutdown_handle();
    let handler = SimulatedWork::new(settings.consumer.work_delay());
    let consuming = tokio::spawn(async move { consumer.run(&handler).await });

    let producer = Producer::connect(&broker, &endpoint, &credentials, &spec).await?;
    let published = producer.run(&settings.producer, generate).await?;
    info!(published = published.published, "producer done, draining queue");

    while broker.ready_count(&spec.name) > 0 || broker.unacked_count() > 0 {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    shutdown.trigger();

    let report = consuming.await??;
    guard.force_flush();
    println!(
        "Published {}, acknowledged {}.",
        published.published, report.acked
    );
    Ok(())
}

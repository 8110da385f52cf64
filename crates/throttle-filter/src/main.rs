//! throttle-filter: per-sensor rate limiting between Kafka topics.
//!
//! Usage:
//!   throttle-filter [OPTIONS]
//!
//! Options (each also readable from the uppercased environment variable):
//!   --broker-config-file <FILE>                 Broker configuration JSON
//!   --worker-count <N>                          Number of event workers
//!   --http-listen <ADDR>                        Introspection listen address
//!   --decode-strategy <serde|collector>         Payload decode strategy
//!   --consumer-session-timeout-seconds <SECS>   Kafka session timeout
//!
//! `LOG_LEVEL` selects the log level (DEBUG|INFO|WARN|ERROR|FATAL|PANIC).

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::{broadcast, mpsc};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use throttle_filter::api::{self, ApiState, PromMetrics};
use throttle_filter::config::{BrokerConfig, FilterOptions, RawOptions};
use throttle_filter::consumer::Consumer;
use throttle_filter::producer::{run_delivery_loop, KafkaProducer, MessagePublisher};
use throttle_filter::state::{
    spawn_metrics_logger, ConsumerMetrics, ProducerMetrics, SharedBrokerHealth, WorkerMetrics,
};
use throttle_filter::worker::Worker;

/// How long the producer gets to deliver queued messages at shutdown.
const PRODUCER_FLUSH_TIMEOUT: Duration = Duration::from_secs(10);

/// CLI arguments. Every flag has an uppercased env var fallback.
#[derive(Parser, Debug)]
#[command(name = "throttle-filter")]
#[command(about = "Kafka telemetry throttle filter")]
#[command(version)]
struct Args {
    /// Broker configuration file
    #[arg(long)]
    broker_config_file: Option<PathBuf>,

    /// Number of event workers
    #[arg(long)]
    worker_count: Option<usize>,

    /// HTTP server listen address
    #[arg(long)]
    http_listen: Option<String>,

    /// How payloads should be decoded: serde, collector
    #[arg(long)]
    decode_strategy: Option<String>,

    /// Kafka consumer session timeout in seconds
    #[arg(long)]
    consumer_session_timeout_seconds: Option<u64>,
}

impl From<Args> for RawOptions {
    fn from(args: Args) -> Self {
        RawOptions {
            broker_config_file: args.broker_config_file,
            worker_count: args.worker_count,
            http_listen: args.http_listen,
            decode_strategy: args.decode_strategy,
            consumer_session_timeout_seconds: args.consumer_session_timeout_seconds,
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<()> {
    // Load environment variables from .env file (if present)
    let _ = dotenvy::dotenv();

    init_logging()?;

    let args = Args::parse();
    let options = FilterOptions::resolve(args.into())?;
    info!(?options, "starting throttle-filter");

    info!(path = %options.broker_config_file.display(), "parsing broker configuration");
    let broker_config = BrokerConfig::from_file(&options.broker_config_file)?;

    let decoder = options.decode_strategy.decoder();
    info!(strategy = %options.decode_strategy, "decode strategy");

    //
    // Producer: created first, shared by every worker.
    //
    let producer_metrics = Arc::new(ProducerMetrics::default());
    let producer_health = SharedBrokerHealth::new();
    let (producer, delivery_rx) = KafkaProducer::new(
        &broker_config,
        producer_metrics.clone(),
        producer_health.clone(),
    )?;
    let producer: Arc<KafkaProducer> = Arc::new(producer);
    let delivery_handle = tokio::spawn(run_delivery_loop(
        delivery_rx,
        producer_metrics.clone(),
        producer_health.clone(),
    ));

    //
    // Workers: one bounded queue each, shutdown via one broadcast.
    //
    let (worker_shutdown, _) = broadcast::channel::<()>(1);
    let mut worker_metrics = Vec::with_capacity(options.worker_count);
    let mut work_queues = Vec::with_capacity(options.worker_count);
    let mut worker_handles = Vec::with_capacity(options.worker_count);

    for id in 0..options.worker_count {
        let metrics = Arc::new(WorkerMetrics::default());
        let (tx, rx) = mpsc::channel(1);

        let worker = Worker::new(
            id,
            &broker_config,
            decoder.clone(),
            producer.clone() as Arc<dyn MessagePublisher>,
            rx,
            metrics.clone(),
        );

        worker_handles.push(tokio::spawn(worker.run(worker_shutdown.subscribe())));
        spawn_metrics_logger(format!("worker-{id}"), worker_shutdown.subscribe(), {
            let metrics = metrics.clone();
            move || metrics.snapshot()
        });

        worker_metrics.push(metrics);
        work_queues.push(tx);
    }

    //
    // Consumer: subscribe failures here are fatal.
    //
    let (consumer_shutdown, _) = broadcast::channel::<()>(1);
    let consumer_metrics = Arc::new(ConsumerMetrics::default());
    let consumer_health = SharedBrokerHealth::new();
    let consumer = Consumer::new(
        0,
        &broker_config,
        options.consumer_session_timeout,
        work_queues,
        consumer_metrics.clone(),
        consumer_health.clone(),
    )?;
    let consumer_handle = tokio::spawn(consumer.run(consumer_shutdown.subscribe()));
    spawn_metrics_logger("consumer-0".to_string(), consumer_shutdown.subscribe(), {
        let metrics = consumer_metrics.clone();
        move || metrics.snapshot()
    });

    //
    // Introspection API and the producer's metrics log live for the whole
    // process; they stop on the process-level shutdown signal.
    //
    let (process_shutdown, _) = broadcast::channel::<()>(1);
    spawn_metrics_logger("producer-0".to_string(), process_shutdown.subscribe(), {
        let metrics = producer_metrics.clone();
        move || metrics.snapshot()
    });

    let api_state = ApiState {
        consumer_metrics,
        consumer_health,
        worker_metrics,
        producer_metrics,
        producer_health: producer_health.clone(),
        prom: Arc::new(PromMetrics::new().context("failed to register prometheus metrics")?),
    };
    let api_handle = tokio::spawn(api::serve(
        options.http_listen,
        api_state,
        process_shutdown.subscribe(),
    ));

    wait_for_shutdown().await?;

    // Strict shutdown ordering: consumer first (no new work), then workers
    // (queued work dropped), then the producer flush.
    info!("stopping consumer");
    let _ = consumer_shutdown.send(());
    consumer_handle.await.context("consumer task panicked")?;
    info!("consumer completed");

    info!("stopping workers");
    let _ = worker_shutdown.send(());
    for handle in worker_handles {
        handle.await.context("worker task panicked")?;
    }
    info!("all workers completed");

    info!("stopping producer");
    producer.flush(PRODUCER_FLUSH_TIMEOUT);
    producer_health.mark_closed();
    drop(producer);
    delivery_handle.await.context("delivery loop panicked")?;
    info!("producer completed");

    let _ = process_shutdown.send(());
    if let Ok(result) = api_handle.await {
        result?;
    }

    Ok(())
}

/// Configure the global subscriber from the `LOG_LEVEL` env var.
fn init_logging() -> Result<()> {
    let level = match std::env::var("LOG_LEVEL")
        .unwrap_or_default()
        .to_uppercase()
        .as_str()
    {
        "DEBUG" => Level::DEBUG,
        "WARN" => Level::WARN,
        // FATAL and PANIC are finer-grained than tracing offers; both mean
        // "errors only".
        "ERROR" | "FATAL" | "PANIC" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("failed to set global tracing subscriber")
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM).
async fn wait_for_shutdown() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;

        tokio::select! {
            _ = sigterm.recv() => {
                info!("received SIGTERM, terminating");
            }
            _ = sigint.recv() => {
                info!("received SIGINT, terminating");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("received Ctrl+C, terminating");
    }

    Ok(())
}

use anyhow::Context;
use clap::{Parser, Subcommand};
use dotenv::dotenv;
use eventbus::{
    Backend, BusConfig, Consumer, EmitOptions, Emitter, Producer, Store, TracingLifeCycle,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "eventbus")]
#[command(about = "Run a consumer or emit events on a partitioned Redis event bus")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Store backend
    #[arg(long, env = "EVENTBUS_BACKEND", default_value = "redis", global = true)]
    backend: Backend,

    /// Store endpoint (falls back to REDIS_URL)
    #[arg(long, env = "EVENTBUS_ENDPOINT", global = true)]
    endpoint: Option<String>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Register a service and consume its partitions until interrupted
    Consume(ConsumeArgs),

    /// Emit one event
    Emit(EmitArgs),
}

#[derive(clap::Args)]
struct ConsumeArgs {
    /// Service id of the consumer group
    #[arg(short, long, env = "EVENTBUS_CLIENT_ID")]
    service: String,

    /// Event to consume, as `name` or `name:version`; repeatable, `*` for all
    #[arg(short, long = "event", required = true)]
    events: Vec<String>,

    /// Partitions registered for the service
    #[arg(short, long, env = "EVENTBUS_PARTITION_COUNT", default_value = "1")]
    partitions: u32,

    /// Stable consumer id (random when absent)
    #[arg(long)]
    consumer_id: Option<String>,

    /// Heartbeat period in milliseconds
    #[arg(long, env = "EVENTBUS_HEARTBEAT_MS", default_value = "250")]
    heartbeat_ms: u64,

    /// Liveness TTL in milliseconds, must exceed the heartbeat period
    #[arg(long, env = "EVENTBUS_LIVENESS_TTL_MS", default_value = "1000")]
    liveness_ttl_ms: u64,

    /// Pause between empty polls in milliseconds
    #[arg(long, env = "EVENTBUS_IDLE_SLEEP_MS", default_value = "200")]
    idle_sleep_ms: u64,
}

#[derive(clap::Args)]
struct EmitArgs {
    /// Event name
    #[arg(short, long)]
    name: String,

    /// JSON payload
    #[arg(short, long, default_value = "{}")]
    payload: String,

    /// Event version
    #[arg(long)]
    version: Option<u32>,

    /// Partition key (the payload is hashed when absent)
    #[arg(short, long)]
    key: Option<String>,

    /// Correlation id (generated when absent)
    #[arg(long)]
    cid: Option<String>,

    /// Producer id stamped on the event
    #[arg(long, env = "EVENTBUS_CLIENT_ID", default_value = "eventbus-cli")]
    producer: String,
}

/// Split `name[:version]`. Names may contain `:`, so only a numeric last
/// segment is taken as the version.
fn parse_event_spec(spec: &str) -> (&str, Option<u32>) {
    match spec.rsplit_once(':') {
        Some((name, version)) if !name.is_empty() => match version.parse() {
            Ok(version) => (name, Some(version)),
            Err(_) => (spec, None),
        },
        _ => (spec, None),
    }
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let json = std::env::var("EVENTBUS_LOG_FORMAT").is_ok_and(|format| format == "json");

    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received Ctrl+C, initiating graceful shutdown"),
        _ = terminate => tracing::info!("Received SIGTERM, initiating graceful shutdown"),
    }
}

fn base_config(cli: &Cli, client_id: &str) -> BusConfig {
    let mut config = BusConfig::new(client_id).with_backend(cli.backend);
    if let Some(endpoint) = cli
        .endpoint
        .clone()
        .or_else(|| std::env::var("REDIS_URL").ok())
    {
        config = config.with_endpoint(endpoint);
    }
    config
}

async fn run_consume(cli: &Cli, args: &ConsumeArgs) -> anyhow::Result<()> {
    let config = base_config(cli, &args.service)
        .with_partition_count(args.partitions)
        .with_heartbeat(
            Duration::from_millis(args.heartbeat_ms),
            Duration::from_millis(args.liveness_ttl_ms),
        )
        .with_idle_sleep(Duration::from_millis(args.idle_sleep_ms));
    if config.backend == Backend::Memory {
        tracing::warn!("Memory backend only sees events emitted by this process");
    }

    let store = Store::connect(&config)
        .await
        .with_context(|| format!("Failed to connect to {} store", config.backend))?;

    let emitter = Emitter::new();
    for spec in &args.events {
        let (name, version) = parse_event_spec(spec);
        emitter.receive(name, version, |event| {
            tracing::info!(
                event_name = %event.meta.name,
                version = ?event.meta.version,
                event_id = %event.meta.event_id,
                correlation_id = %event.meta.correlation_id,
                producer = %event.meta.producer_id,
                payload = %event.payload,
                "Received event"
            );
            Ok(())
        });
    }

    let mut consumer = Consumer::new(store, config, Arc::new(emitter))?
        .with_life_cycle(Arc::new(TracingLifeCycle));
    if let Some(consumer_id) = &args.consumer_id {
        consumer = consumer.with_consumer_id(consumer_id.as_str());
    }
    let consumer = Arc::new(consumer);
    let handle = consumer.handle();

    let mut task = tokio::spawn({
        let consumer = consumer.clone();
        async move { consumer.run().await }
    });

    tokio::select! {
        result = &mut task => {
            result.context("Consumer task panicked")??;
            return Ok(());
        }
        _ = wait_for_shutdown_signal() => {}
    }

    handle.stop();
    task.await.context("Consumer task panicked")??;
    Ok(())
}

async fn run_emit(cli: &Cli, args: &EmitArgs) -> anyhow::Result<()> {
    let config = base_config(cli, &args.producer);
    config.validate()?;
    let payload: serde_json::Value =
        serde_json::from_str(&args.payload).context("Payload is not valid JSON")?;

    let store = Store::connect(&config)
        .await
        .with_context(|| format!("Failed to connect to {} store", config.backend))?;

    let mut options = EmitOptions::new();
    options.version = args.version;
    options.correlation_id = args.cid.clone();
    options.key = args.key.clone();

    let event = Producer::new(store, args.producer.as_str())
        .emit(&args.name, payload, options)
        .await?;
    println!("{}", serde_json::to_string_pretty(&event)?);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match &cli.command {
        Commands::Consume(args) => run_consume(&cli, args).await?,
        Commands::Emit(args) => run_emit(&cli, args).await?,
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_event_spec() {
        assert_eq!(parse_event_spec("orders:created"), ("orders:created", None));
        assert_eq!(parse_event_spec("orders:created:2"), ("orders:created", Some(2)));
        assert_eq!(parse_event_spec("ping"), ("ping", None));
        assert_eq!(parse_event_spec("*"), ("*", None));
        assert_eq!(parse_event_spec(":3"), (":3", None));
    }

    #[test]
    fn test_cli_parses_consume() {
        let cli = Cli::try_parse_from([
            "eventbus",
            "--backend",
            "memory",
            "consume",
            "--service",
            "billing",
            "-e",
            "orders:created:1",
            "-e",
            "*",
            "--partitions",
            "4",
        ])
        .unwrap();
        assert_eq!(cli.backend, Backend::Memory);
        let Commands::Consume(args) = cli.command else {
            panic!("expected consume");
        };
        assert_eq!(args.service, "billing");
        assert_eq!(args.events, vec!["orders:created:1", "*"]);
        assert_eq!(args.partitions, 4);
    }

    #[test]
    fn test_cli_requires_an_event() {
        assert!(Cli::try_parse_from(["eventbus", "consume", "--service", "billing"]).is_err());
    }
}

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde_json::json;
use tracing::info;
use tracing_subscriber::EnvFilter;

use turnstile::admission::{AdmissionLayer, SimpleResponse};
use turnstile::config::{StoreBackend, TurnstileConfig};
use turnstile::ratelimit::{Clock, CounterStore, ManualClock, MemoryStore, SystemClock};

/// Request admission control: inspect a policy or replay traffic through it.
#[derive(Parser)]
#[command(name = "turnstile", version)]
struct Cli {
    /// Configuration file (YAML)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log level used when RUST_LOG is not set
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Validate the configuration and print it
    Check,

    /// Replay requests for one key and print each decision as a JSON line
    Simulate {
        /// Quota key the requests are attributed to
        #[arg(long)]
        key: String,

        /// Number of requests to send
        #[arg(long, default_value_t = 10)]
        requests: u32,

        /// Simulated milliseconds between requests
        #[arg(long, default_value_t = 0)]
        step_ms: u64,

        /// Count in Redis instead of in memory
        #[arg(long)]
        redis_url: Option<String>,
    },
}

struct SimulatedRequest {
    key: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Logs go to stderr so stdout stays machine-readable.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let config = TurnstileConfig::load(cli.config.as_deref()).context("Invalid configuration")?;

    match cli.command {
        Command::Check => {
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
        Command::Simulate {
            key,
            requests,
            step_ms,
            redis_url,
        } => simulate(config, key, requests, step_ms, redis_url).await?,
    }

    Ok(())
}

async fn simulate(
    config: TurnstileConfig,
    key: String,
    requests: u32,
    step_ms: u64,
    redis_url: Option<String>,
) -> anyhow::Result<()> {
    let store = build_store(&config, redis_url).await?;
    let clock = ManualClock::new(SystemClock::new().now_ms());

    let layer = AdmissionLayer::builder(config.policy, |req: &SimulatedRequest| req.key.clone())
        .shared_store(store)
        .clock(clock.clone())
        .build()?;

    info!(key = %key, requests = requests, step_ms = step_ms, "Starting simulation");

    let request = SimulatedRequest { key };
    for n in 1..=requests {
        let mut response = SimpleResponse::new();
        let admission = layer.handle(&request, &mut response).await?;

        println!(
            "{}",
            json!({
                "request": n,
                "at_ms": clock.now_ms(),
                "admission": admission,
                "status": response.status.unwrap_or(200),
                "body": response.body,
                "headers": response.headers,
            })
        );

        clock.advance(step_ms);
    }

    if let Some(stats) = layer.metrics() {
        println!("{}", json!({ "metrics": stats }));
    }

    Ok(())
}

async fn build_store(
    config: &TurnstileConfig,
    redis_url: Option<String>,
) -> anyhow::Result<Arc<dyn CounterStore>> {
    let redis_url = redis_url.or_else(|| config.store.redis_url.clone());

    if config.store.backend == StoreBackend::Memory && redis_url.is_none() {
        return Ok(Arc::new(MemoryStore::new()));
    }

    connect_redis(config, redis_url).await
}

#[cfg(feature = "redis")]
async fn connect_redis(
    config: &TurnstileConfig,
    redis_url: Option<String>,
) -> anyhow::Result<Arc<dyn CounterStore>> {
    use std::time::Duration;
    use turnstile::ratelimit::{RedisCounterClient, RemoteStore, RemoteStoreConfig};

    let url = redis_url.context("store.redis_url is required for the redis backend")?;
    let client = RedisCounterClient::connect(&url)
        .await
        .with_context(|| format!("Failed to connect to {}", url))?;

    info!(url = %url, "Connected to Redis");

    let store_config = RemoteStoreConfig {
        key_prefix: config.store.key_prefix.clone(),
        timeout: config.store.timeout_ms.map(Duration::from_millis),
    };
    Ok(Arc::new(RemoteStore::with_config(client, store_config)))
}

#[cfg(not(feature = "redis"))]
async fn connect_redis(
    _config: &TurnstileConfig,
    _redis_url: Option<String>,
) -> anyhow::Result<Arc<dyn CounterStore>> {
    anyhow::bail!("turnstile was built without the `redis` feature")
}

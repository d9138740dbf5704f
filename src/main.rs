//! Route Gateway - CLI Application
//!
//! Authenticating, metering gateway in front of the route optimization
//! service, configured via TOML.

use clap::{Parser, Subcommand};
use route_gateway::{
    config::GatewayConfig,
    gateway::GatewayCoordinator,
    health::HealthChecker,
    metrics::GatewayMetrics,
    routes::{self, AppState},
    store::MemoryStore,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Route Gateway - API key authentication, rate limiting and metering for route optimization
#[derive(Parser)]
#[command(name = "route-gateway")]
#[command(version, about = "API gateway for the route optimization service", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the gateway server
    Start {
        /// Configuration file path
        #[arg(short, long, default_value = "config.toml")]
        config: String,
    },
    /// Validate the configuration file
    Validate {
        /// Configuration file path
        #[arg(short, long, default_value = "config.toml")]
        config: String,
    },
    /// Generate a sample configuration file
    Init {
        /// Output file path
        #[arg(short, long, default_value = "config.toml")]
        output: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Start { config } => start_server(&config).await?,
        Commands::Validate { config } => validate_config(&config)?,
        Commands::Init { output } => generate_sample_config(&output)?,
    }

    Ok(())
}

/// Start the gateway server
async fn start_server(config_path: &str) -> anyhow::Result<()> {
    let config = GatewayConfig::from_file(config_path)?;

    // RUST_LOG wins over the configured level
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.logging.level))?;
    let subscriber = FmtSubscriber::builder().with_env_filter(filter).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    info!("Loaded configuration from {}", config_path);

    let store = Arc::new(MemoryStore::seeded(&config.principals, &config.tiers));
    let metrics = GatewayMetrics::new()?;
    let health = HealthChecker::new(store.clone(), config.store.timeout());
    let coordinator = GatewayCoordinator::from_config(&config, store.clone(), metrics.clone())?;

    let state = AppState {
        coordinator: coordinator.clone(),
        metrics,
        health: health.clone(),
    };
    let app = routes::router(state, &config);

    if config.health.enabled {
        info!("Health endpoint enabled at {}", config.health.path);
    }
    if config.metrics.enabled {
        info!("Metrics endpoint enabled at {}", config.metrics.path);
    }

    // Expired rate windows are never read again; drop them periodically
    let window = config.rate_window();
    let sweeper = {
        let store = store.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(window);
            loop {
                ticker.tick().await;
                let removed = store.sweep_windows(chrono::Utc::now());
                if removed > 0 {
                    tracing::debug!(removed, "Swept expired rate windows");
                }
            }
        })
    };

    let addr: SocketAddr = config.server_addr().parse()?;
    info!("Starting gateway server on {}", addr);
    info!("Upstream optimization service: {}", config.upstream.url);
    info!("Seed principals: {}", config.principals.len());

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal(health))
        .await?;

    sweeper.abort();
    info!(pending = coordinator.meter().pending(), "Flushing usage records");
    coordinator.meter().flush().await;
    info!("Gateway stopped");

    Ok(())
}

async fn shutdown_signal(health: HealthChecker) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
    }
    info!("Shutdown signal received");
    health.set_ready(false);
}

/// Validate configuration file
fn validate_config(config_path: &str) -> anyhow::Result<()> {
    match GatewayConfig::from_file(config_path) {
        Ok(config) => {
            println!("✓ Configuration is valid!");
            println!();
            println!("Server: {}:{}", config.server.host, config.server.port);
            println!("Upstream: {}", config.upstream.url);
            match &config.identity_provider.url {
                Some(url) => println!("Identity provider: {}", url),
                None => println!("Identity provider: (none, API keys only)"),
            }
            println!("Rate window: {}s", config.rate_limit.window_secs);
            println!();
            println!("Tiers:");
            for tier in route_gateway::identity::Tier::ALL {
                let limits = config.tiers.get(tier);
                println!(
                    "  {:<13} {:>4} req/min  {:>7} req/month  custom keys: {}",
                    tier.as_str(),
                    limits.requests_per_minute,
                    limits.monthly_requests,
                    if limits.custom_keys { "✓" } else { "✗" }
                );
            }
            println!();
            println!("Seed principals: {}", config.principals.len());
            Ok(())
        }
        Err(e) => {
            eprintln!("✗ Configuration is invalid:");
            eprintln!("  {}", e);
            std::process::exit(1);
        }
    }
}

/// Generate sample configuration file
fn generate_sample_config(output_path: &str) -> anyhow::Result<()> {
    let sample_config = r#"# Route Gateway Configuration

[server]
host = "0.0.0.0"
port = 8080
timeout = 60

[identity_provider]
# url = "https://auth.example.com/auth/v1/user"
timeout_ms = 5000
# api_key may also come from GATEWAY_IDP_API_KEY

[store]
backend = "memory"
timeout_ms = 5000

[upstream]
url = "http://localhost:8000/api/v1/optimize"
trust_header = "X-Internal-Secret"
# secret may also come from GATEWAY_UPSTREAM_SECRET
secret = "change-me"
timeout_ms = 30000

[api_keys]
prefix = "sk_"
display_prefix_len = 12
# hash_pepper may also come from GATEWAY_HASH_PEPPER
hash_pepper = ""
trial_days = 14

[rate_limit]
window_secs = 60

[tiers.trial]
requests_per_minute = 5
monthly_requests = 100
overage_price = 0.0
custom_keys = false

[tiers.starter]
requests_per_minute = 10
monthly_requests = 1000
overage_price = 0.01
custom_keys = true

[tiers.professional]
requests_per_minute = 50
monthly_requests = 10000
overage_price = 0.008
custom_keys = true

[tiers.enterprise]
requests_per_minute = 200
monthly_requests = 100000
overage_price = 0.005
custom_keys = true

[metrics]
enabled = true
path = "/metrics"

[health]
enabled = true
path = "/health"

[logging]
level = "info"

# Principals loaded into the in-memory store at startup
[[principals]]
id = "8d7f2c1e-4b5a-4f3e-9c2d-1a0b9e8f7d6c"
email = "ops@example.com"
tier = "starter"
"#;

    std::fs::write(output_path, sample_config)?;
    println!("Sample configuration written to {}", output_path);
    Ok(())
}

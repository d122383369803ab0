use rand::Rng;
use std::fs::OpenOptions;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use weighted_balancer::balancer::{Balancer, BalancerOptions};
use weighted_balancer::client::SyntheticClient;
use weighted_balancer::config::{Config, LogFormat};
use weighted_balancer::error::{AppError, Result};
use weighted_balancer::service::ExpensiveFragileService;

#[tokio::main]
async fn main() -> Result<()> {
    // Load Config
    let config = Config::load()?;

    // Initialize logging
    init_logging(&config)?;

    let max_parallel = config
        .max_parallel
        .unwrap_or_else(|| rand::rng().random_range(50..200));
    info!("Max parallel requests: {}", max_parallel);

    let service = Arc::new(ExpensiveFragileService::new(
        config.failure_per_mille,
        Duration::from_millis(config.max_latency_ms),
    ));
    let options = BalancerOptions {
        idle_backoff: Duration::from_millis(config.idle_backoff_ms),
        seed: None,
    };
    let balancer = Arc::new(Balancer::with_options(service, max_parallel, options)?);

    info!("Starting {} clients", config.clients);
    for _ in 0..config.clients {
        let (requests, weight, delay) = {
            let mut rng = rand::rng();
            (
                rng.random_range(config.min_requests..=config.max_requests),
                rng.random_range(config.min_weight..=config.max_weight),
                Duration::from_millis(rng.random_range(0..=config.max_start_delay_ms)),
            )
        };

        let balancer = balancer.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            info!("Client with {} requests and weight {} joining", requests, weight);
            if let Err(e) = balancer.register(Arc::new(SyntheticClient::new(requests, weight))) {
                error!("Failed to register client: {}", e);
            }
        });
    }

    // Periodic stats
    let stats = balancer.stats();
    let stats_interval = Duration::from_secs(config.stats_interval_secs.max(1));
    let reporter = tokio::spawn(async move {
        let mut interval = tokio::time::interval(stats_interval);
        loop {
            interval.tick().await;
            stats.log_stats();
        }
    });

    tokio::select! {
        _ = tokio::time::sleep(Duration::from_secs(config.run_seconds)) => {
            info!("Run time of {}s elapsed", config.run_seconds);
        }
        signal = tokio::signal::ctrl_c() => {
            if let Err(e) = signal {
                error!("Failed to listen for ctrl-c: {}", e);
            }
            info!("Interrupted");
        }
    }

    balancer.shutdown().await;
    reporter.abort();
    balancer.stats().log_stats();

    Ok(())
}

fn init_logging(config: &Config) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    let installed = match (config.log_path(), config.log_format) {
        (Some(path), format) => {
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            let builder = builder.with_writer(Mutex::new(file)).with_ansi(false);
            match format {
                LogFormat::Json => builder.json().try_init(),
                LogFormat::Text => builder.try_init(),
            }
        }
        (None, LogFormat::Json) => builder.json().try_init(),
        (None, LogFormat::Text) => builder.try_init(),
    };

    installed.map_err(|e| AppError::Init(format!("Failed to initialize logging: {}", e)))
}

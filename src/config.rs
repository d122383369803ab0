use serde::Deserialize;
use crate::error::{Result, AppError};
use config::{Config as ConfigLoader, File, Environment};

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    // General
    pub log_level: String,
    pub log_format: LogFormat,
    pub log_file: Option<String>, // Empty or absent logs to stdout

    // Balancer
    pub max_parallel: Option<usize>, // Picked at random in 50..200 when absent
    pub idle_backoff_ms: u64,
    pub stats_interval_secs: u64,

    // Demo clients
    pub clients: usize,
    pub min_requests: u64,
    pub max_requests: u64,
    pub min_weight: u32,
    pub max_weight: u32,
    pub max_start_delay_ms: u64,
    pub run_seconds: u64,

    // Demo service
    pub failure_per_mille: u32,
    pub max_latency_ms: u64,
}

impl Config {
    /// Defaults, then `balancer.toml` if present, then `BALANCER_*`
    /// environment variables (a `.env` file is loaded first).
    pub fn load() -> Result<Self> {
        dotenv::dotenv().ok();

        let loader = ConfigLoader::builder()
            .set_default("log_level", "info")?
            .set_default("log_format", "text")?
            .set_default("log_file", "app.log")?
            .set_default("idle_backoff_ms", 10)?
            .set_default("stats_interval_secs", 5)?
            .set_default("clients", 3)?
            .set_default("min_requests", 500)?
            .set_default("max_requests", 1500)?
            .set_default("min_weight", 1)?
            .set_default("max_weight", 3)?
            .set_default("max_start_delay_ms", 50)?
            .set_default("run_seconds", 40)?
            .set_default("failure_per_mille", 2)?
            .set_default("max_latency_ms", 100)?
            .add_source(File::with_name("balancer").required(false))
            .add_source(Environment::with_prefix("BALANCER").try_parsing(true))
            .build()?;

        let config: Self = loader.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_parallel == Some(0) {
            return Err(AppError::InvalidCeiling);
        }
        if self.min_weight < 1 {
            return Err(AppError::InvalidWeight(self.min_weight));
        }
        if self.min_weight > self.max_weight {
            return Err(AppError::Init(format!(
                "min_weight {} is above max_weight {}",
                self.min_weight, self.max_weight
            )));
        }
        if self.min_requests < 1 || self.min_requests > self.max_requests {
            return Err(AppError::Init(format!(
                "request range {}..={} is empty or starts at zero",
                self.min_requests, self.max_requests
            )));
        }
        if self.idle_backoff_ms == 0 {
            return Err(AppError::Init("idle_backoff_ms must be positive".into()));
        }
        Ok(())
    }

    /// Log file path, unless logging goes to stdout.
    pub fn log_path(&self) -> Option<&str> {
        self.log_file.as_deref().filter(|path| !path.trim().is_empty())
    }
}

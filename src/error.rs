use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid weight {0}: a client weight must be at least 1")]
    InvalidWeight(u32),

    #[error("Invalid ceiling: the maximum number of parallel requests must be at least 1")]
    InvalidCeiling,

    #[error("Balancer is shutting down, registration rejected")]
    ShutDown,

    #[error("Initialization error: {0}")]
    Init(String),
}

pub type Result<T> = std::result::Result<T, AppError>;

use thiserror::Error;

/// Errors raised by the shared core components.
#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Configuration error: {0}")]
    Config(#[from] ::config::ConfigError),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid digest: {0}")]
    InvalidDigest(String),

    #[error("Tracing initialization failed: {0}")]
    TracingInit(String),
}

pub type Result<T> = std::result::Result<T, CoreError>;

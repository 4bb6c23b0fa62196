//! Error types for loadq

use thiserror::Error;

/// Result type alias for loadq operations
pub type Result<T> = std::result::Result<T, LoadqError>;

/// Main error type shared across loadq crates
#[derive(Error, Debug)]
pub enum LoadqError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid load key '{0}': expected <database>#<table>")]
    InvalidLoadKey(String),

    #[error("Invalid execution name '{0}': expected <database>/<table>_<millis>[-<nonce>][~<attempt>]")]
    InvalidExecutionName(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

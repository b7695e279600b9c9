use thiserror::Error;

use crate::config::ConfigError;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Arena exhausted: requested {requested} bytes with {used} of {limit} bytes in use")]
    ArenaExhausted {
        requested: usize,
        used: usize,
        limit: usize,
    },

    #[error("Logging error: {0}")]
    Logging(String),
}

pub type Result<T> = std::result::Result<T, CoreError>;

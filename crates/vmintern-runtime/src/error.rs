use thiserror::Error;
use vmintern_core::{ConfigError, CoreError};
use vmintern_loader::LoaderError;
use vmintern_symbols::SymbolError;

#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error(transparent)]
    Symbol(#[from] SymbolError),

    #[error(transparent)]
    Loader(#[from] LoaderError),

    #[error(transparent)]
    Core(#[from] CoreError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Failed to start maintenance service: {0}")]
    ServiceStart(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, RuntimeError>;

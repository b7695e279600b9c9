use thiserror::Error;
use vmintern_core::CoreError;

/// Longest identifier the table accepts, in bytes.
pub const MAX_IDENTIFIER_LENGTH: usize = u16::MAX as usize;

#[derive(Debug, Error)]
pub enum SymbolError {
    #[error("identifier of {length} bytes exceeds the maximum of {max}")]
    TooLong { length: usize, max: usize },

    #[error("permanent arena exhausted: requested {requested} bytes with {used} of {limit} used")]
    ArenaExhausted {
        requested: usize,
        used: usize,
        limit: usize,
    },

    #[error(transparent)]
    Core(CoreError),
}

impl From<CoreError> for SymbolError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::ArenaExhausted {
                requested,
                used,
                limit,
            } => Self::ArenaExhausted {
                requested,
                used,
                limit,
            },
            other => Self::Core(other),
        }
    }
}

pub type Result<T> = std::result::Result<T, SymbolError>;

pub(crate) fn check_length(bytes: &[u8]) -> Result<()> {
    if bytes.len() > MAX_IDENTIFIER_LENGTH {
        return Err(SymbolError::TooLong {
            length: bytes.len(),
            max: MAX_IDENTIFIER_LENGTH,
        });
    }
    Ok(())
}

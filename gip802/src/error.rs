//! Error types for Gip802

use thiserror::Error;

/// Main error type for Gip802 operations
#[derive(Error, Debug)]
pub enum Gip802Error {
    #[error("frame too short: need {need} bytes, have {have}")]
    Truncated { need: usize, have: usize },

    #[error("invalid DMA message: {message}")]
    Message { message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for Gip802 operations
pub type Result<T> = std::result::Result<T, Gip802Error>;

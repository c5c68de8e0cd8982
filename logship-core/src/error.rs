use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ShipError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid pattern: {0}")]
    Pattern(#[from] regex::Error),

    #[error("Apply failed for '{path}': {reason}")]
    Apply { path: PathBuf, reason: String },

    #[error("Watch error: {0}")]
    Watch(String),

    #[error("All watched directories became inaccessible")]
    WatchExhausted,

    #[error("Operation cancelled: {0}")]
    Cancelled(String),
}

pub type Result<T> = std::result::Result<T, ShipError>;

//! Crate-wide error type.

/// Result alias used across tablift crates.
pub type Result<T> = std::result::Result<T, TabliftError>;

/// Top-level error for the pipeline.
#[derive(Debug, thiserror::Error)]
pub enum TabliftError {
    /// Configuration file could not be read or parsed.
    #[error("config error: {0}")]
    Config(String),

    /// Task or execution store failure (SQLite).
    #[error("store error: {0}")]
    Store(String),

    /// Dispatch queue failure.
    #[error("queue error: {0}")]
    Queue(String),

    /// Cron expression could not be parsed.
    #[error("schedule error: {0}")]
    Schedule(String),

    /// Engine subprocess failure (pre-flight, timeout, or nonzero exit).
    #[error("runner error: {0}")]
    Runner(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

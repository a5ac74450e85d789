use std::{path::PathBuf, time::Duration};

/// Core error type for the monitoring engine.
///
/// Adapter crates map their transport errors into this type so the engine can
/// decide uniformly between retrying, parking and reporting.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("config error: {0}")]
    Config(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid path: {path}: {reason}")]
    InvalidPath { path: PathBuf, reason: String },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("cannot resolve {reference}: {reason}")]
    Resolution { reference: String, reason: String },

    #[error("connection error: {0}")]
    Connection(String),

    #[error("session expired, re-login required: {0}")]
    AuthExpired(String),

    #[error("delivery error: {0}")]
    Delivery(String),

    #[error("rejected by destination: {0}")]
    Rejected(String),

    #[error("rate limited, retry after {0:?}")]
    RateLimited(Duration),

    #[error("no aggregator configured")]
    NoAggregator,
}

impl Error {
    /// Failures worth another attempt after a backoff delay.
    ///
    /// `RateLimited` is deliberately excluded: it carries its own wait and is
    /// not counted against the retry budget.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Connection(_) | Error::Delivery(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;

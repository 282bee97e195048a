use thiserror::Error;

use crate::horizon::TimeHorizon;

/// Failures raised by a backing store implementation.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("store serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("aggregator not initialised")]
    NotInitialised,
    #[error("aggregator already initialised")]
    AlreadyInitialised,
    #[error("aggregator already terminated")]
    AlreadyTerminated,
    #[error("checkpoint already in progress")]
    CheckpointInProgress,
    #[error("unsupported operation: {0}")]
    UnsupportedOperation(&'static str),
    #[error("invalid horizon range: {from} is coarser than {to}")]
    InvalidRange { from: TimeHorizon, to: TimeHorizon },
    #[error("invalid key: {0}")]
    InvalidKey(String),
    #[error("invalid granularity {0}: grouped width must be within 1..=59 minutes")]
    InvalidGranularity(u32),
    #[error("invalid config: {0}")]
    InvalidConfig(String),
    #[error("extract error: {0}")]
    Extract(String),
    #[error("{0} lock poisoned")]
    Poisoned(&'static str),
    #[error("checkpoint failed after {written} writes, {restored} deltas restored: {source}")]
    CheckpointFailed {
        written: usize,
        restored: usize,
        #[source]
        source: StoreError,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Whether the caller may retry the failed call without losing data.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::CheckpointFailed { .. } | Error::Store(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;

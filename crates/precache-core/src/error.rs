//! Error types for the offline caching layer.

use crate::lifecycle::{LifecycleEvent, WorkerState};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The network could not produce a response (connection refused, offline, reset).
    #[error("network error for {url}: {reason}")]
    Network { url: String, reason: String },

    /// A precache URL answered, but not with a 2xx status.
    #[error("precache of {url} returned status {status}")]
    BadStatus { url: String, status: u16 },

    /// The manifest is unusable (empty version, duplicate URLs).
    #[error("invalid manifest: {0}")]
    InvalidManifest(String),

    /// The cache store failed to read or write.
    #[error("cache store error: {0}")]
    Store(String),

    #[error("cache store I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt cache entry: {0}")]
    Corrupt(String),

    #[error("invalid lifecycle transition from {from:?} on {event:?}")]
    InvalidTransition {
        from: WorkerState,
        event: LifecycleEvent,
    },

    /// A lifecycle task panicked or was cancelled before finishing.
    #[error("lifecycle task aborted: {0}")]
    Aborted(String),

    /// A fetch was dispatched to a worker that is not controlling pages.
    #[error("worker for generation {generation} is {state:?}, not activated")]
    NotActive {
        generation: String,
        state: WorkerState,
    },
}

impl Error {
    pub fn network(url: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Error::Network {
            url: url.into(),
            reason: reason.to_string(),
        }
    }

    /// Whether this failure came from the network rather than the store or lifecycle.
    pub fn is_network(&self) -> bool {
        matches!(self, Error::Network { .. })
    }
}

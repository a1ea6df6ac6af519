//! Error types for the reconciliation core.

use thiserror::Error;

use crate::IndexKey;

/// Boxed error returned by handlers.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors raised by a keyed cache lookup.
#[derive(Debug, Clone, Error)]
pub enum CacheError {
    /// The cache could not serve the lookup right now.
    #[error("cache unavailable: {0}")]
    Unavailable(String),
}

/// Errors that can occur while running a controller.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// Resolving a key against the cache failed.
    #[error("fetching object with key {key} from store failed: {source}")]
    Cache {
        key: String,
        #[source]
        source: CacheError,
    },

    /// The handler returned an error.
    #[error("handler failed for {key}: {source}")]
    Handler {
        key: IndexKey,
        #[source]
        source: BoxError,
    },

    /// The stop signal fired before the cache reported synced.
    #[error("timed out waiting for caches to sync")]
    CacheSyncTimeout,

    /// The key failed more often than the retry ceiling allows.
    #[error("dropping {key} out of the queue after {attempts} retries: {source}")]
    RetriesExhausted {
        key: IndexKey,
        attempts: u32,
        #[source]
        source: Box<ControllerError>,
    },

    /// A worker task panicked.
    #[error("worker {worker_id} panicked")]
    WorkerPanicked { worker_id: usize },

    /// `run` was called on a controller that already ran.
    #[error("controller already started")]
    AlreadyStarted,
}

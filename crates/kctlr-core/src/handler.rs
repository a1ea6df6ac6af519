//! Contracts between the controller and its collaborators.

use async_trait::async_trait;
use tokio::sync::watch;

use crate::{BoxError, CacheError};

/// Business logic invoked with resolved objects.
///
/// Calls for different keys may run concurrently; calls for the same key
/// never do.
#[async_trait]
pub trait Handler<T>: Send + Sync {
    /// The object exists and no previous version was recorded.
    async fn create(&self, obj: T) -> Result<(), BoxError>;

    /// The object changed. `old` is `None` when the previous version is
    /// no longer in the cache.
    async fn update(&self, old: Option<T>, new: T) -> Result<(), BoxError>;

    /// The object is gone from the cache. `obj` holds the last known
    /// value when the cache still has one.
    async fn delete(&self, key: &str, obj: Option<T>) -> Result<(), BoxError>;
}

/// Read-only lookup into a local mirror of observed objects.
pub trait KeyedCache<T>: Send + Sync {
    /// Look up an object. `Ok(None)` means the object is absent.
    ///
    /// Must not block. Errors are treated as transient.
    fn get_by_key(&self, key: &str) -> Result<Option<T>, CacheError>;
}

/// The watch subsystem that keeps a [`KeyedCache`] in sync.
#[async_trait]
pub trait Informer: Send + Sync {
    /// Run until the stop signal fires.
    async fn run(&self, stop: watch::Receiver<bool>);

    /// Whether the initial listing has been fully applied.
    fn has_synced(&self) -> bool;
}

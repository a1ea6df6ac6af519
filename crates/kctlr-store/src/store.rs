//! In-memory object store.
//!
//! Holds the latest observed version of every object, keyed by
//! [`Keyed::key`]. Readers never block writers for long: each key lives in
//! its own `DashMap` shard entry and lookups clone the value out.

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use dashmap::DashMap;
use kctlr_core::{CacheError, Keyed, KeyedCache};
use tokio::sync::broadcast;
use tracing::trace;

use crate::StoreError;

/// Broadcast channel capacity for store events.
const BROADCAST_CHANNEL_CAPACITY: usize = 1024;

/// Synchronization state of the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SyncState {
    /// No listing has been applied yet.
    Disconnected = 0,
    /// The initial listing is being applied.
    Syncing = 1,
    /// The listing is applied and watch events are flowing.
    Live = 2,
}

impl From<u8> for SyncState {
    fn from(v: u8) -> Self {
        match v {
            1 => SyncState::Syncing,
            2 => SyncState::Live,
            _ => SyncState::Disconnected,
        }
    }
}

/// Change notification for store subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreEvent {
    /// An object was inserted or replaced.
    Upserted { key: String },
    /// An object was removed.
    Deleted { key: String },
    /// The whole contents were swapped for a fresh listing.
    Replaced { count: usize },
    /// The store became live.
    Synchronized,
}

/// Keyed store of the latest version of each object.
pub struct MemoryStore<T> {
    objects: DashMap<String, T>,
    state: AtomicU8,
    updates_tx: broadcast::Sender<StoreEvent>,
}

impl<T> MemoryStore<T>
where
    T: Keyed + Clone + Send + Sync + 'static,
{
    /// Create an empty, disconnected store.
    pub fn new() -> Arc<Self> {
        let (updates_tx, _) = broadcast::channel(BROADCAST_CHANNEL_CAPACITY);
        Arc::new(Self {
            objects: DashMap::new(),
            state: AtomicU8::new(SyncState::Disconnected as u8),
            updates_tx,
        })
    }

    /// Get the current sync state.
    pub fn state(&self) -> SyncState {
        SyncState::from(self.state.load(Ordering::SeqCst))
    }

    /// Set the sync state.
    pub fn set_state(&self, state: SyncState) {
        self.state.store(state as u8, Ordering::SeqCst);
        if state == SyncState::Live {
            self.broadcast(StoreEvent::Synchronized);
        }
    }

    /// Subscribe to store events.
    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.updates_tx.subscribe()
    }

    fn broadcast(&self, event: StoreEvent) {
        if self.updates_tx.send(event).is_err() {
            trace!("no subscribers for store event");
        }
    }

    /// Get a copy of an object.
    pub fn get(&self, key: &str) -> Option<T> {
        self.objects.get(key).map(|r| r.value().clone())
    }

    /// Copies of every object, in no particular order.
    pub fn list(&self) -> Vec<T> {
        self.objects.iter().map(|r| r.value().clone()).collect()
    }

    /// Keys of every object, sorted.
    pub fn list_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.objects.iter().map(|r| r.key().clone()).collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Insert or replace an object, returning the version it replaced.
    pub fn upsert(&self, obj: T) -> Result<Option<T>, StoreError> {
        let key = obj.key().ok_or(StoreError::MissingKey)?;
        let previous = self.objects.insert(key.clone(), obj);
        self.broadcast(StoreEvent::Upserted { key });
        Ok(previous)
    }

    /// Remove an object, returning it if it was present.
    pub fn delete(&self, key: &str) -> Option<T> {
        let removed = self.objects.remove(key).map(|(_, obj)| obj);
        if removed.is_some() {
            self.broadcast(StoreEvent::Deleted {
                key: key.to_string(),
            });
        }
        removed
    }

    /// Swap the whole contents for `objects`. Objects without a key are
    /// rejected before anything is changed.
    pub fn replace(&self, objects: Vec<T>) -> Result<(), StoreError> {
        let keyed = objects
            .into_iter()
            .map(|obj| obj.key().map(|key| (key, obj)).ok_or(StoreError::MissingKey))
            .collect::<Result<Vec<_>, _>>()?;

        self.objects.clear();
        let count = keyed.len();
        for (key, obj) in keyed {
            self.objects.insert(key, obj);
        }
        self.broadcast(StoreEvent::Replaced { count });
        Ok(())
    }
}

impl<T> KeyedCache<T> for MemoryStore<T>
where
    T: Keyed + Clone + Send + Sync + 'static,
{
    fn get_by_key(&self, key: &str) -> Result<Option<T>, CacheError> {
        if self.state() == SyncState::Disconnected {
            return Err(CacheError::Unavailable("store has not been populated".to_string()));
        }
        Ok(self.get(key))
    }
}

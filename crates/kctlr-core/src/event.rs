//! Translation of watch notifications into queued [`IndexKey`]s.

use tracing::{info, warn};

use crate::{IndexKey, WorkQueue};

/// An object that can be addressed in a keyed cache.
pub trait Keyed {
    /// Cache key of the object, or `None` if it has no usable identity.
    fn key(&self) -> Option<String>;
}

/// Build a `namespace/name` key, or a bare `name` for cluster-scoped objects.
pub fn namespace_key(namespace: Option<&str>, name: &str) -> String {
    match namespace {
        Some(ns) if !ns.is_empty() => format!("{ns}/{name}"),
        _ => name.to_string(),
    }
}

/// Payload of a delete notification.
#[derive(Debug, Clone, PartialEq)]
pub enum DeletedObject<T> {
    /// The final state of the deleted object.
    Final(T),
    /// The watch missed the deletion; only the cached key (and possibly a
    /// stale copy of the object) is known.
    FinalStateUnknown { key: String, last_known: Option<T> },
}

impl<T: Keyed> DeletedObject<T> {
    /// Key of the deleted object, falling back to the last cached key.
    pub fn key(&self) -> Option<String> {
        match self {
            DeletedObject::Final(obj) => obj.key(),
            DeletedObject::FinalStateUnknown { key, .. } => Some(key.clone()),
        }
    }

    /// The best known copy of the object.
    pub fn object(&self) -> Option<&T> {
        match self {
            DeletedObject::Final(obj) => Some(obj),
            DeletedObject::FinalStateUnknown { last_known, .. } => last_known.as_ref(),
        }
    }
}

/// Receives notifications from the watch subsystem.
pub trait ResourceEventHandler<T>: Send + Sync {
    fn on_add(&self, obj: &T);
    fn on_update(&self, old: &T, new: &T);
    fn on_delete(&self, obj: &DeletedObject<T>);
}

/// Event handler that enqueues an [`IndexKey`] per notification.
#[derive(Clone)]
pub struct QueueingEventHandler {
    queue: WorkQueue<IndexKey>,
    kind: String,
}

impl QueueingEventHandler {
    /// `kind` names the watched resource in log lines.
    pub fn new(queue: WorkQueue<IndexKey>, kind: impl Into<String>) -> Self {
        Self {
            queue,
            kind: kind.into(),
        }
    }
}

impl<T: Keyed> ResourceEventHandler<T> for QueueingEventHandler {
    fn on_add(&self, obj: &T) {
        let Some(key) = obj.key() else {
            warn!(kind = %self.kind, "skipping created object without a key");
            return;
        };
        info!(kind = %self.kind, key = %key, "processing create event");
        self.queue.add(IndexKey::create(key));
    }

    fn on_update(&self, old: &T, new: &T) {
        let (Some(old_key), Some(new_key)) = (old.key(), new.key()) else {
            warn!(kind = %self.kind, "skipping updated object without a key");
            return;
        };
        info!(kind = %self.kind, key = %new_key, "processing update event");
        self.queue.add(IndexKey::update(old_key, new_key));
    }

    fn on_delete(&self, obj: &DeletedObject<T>) {
        let Some(key) = obj.key() else {
            warn!(kind = %self.kind, "skipping deleted object without a key");
            return;
        };
        info!(kind = %self.kind, key = %key, "processing delete event");
        self.queue.add(IndexKey::delete(key));
    }
}

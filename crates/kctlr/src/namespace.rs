//! Watched namespace objects and their JSON input formats.

use std::collections::BTreeMap;

use kctlr_core::{DeletedObject, Keyed, namespace_key};
use kctlr_store::WatchEvent;
use serde::{Deserialize, Serialize};

/// A namespace as seen by the watch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Namespace {
    pub name: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}

impl Namespace {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            labels: BTreeMap::new(),
        }
    }
}

impl Keyed for Namespace {
    fn key(&self) -> Option<String> {
        if self.name.is_empty() {
            return None;
        }
        // Namespaces are cluster-scoped.
        Some(namespace_key(None, &self.name))
    }
}

/// One line of the watch event stream.
///
/// ```json
/// {"type":"added","object":{"name":"dev"}}
/// {"type":"deleted","key":"dev"}
/// ```
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventLine {
    Added {
        object: Namespace,
    },
    Modified {
        object: Namespace,
    },
    /// Either the final object or only its key is known.
    Deleted {
        #[serde(default)]
        object: Option<Namespace>,
        #[serde(default)]
        key: Option<String>,
    },
}

impl EventLine {
    /// Convert into a watch event, or `None` for a delete that names nothing.
    pub fn into_watch_event(self) -> Option<WatchEvent<Namespace>> {
        match self {
            EventLine::Added { object } => Some(WatchEvent::Added(object)),
            EventLine::Modified { object } => Some(WatchEvent::Modified(object)),
            EventLine::Deleted {
                object: Some(object),
                ..
            } => Some(WatchEvent::Deleted(DeletedObject::Final(object))),
            EventLine::Deleted {
                object: None,
                key: Some(key),
            } => Some(WatchEvent::Deleted(DeletedObject::FinalStateUnknown {
                key,
                last_known: None,
            })),
            EventLine::Deleted {
                object: None,
                key: None,
            } => None,
        }
    }
}

//! Work queue payload carrying one or two object keys.

use std::fmt;

use serde::{Deserialize, Serialize};

/// One unit of reconciliation work.
///
/// Create and delete notifications carry only `new`. Updates also carry
/// `old` so the worker can fetch both versions of the object. Two keys are
/// the same logical work item when their encoded forms are identical, which
/// is exactly structural equality.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IndexKey {
    /// Key of the object before the update.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old: Option<String>,
    /// Key of the current object.
    pub new: String,
}

impl IndexKey {
    /// Key for a create notification.
    pub fn create(key: impl Into<String>) -> Self {
        Self {
            old: None,
            new: key.into(),
        }
    }

    /// Key for an update notification.
    pub fn update(old: impl Into<String>, new: impl Into<String>) -> Self {
        Self {
            old: Some(old.into()),
            new: new.into(),
        }
    }

    /// Key for a delete notification.
    pub fn delete(key: impl Into<String>) -> Self {
        Self::create(key)
    }

    /// Encode as `{"old":"..","new":".."}`, omitting `old` when absent.
    pub fn encode(&self) -> String {
        // Two string fields cannot fail to serialize.
        serde_json::to_string(self).unwrap_or_else(|_| self.new.clone())
    }

    /// Decode an encoded key. `decode(&key.encode())` yields `key` again.
    ///
    /// Anything that is not a JSON object is taken as a bare create/delete key.
    pub fn decode(s: &str) -> Result<Self, serde_json::Error> {
        if s.trim_start().starts_with('{') {
            serde_json::from_str(s)
        } else {
            Ok(Self::create(s))
        }
    }
}

impl fmt::Display for IndexKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

impl From<&str> for IndexKey {
    fn from(key: &str) -> Self {
        Self::create(key)
    }
}

impl From<String> for IndexKey {
    fn from(key: String) -> Self {
        Self::create(key)
    }
}

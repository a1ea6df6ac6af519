//! Local object mirror for kctlr controllers.
//!
//! [`MemoryStore`] keeps the latest observed version of each object and
//! implements [`kctlr_core::KeyedCache`]. [`SharedInformer`] fills the store
//! from an initial listing, then applies [`WatchEvent`]s from a channel and
//! fans them out to registered [`kctlr_core::ResourceEventHandler`]s.

mod error;
mod informer;
mod store;

pub use error::StoreError;
pub use informer::{SharedInformer, WatchEvent};
pub use store::{MemoryStore, StoreEvent, SyncState};

//! Reconciliation core for kctlr.
//!
//! This crate provides a level-triggered controller that:
//! - Translates watch notifications into deduplicated [`IndexKey`]s
//! - Drains them through a rate-limited [`WorkQueue`] with a worker pool
//! - Resolves keys against a [`KeyedCache`] and dispatches to a [`Handler`]
//! - Retries failures with per-key backoff, then drops and reports them
//!
//! [`IndexKey::encode`] and [`IndexKey::decode`] are public so keys can be
//! logged or persisted outside the queue and parsed back into the same key.

pub mod config;
pub mod controller;
mod error;
pub mod event;
mod handler;
mod index_key;
pub mod queue;
pub mod report;

pub use config::ControllerConfig;
pub use controller::{Controller, ControllerState};
pub use error::{BoxError, CacheError, ControllerError};
pub use event::{DeletedObject, Keyed, QueueingEventHandler, ResourceEventHandler, namespace_key};
pub use handler::{Handler, Informer, KeyedCache};
pub use index_key::IndexKey;
pub use queue::WorkQueue;
pub use queue::rate_limit::{
    BucketRateLimiter, ItemExponentialRateLimiter, MaxOfRateLimiter, RateLimiter,
    default_controller_rate_limiter,
};
pub use report::{ErrorSink, RecordingErrorSink, TracingErrorSink};

//! Sink for failures the controller gives up on.
//!
//! Per-attempt failures are logged where they happen. Terminal conditions
//! (a key dropped after exhausting its retries, a sync timeout, a crashed
//! worker) go through an [`ErrorSink`] so operators can tell "retrying"
//! apart from "gave up".

use std::sync::{Mutex, PoisonError};

use crate::ControllerError;

/// Tracing target used by [`TracingErrorSink`].
pub const RUNTIME_TARGET: &str = "kctlr::runtime";

/// Receives terminal controller failures.
pub trait ErrorSink: Send + Sync {
    fn report(&self, err: &ControllerError);
}

/// Default sink: logs at error level on the `kctlr::runtime` target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingErrorSink;

impl ErrorSink for TracingErrorSink {
    fn report(&self, err: &ControllerError) {
        tracing::error!(target: RUNTIME_TARGET, error = %err, "unhandled error");
    }
}

/// Sink that keeps the rendered messages, for inspection.
#[derive(Debug, Default)]
pub struct RecordingErrorSink {
    reports: Mutex<Vec<String>>,
}

impl RecordingErrorSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Messages reported so far.
    pub fn reports(&self) -> Vec<String> {
        self.reports
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl ErrorSink for RecordingErrorSink {
    fn report(&self, err: &ControllerError) {
        self.reports
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(err.to_string());
    }
}

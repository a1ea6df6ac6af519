use thiserror::Error;

/// Errors that can occur when writing to a store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("object has no key")]
    MissingKey,
}

use campfire_core::ErrorKind;
use thiserror::Error;

use crate::storage::StoreError;

/// Failures an intent can surface to its caller. Transport-layer failures
/// never appear here; they are absorbed by the registry and delivery
/// pipeline and compensated by the sync loop.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("room or member not found")]
    NotFound,
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("invalid attribute: {0}")]
    InvalidAttribute(String),
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::NotFound => ErrorKind::NotFound,
            EngineError::Store(_) => ErrorKind::StoreUnavailable,
            EngineError::InvalidAttribute(_) => ErrorKind::InvalidAttribute,
        }
    }

    pub fn metric_label(&self) -> &'static str {
        match self {
            EngineError::NotFound => "not_found",
            EngineError::Store(_) => "store_unavailable",
            EngineError::InvalidAttribute(_) => "invalid_attribute",
        }
    }
}

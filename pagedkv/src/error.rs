//! Error types for pagedkv

use thiserror::Error;

use crate::slot_allocator::RequestId;

/// Result type alias using pagedkv's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for cache and attention operations
#[derive(Error, Debug)]
pub enum Error {
    #[error("Out of cache capacity: requested {requested} slots, {available} free")]
    OutOfCacheCapacity { requested: usize, available: usize },

    #[error("Empty attention window for request {request_id}")]
    EmptyAttentionWindow { request_id: RequestId },

    #[error("Shape mismatch: expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        got: Vec<usize>,
    },

    #[error("Invalid shape: {0}")]
    InvalidShape(String),

    #[error("Slot {slot} is not owned by request {request_id} (owner: {owner:?})")]
    SlotOwnershipViolation {
        slot: usize,
        request_id: RequestId,
        owner: Option<RequestId>,
    },

    #[error("Unknown request: {0}")]
    UnknownRequest(RequestId),

    #[error("Request already admitted: {0}")]
    DuplicateRequest(RequestId),

    #[error("Unsupported dtype: {0}")]
    UnsupportedDtype(String),

    #[error("Invalid config: {0}")]
    InvalidConfig(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Whether the scheduler can recover by evicting or deferring requests.
    ///
    /// Everything else is a contract violation or corrupted state and must
    /// abort the batch.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::OutOfCacheCapacity { .. })
    }
}

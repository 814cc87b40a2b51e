use thiserror::Error;

use super::elem::CodecError;

/// Failure of the backing list store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("index {index} out of range for list {key:?}")]
    IndexOutOfRange { key: String, index: usize },

    #[error("store corruption: {0}")]
    Corruption(String),
}

#[derive(Debug, Error)]
pub enum QueueError {
    /// The queue was closed; the reader should stop polling.
    #[error("queue is closed")]
    Closed,

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("corrupted queue element: {0}")]
    Codec(#[from] CodecError),
}

pub type QueueResult<T> = Result<T, QueueError>;

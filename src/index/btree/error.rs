use thiserror::Error;
use crate::storage::buffer::BufferPoolError;
use crate::storage::page::PageError;

#[derive(Error, Debug)]
pub enum BTreeError {
    #[error("Index {0} not found")]
    IndexNotFound(String),

    #[error("Node too large for page")]
    NodeTooLarge,

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Deserialization error: {0}")]
    DeserializationError(String),

    #[error("Invalid page format")]
    InvalidPageFormat,

    #[error("Buffer pool error: {0}")]
    BufferPoolError(#[from] BufferPoolError),

    #[error("Header page error: {0}")]
    HeaderError(#[from] PageError),
}

//! Error types for the store

use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("storage unavailable: {0}")]
    Unavailable(String),

    #[error("audit append conflict: expected seq {expected}, tail is {tail}")]
    AppendConflict { expected: u64, tail: u64 },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, StoreError>;

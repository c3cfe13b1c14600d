//! Error types for log operations.

use crate::hash::Hash;
use crate::heads_cache::CacheError;
use crate::store::StoreError;
use thiserror::Error;
use weft_core::ClockError;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LogError {
    #[error("Append references entries not in the log: {0:?}")]
    MissingNext(Vec<Hash>),

    #[error("Entry failed verification: {0}")]
    InvalidEntry(Hash),

    #[error("Log is closed")]
    Closed,

    #[error(transparent)]
    Clock(#[from] ClockError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for LogError {
    fn from(err: serde_json::Error) -> Self {
        LogError::Serialization(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, LogError>;

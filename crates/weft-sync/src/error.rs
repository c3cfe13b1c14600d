//! Error types for sync operations.

use crate::message::CodecError;
use crate::network::NetworkError;
use thiserror::Error;
use weft_log::LogError;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    #[error("Syncronizer is closed")]
    Closed,

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Network(#[from] NetworkError),

    #[error(transparent)]
    Log(#[from] LogError),
}

pub type Result<T> = std::result::Result<T, SyncError>;

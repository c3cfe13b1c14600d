//! # weft-sync
//!
//! Peer-to-peer replication for [`weft_log::Log`].
//!
//! Peers tell each other which entries they may be missing and pull what
//! they lack. The [`Syncronizer`] deduplicates those pulls: each missing
//! entry is requested from one peer at a time, with later announcers kept
//! as fallbacks and stale requests expiring on a timer.
//!
//! The SDK is organized into:
//!
//! - [`message`] - Wire messages and the tag-dispatched codec
//! - [`network`] - Transport abstraction and an in-memory transport
//! - [`syncronizer`] - Request deduplication and the resync loop
//! - [`source`] - The log-side interface the syncronizer drives
//! - [`config`] - Sync tuning knobs
//! - [`error`] - Error types

pub mod config;
pub mod error;
pub mod exchange;
pub mod message;
pub mod network;
pub mod source;
pub mod syncronizer;

pub use config::{SyncConfig, SyncConfigBuilder};
pub use error::{Result, SyncError};
pub use exchange::{create_exchange_heads, exchange_heads_messages};
pub use message::{
    CodecError, Decoder, ExchangeHeads, MessageRegistry, RequestMaybeSync,
    RequestMaybeSyncCoordinate, ResponseMaybeSync, SyncMessage,
};
pub use network::{
    create_network, DeliveryMode, Envelope, MemoryTransport, NetworkError, PeerId, SendOptions,
    Transport,
};
pub use source::EntrySource;
pub use syncronizer::{SyncKey, Syncronizer};

//! Sync wire messages.
//!
//! Every message is one byte of type tag followed by the JSON encoding of
//! the variant's body. Decoding dispatches on the tag through a
//! [`MessageRegistry`], which callers own and may restrict or extend.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;
use weft_log::{EntryWithRefs, Hash};

pub const TAG_REQUEST_MAYBE_SYNC: u8 = 0;
pub const TAG_RESPONSE_MAYBE_SYNC: u8 = 1;
pub const TAG_REQUEST_MAYBE_SYNC_COORDINATE: u8 = 2;
pub const TAG_EXCHANGE_HEADS: u8 = 3;

/// "You may want these."
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestMaybeSync {
    pub hashes: Vec<Hash>,
}

/// "Please send me these."
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseMaybeSync {
    pub hashes: Vec<Hash>,
}

/// "Please send me the entries at these coordinates."
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestMaybeSyncCoordinate {
    pub hash_numbers: Vec<u64>,
}

/// Entries with the ancestors the receiver may lack.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExchangeHeads {
    pub heads: Vec<EntryWithRefs>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SyncMessage {
    RequestMaybeSync(RequestMaybeSync),
    ResponseMaybeSync(ResponseMaybeSync),
    RequestMaybeSyncCoordinate(RequestMaybeSyncCoordinate),
    ExchangeHeads(ExchangeHeads),
}

impl SyncMessage {
    pub fn tag(&self) -> u8 {
        match self {
            SyncMessage::RequestMaybeSync(_) => TAG_REQUEST_MAYBE_SYNC,
            SyncMessage::ResponseMaybeSync(_) => TAG_RESPONSE_MAYBE_SYNC,
            SyncMessage::RequestMaybeSyncCoordinate(_) => TAG_REQUEST_MAYBE_SYNC_COORDINATE,
            SyncMessage::ExchangeHeads(_) => TAG_EXCHANGE_HEADS,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            SyncMessage::RequestMaybeSync(_) => "RequestMaybeSync",
            SyncMessage::ResponseMaybeSync(_) => "ResponseMaybeSync",
            SyncMessage::RequestMaybeSyncCoordinate(_) => "RequestMaybeSyncCoordinate",
            SyncMessage::ExchangeHeads(_) => "ExchangeHeads",
        }
    }

    fn encode_body(&self) -> serde_json::Result<Vec<u8>> {
        match self {
            SyncMessage::RequestMaybeSync(m) => serde_json::to_vec(m),
            SyncMessage::ResponseMaybeSync(m) => serde_json::to_vec(m),
            SyncMessage::RequestMaybeSyncCoordinate(m) => serde_json::to_vec(m),
            SyncMessage::ExchangeHeads(m) => serde_json::to_vec(m),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("Empty message")]
    Empty,

    #[error("Unknown message tag: {0}")]
    UnknownTag(u8),

    #[error("Malformed message body for tag {tag}: {reason}")]
    Malformed { tag: u8, reason: String },

    #[error("Failed to encode message: {0}")]
    Encode(String),
}

/// Decodes a message body for one tag.
pub type Decoder = fn(&[u8]) -> Result<SyncMessage, CodecError>;

fn decode_body<T: DeserializeOwned>(tag: u8, body: &[u8]) -> Result<T, CodecError> {
    serde_json::from_slice(body).map_err(|e| CodecError::Malformed {
        tag,
        reason: e.to_string(),
    })
}

/// Tag-to-decoder table used by the codec.
#[derive(Clone)]
pub struct MessageRegistry {
    decoders: HashMap<u8, Decoder>,
}

impl MessageRegistry {
    /// A registry that decodes nothing.
    pub fn empty() -> Self {
        MessageRegistry {
            decoders: HashMap::new(),
        }
    }

    /// A registry with every sync message registered.
    pub fn standard() -> Self {
        let mut registry = Self::empty();
        registry.register(TAG_REQUEST_MAYBE_SYNC, |b| {
            decode_body(TAG_REQUEST_MAYBE_SYNC, b).map(SyncMessage::RequestMaybeSync)
        });
        registry.register(TAG_RESPONSE_MAYBE_SYNC, |b| {
            decode_body(TAG_RESPONSE_MAYBE_SYNC, b).map(SyncMessage::ResponseMaybeSync)
        });
        registry.register(TAG_REQUEST_MAYBE_SYNC_COORDINATE, |b| {
            decode_body(TAG_REQUEST_MAYBE_SYNC_COORDINATE, b)
                .map(SyncMessage::RequestMaybeSyncCoordinate)
        });
        registry.register(TAG_EXCHANGE_HEADS, |b| {
            decode_body(TAG_EXCHANGE_HEADS, b).map(SyncMessage::ExchangeHeads)
        });
        registry
    }

    /// Install a decoder, returning the one it replaces.
    pub fn register(&mut self, tag: u8, decoder: Decoder) -> Option<Decoder> {
        self.decoders.insert(tag, decoder)
    }

    pub fn unregister(&mut self, tag: u8) -> Option<Decoder> {
        self.decoders.remove(&tag)
    }

    pub fn contains(&self, tag: u8) -> bool {
        self.decoders.contains_key(&tag)
    }

    pub fn encode(&self, message: &SyncMessage) -> Result<Vec<u8>, CodecError> {
        let body = message
            .encode_body()
            .map_err(|e| CodecError::Encode(e.to_string()))?;
        let mut bytes = Vec::with_capacity(body.len() + 1);
        bytes.push(message.tag());
        bytes.extend_from_slice(&body);
        Ok(bytes)
    }

    pub fn decode(&self, bytes: &[u8]) -> Result<SyncMessage, CodecError> {
        let (&tag, body) = bytes.split_first().ok_or(CodecError::Empty)?;
        let decoder = self.decoders.get(&tag).ok_or(CodecError::UnknownTag(tag))?;
        decoder(body)
    }
}

impl std::fmt::Debug for MessageRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut tags: Vec<u8> = self.decoders.keys().copied().collect();
        tags.sort_unstable();
        f.debug_struct("MessageRegistry").field("tags", &tags).finish()
    }
}

impl Default for MessageRegistry {
    fn default() -> Self {
        Self::standard()
    }
}

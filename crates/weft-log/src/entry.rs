//! Log entries and their builder.
//!
//! An entry is an immutable DAG node carrying:
//! - an opaque payload
//! - a hybrid logical clock timestamp
//! - a group id (`gid`) naming the causal branch it belongs to
//! - the hashes of its causal predecessors (`next`)
//! - one or more ed25519 signatures over the fields above
//!
//! The entry hash is the SHA-256 of its canonical block encoding, which
//! includes the signatures. Changing any field changes the hash, and a
//! decoded entry always recomputes its hash from its fields.

use crate::error::{LogError, Result};
use crate::hash::{Hash, Hasher};
use crate::identity::{Identity, PublicKey};
use serde::{Deserialize, Serialize};
use weft_core::Timestamp;

/// Identifier of a causal branch.
pub type GroupId = String;

/// Fresh, lexicographically time-ordered group id.
pub fn new_gid() -> GroupId {
    ulid::Ulid::new().to_string()
}

/// A signature over an entry's signable content.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntrySignature {
    pub public_key: PublicKey,
    pub signature: Vec<u8>,
}

/// Canonical encoding; the bytes stored in the block store.
#[derive(Clone, Serialize, Deserialize)]
struct EntryBlock {
    clock: Timestamp,
    gid: GroupId,
    next: Vec<Hash>,
    payload: Vec<u8>,
    signatures: Vec<EntrySignature>,
}

#[derive(Serialize)]
struct SignableContent<'a> {
    clock: &'a Timestamp,
    gid: &'a str,
    next: &'a [Hash],
    payload: &'a [u8],
}

/// An immutable, hash-identified log entry.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(try_from = "EntryBlock", into = "EntryBlock")]
pub struct Entry {
    hash: Hash,
    clock: Timestamp,
    gid: GroupId,
    next: Vec<Hash>,
    payload: Vec<u8>,
    signatures: Vec<EntrySignature>,
}

impl Entry {
    pub fn hash(&self) -> Hash {
        self.hash
    }

    pub fn clock(&self) -> Timestamp {
        self.clock
    }

    pub fn gid(&self) -> &str {
        &self.gid
    }

    /// Causal predecessors, sorted and deduplicated.
    pub fn next(&self) -> &[Hash] {
        &self.next
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn signatures(&self) -> &[EntrySignature] {
        &self.signatures
    }

    /// Compact numeric coordinate of the hash.
    pub fn coordinate(&self) -> u64 {
        self.hash.coordinate()
    }

    pub fn is_signed_by(&self, key: &PublicKey) -> bool {
        self.signatures.iter().any(|s| &s.public_key == key)
    }

    /// Canonical block bytes, as written to the block store.
    pub fn to_block_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decode a block; the hash is recomputed from the decoded fields.
    pub fn from_block_bytes(bytes: &[u8]) -> Result<Entry> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// Check the hash against the fields and every signature against the
    /// signable content. Unsigned entries do not verify, nor do entries
    /// whose `next` is not strictly sorted.
    pub fn verify(&self) -> bool {
        if self.signatures.is_empty() || !self.next.windows(2).all(|w| w[0] < w[1]) {
            return false;
        }
        let Ok(digest) = signable_digest(&self.clock, &self.gid, &self.next, &self.payload) else {
            return false;
        };
        let signatures_ok = self
            .signatures
            .iter()
            .all(|s| s.public_key.verify(digest.as_bytes(), &s.signature));
        signatures_ok && compute_hash(&EntryBlock::from(self.clone())).ok() == Some(self.hash)
    }
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash
    }
}

impl Eq for Entry {}

impl From<Entry> for EntryBlock {
    fn from(entry: Entry) -> Self {
        EntryBlock {
            clock: entry.clock,
            gid: entry.gid,
            next: entry.next,
            payload: entry.payload,
            signatures: entry.signatures,
        }
    }
}

impl TryFrom<EntryBlock> for Entry {
    type Error = LogError;

    fn try_from(block: EntryBlock) -> Result<Self> {
        let hash = compute_hash(&block)?;
        Ok(Entry {
            hash,
            clock: block.clock,
            gid: block.gid,
            next: block.next,
            payload: block.payload,
            signatures: block.signatures,
        })
    }
}

fn compute_hash(block: &EntryBlock) -> Result<Hash> {
    Ok(Hasher::hash(&serde_json::to_vec(block)?))
}

fn signable_digest(clock: &Timestamp, gid: &str, next: &[Hash], payload: &[u8]) -> Result<Hash> {
    let content = SignableContent {
        clock,
        gid,
        next,
        payload,
    };
    Ok(Hasher::hash(&serde_json::to_vec(&content)?))
}

/// Builder for signed entries.
#[derive(Clone, Debug, Default)]
pub struct EntryBuilder {
    payload: Vec<u8>,
    clock: Timestamp,
    gid: Option<GroupId>,
    next: Vec<Hash>,
}

impl EntryBuilder {
    pub fn new(payload: impl Into<Vec<u8>>) -> Self {
        EntryBuilder {
            payload: payload.into(),
            ..Default::default()
        }
    }

    pub fn with_clock(mut self, clock: Timestamp) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_gid(mut self, gid: impl Into<GroupId>) -> Self {
        self.gid = Some(gid.into());
        self
    }

    pub fn with_next(mut self, next: Vec<Hash>) -> Self {
        self.next = next;
        self
    }

    /// Sign with every identity given and compute the hash. Without an
    /// explicit gid a fresh one is generated.
    pub fn sign(mut self, signers: &[&Identity]) -> Result<Entry> {
        self.next.sort();
        self.next.dedup();
        self.sign_as_is(signers)
    }

    /// Sign without normalizing `next`.
    #[cfg(test)]
    pub(crate) fn sign_verbatim(self, signers: &[&Identity]) -> Result<Entry> {
        self.sign_as_is(signers)
    }

    fn sign_as_is(self, signers: &[&Identity]) -> Result<Entry> {
        let next = self.next;
        let gid = self.gid.unwrap_or_else(new_gid);

        let digest = signable_digest(&self.clock, &gid, &next, &self.payload)?;
        let signatures = signers
            .iter()
            .map(|identity| EntrySignature {
                public_key: identity.public_key(),
                signature: identity.sign(digest.as_bytes()),
            })
            .collect();

        Entry::try_from(EntryBlock {
            clock: self.clock,
            gid,
            next,
            payload: self.payload,
            signatures,
        })
    }
}

/// An entry shipped together with ancestors the receiver may lack.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryWithRefs {
    pub entry: Entry,
    pub refs: Vec<Entry>,
}

impl EntryWithRefs {
    /// Ancestors first, then the entry itself.
    pub fn into_entries(self) -> impl Iterator<Item = Entry> {
        self.refs.into_iter().chain(std::iter::once(self.entry))
    }
}

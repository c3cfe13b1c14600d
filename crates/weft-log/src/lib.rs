//! # weft-log
//!
//! The replicated log at the heart of Weft.
//!
//! Peers append signed entries to a shared log independently. Entries are
//! content-addressed DAG nodes linking to their causal predecessors, so two
//! replicas merge by set union and agree on heads and on iteration order
//! without coordination.
//!
//! This crate provides:
//! - [`Entry`] and [`EntryBuilder`]: signed, hash-identified DAG nodes
//! - [`EntryGraph`]: the in-memory arena with incremental head tracking
//! - [`EntryIndex`]: hash/coordinate/gid metadata for the sync layer
//! - [`HeadsCache`]: durable heads as chained pages with compaction
//! - [`Log`]: append, join, remove and ordered iteration over all of it
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//! use weft_log::{AppendOptions, Identity, Log, LogOptions, MemoryStore};
//!
//! # tokio_test_block_on(async {
//! let store = MemoryStore::new();
//! let log = Log::open(
//!     "notes",
//!     Arc::new(store.clone()),
//!     Arc::new(store),
//!     Identity::generate(),
//!     LogOptions::default(),
//! )
//! .await
//! .unwrap();
//!
//! let first = log.append(b"hello".to_vec(), AppendOptions::default()).await.unwrap();
//! let second = log.append(b"world".to_vec(), AppendOptions::default()).await.unwrap();
//!
//! assert_eq!(second.next(), &[first.hash()]);
//! assert_eq!(log.heads(), vec![second.hash()]);
//! # });
//! # fn tokio_test_block_on<F: std::future::Future>(f: F) -> F::Output {
//! #     tokio::runtime::Builder::new_current_thread().build().unwrap().block_on(f)
//! # }
//! ```

mod entry;
mod error;
mod graph;
mod hash;
mod heads_cache;
mod identity;
mod index;
mod log;
mod store;

pub use entry::{new_gid, Entry, EntryBuilder, EntrySignature, EntryWithRefs, GroupId};
pub use error::{LogError, Result};
pub use graph::{EntryGraph, HeadsDelta};
pub use hash::{Hash, Hasher};
pub use heads_cache::{CacheError, CacheStats, HeadsCache, HeadsPage};
pub use identity::{Identity, PublicKey};
pub use index::{EntryIndex, EntryReplicated, IndexQuery};
pub use log::{AppendOptions, Log, LogEvent, LogOptions, TrimPolicy};
pub use store::{BlockStore, KeyValueStore, MemoryStore, StoreError};

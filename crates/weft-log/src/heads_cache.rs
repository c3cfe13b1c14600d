//! Durable record of a log's heads.
//!
//! The cache keeps two chains of pages in the block store: one of added
//! heads and one of removed heads. Each page lists the hashes of a flush and
//! links to the previous page, and the newest page of each chain is named
//! by a pointer record in the key-value store. The live heads are the union
//! of the added chain minus the union of the removed chain.
//!
//! Flushing appends at most one page per chain, so persisting a mutation
//! costs O(delta). When the removed chain grows at least as long as the live
//! portion of the added chain, the cache resets: it writes one page holding
//! the live heads and drops the removed pointer. Old pages are left in the
//! block store unreferenced.

use crate::graph::HeadsDelta;
use crate::hash::Hash;
use crate::store::{BlockStore, KeyValueStore, StoreError};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, trace};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
    #[error("Corrupted heads page {page}: {reason}")]
    Corrupted { page: Hash, reason: String },

    #[error("Corrupted heads pointer at {path}: {reason}")]
    CorruptedPointer { path: String, reason: String },

    #[error("Heads page not found: {0}")]
    MissingPage(Hash),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// One page of a chain.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeadsPage {
    pub heads: Vec<Hash>,
    /// The older page this one extends.
    pub last: Option<Hash>,
}

/// Counters for inspection.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub head_pages: usize,
    pub removed_pages: usize,
    /// Hashes recorded in the added chain.
    pub added: usize,
    /// Hashes recorded in the removed chain.
    pub removed: usize,
    pub resets: u64,
    /// Queued changes not yet flushed.
    pub pending: usize,
}

struct Chain {
    pages: usize,
    hashes: Vec<Hash>,
}

pub struct HeadsCache {
    blocks: Arc<dyn BlockStore>,
    values: Arc<dyn KeyValueStore>,
    heads_path: String,
    removed_path: String,
    current: Option<Hash>,
    removed_current: Option<Hash>,
    head_pages: usize,
    removed_pages: usize,
    added: usize,
    removed: usize,
    removed_set: HashSet<Hash>,
    pending_added: BTreeSet<Hash>,
    pending_removed: BTreeSet<Hash>,
    batch_size: usize,
    resets: u64,
    /// Set while a reset has not yet completed.
    reset_pending: bool,
}

impl HeadsCache {
    /// A cache for the log named `log_id`. Call [`load`](Self::load) before
    /// queueing changes when the stores may already hold a chain.
    pub fn new(
        blocks: Arc<dyn BlockStore>,
        values: Arc<dyn KeyValueStore>,
        log_id: &str,
        batch_size: usize,
    ) -> Self {
        HeadsCache {
            blocks,
            values,
            heads_path: format!("{log_id}/heads"),
            removed_path: format!("{log_id}/heads/removed"),
            current: None,
            removed_current: None,
            head_pages: 0,
            removed_pages: 0,
            added: 0,
            removed: 0,
            removed_set: HashSet::new(),
            pending_added: BTreeSet::new(),
            pending_removed: BTreeSet::new(),
            batch_size: batch_size.max(1),
            resets: 0,
            reset_pending: false,
        }
    }

    /// Record a head change. Nothing is written until the next flush.
    pub fn queue(&mut self, delta: &HeadsDelta) {
        for hash in &delta.added {
            if !self.pending_removed.remove(hash) {
                self.pending_added.insert(*hash);
            }
        }
        for hash in &delta.removed {
            if !self.pending_added.remove(hash) {
                self.pending_removed.insert(*hash);
            }
        }
    }

    pub fn pending(&self) -> usize {
        self.pending_added.len() + self.pending_removed.len()
    }

    /// Whether enough changes are queued to warrant a flush.
    pub fn is_due(&self) -> bool {
        self.reset_pending || self.pending() >= self.batch_size
    }

    /// Persist queued changes. `live` must be the log's current heads; it is
    /// only read when the flush turns into a reset. Changes stay queued
    /// until the pages holding them and their pointer are written, so a
    /// failed flush can be retried.
    pub async fn flush(&mut self, live: &[Hash]) -> Result<(), CacheError> {
        if self.pending() == 0 && !self.reset_pending {
            return Ok(());
        }

        let added = self.added + self.pending_added.len();
        let removed = self.removed + self.pending_removed.len();
        let readded = self
            .pending_added
            .iter()
            .any(|h| self.removed_set.contains(h));

        if self.reset_pending
            || readded
            || (removed > 0 && removed >= added.saturating_sub(removed))
        {
            return self.reset(live).await;
        }

        if !self.pending_added.is_empty() {
            let heads: Vec<Hash> = self.pending_added.iter().copied().collect();
            let count = heads.len();
            let page = self.write_page(heads, self.current).await?;
            self.write_pointer(&self.heads_path, page).await?;
            self.pending_added.clear();
            self.current = Some(page);
            self.head_pages += 1;
            self.added += count;
        }

        if !self.pending_removed.is_empty() {
            let heads: Vec<Hash> = self.pending_removed.iter().copied().collect();
            let page = self.write_page(heads.clone(), self.removed_current).await?;
            self.write_pointer(&self.removed_path, page).await?;
            self.pending_removed.clear();
            self.removed += heads.len();
            self.removed_set.extend(heads);
            self.removed_current = Some(page);
            self.removed_pages += 1;
        }

        trace!(
            head_pages = self.head_pages,
            removed_pages = self.removed_pages,
            "heads cache flushed"
        );
        Ok(())
    }

    /// Rewrite the cache as a single page holding `live`. If any write
    /// fails, the queued changes are kept and the next flush resets again.
    pub async fn reset(&mut self, live: &[Hash]) -> Result<(), CacheError> {
        self.reset_pending = true;
        let current = self.rewrite(live).await?;

        self.reset_pending = false;
        self.pending_added.clear();
        self.pending_removed.clear();
        self.current = current;
        self.head_pages = usize::from(current.is_some());
        self.removed_current = None;
        self.removed_pages = 0;
        self.added = live.len();
        self.removed = 0;
        self.removed_set.clear();
        self.resets += 1;

        debug!(heads = live.len(), resets = self.resets, "heads cache reset");
        Ok(())
    }

    async fn rewrite(&self, live: &[Hash]) -> Result<Option<Hash>, CacheError> {
        let current = if live.is_empty() {
            self.values.delete(&self.heads_path).await?;
            None
        } else {
            let page = self.write_page(live.to_vec(), None).await?;
            self.write_pointer(&self.heads_path, page).await?;
            Some(page)
        };
        self.values.delete(&self.removed_path).await?;
        Ok(current)
    }

    /// Rebuild in-memory state from the persisted chains and return the live
    /// heads. Any unreadable page or pointer fails the load.
    pub async fn load(&mut self) -> Result<Vec<Hash>, CacheError> {
        let current = self.read_pointer(&self.heads_path).await?;
        let removed_current = self.read_pointer(&self.removed_path).await?;
        let heads = self.walk(current).await?;
        let removed = self.walk(removed_current).await?;

        self.current = current;
        self.removed_current = removed_current;
        self.head_pages = heads.pages;
        self.removed_pages = removed.pages;
        self.added = heads.hashes.len();
        self.removed = removed.hashes.len();
        self.removed_set = removed.hashes.into_iter().collect();
        self.pending_added.clear();
        self.pending_removed.clear();
        self.reset_pending = false;

        let live = live_heads(heads.hashes, &self.removed_set);
        debug!(
            heads = live.len(),
            head_pages = self.head_pages,
            removed_pages = self.removed_pages,
            "heads cache loaded"
        );
        Ok(live)
    }

    /// The live heads as currently persisted, sorted.
    pub async fn get_cached_heads(&self) -> Result<Vec<Hash>, CacheError> {
        let heads = self.walk(self.read_pointer(&self.heads_path).await?).await?;
        let removed = self
            .walk(self.read_pointer(&self.removed_path).await?)
            .await?;
        let removed: HashSet<Hash> = removed.hashes.into_iter().collect();
        Ok(live_heads(heads.hashes, &removed))
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            head_pages: self.head_pages,
            removed_pages: self.removed_pages,
            added: self.added,
            removed: self.removed,
            resets: self.resets,
            pending: self.pending(),
        }
    }

    async fn walk(&self, start: Option<Hash>) -> Result<Chain, CacheError> {
        let mut chain = Chain {
            pages: 0,
            hashes: Vec::new(),
        };
        let mut cursor = start;
        while let Some(page_hash) = cursor {
            let bytes = self
                .blocks
                .get(&page_hash)
                .await?
                .ok_or(CacheError::MissingPage(page_hash))?;
            let page: HeadsPage =
                serde_json::from_slice(&bytes).map_err(|e| CacheError::Corrupted {
                    page: page_hash,
                    reason: e.to_string(),
                })?;
            chain.pages += 1;
            chain.hashes.extend(page.heads);
            cursor = page.last;
        }
        Ok(chain)
    }

    async fn write_page(&self, heads: Vec<Hash>, last: Option<Hash>) -> Result<Hash, CacheError> {
        let page = HeadsPage { heads, last };
        let bytes =
            serde_json::to_vec(&page).map_err(|e| CacheError::Serialization(e.to_string()))?;
        Ok(self.blocks.put(bytes).await?)
    }

    async fn write_pointer(&self, path: &str, page: Hash) -> Result<(), CacheError> {
        self.values
            .put(path, page.to_hex().into_bytes())
            .await
            .map_err(CacheError::from)
    }

    async fn read_pointer(&self, path: &str) -> Result<Option<Hash>, CacheError> {
        let Some(bytes) = self.values.get(path).await? else {
            return Ok(None);
        };
        let corrupted = |reason: &str| CacheError::CorruptedPointer {
            path: path.to_string(),
            reason: reason.to_string(),
        };
        let text = std::str::from_utf8(&bytes).map_err(|_| corrupted("not utf-8"))?;
        Hash::from_hex(text)
            .map(Some)
            .ok_or_else(|| corrupted("not a hash"))
    }
}

fn live_heads(heads: Vec<Hash>, removed: &HashSet<Hash>) -> Vec<Hash> {
    heads
        .into_iter()
        .filter(|h| !removed.contains(h))
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::Hasher;
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Pointer store that rejects writes while `failing` is set.
    #[derive(Default)]
    struct FlakyValues {
        inner: MemoryStore,
        failing: AtomicBool,
    }

    impl FlakyValues {
        fn check(&self) -> Result<(), StoreError> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(StoreError::Backend("pointer store offline".into()));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl KeyValueStore for FlakyValues {
        async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
            KeyValueStore::get(&self.inner, key).await
        }

        async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), StoreError> {
            self.check()?;
            KeyValueStore::put(&self.inner, key, value).await
        }

        async fn delete(&self, key: &str) -> Result<(), StoreError> {
            self.check()?;
            KeyValueStore::delete(&self.inner, key).await
        }
    }

    fn cache(store: &MemoryStore) -> HeadsCache {
        HeadsCache::new(Arc::new(store.clone()), Arc::new(store.clone()), "log", 1)
    }

    fn h(n: u8) -> Hash {
        Hasher::hash(&[n])
    }

    fn added(hashes: &[Hash]) -> HeadsDelta {
        HeadsDelta {
            added: hashes.iter().copied().collect(),
            removed: BTreeSet::new(),
        }
    }

    fn sorted(mut hashes: Vec<Hash>) -> Vec<Hash> {
        hashes.sort();
        hashes
    }

    #[tokio::test]
    async fn test_flush_appends_pages() {
        let store = MemoryStore::new();
        let mut cache = cache(&store);

        cache.queue(&added(&[h(1)]));
        cache.flush(&[h(1)]).await.unwrap();
        cache.queue(&added(&[h(2)]));
        cache.flush(&[h(1), h(2)]).await.unwrap();

        let stats = cache.stats();
        assert_eq!(stats.head_pages, 2);
        assert_eq!(stats.resets, 0);
        assert_eq!(
            cache.get_cached_heads().await.unwrap(),
            sorted(vec![h(1), h(2)])
        );
    }

    #[tokio::test]
    async fn test_removed_chain_subtracts() {
        let store = MemoryStore::new();
        let mut cache = cache(&store);
        cache.queue(&added(&[h(1), h(2), h(3)]));
        cache.flush(&[h(1), h(2), h(3)]).await.unwrap();

        cache.queue(&HeadsDelta {
            added: BTreeSet::new(),
            removed: [h(2)].into_iter().collect(),
        });
        cache.flush(&[h(1), h(3)]).await.unwrap();

        assert_eq!(cache.stats().removed_pages, 1);
        assert_eq!(
            cache.get_cached_heads().await.unwrap(),
            sorted(vec![h(1), h(3)])
        );
    }

    #[tokio::test]
    async fn test_reset_when_removed_catches_up() {
        let store = MemoryStore::new();
        let mut cache = cache(&store);
        cache.queue(&added(&[h(1)]));
        cache.flush(&[h(1)]).await.unwrap();

        cache.queue(&HeadsDelta {
            added: [h(2)].into_iter().collect(),
            removed: [h(1)].into_iter().collect(),
        });
        cache.flush(&[h(2)]).await.unwrap();

        let stats = cache.stats();
        assert_eq!(stats.resets, 1);
        assert_eq!(stats.head_pages, 1);
        assert_eq!(stats.removed_pages, 0);
        assert_eq!(cache.get_cached_heads().await.unwrap(), vec![h(2)]);
    }

    #[tokio::test]
    async fn test_queue_cancels_opposites() {
        let store = MemoryStore::new();
        let mut cache = cache(&store);
        cache.queue(&added(&[h(1)]));
        cache.queue(&HeadsDelta {
            added: BTreeSet::new(),
            removed: [h(1)].into_iter().collect(),
        });
        assert_eq!(cache.pending(), 0);
        assert!(!cache.is_due());
    }

    #[tokio::test]
    async fn test_load_restores_state() {
        let store = MemoryStore::new();
        let mut first = cache(&store);
        first.queue(&added(&[h(1), h(2)]));
        first.flush(&[h(1), h(2)]).await.unwrap();

        let mut second = cache(&store);
        let live = second.load().await.unwrap();
        assert_eq!(live, sorted(vec![h(1), h(2)]));
        assert_eq!(second.stats().head_pages, 1);
        assert_eq!(second.stats().added, 2);
    }

    #[tokio::test]
    async fn test_corrupted_page_fails_load() {
        let store = MemoryStore::new();
        let garbage = BlockStore::put(&store, b"not a page".to_vec()).await.unwrap();
        KeyValueStore::put(&store, "log/heads", garbage.to_hex().into_bytes())
            .await
            .unwrap();

        let err = cache(&store).load().await.unwrap_err();
        assert!(matches!(err, CacheError::Corrupted { page, .. } if page == garbage));
    }

    #[tokio::test]
    async fn test_missing_page_fails_load() {
        let store = MemoryStore::new();
        KeyValueStore::put(&store, "log/heads", h(9).to_hex().into_bytes())
            .await
            .unwrap();
        let err = cache(&store).load().await.unwrap_err();
        assert_eq!(err, CacheError::MissingPage(h(9)));
    }

    #[tokio::test]
    async fn test_corrupted_pointer_fails_load() {
        let store = MemoryStore::new();
        KeyValueStore::put(&store, "log/heads/removed", b"xyz".to_vec())
            .await
            .unwrap();
        let err = cache(&store).load().await.unwrap_err();
        assert!(matches!(
            err,
            CacheError::CorruptedPointer { path, .. } if path == "log/heads/removed"
        ));
    }

    #[tokio::test]
    async fn test_reset_to_empty_clears_pointer() {
        let store = MemoryStore::new();
        let mut cache = cache(&store);
        cache.queue(&added(&[h(1)]));
        cache.flush(&[h(1)]).await.unwrap();
        cache.reset(&[]).await.unwrap();

        assert!(cache.get_cached_heads().await.unwrap().is_empty());
        assert_eq!(KeyValueStore::get(&store, "log/heads").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_failed_flush_keeps_changes_queued() {
        let store = MemoryStore::new();
        let values = Arc::new(FlakyValues::default());
        let mut cache = HeadsCache::new(Arc::new(store), values.clone(), "log", 1);
        cache.queue(&added(&[h(1)]));
        cache.flush(&[h(1)]).await.unwrap();

        values.failing.store(true, Ordering::SeqCst);
        cache.queue(&added(&[h(2)]));
        assert!(cache.flush(&[h(1), h(2)]).await.is_err());
        assert_eq!(cache.pending(), 1);
        assert_eq!(cache.get_cached_heads().await.unwrap(), vec![h(1)]);

        values.failing.store(false, Ordering::SeqCst);
        cache.flush(&[h(1), h(2)]).await.unwrap();
        assert_eq!(cache.pending(), 0);
        assert_eq!(
            cache.get_cached_heads().await.unwrap(),
            sorted(vec![h(1), h(2)])
        );
    }

    #[tokio::test]
    async fn test_interrupted_reset_is_retried() {
        let store = MemoryStore::new();
        let values = Arc::new(FlakyValues::default());
        let mut cache = HeadsCache::new(Arc::new(store), values.clone(), "log", 1);
        cache.queue(&added(&[h(1)]));
        cache.flush(&[h(1)]).await.unwrap();

        values.failing.store(true, Ordering::SeqCst);
        cache.queue(&HeadsDelta {
            added: [h(2)].into_iter().collect(),
            removed: [h(1)].into_iter().collect(),
        });
        assert!(cache.flush(&[h(2)]).await.is_err());
        assert_eq!(cache.stats().resets, 0);
        assert!(cache.is_due());

        values.failing.store(false, Ordering::SeqCst);
        cache.flush(&[h(2)]).await.unwrap();
        assert_eq!(cache.stats().resets, 1);
        assert!(!cache.is_due());
        assert_eq!(cache.get_cached_heads().await.unwrap(), vec![h(2)]);
    }
}

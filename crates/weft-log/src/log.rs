//! The replicated log.
//!
//! A [`Log`] owns an entry graph, its replication index, a hybrid logical
//! clock and a heads cache. Mutations (`append`, `join`, `remove`) are
//! serialized on the async mutex guarding the heads cache, so the head-set
//! change and the cache delta it produces are applied as one step. Reads
//! take a short synchronous lock and never wait on a mutation's I/O.

use crate::entry::{Entry, EntryBuilder, EntryWithRefs, GroupId};
use crate::error::{LogError, Result};
use crate::graph::{EntryGraph, HeadsDelta};
use crate::hash::Hash;
use crate::heads_cache::{CacheStats, HeadsCache};
use crate::identity::{Identity, PublicKey};
use crate::index::{EntryIndex, EntryReplicated, IndexQuery};
use crate::store::{BlockStore, KeyValueStore};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, trace, warn};
use weft_core::{
    ClockChecks, ClockConfig, HybridLogicalClock, StrictChecks, SystemWallClock, Timestamp,
    WallClock,
};

type LogClock = HybridLogicalClock<Arc<dyn WallClock>, Arc<dyn ClockChecks>>;

/// How a log bounds its own length.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TrimPolicy {
    /// Keep at most `to` entries, dropping the oldest first.
    Length { to: usize },
}

/// Options for [`Log::open`].
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LogOptions {
    pub clock: ClockConfig,
    pub trim: Option<TrimPolicy>,
    /// Queued head changes that trigger a cache flush.
    pub cache_batch_size: usize,
    /// Buffer of the event channel.
    pub event_capacity: usize,
    #[serde(skip)]
    pub wall_clock: Option<Arc<dyn WallClock>>,
    #[serde(skip)]
    pub clock_checks: Option<Arc<dyn ClockChecks>>,
}

impl Default for LogOptions {
    fn default() -> Self {
        LogOptions {
            clock: ClockConfig::default(),
            trim: None,
            cache_batch_size: 1,
            event_capacity: 1024,
            wall_clock: None,
            clock_checks: None,
        }
    }
}

impl LogOptions {
    pub fn with_clock_config(mut self, clock: ClockConfig) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_trim(mut self, trim: TrimPolicy) -> Self {
        self.trim = Some(trim);
        self
    }

    pub fn with_cache_batch_size(mut self, size: usize) -> Self {
        self.cache_batch_size = size;
        self
    }

    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }

    pub fn with_wall_clock(mut self, wall_clock: impl WallClock + 'static) -> Self {
        self.wall_clock = Some(Arc::new(wall_clock));
        self
    }

    pub fn with_clock_checks(mut self, checks: impl ClockChecks + 'static) -> Self {
        self.clock_checks = Some(Arc::new(checks));
        self
    }

    fn build_clock(&self) -> LogClock {
        let wall_clock = self
            .wall_clock
            .clone()
            .unwrap_or_else(|| Arc::new(SystemWallClock));
        let checks = self
            .clock_checks
            .clone()
            .unwrap_or_else(|| Arc::new(StrictChecks));
        HybridLogicalClock::with_parts(wall_clock, checks, self.clock.clone())
    }
}

/// Per-append overrides.
#[derive(Clone, Debug, Default)]
pub struct AppendOptions {
    /// Explicit predecessors. Defaults to the current heads; an empty list
    /// starts a new root.
    pub next: Option<Vec<Hash>>,
    /// Explicit group id. Defaults to the smallest gid among `next`, or a
    /// fresh one for roots.
    pub gid: Option<GroupId>,
}

impl AppendOptions {
    pub fn with_next(mut self, next: Vec<Hash>) -> Self {
        self.next = Some(next);
        self
    }

    pub fn with_gid(mut self, gid: impl Into<GroupId>) -> Self {
        self.gid = Some(gid.into());
        self
    }
}

/// Changes observed on a log.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LogEvent {
    Added(Vec<Hash>),
    Removed(Vec<Hash>),
}

#[derive(Default)]
struct LogState {
    graph: EntryGraph,
    index: EntryIndex,
}

impl LogState {
    fn insert(&mut self, entry: Entry) -> Option<HeadsDelta> {
        self.index.insert(&entry);
        self.graph.insert(entry)
    }

    fn remove(&mut self, hash: &Hash) -> Option<(Entry, HeadsDelta)> {
        self.index.remove(hash);
        self.graph.remove(hash)
    }
}

pub struct Log {
    id: String,
    identity: Identity,
    options: LogOptions,
    clock: Mutex<LogClock>,
    state: RwLock<LogState>,
    cache: tokio::sync::Mutex<HeadsCache>,
    blocks: Arc<dyn BlockStore>,
    events: broadcast::Sender<LogEvent>,
    closed: AtomicBool,
}

impl Log {
    /// Open the log named `id`, restoring its heads from the cache and the
    /// entries reachable from them. Blocks missing from the store are
    /// skipped; blocks that fail to decode fail the open.
    pub async fn open(
        id: impl Into<String>,
        blocks: Arc<dyn BlockStore>,
        values: Arc<dyn KeyValueStore>,
        identity: Identity,
        options: LogOptions,
    ) -> Result<Log> {
        let id = id.into();
        let mut cache = HeadsCache::new(blocks.clone(), values, &id, options.cache_batch_size);
        let heads = cache.load().await?;

        let mut state = LogState::default();
        let mut visited: HashSet<Hash> = HashSet::new();
        let mut stack = heads;
        let mut last = Timestamp::ZERO;

        while let Some(hash) = stack.pop() {
            if !visited.insert(hash) {
                continue;
            }
            let Some(bytes) = blocks.get(&hash).await? else {
                trace!(hash = %hash.short(), "entry block not available locally");
                continue;
            };
            let entry = Entry::from_block_bytes(&bytes)?;
            if entry.hash() != hash {
                return Err(LogError::InvalidEntry(hash));
            }
            last = last.max(entry.clock());
            stack.extend(entry.next().iter().copied());
            state.insert(entry);
        }

        let clock = options.build_clock().with_last(last);
        let (events, _) = broadcast::channel(options.event_capacity.max(1));

        debug!(log = %id, entries = state.graph.len(), "log opened");
        Ok(Log {
            id,
            identity,
            options,
            clock: Mutex::new(clock),
            state: RwLock::new(state),
            cache: tokio::sync::Mutex::new(cache),
            blocks,
            events,
            closed: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn public_key(&self) -> PublicKey {
        self.identity.public_key()
    }

    pub fn options(&self) -> &LogOptions {
        &self.options
    }

    /// The last timestamp issued or observed by this log's clock.
    pub fn clock(&self) -> Timestamp {
        self.clock.lock().last()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LogEvent> {
        self.events.subscribe()
    }

    /// Create, sign and insert a new entry.
    pub async fn append(
        &self,
        payload: impl Into<Vec<u8>>,
        options: AppendOptions,
    ) -> Result<Entry> {
        self.ensure_open()?;
        let mut cache = self.cache.lock().await;

        let (next, parent_clock, gid) = {
            let state = self.state.read();
            let next = options.next.unwrap_or_else(|| state.graph.heads());
            let missing: Vec<Hash> = next
                .iter()
                .filter(|h| !state.graph.contains(h))
                .copied()
                .collect();
            if !missing.is_empty() {
                return Err(LogError::MissingNext(missing));
            }
            let parents: Vec<&Entry> = next.iter().filter_map(|h| state.graph.get(h)).collect();
            let parent_clock = parents.iter().map(|e| e.clock()).max();
            let gid = options
                .gid
                .or_else(|| parents.iter().map(|e| e.gid()).min().map(str::to_string));
            (next, parent_clock, gid)
        };

        let clock = {
            let mut clock = self.clock.lock();
            match parent_clock {
                Some(ts) => clock.update(&ts),
                None => clock.now(),
            }
        }?;

        let mut builder = EntryBuilder::new(payload).with_clock(clock).with_next(next);
        if let Some(gid) = gid {
            builder = builder.with_gid(gid);
        }
        let entry = builder.sign(&[&self.identity])?;
        self.blocks.put(entry.to_block_bytes()?).await?;

        let trimmed = {
            let mut state = self.state.write();
            let mut delta = state.insert(entry.clone()).unwrap_or_default();
            let trimmed = self.trim(&mut state);
            for (_, removed) in &trimmed {
                delta.merge(removed.clone());
            }
            cache.queue(&delta);
            trimmed
        };
        for (hash, _) in &trimmed {
            self.delete_block(hash).await;
        }
        self.flush_if_due(&mut cache).await;
        drop(cache);

        trace!(log = %self.id, hash = %entry.hash().short(), clock = %entry.clock(), "appended");
        let _ = self.events.send(LogEvent::Added(vec![entry.hash()]));
        if !trimmed.is_empty() {
            let _ = self
                .events
                .send(LogEvent::Removed(trimmed.into_iter().map(|t| t.0).collect()));
        }
        Ok(entry)
    }

    /// Merge foreign entries. Known hashes are skipped; every new entry must
    /// verify. Returns the hashes that were new to this log.
    pub async fn join(&self, entries: impl IntoIterator<Item = Entry>) -> Result<Vec<Hash>> {
        self.ensure_open()?;
        let mut cache = self.cache.lock().await;

        let fresh: Vec<Entry> = {
            let state = self.state.read();
            let mut seen = HashSet::new();
            entries
                .into_iter()
                .filter(|e| !state.graph.contains(&e.hash()) && seen.insert(e.hash()))
                .collect()
        };
        if fresh.is_empty() {
            return Ok(Vec::new());
        }
        if let Some(bad) = fresh.iter().find(|e| !e.verify()) {
            return Err(LogError::InvalidEntry(bad.hash()));
        }

        if let Some(latest) = fresh.iter().map(|e| e.clock()).max() {
            self.clock.lock().update(&latest)?;
        }
        for entry in &fresh {
            self.blocks.put(entry.to_block_bytes()?).await?;
        }

        let added: Vec<Hash> = fresh.iter().map(|e| e.hash()).collect();
        {
            let mut state = self.state.write();
            let mut delta = HeadsDelta::default();
            for entry in fresh {
                if let Some(d) = state.insert(entry) {
                    delta.merge(d);
                }
            }
            cache.queue(&delta);
        }
        self.flush_if_due(&mut cache).await;
        drop(cache);

        debug!(log = %self.id, joined = added.len(), "joined entries");
        let _ = self.events.send(LogEvent::Added(added.clone()));
        Ok(added)
    }

    /// Merge every entry of `other`.
    pub async fn join_log(&self, other: &Log) -> Result<Vec<Hash>> {
        self.join(other.to_vec()).await
    }

    /// Delete an entry and its block. Parents left without children become
    /// heads again.
    pub async fn remove(&self, hash: &Hash) -> Result<Option<Entry>> {
        self.ensure_open()?;
        let mut cache = self.cache.lock().await;

        let removed = self.state.write().remove(hash);
        let Some((entry, delta)) = removed else {
            return Ok(None);
        };
        cache.queue(&delta);
        self.delete_block(hash).await;
        self.flush_if_due(&mut cache).await;
        drop(cache);

        trace!(log = %self.id, hash = %hash.short(), "removed");
        let _ = self.events.send(LogEvent::Removed(vec![*hash]));
        Ok(Some(entry))
    }

    pub fn has(&self, hash: &Hash) -> bool {
        self.state.read().graph.contains(hash)
    }

    pub fn get(&self, hash: &Hash) -> Option<Entry> {
        self.state.read().graph.get(hash).cloned()
    }

    /// Current heads, sorted by hash.
    pub fn heads(&self) -> Vec<Hash> {
        self.state.read().graph.heads()
    }

    pub fn len(&self) -> usize {
        self.state.read().graph.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.read().graph.is_empty()
    }

    /// All entries, ancestors first; concurrent entries ordered by
    /// `(clock, gid, hash)`.
    pub fn to_vec(&self) -> Vec<Entry> {
        self.state.read().graph.to_vec()
    }

    /// Referenced hashes this log does not hold.
    pub fn missing(&self) -> HashSet<Hash> {
        self.state.read().graph.missing()
    }

    pub fn index_iterate(&self, query: &IndexQuery) -> Vec<EntryReplicated> {
        self.state.read().index.iterate(query)
    }

    pub fn hash_for_coordinate(&self, coordinate: u64) -> Option<Hash> {
        self.state.read().index.hash_for_coordinate(coordinate)
    }

    /// Bundle each resident entry in `hashes` with up to `max_refs` of its
    /// nearest resident ancestors, oldest first.
    pub fn entries_with_refs(&self, hashes: &[Hash], max_refs: usize) -> Vec<EntryWithRefs> {
        let state = self.state.read();
        hashes
            .iter()
            .filter_map(|hash| {
                let entry = state.graph.get(hash)?.clone();
                let mut refs: Vec<Entry> = state
                    .graph
                    .ancestors(hash)
                    .iter()
                    .filter_map(|h| state.graph.get(h).cloned())
                    .collect();
                refs.sort_by_key(|e| (e.clock(), e.hash()));
                let skip = refs.len().saturating_sub(max_refs);
                Some(EntryWithRefs {
                    entry,
                    refs: refs.into_iter().skip(skip).collect(),
                })
            })
            .collect()
    }

    /// Write out every queued head change.
    pub async fn flush(&self) -> Result<()> {
        let mut cache = self.cache.lock().await;
        let heads = self.heads();
        cache.flush(&heads).await?;
        Ok(())
    }

    /// The heads as persisted in the cache.
    pub async fn cached_heads(&self) -> Result<Vec<Hash>> {
        Ok(self.cache.lock().await.get_cached_heads().await?)
    }

    pub async fn cache_stats(&self) -> CacheStats {
        self.cache.lock().await.stats()
    }

    /// Flush the cache and refuse further mutations.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.flush().await?;
        debug!(log = %self.id, entries = self.len(), "log closed");
        Ok(())
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(LogError::Closed);
        }
        Ok(())
    }

    /// Once an entry is in memory the mutation has happened; a failed cache
    /// write leaves its changes queued for the next flush.
    async fn flush_if_due(&self, cache: &mut HeadsCache) {
        if !cache.is_due() {
            return;
        }
        let heads = self.heads();
        if let Err(e) = cache.flush(&heads).await {
            warn!(
                log = %self.id,
                error = %e,
                pending = cache.pending(),
                "heads cache flush failed"
            );
        }
    }

    async fn delete_block(&self, hash: &Hash) {
        if let Err(e) = self.blocks.rm(hash).await {
            warn!(log = %self.id, hash = %hash.short(), error = %e, "block delete failed");
        }
    }

    /// Drop the oldest entries beyond the trim policy.
    fn trim(&self, state: &mut LogState) -> Vec<(Hash, HeadsDelta)> {
        let Some(TrimPolicy::Length { to }) = self.options.trim else {
            return Vec::new();
        };
        let excess = state.graph.len().saturating_sub(to);
        if excess == 0 {
            return Vec::new();
        }
        let oldest: Vec<Hash> = state
            .graph
            .topological_order()
            .into_iter()
            .take(excess)
            .collect();
        oldest
            .into_iter()
            .filter_map(|hash| state.remove(&hash).map(|(_, delta)| (hash, delta)))
            .collect()
    }
}

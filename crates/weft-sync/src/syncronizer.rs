//! Entry synchronization between peers.
//!
//! A peer that may hold entries we lack announces them with
//! `RequestMaybeSync`. Each announced key (a full hash, or its coordinate)
//! moves through:
//!
//! ```text
//! unseen -> queued + in flight -> resolved
//!                 \-> evicted (TTL) -> unseen
//! ```
//!
//! At most one request per key is outstanding at a time. Further peers that
//! announce the same key are remembered as fallback askees and are asked,
//! in order, when the current askee has not delivered within one sync
//! interval. In-flight records older than the TTL are dropped; a key with
//! neither an in-flight record nor askees left goes back to unseen.

use crate::config::SyncConfig;
use crate::error::{Result, SyncError};
use crate::exchange::{create_exchange_heads, exchange_heads_messages};
use crate::message::{
    MessageRegistry, RequestMaybeSync, RequestMaybeSyncCoordinate, ResponseMaybeSync, SyncMessage,
};
use crate::network::{PeerId, SendOptions, Transport};
use crate::source::EntrySource;
use futures::future::join_all;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace, warn};
use weft_log::{Hash, IndexQuery, LogEvent};

/// Priority of deduplicated sync requests.
const REQUEST_PRIORITY: u8 = 1;

/// What is being synced: a full hash or its compact coordinate.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SyncKey {
    Hash(Hash),
    Coordinate(u64),
}

impl SyncKey {
    /// The keys under which `hash` may be tracked.
    fn both(hash: &Hash) -> [SyncKey; 2] {
        [SyncKey::Hash(*hash), SyncKey::Coordinate(hash.coordinate())]
    }
}

#[derive(Default)]
struct SyncState {
    /// Key -> fallback askees, in the order they announced it.
    queue: HashMap<SyncKey, VecDeque<PeerId>>,
    /// Peer -> keys it is an askee or in-flight target for.
    inverted: HashMap<PeerId, HashSet<SyncKey>>,
    /// Peer -> keys requested from it, with the request time.
    in_flight: HashMap<PeerId, HashMap<SyncKey, Instant>>,
}

impl SyncState {
    fn in_flight_target(&self, key: &SyncKey) -> Option<(&PeerId, Instant)> {
        self.in_flight
            .iter()
            .find_map(|(peer, keys)| keys.get(key).map(|at| (peer, *at)))
    }

    fn link(&mut self, peer: &PeerId, key: SyncKey) {
        self.inverted.entry(peer.clone()).or_default().insert(key);
    }

    fn unlink(&mut self, peer: &PeerId, key: &SyncKey) {
        if let Some(keys) = self.inverted.get_mut(peer) {
            keys.remove(key);
            if keys.is_empty() {
                self.inverted.remove(peer);
            }
        }
    }

    fn record_in_flight(&mut self, peer: &PeerId, key: SyncKey, now: Instant) {
        self.in_flight
            .entry(peer.clone())
            .or_default()
            .insert(key, now);
        self.link(peer, key);
    }

    /// Drop the outstanding request for `key`, if any.
    fn cancel_in_flight(&mut self, key: &SyncKey) {
        let Some(peer) = self.in_flight_target(key).map(|(p, _)| p.clone()) else {
            return;
        };
        if let Some(keys) = self.in_flight.get_mut(&peer) {
            keys.remove(key);
            if keys.is_empty() {
                self.in_flight.remove(&peer);
            }
        }
        let still_askee = self
            .queue
            .get(key)
            .is_some_and(|askees| askees.contains(&peer));
        if !still_askee {
            self.unlink(&peer, key);
        }
    }

    /// Forget everything about `key`.
    fn clear(&mut self, key: &SyncKey) -> bool {
        let queued = self.queue.remove(key).is_some();
        self.cancel_in_flight(key);
        self.inverted.retain(|_, keys| {
            keys.remove(key);
            !keys.is_empty()
        });
        queued
    }

    /// Drop in-flight records older than `ttl`. Returns the evicted keys.
    fn evict_expired(&mut self, now: Instant, ttl: Duration) -> Vec<SyncKey> {
        let mut evicted = Vec::new();
        for (peer, keys) in self.in_flight.iter_mut() {
            keys.retain(|key, at| {
                let expired = now.saturating_duration_since(*at) >= ttl;
                if expired {
                    evicted.push((peer.clone(), *key));
                }
                !expired
            });
        }
        self.in_flight.retain(|_, keys| !keys.is_empty());

        for (peer, key) in &evicted {
            let still_askee = self
                .queue
                .get(key)
                .is_some_and(|askees| askees.contains(peer));
            if !still_askee {
                self.unlink(peer, key);
            }
        }
        evicted.into_iter().map(|(_, key)| key).collect()
    }

    /// Purge all state held for `peer`. Keys left with no askee and no
    /// outstanding request lapse.
    fn drop_peer(&mut self, peer: &PeerId) -> usize {
        self.in_flight.remove(peer);
        let keys = self.inverted.remove(peer).unwrap_or_default();
        let mut lapsed = 0;
        for key in &keys {
            let idle = match self.queue.get_mut(key) {
                Some(askees) => {
                    askees.retain(|p| p != peer);
                    askees.is_empty()
                }
                None => false,
            };
            if idle && self.in_flight_target(key).is_none() {
                self.queue.remove(key);
                lapsed += 1;
            }
        }
        lapsed
    }
}

/// Bounded coordinate -> hash cache, evicting the oldest insertions first.
struct CoordinateCache {
    map: HashMap<u64, Hash>,
    order: VecDeque<u64>,
    capacity: usize,
}

impl CoordinateCache {
    fn new(capacity: usize) -> Self {
        CoordinateCache {
            map: HashMap::new(),
            order: VecDeque::new(),
            capacity,
        }
    }

    fn get(&self, coordinate: &u64) -> Option<Hash> {
        self.map.get(coordinate).copied()
    }

    fn insert(&mut self, coordinate: u64, hash: Hash) {
        if self.capacity == 0 {
            return;
        }
        if self.map.insert(coordinate, hash).is_none() {
            self.order.push_back(coordinate);
            while self.order.len() > self.capacity {
                if let Some(old) = self.order.pop_front() {
                    self.map.remove(&old);
                }
            }
        }
    }

    fn remove(&mut self, coordinate: &u64) {
        if self.map.remove(coordinate).is_some() {
            self.order.retain(|c| c != coordinate);
        }
    }

    fn clear(&mut self) {
        self.map.clear();
        self.order.clear();
    }
}

struct Inner<S, T> {
    source: Arc<S>,
    transport: Arc<T>,
    config: SyncConfig,
    registry: MessageRegistry,
    state: Mutex<SyncState>,
    coordinates: Mutex<CoordinateCache>,
    /// Held for the duration of a resync cycle.
    cycle: tokio::sync::Mutex<()>,
    closed: AtomicBool,
}

/// Drives entry synchronization for one log over one transport.
pub struct Syncronizer<S: EntrySource, T: Transport> {
    inner: Arc<Inner<S, T>>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl<S: EntrySource, T: Transport> Syncronizer<S, T> {
    pub fn new(source: Arc<S>, transport: Arc<T>, config: SyncConfig) -> Self {
        Self::with_registry(source, transport, config, MessageRegistry::standard())
    }

    pub fn with_registry(
        source: Arc<S>,
        transport: Arc<T>,
        config: SyncConfig,
        registry: MessageRegistry,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        let coordinates = CoordinateCache::new(config.coordinate_cache_size);
        Syncronizer {
            inner: Arc::new(Inner {
                source,
                transport,
                config,
                registry,
                state: Mutex::new(SyncState::default()),
                coordinates: Mutex::new(coordinates),
                cycle: tokio::sync::Mutex::new(()),
                closed: AtomicBool::new(false),
            }),
            shutdown,
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Spawn the resync loop and the listeners for transport messages and
    /// local log events.
    pub fn start(&self) -> Result<()> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(SyncError::Closed);
        }
        let messages = self.inner.transport.subscribe()?;
        let events = self.inner.source.subscribe();

        let handles = [
            tokio::spawn(request_sync_loop(
                self.inner.clone(),
                self.shutdown.subscribe(),
            )),
            tokio::spawn(message_loop(
                self.inner.clone(),
                messages,
                self.shutdown.subscribe(),
            )),
            tokio::spawn(event_loop(
                self.inner.clone(),
                events,
                self.shutdown.subscribe(),
            )),
        ];
        self.tasks.lock().extend(handles);
        debug!(peer = %self.inner.transport.local_id(), "syncronizer started");
        Ok(())
    }

    pub fn config(&self) -> &SyncConfig {
        &self.inner.config
    }

    pub fn local_id(&self) -> &PeerId {
        self.inner.transport.local_id()
    }

    /// Tell `targets` they may be missing `hashes`.
    pub async fn on_maybe_missing_entries(
        &self,
        hashes: Vec<Hash>,
        targets: Vec<PeerId>,
    ) -> Result<()> {
        self.inner.on_maybe_missing_entries(hashes, targets).await
    }

    /// Push `hashes` with their ancestors to `targets` unasked.
    pub async fn exchange_heads(&self, hashes: &[Hash], targets: Vec<PeerId>) -> Result<()> {
        let config = &self.inner.config;
        let messages = create_exchange_heads(
            self.inner.source.as_ref(),
            hashes,
            config.max_refs,
            config.exchange_batch_size,
        );
        for message in &messages {
            self.inner.send(targets.clone(), message, 0).await?;
        }
        Ok(())
    }

    /// Queue `keys` announced by `from`, requesting new ones from it.
    pub async fn queue_sync(&self, keys: Vec<SyncKey>, from: &PeerId) -> Result<()> {
        self.inner.queue_sync(keys, from).await
    }

    pub async fn on_message(&self, from: &PeerId, message: SyncMessage) -> Result<()> {
        self.inner.on_message(from, message).await
    }

    /// Decode with the registry, then handle.
    pub async fn on_bytes(&self, from: &PeerId, bytes: &[u8]) -> Result<()> {
        self.inner.on_bytes(from, bytes).await
    }

    pub fn on_received_entries(&self, hashes: &[Hash]) {
        self.inner.on_received_entries(hashes)
    }

    pub fn on_entry_added(&self, hash: &Hash) {
        self.inner.on_received_entries(std::slice::from_ref(hash))
    }

    pub fn on_entry_removed(&self, hash: &Hash) {
        self.inner.on_entry_removed(hash)
    }

    pub fn on_peer_disconnected(&self, peer: &PeerId) {
        self.inner.on_peer_disconnected(peer)
    }

    /// Run one resync cycle now.
    pub async fn run_sync_cycle(&self) {
        self.inner.run_sync_cycle().await
    }

    /// Wait for a resync cycle in progress to finish.
    pub async fn idle(&self) {
        let _cycle = self.inner.cycle.lock().await;
    }

    /// Stop the background tasks, waiting for a cycle in progress, then
    /// clear all bookkeeping. Requests already handed to the transport are
    /// left alone.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.shutdown.send(true);
        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            let _ = task.await;
        }
        *self.inner.state.lock() = SyncState::default();
        self.inner.coordinates.lock().clear();
        debug!(peer = %self.inner.transport.local_id(), "syncronizer closed");
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    pub fn is_queued(&self, key: &SyncKey) -> bool {
        self.inner.state.lock().queue.contains_key(key)
    }

    pub fn queued_len(&self) -> usize {
        self.inner.state.lock().queue.len()
    }

    /// Fallback askees for `key`, in the order they will be asked.
    pub fn askees(&self, key: &SyncKey) -> Vec<PeerId> {
        self.inner
            .state
            .lock()
            .queue
            .get(key)
            .map(|askees| askees.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// The peer `key` is currently requested from.
    pub fn in_flight_peer(&self, key: &SyncKey) -> Option<PeerId> {
        self.inner
            .state
            .lock()
            .in_flight_target(key)
            .map(|(peer, _)| peer.clone())
    }

    pub fn in_flight_keys(&self, peer: &PeerId) -> Vec<SyncKey> {
        let mut keys: Vec<SyncKey> = self
            .inner
            .state
            .lock()
            .in_flight
            .get(peer)
            .map(|keys| keys.keys().copied().collect())
            .unwrap_or_default();
        keys.sort();
        keys
    }

    /// Keys `peer` is tracked for, as askee or in-flight target.
    pub fn peer_keys(&self, peer: &PeerId) -> Vec<SyncKey> {
        let mut keys: Vec<SyncKey> = self
            .inner
            .state
            .lock()
            .inverted
            .get(peer)
            .map(|keys| keys.iter().copied().collect())
            .unwrap_or_default();
        keys.sort();
        keys
    }
}

impl<S: EntrySource, T: Transport> Drop for Syncronizer<S, T> {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}

impl<S: EntrySource, T: Transport> Inner<S, T> {
    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SyncError::Closed);
        }
        Ok(())
    }

    fn is_local(&self, key: &SyncKey) -> bool {
        match key {
            SyncKey::Hash(hash) => self.source.has(hash),
            SyncKey::Coordinate(coordinate) => self.source.has_coordinate(*coordinate),
        }
    }

    fn key_for(&self, hash: Hash) -> SyncKey {
        if self.config.use_coordinates {
            SyncKey::Coordinate(hash.coordinate())
        } else {
            SyncKey::Hash(hash)
        }
    }

    async fn send(&self, to: Vec<PeerId>, message: &SyncMessage, priority: u8) -> Result<()> {
        let bytes = self.registry.encode(message)?;
        let options = SendOptions::to_peers(to)
            .with_redundancy(self.config.redundancy)
            .with_priority(priority);
        self.transport.send(bytes, options).await?;
        Ok(())
    }

    async fn on_maybe_missing_entries(
        &self,
        hashes: Vec<Hash>,
        targets: Vec<PeerId>,
    ) -> Result<()> {
        self.ensure_open()?;
        if hashes.is_empty() || targets.is_empty() {
            return Ok(());
        }
        trace!(count = hashes.len(), targets = targets.len(), "announcing entries");
        let message = SyncMessage::RequestMaybeSync(RequestMaybeSync { hashes });
        self.send(targets, &message, 0).await
    }

    async fn queue_sync(&self, keys: Vec<SyncKey>, from: &PeerId) -> Result<()> {
        self.ensure_open()?;
        let missing: Vec<SyncKey> = keys.into_iter().filter(|k| !self.is_local(k)).collect();

        let to_request: Vec<SyncKey> = {
            let mut state = self.state.lock();
            let now = Instant::now();
            let mut to_request = Vec::new();
            for key in missing {
                if !state.queue.contains_key(&key) {
                    state.queue.insert(key, VecDeque::new());
                    state.record_in_flight(from, key, now);
                    to_request.push(key);
                    continue;
                }
                let requested_from_sender = state
                    .in_flight_target(&key)
                    .is_some_and(|(peer, _)| peer == from);
                let askees = state.queue.entry(key).or_default();
                if !requested_from_sender && !askees.contains(from) {
                    askees.push_back(from.clone());
                    state.link(from, key);
                }
            }
            to_request
        };

        if !to_request.is_empty() {
            self.request(from, to_request).await;
        }
        Ok(())
    }

    /// Ask `peer` for `keys`. Delivery failures are left to TTL eviction.
    async fn request(&self, peer: &PeerId, keys: Vec<SyncKey>) {
        let mut hashes = Vec::new();
        let mut coordinates = Vec::new();
        for key in keys {
            match key {
                SyncKey::Hash(hash) => hashes.push(hash),
                SyncKey::Coordinate(coordinate) => coordinates.push(coordinate),
            }
        }
        trace!(
            %peer,
            hashes = hashes.len(),
            coordinates = coordinates.len(),
            "requesting entries"
        );

        let mut messages = Vec::with_capacity(2);
        if !hashes.is_empty() {
            messages.push(SyncMessage::ResponseMaybeSync(ResponseMaybeSync { hashes }));
        }
        if !coordinates.is_empty() {
            messages.push(SyncMessage::RequestMaybeSyncCoordinate(
                RequestMaybeSyncCoordinate {
                    hash_numbers: coordinates,
                },
            ));
        }
        for message in &messages {
            if let Err(e) = self.send(vec![peer.clone()], message, REQUEST_PRIORITY).await {
                warn!(%peer, error = %e, "sync request not delivered");
            }
        }
    }

    async fn on_bytes(&self, from: &PeerId, bytes: &[u8]) -> Result<()> {
        let message = self.registry.decode(bytes)?;
        self.on_message(from, message).await
    }

    async fn on_message(&self, from: &PeerId, message: SyncMessage) -> Result<()> {
        self.ensure_open()?;
        trace!(%from, message = message.name(), "sync message");
        match message {
            SyncMessage::RequestMaybeSync(RequestMaybeSync { hashes }) => {
                let keys = hashes.into_iter().map(|h| self.key_for(h)).collect();
                self.queue_sync(keys, from).await
            }
            SyncMessage::ResponseMaybeSync(ResponseMaybeSync { hashes }) => {
                self.respond(from, &hashes).await
            }
            SyncMessage::RequestMaybeSyncCoordinate(RequestMaybeSyncCoordinate {
                hash_numbers,
            }) => {
                let hashes = self.resolve_coordinates(&hash_numbers);
                self.respond(from, &hashes).await
            }
            SyncMessage::ExchangeHeads(exchange) => {
                let entries: Vec<_> = exchange
                    .heads
                    .into_iter()
                    .flat_map(|bundle| bundle.into_entries())
                    .collect();
                let hashes: Vec<Hash> = entries.iter().map(|e| e.hash()).collect();
                let parents: HashSet<Hash> = entries
                    .iter()
                    .flat_map(|e| e.next().iter().copied())
                    .collect();
                let added = self.source.join_entries(entries).await?;
                debug!(%from, received = hashes.len(), added = added.len(), "exchanged heads");
                self.on_received_entries(&hashes);

                // History older than the shipped refs is pulled from the sender.
                let gaps: Vec<SyncKey> = parents
                    .into_iter()
                    .filter(|h| !self.source.has(h))
                    .map(|h| self.key_for(h))
                    .collect();
                if gaps.is_empty() {
                    return Ok(());
                }
                trace!(%from, gaps = gaps.len(), "pulling older history");
                self.queue_sync(gaps, from).await
            }
        }
    }

    /// Send the requested entries back to the requester only.
    async fn respond(&self, to: &PeerId, hashes: &[Hash]) -> Result<()> {
        if hashes.is_empty() {
            return Ok(());
        }
        let bundles = self.source.entries_with_refs(hashes, self.config.max_refs);
        if bundles.is_empty() {
            trace!(%to, requested = hashes.len(), "nothing to send");
            return Ok(());
        }
        for message in exchange_heads_messages(bundles, self.config.exchange_batch_size) {
            self.send(vec![to.clone()], &message, 0).await?;
        }
        Ok(())
    }

    /// Map coordinates to resident hashes, in batches, through the cache.
    fn resolve_coordinates(&self, coordinates: &[u64]) -> Vec<Hash> {
        let mut hashes = Vec::with_capacity(coordinates.len());
        let mut unresolved = Vec::new();
        {
            let cache = self.coordinates.lock();
            for coordinate in coordinates {
                match cache.get(coordinate) {
                    Some(hash) => hashes.push(hash),
                    None => unresolved.push(*coordinate),
                }
            }
        }

        for batch in unresolved.chunks(self.config.resolve_batch_size.max(1)) {
            let records = self.source.resolve(&IndexQuery::Coordinates {
                coordinates: batch.to_vec(),
            });
            let mut cache = self.coordinates.lock();
            for record in records {
                cache.insert(record.coordinate, record.hash);
                hashes.push(record.hash);
            }
        }
        hashes
    }

    fn on_received_entries(&self, hashes: &[Hash]) {
        let mut state = self.state.lock();
        for hash in hashes {
            for key in SyncKey::both(hash) {
                if state.clear(&key) {
                    trace!(hash = %hash.short(), "sync resolved");
                }
            }
        }
    }

    fn on_entry_removed(&self, hash: &Hash) {
        self.on_received_entries(std::slice::from_ref(hash));
        self.coordinates.lock().remove(&hash.coordinate());
    }

    fn on_peer_disconnected(&self, peer: &PeerId) {
        let lapsed = self.state.lock().drop_peer(peer);
        debug!(%peer, lapsed, "peer sync state purged");
    }

    async fn run_sync_cycle(&self) {
        let _cycle = self.cycle.lock().await;
        if self.closed.load(Ordering::SeqCst) {
            return;
        }

        let queued: Vec<SyncKey> = self.state.lock().queue.keys().copied().collect();
        let resolved: Vec<SyncKey> = queued.into_iter().filter(|k| self.is_local(k)).collect();

        let interval = Duration::from_millis(self.config.sync_interval_ms);
        let ttl = Duration::from_millis(self.config.in_flight_ttl_ms);
        let now = Instant::now();

        let batches: BTreeMap<PeerId, Vec<SyncKey>> = {
            let mut state = self.state.lock();
            for key in &resolved {
                state.clear(key);
            }

            let evicted = state.evict_expired(now, ttl);
            if !evicted.is_empty() {
                debug!(evicted = evicted.len(), "in-flight sync requests expired");
            }

            let mut batches: BTreeMap<PeerId, Vec<SyncKey>> = BTreeMap::new();
            let keys: Vec<SyncKey> = state.queue.keys().copied().collect();
            for key in keys {
                let age = state
                    .in_flight_target(&key)
                    .map(|(_, at)| now.saturating_duration_since(at));
                if age.is_some_and(|age| age < interval) {
                    continue;
                }
                let next = state.queue.get_mut(&key).and_then(|a| a.pop_front());
                match next {
                    Some(peer) => {
                        state.cancel_in_flight(&key);
                        state.record_in_flight(&peer, key, now);
                        batches.entry(peer).or_default().push(key);
                    }
                    None if age.is_none() => {
                        state.clear(&key);
                    }
                    None => {}
                }
            }
            batches
        };

        join_all(
            batches
                .into_iter()
                .map(|(peer, keys)| async move { self.request(&peer, keys).await }),
        )
        .await;
    }
}

async fn request_sync_loop<S: EntrySource, T: Transport>(
    inner: Arc<Inner<S, T>>,
    mut shutdown: watch::Receiver<bool>,
) {
    let interval = Duration::from_millis(inner.config.sync_interval_ms.max(1));
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = shutdown.changed() => break,
        }
        if inner.closed.load(Ordering::SeqCst) {
            break;
        }
        // The next sleep starts only once this cycle has settled.
        inner.run_sync_cycle().await;
    }
}

async fn message_loop<S: EntrySource, T: Transport>(
    inner: Arc<Inner<S, T>>,
    mut messages: tokio::sync::mpsc::Receiver<crate::network::Envelope>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let envelope = tokio::select! {
            envelope = messages.recv() => envelope,
            _ = shutdown.changed() => break,
        };
        let Some(envelope) = envelope else {
            break;
        };
        if let Err(e) = inner.on_bytes(&envelope.from, &envelope.payload).await {
            warn!(from = %envelope.from, error = %e, "failed to handle sync message");
        }
    }
}

async fn event_loop<S: EntrySource, T: Transport>(
    inner: Arc<Inner<S, T>>,
    mut events: broadcast::Receiver<LogEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let event = tokio::select! {
            event = events.recv() => event,
            _ = shutdown.changed() => break,
        };
        match event {
            Ok(LogEvent::Added(hashes)) => inner.on_received_entries(&hashes),
            Ok(LogEvent::Removed(hashes)) => {
                for hash in &hashes {
                    inner.on_entry_removed(hash);
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "log events lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(name: &str) -> PeerId {
        PeerId::new(name)
    }

    fn h(n: u8) -> Hash {
        weft_log::Hasher::hash(&[n])
    }

    #[test]
    fn test_cancel_keeps_askee_link() {
        let mut state = SyncState::default();
        let key = SyncKey::Hash(h(1));
        let now = Instant::now();
        state.queue.insert(key, VecDeque::from([peer("a")]));
        state.link(&peer("a"), key);
        state.record_in_flight(&peer("a"), key, now);

        state.cancel_in_flight(&key);
        assert!(state.in_flight_target(&key).is_none());
        assert!(state.inverted[&peer("a")].contains(&key));
    }

    #[test]
    fn test_clear_forgets_key_everywhere() {
        let mut state = SyncState::default();
        let key = SyncKey::Coordinate(7);
        state.queue.insert(key, VecDeque::from([peer("b")]));
        state.link(&peer("b"), key);
        state.record_in_flight(&peer("a"), key, Instant::now());

        assert!(state.clear(&key));
        assert!(state.queue.is_empty());
        assert!(state.in_flight.is_empty());
        assert!(state.inverted.is_empty());
    }

    #[test]
    fn test_drop_peer_lapses_orphaned_keys() {
        let mut state = SyncState::default();
        let shared = SyncKey::Hash(h(1));
        let solo = SyncKey::Hash(h(2));
        let now = Instant::now();

        state.queue.insert(shared, VecDeque::from([peer("b")]));
        state.link(&peer("b"), shared);
        state.record_in_flight(&peer("a"), shared, now);
        state.queue.insert(solo, VecDeque::new());
        state.record_in_flight(&peer("a"), solo, now);

        assert_eq!(state.drop_peer(&peer("a")), 1);
        assert!(state.queue.contains_key(&shared));
        assert!(!state.queue.contains_key(&solo));
        assert!(state.in_flight.is_empty());
    }

    #[test]
    fn test_coordinate_cache_is_bounded() {
        let mut cache = CoordinateCache::new(2);
        cache.insert(1, h(1));
        cache.insert(2, h(2));
        cache.insert(3, h(3));
        assert_eq!(cache.get(&1), None);
        assert_eq!(cache.get(&3), Some(h(3)));
        cache.remove(&3);
        assert_eq!(cache.get(&3), None);
        assert_eq!(cache.order.len(), 1);
    }
}

//! What the syncronizer needs from a log.

use async_trait::async_trait;
use tokio::sync::broadcast;
use weft_log::{
    Entry, EntryReplicated, EntryWithRefs, Hash, IndexQuery, Log, LogError, LogEvent,
};

/// Read access to the local entry set plus the ability to merge into it.
#[async_trait]
pub trait EntrySource: Send + Sync + 'static {
    fn has(&self, hash: &Hash) -> bool;

    fn has_coordinate(&self, coordinate: u64) -> bool;

    /// Query the entry index.
    fn resolve(&self, query: &IndexQuery) -> Vec<EntryReplicated>;

    fn entries_with_refs(&self, hashes: &[Hash], max_refs: usize) -> Vec<EntryWithRefs>;

    /// Merge entries; returns the hashes that were new.
    async fn join_entries(&self, entries: Vec<Entry>) -> Result<Vec<Hash>, LogError>;

    fn subscribe(&self) -> broadcast::Receiver<LogEvent>;
}

#[async_trait]
impl EntrySource for Log {
    fn has(&self, hash: &Hash) -> bool {
        Log::has(self, hash)
    }

    fn has_coordinate(&self, coordinate: u64) -> bool {
        self.hash_for_coordinate(coordinate).is_some()
    }

    fn resolve(&self, query: &IndexQuery) -> Vec<EntryReplicated> {
        self.index_iterate(query)
    }

    fn entries_with_refs(&self, hashes: &[Hash], max_refs: usize) -> Vec<EntryWithRefs> {
        Log::entries_with_refs(self, hashes, max_refs)
    }

    async fn join_entries(&self, entries: Vec<Entry>) -> Result<Vec<Hash>, LogError> {
        self.join(entries).await
    }

    fn subscribe(&self) -> broadcast::Receiver<LogEvent> {
        Log::subscribe(self)
    }
}

//! Lightweight replication metadata for resident entries.
//!
//! The sync layer resolves coordinates and answers "do we have it" through
//! this index without touching entry payloads.

use crate::entry::{Entry, GroupId};
use crate::hash::Hash;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};

/// Per-entry replication record.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryReplicated {
    pub hash: Hash,
    pub coordinate: u64,
    pub gid: GroupId,
}

impl From<&Entry> for EntryReplicated {
    fn from(entry: &Entry) -> Self {
        EntryReplicated {
            hash: entry.hash(),
            coordinate: entry.coordinate(),
            gid: entry.gid().to_string(),
        }
    }
}

/// Filter for [`EntryIndex::iterate`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum IndexQuery {
    All,
    Hashes { hashes: Vec<Hash> },
    Coordinates { coordinates: Vec<u64> },
    Gid { gid: GroupId },
}

#[derive(Clone, Debug, Default)]
pub struct EntryIndex {
    by_hash: BTreeMap<Hash, EntryReplicated>,
    by_coordinate: HashMap<u64, Hash>,
}

impl EntryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, entry: &Entry) {
        let record = EntryReplicated::from(entry);
        self.by_coordinate.insert(record.coordinate, record.hash);
        self.by_hash.insert(record.hash, record);
    }

    pub fn remove(&mut self, hash: &Hash) -> Option<EntryReplicated> {
        let record = self.by_hash.remove(hash)?;
        if self.by_coordinate.get(&record.coordinate) == Some(hash) {
            self.by_coordinate.remove(&record.coordinate);
        }
        Some(record)
    }

    pub fn get(&self, hash: &Hash) -> Option<&EntryReplicated> {
        self.by_hash.get(hash)
    }

    pub fn hash_for_coordinate(&self, coordinate: u64) -> Option<Hash> {
        self.by_coordinate.get(&coordinate).copied()
    }

    pub fn len(&self) -> usize {
        self.by_hash.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_hash.is_empty()
    }

    /// Records matching `query`, in hash order.
    pub fn iterate(&self, query: &IndexQuery) -> Vec<EntryReplicated> {
        match query {
            IndexQuery::All => self.by_hash.values().cloned().collect(),
            IndexQuery::Hashes { hashes } => {
                let wanted: HashSet<&Hash> = hashes.iter().collect();
                self.by_hash
                    .values()
                    .filter(|r| wanted.contains(&r.hash))
                    .cloned()
                    .collect()
            }
            IndexQuery::Coordinates { coordinates } => {
                let mut hits: Vec<EntryReplicated> = coordinates
                    .iter()
                    .filter_map(|c| self.by_coordinate.get(c))
                    .filter_map(|h| self.by_hash.get(h))
                    .cloned()
                    .collect();
                hits.sort_by_key(|r| r.hash);
                hits.dedup_by_key(|r| r.hash);
                hits
            }
            IndexQuery::Gid { gid } => self
                .by_hash
                .values()
                .filter(|r| &r.gid == gid)
                .cloned()
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::EntryBuilder;
    use crate::identity::Identity;

    fn entry(payload: &str, gid: &str) -> Entry {
        EntryBuilder::new(payload.as_bytes().to_vec())
            .with_gid(gid)
            .sign(&[&Identity::from_seed([2; 32])])
            .unwrap()
    }

    #[test]
    fn test_queries() {
        let mut index = EntryIndex::new();
        let a = entry("a", "g1");
        let b = entry("b", "g2");
        index.insert(&a);
        index.insert(&b);

        assert_eq!(index.iterate(&IndexQuery::All).len(), 2);
        let by_gid = index.iterate(&IndexQuery::Gid { gid: "g2".into() });
        assert_eq!(by_gid.len(), 1);
        assert_eq!(by_gid[0].hash, b.hash());

        let by_coord = index.iterate(&IndexQuery::Coordinates {
            coordinates: vec![a.coordinate(), 42, a.coordinate()],
        });
        assert_eq!(by_coord.len(), 1);
        assert_eq!(by_coord[0].hash, a.hash());

        let by_hash = index.iterate(&IndexQuery::Hashes {
            hashes: vec![b.hash()],
        });
        assert_eq!(by_hash[0].gid, "g2");
    }

    #[test]
    fn test_remove_clears_coordinate() {
        let mut index = EntryIndex::new();
        let a = entry("a", "g");
        index.insert(&a);
        assert_eq!(index.hash_for_coordinate(a.coordinate()), Some(a.hash()));
        index.remove(&a.hash());
        assert_eq!(index.hash_for_coordinate(a.coordinate()), None);
        assert!(index.is_empty());
    }
}

//! In-memory entry DAG.
//!
//! The graph is an arena of entries keyed by content hash, with a reverse
//! index from each referenced hash to its resident children. Heads are the
//! resident entries with no resident child, maintained incrementally on
//! insert and remove.

use crate::entry::Entry;
use crate::hash::Hash;
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use weft_core::{Lattice, Timestamp};

/// Net change to the head set caused by one or more mutations.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HeadsDelta {
    pub added: BTreeSet<Hash>,
    pub removed: BTreeSet<Hash>,
}

impl HeadsDelta {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }

    /// Fold a later delta into this one. Opposite operations on the same
    /// hash cancel.
    pub fn merge(&mut self, later: HeadsDelta) {
        for hash in later.added {
            if !self.removed.remove(&hash) {
                self.added.insert(hash);
            }
        }
        for hash in later.removed {
            if !self.added.remove(&hash) {
                self.removed.insert(hash);
            }
        }
    }
}

/// Deterministic total order used to break ties between concurrent entries.
#[derive(PartialEq, Eq, PartialOrd, Ord)]
struct SortKey<'a> {
    clock: Timestamp,
    gid: &'a str,
    hash: Hash,
}

impl<'a> SortKey<'a> {
    fn of(entry: &'a Entry) -> Self {
        SortKey {
            clock: entry.clock(),
            gid: entry.gid(),
            hash: entry.hash(),
        }
    }
}

/// Content-addressed entry arena with head tracking.
#[derive(Clone, Debug, Default)]
pub struct EntryGraph {
    entries: HashMap<Hash, Entry>,
    heads: BTreeSet<Hash>,
    /// Referenced hash -> resident entries naming it in `next`.
    children: HashMap<Hash, HashSet<Hash>>,
}

impl EntryGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an entry. Returns `None` if it was already present.
    pub fn insert(&mut self, entry: Entry) -> Option<HeadsDelta> {
        let hash = entry.hash();
        if self.entries.contains_key(&hash) {
            return None;
        }

        let mut delta = HeadsDelta::default();
        for parent in entry.next() {
            self.children.entry(*parent).or_default().insert(hash);
            if self.heads.remove(parent) {
                delta.removed.insert(*parent);
            }
        }

        // An entry whose descendant arrived first is not a head.
        let superseded = self.children.get(&hash).is_some_and(|c| !c.is_empty());
        if !superseded {
            self.heads.insert(hash);
            delta.added.insert(hash);
        }

        self.entries.insert(hash, entry);
        Some(delta)
    }

    /// Remove an entry. Parents left without resident children become heads
    /// again; absent parents stay absent.
    pub fn remove(&mut self, hash: &Hash) -> Option<(Entry, HeadsDelta)> {
        let entry = self.entries.remove(hash)?;
        let mut delta = HeadsDelta::default();

        if self.heads.remove(hash) {
            delta.removed.insert(*hash);
        }

        for parent in entry.next() {
            let orphaned = match self.children.get_mut(parent) {
                Some(children) => {
                    children.remove(hash);
                    children.is_empty()
                }
                None => false,
            };
            if orphaned {
                self.children.remove(parent);
                if self.entries.contains_key(parent) && self.heads.insert(*parent) {
                    delta.added.insert(*parent);
                }
            }
        }

        Some((entry, delta))
    }

    pub fn contains(&self, hash: &Hash) -> bool {
        self.entries.contains_key(hash)
    }

    pub fn get(&self, hash: &Hash) -> Option<&Entry> {
        self.entries.get(hash)
    }

    /// Current heads, sorted by hash.
    pub fn heads(&self) -> Vec<Hash> {
        self.heads.iter().copied().collect()
    }

    pub fn is_head(&self, hash: &Hash) -> bool {
        self.heads.contains(hash)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> impl Iterator<Item = &Entry> {
        self.entries.values()
    }

    /// Hashes referenced through `next` that are not resident.
    pub fn missing(&self) -> HashSet<Hash> {
        self.children
            .keys()
            .filter(|h| !self.entries.contains_key(h))
            .copied()
            .collect()
    }

    /// Resident transitive ancestors of `hash`, excluding itself.
    pub fn ancestors(&self, hash: &Hash) -> HashSet<Hash> {
        let mut result = HashSet::new();
        let mut queue: VecDeque<Hash> = self
            .entries
            .get(hash)
            .map(|e| e.next().iter().copied().collect())
            .unwrap_or_default();

        while let Some(current) = queue.pop_front() {
            let Some(entry) = self.entries.get(&current) else {
                continue;
            };
            if result.insert(current) {
                queue.extend(entry.next().iter().copied());
            }
        }
        result
    }

    /// Ancestors before descendants; concurrent entries ordered by
    /// `(clock, gid, hash)`.
    pub fn topological_order(&self) -> Vec<Hash> {
        let mut pending: HashMap<Hash, usize> = HashMap::with_capacity(self.entries.len());
        let mut ready: BTreeSet<SortKey<'_>> = BTreeSet::new();

        for entry in self.entries.values() {
            // Children are indexed once per distinct parent.
            let resident_parents = entry
                .next()
                .iter()
                .filter(|p| self.entries.contains_key(p))
                .collect::<HashSet<_>>()
                .len();
            if resident_parents == 0 {
                ready.insert(SortKey::of(entry));
            } else {
                pending.insert(entry.hash(), resident_parents);
            }
        }

        let mut order = Vec::with_capacity(self.entries.len());
        while let Some(key) = ready.pop_first() {
            order.push(key.hash);
            let Some(children) = self.children.get(&key.hash) else {
                continue;
            };
            for child in children {
                let Some(count) = pending.get_mut(child) else {
                    continue;
                };
                *count -= 1;
                if *count == 0 {
                    pending.remove(child);
                    if let Some(entry) = self.entries.get(child) {
                        ready.insert(SortKey::of(entry));
                    }
                }
            }
        }
        order
    }

    /// Entries in [`topological_order`](Self::topological_order).
    pub fn to_vec(&self) -> Vec<Entry> {
        self.topological_order()
            .iter()
            .filter_map(|h| self.entries.get(h).cloned())
            .collect()
    }
}

impl PartialEq for EntryGraph {
    fn eq(&self, other: &Self) -> bool {
        self.entries.len() == other.entries.len()
            && self.entries.keys().all(|h| other.entries.contains_key(h))
            && self.heads == other.heads
    }
}

impl Eq for EntryGraph {}

impl Lattice for EntryGraph {
    fn bottom() -> Self {
        Self::default()
    }

    fn join(&self, other: &Self) -> Self {
        let mut joined = self.clone();
        for entry in other.entries.values() {
            joined.insert(entry.clone());
        }
        joined
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::EntryBuilder;
    use crate::identity::Identity;

    fn entry(payload: &str, wall: u64, next: Vec<Hash>) -> Entry {
        EntryBuilder::new(payload.as_bytes().to_vec())
            .with_clock(Timestamp::new(wall, 0))
            .with_gid("g")
            .with_next(next)
            .sign(&[&Identity::from_seed([1; 32])])
            .unwrap()
    }

    #[test]
    fn test_linear_chain_single_head() {
        let mut graph = EntryGraph::new();
        let a = entry("a", 1, vec![]);
        let b = entry("b", 2, vec![a.hash()]);
        graph.insert(a.clone());
        let delta = graph.insert(b.clone()).unwrap();

        assert_eq!(graph.heads(), vec![b.hash()]);
        assert!(delta.added.contains(&b.hash()));
        assert!(delta.removed.contains(&a.hash()));
    }

    #[test]
    fn test_duplicate_insert_is_noop() {
        let mut graph = EntryGraph::new();
        let a = entry("a", 1, vec![]);
        assert!(graph.insert(a.clone()).is_some());
        assert!(graph.insert(a).is_none());
        assert_eq!(graph.len(), 1);
    }

    #[test]
    fn test_child_before_parent() {
        let mut graph = EntryGraph::new();
        let a = entry("a", 1, vec![]);
        let b = entry("b", 2, vec![a.hash()]);
        graph.insert(b.clone());
        assert_eq!(graph.missing(), [a.hash()].into_iter().collect());

        let delta = graph.insert(a.clone()).unwrap();
        assert!(delta.is_empty());
        assert_eq!(graph.heads(), vec![b.hash()]);
        assert!(graph.missing().is_empty());
    }

    #[test]
    fn test_remove_head_restores_parent() {
        let mut graph = EntryGraph::new();
        let a = entry("a", 1, vec![]);
        let b = entry("b", 2, vec![a.hash()]);
        graph.insert(a.clone());
        graph.insert(b.clone());

        let (_, delta) = graph.remove(&b.hash()).unwrap();
        assert_eq!(graph.heads(), vec![a.hash()]);
        assert!(delta.added.contains(&a.hash()));
        assert!(delta.removed.contains(&b.hash()));
    }

    #[test]
    fn test_remove_does_not_resurrect_absent_parent() {
        let mut graph = EntryGraph::new();
        let a = entry("a", 1, vec![]);
        let b = entry("b", 2, vec![a.hash()]);
        graph.insert(b.clone());
        graph.remove(&b.hash());
        assert!(graph.heads().is_empty());
        assert!(graph.is_empty());
    }

    #[test]
    fn test_parent_with_other_child_stays_hidden() {
        let mut graph = EntryGraph::new();
        let a = entry("a", 1, vec![]);
        let b = entry("b", 2, vec![a.hash()]);
        let c = entry("c", 3, vec![a.hash()]);
        graph.insert(a.clone());
        graph.insert(b.clone());
        graph.insert(c.clone());

        graph.remove(&b.hash());
        assert_eq!(graph.heads(), vec![c.hash()]);
    }

    #[test]
    fn test_topological_order_with_ties() {
        let mut graph = EntryGraph::new();
        let root = entry("root", 1, vec![]);
        let x = entry("x", 5, vec![root.hash()]);
        let y = entry("y", 5, vec![root.hash()]);
        let merge = entry("m", 6, vec![x.hash(), y.hash()]);
        for e in [merge.clone(), y.clone(), root.clone(), x.clone()] {
            graph.insert(e);
        }

        let order = graph.topological_order();
        assert_eq!(order.first(), Some(&root.hash()));
        assert_eq!(order.last(), Some(&merge.hash()));
        let (first, second) = if x.hash() < y.hash() { (x, y) } else { (y, x) };
        assert_eq!(order[1], first.hash());
        assert_eq!(order[2], second.hash());
    }

    #[test]
    fn test_clock_orders_concurrent_roots() {
        let mut graph = EntryGraph::new();
        let late = entry("late", 9, vec![]);
        let early = entry("early", 2, vec![]);
        graph.insert(late.clone());
        graph.insert(early.clone());
        assert_eq!(graph.topological_order(), vec![early.hash(), late.hash()]);
    }

    #[test]
    fn test_ancestors() {
        let mut graph = EntryGraph::new();
        let a = entry("a", 1, vec![]);
        let b = entry("b", 2, vec![a.hash()]);
        let c = entry("c", 3, vec![b.hash()]);
        for e in [a.clone(), b.clone(), c.clone()] {
            graph.insert(e);
        }
        let ancestors = graph.ancestors(&c.hash());
        assert_eq!(ancestors, [a.hash(), b.hash()].into_iter().collect());
    }

    #[test]
    fn test_delta_merge_cancels() {
        let h = crate::hash::Hasher::hash(b"h");
        let mut delta = HeadsDelta::default();
        delta.added.insert(h);
        delta.merge(HeadsDelta {
            added: BTreeSet::new(),
            removed: [h].into_iter().collect(),
        });
        assert!(delta.is_empty());
    }

    #[test]
    fn test_join_is_union() {
        let a = entry("a", 1, vec![]);
        let b = entry("b", 2, vec![a.hash()]);
        let mut left = EntryGraph::new();
        left.insert(a.clone());
        let mut right = EntryGraph::new();
        right.insert(b.clone());

        let joined = left.join(&right);
        assert_eq!(joined.len(), 2);
        assert_eq!(joined.heads(), vec![b.hash()]);
        assert_eq!(joined, right.join(&left));
        assert!(left.leq(&joined));
    }

    #[test]
    fn test_repeated_parent_does_not_hide_entries() {
        let mut graph = EntryGraph::new();
        let p = entry("p", 1, vec![]);
        let child = EntryBuilder::new(b"c".to_vec())
            .with_clock(Timestamp::new(2, 0))
            .with_gid("g")
            .with_next(vec![p.hash(), p.hash()])
            .sign_verbatim(&[&Identity::from_seed([1; 32])])
            .unwrap();
        let tip = entry("t", 3, vec![child.hash()]);
        graph.insert(p.clone());
        graph.insert(child.clone());
        graph.insert(tip.clone());

        let order: Vec<Hash> = graph.to_vec().iter().map(|e| e.hash()).collect();
        assert_eq!(order, vec![p.hash(), child.hash(), tip.hash()]);
        assert_eq!(graph.heads(), vec![tip.hash()]);

        graph.remove(&child.hash());
        let mut expected = vec![p.hash(), tip.hash()];
        expected.sort();
        assert_eq!(graph.heads(), expected);
    }
}

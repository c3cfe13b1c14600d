//! Property-based tests for the join-semilattice laws of the entry graph.
//!
//! Entries are drawn from one random DAG and scattered over three replicas,
//! so replicas regularly hold children whose parents live elsewhere.
//!
//! - Commutativity: a ⊔ b = b ⊔ a, including iteration order
//! - Associativity: (a ⊔ b) ⊔ c = a ⊔ (b ⊔ c)
//! - Idempotence: a ⊔ a = a
//! - Heads are exactly the entries with no resident child

use proptest::prelude::*;
use std::collections::HashSet;
use weft_core::{Lattice, Timestamp};
use weft_log::{Entry, EntryBuilder, EntryGraph, Hash, Identity};

#[derive(Clone, Debug)]
struct Node {
    wall: u64,
    gid: u8,
    parents: Vec<usize>,
    owner: usize,
}

fn dag_strategy() -> impl Strategy<Value = Vec<Node>> {
    prop::collection::vec(
        (
            0u64..8,
            0u8..3,
            prop::collection::vec(any::<prop::sample::Index>(), 0..3),
            0usize..3,
        ),
        1..16,
    )
    .prop_map(|raw| {
        raw.into_iter()
            .enumerate()
            .map(|(i, (wall, gid, picks, owner))| Node {
                wall,
                gid,
                // Only earlier nodes can be referenced.
                parents: if i == 0 {
                    Vec::new()
                } else {
                    picks.iter().map(|p| p.index(i)).collect()
                },
                owner,
            })
            .collect()
    })
}

fn build(nodes: &[Node]) -> [EntryGraph; 3] {
    let identity = Identity::from_seed([11; 32]);
    let mut hashes: Vec<Hash> = Vec::with_capacity(nodes.len());
    let mut replicas = [EntryGraph::new(), EntryGraph::new(), EntryGraph::new()];

    for (i, node) in nodes.iter().enumerate() {
        let entry = EntryBuilder::new(vec![i as u8])
            .with_clock(Timestamp::new(node.wall, 0))
            .with_gid(format!("g{}", node.gid))
            .with_next(node.parents.iter().map(|p| hashes[*p]).collect())
            .sign(&[&identity])
            .unwrap();
        hashes.push(entry.hash());
        replicas[node.owner].insert(entry);
    }
    replicas
}

fn order(graph: &EntryGraph) -> Vec<Hash> {
    graph.to_vec().iter().map(Entry::hash).collect()
}

fn heads_by_definition(graph: &EntryGraph) -> Vec<Hash> {
    let referenced: HashSet<Hash> = graph
        .entries()
        .flat_map(|e| e.next().iter().copied())
        .collect();
    let mut heads: Vec<Hash> = graph
        .entries()
        .map(Entry::hash)
        .filter(|h| !referenced.contains(h))
        .collect();
    heads.sort();
    heads
}

proptest! {
    #[test]
    fn join_is_commutative(nodes in dag_strategy()) {
        let [a, b, _] = build(&nodes);
        let ab = a.join(&b);
        let ba = b.join(&a);
        prop_assert_eq!(&ab, &ba);
        prop_assert_eq!(order(&ab), order(&ba));
    }

    #[test]
    fn join_is_associative(nodes in dag_strategy()) {
        let [a, b, c] = build(&nodes);
        let left = a.join(&b).join(&c);
        let right = a.join(&b.join(&c));
        prop_assert_eq!(&left, &right);
        prop_assert_eq!(order(&left), order(&right));
    }

    #[test]
    fn join_is_idempotent(nodes in dag_strategy()) {
        let [a, _, _] = build(&nodes);
        let aa = a.join(&a);
        prop_assert_eq!(&aa, &a);
        prop_assert_eq!(order(&aa), order(&a));
    }

    #[test]
    fn join_is_upper_bound(nodes in dag_strategy()) {
        let [a, b, _] = build(&nodes);
        let ab = a.join(&b);
        prop_assert!(a.leq(&ab));
        prop_assert!(b.leq(&ab));
        prop_assert!(EntryGraph::bottom().leq(&a));
    }

    #[test]
    fn heads_match_definition(nodes in dag_strategy()) {
        let [a, b, c] = build(&nodes);
        let all = a.join(&b).join(&c);
        prop_assert_eq!(all.heads(), heads_by_definition(&all));
        prop_assert_eq!(a.heads(), heads_by_definition(&a));
    }

    #[test]
    fn order_puts_ancestors_first(nodes in dag_strategy()) {
        let [a, b, c] = build(&nodes);
        let all = a.join(&b).join(&c);
        let order = order(&all);
        prop_assert_eq!(order.len(), nodes.len());
        for entry in all.entries() {
            let pos = order.iter().position(|h| *h == entry.hash());
            for parent in entry.next() {
                let parent_pos = order.iter().position(|h| h == parent);
                prop_assert!(parent_pos < pos);
            }
        }
    }

    #[test]
    fn removal_keeps_heads_consistent(
        nodes in dag_strategy(),
        victim in any::<prop::sample::Index>(),
    ) {
        let [a, b, c] = build(&nodes);
        let mut all = a.join(&b).join(&c);
        let hashes = order(&all);
        let target = hashes[victim.index(hashes.len())];
        all.remove(&target);
        prop_assert!(!all.contains(&target));
        prop_assert_eq!(all.heads(), heads_by_definition(&all));
    }
}

//! Building exchange-heads messages.

use crate::message::{ExchangeHeads, SyncMessage};
use crate::source::EntrySource;
use weft_log::{EntryWithRefs, Hash};

/// Split bundles into messages of at most `batch_size` bundles each.
pub fn exchange_heads_messages(bundles: Vec<EntryWithRefs>, batch_size: usize) -> Vec<SyncMessage> {
    let batch_size = batch_size.max(1);
    let mut messages = Vec::with_capacity(bundles.len().div_ceil(batch_size));
    let mut bundles = bundles.into_iter().peekable();
    while bundles.peek().is_some() {
        let heads: Vec<EntryWithRefs> = bundles.by_ref().take(batch_size).collect();
        messages.push(SyncMessage::ExchangeHeads(ExchangeHeads { heads }));
    }
    messages
}

/// Exchange-heads messages carrying the resident entries among `hashes`,
/// each with up to `max_refs` ancestors.
pub fn create_exchange_heads<S: EntrySource + ?Sized>(
    source: &S,
    hashes: &[Hash],
    max_refs: usize,
    batch_size: usize,
) -> Vec<SyncMessage> {
    exchange_heads_messages(source.entries_with_refs(hashes, max_refs), batch_size)
}

//! Shared proptest strategies for property-based testing.
//!
//! This module provides reusable strategies for generating:
//! - Shard geometries (entries per shard, last populated index, spans)
//! - Contract addresses and miner addresses
//! - Task states with partially drained sub-tasks and heal entries

use common::Address;
use proptest::prelude::*;

/// Shard geometry: `(shard_id, kv_entries, last_kv, max_span)`.
///
/// `last_kv` ranges from 0 (everything empty-filled) to well past the
/// shard's end (everything syncable).
pub fn geometry_strategy() -> impl Strategy<Value = (u64, u64, u64, u64)> {
    (0u64..6, 1u64..256, 1u64..64).prop_flat_map(|(shard_id, kv_entries, max_span)| {
        let upper = (shard_id + 2) * kv_entries;
        (
            Just(shard_id),
            Just(kv_entries),
            0..=upper,
            Just(max_span),
        )
    })
}

/// Generate a 20-byte address.
pub fn address_strategy() -> impl Strategy<Value = Address> {
    prop::array::uniform20(any::<u8>()).prop_map(Address)
}

/// Random blob content within a size range.
pub fn blob_strategy(min_size: usize, max_size: usize) -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(any::<u8>(), min_size..=max_size)
}

/// A random subset of a task's index range, used as heal entries or as the
/// accepted part of a response.
pub fn index_subset_strategy(start: u64, end: u64) -> impl Strategy<Value = Vec<u64>> {
    let len = (end - start) as usize;
    prop::collection::vec(proptest::bool::ANY, len).prop_map(move |mask| {
        mask.into_iter()
            .enumerate()
            .filter(|(_, keep)| *keep)
            .map(|(i, _)| start + i as u64)
            .collect()
    })
}

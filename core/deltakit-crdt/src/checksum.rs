//! Checksum helpers shared by the per-CRDT `checksums()` implementations.

use deltakit_types::{Clock, Packable, StateUpdate};

/// Crc32 over the concatenation of the given blobs in sorted order.
///
/// Sorting first makes the digest a function of the blob multiset, not of
/// iteration order, so replicas that hold the same deltas agree.
pub(crate) fn crc_over_sorted(mut blobs: Vec<Vec<u8>>) -> u32 {
    blobs.sort();
    let mut hasher = crc32fast::Hasher::new();
    for blob in &blobs {
        hasher.update(blob);
    }
    hasher.finalize()
}

/// Crc32 over a sorted set of packed state updates.
pub(crate) fn crc_over_updates<T: Packable>(updates: &[StateUpdate<T>]) -> u32 {
    crc_over_sorted(updates.iter().map(Packable::pack).collect())
}

/// True iff `ts` falls inside the optional `[from_ts, until_ts]` window
/// under clock `C`'s order. Updates concurrent with a bound are included,
/// matching the history-filter contract.
pub(crate) fn in_range<C: Clock>(
    ts: &C::Timestamp,
    from_ts: Option<&C::Timestamp>,
    until_ts: Option<&C::Timestamp>,
) -> bool {
    if let Some(from) = from_ts {
        if C::is_later(from, ts) {
            return false;
        }
    }
    if let Some(until) = until_ts {
        if C::is_later(ts, until) {
            return false;
        }
    }
    true
}

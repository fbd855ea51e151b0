//! Merkle-tree history synchronization.
//!
//! Each state update is content-addressed by the sha256 of its canonical
//! bytes; the root is the sha256 of the sorted leaf ids concatenated. Two
//! replicas compare roots in O(1), exchange leaf-id lists only when the
//! roots differ, and then request exactly the packed deltas they are
//! missing.

use crate::checksum::crc_over_sorted;
use deltakit_types::{CrdtError, CrdtResult, Packable, StateUpdate};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use tracing::debug;

const DIGEST_LEN: usize = 32;

/// Content-addressed rendering of a CRDT's update history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MerkleHistory {
    /// sha256 over the concatenation of the sorted leaf ids.
    pub root: Vec<u8>,
    /// Sorted sha256 content ids, one per history update.
    pub leaf_ids: Vec<Vec<u8>>,
    /// Content id to packed update, for serving peers' requests.
    pub leaves: BTreeMap<Vec<u8>, Vec<u8>>,
}

impl MerkleHistory {
    /// Returns the packed update for a content id, if present.
    pub fn leaf(&self, id: &[u8]) -> Option<&[u8]> {
        self.leaves.get(id).map(Vec::as_slice)
    }

    /// Crc32 fingerprint of the leaf set, usable as a cheap checksum entry.
    pub fn crc(&self) -> u32 {
        crc_over_sorted(self.leaf_ids.clone())
    }
}

fn sha256(data: &[u8]) -> Vec<u8> {
    Sha256::digest(data).to_vec()
}

/// Builds the Merkle history for a set of updates.
pub(crate) fn build_history<T: Packable>(updates: &[StateUpdate<T>]) -> MerkleHistory {
    let mut leaves = BTreeMap::new();
    for update in updates {
        let packed = update.pack();
        leaves.insert(sha256(&packed), packed);
    }
    let leaf_ids: Vec<Vec<u8>> = leaves.keys().cloned().collect();
    let mut concat = Vec::with_capacity(leaf_ids.len() * DIGEST_LEN);
    for id in &leaf_ids {
        concat.extend_from_slice(id);
    }
    MerkleHistory {
        root: sha256(&concat),
        leaf_ids,
        leaves,
    }
}

/// Returns the peer leaves missing locally, or an empty list when the roots
/// already agree.
pub(crate) fn resolve(
    local: &MerkleHistory,
    peer_root: &[u8],
    peer_leaf_ids: &[Vec<u8>],
) -> CrdtResult<Vec<Vec<u8>>> {
    if peer_root.len() != DIGEST_LEN {
        return Err(CrdtError::Value(format!(
            "merkle root must be {DIGEST_LEN} bytes, got {}",
            peer_root.len()
        )));
    }
    if let Some(bad) = peer_leaf_ids.iter().find(|id| id.len() != DIGEST_LEN) {
        return Err(CrdtError::Value(format!(
            "merkle leaf id must be {DIGEST_LEN} bytes, got {}",
            bad.len()
        )));
    }
    if local.root == peer_root {
        return Ok(Vec::new());
    }
    let missing: Vec<Vec<u8>> = peer_leaf_ids
        .iter()
        .filter(|id| !local.leaves.contains_key(*id))
        .cloned()
        .collect();
    debug!(
        local_leaves = local.leaf_ids.len(),
        peer_leaves = peer_leaf_ids.len(),
        missing = missing.len(),
        "resolved merkle histories"
    );
    Ok(missing)
}

// Shared primitives for the mockroute workspace
pub mod dht_messages;
pub mod identity;
pub mod keys;
pub mod metrics;

use std::cmp::Ordering;

use sha1::{Digest, Sha1};

use dht_messages::{Key, NodeId, ID_LEN};

/// Number of bits in the ID space (SHA-1 produces a 160-bit hash).
pub const ID_BITS: usize = ID_LEN * 8;

/// Hashes arbitrary key material into the DHT key space.
pub fn key_for(data: &[u8]) -> Key {
    let mut hasher = Sha1::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// XOR distance between two IDs.
pub fn xor_distance(a: &NodeId, b: &NodeId) -> NodeId {
    let mut out = [0u8; ID_LEN];
    for (o, (x, y)) in out.iter_mut().zip(a.iter().zip(b.iter())) {
        *o = x ^ y;
    }
    out
}

/// Orders `a` and `b` by their XOR distance to `target`.
pub fn distance_cmp(target: &NodeId, a: &NodeId, b: &NodeId) -> Ordering {
    xor_distance(a, target).cmp(&xor_distance(b, target))
}

// Index of the most significant differing bit, counted from the least
// significant end so that bucket 0 holds the closest peers.
// Returns `None` when the IDs are identical.
pub fn bucket_index(local: &NodeId, other: &NodeId) -> Option<usize> {
    let distance = xor_distance(local, other);
    for (byte_idx, byte) in distance.iter().enumerate() {
        if *byte != 0 {
            let leading = byte_idx * 8 + byte.leading_zeros() as usize;
            return Some(ID_BITS - 1 - leading);
        }
    }
    None
}

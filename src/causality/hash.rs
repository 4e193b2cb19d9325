//! Rolling Merkle hash chain over stream histories.
//!
//! Each event occurrence stores `chain_i = H(chain_{i-1} || leaf_i)`, so a
//! stream's hash is O(1) to read (the last chain value) and O(1) to extend.
//! A branched stream seeds its chain with the parent's chain at the
//! divergence version, which makes equal logical histories hash equally in
//! every timeline.
//!
//! # Properties
//!
//! - Changing any leaf changes every chain value from that position on.
//! - Folding the same leaf sequence twice yields the same hash.
//! - Hash format: `blake3:<lowercase hex>`.

use crate::message::ContentHash;

const CHAIN_CONTEXT: &str = "kyrolog 2024 stream hash chain v1";

/// Extends `prev` with one leaf.
#[must_use]
pub fn chain_hash(prev: &ContentHash, leaf: &ContentHash) -> ContentHash {
    let mut hasher = blake3::Hasher::new_derive_key(CHAIN_CONTEXT);
    hasher.update(prev.as_bytes());
    hasher.update(leaf.as_bytes());
    hasher.finalize().into()
}

/// Folds `leaves` onto `seed`, returning every intermediate chain value.
#[must_use]
pub fn chain_all<'a>(
    seed: ContentHash,
    leaves: impl IntoIterator<Item = &'a ContentHash>,
) -> Vec<ContentHash> {
    let mut prev = seed;
    leaves
        .into_iter()
        .map(|leaf| {
            prev = chain_hash(&prev, leaf);
            prev
        })
        .collect()
}

/// Hash of a full history: the last chain value, or `seed` if empty.
#[must_use]
pub fn stream_hash<'a>(
    seed: ContentHash,
    leaves: impl IntoIterator<Item = &'a ContentHash>,
) -> ContentHash {
    leaves
        .into_iter()
        .fold(seed, |prev, leaf| chain_hash(&prev, leaf))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn leaf(n: u8) -> ContentHash {
        ContentHash::from(blake3::hash(&[n]))
    }

    #[test]
    fn test_empty_history_hashes_to_seed() {
        assert_eq!(stream_hash(ContentHash::ZERO, &[]), ContentHash::ZERO);
    }

    #[test]
    fn test_chain_all_matches_stream_hash() {
        let leaves = [leaf(1), leaf(2), leaf(3)];
        let chain = chain_all(ContentHash::ZERO, &leaves);
        assert_eq!(chain.len(), 3);
        assert_eq!(chain[2], stream_hash(ContentHash::ZERO, &leaves));
    }

    #[test]
    fn test_seeded_suffix_equals_full_history() {
        let leaves = [leaf(1), leaf(2), leaf(3), leaf(4)];
        let prefix = stream_hash(ContentHash::ZERO, &leaves[..2]);
        assert_eq!(
            stream_hash(prefix, &leaves[2..]),
            stream_hash(ContentHash::ZERO, &leaves)
        );
    }

    #[test]
    fn test_order_matters() {
        assert_ne!(
            stream_hash(ContentHash::ZERO, &[leaf(1), leaf(2)]),
            stream_hash(ContentHash::ZERO, &[leaf(2), leaf(1)])
        );
    }

    proptest! {
        #[test]
        fn prop_any_leaf_change_changes_hash(
            bytes in proptest::collection::vec(any::<u8>(), 1..24),
            index in any::<prop::sample::Index>(),
            replacement in any::<u8>(),
        ) {
            let leaves: Vec<ContentHash> = bytes.iter().map(|b| leaf(*b)).collect();
            let i = index.index(leaves.len());
            prop_assume!(bytes[i] != replacement);
            let mut changed = leaves.clone();
            changed[i] = leaf(replacement);
            prop_assert_ne!(
                stream_hash(ContentHash::ZERO, &leaves),
                stream_hash(ContentHash::ZERO, &changed)
            );
        }

        #[test]
        fn prop_hash_is_deterministic(bytes in proptest::collection::vec(any::<u8>(), 0..24)) {
            let leaves: Vec<ContentHash> = bytes.iter().map(|b| leaf(*b)).collect();
            prop_assert_eq!(
                stream_hash(ContentHash::ZERO, &leaves),
                stream_hash(ContentHash::ZERO, &leaves)
            );
        }
    }
}

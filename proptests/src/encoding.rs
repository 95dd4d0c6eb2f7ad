//! Property-based tests for slot masking and commitment flags.
//!
//! Tests the following invariants:
//! - EN-1: Keccak masking is an involution (mask twice = identity) and the
//!   `None` encoding is the identity.
//! - EN-2: The keystream is specific to the slot and the miner, so two
//!   slots never share a mask.
//! - EN-3: Commitment construction truncates the root and carries the
//!   empty-filling flag faithfully.
//! - EN-4: The chunk merkle root treats a short blob exactly like its
//!   zero-padded form.

use crate::strategies::*;
use common::{chunk_root, Commitment, EncodingKind, HASH_SIZE_IN_CONTRACT};
use proptest::prelude::*;
use sync::memstore::mask_blob;

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    /// EN-1: mask(mask(x)) == x for the keccak encoding.
    #[test]
    fn prop_keccak_mask_is_involution(
        data in blob_strategy(0, 4096),
        miner in address_strategy(),
        kv_index: u64,
    ) {
        let masked = mask_blob(kv_index, &data, miner, EncodingKind::Keccak256).unwrap();
        let unmasked = mask_blob(kv_index, &masked, miner, EncodingKind::Keccak256).unwrap();
        prop_assert_eq!(unmasked, data);
    }

    /// EN-1: the `None` encoding never changes the bytes.
    #[test]
    fn prop_none_encoding_is_identity(
        data in blob_strategy(0, 4096),
        miner in address_strategy(),
        kv_index: u64,
    ) {
        let encoded = mask_blob(kv_index, &data, miner, EncodingKind::None).unwrap();
        prop_assert_eq!(encoded, data);
    }

    /// EN-2: distinct slots produce distinct masks for the same content.
    #[test]
    fn prop_mask_is_slot_specific(
        data in blob_strategy(32, 1024),
        miner in address_strategy(),
        kv_index in 0u64..u64::MAX - 1,
    ) {
        let a = mask_blob(kv_index, &data, miner, EncodingKind::Keccak256).unwrap();
        let b = mask_blob(kv_index + 1, &data, miner, EncodingKind::Keccak256).unwrap();
        prop_assert_ne!(a, b);
    }

    /// EN-3: commitment flag and truncated root round-trip.
    #[test]
    fn prop_commitment_flags(
        root in prop::array::uniform32(any::<u8>()),
        empty: bool,
    ) {
        let commit = Commitment::from_root(&root, empty);
        prop_assert_eq!(commit.is_empty_marker(), empty);
        prop_assert!(commit.matches_root(&root));
        prop_assert_eq!(commit.root_part(), &root[..HASH_SIZE_IN_CONTRACT]);

        // Bytes past the truncation point never influence the match.
        let mut tail_flip = root;
        tail_flip[31] ^= 0xFF;
        prop_assert!(commit.matches_root(&tail_flip));
    }

    /// EN-4: a short blob hashes like its zero-padded form.
    #[test]
    fn prop_chunk_root_zero_extends(
        data in blob_strategy(0, 2048),
        chunks in 1u64..8,
    ) {
        let chunk_size = 512u64;
        let mut padded = data.clone();
        padded.resize((chunks * chunk_size) as usize, 0);
        prop_assert_eq!(
            chunk_root(&data, chunks, chunk_size),
            chunk_root(&padded, chunks, chunk_size)
        );
    }
}

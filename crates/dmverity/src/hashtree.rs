//! Size of a dm-verity hash device, computed from its superblock.
//!
//! `veritysetup format` writes a hash device consisting of one hash-block
//! sized slot for the superblock followed by every level of the Merkle tree.
//! Newer versions of `veritysetup` print that size, but older ones don't, so
//! we work it out from the superblock ourselves.  The result is what the hash
//! partition can be shrunk to after formatting.

use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::{
    algorithm::{HashAlgorithm, UnknownAlgorithmError},
    superblock::{read_verity_superblock, SuperblockError, VeritySuperblock, SIGNATURE},
};

/// A superblock or the tree geometry it describes is unusable.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum HashTreeError {
    #[error("wrong superblock signature")]
    InvalidSignature,
    #[error("unsupported version ({0})")]
    UnsupportedVersion(u32),
    #[error("unsupported hash type ({0})")]
    UnsupportedHashType(u32),
    #[error(transparent)]
    UnknownAlgorithm(#[from] UnknownAlgorithmError),
    #[error("invalid data block size ({0})")]
    InvalidBlockSize(u32),
    #[error("invalid hash block size ({0})")]
    InvalidHashBlockSize(u32),
    #[error("hash tree size overflows ({blocks} blocks of {hash_block_size} bytes)")]
    SizeOverflow { blocks: u64, hash_block_size: u32 },
}

/// Working out the size of a hash partition failed.
#[derive(Error, Debug)]
pub enum HashSizeError {
    #[error(transparent)]
    Superblock(#[from] SuperblockError),
    #[error("hash partition's ({}) superblock is invalid", .path.display())]
    Invalid {
        path: PathBuf,
        #[source]
        source: HashTreeError,
    },
}

/// Checks the superblock header fields and resolves its digest algorithm.
///
/// Returns the algorithm together with its digest size in bytes.
pub fn validate_superblock(
    superblock: &VeritySuperblock,
) -> Result<(HashAlgorithm, u32), HashTreeError> {
    if superblock.signature != SIGNATURE {
        return Err(HashTreeError::InvalidSignature);
    }

    if superblock.version() != 1 {
        return Err(HashTreeError::UnsupportedVersion(superblock.version()));
    }

    if superblock.hash_type() != 1 {
        return Err(HashTreeError::UnsupportedHashType(superblock.hash_type()));
    }

    let algorithm = HashAlgorithm::parse(&superblock.algorithm_name())?;
    Ok((algorithm, algorithm.digest_size()))
}

/// Rounds `n` up to the next power of two (`n` itself if it already is one).
///
/// Zero rounds up to one.
pub fn round_up_to_power_of_two(n: u32) -> u32 {
    let mut res = 1u32;
    while res < n {
        res *= 2;
    }
    res
}

/// Computes the on-disk size in bytes of a verity hash device.
///
/// This covers every level of the Merkle tree over `data_blocks` blocks plus
/// the one hash block taken up by the superblock.  Each level holds one
/// digest per block of the level below, where every digest is padded to a
/// power-of-two slot.  The walk stops once a level fits in a single block;
/// that block is what the root hash is computed over.
pub fn compute_tree_size(
    data_blocks: u64,
    data_block_size: u32,
    hash_block_size: u32,
    digest_size: u32,
) -> Result<u64, HashTreeError> {
    if !data_block_size.is_power_of_two() {
        return Err(HashTreeError::InvalidBlockSize(data_block_size));
    }

    if !hash_block_size.is_power_of_two() || hash_block_size < digest_size {
        return Err(HashTreeError::InvalidHashBlockSize(hash_block_size));
    }

    // dm-verity pads each digest up to a power of two to keep the addressing simple.
    let hash_size_full = round_up_to_power_of_two(digest_size);
    let hashes_per_block = u64::from(hash_block_size / hash_size_full);
    // one digest per block never converges on a single root block
    if hashes_per_block < 2 {
        return Err(HashTreeError::InvalidHashBlockSize(hash_block_size));
    }

    let mut total_tree_blocks = 0u64;
    let mut prev_level_blocks = data_blocks;
    loop {
        let level_blocks = prev_level_blocks.div_ceil(hashes_per_block);
        total_tree_blocks = total_tree_blocks.saturating_add(level_blocks);
        prev_level_blocks = level_blocks;

        if prev_level_blocks <= 1 {
            break;
        }
    }

    // add the superblock
    let total_blocks = total_tree_blocks.saturating_add(1);
    total_blocks
        .checked_mul(u64::from(hash_block_size))
        .ok_or(HashTreeError::SizeOverflow {
            blocks: total_blocks,
            hash_block_size,
        })
}

/// Computes the hash device size described by an already-read superblock.
pub fn hash_file_size_from_superblock(superblock: &VeritySuperblock) -> Result<u64, HashTreeError> {
    let (_, digest_size) = validate_superblock(superblock)?;
    compute_tree_size(
        superblock.data_blocks(),
        superblock.data_block_size(),
        superblock.hash_block_size(),
        digest_size,
    )
}

/// Computes the number of bytes a formatted hash partition actually needs.
///
/// The superblock is read from the start of `hash_partition_path`.
pub fn calculate_hash_file_size_in_bytes(
    hash_partition_path: impl AsRef<Path>,
) -> Result<u64, HashSizeError> {
    let path = hash_partition_path.as_ref();
    let superblock = read_verity_superblock(path)?;

    hash_file_size_from_superblock(&superblock).map_err(|source| HashSizeError::Invalid {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use similar_asserts::assert_eq;

    use super::*;
    use crate::test::{superblock_bytes, tempfile_with};

    fn superblock(algorithm: &str, data_blocks: u64) -> VeritySuperblock {
        VeritySuperblock::from_prefix(&superblock_bytes(algorithm, 4096, 4096, data_blocks))
            .unwrap()
    }

    #[test]
    fn test_single_data_block() {
        // one tree block holding the single digest, plus the superblock
        assert_eq!(compute_tree_size(1, 4096, 4096, 32).unwrap(), 8192);
    }

    #[test]
    fn test_two_levels() {
        // 128 digests per block: ceil(1000 / 128) = 8, then ceil(8 / 128) = 1
        assert_eq!(compute_tree_size(1000, 4096, 4096, 32).unwrap(), 40960);
    }

    #[test]
    fn test_exact_multiple() {
        // 128 * 128 data blocks: 128 leaf blocks, 1 root block, no rounding anywhere
        assert_eq!(
            compute_tree_size(128 * 128, 4096, 4096, 32).unwrap(),
            (128 + 1 + 1) * 4096
        );
        // one more data block needs another leaf block and a middle level
        assert_eq!(
            compute_tree_size(128 * 128 + 1, 4096, 4096, 32).unwrap(),
            (129 + 2 + 1 + 1) * 4096
        );
    }

    #[test]
    fn test_exactly_one_block_of_hashes() {
        assert_eq!(compute_tree_size(128, 4096, 4096, 32).unwrap(), 2 * 4096);
        assert_eq!(compute_tree_size(129, 4096, 4096, 32).unwrap(), 4 * 4096);
    }

    #[test]
    fn test_padded_digests() {
        // sha384 digests take a 64 byte slot, same as sha512
        assert_eq!(
            compute_tree_size(1000, 4096, 4096, 48).unwrap(),
            compute_tree_size(1000, 4096, 4096, 64).unwrap()
        );
        // 64 per block: ceil(1000 / 64) = 16, then 1
        assert_eq!(compute_tree_size(1000, 4096, 4096, 64).unwrap(), 18 * 4096);
    }

    #[test]
    fn test_small_hash_blocks() {
        // 512 byte hash blocks hold 16 sha256 digests: 63 -> 4 -> 1
        assert_eq!(compute_tree_size(1000, 4096, 512, 32).unwrap(), 69 * 512);
        // 64 byte hash blocks hold 2 sha256 digests: 2 -> 1
        assert_eq!(compute_tree_size(3, 4096, 64, 32).unwrap(), 4 * 64);
    }

    #[test]
    fn test_zero_data_blocks() {
        assert_eq!(compute_tree_size(0, 4096, 4096, 32).unwrap(), 4096);
    }

    #[test]
    fn test_round_up_to_power_of_two() {
        assert_eq!(round_up_to_power_of_two(0), 1);
        assert_eq!(round_up_to_power_of_two(1), 1);
        assert_eq!(round_up_to_power_of_two(20), 32);
        assert_eq!(round_up_to_power_of_two(32), 32);
        assert_eq!(round_up_to_power_of_two(33), 64);
        assert_eq!(round_up_to_power_of_two(48), 64);
        assert_eq!(round_up_to_power_of_two(64), 64);
    }

    #[test]
    fn test_block_size_validation() {
        assert_eq!(
            compute_tree_size(1, 4097, 4096, 32).unwrap_err(),
            HashTreeError::InvalidBlockSize(4097)
        );
        assert_eq!(
            compute_tree_size(1, 0, 4096, 32).unwrap_err(),
            HashTreeError::InvalidBlockSize(0)
        );
        assert_eq!(
            compute_tree_size(1, 4096, 4097, 32).unwrap_err(),
            HashTreeError::InvalidHashBlockSize(4097)
        );
        assert_eq!(
            compute_tree_size(1, 4096, 0, 32).unwrap_err(),
            HashTreeError::InvalidHashBlockSize(0)
        );
        // power of two, but can't hold a single digest
        assert_eq!(
            compute_tree_size(1, 4096, 32, 64).unwrap_err(),
            HashTreeError::InvalidHashBlockSize(32)
        );
        // holds exactly one digest, so the tree would never narrow
        assert_eq!(
            compute_tree_size(3, 4096, 64, 48).unwrap_err(),
            HashTreeError::InvalidHashBlockSize(64)
        );
        assert!(compute_tree_size(1, 4096, 4096, 32).is_ok());
    }

    #[test]
    fn test_overflow() {
        assert!(matches!(
            compute_tree_size(u64::MAX, 4096, 4096, 32).unwrap_err(),
            HashTreeError::SizeOverflow { .. }
        ));
    }

    #[test]
    fn test_validate_superblock() {
        for (name, size) in [("sha256", 32), ("sha384", 48), ("sha512", 64)] {
            let (algorithm, digest_size) = validate_superblock(&superblock(name, 1)).unwrap();
            assert_eq!(algorithm.name(), name);
            assert_eq!(digest_size, size);
        }
    }

    #[test]
    fn test_validate_bad_signature() {
        let mut sb = superblock("sha256", 1);
        sb.signature = *b"verity\0\x01";
        assert_eq!(
            validate_superblock(&sb).unwrap_err(),
            HashTreeError::InvalidSignature
        );

        sb.signature = [0; 8];
        assert_eq!(
            hash_file_size_from_superblock(&sb).unwrap_err(),
            HashTreeError::InvalidSignature
        );
    }

    #[test]
    fn test_validate_version_and_type() {
        let mut sb = superblock("sha256", 1);
        sb.version = zerocopy::little_endian::U32::new(2);
        assert_eq!(
            validate_superblock(&sb).unwrap_err(),
            HashTreeError::UnsupportedVersion(2)
        );

        let mut sb = superblock("sha256", 1);
        // Chrome OS layout
        sb.hash_type = zerocopy::little_endian::U32::new(0);
        assert_eq!(
            validate_superblock(&sb).unwrap_err(),
            HashTreeError::UnsupportedHashType(0)
        );
    }

    #[test]
    fn test_validate_unknown_algorithm() {
        assert_eq!(
            validate_superblock(&superblock("md5", 1)).unwrap_err(),
            HashTreeError::UnknownAlgorithm(UnknownAlgorithmError("md5".into()))
        );
    }

    #[test]
    fn test_calculate_from_device() {
        let file = tempfile_with(&superblock_bytes("sha256", 4096, 4096, 1000));
        assert_eq!(calculate_hash_file_size_in_bytes(file.path()).unwrap(), 40960);
    }

    #[test]
    fn test_calculate_invalid_device() {
        let mut bytes = superblock_bytes("sha256", 4096, 4096, 1000);
        bytes[0] = b'V';
        let file = tempfile_with(&bytes);

        let err = calculate_hash_file_size_in_bytes(file.path()).unwrap_err();
        let HashSizeError::Invalid { path, source } = &err else {
            panic!("expected an invalid superblock, got {err:?}");
        };
        assert_eq!(path, file.path());
        assert_eq!(*source, HashTreeError::InvalidSignature);
    }

    #[test]
    fn test_calculate_truncated_device() {
        let bytes = superblock_bytes("sha256", 4096, 4096, 1000);
        let file = tempfile_with(&bytes[..200]);
        assert!(matches!(
            calculate_hash_file_size_in_bytes(file.path()).unwrap_err(),
            HashSizeError::Superblock(SuperblockError::Read { .. })
        ));
    }

    fn block_size() -> impl Strategy<Value = u32> {
        (9u32..=16).prop_map(|bits| 1 << bits)
    }

    fn digest_size() -> impl Strategy<Value = u32> {
        prop_oneof![Just(32u32), Just(48), Just(64)]
    }

    proptest! {
        #[test]
        fn prop_at_least_superblock(
            data_blocks in 1u64..(1 << 40),
            data_block_size in block_size(),
            hash_block_size in block_size(),
            digest_size in digest_size(),
        ) {
            let size = compute_tree_size(data_blocks, data_block_size, hash_block_size, digest_size).unwrap();
            // superblock plus at least one tree block
            prop_assert!(size >= 2 * u64::from(hash_block_size));
            prop_assert_eq!(size % u64::from(hash_block_size), 0);
        }

        #[test]
        fn prop_monotonic_in_data_blocks(
            data_blocks in 1u64..(1 << 40),
            extra in 0u64..(1 << 20),
            data_block_size in block_size(),
            hash_block_size in block_size(),
            digest_size in digest_size(),
        ) {
            let smaller = compute_tree_size(data_blocks, data_block_size, hash_block_size, digest_size).unwrap();
            let larger = compute_tree_size(data_blocks + extra, data_block_size, hash_block_size, digest_size).unwrap();
            prop_assert!(smaller <= larger);
        }
    }
}

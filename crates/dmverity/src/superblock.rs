//! The on-disk dm-verity superblock.
//!
//! `veritysetup format` writes a 512 byte little-endian header at the start
//! of the hash device, followed (after padding to one hash block) by the
//! Merkle tree itself.  This module only deserializes that header; checking
//! that its values make sense is the job of [`crate::hashtree`].
//!
//! See <https://gitlab.com/cryptsetup/cryptsetup/-/wikis/DMVerity>

use std::{
    fmt,
    fs::File,
    io::{self, Read},
    path::{Path, PathBuf},
};

use thiserror::Error;
use zerocopy::{
    little_endian::{U16, U32, U64},
    FromBytes, Immutable, IntoBytes, KnownLayout,
};

/// Size of the superblock on disk.
pub const SUPERBLOCK_SIZE: usize = 512;

/// The magic at offset 0.
pub const SIGNATURE: [u8; 8] = *b"verity\0\0";

/// Reading a superblock from a hash device failed.
#[derive(Error, Debug)]
pub enum SuperblockError {
    #[error("failed to open hash partition ({}) block device", .path.display())]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to read hash partition's ({}) superblock", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("superblock needs {SUPERBLOCK_SIZE} bytes, got {0}")]
    Truncated(usize),
}

/// The superblock header as laid out on disk.
///
/// All integers are stored little-endian; use the accessor methods to get
/// native values.
#[derive(Clone, FromBytes, Immutable, IntoBytes, KnownLayout, PartialEq, Eq)]
#[repr(C)]
pub struct VeritySuperblock {
    /// "verity\0\0"
    pub signature: [u8; 8],
    /// superblock version: 1
    pub version: U32,
    /// 0: Chrome OS, 1: normal
    pub hash_type: U32,
    /// UUID of hash device
    pub uuid: [u8; 16],
    /// hash algorithm name
    pub algorithm: [u8; 32],
    /// data block in bytes
    pub data_block_size: U32,
    /// hash block in bytes
    pub hash_block_size: U32,
    /// number of data blocks
    pub data_blocks: U64,
    /// salt size
    pub salt_size: U16,
    pub pad1: [u8; 6],
    pub salt: [u8; 256],
    pub pad2: [u8; 168],
}

impl VeritySuperblock {
    /// Deserialize a superblock from the start of `bytes`.
    ///
    /// Anything past the first [`SUPERBLOCK_SIZE`] bytes is ignored.
    pub fn from_prefix(bytes: &[u8]) -> Result<Self, SuperblockError> {
        match Self::read_from_prefix(bytes) {
            Ok((superblock, _rest)) => Ok(superblock),
            Err(_) => Err(SuperblockError::Truncated(bytes.len())),
        }
    }

    pub fn version(&self) -> u32 {
        self.version.get()
    }

    pub fn hash_type(&self) -> u32 {
        self.hash_type.get()
    }

    pub fn data_block_size(&self) -> u32 {
        self.data_block_size.get()
    }

    pub fn hash_block_size(&self) -> u32 {
        self.hash_block_size.get()
    }

    pub fn data_blocks(&self) -> u64 {
        self.data_blocks.get()
    }

    pub fn salt_size(&self) -> u16 {
        self.salt_size.get()
    }

    /// The algorithm name, up to the first NUL.
    ///
    /// Non-UTF-8 bytes are replaced, which can only ever fail the algorithm
    /// lookup.
    pub fn algorithm_name(&self) -> String {
        let end = self
            .algorithm
            .iter()
            .position(|&c| c == 0)
            .unwrap_or(self.algorithm.len());
        String::from_utf8_lossy(&self.algorithm[..end]).into_owned()
    }

    /// The salt bytes, clamped to the on-disk salt field.
    pub fn salt(&self) -> &[u8] {
        let len = usize::from(self.salt_size()).min(self.salt.len());
        &self.salt[..len]
    }
}

impl fmt::Debug for VeritySuperblock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VeritySuperblock")
            .field("signature", &String::from_utf8_lossy(&self.signature))
            .field("version", &self.version())
            .field("hash_type", &self.hash_type())
            .field("uuid", &hex::encode(self.uuid))
            .field("algorithm", &self.algorithm_name())
            .field("data_block_size", &self.data_block_size())
            .field("hash_block_size", &self.hash_block_size())
            .field("data_blocks", &self.data_blocks())
            .field("salt", &hex::encode(self.salt()))
            .finish()
    }
}

/// Reads the superblock at the start of a hash partition.
///
/// The device is opened read-only and closed again before returning, on
/// every path.  No validation is performed on the values.
pub fn read_verity_superblock(
    hash_partition_path: impl AsRef<Path>,
) -> Result<VeritySuperblock, SuperblockError> {
    let path = hash_partition_path.as_ref();
    let mut file = File::open(path).map_err(|source| SuperblockError::Open {
        path: path.to_path_buf(),
        source,
    })?;

    let mut buffer = [0u8; SUPERBLOCK_SIZE];
    file.read_exact(&mut buffer)
        .map_err(|source| SuperblockError::Read {
            path: path.to_path_buf(),
            source,
        })?;

    VeritySuperblock::from_prefix(&buffer)
}

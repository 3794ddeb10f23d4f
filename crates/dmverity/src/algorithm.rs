//! Hash algorithm identifiers as written by `veritysetup format`.
//!
//! The verity superblock names its digest algorithm with a NUL-padded ASCII
//! string (`sha256`, `sha384`, `sha512`).  Only the digest size matters to
//! the hash-tree size calculation; nothing in this crate hashes data itself.

use std::fmt;

/// A dm-verity digest algorithm supported by this crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HashAlgorithm {
    /// SHA-256, 32 byte digests (the `veritysetup` default)
    Sha256,
    /// SHA-384, 48 byte digests
    Sha384,
    /// SHA-512, 64 byte digests
    Sha512,
}

impl HashAlgorithm {
    /// The algorithm name as it appears in the superblock.
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Sha256 => "sha256",
            Self::Sha384 => "sha384",
            Self::Sha512 => "sha512",
        }
    }

    /// The digest size in bytes for this algorithm.
    pub const fn digest_size(&self) -> u32 {
        match self {
            Self::Sha256 => 32,
            Self::Sha384 => 48,
            Self::Sha512 => 64,
        }
    }

    /// Parse the algorithm name from a superblock.
    ///
    /// # Examples
    /// ```
    /// use dmverity::algorithm::HashAlgorithm;
    /// let alg = HashAlgorithm::parse("sha384").unwrap();
    /// assert_eq!(alg.digest_size(), 48);
    /// ```
    pub fn parse(s: &str) -> Result<Self, UnknownAlgorithmError> {
        match s {
            "sha256" => Ok(Self::Sha256),
            "sha384" => Ok(Self::Sha384),
            "sha512" => Ok(Self::Sha512),
            other => Err(UnknownAlgorithmError(other.to_string())),
        }
    }
}

impl fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// The superblock names a digest algorithm this crate doesn't know.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown hash algorithm ({0})")]
pub struct UnknownAlgorithmError(pub String);

impl std::str::FromStr for HashAlgorithm {
    type Err = UnknownAlgorithmError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

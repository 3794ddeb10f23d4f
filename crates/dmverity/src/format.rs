//! Formatting verity hash partitions with `veritysetup`.
//!
//! The hash partition is usually created with plenty of slack, since the
//! final tree size is only known once the data partition's contents are.  On
//! request, the partition is shrunk to exactly what the tree needs afterwards
//! and the result is verified once more.

use std::path::{Path, PathBuf};

use log::{debug, info};
use regex_automata::meta::{BuildError, Regex};
use thiserror::Error;

use crate::{
    command::{run, BuildContext, CommandError, CommandRunner, ToolCommand, VERITYSETUP},
    disk::{DiskError, PartitionTable},
    hashtree::{calculate_hash_file_size_in_bytes, HashSizeError},
};

const ROOT_HASH_PATTERN: &str = r"Root hash:\s+([0-9a-fA-F]+)";

/// Formatting a verity device failed.
#[derive(Error, Debug)]
pub enum FormatError {
    #[error("operation cancelled")]
    Cancelled,
    #[error("invalid sector size ({0})")]
    InvalidSectorSize(u64),
    #[error("failed to calculate root hash (partition='{}')", .partition.display())]
    FormatExecution {
        partition: PathBuf,
        #[source]
        source: CommandError,
    },
    #[error("failed to compile root hash regex")]
    RootHashRegex(#[source] Box<BuildError>),
    #[error("failed to parse root hash from veritysetup output")]
    RootHashNotFound,
    #[error("failed to wait for disk to update (device='{}')", .device.display())]
    PartitionTableRefresh {
        device: PathBuf,
        #[source]
        source: DiskError,
    },
    #[error("failed to calculate hash partition size (partition='{}')", .partition.display())]
    CalculateHashSize {
        partition: PathBuf,
        #[source]
        source: HashSizeError,
    },
    #[error("failed to shrink hash partition (device='{}')", .device.display())]
    Shrink {
        device: PathBuf,
        #[source]
        source: DiskError,
    },
    #[error("failed to verify verity (partition='{}')", .partition.display())]
    PostShrinkVerification {
        partition: PathBuf,
        #[source]
        source: CommandError,
    },
}

impl FormatError {
    // cancellation is reported as such, whichever step noticed it
    fn from_command(source: CommandError, wrap: impl FnOnce(CommandError) -> Self) -> Self {
        match source {
            CommandError::Cancelled => Self::Cancelled,
            other => wrap(other),
        }
    }

    fn from_disk(source: DiskError, wrap: impl FnOnce(DiskError) -> Self) -> Self {
        match source {
            DiskError::Command(CommandError::Cancelled) => Self::Cancelled,
            other => wrap(other),
        }
    }
}

/// The block devices taking part in one format.
#[derive(Debug, Clone, Copy)]
pub struct VerityTarget<'a> {
    /// The whole disk holding both partitions.
    pub disk: &'a Path,
    pub data_partition: &'a Path,
    pub hash_partition: &'a Path,
}

/// Converts a byte count to sectors, rounding up.
///
/// # Examples
/// ```
/// use dmverity::format::convert_bytes_to_sectors;
/// assert_eq!(convert_bytes_to_sectors(40960, 512).unwrap(), 80);
/// assert_eq!(convert_bytes_to_sectors(40961, 512).unwrap(), 81);
/// ```
pub fn convert_bytes_to_sectors(bytes: u64, sector_size: u64) -> Result<u64, FormatError> {
    if sector_size == 0 {
        return Err(FormatError::InvalidSectorSize(sector_size));
    }
    Ok(bytes.div_ceil(sector_size))
}

/// Extracts the root hash from `veritysetup format` output.
///
/// The hash is returned in lowercase.
pub fn parse_root_hash(output: &str) -> Result<String, FormatError> {
    let re = Regex::new(ROOT_HASH_PATTERN).map_err(|e| FormatError::RootHashRegex(Box::new(e)))?;

    let mut caps = re.create_captures();
    re.captures(output, &mut caps);
    let span = caps.get_group(1).ok_or(FormatError::RootHashNotFound)?;

    let root_hash = output[span.range()].to_ascii_lowercase();
    // a digest is whole bytes
    hex::decode(&root_hash).map_err(|_| FormatError::RootHashNotFound)?;

    Ok(root_hash)
}

/// Writes the hash tree for `target.data_partition` to
/// `target.hash_partition` and returns the root hash.
///
/// With `shrink_hash_partition`, the hash partition's table entry is
/// reduced to the size of the tree (in `sector_size` units, rounded up) and
/// the device is verified against the root hash again.  Any failure aborts
/// the whole operation, possibly leaving a formatted but unshrunk partition
/// behind.
pub fn verity_format<R, T>(
    ctx: &BuildContext,
    runner: &R,
    table: &T,
    target: &VerityTarget<'_>,
    shrink_hash_partition: bool,
    sector_size: u64,
) -> Result<String, FormatError>
where
    R: CommandRunner + ?Sized,
    T: PartitionTable + ?Sized,
{
    if shrink_hash_partition && sector_size == 0 {
        return Err(FormatError::InvalidSectorSize(sector_size));
    }

    info!(
        "Formatting verity hash partition {}",
        target.hash_partition.display()
    );

    let output = run(
        ctx,
        runner,
        &ToolCommand::new(VERITYSETUP)
            .arg("format")
            .arg(target.data_partition)
            .arg(target.hash_partition),
    )
    .map_err(|e| {
        FormatError::from_command(e, |source| FormatError::FormatExecution {
            partition: target.data_partition.to_path_buf(),
            source,
        })
    })?;

    let root_hash = parse_root_hash(&output.stdout)?;
    debug!("root hash of {}: {root_hash}", target.data_partition.display());

    table.refresh(ctx, target.disk).map_err(|e| {
        FormatError::from_disk(e, |source| FormatError::PartitionTableRefresh {
            device: target.disk.to_path_buf(),
            source,
        })
    })?;

    if shrink_hash_partition {
        // newer veritysetup prints the size itself, but we can't rely on that yet
        let size_in_bytes =
            calculate_hash_file_size_in_bytes(target.hash_partition).map_err(|source| {
                FormatError::CalculateHashSize {
                    partition: target.hash_partition.to_path_buf(),
                    source,
                }
            })?;
        let size_in_sectors = convert_bytes_to_sectors(size_in_bytes, sector_size)?;

        info!(
            "Shrinking hash partition {} to {size_in_sectors} sectors",
            target.hash_partition.display()
        );
        table
            .resize_partition(ctx, target.hash_partition, target.disk, size_in_sectors)
            .map_err(|e| {
                FormatError::from_disk(e, |source| FormatError::Shrink {
                    device: target.disk.to_path_buf(),
                    source,
                })
            })?;

        run(
            ctx,
            runner,
            &ToolCommand::new(VERITYSETUP)
                .arg("verify")
                .arg(target.data_partition)
                .arg(target.hash_partition)
                .arg(&root_hash),
        )
        .map_err(|e| {
            FormatError::from_command(e, |source| FormatError::PostShrinkVerification {
                partition: target.data_partition.to_path_buf(),
                source,
            })
        })?;
    }

    Ok(root_hash)
}

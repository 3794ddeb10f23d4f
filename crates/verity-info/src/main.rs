//! verity-info - inspect and provision dm-verity hash partitions.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use dmverity::{
    algorithm::HashAlgorithm,
    cmdline::parse_verity_args,
    command::{BuildContext, SystemCommandRunner},
    disk::{sector_size, PartitionTable, SystemDisk},
    format::{convert_bytes_to_sectors, verity_format, VerityTarget},
    hashtree::{compute_tree_size, hash_file_size_from_superblock},
    superblock::read_verity_superblock,
};

/// Inspect and provision dm-verity hash partitions.
#[derive(Parser, Debug)]
#[command(name = "verity-info", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the superblock of a formatted hash partition.
    Superblock {
        /// Hash partition or hash file
        hash_device: PathBuf,
    },

    /// Print how many bytes of a hash partition the hash tree occupies.
    HashSize {
        /// Hash partition or hash file
        hash_device: PathBuf,
        /// Also print the size in sectors of this many bytes
        #[arg(long)]
        sector_size: Option<u64>,
    },

    /// Compute the hash device size for a given geometry.
    TreeSize {
        /// Number of data blocks
        data_blocks: u64,
        #[arg(long, default_value_t = 4096)]
        data_block_size: u32,
        #[arg(long, default_value_t = 4096)]
        hash_block_size: u32,
        /// sha256, sha384 or sha512
        #[arg(long, default_value = "sha256")]
        algorithm: String,
    },

    /// Format a data/hash partition pair and print the root hash.
    Format {
        /// The whole disk holding both partitions
        disk: PathBuf,
        data_partition: PathBuf,
        hash_partition: PathBuf,
        /// Shrink the hash partition to the size of the hash tree
        #[arg(long)]
        shrink: bool,
        /// Logical sector size of the disk (queried from the disk by default)
        #[arg(long)]
        sector_size: Option<u64>,
    },

    /// Print the verity devices described by a kernel command line.
    Cmdline {
        /// The disk whose partitions the command line refers to
        disk: PathBuf,
        /// The command line to parse (defaults to /proc/cmdline)
        #[arg(long)]
        cmdline: Option<String>,
    },
}

fn disk_sector_size(disk: &Path, given: Option<u64>) -> Result<u64> {
    match given {
        Some(size) => Ok(size),
        None => {
            let (logical, _) = sector_size(disk)?;
            Ok(u64::from(logical))
        }
    }
}

fn main() -> Result<()> {
    env_logger::init();

    let cli = Cli::parse();

    match cli.command {
        Command::Superblock { hash_device } => {
            let sb = read_verity_superblock(&hash_device)?;
            println!("Version:         {}", sb.version());
            println!("Hash type:       {}", sb.hash_type());
            println!("UUID:            {}", hex::encode(sb.uuid));
            println!("Hash algorithm:  {}", sb.algorithm_name());
            println!("Data blocks:     {}", sb.data_blocks());
            println!("Data block size: {}", sb.data_block_size());
            println!("Hash block size: {}", sb.hash_block_size());
            println!("Salt:            {}", hex::encode(sb.salt()));
        }
        Command::HashSize {
            hash_device,
            sector_size,
        } => {
            let sb = read_verity_superblock(&hash_device)?;
            let bytes = hash_file_size_from_superblock(&sb)
                .with_context(|| format!("Invalid superblock on {}", hash_device.display()))?;
            match sector_size {
                Some(sector_size) => {
                    let sectors = convert_bytes_to_sectors(bytes, sector_size)?;
                    println!("{bytes} bytes, {sectors} sectors of {sector_size} bytes");
                }
                None => println!("{bytes}"),
            }
        }
        Command::TreeSize {
            data_blocks,
            data_block_size,
            hash_block_size,
            algorithm,
        } => {
            let algorithm = HashAlgorithm::parse(&algorithm)?;
            let bytes = compute_tree_size(
                data_blocks,
                data_block_size,
                hash_block_size,
                algorithm.digest_size(),
            )?;
            println!("{bytes}");
        }
        Command::Format {
            disk,
            data_partition,
            hash_partition,
            shrink,
            sector_size,
        } => {
            let sector_size = match shrink {
                true => disk_sector_size(&disk, sector_size)?,
                false => sector_size.unwrap_or_default(),
            };
            let ctx = BuildContext::new();
            let table = SystemDisk::new(SystemCommandRunner);
            let target = VerityTarget {
                disk: &disk,
                data_partition: &data_partition,
                hash_partition: &hash_partition,
            };
            let root_hash = verity_format(
                &ctx,
                &SystemCommandRunner,
                &table,
                &target,
                shrink,
                sector_size,
            )
            .with_context(|| format!("Failed to format {}", data_partition.display()))?;
            println!("{root_hash}");
        }
        Command::Cmdline { disk, cmdline } => {
            let cmdline = match cmdline {
                Some(cmdline) => cmdline,
                None => std::fs::read_to_string("/proc/cmdline")
                    .context("Reading /proc/cmdline")?,
            };
            let ctx = BuildContext::new();
            let partitions = SystemDisk::new(SystemCommandRunner).partitions(&ctx, &disk)?;
            for device in parse_verity_args(cmdline.trim(), &partitions)? {
                println!(
                    "{} data={} hash={} roothash={} options={}",
                    device.name,
                    device.data_partition_uuid,
                    device.hash_partition_uuid,
                    device.root_hash,
                    device.systemd_options(),
                );
            }
        }
    }

    Ok(())
}

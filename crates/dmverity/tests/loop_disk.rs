//! Formatting verity partitions of a real disk image.
//!
//! The image is attached as a partitioned loop device, so these tests only
//! do something when run as root.

use std::{fs::OpenOptions, path::Path};

use anyhow::{ensure, Context, Result};
use similar_asserts::assert_eq;
use tempfile::NamedTempFile;

use dmverity::{
    command::{run, BuildContext, SystemCommandRunner, ToolCommand, SFDISK, VERITYSETUP},
    disk::{find_by_part_label, PartitionInfo, PartitionTable, SystemDisk},
    format::{convert_bytes_to_sectors, verity_format, VerityTarget},
    hashtree::calculate_hash_file_size_in_bytes,
    metadata::{CorruptionOption, MountIdType},
    provision::{provision_verity, KernelArgs, PartitionRef, ProvisionRequest, VerityConfig},
};
use dmverity_ioctls::loop_device::{attach_partitioned, LoopDevice};

const SECTOR_SIZE: u64 = 512;
const HASH_PARTITION_SIZE: u64 = 16 << 20;

/// A 64MiB GPT image with a 32MiB `rootfs` and a 16MiB `roothash`
/// partition.
fn partitioned_image(ctx: &BuildContext) -> Result<(NamedTempFile, LoopDevice)> {
    let image = NamedTempFile::new()?;
    image.as_file().set_len(64 << 20)?;

    run(
        ctx,
        &SystemCommandRunner,
        &ToolCommand::new(SFDISK)
            .arg("--quiet")
            .arg(image.path())
            .stdin("label: gpt\nsize=32MiB, name=rootfs\nsize=16MiB, name=roothash\n"),
    )?;

    let backing = OpenOptions::new()
        .read(true)
        .write(true)
        .open(image.path())?;
    let device = attach_partitioned(&backing).context("Attaching loop device")?;

    // wait for the partition nodes
    SystemDisk::new(SystemCommandRunner).refresh(ctx, device.path())?;

    Ok((image, device))
}

fn partition<'a>(partitions: &'a [PartitionInfo], label: &str) -> Result<&'a PartitionInfo> {
    find_by_part_label(partitions, label).with_context(|| format!("No partition {label}"))
}

fn verify(ctx: &BuildContext, data: &Path, hash: &Path, root_hash: &str) -> Result<()> {
    run(
        ctx,
        &SystemCommandRunner,
        &ToolCommand::new(VERITYSETUP)
            .arg("verify")
            .arg(data)
            .arg(hash)
            .arg(root_hash),
    )?;
    Ok(())
}

#[test_with::executable(veritysetup)]
#[test]
fn test_format_and_shrink() -> Result<()> {
    if !rustix::process::getuid().is_root() {
        eprintln!("skipping, loop devices need root");
        return Ok(());
    }

    let ctx = BuildContext::new();
    let (_image, device) = partitioned_image(&ctx)?;
    let table = SystemDisk::new(SystemCommandRunner);

    let data = device.partition_path(1);
    let hash = device.partition_path(2);
    let target = VerityTarget {
        disk: device.path(),
        data_partition: &data,
        hash_partition: &hash,
    };

    let root_hash = verity_format(&ctx, &SystemCommandRunner, &table, &target, true, SECTOR_SIZE)?;
    assert_eq!(root_hash.len(), 64);
    ensure!(root_hash.bytes().all(|c| c.is_ascii_hexdigit()));

    // 8192 data blocks: 64 leaf blocks, one block above them, the superblock
    let needed = calculate_hash_file_size_in_bytes(&hash)?;
    assert_eq!(needed, 66 * 4096);

    let partitions = table.partitions(&ctx, device.path())?;
    let shrunk = partition(&partitions, "roothash")?.size_in_bytes;
    ensure!(shrunk < HASH_PARTITION_SIZE, "hash partition not shrunk");
    ensure!(shrunk >= convert_bytes_to_sectors(needed, SECTOR_SIZE)? * SECTOR_SIZE);
    assert_eq!(shrunk % SECTOR_SIZE, 0);

    verify(&ctx, &data, &hash, &root_hash)
}

#[test_with::executable(veritysetup)]
#[test]
fn test_provision_root() -> Result<()> {
    if !rustix::process::getuid().is_root() {
        eprintln!("skipping, loop devices need root");
        return Ok(());
    }

    let ctx = BuildContext::new();
    let (_image, device) = partitioned_image(&ctx)?;
    let table = SystemDisk::new(SystemCommandRunner);

    let request = ProvisionRequest {
        disk: device.path().to_path_buf(),
        configs: vec![VerityConfig {
            id: "root-verity".into(),
            name: "root".into(),
            data_device: PartitionRef::PartLabel("rootfs".into()),
            hash_device: PartitionRef::PartLabel("roothash".into()),
            data_device_mount_id_type: MountIdType::PartLabel,
            hash_device_mount_id_type: MountIdType::PartUuid,
            corruption_option: CorruptionOption::Panic,
            hash_signature_path: None,
        }],
        ..Default::default()
    };
    let mut kernel_args = KernelArgs::default();

    let devices = provision_verity(&ctx, &SystemCommandRunner, &table, &mut kernel_args, &request)?;
    assert_eq!(devices.len(), 1);
    let root = &devices[0];

    let partitions = table.partitions(&ctx, device.path())?;
    let hash = partition(&partitions, "roothash")?;
    assert_eq!(hash.part_uuid, root.hash_partition_uuid);

    let args = kernel_args.args.context("Kernel arguments not updated")?;
    assert_eq!(
        args,
        vec![
            "rd.systemd.verity=1".to_string(),
            format!("roothash={}", root.root_hash),
            "systemd.verity_root_data=PARTLABEL=rootfs".to_string(),
            format!("systemd.verity_root_hash=PARTUUID={}", hash.part_uuid),
            "systemd.verity_root_options=panic-on-corruption".to_string(),
        ]
    );

    verify(
        &ctx,
        &device.partition_path(1),
        &device.partition_path(2),
        &root.root_hash,
    )
}

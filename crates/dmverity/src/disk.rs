//! Partition table access for the disk holding the verity partitions.
//!
//! The [`PartitionTable`] trait covers everything the formatter and the
//! provisioning code need from the disk: listing partitions, asking the
//! kernel to pick up table changes, and resizing one entry.  [`SystemDisk`]
//! implements it with ioctls and the usual util-linux tools.

use std::{
    fs::File,
    io,
    path::{Path, PathBuf},
    thread::sleep,
    time::Duration,
};

use dmverity_ioctls::blkdev::{blk_pbszget, blk_rrpart, blk_sszget, RereadPartitionsError};
use log::{debug, warn};
use regex_automata::meta::Regex;
use serde::{Deserialize, Deserializer};
use thiserror::Error;

use crate::command::{
    run, BuildContext, CommandError, CommandRunner, ToolCommand, FLOCK, LSBLK, SFDISK, UDEVADM,
};

const SYSFS_CLASS_BLOCK: &str = "/sys/class/block";

const REREAD_RETRIES: u32 = 10;
const REREAD_INITIAL_WAIT: Duration = Duration::from_millis(125);

/// A partition table operation failed.
#[derive(Error, Debug)]
pub enum DiskError {
    #[error("failed to open disk ({})", .path.display())]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to request partition table reread ({})", .path.display())]
    Reread {
        path: PathBuf,
        #[source]
        source: RereadPartitionsError,
    },
    #[error("failed to get sector size of ({})", .path.display())]
    SectorSize {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to find partition number of ({})", .0.display())]
    PartitionNumber(PathBuf),
    #[error("failed to parse disk ({}) partitions JSON", .path.display())]
    ParsePartitions {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error(transparent)]
    Command(#[from] CommandError),
}

/// One block device on the disk, as reported by `lsblk`.
///
/// Properties `lsblk` reports as absent (for example the partition UUID of
/// the whole-disk entry) are empty strings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct PartitionInfo {
    #[serde(deserialize_with = "null_as_empty")]
    pub name: String,
    #[serde(deserialize_with = "null_as_empty")]
    pub path: String,
    #[serde(rename = "parttype", default, deserialize_with = "null_as_empty")]
    pub partition_type_uuid: String,
    #[serde(rename = "fstype", default, deserialize_with = "null_as_empty")]
    pub filesystem_type: String,
    #[serde(rename = "uuid", default, deserialize_with = "null_as_empty")]
    pub filesystem_uuid: String,
    #[serde(rename = "partuuid", default, deserialize_with = "null_as_empty")]
    pub part_uuid: String,
    #[serde(rename = "partlabel", default, deserialize_with = "null_as_empty")]
    pub part_label: String,
    #[serde(rename = "type", default, deserialize_with = "null_as_empty")]
    pub device_type: String,
    #[serde(rename = "size", default)]
    pub size_in_bytes: u64,
}

#[derive(Debug, Deserialize)]
struct LsblkOutput {
    #[serde(rename = "blockdevices", default)]
    devices: Vec<PartitionInfo>,
}

fn null_as_empty<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    Ok(Option::<String>::deserialize(deserializer)?.unwrap_or_default())
}

/// Parses the output of `lsblk --json --list --bytes`.
pub fn parse_lsblk_output(disk: &Path, json: &str) -> Result<Vec<PartitionInfo>, DiskError> {
    if json.trim().is_empty() {
        return Ok(vec![]);
    }

    let output: LsblkOutput =
        serde_json::from_str(json).map_err(|source| DiskError::ParsePartitions {
            path: disk.to_path_buf(),
            source,
        })?;
    Ok(output.devices)
}

/// The partition table of a disk.
pub trait PartitionTable {
    /// The kernel's current view of the disk's partitions.
    fn partitions(&self, ctx: &BuildContext, disk: &Path) -> Result<Vec<PartitionInfo>, DiskError>;

    /// Makes the kernel re-read the partition table and waits for the device
    /// nodes to be recreated.
    fn refresh(&self, ctx: &BuildContext, disk: &Path) -> Result<(), DiskError>;

    /// Sets the size of `partition` to `size_in_sectors`, keeping its start,
    /// then refreshes the disk.
    fn resize_partition(
        &self,
        ctx: &BuildContext,
        partition: &Path,
        disk: &Path,
        size_in_sectors: u64,
    ) -> Result<(), DiskError>;
}

/// Partition table access via ioctls and util-linux.
#[derive(Debug, Clone, Default)]
pub struct SystemDisk<R> {
    runner: R,
}

impl<R: CommandRunner> SystemDisk<R> {
    pub fn new(runner: R) -> Self {
        Self { runner }
    }
}

impl<R: CommandRunner> PartitionTable for SystemDisk<R> {
    fn partitions(&self, ctx: &BuildContext, disk: &Path) -> Result<Vec<PartitionInfo>, DiskError> {
        let output = run(
            ctx,
            &self.runner,
            &ToolCommand::new(LSBLK).arg(disk).args([
                "--output",
                "NAME,PATH,PARTTYPE,FSTYPE,UUID,MOUNTPOINT,PARTUUID,PARTLABEL,TYPE,SIZE",
                "--bytes",
                "--json",
                "--list",
            ]),
        )?;
        parse_lsblk_output(disk, &output.stdout)
    }

    fn refresh(&self, ctx: &BuildContext, disk: &Path) -> Result<(), DiskError> {
        reread_partition_table(disk)?;
        // device nodes of all partitions get removed and recreated
        run(ctx, &self.runner, &ToolCommand::new(UDEVADM).arg("settle"))?;
        Ok(())
    }

    fn resize_partition(
        &self,
        ctx: &BuildContext,
        partition: &Path,
        disk: &Path,
        size_in_sectors: u64,
    ) -> Result<(), DiskError> {
        let number = partition_number(partition)?;

        run(
            ctx,
            &self.runner,
            &ToolCommand::new(FLOCK)
                .args(["--timeout", "5"])
                .arg(disk)
                .args([SFDISK, "--lock=no", "-N"])
                .arg(number.to_string())
                .arg(disk)
                .stdin(sfdisk_resize_script(size_in_sectors)),
        )?;

        self.refresh(ctx, disk)
    }
}

/// The `sfdisk` input that changes the size of the selected partition.
pub fn sfdisk_resize_script(size_in_sectors: u64) -> String {
    format!("unit: sectors\nsize={size_in_sectors}")
}

/// Issues `BLKRRPART` on `disk`, backing off while the disk is busy.
pub fn reread_partition_table(disk: &Path) -> Result<(), DiskError> {
    let file = File::open(disk).map_err(|source| DiskError::Open {
        path: disk.to_path_buf(),
        source,
    })?;

    let mut wait = REREAD_INITIAL_WAIT;
    let mut retries = 0;
    loop {
        match blk_rrpart(&file) {
            Ok(()) => break,
            Err(RereadPartitionsError::Busy) if retries < REREAD_RETRIES => {
                debug!("{} is busy, retrying partition table reread in {wait:?}", disk.display());
                sleep(wait);
                wait *= 2;
                retries += 1;
            }
            Err(source) => {
                return Err(DiskError::Reread {
                    path: disk.to_path_buf(),
                    source,
                })
            }
        }
    }

    if retries > 0 {
        warn!(
            "partition table reread of {} needed {retries} retries",
            disk.display()
        );
    }

    Ok(())
}

/// The logical and physical sector sizes of `disk`, in bytes.
pub fn sector_size(disk: &Path) -> Result<(u32, u32), DiskError> {
    let file = File::open(disk).map_err(|source| DiskError::Open {
        path: disk.to_path_buf(),
        source,
    })?;

    let err = |source| DiskError::SectorSize {
        path: disk.to_path_buf(),
        source,
    };
    let logical = blk_sszget(&file).map_err(err)?;
    let physical = blk_pbszget(&file).map_err(err)?;
    Ok((logical, physical))
}

/// The number of a partition within its disk's partition table.
pub fn partition_number(partition: &Path) -> Result<u32, DiskError> {
    partition_number_in(Path::new(SYSFS_CLASS_BLOCK), partition)
}

/// Like [`partition_number`], reading sysfs below `class_block`.
///
/// Falls back to the `loopNpM` naming of partitioned loop devices when sysfs
/// doesn't know the device.
pub fn partition_number_in(class_block: &Path, partition: &Path) -> Result<u32, DiskError> {
    let not_found = || DiskError::PartitionNumber(partition.to_path_buf());

    let name = partition
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(not_found)?;

    if let Ok(contents) = std::fs::read_to_string(class_block.join(name).join("partition")) {
        if let Ok(number) = contents.trim().parse() {
            return Ok(number);
        }
    }

    let re = Regex::new(r"^loop[0-9]+p([0-9]+)$").map_err(|_| not_found())?;
    let mut caps = re.create_captures();
    re.captures(name, &mut caps);
    caps.get_group(1)
        .and_then(|span| name[span.range()].parse().ok())
        .ok_or_else(not_found)
}

/// Finds the partition with the given partition UUID.
pub fn find_by_part_uuid<'a>(
    partitions: &'a [PartitionInfo],
    part_uuid: &str,
) -> Option<&'a PartitionInfo> {
    if part_uuid.is_empty() {
        return None;
    }
    partitions.iter().find(|p| p.part_uuid == part_uuid)
}

/// Finds the partition with the given partition label.
pub fn find_by_part_label<'a>(
    partitions: &'a [PartitionInfo],
    part_label: &str,
) -> Option<&'a PartitionInfo> {
    if part_label.is_empty() {
        return None;
    }
    partitions.iter().find(|p| p.part_label == part_label)
}

#[cfg(test)]
mod tests {
    use std::fs;

    use similar_asserts::assert_eq;

    use super::*;
    use crate::test::{fail, ok, tempdir, FakeRunner};

    const LSBLK_JSON: &str = r#"{
   "blockdevices": [
      {
         "name": "loop3",
         "path": "/dev/loop3",
         "parttype": null,
         "fstype": null,
         "uuid": null,
         "mountpoint": null,
         "partuuid": null,
         "partlabel": null,
         "type": "loop",
         "size": 2147483648
      },{
         "name": "loop3p1",
         "path": "/dev/loop3p1",
         "parttype": "c12a7328-f81f-11d2-ba4b-00a0c93ec93b",
         "fstype": "vfat",
         "uuid": "4BD9-3A78",
         "mountpoint": null,
         "partuuid": "7b1367a6-5845-43f2-99b1-a742d873f590",
         "partlabel": "esp",
         "type": "part",
         "size": 8388608
      },{
         "name": "loop3p2",
         "path": "/dev/loop3p2",
         "parttype": "0fc63daf-8483-4772-8e79-3d69d8477de4",
         "fstype": "ext4",
         "uuid": "d8a8a8f3-1bd3-4c3c-8f7b-e1c4c4b1a5b5",
         "mountpoint": null,
         "partuuid": "a2d2a0c8-3f7c-4ad2-9c71-2a3a8e6f7b11",
         "partlabel": "root",
         "type": "part",
         "size": 1073741824
      }
   ]
}"#;

    #[test]
    fn test_parse_lsblk() {
        let partitions = parse_lsblk_output(Path::new("/dev/loop3"), LSBLK_JSON).unwrap();
        assert_eq!(partitions.len(), 3);

        assert_eq!(partitions[0].device_type, "loop");
        assert_eq!(partitions[0].part_uuid, "");

        let root = &partitions[2];
        assert_eq!(root.name, "loop3p2");
        assert_eq!(root.path, "/dev/loop3p2");
        assert_eq!(root.filesystem_type, "ext4");
        assert_eq!(root.part_label, "root");
        assert_eq!(root.size_in_bytes, 1073741824);
    }

    #[test]
    fn test_parse_lsblk_empty() {
        assert!(parse_lsblk_output(Path::new("/dev/loop3"), "")
            .unwrap()
            .is_empty());
        assert!(matches!(
            parse_lsblk_output(Path::new("/dev/loop3"), "{ nope").unwrap_err(),
            DiskError::ParsePartitions { .. }
        ));
    }

    #[test]
    fn test_find_partitions() {
        let partitions = parse_lsblk_output(Path::new("/dev/loop3"), LSBLK_JSON).unwrap();

        let esp = find_by_part_uuid(&partitions, "7b1367a6-5845-43f2-99b1-a742d873f590").unwrap();
        assert_eq!(esp.path, "/dev/loop3p1");
        assert_eq!(
            find_by_part_label(&partitions, "root").unwrap().path,
            "/dev/loop3p2"
        );

        assert!(find_by_part_uuid(&partitions, "nope").is_none());
        // the whole disk has neither, which must not match an empty reference
        assert!(find_by_part_uuid(&partitions, "").is_none());
        assert!(find_by_part_label(&partitions, "").is_none());
    }

    #[test]
    fn test_partitions_runs_lsblk() {
        let ctx = BuildContext::new();
        let runner = FakeRunner::new().then(ok(LSBLK_JSON));
        let disk = SystemDisk::new(&runner);

        let partitions = disk.partitions(&ctx, Path::new("/dev/loop3")).unwrap();
        assert_eq!(partitions.len(), 3);

        let calls = runner.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].program, LSBLK);
        assert!(calls[0].args[0] == "/dev/loop3");
        assert!(calls[0].args.iter().any(|a| a == "--json"));
    }

    #[test]
    fn test_partitions_lsblk_fails() {
        let ctx = BuildContext::new();
        let runner = FakeRunner::new().then(fail(32, "lsblk: /dev/nope: not a block device"));
        let disk = SystemDisk::new(&runner);

        assert!(matches!(
            disk.partitions(&ctx, Path::new("/dev/nope")).unwrap_err(),
            DiskError::Command(CommandError::NonZeroExit { .. })
        ));
    }

    #[test]
    fn test_resize_script() {
        assert_eq!(sfdisk_resize_script(80), "unit: sectors\nsize=80");
    }

    #[test]
    fn test_partition_number_from_sysfs() {
        let sysfs = tempdir();
        fs::create_dir(sysfs.path().join("nvme0n1p3")).unwrap();
        fs::write(sysfs.path().join("nvme0n1p3/partition"), "3\n").unwrap();

        assert_eq!(
            partition_number_in(sysfs.path(), Path::new("/dev/nvme0n1p3")).unwrap(),
            3
        );
    }

    #[test]
    fn test_partition_number_loop_fallback() {
        let sysfs = tempdir();
        assert_eq!(
            partition_number_in(sysfs.path(), Path::new("/dev/loop12p4")).unwrap(),
            4
        );
        assert!(matches!(
            partition_number_in(sysfs.path(), Path::new("/dev/loop12")).unwrap_err(),
            DiskError::PartitionNumber(_)
        ));
        assert!(matches!(
            partition_number_in(sysfs.path(), Path::new("/dev/sda2")).unwrap_err(),
            DiskError::PartitionNumber(_)
        ));
    }

    #[test]
    fn test_resize_missing_partition_number() {
        let ctx = BuildContext::new();
        let runner = FakeRunner::new();
        let disk = SystemDisk::new(&runner);

        assert!(matches!(
            disk.resize_partition(&ctx, Path::new("/"), Path::new("/dev/loop0"), 8)
                .unwrap_err(),
            DiskError::PartitionNumber(_)
        ));
        assert!(runner.calls().is_empty());
    }

    #[test]
    fn test_reread_regular_file() {
        let file = tempfile::NamedTempFile::new().unwrap();
        assert!(matches!(
            reread_partition_table(file.path()).unwrap_err(),
            DiskError::Reread {
                source: RereadPartitionsError::NotPartitionable,
                ..
            }
        ));
        assert!(matches!(
            sector_size(file.path()).unwrap_err(),
            DiskError::SectorSize { .. }
        ));
    }

    #[test]
    fn test_reread_missing_disk() {
        let dir = tempdir();
        assert!(matches!(
            reread_partition_table(&dir.path().join("nope")).unwrap_err(),
            DiskError::Open { .. }
        ));
    }
}

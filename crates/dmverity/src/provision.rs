//! Provisioning all verity devices of a disk image.
//!
//! A disk can carry verity devices inherited from its base image (recovered
//! from the base image's kernel command line) as well as newly configured
//! ones.  Every device that isn't read-only is (re)formatted, and the full
//! list is handed to a [`KernelArgsUpdater`] so the boot configuration can
//! pick up the new root hashes.

use std::{
    collections::HashMap,
    error::Error as StdError,
    path::{Path, PathBuf},
};

use log::info;
use thiserror::Error;

use crate::{
    cmdline::verity_kernel_args,
    command::{BuildContext, CommandError, CommandRunner},
    disk::{
        find_by_part_label, find_by_part_uuid, sector_size, DiskError, PartitionInfo,
        PartitionTable,
    },
    format::{verity_format, FormatError, VerityTarget},
    metadata::{CorruptionOption, MountIdType, VerityDeviceMetadata},
};

/// How a configured verity device refers to one of its partitions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PartitionRef {
    /// A partition id from the storage configuration, mapped to a partition
    /// UUID through [`ProvisionRequest::part_id_to_part_uuid`].
    ConfigId(String),
    /// The GPT partition label.
    PartLabel(String),
}

impl std::fmt::Display for PartitionRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ConfigId(id) => write!(f, "id={id}"),
            Self::PartLabel(label) => write!(f, "part-label={label}"),
        }
    }
}

/// A verity device requested by the image configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerityConfig {
    pub id: String,
    /// `root` or `usr`
    pub name: String,
    pub data_device: PartitionRef,
    pub hash_device: PartitionRef,
    pub data_device_mount_id_type: MountIdType,
    pub hash_device_mount_id_type: MountIdType,
    pub corruption_option: CorruptionOption,
    pub hash_signature_path: Option<String>,
}

/// Everything [`provision_verity`] works on.
#[derive(Debug, Clone, Default)]
pub struct ProvisionRequest {
    /// The whole-disk block device of the image.
    pub disk: PathBuf,
    /// The disk's logical sector size; queried from the disk when unset.
    pub sector_size: Option<u64>,
    pub shrink_hash_partition: bool,
    /// Verity devices found in the base image.
    pub inherited: Vec<VerityDeviceMetadata>,
    /// Partition UUIDs which must not be modified.  Inherited devices whose
    /// data partition is listed here keep their root hash.
    pub readonly_part_uuids: Vec<String>,
    pub configs: Vec<VerityConfig>,
    pub part_id_to_part_uuid: HashMap<String, String>,
}

/// Receives the final verity device list once anything was formatted.
pub trait KernelArgsUpdater {
    fn update(
        &mut self,
        devices: &[VerityDeviceMetadata],
        partitions: &[PartitionInfo],
    ) -> Result<(), Box<dyn StdError + Send + Sync>>;
}

/// Collects the verity kernel arguments instead of writing them anywhere.
#[derive(Debug, Clone, Default)]
pub struct KernelArgs {
    /// Filesystem UUID of the boot partition, for `pre.verity.mount=`.
    pub boot_uuid: String,
    /// The generated arguments, set once [`KernelArgsUpdater::update`] ran.
    pub args: Option<Vec<String>>,
}

impl KernelArgsUpdater for KernelArgs {
    fn update(
        &mut self,
        devices: &[VerityDeviceMetadata],
        partitions: &[PartitionInfo],
    ) -> Result<(), Box<dyn StdError + Send + Sync>> {
        let args = verity_kernel_args(devices, partitions, &self.boot_uuid)?;
        self.args = Some(args);
        Ok(())
    }
}

/// A verity partition couldn't be located on the disk.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum PartitionLookupError {
    #[error("partition not found (PARTUUID={0})")]
    PartUuid(String),
    #[error("no partition found with device id ({0})")]
    ConfigId(String),
    #[error("partition not found (part-label={0})")]
    PartLabel(String),
}

/// A partition is already one of an inherited verity device's partitions.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum PartitionInUseError {
    #[error("partition already in use as existing verity device's ({0}) data partition")]
    Data(String),
    #[error("partition already in use as existing verity device's ({0}) hash partition")]
    Hash(String),
}

/// Provisioning stopped; nothing after the failing device was touched.
#[derive(Error, Debug)]
pub enum ProvisionError {
    #[error("operation cancelled")]
    Cancelled,
    #[error("failed to get disk sector size (device='{}')", .device.display())]
    SectorSize {
        device: PathBuf,
        #[source]
        source: DiskError,
    },
    #[error("failed to list partitions (device='{}')", .device.display())]
    ListPartitions {
        device: PathBuf,
        #[source]
        source: DiskError,
    },
    #[error("failed to find verity data partition ({device})")]
    FindDataPartition {
        device: String,
        #[source]
        source: PartitionLookupError,
    },
    #[error("failed to find verity hash partition ({device})")]
    FindHashPartition {
        device: String,
        #[source]
        source: PartitionLookupError,
    },
    #[error("verity ({device}) partition is invalid")]
    PartitionInUse {
        device: String,
        #[source]
        source: PartitionInUseError,
    },
    #[error("failed to provision verity device ({device})")]
    Format {
        device: String,
        #[source]
        source: FormatError,
    },
    #[error("failed to refresh partitions (device='{}')", .device.display())]
    Refresh {
        device: PathBuf,
        #[source]
        source: DiskError,
    },
    #[error("failed to update kernel cmdline arguments for verity")]
    KernelArgs(#[source] Box<dyn StdError + Send + Sync>),
}

impl ProvisionError {
    fn from_disk(source: DiskError, wrap: impl FnOnce(DiskError) -> Self) -> Self {
        match source {
            DiskError::Command(CommandError::Cancelled) => Self::Cancelled,
            other => wrap(other),
        }
    }

    fn from_format(device: &str, source: FormatError) -> Self {
        match source {
            FormatError::Cancelled => Self::Cancelled,
            other => Self::Format {
                device: device.to_string(),
                source: other,
            },
        }
    }
}

/// Checks that `part_uuid` isn't already used by an inherited verity device.
pub fn ensure_partition_not_already_in_use(
    part_uuid: &str,
    inherited: &[VerityDeviceMetadata],
) -> Result<(), PartitionInUseError> {
    for device in inherited {
        if part_uuid == device.data_partition_uuid {
            return Err(PartitionInUseError::Data(device.name.clone()));
        }

        if part_uuid == device.hash_partition_uuid {
            return Err(PartitionInUseError::Hash(device.name.clone()));
        }
    }

    Ok(())
}

fn find_inherited_partition<'a>(
    partitions: &'a [PartitionInfo],
    part_uuid: &str,
) -> Result<&'a PartitionInfo, PartitionLookupError> {
    find_by_part_uuid(partitions, part_uuid)
        .ok_or_else(|| PartitionLookupError::PartUuid(part_uuid.to_string()))
}

fn find_configured_partition<'a>(
    partitions: &'a [PartitionInfo],
    reference: &PartitionRef,
    part_id_to_part_uuid: &HashMap<String, String>,
) -> Result<&'a PartitionInfo, PartitionLookupError> {
    match reference {
        PartitionRef::ConfigId(id) => part_id_to_part_uuid
            .get(id)
            .and_then(|uuid| find_by_part_uuid(partitions, uuid))
            .ok_or_else(|| PartitionLookupError::ConfigId(id.clone())),
        PartitionRef::PartLabel(label) => find_by_part_label(partitions, label)
            .ok_or_else(|| PartitionLookupError::PartLabel(label.clone())),
    }
}

/// Formats every verity device of a disk and updates the kernel arguments.
///
/// Inherited devices are processed first, in order, then configured ones.
/// Returns the metadata of all devices, including untouched read-only ones.
pub fn provision_verity<R, T, K>(
    ctx: &BuildContext,
    runner: &R,
    table: &T,
    kernel_args: &mut K,
    request: &ProvisionRequest,
) -> Result<Vec<VerityDeviceMetadata>, ProvisionError>
where
    R: CommandRunner + ?Sized,
    T: PartitionTable + ?Sized,
    K: KernelArgsUpdater + ?Sized,
{
    info!("Provisioning verity");

    let disk = request.disk.as_path();
    let list_partitions = |disk: &Path| {
        table.partitions(ctx, disk).map_err(|e| {
            ProvisionError::from_disk(e, |source| ProvisionError::ListPartitions {
                device: disk.to_path_buf(),
                source,
            })
        })
    };

    let partitions = list_partitions(disk)?;

    let sector_size = match request.sector_size {
        Some(size) => size,
        None => {
            let (logical, _physical) =
                sector_size(disk).map_err(|source| ProvisionError::SectorSize {
                    device: disk.to_path_buf(),
                    source,
                })?;
            u64::from(logical)
        }
    };

    let mut devices = Vec::with_capacity(request.inherited.len() + request.configs.len());
    let mut updated = false;

    for inherited in &request.inherited {
        let mut device = inherited.clone();

        if request.readonly_part_uuids.contains(&inherited.data_partition_uuid) {
            info!("Keeping read-only verity device ({})", inherited.name);
        } else {
            info!("Reformatting verity device ({})", inherited.name);

            let data = find_inherited_partition(&partitions, &inherited.data_partition_uuid)
                .map_err(|source| ProvisionError::FindDataPartition {
                    device: inherited.name.clone(),
                    source,
                })?;
            let hash = find_inherited_partition(&partitions, &inherited.hash_partition_uuid)
                .map_err(|source| ProvisionError::FindHashPartition {
                    device: inherited.name.clone(),
                    source,
                })?;

            let target = VerityTarget {
                disk,
                data_partition: Path::new(&data.path),
                hash_partition: Path::new(&hash.path),
            };
            device.root_hash = verity_format(
                ctx,
                runner,
                table,
                &target,
                request.shrink_hash_partition,
                sector_size,
            )
            .map_err(|e| ProvisionError::from_format(&inherited.name, e))?;
            updated = true;
        }

        devices.push(device);
    }

    for config in &request.configs {
        info!(
            "Formatting verity device ({}): data {}, hash {}",
            config.id, config.data_device, config.hash_device
        );

        let data = find_configured_partition(
            &partitions,
            &config.data_device,
            &request.part_id_to_part_uuid,
        )
        .map_err(|source| ProvisionError::FindDataPartition {
            device: config.id.clone(),
            source,
        })?;
        let hash = find_configured_partition(
            &partitions,
            &config.hash_device,
            &request.part_id_to_part_uuid,
        )
        .map_err(|source| ProvisionError::FindHashPartition {
            device: config.id.clone(),
            source,
        })?;

        for part_uuid in [&data.part_uuid, &hash.part_uuid] {
            ensure_partition_not_already_in_use(part_uuid, &request.inherited).map_err(
                |source| ProvisionError::PartitionInUse {
                    device: config.id.clone(),
                    source,
                },
            )?;
        }

        let target = VerityTarget {
            disk,
            data_partition: Path::new(&data.path),
            hash_partition: Path::new(&hash.path),
        };
        let root_hash = verity_format(
            ctx,
            runner,
            table,
            &target,
            request.shrink_hash_partition,
            sector_size,
        )
        .map_err(|e| ProvisionError::from_format(&config.id, e))?;

        devices.push(VerityDeviceMetadata {
            name: config.name.clone(),
            root_hash,
            data_partition_uuid: data.part_uuid.clone(),
            hash_partition_uuid: hash.part_uuid.clone(),
            data_device_mount_id_type: config.data_device_mount_id_type,
            hash_device_mount_id_type: config.hash_device_mount_id_type,
            corruption_option: config.corruption_option,
            hash_signature_path: config.hash_signature_path.clone(),
        });
        updated = true;
    }

    // the hash partitions' identifiers may have changed
    table.refresh(ctx, disk).map_err(|e| {
        ProvisionError::from_disk(e, |source| ProvisionError::Refresh {
            device: disk.to_path_buf(),
            source,
        })
    })?;

    if updated {
        let partitions = list_partitions(disk)?;
        kernel_args
            .update(&devices, &partitions)
            .map_err(ProvisionError::KernelArgs)?;
    }

    Ok(devices)
}

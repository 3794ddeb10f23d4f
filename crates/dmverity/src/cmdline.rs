//! Kernel command line arguments for `systemd-veritysetup-generator`.
//!
//! The initrd finds verity devices through `roothash=`/`usrhash=` and the
//! matching `systemd.verity_{root,usr}_{data,hash,options}=` arguments.  This
//! module builds those arguments for freshly provisioned devices, strips them
//! from an existing command line, and recovers inherited devices from a base
//! image's command line.

use thiserror::Error;

use crate::{
    disk::{find_by_part_label, find_by_part_uuid, PartitionInfo},
    metadata::{
        parse_verity_options, MetadataError, MountIdType, VerityDeviceMetadata, ROOT_DEVICE_NAME,
        USR_DEVICE_NAME,
    },
};

/// Every argument [`verity_kernel_args`] may produce.
pub const VERITY_ARG_NAMES: &[&str] = &[
    "rd.systemd.verity",
    "roothash",
    "systemd.verity_root_data",
    "systemd.verity_root_hash",
    "systemd.verity_root_options",
    "usrhash",
    "systemd.verity_usr_data",
    "systemd.verity_usr_hash",
    "systemd.verity_usr_options",
    "pre.verity.mount",
];

/// Verity kernel arguments couldn't be built or understood.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum CmdlineError {
    #[error("unsupported verity device ({0})")]
    UnsupportedDevice(String),
    #[error("partition not found (PARTUUID={0})")]
    PartitionNotFound(String),
    #[error("partition not found ({0})")]
    IdentifierNotFound(String),
    #[error("unknown partition identifier ({0})")]
    UnknownIdentifier(String),
    #[error("verity device ({device}) is missing the {arg} argument")]
    MissingArgument { device: String, arg: &'static str },
    #[error("verity device ({device}) has invalid options")]
    Options {
        device: String,
        #[source]
        source: MetadataError,
    },
}

/// The argument names used for one verity device.
#[derive(Debug, Clone, Copy)]
struct DeviceArgs {
    root_hash: &'static str,
    data: &'static str,
    hash: &'static str,
    options: &'static str,
}

const ROOT_ARGS: DeviceArgs = DeviceArgs {
    root_hash: "roothash",
    data: "systemd.verity_root_data",
    hash: "systemd.verity_root_hash",
    options: "systemd.verity_root_options",
};

const USR_ARGS: DeviceArgs = DeviceArgs {
    root_hash: "usrhash",
    data: "systemd.verity_usr_data",
    hash: "systemd.verity_usr_hash",
    options: "systemd.verity_usr_options",
};

fn device_args(name: &str) -> Result<DeviceArgs, CmdlineError> {
    match name {
        ROOT_DEVICE_NAME => Ok(ROOT_ARGS),
        USR_DEVICE_NAME => Ok(USR_ARGS),
        other => Err(CmdlineError::UnsupportedDevice(other.to_string())),
    }
}

/// Perform kernel command line splitting.
///
/// The way this works in the kernel is to split on whitespace with an extremely simple quoting
/// mechanism: whitespace inside of double quotes is literal, but there is no escaping mechanism.
/// That means that having a literal double quote in the cmdline is effectively impossible.
pub fn split_cmdline(cmdline: &str) -> impl Iterator<Item = &str> {
    let mut in_quotes = false;

    cmdline
        .split(move |c: char| {
            if c == '"' {
                in_quotes = !in_quotes;
            }
            !in_quotes && c.is_ascii_whitespace()
        })
        .filter(|item| !item.is_empty())
}

fn arg_name(item: &str) -> &str {
    item.split_once('=').map_or(item, |(name, _)| name)
}

/// Gets the value of an argument from the kernel cmdline.
///
/// If the argument appears more than once, the last one wins.  Surrounding
/// double quotes are removed from the value.
pub fn get_cmdline_value<'a>(cmdline: &'a str, name: &str) -> Option<&'a str> {
    split_cmdline(cmdline)
        .filter_map(|item| item.split_once('='))
        .filter(|(key, _)| *key == name)
        .map(|(_, value)| value.trim_matches('"'))
        .last()
}

/// Removes all verity related arguments from a kernel command line.
///
/// Other arguments are kept verbatim, including their quoting.
pub fn remove_verity_args(cmdline: &str) -> String {
    split_cmdline(cmdline)
        .filter(|item| !VERITY_ARG_NAMES.contains(&arg_name(item)))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Renders how `systemd-veritysetup` should find the partition with
/// `part_uuid`.
fn systemd_partition_id(
    part_uuid: &str,
    mount_id_type: MountIdType,
    partitions: &[PartitionInfo],
) -> Result<String, CmdlineError> {
    let partition = find_by_part_uuid(partitions, part_uuid)
        .ok_or_else(|| CmdlineError::PartitionNotFound(part_uuid.to_string()))?;

    Ok(match mount_id_type {
        MountIdType::PartLabel => format!("PARTLABEL={}", partition.part_label),
        MountIdType::Uuid => format!("UUID={}", partition.filesystem_uuid),
        MountIdType::PartUuid | MountIdType::Default => format!("PARTUUID={}", partition.part_uuid),
    })
}

/// Builds the kernel arguments for a set of verity devices.
///
/// `partitions` must be the disk's partitions as they are after formatting,
/// since resizing a partition can change how it is identified.  `boot_uuid`
/// is the filesystem UUID of the partition holding the root hash signatures;
/// it is only used when a device has one.
pub fn verity_kernel_args(
    devices: &[VerityDeviceMetadata],
    partitions: &[PartitionInfo],
    boot_uuid: &str,
) -> Result<Vec<String>, CmdlineError> {
    let mut args = vec!["rd.systemd.verity=1".to_string()];
    let mut has_signature = false;

    for device in devices {
        let names = device_args(&device.name)?;

        let data = systemd_partition_id(
            &device.data_partition_uuid,
            device.data_device_mount_id_type,
            partitions,
        )?;
        let hash = systemd_partition_id(
            &device.hash_partition_uuid,
            device.hash_device_mount_id_type,
            partitions,
        )?;

        has_signature |= device.hash_signature_path.is_some();

        args.push(format!("{}={}", names.root_hash, device.root_hash));
        args.push(format!("{}={data}", names.data));
        args.push(format!("{}={hash}", names.hash));
        args.push(format!("{}={}", names.options, device.systemd_options()));
    }

    if has_signature {
        args.push(format!("pre.verity.mount={boot_uuid}"));
    }

    Ok(args)
}

/// Resolves a `PARTUUID=`, `PARTLABEL=` or `UUID=` reference.
fn resolve_partition_id<'a>(
    id: &str,
    partitions: &'a [PartitionInfo],
) -> Result<(MountIdType, &'a PartitionInfo), CmdlineError> {
    let found = if let Some(uuid) = id.strip_prefix("PARTUUID=") {
        find_by_part_uuid(partitions, uuid).map(|p| (MountIdType::PartUuid, p))
    } else if let Some(label) = id.strip_prefix("PARTLABEL=") {
        find_by_part_label(partitions, label).map(|p| (MountIdType::PartLabel, p))
    } else if let Some(uuid) = id.strip_prefix("UUID=") {
        partitions
            .iter()
            .find(|p| !uuid.is_empty() && p.filesystem_uuid == uuid)
            .map(|p| (MountIdType::Uuid, p))
    } else {
        return Err(CmdlineError::UnknownIdentifier(id.to_string()));
    };

    found.ok_or_else(|| CmdlineError::IdentifierNotFound(id.to_string()))
}

/// Recovers the verity devices configured on an existing kernel command line.
///
/// Partition references are resolved against `partitions` so that the result
/// refers to partitions by partition UUID, whatever identifier the command
/// line used.
pub fn parse_verity_args(
    cmdline: &str,
    partitions: &[PartitionInfo],
) -> Result<Vec<VerityDeviceMetadata>, CmdlineError> {
    let mut devices = vec![];

    for (name, names) in [(ROOT_DEVICE_NAME, ROOT_ARGS), (USR_DEVICE_NAME, USR_ARGS)] {
        let Some(root_hash) = get_cmdline_value(cmdline, names.root_hash) else {
            continue;
        };

        let missing = |arg| CmdlineError::MissingArgument {
            device: name.to_string(),
            arg,
        };
        let data_id = get_cmdline_value(cmdline, names.data).ok_or_else(|| missing(names.data))?;
        let hash_id = get_cmdline_value(cmdline, names.hash).ok_or_else(|| missing(names.hash))?;

        let (data_device_mount_id_type, data) = resolve_partition_id(data_id, partitions)?;
        let (hash_device_mount_id_type, hash) = resolve_partition_id(hash_id, partitions)?;

        let options = get_cmdline_value(cmdline, names.options).unwrap_or("");
        let (corruption_option, hash_signature_path) =
            parse_verity_options(options).map_err(|source| CmdlineError::Options {
                device: name.to_string(),
                source,
            })?;

        devices.push(VerityDeviceMetadata {
            name: name.to_string(),
            root_hash: root_hash.to_string(),
            data_partition_uuid: data.part_uuid.clone(),
            hash_partition_uuid: hash.part_uuid.clone(),
            data_device_mount_id_type,
            hash_device_mount_id_type,
            corruption_option,
            hash_signature_path,
        });
    }

    Ok(devices)
}

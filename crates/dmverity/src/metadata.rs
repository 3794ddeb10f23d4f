//! What the boot configuration needs to know about a verity device.

use std::{fmt, path::PathBuf, str::FromStr};

use thiserror::Error;

/// Name of the verity device backing `/`.
pub const ROOT_DEVICE_NAME: &str = "root";
/// Name of the verity device backing `/usr`.
pub const USR_DEVICE_NAME: &str = "usr";

const DEVICE_MAPPER_PATH: &str = "/dev/mapper";

/// A verity device option or identifier couldn't be interpreted.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MetadataError {
    #[error("invalid mount id type ({0})")]
    InvalidMountIdType(String),
    #[error("invalid corruption option ({0})")]
    InvalidCorruptionOption(String),
    #[error("unknown verity option ({0})")]
    UnknownOption(String),
}

/// How a partition is referred to from the kernel command line.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum MountIdType {
    /// Same as [`MountIdType::PartUuid`]
    #[default]
    Default,
    PartUuid,
    PartLabel,
    /// The filesystem UUID
    Uuid,
}

impl MountIdType {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Default => "",
            Self::PartUuid => "part-uuid",
            Self::PartLabel => "part-label",
            Self::Uuid => "uuid",
        }
    }
}

impl fmt::Display for MountIdType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MountIdType {
    type Err = MetadataError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "" => Ok(Self::Default),
            "part-uuid" => Ok(Self::PartUuid),
            "part-label" => Ok(Self::PartLabel),
            "uuid" => Ok(Self::Uuid),
            other => Err(MetadataError::InvalidMountIdType(other.to_string())),
        }
    }
}

/// What the kernel does when it finds a corrupted block.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum CorruptionOption {
    /// Same as [`CorruptionOption::IoError`]
    #[default]
    Default,
    IoError,
    Ignore,
    Panic,
    Restart,
}

impl CorruptionOption {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Default => "",
            Self::IoError => "io-error",
            Self::Ignore => "ignore",
            Self::Panic => "panic",
            Self::Restart => "restart",
        }
    }

    /// The `systemd-veritysetup` option for this behaviour, empty for the
    /// kernel default.
    pub const fn systemd_option(&self) -> &'static str {
        match self {
            Self::Default | Self::IoError => "",
            Self::Ignore => "ignore-corruption",
            Self::Panic => "panic-on-corruption",
            Self::Restart => "restart-on-corruption",
        }
    }
}

impl fmt::Display for CorruptionOption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CorruptionOption {
    type Err = MetadataError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "" => Ok(Self::Default),
            "io-error" => Ok(Self::IoError),
            "ignore" => Ok(Self::Ignore),
            "panic" => Ok(Self::Panic),
            "restart" => Ok(Self::Restart),
            other => Err(MetadataError::InvalidCorruptionOption(other.to_string())),
        }
    }
}

/// A provisioned (or inherited) verity device.
///
/// `root_hash` is empty for devices taken over from a base image which have
/// not been formatted in this run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VerityDeviceMetadata {
    pub name: String,
    pub root_hash: String,
    pub data_partition_uuid: String,
    pub hash_partition_uuid: String,
    pub data_device_mount_id_type: MountIdType,
    pub hash_device_mount_id_type: MountIdType,
    pub corruption_option: CorruptionOption,
    pub hash_signature_path: Option<String>,
}

impl VerityDeviceMetadata {
    /// The device-mapper node the opened device shows up as.
    pub fn device_path(&self) -> PathBuf {
        verity_device_path(&self.name)
    }

    /// The `systemd.verity_*_options=` value for this device.
    pub fn systemd_options(&self) -> String {
        format_verity_options(self.corruption_option, self.hash_signature_path.as_deref())
    }
}

/// `/dev/mapper/<name>`
pub fn verity_device_path(name: &str) -> PathBuf {
    PathBuf::from(DEVICE_MAPPER_PATH).join(name)
}

/// Formats a `systemd.verity_*_options=` value.
///
/// The default corruption handling has no option of its own, so the result
/// starts with a comma when only a signature is given.
pub fn format_verity_options(corruption: CorruptionOption, signature_path: Option<&str>) -> String {
    let mut options = corruption.systemd_option().to_string();
    if let Some(path) = signature_path {
        options.push_str(",root-hash-signature=");
        options.push_str(path);
    }
    options
}

/// Parses a `systemd.verity_*_options=` value.
///
/// Returns the corruption option and the root hash signature path, if any.
pub fn parse_verity_options(
    options: &str,
) -> Result<(CorruptionOption, Option<String>), MetadataError> {
    let mut corruption = CorruptionOption::IoError;
    let mut signature = None;

    for option in options.split(',') {
        match option {
            "" => {}
            "ignore-corruption" => corruption = CorruptionOption::Ignore,
            "panic-on-corruption" => corruption = CorruptionOption::Panic,
            "restart-on-corruption" => corruption = CorruptionOption::Restart,
            other => match other.strip_prefix("root-hash-signature=") {
                Some(path) => signature = Some(path.to_string()),
                None => return Err(MetadataError::UnknownOption(other.to_string())),
            },
        }
    }

    Ok((corruption, signature))
}

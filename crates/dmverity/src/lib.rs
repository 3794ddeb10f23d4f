//! Provisioning of dm-verity protected partitions in disk images.
//!
//! The pieces, from the bottom up:
//!
//! - [`superblock`] and [`hashtree`] read the header `veritysetup format`
//!   writes and work out how many bytes of the hash partition are actually
//!   used, so that it can be shrunk to fit.
//! - [`command`] runs the external tools (`veritysetup`, `sfdisk`, `lsblk`,
//!   `udevadm`) with cooperative cancellation, and [`disk`] wraps the
//!   partition table operations built on them.
//! - [`format`] formats one data/hash pair and [`provision`] does it for every
//!   verity device of an image before handing the results to [`cmdline`] to
//!   produce the kernel command line.

#![forbid(unsafe_code)]

pub mod algorithm;
pub mod cmdline;
pub mod command;
pub mod disk;
pub mod format;
pub mod hashtree;
pub mod metadata;
pub mod provision;
pub mod superblock;

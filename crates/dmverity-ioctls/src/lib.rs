//! Low-level ioctl wrappers for dm-verity provisioning.
//!
//! This crate provides safe Rust wrappers around the Linux ioctls used while
//! formatting and shrinking verity hash partitions:
//!
//! - **Block device ioctls**: re-read a partition table, query sector sizes
//!   and device sizes
//! - **Loop device ioctls**: attach a disk image with partition scanning
//!   (behind the `loop-device` feature)
//!
//! # Safety
//!
//! All unsafe ioctl code is contained within this crate, allowing dependent
//! crates to use `#![forbid(unsafe_code)]`.
//!
//! # Example
//!
//! ```ignore
//! use dmverity_ioctls::blkdev::{blk_rrpart, blk_sszget};
//!
//! let disk = std::fs::File::open("/dev/loop0")?;
//! let sector_size = blk_sszget(&disk)?;
//! blk_rrpart(&disk)?;
//! ```

#![deny(unsafe_code)]

pub mod blkdev;

#[cfg(feature = "loop-device")]
pub mod loop_device;

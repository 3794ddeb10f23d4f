//! Block device ioctl wrappers.
//!
//! This module provides safe wrappers for the handful of `BLK*` ioctls
//! needed around a verity format: re-reading a partition table after the
//! hash partition was resized, and querying sector and device sizes.

#![allow(unsafe_code)]

use std::{ffi::c_int, ffi::c_uint, io::Error, os::fd::AsFd};

use rustix::{
    io::Errno,
    ioctl::{ioctl, opcode, Getter, NoArg, Opcode},
};
use thiserror::Error;

/// Re-reading the partition table failed.
#[derive(Error, Debug)]
pub enum RereadPartitionsError {
    /// I/O operation failed.
    #[error("{0}")]
    Io(#[from] Error),
    /// Something else holds the disk or one of its partitions open.
    #[error("Device or resource busy")]
    Busy,
    /// The device is not a partitionable block device.
    #[error("Not a partitionable block device")]
    NotPartitionable,
}

// See /usr/include/linux/fs.h
// #define BLKRRPART    _IO(0x12,95)
const BLKRRPART: Opcode = opcode::none(0x12, 95);
// #define BLKSSZGET    _IO(0x12,104)
const BLKSSZGET: Opcode = opcode::none(0x12, 104);
// #define BLKGETSIZE64 _IOR(0x12,114,size_t)
const BLKGETSIZE64: Opcode = opcode::read::<u64>(0x12, 114);
// #define BLKPBSZGET   _IO(0x12,123)
const BLKPBSZGET: Opcode = opcode::none(0x12, 123);

/// Ask the kernel to re-read the partition table of a whole-disk device.
///
/// This is a thin safe wrapper for the `BLKRRPART` ioctl.  The kernel refuses
/// with `EBUSY` while any partition of the disk is open; retrying is left to
/// the caller.
pub fn blk_rrpart(fd: impl AsFd) -> Result<(), RereadPartitionsError> {
    match unsafe { ioctl(fd, NoArg::<{ BLKRRPART }>::new()) } {
        Ok(()) => Ok(()),
        Err(Errno::BUSY) => Err(RereadPartitionsError::Busy),
        Err(Errno::INVAL | Errno::NOTTY) => Err(RereadPartitionsError::NotPartitionable),
        Err(e) => Err(Error::from(e).into()),
    }
}

/// Logical sector size of a block device, in bytes.
pub fn blk_sszget(fd: impl AsFd) -> Result<u32, Error> {
    let size = unsafe { ioctl(fd, Getter::<{ BLKSSZGET }, c_int>::new()) }?;
    u32::try_from(size).map_err(Error::other)
}

/// Physical sector size of a block device, in bytes.
pub fn blk_pbszget(fd: impl AsFd) -> Result<u32, Error> {
    let size: c_uint = unsafe { ioctl(fd, Getter::<{ BLKPBSZGET }, c_uint>::new()) }?;
    Ok(size)
}

/// Size of a block device, in bytes.
pub fn blk_getsize64(fd: impl AsFd) -> Result<u64, Error> {
    Ok(unsafe { ioctl(fd, Getter::<{ BLKGETSIZE64 }, u64>::new()) }?)
}

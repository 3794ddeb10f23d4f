//! Loop device ioctl wrappers.
//!
//! This module attaches a raw disk image to a loop device with partition
//! scanning enabled, so that its partitions show up as `/dev/loopNpM`
//! block devices which can then be formatted and resized.

#![allow(unsafe_code)]

use std::{
    fs::OpenOptions,
    io::{Error, Result},
    os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd},
    path::{Path, PathBuf},
};

use rustix::ioctl::{ioctl, opcode, NoArg, Opcode, Setter};

/// Flags for loop device configuration.
pub mod flags {
    /// Read-only loop device.
    pub const LO_FLAGS_READ_ONLY: u32 = 1;
    /// Automatically detach on last close.
    pub const LO_FLAGS_AUTOCLEAR: u32 = 4;
    /// Allow partition scanning.
    pub const LO_FLAGS_PARTSCAN: u32 = 8;
    /// Use direct I/O.
    pub const LO_FLAGS_DIRECT_IO: u32 = 16;
}

const LO_NAME_SIZE: usize = 64;
const LO_KEY_SIZE: usize = 32;

// Loop device ioctl structures
#[repr(C)]
#[derive(Default)]
struct LoopConfig {
    fd: u32,
    block_size: u32,
    info: LoopInfo64,
    reserved: [u64; 8],
}

#[repr(C)]
struct LoopInfo64 {
    lo_device: u64,
    lo_inode: u64,
    lo_rdevice: u64,
    lo_offset: u64,
    lo_sizelimit: u64,
    lo_number: u32,
    lo_encrypt_type: u32,
    lo_encrypt_key_size: u32,
    lo_flags: u32,
    // Default is only implemented for arrays up to 32 elements
    lo_file_name: ([u8; LO_NAME_SIZE / 2], [u8; LO_NAME_SIZE / 2]),
    lo_crypt_name: ([u8; LO_NAME_SIZE / 2], [u8; LO_NAME_SIZE / 2]),
    lo_encrypt_key: [u8; LO_KEY_SIZE],
    lo_init: [u64; 2],
}

impl Default for LoopInfo64 {
    fn default() -> Self {
        Self {
            lo_device: 0,
            lo_inode: 0,
            lo_rdevice: 0,
            lo_offset: 0,
            lo_sizelimit: 0,
            lo_number: 0,
            lo_encrypt_type: 0,
            lo_encrypt_key_size: 0,
            lo_flags: 0,
            lo_file_name: ([0; LO_NAME_SIZE / 2], [0; LO_NAME_SIZE / 2]),
            lo_crypt_name: ([0; LO_NAME_SIZE / 2], [0; LO_NAME_SIZE / 2]),
            lo_encrypt_key: [0; LO_KEY_SIZE],
            lo_init: [0; 2],
        }
    }
}

// LOOP_CTL_GET_FREE hands back the device number as the syscall return value
struct LoopCtlGetFree;

unsafe impl rustix::ioctl::Ioctl for LoopCtlGetFree {
    type Output = std::ffi::c_int;

    const IS_MUTATING: bool = false;

    fn opcode(&self) -> rustix::ioctl::Opcode {
        LOOP_CTL_GET_FREE
    }

    fn as_ptr(&mut self) -> *mut std::ffi::c_void {
        std::ptr::null_mut()
    }

    unsafe fn output_from_ptr(
        out: rustix::ioctl::IoctlOutput,
        _ptr: *mut std::ffi::c_void,
    ) -> rustix::io::Result<std::ffi::c_int> {
        Ok(out)
    }
}

const LOOP_CTL_GET_FREE: Opcode = opcode::none(0x4C, 0x82);
// #define LOOP_CLR_FD            0x4C01
const LOOP_CLR_FD: Opcode = opcode::none(0x4C, 0x01);
// #define LOOP_CONFIGURE         0x4C0A
const LOOP_CONFIGURE: Opcode = opcode::write::<LoopConfig>(0x4C, 0x0A);

/// An attached loop device.
///
/// The device stays attached for as long as this value (or any other opener
/// of the device) is alive; `LO_FLAGS_AUTOCLEAR` takes care of detaching.
#[derive(Debug)]
pub struct LoopDevice {
    fd: OwnedFd,
    path: PathBuf,
}

impl LoopDevice {
    /// The `/dev/loopN` path of the device.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The path of partition `number` once the kernel has scanned it.
    pub fn partition_path(&self, number: u32) -> PathBuf {
        let mut path = self.path.clone().into_os_string();
        path.push(format!("p{number}"));
        path.into()
    }

    /// Detach the backing file right away instead of on last close.
    pub fn detach(self) -> Result<()> {
        unsafe { ioctl(&self.fd, NoArg::<{ LOOP_CLR_FD }>::new()) }.map_err(Error::other)
    }
}

impl AsFd for LoopDevice {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

/// Attaches a writable disk image with partition scanning.
///
/// This is what a verity format needs: the partitions of the image appear as
/// separate block devices and the partition table can be re-read after a
/// resize.
pub fn attach_partitioned(fd: impl AsFd) -> Result<LoopDevice> {
    attach_with_flags(fd, flags::LO_FLAGS_AUTOCLEAR | flags::LO_FLAGS_PARTSCAN)
}

/// Attaches a loop device with custom flags.
///
/// # Arguments
/// * `fd` - File descriptor of the backing file
/// * `lo_flags` - Loop device flags (see `flags` module)
pub fn attach_with_flags(fd: impl AsFd, lo_flags: u32) -> Result<LoopDevice> {
    let control = OpenOptions::new()
        .read(true)
        .write(true)
        .open("/dev/loop-control")?;

    let free: i32 = unsafe { ioctl(&control, LoopCtlGetFree) }.map_err(Error::other)?;

    if free < 0 {
        return Err(Error::other("no free loop device"));
    }

    let path = PathBuf::from(format!("/dev/loop{free}"));
    let loop_dev = OpenOptions::new().read(true).write(true).open(&path)?;

    // 512 byte logical blocks, like a regular disk
    let config = LoopConfig {
        fd: fd.as_fd().as_raw_fd() as u32,
        block_size: 512,
        info: LoopInfo64 {
            lo_flags,
            ..Default::default()
        },
        reserved: [0; 8],
    };

    unsafe {
        ioctl(
            &loop_dev,
            Setter::<{ LOOP_CONFIGURE }, LoopConfig>::new(config),
        )
        .map_err(Error::other)?;
    }

    Ok(LoopDevice {
        fd: loop_dev.into(),
        path,
    })
}

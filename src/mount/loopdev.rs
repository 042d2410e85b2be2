//! Loop-device virtual-disk backend for Linux
//!
//! - open (read access): opens the image read-only; the fd is the handle
//! - attach: takes a free loop device from `loop-control`, binds the image
//!   fd to it and sets the backing file name
//! - open (detach access): finds the loop device backed by the image
//!   through `/sys/block/loop*/loop/backing_file`; that device's fd is the handle
//! - detach: clears the loop device
//!
//! Result codes are errno values.

use std::ffi::c_int;
use std::fs::{self, File, OpenOptions};
use std::os::fd::{AsRawFd, FromRawFd, IntoRawFd, OwnedFd};
use std::path::{Path, PathBuf};

use super::abi::{
    AttachVirtualDiskFlags, AttachVirtualDiskParameters, DetachVirtualDiskFlags,
    OpenVirtualDiskFlags, OpenVirtualDiskParameters, RawDiskHandle, SUCCESS,
    VirtualDiskAccessMask, VirtualDiskApi, VirtualStorageType,
};

const LOOP_SET_FD: u32 = 0x4C00;
const LOOP_CLR_FD: u32 = 0x4C01;
const LOOP_SET_STATUS64: u32 = 0x4C04;
const LOOP_CTL_GET_FREE: u32 = 0x4C82;

const LO_FLAGS_READ_ONLY: u32 = 1;
const LO_FLAGS_AUTOCLEAR: u32 = 4;
const LO_NAME_SIZE: usize = 64;
const LO_KEY_SIZE: usize = 32;

/// `struct loop_info64` from `<linux/loop.h>`, only read by the kernel
#[repr(C)]
#[allow(dead_code)]
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
    lo_file_name: [u8; LO_NAME_SIZE],
    lo_crypt_name: [u8; LO_NAME_SIZE],
    lo_encrypt_key: [u8; LO_KEY_SIZE],
    lo_init: [u64; 2],
}

impl LoopInfo64 {
    fn for_backing_file(path: &Path, flags: u32) -> Self {
        let mut lo_file_name = [0u8; LO_NAME_SIZE];
        let name = path.as_os_str().as_encoded_bytes();
        let len = name.len().min(LO_NAME_SIZE - 1);
        lo_file_name[..len].copy_from_slice(&name[..len]);

        Self {
            lo_device: 0,
            lo_inode: 0,
            lo_rdevice: 0,
            lo_offset: 0,
            lo_sizelimit: 0,
            lo_number: 0,
            lo_encrypt_type: 0,
            lo_encrypt_key_size: 0,
            lo_flags: flags,
            lo_file_name,
            lo_crypt_name: [0; LO_NAME_SIZE],
            lo_encrypt_key: [0; LO_KEY_SIZE],
            lo_init: [0; 2],
        }
    }
}

pub struct LoopDeviceApi {
    sys_block: PathBuf,
    dev_root: PathBuf,
}

impl Default for LoopDeviceApi {
    fn default() -> Self {
        Self::with_roots("/sys/block", "/dev")
    }
}

impl LoopDeviceApi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_roots(sys_block: impl Into<PathBuf>, dev_root: impl Into<PathBuf>) -> Self {
        Self {
            sys_block: sys_block.into(),
            dev_root: dev_root.into(),
        }
    }

    /// Loop device name (`loopN`) whose backing file is `image`
    fn find_backing_device(&self, image: &Path) -> Result<String, u32> {
        let image = fs::canonicalize(image).map_err(|e| errno_of(&e))?;
        let entries = fs::read_dir(&self.sys_block).map_err(|e| errno_of(&e))?;

        for entry in entries.filter_map(|e| e.ok()) {
            let name = entry.file_name().to_string_lossy().to_string();
            if !name.starts_with("loop") {
                continue;
            }
            let Ok(backing) = fs::read_to_string(entry.path().join("loop").join("backing_file"))
            else {
                continue;
            };
            if Path::new(backing.trim_end()) == image.as_path() {
                return Ok(name);
            }
        }

        Err(libc::ENXIO as u32)
    }

    fn bind(&self, image_fd: c_int, flags: AttachVirtualDiskFlags) -> Result<PathBuf, u32> {
        let control = OpenOptions::new()
            .read(true)
            .write(true)
            .open(self.dev_root.join("loop-control"))
            .map_err(|e| errno_of(&e))?;
        let number = ioctl_result(unsafe {
            libc::ioctl(control.as_raw_fd(), LOOP_CTL_GET_FREE as _)
        })?;

        let device_path = self.dev_root.join(format!("loop{}", number));
        let device = OpenOptions::new()
            .read(true)
            .write(!flags.contains(AttachVirtualDiskFlags::READ_ONLY))
            .open(&device_path)
            .map_err(|e| errno_of(&e))?;
        let device_fd = device.as_raw_fd();

        ioctl_result(unsafe { libc::ioctl(device_fd, LOOP_SET_FD as _, image_fd) })?;

        let backing = fs::read_link(format!("/proc/self/fd/{}", image_fd)).unwrap_or_default();
        let mut lo_flags = 0;
        if flags.contains(AttachVirtualDiskFlags::READ_ONLY) {
            lo_flags |= LO_FLAGS_READ_ONLY;
        }
        if !flags.contains(AttachVirtualDiskFlags::PERMANENT_LIFETIME) {
            lo_flags |= LO_FLAGS_AUTOCLEAR;
        }
        let info = LoopInfo64::for_backing_file(&backing, lo_flags);

        if let Err(code) = ioctl_result(unsafe {
            libc::ioctl(device_fd, LOOP_SET_STATUS64 as _, &info as *const LoopInfo64)
        }) {
            unsafe {
                libc::ioctl(device_fd, LOOP_CLR_FD as _, 0);
            }
            return Err(code);
        }

        Ok(device_path)
    }
}

impl VirtualDiskApi for LoopDeviceApi {
    fn open_virtual_disk(
        &self,
        storage_type: &VirtualStorageType,
        path: &Path,
        access: VirtualDiskAccessMask,
        _flags: OpenVirtualDiskFlags,
        parameters: &OpenVirtualDiskParameters,
    ) -> Result<RawDiskHandle, u32> {
        if !storage_type.is_iso() || parameters.version != 1 {
            return Err(libc::EINVAL as u32);
        }

        let file = if access == VirtualDiskAccessMask::READ {
            open_read_only(path)?
        } else if access == VirtualDiskAccessMask::DETACH {
            let device = self.find_backing_device(path)?;
            open_read_only(&self.dev_root.join(device))?
        } else {
            return Err(libc::EINVAL as u32);
        };

        Ok(file.into_raw_fd() as RawDiskHandle)
    }

    fn attach_virtual_disk(
        &self,
        handle: RawDiskHandle,
        flags: AttachVirtualDiskFlags,
        _provider_specific_flags: u32,
        parameters: &AttachVirtualDiskParameters,
    ) -> u32 {
        if parameters.version != 1 {
            return libc::EINVAL as u32;
        }

        match self.bind(handle as c_int, flags) {
            Ok(device) => {
                log::info!("Attached image to {}", device.display());
                SUCCESS
            }
            Err(code) => code,
        }
    }

    fn detach_virtual_disk(
        &self,
        handle: RawDiskHandle,
        _flags: DetachVirtualDiskFlags,
        _provider_specific_flags: u32,
    ) -> u32 {
        match ioctl_result(unsafe { libc::ioctl(handle as c_int, LOOP_CLR_FD as _, 0) }) {
            Ok(_) => SUCCESS,
            Err(code) => code,
        }
    }

    fn close_handle(&self, handle: RawDiskHandle) {
        // Takes ownership of the fd so it is closed here
        drop(unsafe { OwnedFd::from_raw_fd(handle as c_int) });
    }
}

fn open_read_only(path: &Path) -> Result<File, u32> {
    File::open(path).map_err(|e| errno_of(&e))
}

fn ioctl_result(ret: c_int) -> Result<c_int, u32> {
    if ret < 0 {
        Err(errno_of(&std::io::Error::last_os_error()))
    } else {
        Ok(ret)
    }
}

fn errno_of(err: &std::io::Error) -> u32 {
    err.raw_os_error().unwrap_or(libc::EIO) as u32
}

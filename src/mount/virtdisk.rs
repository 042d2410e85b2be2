//! Windows virtual-disk backend (virtdisk.dll)

use std::os::windows::ffi::OsStrExt;
use std::path::Path;
use std::ptr;

use windows_sys::Win32::Foundation::{CloseHandle, HANDLE};
use windows_sys::Win32::Storage::Vhd::{AttachVirtualDisk, DetachVirtualDisk, OpenVirtualDisk};

use super::abi::{
    AttachVirtualDiskFlags, AttachVirtualDiskParameters, DetachVirtualDiskFlags,
    OpenVirtualDiskFlags, OpenVirtualDiskParameters, RawDiskHandle, SUCCESS,
    VirtualDiskAccessMask, VirtualDiskApi, VirtualStorageType,
};

#[derive(Debug, Default)]
pub struct VirtDiskApi;

fn wide_path(path: &Path) -> Vec<u16> {
    path.as_os_str().encode_wide().chain(Some(0)).collect()
}

impl VirtualDiskApi for VirtDiskApi {
    fn open_virtual_disk(
        &self,
        storage_type: &VirtualStorageType,
        path: &Path,
        access: VirtualDiskAccessMask,
        flags: OpenVirtualDiskFlags,
        parameters: &OpenVirtualDiskParameters,
    ) -> Result<RawDiskHandle, u32> {
        let wide = wide_path(path);
        let mut handle: HANDLE = 0;

        let code = unsafe {
            OpenVirtualDisk(
                ptr::from_ref(storage_type).cast(),
                wide.as_ptr(),
                access.bits() as _,
                flags.bits() as _,
                ptr::from_ref(parameters).cast(),
                &mut handle,
            )
        };

        if code == SUCCESS {
            Ok(handle as RawDiskHandle)
        } else {
            Err(code)
        }
    }

    fn attach_virtual_disk(
        &self,
        handle: RawDiskHandle,
        flags: AttachVirtualDiskFlags,
        provider_specific_flags: u32,
        parameters: &AttachVirtualDiskParameters,
    ) -> u32 {
        unsafe {
            AttachVirtualDisk(
                handle as HANDLE,
                ptr::null_mut(),
                flags.bits() as _,
                provider_specific_flags,
                ptr::from_ref(parameters).cast(),
                ptr::null(),
            )
        }
    }

    fn detach_virtual_disk(
        &self,
        handle: RawDiskHandle,
        flags: DetachVirtualDiskFlags,
        provider_specific_flags: u32,
    ) -> u32 {
        unsafe { DetachVirtualDisk(handle as HANDLE, flags.bits() as _, provider_specific_flags) }
    }

    fn close_handle(&self, handle: RawDiskHandle) {
        unsafe {
            CloseHandle(handle as HANDLE);
        }
    }
}

//! Virtual mount manager
//!
//! Attaches an image file as a read-only virtual device and detaches it
//! again. Both calls run synchronously on the caller's thread and hold the
//! native handle only for the duration of the call.

pub mod abi;
#[cfg(target_os = "linux")]
pub mod loopdev;
#[cfg(windows)]
pub mod virtdisk;

use std::path::Path;

use abi::{
    AttachVirtualDiskFlags, AttachVirtualDiskParameters, DetachVirtualDiskFlags, NativeHandle,
    SUCCESS, VirtualDiskAccessMask, VirtualDiskApi,
};
use crate::error::{DiscError, Result};

/// Virtual-disk backend usable from any thread
pub type SharedVirtualDiskApi = Box<dyn VirtualDiskApi + Send + Sync>;

pub struct VirtualMountManager {
    api: SharedVirtualDiskApi,
}

impl Default for VirtualMountManager {
    fn default() -> Self {
        Self::with_api(platform_api())
    }
}

impl VirtualMountManager {
    /// Manager over the platform virtual-disk backend
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_api(api: SharedVirtualDiskApi) -> Self {
        Self { api }
    }

    /// Attach an image as a read-only device that outlives this process
    ///
    /// Mounting an image twice is left to the backend to accept or reject.
    pub fn mount(&self, image_path: &Path) -> Result<()> {
        validate_image_path(image_path)?;

        let handle =
            NativeHandle::open_iso(self.api.as_ref(), image_path, VirtualDiskAccessMask::READ)?;
        let code = self.api.attach_virtual_disk(
            handle.raw(),
            AttachVirtualDiskFlags::READ_ONLY | AttachVirtualDiskFlags::PERMANENT_LIFETIME,
            0,
            &AttachVirtualDiskParameters::version1(),
        );
        if code != SUCCESS {
            let err = DiscError::native("AttachVirtualDisk", code);
            log::error!("Mount of {} failed: {}", image_path.display(), err);
            return Err(err);
        }

        log::info!("Mounted {}", image_path.display());
        Ok(())
    }

    /// Detach a previously mounted image
    pub fn unmount(&self, image_path: &Path) -> Result<()> {
        validate_image_path(image_path)?;

        let handle =
            NativeHandle::open_iso(self.api.as_ref(), image_path, VirtualDiskAccessMask::DETACH)?;
        let code = self
            .api
            .detach_virtual_disk(handle.raw(), DetachVirtualDiskFlags::NONE, 0);
        if code != SUCCESS {
            let err = DiscError::native("DetachVirtualDisk", code);
            log::error!("Unmount of {} failed: {}", image_path.display(), err);
            return Err(err);
        }

        log::info!("Unmounted {}", image_path.display());
        Ok(())
    }
}

fn validate_image_path(image_path: &Path) -> Result<()> {
    if image_path.to_string_lossy().trim().is_empty() {
        return Err(DiscError::InvalidArgument("Image path is empty".to_string()));
    }
    if !image_path.is_file() {
        return Err(DiscError::NotFound(image_path.display().to_string()));
    }
    Ok(())
}

/// The virtual-disk backend for the current platform
pub fn platform_api() -> SharedVirtualDiskApi {
    #[cfg(windows)]
    {
        Box::new(virtdisk::VirtDiskApi)
    }
    #[cfg(target_os = "linux")]
    {
        Box::new(loopdev::LoopDeviceApi::new())
    }
    #[cfg(not(any(windows, target_os = "linux")))]
    {
        Box::new(UnsupportedApi)
    }
}

/// Backend for platforms without virtual-disk support; every call fails
#[cfg(not(any(windows, target_os = "linux")))]
struct UnsupportedApi;

#[cfg(all(unix, not(target_os = "linux")))]
const NOT_SUPPORTED: u32 = libc::ENOTSUP as u32;
#[cfg(not(any(unix, windows)))]
const NOT_SUPPORTED: u32 = 50;

#[cfg(not(any(windows, target_os = "linux")))]
impl VirtualDiskApi for UnsupportedApi {
    fn open_virtual_disk(
        &self,
        _storage_type: &abi::VirtualStorageType,
        _path: &Path,
        _access: VirtualDiskAccessMask,
        _flags: abi::OpenVirtualDiskFlags,
        _parameters: &abi::OpenVirtualDiskParameters,
    ) -> std::result::Result<abi::RawDiskHandle, u32> {
        Err(NOT_SUPPORTED)
    }

    fn attach_virtual_disk(
        &self,
        _handle: abi::RawDiskHandle,
        _flags: AttachVirtualDiskFlags,
        _provider_specific_flags: u32,
        _parameters: &AttachVirtualDiskParameters,
    ) -> u32 {
        NOT_SUPPORTED
    }

    fn detach_virtual_disk(
        &self,
        _handle: abi::RawDiskHandle,
        _flags: DetachVirtualDiskFlags,
        _provider_specific_flags: u32,
    ) -> u32 {
        NOT_SUPPORTED
    }

    fn close_handle(&self, _handle: abi::RawDiskHandle) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_fixtures::FakeVirtualDisk;
    use abi::VIRTUAL_STORAGE_TYPE_DEVICE_ISO;
    use tempfile::TempDir;

    fn image(dir: &TempDir) -> std::path::PathBuf {
        let path = dir.path().join("disc.iso");
        std::fs::write(&path, b"iso").unwrap();
        path
    }

    #[test]
    fn test_mount_opens_attaches_and_closes() {
        let dir = TempDir::new().unwrap();
        let fake = FakeVirtualDisk::new();
        let manager = VirtualMountManager::with_api(Box::new(fake.clone()));

        manager.mount(&image(&dir)).unwrap();

        let calls = fake.calls();
        assert_eq!(calls.opens.len(), 1);
        let open = &calls.opens[0];
        assert_eq!(open.access, VirtualDiskAccessMask::READ);
        assert_eq!(open.storage_type.device_id, VIRTUAL_STORAGE_TYPE_DEVICE_ISO);
        assert!(open.storage_type.is_iso());
        assert_eq!(open.parameters.version, 1);
        assert_eq!(open.parameters.rw_depth, 1);

        assert_eq!(
            calls.attaches,
            vec![AttachVirtualDiskFlags::READ_ONLY | AttachVirtualDiskFlags::PERMANENT_LIFETIME]
        );
        assert_eq!(calls.closed, vec![open.handle]);
    }

    #[test]
    fn test_attach_failure_closes_handle_once() {
        let dir = TempDir::new().unwrap();
        let fake = FakeVirtualDisk::new().failing_attach(0x20);
        let manager = VirtualMountManager::with_api(Box::new(fake.clone()));

        match manager.mount(&image(&dir)) {
            Err(DiscError::Native {
                operation, code, ..
            }) => {
                assert_eq!(operation, "AttachVirtualDisk");
                assert_eq!(code, 0x20);
            }
            other => panic!("unexpected result: {:?}", other),
        }

        let calls = fake.calls();
        assert_eq!(calls.closed.len(), 1);
        assert_eq!(calls.closed[0], calls.opens[0].handle);
    }

    #[test]
    fn test_unmount_opens_for_detach() {
        let dir = TempDir::new().unwrap();
        let fake = FakeVirtualDisk::new();
        let manager = VirtualMountManager::with_api(Box::new(fake.clone()));

        manager.unmount(&image(&dir)).unwrap();

        let calls = fake.calls();
        assert_eq!(calls.opens[0].access, VirtualDiskAccessMask::DETACH);
        assert_eq!(calls.detaches, vec![calls.opens[0].handle]);
        assert!(calls.attaches.is_empty());
        assert_eq!(calls.closed.len(), 1);
    }

    #[test]
    fn test_detach_failure_closes_handle_once() {
        let dir = TempDir::new().unwrap();
        let fake = FakeVirtualDisk::new().failing_detach(0x6);
        let manager = VirtualMountManager::with_api(Box::new(fake.clone()));

        let err = manager.unmount(&image(&dir)).unwrap_err();
        assert!(err.to_string().starts_with("DetachVirtualDisk failed with 0x6."));

        let calls = fake.calls();
        assert_eq!(calls.closed, vec![calls.opens[0].handle]);
    }

    #[test]
    fn test_open_failure_touches_nothing_else() {
        let dir = TempDir::new().unwrap();
        let fake = FakeVirtualDisk::new().failing_open(0x2);
        let manager = VirtualMountManager::with_api(Box::new(fake.clone()));

        match manager.mount(&image(&dir)) {
            Err(DiscError::Native { operation, .. }) => assert_eq!(operation, "OpenVirtualDisk"),
            other => panic!("unexpected result: {:?}", other),
        }

        let calls = fake.calls();
        assert!(calls.attaches.is_empty());
        assert!(calls.closed.is_empty());
    }

    #[test]
    fn test_unmount_open_failure_reports_code() {
        let dir = TempDir::new().unwrap();
        let fake = FakeVirtualDisk::new().failing_open(0x20);
        let manager = VirtualMountManager::with_api(Box::new(fake.clone()));

        match manager.unmount(&image(&dir)) {
            Err(DiscError::Native { operation, code, .. }) => {
                assert_eq!(operation, "OpenVirtualDisk");
                assert_eq!(code, 0x20);
            }
            other => panic!("unexpected result: {:?}", other),
        }

        let calls = fake.calls();
        assert!(calls.detaches.is_empty());
        assert!(calls.closed.is_empty());
    }

    #[test]
    fn test_validation_before_native_calls() {
        let dir = TempDir::new().unwrap();
        let fake = FakeVirtualDisk::new();
        let manager = VirtualMountManager::with_api(Box::new(fake.clone()));

        assert!(matches!(
            manager.mount(Path::new("  ")),
            Err(DiscError::InvalidArgument(_))
        ));
        assert!(matches!(
            manager.unmount(&dir.path().join("missing.iso")),
            Err(DiscError::NotFound(_))
        ));
        assert!(fake.calls().opens.is_empty());
    }
}

//! Virtual-disk API records and the handle guard
//!
//! The records are `repr(C)` with the exact layout the native virtual-disk
//! service expects (version-1 parameter blocks only). Backends receive them
//! by reference and return raw result codes; `0` is success.

use std::ops::BitOr;
use std::path::Path;
use uuid::Uuid;

use crate::error::{DiscError, Result};

/// Raw handle value returned by `open_virtual_disk`
pub type RawDiskHandle = isize;

/// Result code for success
pub const SUCCESS: u32 = 0;

/// Device type of an ISO image
pub const VIRTUAL_STORAGE_TYPE_DEVICE_ISO: u32 = 1;

/// Vendor id for the ISO storage type
pub const VIRTUAL_STORAGE_TYPE_VENDOR_MICROSOFT: Uuid =
    Uuid::from_u128(0xEC984AEC_A0A9_44E7_B6B6_1DED8D2EA4E1);

/// Native GUID layout
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Guid {
    pub data1: u32,
    pub data2: u16,
    pub data3: u16,
    pub data4: [u8; 8],
}

impl From<Uuid> for Guid {
    fn from(uuid: Uuid) -> Self {
        let (data1, data2, data3, data4) = uuid.as_fields();
        Self {
            data1,
            data2,
            data3,
            data4: *data4,
        }
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VirtualStorageType {
    pub device_id: u32,
    pub vendor_id: Guid,
}

impl VirtualStorageType {
    pub fn iso() -> Self {
        Self {
            device_id: VIRTUAL_STORAGE_TYPE_DEVICE_ISO,
            vendor_id: VIRTUAL_STORAGE_TYPE_VENDOR_MICROSOFT.into(),
        }
    }

    pub fn is_iso(&self) -> bool {
        *self == Self::iso()
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenVirtualDiskParameters {
    pub version: u32,
    pub rw_depth: u32,
}

impl OpenVirtualDiskParameters {
    pub fn version1(rw_depth: u32) -> Self {
        Self {
            version: 1,
            rw_depth,
        }
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttachVirtualDiskParameters {
    pub version: u32,
    pub reserved: u32,
}

impl AttachVirtualDiskParameters {
    pub fn version1() -> Self {
        Self {
            version: 1,
            reserved: 0,
        }
    }
}

macro_rules! flag_set {
    ($(#[$meta:meta])* $name:ident { $($flag:ident = $value:expr),* $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
        pub struct $name(pub u32);

        impl $name {
            $(pub const $flag: Self = Self($value);)*

            pub fn bits(self) -> u32 {
                self.0
            }

            pub fn contains(self, other: Self) -> bool {
                self.0 & other.0 == other.0
            }
        }

        impl BitOr for $name {
            type Output = Self;

            fn bitor(self, rhs: Self) -> Self {
                Self(self.0 | rhs.0)
            }
        }
    };
}

flag_set!(
    /// Access requested when opening a virtual disk
    VirtualDiskAccessMask {
        NONE = 0,
        READ = 0x0001_0000,
        DETACH = 0x0004_0000,
    }
);

flag_set!(OpenVirtualDiskFlags { NONE = 0 });

flag_set!(
    AttachVirtualDiskFlags {
        NONE = 0,
        READ_ONLY = 0x0000_0001,
        PERMANENT_LIFETIME = 0x0000_0004,
    }
);

flag_set!(DetachVirtualDiskFlags { NONE = 0 });

/// The native virtual-disk service
///
/// Calls return raw result codes (`SUCCESS` or an error code) rather than
/// `Result` so backends stay thin; `NativeHandle` and the mount manager turn
/// codes into `DiscError::Native`.
pub trait VirtualDiskApi {
    fn open_virtual_disk(
        &self,
        storage_type: &VirtualStorageType,
        path: &Path,
        access: VirtualDiskAccessMask,
        flags: OpenVirtualDiskFlags,
        parameters: &OpenVirtualDiskParameters,
    ) -> std::result::Result<RawDiskHandle, u32>;

    fn attach_virtual_disk(
        &self,
        handle: RawDiskHandle,
        flags: AttachVirtualDiskFlags,
        provider_specific_flags: u32,
        parameters: &AttachVirtualDiskParameters,
    ) -> u32;

    fn detach_virtual_disk(
        &self,
        handle: RawDiskHandle,
        flags: DetachVirtualDiskFlags,
        provider_specific_flags: u32,
    ) -> u32;

    fn close_handle(&self, handle: RawDiskHandle);
}

/// An open virtual-disk handle, closed exactly once on drop
pub struct NativeHandle<'a> {
    api: &'a dyn VirtualDiskApi,
    raw: RawDiskHandle,
}

impl<'a> NativeHandle<'a> {
    /// Open `path` as an ISO virtual disk
    pub fn open_iso(
        api: &'a dyn VirtualDiskApi,
        path: &Path,
        access: VirtualDiskAccessMask,
    ) -> Result<Self> {
        let storage_type = VirtualStorageType::iso();
        let parameters = OpenVirtualDiskParameters::version1(1);

        let raw = api
            .open_virtual_disk(
                &storage_type,
                path,
                access,
                OpenVirtualDiskFlags::NONE,
                &parameters,
            )
            .map_err(|code| {
                let err = DiscError::native("OpenVirtualDisk", code);
                log::error!("Opening {} failed: {}", path.display(), err);
                err
            })?;

        Ok(Self { api, raw })
    }

    pub fn raw(&self) -> RawDiskHandle {
        self.raw
    }
}

impl Drop for NativeHandle<'_> {
    fn drop(&mut self) {
        self.api.close_handle(self.raw);
    }
}

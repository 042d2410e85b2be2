//! Burning module - image creation and disc writing
//!
//! This module contains:
//! - `stream_bridge`: the sequential-storage adapter the recorder reads from
//! - `iso9660`: the on-disc image format
//! - `iso`: building an image from a directory tree
//! - `recorder`: the recorder subsystem contract
//! - `disc`: the burn engine

pub mod disc;
pub mod iso;
pub mod iso9660;
pub mod recorder;
pub mod stream_bridge;
#[cfg(target_os = "linux")]
pub mod sysfs;

pub use disc::{
    BurnEngine, BurnHandle, BurnOutcome, BurnProgressCallback, BurnStage, SubsystemFactory,
};
pub use iso::{build_image, normalize_volume_label, IsoResult, DEFAULT_VOLUME_LABEL};
pub use recorder::{RecorderDescriptor, SessionConfig, VerificationLevel};
pub use stream_bridge::{SequentialStorage, StreamBridge};

//! Discwright - disc image lifecycle
//!
//! Builds ISO 9660 images from directory trees, burns them to write-once
//! media through the platform recorder subsystem, and mounts them as
//! read-only virtual devices.

pub mod burning;
pub mod core;
pub mod error;
pub mod logging;
pub mod mount;

#[cfg(test)]
mod test_fixtures;

pub use error::{DiscError, Result};

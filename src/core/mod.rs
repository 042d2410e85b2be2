//! Shared plumbing
//!
//! This module contains:
//! - Cooperative cancellation
//! - Progress values for builds and burns
//! - Source tree scanning
//! - Persisted settings

mod cancel;
mod progress;
pub mod scanning;
mod settings;

pub use cancel::CancelToken;
pub use progress::{BuildProgress, BurnProgress};
pub use scanning::{list_directory, scan_source_tree, DirectoryListing, SourceSummary};
pub use settings::{BurnSettings, ImageSettings, Settings};

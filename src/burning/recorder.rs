//! Recorder subsystem contract
//!
//! The burn engine never touches recorder hardware itself. It drives a
//! `RecorderSubsystem` through the same steps the platform service exposes:
//! enumerate device ids, open a recorder by id, configure a write session,
//! subscribe to progress, and write from a `SequentialStorage`.
//!
//! Subsystem objects are not `Send`: they are created and used on the burn
//! worker thread only.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use super::stream_bridge::SequentialStorage;
use crate::core::BurnSettings;
use crate::error::Result;

/// Display name used when a recorder reports no identifiers
pub const GENERIC_RECORDER_NAME: &str = "Optical Drive";

/// Read-back verification after a write
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VerificationLevel {
    None,
    Quick,
    #[default]
    Full,
}

/// One recorder found by enumeration
///
/// `unique_id` is opaque and only valid until the next enumeration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecorderDescriptor {
    pub unique_id: String,
    pub display_name: String,
}

impl fmt::Display for RecorderDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.display_name)
    }
}

/// Join manufacturer and product ids, falling back to a generic name
pub fn recorder_display_name(manufacturer: &str, product: &str) -> String {
    let name = format!("{} {}", manufacturer.trim(), product.trim())
        .trim()
        .to_string();
    if name.is_empty() {
        GENERIC_RECORDER_NAME.to_string()
    } else {
        name
    }
}

/// Write session configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    pub client_name: String,
    pub verification: VerificationLevel,
    pub buffer_underrun_free_disabled: bool,
}

impl From<&BurnSettings> for SessionConfig {
    fn from(settings: &BurnSettings) -> Self {
        Self {
            client_name: settings.client_name.clone(),
            verification: settings.verification,
            buffer_underrun_free_disabled: settings.buffer_underrun_free_disabled,
        }
    }
}

/// Progress event handler: `(elapsed, estimated_total)`
pub type ProgressHandler = Arc<dyn Fn(i64, i64) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionToken(u64);

/// Handler registry for session implementations
#[derive(Default)]
pub struct ProgressHandlers {
    next: u64,
    handlers: Vec<(SubscriptionToken, ProgressHandler)>,
}

impl ProgressHandlers {
    pub fn add(&mut self, handler: ProgressHandler) -> SubscriptionToken {
        self.next += 1;
        let token = SubscriptionToken(self.next);
        self.handlers.push((token, handler));
        token
    }

    /// Returns false if the token was not registered
    pub fn remove(&mut self, token: SubscriptionToken) -> bool {
        let before = self.handlers.len();
        self.handlers.retain(|(t, _)| *t != token);
        self.handlers.len() != before
    }

    pub fn emit(&self, elapsed: i64, estimated_total: i64) {
        for (_, handler) in &self.handlers {
            handler(elapsed, estimated_total);
        }
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

/// Entry point of the platform recorder service
pub trait RecorderSubsystem {
    /// Device ids of all recorders currently known to the platform
    fn recorder_ids(&self) -> Result<Vec<String>>;

    fn open_recorder(&self, unique_id: &str) -> Result<Box<dyn Recorder>>;

    /// Configure a data write session on an opened recorder
    fn create_session(
        &self,
        recorder: Box<dyn Recorder>,
        config: &SessionConfig,
    ) -> Result<Box<dyn WriteSession>>;
}

pub trait Recorder {
    fn unique_id(&self) -> &str;

    fn manufacturer_id(&self) -> Result<String>;

    fn product_id(&self) -> Result<String>;
}

pub trait WriteSession {
    fn subscribe(&mut self, handler: ProgressHandler) -> SubscriptionToken;

    fn unsubscribe(&mut self, token: SubscriptionToken) -> bool;

    /// Write the whole of `source` to the media, verifying as configured.
    /// Blocks until the recorder finishes.
    fn write(&mut self, source: &mut dyn SequentialStorage) -> Result<()>;
}

/// Subsystem for platforms without a recorder backend: it has no recorders
pub struct NoRecorders;

impl RecorderSubsystem for NoRecorders {
    fn recorder_ids(&self) -> Result<Vec<String>> {
        Ok(Vec::new())
    }

    fn open_recorder(&self, unique_id: &str) -> Result<Box<dyn Recorder>> {
        Err(crate::DiscError::NotSupported(format!(
            "No recorder backend on this platform (requested {})",
            unique_id
        )))
    }

    fn create_session(
        &self,
        _recorder: Box<dyn Recorder>,
        _config: &SessionConfig,
    ) -> Result<Box<dyn WriteSession>> {
        Err(crate::DiscError::NotSupported(
            "No recorder backend on this platform".to_string(),
        ))
    }
}

/// The recorder subsystem for the current platform
pub fn platform_subsystem(settings: &BurnSettings) -> Result<Box<dyn RecorderSubsystem>> {
    #[cfg(target_os = "linux")]
    {
        Ok(Box::new(super::sysfs::SysfsRecorderSubsystem::new(
            &settings.recorder_program,
        )))
    }
    #[cfg(not(target_os = "linux"))]
    {
        let _ = settings;
        Ok(Box::new(NoRecorders))
    }
}

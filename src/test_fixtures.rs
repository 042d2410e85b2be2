//! Test fixtures
//!
//! This module provides:
//! - A small source tree for image builds
//! - Lookups into written images through `cdfs`
//! - A scripted recorder subsystem that records every call
//! - A virtual-disk API fake that records opens, attaches, detaches and closes

#![cfg(test)]

use cdfs::{DirectoryEntry, ISO9660Reader, ISODirectory};
use std::fs;
use std::io::Read;
use std::path::Path;
use std::sync::atomic::{AtomicIsize, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

use crate::burning::recorder::{
    ProgressHandler, ProgressHandlers, Recorder, RecorderSubsystem, SessionConfig,
    SubscriptionToken, WriteSession,
};
use crate::burning::stream_bridge::SequentialStorage;
use crate::burning::{SubsystemFactory, VerificationLevel};
use crate::core::CancelToken;
use crate::error::{DiscError, Result};
use crate::mount::abi::{
    AttachVirtualDiskFlags, AttachVirtualDiskParameters, DetachVirtualDiskFlags,
    OpenVirtualDiskFlags, OpenVirtualDiskParameters, RawDiskHandle,
    VirtualDiskAccessMask, VirtualDiskApi, VirtualStorageType,
};

/// Create a source tree:
///
/// ```text
/// a.txt
/// b.bin
/// sub/notes.md
/// sub/dir/File.txt   ("nested file")
/// ```
pub fn create_source_tree() -> TempDir {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let root = dir.path();
    fs::create_dir_all(root.join("sub").join("dir")).expect("Failed to create dirs");
    write(root, "a.txt", b"alpha");
    write(root, "b.bin", &[0u8, 1, 2, 3, 4, 5, 6, 7]);
    write(root, "sub/notes.md", b"# notes\n");
    write(root, "sub/dir/File.txt", b"nested file");
    dir
}

fn write(root: &Path, relative: &str, contents: &[u8]) {
    fs::write(root.join(relative), contents).expect("Failed to write fixture file");
}

// ---------------------------------------------------------------------------
// Image inspection
// ---------------------------------------------------------------------------

/// Identifiers in a directory, `.` and `..` included, in on-disc order
pub fn entry_names<T: ISO9660Reader>(dir: &ISODirectory<T>) -> Vec<String> {
    dir.contents()
        .map(|entry| entry.expect("Failed to read directory record").identifier().to_string())
        .collect()
}

/// Follow `components` from `dir`, matching identifiers exactly
///
/// `ISODirectory::find` ignores case, which would hide Joliet case mistakes.
pub fn lookup<T: ISO9660Reader>(
    dir: &ISODirectory<T>,
    components: &[&str],
) -> Option<DirectoryEntry<T>> {
    let (first, rest) = components.split_first()?;
    let entry = dir
        .contents()
        .map(|entry| entry.expect("Failed to read directory record"))
        .find(|entry| entry.identifier() == *first)?;

    if rest.is_empty() {
        return Some(entry);
    }
    match entry {
        DirectoryEntry::Directory(child) => lookup(&child, rest),
        _ => None,
    }
}

pub fn file_contents<T: ISO9660Reader>(entry: DirectoryEntry<T>) -> Vec<u8> {
    let file = match entry {
        DirectoryEntry::File(file) => file,
        other => panic!("Expected a file, got {:?}", other),
    };
    let mut data = Vec::new();
    file.read()
        .read_to_end(&mut data)
        .expect("Failed to read file from image");
    data
}

// ---------------------------------------------------------------------------
// Recorder subsystem
// ---------------------------------------------------------------------------

/// A recorder known to `FakeRecorders`
#[derive(Debug, Clone)]
pub struct FakeDrive {
    pub unique_id: String,
    pub vendor: String,
    pub product: String,
}

impl FakeDrive {
    pub fn new(unique_id: &str, vendor: &str, product: &str) -> Self {
        Self {
            unique_id: unique_id.to_string(),
            vendor: vendor.to_string(),
            product: product.to_string(),
        }
    }
}

/// Everything the fake subsystem saw
#[derive(Default)]
pub struct FakeLog {
    factory_calls: AtomicUsize,
    opened: Mutex<Vec<String>>,
    session_config: Mutex<Option<SessionConfig>>,
    subscribed: AtomicUsize,
    unsubscribed: AtomicUsize,
    written: Mutex<Vec<u8>>,
    threads: Mutex<Vec<String>>,
}

impl FakeLog {
    pub fn factory_calls(&self) -> usize {
        self.factory_calls.load(Ordering::SeqCst)
    }

    pub fn opened(&self) -> Vec<String> {
        self.opened.lock().unwrap().clone()
    }

    pub fn session_config(&self) -> Option<SessionConfig> {
        self.session_config.lock().unwrap().clone()
    }

    /// `(subscribed, unsubscribed)`
    pub fn subscriptions(&self) -> (usize, usize) {
        (
            self.subscribed.load(Ordering::SeqCst),
            self.unsubscribed.load(Ordering::SeqCst),
        )
    }

    pub fn written(&self) -> Vec<u8> {
        self.written.lock().unwrap().clone()
    }

    /// Names of the threads the subsystem was used from
    pub fn threads(&self) -> Vec<String> {
        self.threads.lock().unwrap().clone()
    }

    fn note_thread(&self) {
        let name = std::thread::current().name().unwrap_or("").to_string();
        self.threads.lock().unwrap().push(name);
    }
}

#[derive(Default)]
struct FakeScript {
    drives: Vec<FakeDrive>,
    events: Vec<(i64, i64)>,
    write_error: Option<u32>,
    read_error_after: Option<usize>,
    panic_on_write: bool,
    cancel_on_open: Option<CancelToken>,
}

/// Scripted recorder subsystem
#[derive(Clone)]
pub struct FakeRecorders {
    script: Arc<FakeScript>,
    log: Arc<FakeLog>,
}

impl FakeRecorders {
    pub fn new(drives: Vec<FakeDrive>) -> Self {
        Self {
            script: Arc::new(FakeScript {
                drives,
                ..FakeScript::default()
            }),
            log: Arc::new(FakeLog::default()),
        }
    }

    fn edit(mut self, apply: impl FnOnce(&mut FakeScript)) -> Self {
        if let Some(script) = Arc::get_mut(&mut self.script) {
            apply(script);
        }
        self
    }

    /// Progress events emitted during every write
    pub fn with_events(self, events: Vec<(i64, i64)>) -> Self {
        self.edit(|s| s.events = events)
    }

    /// Make every write fail with a native code
    pub fn with_write_error(self, code: u32) -> Self {
        self.edit(|s| s.write_error = Some(code))
    }

    /// Fail reading the source once `bytes` have been consumed, as if the
    /// image became unreadable mid-write
    pub fn with_source_read_error_after(self, bytes: usize) -> Self {
        self.edit(|s| s.read_error_after = Some(bytes))
    }

    /// Panic inside every write
    pub fn panicking_on_write(self) -> Self {
        self.edit(|s| s.panic_on_write = true)
    }

    /// Cancel `token` as soon as a recorder is opened
    pub fn cancelling_on_open(self, token: CancelToken) -> Self {
        self.edit(|s| s.cancel_on_open = Some(token))
    }

    pub fn log(&self) -> Arc<FakeLog> {
        Arc::clone(&self.log)
    }

    pub fn factory(&self) -> SubsystemFactory {
        let fake = self.clone();
        Arc::new(move || {
            fake.log.factory_calls.fetch_add(1, Ordering::SeqCst);
            fake.log.note_thread();
            Ok(Box::new(fake.clone()) as Box<dyn RecorderSubsystem>)
        })
    }
}

impl RecorderSubsystem for FakeRecorders {
    fn recorder_ids(&self) -> Result<Vec<String>> {
        Ok(self
            .script
            .drives
            .iter()
            .map(|d| d.unique_id.clone())
            .collect())
    }

    fn open_recorder(&self, unique_id: &str) -> Result<Box<dyn Recorder>> {
        self.log.note_thread();
        let drive = self
            .script
            .drives
            .iter()
            .find(|d| d.unique_id == unique_id)
            .cloned()
            .ok_or_else(|| DiscError::native("open recorder", 2))?;

        self.log.opened.lock().unwrap().push(unique_id.to_string());
        if let Some(token) = &self.script.cancel_on_open {
            token.cancel();
        }
        Ok(Box::new(drive))
    }

    fn create_session(
        &self,
        _recorder: Box<dyn Recorder>,
        config: &SessionConfig,
    ) -> Result<Box<dyn WriteSession>> {
        *self.log.session_config.lock().unwrap() = Some(config.clone());
        Ok(Box::new(FakeSession {
            script: Arc::clone(&self.script),
            log: Arc::clone(&self.log),
            config: config.clone(),
            handlers: ProgressHandlers::default(),
        }))
    }
}

impl Recorder for FakeDrive {
    fn unique_id(&self) -> &str {
        &self.unique_id
    }

    fn manufacturer_id(&self) -> Result<String> {
        Ok(self.vendor.clone())
    }

    fn product_id(&self) -> Result<String> {
        Ok(self.product.clone())
    }
}

struct FakeSession {
    script: Arc<FakeScript>,
    log: Arc<FakeLog>,
    config: SessionConfig,
    handlers: ProgressHandlers,
}

impl WriteSession for FakeSession {
    fn subscribe(&mut self, handler: ProgressHandler) -> SubscriptionToken {
        self.log.subscribed.fetch_add(1, Ordering::SeqCst);
        self.handlers.add(handler)
    }

    fn unsubscribe(&mut self, token: SubscriptionToken) -> bool {
        self.log.unsubscribed.fetch_add(1, Ordering::SeqCst);
        self.handlers.remove(token)
    }

    fn write(&mut self, source: &mut dyn SequentialStorage) -> Result<()> {
        self.log.note_thread();
        if self.script.panic_on_write {
            panic!("scripted recorder crash");
        }

        let mut data = Vec::new();
        let mut buf = [0u8; 4096];
        loop {
            if self.script.read_error_after.is_some_and(|limit| data.len() >= limit) {
                *self.log.written.lock().unwrap() = data;
                return Err(DiscError::Io(std::io::Error::other("image became unreadable")));
            }
            let n = source.read(&mut buf)?;
            if n == 0 {
                break;
            }
            data.extend_from_slice(&buf[..n]);
        }
        *self.log.written.lock().unwrap() = data;

        for (elapsed, total) in &self.script.events {
            self.handlers.emit(*elapsed, *total);
        }

        if let Some(code) = self.script.write_error {
            return Err(DiscError::Native {
                operation: "write".to_string(),
                code,
                message: "scripted failure".to_string(),
            });
        }

        if self.config.verification != VerificationLevel::None {
            source.clone_storage()?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Virtual-disk API
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct OpenCall {
    pub storage_type: VirtualStorageType,
    pub access: VirtualDiskAccessMask,
    pub parameters: OpenVirtualDiskParameters,
    pub handle: RawDiskHandle,
}

/// Snapshot of the calls a `FakeVirtualDisk` received
#[derive(Debug, Clone, Default)]
pub struct VirtualDiskCalls {
    pub opens: Vec<OpenCall>,
    pub attaches: Vec<AttachVirtualDiskFlags>,
    pub detaches: Vec<RawDiskHandle>,
    pub closed: Vec<RawDiskHandle>,
}

#[derive(Default)]
struct FakeDiskState {
    next_handle: AtomicIsize,
    calls: Mutex<VirtualDiskCalls>,
}

#[derive(Clone, Default)]
pub struct FakeVirtualDisk {
    state: Arc<FakeDiskState>,
    open_error: Option<u32>,
    attach_result: u32,
    detach_result: u32,
}

impl FakeVirtualDisk {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_open(self, code: u32) -> Self {
        Self {
            open_error: Some(code),
            ..self
        }
    }

    pub fn failing_attach(self, code: u32) -> Self {
        Self {
            attach_result: code,
            ..self
        }
    }

    pub fn failing_detach(self, code: u32) -> Self {
        Self {
            detach_result: code,
            ..self
        }
    }

    pub fn calls(&self) -> VirtualDiskCalls {
        self.state.calls.lock().unwrap().clone()
    }
}

impl VirtualDiskApi for FakeVirtualDisk {
    fn open_virtual_disk(
        &self,
        storage_type: &VirtualStorageType,
        _path: &Path,
        access: VirtualDiskAccessMask,
        _flags: OpenVirtualDiskFlags,
        parameters: &OpenVirtualDiskParameters,
    ) -> std::result::Result<RawDiskHandle, u32> {
        if let Some(code) = self.open_error {
            return Err(code);
        }
        let handle = 0x100 + self.state.next_handle.fetch_add(4, Ordering::SeqCst);
        self.state.calls.lock().unwrap().opens.push(OpenCall {
            storage_type: *storage_type,
            access,
            parameters: *parameters,
            handle,
        });
        Ok(handle)
    }

    fn attach_virtual_disk(
        &self,
        _handle: RawDiskHandle,
        flags: AttachVirtualDiskFlags,
        _provider_specific_flags: u32,
        parameters: &AttachVirtualDiskParameters,
    ) -> u32 {
        assert_eq!(parameters.version, 1);
        self.state.calls.lock().unwrap().attaches.push(flags);
        self.attach_result
    }

    fn detach_virtual_disk(
        &self,
        handle: RawDiskHandle,
        _flags: DetachVirtualDiskFlags,
        _provider_specific_flags: u32,
    ) -> u32 {
        self.state.calls.lock().unwrap().detaches.push(handle);
        self.detach_result
    }

    fn close_handle(&self, handle: RawDiskHandle) {
        self.state.calls.lock().unwrap().closed.push(handle);
    }
}

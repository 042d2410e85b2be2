//! Linux recorder backend
//!
//! Recorders are the `sr*` block devices listed under `/sys/block`. The
//! device node doubles as the recorder's unique id. Writes pipe the image
//! into a cdrecord-compatible program (`wodim` by default) in disc-at-once
//! mode, and verification reads the burned data back from the device node
//! and compares it with a clone of the source storage.

use std::fs::{self, File};
use std::io::{BufRead, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, Command, Stdio};
use std::thread::JoinHandle;
use std::time::Instant;
use uuid::Uuid;

use super::recorder::{
    ProgressHandler, ProgressHandlers, Recorder, RecorderSubsystem, SessionConfig,
    SubscriptionToken, VerificationLevel, WriteSession,
};
use super::stream_bridge::{
    COPY_CHUNK_SIZE, CopyTotals, SeekOrigin, SequentialStorage, StorageKind, StorageStat,
};
use crate::error::{DiscError, Result};

/// Bytes compared by a quick verification: the first 64 sectors
pub const QUICK_VERIFY_BYTES: u64 = 64 * 2048;

pub struct SysfsRecorderSubsystem {
    sys_block: PathBuf,
    dev_root: PathBuf,
    program: PathBuf,
    leading_args: Vec<String>,
}

impl SysfsRecorderSubsystem {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self::with_roots("/sys/block", "/dev", program, Vec::new())
    }

    /// Use other sysfs/dev roots and a wrapped recorder program
    ///
    /// `leading_args` go before the recorder arguments, for wrappers such
    /// as `pkexec wodim` or a shell running a script.
    pub fn with_roots(
        sys_block: impl Into<PathBuf>,
        dev_root: impl Into<PathBuf>,
        program: impl Into<PathBuf>,
        leading_args: Vec<String>,
    ) -> Self {
        Self {
            sys_block: sys_block.into(),
            dev_root: dev_root.into(),
            program: program.into(),
            leading_args,
        }
    }

    /// Kernel name (`sr0`) behind a recorder id
    ///
    /// Only ids of the form `<dev_root>/sr*` whose sysfs entry has a
    /// `device` directory are accepted.
    fn device_name(&self, unique_id: &str) -> Option<String> {
        let path = Path::new(unique_id);
        let name = path.file_name()?.to_str()?;
        if path.parent()? != self.dev_root.as_path() || !name.starts_with("sr") {
            return None;
        }
        self.sys_block
            .join(name)
            .join("device")
            .is_dir()
            .then(|| name.to_string())
    }

    fn validated(&self, unique_id: &str) -> Result<String> {
        self.device_name(unique_id).ok_or_else(|| {
            log::warn!("{} is not an enumerated recorder", unique_id);
            DiscError::native("open_recorder", libc::ENODEV as u32)
        })
    }
}

impl RecorderSubsystem for SysfsRecorderSubsystem {
    fn recorder_ids(&self) -> Result<Vec<String>> {
        let entries = match fs::read_dir(&self.sys_block) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(io_native("enumerate recorders", &e)),
        };

        let mut names: Vec<String> = entries
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| entry.file_name().to_str().map(str::to_string))
            .filter(|name| name.starts_with("sr"))
            .collect();
        names.sort();

        Ok(names
            .into_iter()
            .map(|name| self.dev_root.join(name).display().to_string())
            .collect())
    }

    fn open_recorder(&self, unique_id: &str) -> Result<Box<dyn Recorder>> {
        let name = self.validated(unique_id)?;

        Ok(Box::new(SysfsRecorder {
            unique_id: self.dev_root.join(&name).display().to_string(),
            device_dir: self.sys_block.join(&name).join("device"),
        }))
    }

    fn create_session(
        &self,
        recorder: Box<dyn Recorder>,
        config: &SessionConfig,
    ) -> Result<Box<dyn WriteSession>> {
        let name = self.validated(recorder.unique_id())?;

        Ok(Box::new(RecordingSession {
            program: self.program.clone(),
            leading_args: self.leading_args.clone(),
            device: self.dev_root.join(name).display().to_string(),
            config: config.clone(),
            handlers: ProgressHandlers::default(),
        }))
    }
}

struct SysfsRecorder {
    unique_id: String,
    device_dir: PathBuf,
}

impl SysfsRecorder {
    fn attribute(&self, name: &str) -> Result<String> {
        match fs::read_to_string(self.device_dir.join(name)) {
            Ok(value) => Ok(value.trim().to_string()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
            Err(e) => Err(io_native(&format!("read {} of {}", name, self.unique_id), &e)),
        }
    }
}

impl Recorder for SysfsRecorder {
    fn unique_id(&self) -> &str {
        &self.unique_id
    }

    fn manufacturer_id(&self) -> Result<String> {
        self.attribute("vendor")
    }

    fn product_id(&self) -> Result<String> {
        self.attribute("model")
    }
}

struct RecordingSession {
    program: PathBuf,
    leading_args: Vec<String>,
    device: String,
    config: SessionConfig,
    handlers: ProgressHandlers,
}

impl RecordingSession {
    fn recorder_args(&self, size: u64) -> Vec<String> {
        let mut args = self.leading_args.clone();
        args.push("-v".to_string());
        args.push("-dao".to_string());
        args.push(format!("dev={}", self.device));
        args.push(format!("tsize={}", size));
        if !self.config.buffer_underrun_free_disabled {
            args.push("driveropts=burnfree".to_string());
        }
        args.push("-".to_string());
        args
    }

    fn program_name(&self) -> String {
        self.program.display().to_string()
    }

    /// Feed the whole source into the recorder's stdin, emitting progress
    ///
    /// Returns `Ok(false)` when the recorder closed its input early.
    fn pump(&self, source: &mut dyn SequentialStorage, stdin: ChildStdin, size: u64) -> Result<bool> {
        let mut sink = PipeSink {
            stdin,
            written: 0,
        };
        let started = Instant::now();
        let mut last_emitted = -1i64;

        loop {
            let totals = match source.copy_to(&mut sink, COPY_CHUNK_SIZE as u64) {
                Ok(totals) => totals,
                Err(DiscError::Io(e)) if e.kind() == std::io::ErrorKind::BrokenPipe => {
                    log::warn!("{} closed its input after {} bytes", self.program_name(), sink.written);
                    return Ok(false);
                }
                Err(e) => return Err(e),
            };
            if totals.bytes_read == 0 {
                break;
            }

            let elapsed = started.elapsed().as_secs_f64();
            let elapsed_units = elapsed as i64;
            if elapsed_units != last_emitted {
                last_emitted = elapsed_units;
                let estimated = elapsed * size as f64 / sink.written.max(1) as f64;
                self.handlers.emit(elapsed_units, estimated.round() as i64);
            }
        }

        let elapsed_units = started.elapsed().as_secs().max(1) as i64;
        self.handlers.emit(elapsed_units, elapsed_units);
        Ok(true)
    }

    fn verify(&self, source: &dyn SequentialStorage, size: u64) -> Result<()> {
        let limit = match self.config.verification {
            VerificationLevel::None => return Ok(()),
            VerificationLevel::Quick => size.min(QUICK_VERIFY_BYTES),
            VerificationLevel::Full => size,
        };
        log::info!("Verifying {} bytes on {}", limit, self.device);

        let mut original = source.clone_storage()?;
        original.seek(0, SeekOrigin::Start)?;
        let mut burned = File::open(&self.device)
            .map_err(|e| io_native(&format!("open {} for verification", self.device), &e))?;

        let mut expected = vec![0u8; COPY_CHUNK_SIZE];
        let mut actual = vec![0u8; COPY_CHUNK_SIZE];
        let mut offset = 0u64;

        while offset < limit {
            let want = (limit - offset).min(COPY_CHUNK_SIZE as u64) as usize;
            let read = original.read(&mut expected[..want])?;
            if read == 0 {
                break;
            }
            burned
                .read_exact(&mut actual[..read])
                .map_err(|e| io_native(&format!("read back {}", self.device), &e))?;

            if let Some(index) = expected[..read]
                .iter()
                .zip(&actual[..read])
                .position(|(a, b)| a != b)
            {
                return Err(DiscError::Native {
                    operation: "verify".to_string(),
                    code: libc::EIO as u32,
                    message: format!(
                        "Data on {} differs from the image at byte {}",
                        self.device,
                        offset + index as u64
                    ),
                });
            }
            offset += read as u64;
        }

        log::info!("Verification passed ({} bytes)", offset);
        Ok(())
    }
}

impl WriteSession for RecordingSession {
    fn subscribe(&mut self, handler: ProgressHandler) -> SubscriptionToken {
        self.handlers.add(handler)
    }

    fn unsubscribe(&mut self, token: SubscriptionToken) -> bool {
        self.handlers.remove(token)
    }

    fn write(&mut self, source: &mut dyn SequentialStorage) -> Result<()> {
        let size = source.stat()?.size;
        source.seek(0, SeekOrigin::Start)?;

        log::info!(
            "{}: writing {} bytes to {} with {}",
            self.config.client_name,
            size,
            self.device,
            self.program_name()
        );

        let mut child = Command::new(&self.program)
            .args(self.recorder_args(size))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| io_native(&format!("start {}", self.program_name()), &e))?;

        let stdout_thread = child.stdout.take().map(|stdout| {
            std::thread::spawn(move || {
                for line in BufReader::new(stdout).lines().map_while(|l| l.ok()) {
                    log::debug!("recorder: {}", line);
                }
            })
        });
        let stderr_thread = child.stderr.take().map(collect_lines);

        let pumped = match child.stdin.take() {
            Some(stdin) => self.pump(source, stdin, size),
            None => Ok(false),
        };

        let complete = match pumped {
            Ok(complete) => complete,
            Err(e) => {
                stop_child(&mut child);
                return Err(e);
            }
        };

        let status = child
            .wait()
            .map_err(|e| io_native(&format!("wait for {}", self.program_name()), &e))?;
        if let Some(handle) = stdout_thread {
            let _ = handle.join();
        }
        let stderr_lines = stderr_thread
            .and_then(|handle| handle.join().ok())
            .unwrap_or_default();

        if !status.success() {
            let message = stderr_lines
                .last()
                .cloned()
                .unwrap_or_else(|| format!("{} exited with {}", self.program_name(), status));
            return Err(DiscError::Native {
                operation: format!("{} write", self.program_name()),
                code: status.code().unwrap_or(-1) as u32,
                message,
            });
        }

        if !complete {
            return Err(DiscError::Native {
                operation: format!("{} write", self.program_name()),
                code: libc::EPIPE as u32,
                message: "Recorder stopped reading before the end of the image".to_string(),
            });
        }

        log::info!("Write to {} finished", self.device);
        self.verify(source, size)
    }
}

fn collect_lines(stderr: std::process::ChildStderr) -> JoinHandle<Vec<String>> {
    std::thread::spawn(move || {
        let mut lines = Vec::new();
        for line in BufReader::new(stderr).lines().map_while(|l| l.ok()) {
            log::debug!("recorder: {}", line);
            if !line.trim().is_empty() {
                lines.push(line);
            }
        }
        lines
    })
}

fn stop_child(child: &mut Child) {
    let _ = child.kill();
    let _ = child.wait();
}

fn io_native(operation: &str, err: &std::io::Error) -> DiscError {
    let code = err.raw_os_error().unwrap_or(libc::EIO);
    DiscError::native(operation, code as u32)
}

/// Write-only storage over the recorder program's stdin
struct PipeSink {
    stdin: ChildStdin,
    written: u64,
}

impl SequentialStorage for PipeSink {
    fn read(&mut self, _buf: &mut [u8]) -> Result<usize> {
        Err(DiscError::NotSupported("read from recorder input".to_string()))
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        self.stdin.write_all(buf)?;
        self.written += buf.len() as u64;
        Ok(buf.len())
    }

    fn seek(&mut self, _offset: i64, _origin: SeekOrigin) -> Result<u64> {
        Err(DiscError::NotSupported("seek on recorder input".to_string()))
    }

    fn set_size(&mut self, _new_size: u64) -> Result<()> {
        Err(DiscError::NotSupported("resize recorder input".to_string()))
    }

    fn copy_to(&mut self, _destination: &mut dyn SequentialStorage, _byte_count: u64) -> Result<CopyTotals> {
        Err(DiscError::NotSupported("copy from recorder input".to_string()))
    }

    fn commit(&mut self) -> Result<()> {
        self.stdin.flush()?;
        Ok(())
    }

    fn revert(&mut self) -> Result<()> {
        Err(DiscError::NotSupported("revert recorder input".to_string()))
    }

    fn lock_region(&mut self, _offset: u64, _len: u64, _lock_type: u32) -> Result<()> {
        Ok(())
    }

    fn unlock_region(&mut self, _offset: u64, _len: u64, _lock_type: u32) -> Result<()> {
        Ok(())
    }

    fn stat(&mut self) -> Result<StorageStat> {
        Ok(StorageStat {
            size: self.written,
            kind: StorageKind::Stream,
            clsid: Uuid::nil(),
        })
    }

    fn clone_storage(&self) -> Result<Box<dyn SequentialStorage>> {
        Err(DiscError::NotSupported("clone recorder input".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::burning::stream_bridge::StreamBridge;
    use std::sync::{Arc, Mutex};
    use tempfile::TempDir;

    /// Fake sysfs with `sr0` (vendor/model) and `sr1` (no attributes)
    fn fake_roots() -> TempDir {
        let dir = TempDir::new().unwrap();
        let sr0 = dir.path().join("sys/sr0/device");
        fs::create_dir_all(&sr0).unwrap();
        fs::write(sr0.join("vendor"), "HL-DT-ST\n").unwrap();
        fs::write(sr0.join("model"), "DVDRAM GH24NSD1 \n").unwrap();
        fs::create_dir_all(dir.path().join("sys/sr1/device")).unwrap();
        fs::create_dir_all(dir.path().join("sys/sda/device")).unwrap();
        fs::create_dir_all(dir.path().join("dev")).unwrap();
        dir
    }

    /// Shell script that behaves like the recorder program: it copies stdin
    /// to the `dev=` target, optionally corrupting the first byte.
    fn recorder_script(dir: &Path, body: &str) -> PathBuf {
        let script = dir.join("recorder.sh");
        let text = format!(
            "for arg in \"$@\"; do case \"$arg\" in dev=*) dev=\"${{arg#dev=}}\";; esac; done\n\
             echo \"$@\" > \"{}\"\n{}\n",
            dir.join("args.txt").display(),
            body
        );
        fs::write(&script, text).unwrap();
        script
    }

    fn subsystem(dir: &TempDir, script: &Path) -> SysfsRecorderSubsystem {
        SysfsRecorderSubsystem::with_roots(
            dir.path().join("sys"),
            dir.path().join("dev"),
            "/bin/sh",
            vec![script.display().to_string()],
        )
    }

    fn image_file(dir: &TempDir, len: usize) -> PathBuf {
        let path = dir.path().join("image.iso");
        let data: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
        fs::write(&path, data).unwrap();
        path
    }

    fn config(verification: VerificationLevel) -> SessionConfig {
        SessionConfig {
            client_name: "Discwright".to_string(),
            verification,
            buffer_underrun_free_disabled: false,
        }
    }

    #[test]
    fn test_enumerates_only_sr_devices() {
        let dir = fake_roots();
        let subsystem = SysfsRecorderSubsystem::with_roots(
            dir.path().join("sys"),
            dir.path().join("dev"),
            "wodim",
            Vec::new(),
        );
        let ids = subsystem.recorder_ids().unwrap();
        let dev = dir.path().join("dev");
        assert_eq!(
            ids,
            vec![
                dev.join("sr0").display().to_string(),
                dev.join("sr1").display().to_string()
            ]
        );
    }

    #[test]
    fn test_missing_sys_block_means_no_recorders() {
        let dir = TempDir::new().unwrap();
        let subsystem =
            SysfsRecorderSubsystem::with_roots(dir.path().join("nope"), "/dev", "wodim", Vec::new());
        assert!(subsystem.recorder_ids().unwrap().is_empty());
    }

    #[test]
    fn test_recorder_attributes() {
        let dir = fake_roots();
        let subsystem = SysfsRecorderSubsystem::with_roots(
            dir.path().join("sys"),
            dir.path().join("dev"),
            "wodim",
            Vec::new(),
        );
        let dev = dir.path().join("dev");
        let sr0 = subsystem
            .open_recorder(&dev.join("sr0").display().to_string())
            .unwrap();
        assert_eq!(sr0.manufacturer_id().unwrap(), "HL-DT-ST");
        assert_eq!(sr0.product_id().unwrap(), "DVDRAM GH24NSD1");

        let sr1 = subsystem
            .open_recorder(&dev.join("sr1").display().to_string())
            .unwrap();
        assert_eq!(sr1.manufacturer_id().unwrap(), "");
        assert_eq!(sr1.product_id().unwrap(), "");
    }

    #[test]
    fn test_open_unknown_recorder_is_native_error() {
        let dir = fake_roots();
        let subsystem = SysfsRecorderSubsystem::with_roots(
            dir.path().join("sys"),
            dir.path().join("dev"),
            "wodim",
            Vec::new(),
        );
        let dev = dir.path().join("dev");
        assert_no_device(&subsystem, &dev.join("sr9").display().to_string());
    }

    fn assert_no_device(subsystem: &SysfsRecorderSubsystem, unique_id: &str) {
        match subsystem.open_recorder(unique_id) {
            Err(DiscError::Native { operation, code, .. }) => {
                assert_eq!(operation, "open_recorder");
                assert_eq!(code, libc::ENODEV as u32);
            }
            Err(e) => panic!("unexpected error for {}: {:?}", unique_id, e),
            Ok(_) => panic!("{} should not open", unique_id),
        }
    }

    #[test]
    fn test_open_rejects_ids_that_were_never_enumerated() {
        let dir = fake_roots();
        let subsystem = SysfsRecorderSubsystem::with_roots(
            dir.path().join("sys"),
            dir.path().join("dev"),
            "wodim",
            Vec::new(),
        );
        let dev = dir.path().join("dev");

        // sda has a sysfs device directory but is not an optical drive
        assert_no_device(&subsystem, &dev.join("sda").display().to_string());
        // right kernel name under a directory other than the device root
        let stray = dir.path().join("elsewhere/sr0").display().to_string();
        assert_no_device(&subsystem, &stray);
        assert_no_device(&subsystem, "sr0");

        for id in subsystem.recorder_ids().unwrap() {
            assert_eq!(subsystem.open_recorder(&id).unwrap().unique_id(), id);
        }
    }

    #[test]
    fn test_session_targets_the_validated_device_node() {
        let dir = fake_roots();
        let subsystem = SysfsRecorderSubsystem::with_roots(
            dir.path().join("sys"),
            dir.path().join("dev"),
            "wodim",
            Vec::new(),
        );
        let id = format!("{}/./sr0", dir.path().join("dev").display());
        let recorder = subsystem.open_recorder(&id).unwrap();
        assert_eq!(
            recorder.unique_id(),
            dir.path().join("dev/sr0").display().to_string()
        );
    }

    #[test]
    fn test_recorder_arguments() {
        let session = RecordingSession {
            program: PathBuf::from("wodim"),
            leading_args: Vec::new(),
            device: "/dev/sr0".to_string(),
            config: config(VerificationLevel::Full),
            handlers: ProgressHandlers::default(),
        };
        assert_eq!(
            session.recorder_args(4096),
            vec!["-v", "-dao", "dev=/dev/sr0", "tsize=4096", "driveropts=burnfree", "-"]
        );

        let session = RecordingSession {
            config: SessionConfig {
                buffer_underrun_free_disabled: true,
                ..config(VerificationLevel::Full)
            },
            ..session
        };
        assert!(!session.recorder_args(4096).contains(&"driveropts=burnfree".to_string()));
    }

    #[test]
    fn test_write_and_full_verify() {
        let dir = fake_roots();
        let script = recorder_script(dir.path(), "cat > \"$dev\"");
        let subsystem = subsystem(&dir, &script);
        let device = dir.path().join("dev/sr0").display().to_string();
        let image = image_file(&dir, 300 * 1024);

        let recorder = subsystem.open_recorder(&device).unwrap();
        let mut session = subsystem
            .create_session(recorder, &config(VerificationLevel::Full))
            .unwrap();

        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        let token = session.subscribe(Arc::new(move |e, t| sink.lock().unwrap().push((e, t))));

        let mut source = StreamBridge::open_file(&image).unwrap();
        session.write(&mut source).unwrap();
        assert!(session.unsubscribe(token));

        assert_eq!(fs::read(&device).unwrap(), fs::read(&image).unwrap());
        let events = events.lock().unwrap();
        let (elapsed, total) = *events.last().unwrap();
        assert!(total > 0);
        assert!(elapsed <= total);

        let args = fs::read_to_string(dir.path().join("args.txt")).unwrap();
        assert!(args.contains(&format!("tsize={}", 300 * 1024)));
        assert!(args.contains("-dao"));
    }

    #[test]
    fn test_verify_detects_corruption() {
        let dir = fake_roots();
        let script = recorder_script(dir.path(), "cat > /dev/null; printf 'X' > \"$dev\"; head -c 4095 /dev/zero >> \"$dev\"");
        let subsystem = subsystem(&dir, &script);
        let device = dir.path().join("dev/sr0").display().to_string();
        let image = image_file(&dir, 4096);

        let recorder = subsystem.open_recorder(&device).unwrap();
        let mut session = subsystem
            .create_session(recorder, &config(VerificationLevel::Quick))
            .unwrap();
        let mut source = StreamBridge::open_file(&image).unwrap();

        match session.write(&mut source) {
            Err(DiscError::Native { operation, message, .. }) => {
                assert_eq!(operation, "verify");
                assert!(message.contains("byte 0"));
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_skip_verification() {
        let dir = fake_roots();
        let script = recorder_script(dir.path(), "cat > /dev/null");
        let subsystem = subsystem(&dir, &script);
        let device = dir.path().join("dev/sr0").display().to_string();
        let image = image_file(&dir, 8192);

        let recorder = subsystem.open_recorder(&device).unwrap();
        let mut session = subsystem
            .create_session(recorder, &config(VerificationLevel::None))
            .unwrap();
        let mut source = StreamBridge::open_file(&image).unwrap();
        session.write(&mut source).unwrap();
    }

    #[test]
    fn test_recorder_failure_reports_exit_code_and_message() {
        let dir = fake_roots();
        let script = recorder_script(dir.path(), "cat > /dev/null; echo 'No disk / Wrong disk!' >&2; exit 3");
        let subsystem = subsystem(&dir, &script);
        let device = dir.path().join("dev/sr0").display().to_string();
        let image = image_file(&dir, 4096);

        let recorder = subsystem.open_recorder(&device).unwrap();
        let mut session = subsystem
            .create_session(recorder, &config(VerificationLevel::None))
            .unwrap();
        let mut source = StreamBridge::open_file(&image).unwrap();

        match session.write(&mut source) {
            Err(DiscError::Native { code, message, .. }) => {
                assert_eq!(code, 3);
                assert_eq!(message, "No disk / Wrong disk!");
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }
}

//! Sequential-storage adapter for the recorder subsystem
//!
//! The recorder consumes data through the `SequentialStorage` contract: the
//! small read/write/seek/stat surface of a native stream object. `StreamBridge`
//! exposes any seekable byte stream (a `File`, an in-memory cursor) through that
//! contract. An optional re-open factory lets the recorder clone the bridge to
//! get an independent cursor over the same data, which it uses for
//! verification passes.

use std::fs::File;
use std::io::{self, Cursor, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use uuid::Uuid;

use crate::error::{DiscError, Result};

/// Chunk size used by `copy_to`
pub const COPY_CHUNK_SIZE: usize = 80 * 1024;

/// Reference point for `seek`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekOrigin {
    Start,
    Current,
    End,
}

/// Storage type tag reported by `stat`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum StorageKind {
    Storage = 1,
    Stream = 2,
    LockBytes = 3,
}

/// Result of `stat`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StorageStat {
    pub size: u64,
    pub kind: StorageKind,
    pub clsid: Uuid,
}

/// Byte counts reported by `copy_to`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CopyTotals {
    pub bytes_read: u64,
    /// Bytes the destination confirmed accepting
    pub bytes_written: u64,
}

/// The storage contract the recorder subsystem writes from
pub trait SequentialStorage: Send {
    /// Read up to `buf.len()` bytes. Fewer bytes are only returned at end of data.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize>;

    /// Write all of `buf` or fail
    fn write(&mut self, buf: &[u8]) -> Result<usize>;

    fn seek(&mut self, offset: i64, origin: SeekOrigin) -> Result<u64>;

    fn set_size(&mut self, new_size: u64) -> Result<()>;

    /// Copy up to `byte_count` bytes from the current position into `destination`
    fn copy_to(
        &mut self,
        destination: &mut dyn SequentialStorage,
        byte_count: u64,
    ) -> Result<CopyTotals>;

    fn commit(&mut self) -> Result<()>;

    fn revert(&mut self) -> Result<()>;

    fn lock_region(&mut self, offset: u64, len: u64, lock_type: u32) -> Result<()>;

    fn unlock_region(&mut self, offset: u64, len: u64, lock_type: u32) -> Result<()>;

    fn stat(&mut self) -> Result<StorageStat>;

    /// Open an independent cursor over the same data
    fn clone_storage(&self) -> Result<Box<dyn SequentialStorage>>;
}

/// A seekable byte stream that can also change its length
pub trait ByteStream: Read + Write + Seek + Send {
    fn set_len(&mut self, len: u64) -> io::Result<()>;
}

impl ByteStream for File {
    fn set_len(&mut self, len: u64) -> io::Result<()> {
        File::set_len(self, len)
    }
}

impl ByteStream for Cursor<Vec<u8>> {
    fn set_len(&mut self, len: u64) -> io::Result<()> {
        let len = usize::try_from(len)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "length too large"))?;
        self.get_mut().resize(len, 0);
        Ok(())
    }
}

/// Produces a fresh stream over the same logical data
pub type ReopenFactory<S> = Arc<dyn Fn() -> io::Result<S> + Send + Sync>;

pub struct StreamBridge<S: ByteStream> {
    inner: S,
    reopen: Option<ReopenFactory<S>>,
}

impl<S: ByteStream> StreamBridge<S> {
    /// Wrap a stream without clone support
    pub fn new(inner: S) -> Self {
        Self { inner, reopen: None }
    }

    /// Wrap a stream; `clone_storage` will call `reopen` for each clone
    pub fn with_reopen(inner: S, reopen: ReopenFactory<S>) -> Self {
        Self {
            inner,
            reopen: Some(reopen),
        }
    }

    pub fn into_inner(self) -> S {
        self.inner
    }

    fn stream_len(&mut self) -> io::Result<u64> {
        let position = self.inner.stream_position()?;
        let len = self.inner.seek(SeekFrom::End(0))?;
        if position != len {
            self.inner.seek(SeekFrom::Start(position))?;
        }
        Ok(len)
    }
}

impl StreamBridge<File> {
    /// Open `path` read-only, re-opening it the same way for clones
    pub fn open_file(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|e| DiscError::from_io_at(e, path))?;
        let reopen_path: PathBuf = path.to_path_buf();
        Ok(Self::with_reopen(
            file,
            Arc::new(move || File::open(&reopen_path)),
        ))
    }
}

impl<S: ByteStream + 'static> SequentialStorage for StreamBridge<S> {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let mut filled = 0;
        while filled < buf.len() {
            match self.inner.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(filled)
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        self.inner.write_all(buf)?;
        Ok(buf.len())
    }

    fn seek(&mut self, offset: i64, origin: SeekOrigin) -> Result<u64> {
        let target = match origin {
            SeekOrigin::Start => {
                let start = u64::try_from(offset).map_err(|_| {
                    DiscError::InvalidArgument(format!("negative seek offset {}", offset))
                })?;
                SeekFrom::Start(start)
            }
            SeekOrigin::Current => SeekFrom::Current(offset),
            SeekOrigin::End => SeekFrom::End(offset),
        };
        self.inner.seek(target).map_err(|e| {
            if e.kind() == io::ErrorKind::InvalidInput {
                DiscError::InvalidArgument(format!("seek before start of stream: {}", e))
            } else {
                DiscError::Io(e)
            }
        })
    }

    fn set_size(&mut self, new_size: u64) -> Result<()> {
        self.inner.set_len(new_size)?;
        Ok(())
    }

    fn copy_to(
        &mut self,
        destination: &mut dyn SequentialStorage,
        byte_count: u64,
    ) -> Result<CopyTotals> {
        let mut buffer = vec![0u8; COPY_CHUNK_SIZE];
        let mut totals = CopyTotals::default();
        let mut remaining = byte_count;

        while remaining > 0 {
            let to_read = remaining.min(COPY_CHUNK_SIZE as u64) as usize;
            let read = SequentialStorage::read(self, &mut buffer[..to_read])?;
            if read == 0 {
                break;
            }
            totals.bytes_read += read as u64;
            remaining -= read as u64;

            let accepted = destination.write(&buffer[..read])?;
            totals.bytes_written += accepted.min(read) as u64;
            if accepted < read {
                log::warn!(
                    "Copy destination accepted {} of {} bytes; stopping",
                    accepted,
                    read
                );
                break;
            }
        }

        Ok(totals)
    }

    fn commit(&mut self) -> Result<()> {
        self.inner.flush()?;
        Ok(())
    }

    fn revert(&mut self) -> Result<()> {
        Err(DiscError::NotSupported(
            "revert: no transactional rollback for streams".to_string(),
        ))
    }

    fn lock_region(&mut self, _offset: u64, _len: u64, _lock_type: u32) -> Result<()> {
        Ok(())
    }

    fn unlock_region(&mut self, _offset: u64, _len: u64, _lock_type: u32) -> Result<()> {
        Ok(())
    }

    fn stat(&mut self) -> Result<StorageStat> {
        Ok(StorageStat {
            size: self.stream_len()?,
            kind: StorageKind::Stream,
            clsid: Uuid::nil(),
        })
    }

    fn clone_storage(&self) -> Result<Box<dyn SequentialStorage>> {
        let reopen = self.reopen.as_ref().ok_or_else(|| {
            DiscError::NotSupported("clone is not supported for this stream".to_string())
        })?;
        let stream = reopen()?;
        Ok(Box::new(StreamBridge::with_reopen(stream, Arc::clone(reopen))))
    }
}

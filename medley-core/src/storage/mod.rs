//! Uniform async interface over local and remote object stores.
//!
//! A backend implements [`ObjectStorage`]; callers drive it through an
//! [`AsaHandle`], which owns the per-job state (open file, read buffer,
//! scandir cursor). Exactly one operation is outstanding per handle at any
//! time - the `&mut self` surface enforces it structurally and an
//! always-on guard pins it for trait objects that complete out of band.
//!
//! Completion model: the original vtable distinguished `accept`
//! (asynchronous completion, callback fires later) from `complete`
//! (synchronous, caller chains explicitly). Under `async` the distinction
//! collapses into the `.await`; the remaining status vocabulary survives as
//! [`StorageError`] variants.

pub mod localfs;
pub mod transfer;
pub mod version;

use std::fmt;
use std::io;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StorageError {
    /// Caller contract breach: no open file, op misuse, malformed path.
    #[error("invalid storage argument")]
    Arg,

    #[error("storage os error: {0}")]
    Os(#[from] io::Error),

    /// Payload corruption or protocol violation reported by the backend.
    #[error("storage data error")]
    Data,

    /// Orderly end of a directory scan.
    #[error("end of directory scan")]
    EofScan,

    #[error("unknown storage error")]
    Unknown,
}

/// Entry type as reported by a directory scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirentType {
    File,
    Dir,
    Unknown,
}

/// One directory entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dirent {
    pub name: String,
    pub dtype: DirentType,
}

/// Open disposition for [`ObjectStorage::open`].
#[derive(Debug, Clone, Copy, Default)]
pub struct OpenFlags {
    pub read: bool,
    pub write: bool,
    pub create: bool,
    pub truncate: bool,
}

impl OpenFlags {
    pub fn read_only() -> Self {
        Self {
            read: true,
            ..Default::default()
        }
    }

    pub fn write_create() -> Self {
        Self {
            write: true,
            create: true,
            truncate: true,
            ..Default::default()
        }
    }
}

/// An open file (or object) on some backend.
#[async_trait]
pub trait StorageFile: Send + fmt::Debug {
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, StorageError>;
    async fn write(&mut self, buf: &[u8]) -> Result<usize, StorageError>;
    async fn seek(&mut self, pos: SeekFrom) -> Result<u64, StorageError>;
    /// Flush and release the underlying descriptor.
    async fn close(self: Box<Self>) -> Result<(), StorageError>;
}

/// Backend half of the storage abstraction. Implementations resolve paths
/// against their own base and never own the calling handle.
#[async_trait]
pub trait ObjectStorage: Send + Sync + fmt::Debug {
    async fn open(&self, path: &Path, flags: OpenFlags)
    -> Result<Box<dyn StorageFile>, StorageError>;
    async fn mkdir(&self, path: &Path, allow_exist: bool) -> Result<(), StorageError>;
    async fn rmdir(&self, path: &Path) -> Result<(), StorageError>;
    async fn unlink(&self, path: &Path) -> Result<(), StorageError>;
    async fn rename(&self, from: &Path, to: &Path) -> Result<(), StorageError>;
    async fn scandir(&self, path: &Path) -> Result<Vec<Dirent>, StorageError>;
}

#[derive(Debug, Default)]
struct ScandirCursor {
    path: PathBuf,
    entries: Vec<Dirent>,
    rd_idx: usize,
}

/// Per-job storage handle: one backend, at most one open file, one read
/// buffer and one scandir cursor. The caller owns the handle and its
/// teardown; the backend never does.
#[derive(Debug)]
pub struct AsaHandle {
    storage: Arc<dyn ObjectStorage>,
    file: Option<Box<dyn StorageFile>>,
    open_path: Option<PathBuf>,
    read_buf: Vec<u8>,
    scandir: ScandirCursor,
    op_in_flight: bool,
}

impl AsaHandle {
    pub fn new(storage: Arc<dyn ObjectStorage>, read_buf_size: usize) -> Self {
        Self {
            storage,
            file: None,
            open_path: None,
            read_buf: vec![0u8; read_buf_size],
            scandir: ScandirCursor::default(),
            op_in_flight: false,
        }
    }

    pub fn storage(&self) -> &Arc<dyn ObjectStorage> {
        &self.storage
    }

    /// Path of the currently open file, if any.
    pub fn open_path(&self) -> Option<&Path> {
        self.open_path.as_deref()
    }

    pub fn read_buf(&self) -> &[u8] {
        &self.read_buf
    }

    pub fn read_buf_size(&self) -> usize {
        self.read_buf.len()
    }

    fn begin_op(&mut self) -> OpGuard<'_> {
        assert!(!self.op_in_flight, "overlapping storage op on one handle");
        self.op_in_flight = true;
        OpGuard(self)
    }

    pub async fn open(&mut self, path: &Path, flags: OpenFlags) -> Result<(), StorageError> {
        if self.file.is_some() {
            return Err(StorageError::Arg);
        }
        let mut guard = self.begin_op();
        let this = &mut *guard.0;
        let file = this.storage.open(path, flags).await?;
        this.file = Some(file);
        this.open_path = Some(path.to_path_buf());
        Ok(())
    }

    pub async fn close(&mut self) -> Result<(), StorageError> {
        let mut guard = self.begin_op();
        let this = &mut *guard.0;
        let file = this.file.take().ok_or(StorageError::Arg)?;
        this.open_path = None;
        file.close().await
    }

    pub fn is_open(&self) -> bool {
        self.file.is_some()
    }

    /// Read up to `max` bytes into the handle's read buffer. Returns the
    /// number of bytes read; the data sits in `read_buf()[..n]`.
    pub async fn read(&mut self, max: usize) -> Result<usize, StorageError> {
        let mut guard = self.begin_op();
        let this = &mut *guard.0;
        let max = max.min(this.read_buf.len());
        let file = this.file.as_mut().ok_or(StorageError::Arg)?;
        file.read(&mut this.read_buf[..max]).await
    }

    pub async fn write(&mut self, src: &[u8]) -> Result<usize, StorageError> {
        let mut guard = self.begin_op();
        let this = &mut *guard.0;
        let file = this.file.as_mut().ok_or(StorageError::Arg)?;
        file.write(src).await
    }

    pub async fn seek(&mut self, pos: SeekFrom) -> Result<u64, StorageError> {
        let mut guard = self.begin_op();
        let this = &mut *guard.0;
        let file = this.file.as_mut().ok_or(StorageError::Arg)?;
        file.seek(pos).await
    }

    pub async fn mkdir(&mut self, path: &Path, allow_exist: bool) -> Result<(), StorageError> {
        let guard = self.begin_op();
        let res = guard.0.storage.mkdir(path, allow_exist).await;
        drop(guard);
        res
    }

    pub async fn rmdir(&mut self, path: &Path) -> Result<(), StorageError> {
        let guard = self.begin_op();
        let res = guard.0.storage.rmdir(path).await;
        drop(guard);
        res
    }

    pub async fn unlink(&mut self, path: &Path) -> Result<(), StorageError> {
        let guard = self.begin_op();
        let res = guard.0.storage.unlink(path).await;
        drop(guard);
        res
    }

    pub async fn rename(&mut self, from: &Path, to: &Path) -> Result<(), StorageError> {
        let guard = self.begin_op();
        let res = guard.0.storage.rename(from, to).await;
        drop(guard);
        res
    }

    /// Load the entries of `path` into the scandir cursor. Returns the
    /// number of entries found.
    pub async fn scandir(&mut self, path: &Path) -> Result<usize, StorageError> {
        let mut guard = self.begin_op();
        let this = &mut *guard.0;
        let entries = this.storage.scandir(path).await?;
        let found = entries.len();
        this.scandir = ScandirCursor {
            path: path.to_path_buf(),
            entries,
            rd_idx: 0,
        };
        Ok(found)
    }

    /// Pop the next entry of the loaded scan, or [`StorageError::EofScan`]
    /// at the end.
    pub fn scandir_next(&mut self) -> Result<Dirent, StorageError> {
        let entry = self
            .scandir
            .entries
            .get(self.scandir.rd_idx)
            .cloned()
            .ok_or(StorageError::EofScan)?;
        self.scandir.rd_idx += 1;
        Ok(entry)
    }

    /// Entries of the last scan, unconsumed by the cursor.
    pub fn scandir_entries(&self) -> &[Dirent] {
        &self.scandir.entries
    }

    /// Path the last scan ran against.
    pub fn scandir_path(&self) -> &Path {
        &self.scandir.path
    }

    pub fn scandir_rewind(&mut self) {
        self.scandir.rd_idx = 0;
    }
}

struct OpGuard<'a>(&'a mut AsaHandle);

impl Drop for OpGuard<'_> {
    fn drop(&mut self) {
        self.0.op_in_flight = false;
    }
}

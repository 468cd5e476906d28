//! Local filesystem backend, backed by the runtime's file operations.
//!
//! Every path is resolved against the backend's base directory, mirroring
//! the way each configured store carries its own base path. A second
//! instance rooted elsewhere doubles as the destination store in tests and
//! single-host deployments.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::debug;

use super::{Dirent, DirentType, ObjectStorage, OpenFlags, StorageError, StorageFile};

#[derive(Debug)]
pub struct LocalFsStorage {
    base_path: PathBuf,
}

impl LocalFsStorage {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn resolve(&self, path: &Path) -> Result<PathBuf, StorageError> {
        if path.is_absolute() || path.components().any(|c| matches!(c, std::path::Component::ParentDir)) {
            return Err(StorageError::Arg);
        }
        Ok(self.base_path.join(path))
    }
}

#[derive(Debug)]
struct LocalFile {
    file: fs::File,
}

#[async_trait]
impl StorageFile for LocalFile {
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, StorageError> {
        Ok(self.file.read(buf).await?)
    }

    async fn write(&mut self, buf: &[u8]) -> Result<usize, StorageError> {
        self.file.write_all(buf).await?;
        Ok(buf.len())
    }

    async fn seek(&mut self, pos: SeekFrom) -> Result<u64, StorageError> {
        Ok(self.file.seek(pos).await?)
    }

    async fn close(mut self: Box<Self>) -> Result<(), StorageError> {
        self.file.flush().await?;
        Ok(())
    }
}

#[async_trait]
impl ObjectStorage for LocalFsStorage {
    async fn open(
        &self,
        path: &Path,
        flags: OpenFlags,
    ) -> Result<Box<dyn StorageFile>, StorageError> {
        let full = self.resolve(path)?;
        let mut opts = fs::OpenOptions::new();
        opts.read(flags.read)
            .write(flags.write)
            .create(flags.create)
            .truncate(flags.truncate);
        let file = opts.open(&full).await?;
        debug!(path = %full.display(), "opened local file");
        Ok(Box::new(LocalFile { file }))
    }

    async fn mkdir(&self, path: &Path, allow_exist: bool) -> Result<(), StorageError> {
        let full = self.resolve(path)?;
        if allow_exist {
            return Ok(fs::create_dir_all(&full).await?);
        }
        // without allow_exist the final component must be freshly created,
        // relying on the OS-level exclusivity of mkdir(2)
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent).await?;
        }
        Ok(fs::create_dir(&full).await?)
    }

    async fn rmdir(&self, path: &Path) -> Result<(), StorageError> {
        let full = self.resolve(path)?;
        Ok(fs::remove_dir(&full).await?)
    }

    async fn unlink(&self, path: &Path) -> Result<(), StorageError> {
        let full = self.resolve(path)?;
        Ok(fs::remove_file(&full).await?)
    }

    async fn rename(&self, from: &Path, to: &Path) -> Result<(), StorageError> {
        let from = self.resolve(from)?;
        let to = self.resolve(to)?;
        Ok(fs::rename(&from, &to).await?)
    }

    async fn scandir(&self, path: &Path) -> Result<Vec<Dirent>, StorageError> {
        let full = self.resolve(path)?;
        let mut rd = fs::read_dir(&full).await?;
        let mut out = Vec::new();
        while let Some(entry) = rd.next_entry().await? {
            let dtype = match entry.file_type().await {
                Ok(ft) if ft.is_dir() => DirentType::Dir,
                Ok(ft) if ft.is_file() => DirentType::File,
                _ => DirentType::Unknown,
            };
            out.push(Dirent {
                name: entry.file_name().to_string_lossy().into_owned(),
                dtype,
            });
        }
        // directory-entry order must be stable across scans
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }
}

//! Local-buffer to destination-object transfer protocol.
//!
//! Every produced segment and manifest moves through the same sequence:
//! open the destination object, open the local file, pump the local read
//! buffer into the destination until EOF, close the local side, unlink the
//! local file, and only then close the destination.
//!
//! NOTE: unlinking the local file has to happen before closing the file on
//! the destination storage. Issuing both in the same loop iteration corrupts
//! backends that finalize the object on close.

use std::path::Path;

use tracing::debug;

use super::{AsaHandle, OpenFlags, StorageError};

/// Pump one local file into one destination object. Returns the number of
/// bytes transferred. The local file is gone afterwards.
pub async fn transfer_file(
    local: &mut AsaHandle,
    dst: &mut AsaHandle,
    local_path: &Path,
    dst_path: &Path,
) -> Result<u64, StorageError> {
    dst.open(dst_path, OpenFlags::write_create()).await?;
    if let Err(err) = local.open(local_path, OpenFlags::read_only()).await {
        let _ = dst.close().await;
        return Err(err);
    }
    let res = pump(local, dst).await;
    match res {
        Ok(total) => {
            local.close().await?;
            local.unlink(local_path).await?;
            dst.close().await?;
            debug!(src = %local_path.display(), dst = %dst_path.display(), total, "transferred file");
            Ok(total)
        }
        Err(err) => {
            let _ = local.close().await;
            let _ = dst.close().await;
            Err(err)
        }
    }
}

async fn pump(local: &mut AsaHandle, dst: &mut AsaHandle) -> Result<u64, StorageError> {
    let chunk = local.read_buf_size();
    let mut total = 0u64;
    loop {
        let nread = local.read(chunk).await?;
        if nread == 0 {
            return Ok(total);
        }
        let nwrite = dst.write(&local.read_buf()[..nread]).await?;
        if nwrite != nread {
            return Err(StorageError::Data);
        }
        total += nread as u64;
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;

    use super::*;
    use crate::storage::localfs::LocalFsStorage;
    use crate::storage::{Dirent, ObjectStorage, StorageFile};

    /// Wraps a real backend and appends `<tag>:<op>` markers to a shared
    /// log, so cross-handle ordering can be asserted.
    #[derive(Debug)]
    struct RecordingStorage {
        tag: &'static str,
        inner: LocalFsStorage,
        log: Arc<Mutex<Vec<String>>>,
    }

    impl RecordingStorage {
        fn record(&self, op: &str) {
            self.log.lock().unwrap().push(format!("{}:{}", self.tag, op));
        }
    }

    #[derive(Debug)]
    struct RecordingFile {
        tag: &'static str,
        inner: Box<dyn StorageFile>,
        log: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl StorageFile for RecordingFile {
        async fn read(&mut self, buf: &mut [u8]) -> Result<usize, StorageError> {
            self.inner.read(buf).await
        }

        async fn write(&mut self, buf: &[u8]) -> Result<usize, StorageError> {
            self.inner.write(buf).await
        }

        async fn seek(&mut self, pos: std::io::SeekFrom) -> Result<u64, StorageError> {
            self.inner.seek(pos).await
        }

        async fn close(self: Box<Self>) -> Result<(), StorageError> {
            self.log
                .lock()
                .unwrap()
                .push(format!("{}:close", self.tag));
            self.inner.close().await
        }
    }

    #[async_trait]
    impl ObjectStorage for RecordingStorage {
        async fn open(
            &self,
            path: &Path,
            flags: crate::storage::OpenFlags,
        ) -> Result<Box<dyn StorageFile>, StorageError> {
            self.record("open");
            let inner = self.inner.open(path, flags).await?;
            Ok(Box::new(RecordingFile {
                tag: self.tag,
                inner,
                log: Arc::clone(&self.log),
            }))
        }

        async fn mkdir(&self, path: &Path, allow_exist: bool) -> Result<(), StorageError> {
            self.record("mkdir");
            self.inner.mkdir(path, allow_exist).await
        }

        async fn rmdir(&self, path: &Path) -> Result<(), StorageError> {
            self.record("rmdir");
            self.inner.rmdir(path).await
        }

        async fn unlink(&self, path: &Path) -> Result<(), StorageError> {
            self.record("unlink");
            self.inner.unlink(path).await
        }

        async fn rename(&self, from: &Path, to: &Path) -> Result<(), StorageError> {
            self.record("rename");
            self.inner.rename(from, to).await
        }

        async fn scandir(&self, path: &Path) -> Result<Vec<Dirent>, StorageError> {
            self.record("scandir");
            self.inner.scandir(path).await
        }
    }

    fn recording_handle(
        tag: &'static str,
        dir: PathBuf,
        log: &Arc<Mutex<Vec<String>>>,
        buf_size: usize,
    ) -> AsaHandle {
        AsaHandle::new(
            Arc::new(RecordingStorage {
                tag,
                inner: LocalFsStorage::new(dir),
                log: Arc::clone(log),
            }),
            buf_size,
        )
    }

    #[tokio::test]
    async fn transfer_moves_bytes_and_removes_local() {
        let local_dir = tempfile::tempdir().unwrap();
        let dst_dir = tempfile::tempdir().unwrap();
        let payload: Vec<u8> = (0..300u32).map(|v| (v % 251) as u8).collect();
        std::fs::write(local_dir.path().join("seg0"), &payload).unwrap();

        let log = Arc::new(Mutex::new(Vec::new()));
        // a 64-byte buffer forces several read/write iterations
        let mut local = recording_handle("local", local_dir.path().into(), &log, 64);
        let mut dst = recording_handle("dst", dst_dir.path().into(), &log, 64);

        let total = transfer_file(&mut local, &mut dst, Path::new("seg0"), Path::new("seg0"))
            .await
            .unwrap();
        assert_eq!(total, 300);
        assert!(!local_dir.path().join("seg0").exists());
        assert_eq!(std::fs::read(dst_dir.path().join("seg0")).unwrap(), payload);
    }

    #[tokio::test]
    async fn local_unlink_precedes_destination_close() {
        let local_dir = tempfile::tempdir().unwrap();
        let dst_dir = tempfile::tempdir().unwrap();
        std::fs::write(local_dir.path().join("seg1"), b"data").unwrap();

        let log = Arc::new(Mutex::new(Vec::new()));
        let mut local = recording_handle("local", local_dir.path().into(), &log, 64);
        let mut dst = recording_handle("dst", dst_dir.path().into(), &log, 64);

        transfer_file(&mut local, &mut dst, Path::new("seg1"), Path::new("seg1"))
            .await
            .unwrap();

        let log = log.lock().unwrap().clone();
        let unlink_at = log.iter().position(|op| op == "local:unlink").unwrap();
        let dst_close_at = log.iter().position(|op| op == "dst:close").unwrap();
        let local_close_at = log.iter().position(|op| op == "local:close").unwrap();
        assert!(local_close_at < unlink_at);
        assert!(unlink_at < dst_close_at, "local unlink must precede destination close");
    }

    #[tokio::test]
    async fn missing_local_file_aborts_cleanly() {
        let local_dir = tempfile::tempdir().unwrap();
        let dst_dir = tempfile::tempdir().unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut local = recording_handle("local", local_dir.path().into(), &log, 64);
        let mut dst = recording_handle("dst", dst_dir.path().into(), &log, 64);

        let err = transfer_file(&mut local, &mut dst, Path::new("absent"), Path::new("out"))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Os(_)));
        assert!(!local.is_open());
        assert!(!dst.is_open());
    }
}

//! Transcoded-version folder lifecycle.
//!
//! The output of one upload request lives under
//! `<base>/<usr>/<upld_req:08x>/<status>/<version>` where `<status>` cycles
//! through a three-way ring: `transcoding` is the working copy, `committed`
//! is published, `discarded` is about to be reclaimed.

use std::path::{Path, PathBuf};

use tracing::{info, warn};

use super::{AsaHandle, DirentType, StorageError};

pub const STATUS_TRANSCODING: &str = "transcoding";
pub const STATUS_COMMITTED: &str = "committed";
pub const STATUS_DISCARDED: &str = "discarded";

/// Length of a version tag.
pub const VERSION_TAG_LEN: usize = 2;

/// `<usr>/<upld_req:08x>` - the request's folder, relative to the storage
/// base.
pub fn request_path(usr_id: u32, upld_req_id: u32) -> PathBuf {
    PathBuf::from(format!("{usr_id}/{upld_req_id:08x}"))
}

/// `<usr>/<upld_req:08x>/<status>` for one lifecycle status.
pub fn status_path(usr_id: u32, upld_req_id: u32, status: &str) -> PathBuf {
    request_path(usr_id, upld_req_id).join(status)
}

/// `<usr>/<upld_req:08x>/<status>/<version>` for one transcoded version.
pub fn version_path(usr_id: u32, upld_req_id: u32, status: &str, version: &str) -> PathBuf {
    status_path(usr_id, upld_req_id, status).join(version)
}

/// Create the working folder of a fresh version. The final path component
/// must not exist yet; the OS-level exclusivity of mkdir doubles as the
/// lock against two jobs transcoding the same version.
pub async fn create_version(
    asa: &mut AsaHandle,
    usr_id: u32,
    upld_req_id: u32,
    version: &str,
) -> Result<PathBuf, StorageError> {
    let path = version_path(usr_id, upld_req_id, STATUS_TRANSCODING, version);
    asa.mkdir(&path, false).await?;
    Ok(path)
}

/// Publish a transcoded version: the previous committed copy (if any) is
/// demoted to `discarded`, then the working copy is renamed into
/// `committed`.
pub async fn commit_version(
    asa: &mut AsaHandle,
    usr_id: u32,
    upld_req_id: u32,
    version: &str,
) -> Result<(), StorageError> {
    let committed_dir = status_path(usr_id, upld_req_id, STATUS_COMMITTED);
    let discarded_dir = status_path(usr_id, upld_req_id, STATUS_DISCARDED);
    asa.mkdir(&committed_dir, true).await?;

    let committed = committed_dir.join(version);
    match asa.scandir(&committed).await {
        Ok(_) => {
            asa.mkdir(&discarded_dir, true).await?;
            asa.rename(&committed, &discarded_dir.join(version)).await?;
            info!(usr_id, upld_req_id, version, "previous committed version discarded");
        }
        Err(StorageError::Os(_)) => {} // nothing committed yet
        Err(other) => return Err(other),
    }

    let working = version_path(usr_id, upld_req_id, STATUS_TRANSCODING, version);
    asa.rename(&working, &committed).await?;
    info!(usr_id, upld_req_id, version, "version committed");
    Ok(())
}

/// Reclaim one discarded version folder: unlink every entry, then remove
/// the folder itself.
pub async fn remove_version(
    asa: &mut AsaHandle,
    usr_id: u32,
    upld_req_id: u32,
    status: &str,
    version: &str,
) -> Result<(), StorageError> {
    let folder = version_path(usr_id, upld_req_id, status, version);
    let n = asa.scandir(&folder).await?;
    if n > 0 {
        loop {
            let entry = match asa.scandir_next() {
                Ok(entry) => entry,
                Err(StorageError::EofScan) => break,
                Err(other) => return Err(other),
            };
            if entry.dtype == DirentType::Dir {
                warn!(name = %entry.name, "unexpected subfolder in version folder");
                continue;
            }
            let target = folder.join(&entry.name);
            asa.unlink(&target).await?;
        }
    }
    asa.rmdir(&folder).await?;
    info!(usr_id, upld_req_id, status, version, "version folder reclaimed");
    Ok(())
}

/// Versions currently present under one status folder, in directory-entry
/// order. Only `VERSION_TAG_LEN`-character directory names qualify.
pub async fn list_versions(
    asa: &mut AsaHandle,
    usr_id: u32,
    upld_req_id: u32,
    status: &str,
) -> Result<Vec<String>, StorageError> {
    let folder = status_path(usr_id, upld_req_id, status);
    asa.scandir(&folder).await?;
    Ok(asa
        .scandir_entries()
        .iter()
        .filter(|e| e.dtype == DirentType::Dir && e.name.len() == VERSION_TAG_LEN)
        .map(|e| e.name.clone())
        .collect())
}

/// Scratch filename of one version's local working file:
/// `<stem>.<version>` next to the source scratch file.
pub fn local_output_path(src_scratch: &Path, version: &str) -> PathBuf {
    let mut os = src_scratch.as_os_str().to_os_string();
    os.push(".");
    os.push(version);
    PathBuf::from(os)
}

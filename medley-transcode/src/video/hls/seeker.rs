//! Master-playlist seeker.
//!
//! When a client requests the stream manifest, the committed versions of
//! the resource are merged into one master playlist: each version
//! contributes its first `#EXT-X-STREAM-INF` block followed by a URL line
//! pointing at that version's media playlist. Only the first version keeps
//! the `#EXTM3U` header.

use std::path::Path;

use thiserror::Error;
use tracing::{debug, warn};

use medley_core::storage::version::{STATUS_COMMITTED, VERSION_TAG_LEN, status_path};
use medley_core::storage::{AsaHandle, DirentType, OpenFlags, StorageError};

use super::{HLS_MASTER_PLAYLIST_FILENAME, HLS_PLAYLIST_FILENAME};

const STREAM_INF_TAG: &str = "\n#EXT-X-STREAM-INF";

#[derive(Error, Debug)]
pub enum SeekerError {
    /// No committed version carried a readable master playlist; maps to 404
    /// at the HTTP surface.
    #[error("source master playlist not found")]
    NotFound,

    #[error("storage failure while merging playlists: {0}")]
    Storage(#[from] StorageError),
}

/// Parameters of the manifest URL each merged block points at.
#[derive(Debug, Clone)]
pub struct SeekerParams {
    pub usr_id: u32,
    pub upld_req_id: u32,
    pub host_domain: String,
    pub host_path: String,
    pub doc_id: String,
    pub doc_id_label: String,
    pub detail_label: String,
}

impl SeekerParams {
    fn stream_url(&self, version: &str) -> String {
        format!(
            "https://{}{}?{}={}&{}={}/{}\n",
            self.host_domain,
            self.host_path,
            self.doc_id_label,
            self.doc_id,
            self.detail_label,
            version,
            HLS_PLAYLIST_FILENAME,
        )
    }
}

/// Merge the committed versions' master playlists into one manifest.
///
/// Playlists merge in directory-entry order; versions whose playlist is
/// missing or malformed are skipped. Zero merged playlists is
/// [`SeekerError::NotFound`].
pub async fn build_master_playlist(
    asa_src: &mut AsaHandle,
    params: &SeekerParams,
) -> Result<Vec<u8>, SeekerError> {
    let committed = status_path(params.usr_id, params.upld_req_id, STATUS_COMMITTED);
    asa_src.scandir(&committed).await.map_err(|e| match e {
        StorageError::Os(_) => SeekerError::NotFound,
        other => SeekerError::Storage(other),
    })?;
    let versions: Vec<String> = asa_src
        .scandir_entries()
        .iter()
        .filter(|e| e.dtype == DirentType::Dir && e.name.len() == VERSION_TAG_LEN)
        .map(|e| e.name.clone())
        .collect();

    let mut merged: Vec<u8> = Vec::new();
    let mut num_plist_merged = 0usize;
    for version in &versions {
        let plist_path = committed.join(version).join(HLS_MASTER_PLAYLIST_FILENAME);
        match merge_one_playlist(asa_src, &plist_path, params, version, num_plist_merged == 0).await
        {
            Ok(Some(block)) => {
                merged.extend_from_slice(&block);
                num_plist_merged += 1;
            }
            Ok(None) => {
                warn!(version = %version, "skipping version with invalid master playlist");
            }
            Err(err) => {
                // other video qualities may be encoded with non-HLS formats
                debug!(version = %version, error = %err, "skipping unreadable master playlist");
            }
        }
    }
    if num_plist_merged == 0 {
        return Err(SeekerError::NotFound);
    }
    Ok(merged)
}

/// Read one version's master playlist and cut its contribution: everything
/// from the start (first version) or from the stream-inf tag (later
/// versions) through the end of the tag line, followed by the generated URL
/// line.
async fn merge_one_playlist(
    asa_src: &mut AsaHandle,
    plist_path: &Path,
    params: &SeekerParams,
    version: &str,
    keep_header: bool,
) -> Result<Option<Vec<u8>>, StorageError> {
    asa_src.open(plist_path, OpenFlags::read_only()).await?;
    // one buffer is assumed sufficient for the leading ext-x tags
    let nread = match asa_src.read(asa_src.read_buf_size()).await {
        Ok(n) => n,
        Err(e) => {
            let _ = asa_src.close().await;
            return Err(e);
        }
    };
    asa_src.close().await?;

    let content = &asa_src.read_buf()[..nread];
    let Some(inf_start) = find(content, STREAM_INF_TAG.as_bytes()) else {
        return Ok(None);
    };
    let Some(nl_off) = find(&content[inf_start + 1..], b"\n") else {
        return Ok(None);
    };
    // past the newline terminating the stream-inf line
    let inf_end = inf_start + 1 + nl_off + 1;

    let from = if keep_header { 0 } else { inf_start };
    let mut block = content[from..inf_end].to_vec();
    block.extend_from_slice(params.stream_url(version).as_bytes());
    Ok(Some(block))
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use medley_core::storage::localfs::LocalFsStorage;
    use medley_core::storage::version::version_path;

    use super::*;

    const USR: u32 = 426;
    const REQ: u32 = 0x0cafe042;

    fn params() -> SeekerParams {
        SeekerParams {
            usr_id: USR,
            upld_req_id: REQ,
            host_domain: "cdn.example.com".into(),
            host_path: "/file/stream/init".into(),
            doc_id: "1c0ffee9".into(),
            doc_id_label: "doc_id".into(),
            detail_label: "d_detail".into(),
        }
    }

    fn write_master_playlist(base: &Path, version: &str, bandwidth: u32) {
        let dir = base.join(version_path(USR, REQ, STATUS_COMMITTED, version));
        std::fs::create_dir_all(&dir).unwrap();
        let body = format!(
            "#EXTM3U\n#EXT-X-VERSION:7\n#EXT-X-STREAM-INF:BANDWIDTH={bandwidth},RESOLUTION=1280x720\nmedia.m3u8\n"
        );
        std::fs::write(dir.join(HLS_MASTER_PLAYLIST_FILENAME), body).unwrap();
    }

    #[tokio::test]
    async fn merges_versions_in_directory_order() {
        let dir = tempfile::tempdir().unwrap();
        write_master_playlist(dir.path(), "Lq", 800_000);
        write_master_playlist(dir.path(), "aZ", 2_400_000);

        let mut asa = AsaHandle::new(Arc::new(LocalFsStorage::new(dir.path())), 4096);
        let merged = build_master_playlist(&mut asa, &params()).await.unwrap();
        let text = String::from_utf8(merged).unwrap();

        // exactly one header, from the first merged version
        assert_eq!(text.matches("#EXTM3U").count(), 1);
        assert!(text.starts_with("#EXTM3U"));
        assert_eq!(text.matches("#EXT-X-STREAM-INF").count(), 2);

        // directory order: Lq sorts before aZ (ascii)
        let lq_at = text.find("BANDWIDTH=800000").unwrap();
        let az_at = text.find("BANDWIDTH=2400000").unwrap();
        assert!(lq_at < az_at);

        // each block carries the generated URL for its version
        assert!(text.contains(
            "https://cdn.example.com/file/stream/init?doc_id=1c0ffee9&d_detail=Lq/plist.m3u8\n"
        ));
        assert!(text.contains(
            "https://cdn.example.com/file/stream/init?doc_id=1c0ffee9&d_detail=aZ/plist.m3u8\n"
        ));
    }

    #[tokio::test]
    async fn malformed_playlist_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        write_master_playlist(dir.path(), "Lq", 800_000);
        // a version folder whose playlist lacks the stream-inf tag
        let bad = dir
            .path()
            .join(version_path(USR, REQ, STATUS_COMMITTED, "zz"));
        std::fs::create_dir_all(&bad).unwrap();
        std::fs::write(bad.join(HLS_MASTER_PLAYLIST_FILENAME), "#EXTM3U\n").unwrap();

        let mut asa = AsaHandle::new(Arc::new(LocalFsStorage::new(dir.path())), 4096);
        let merged = build_master_playlist(&mut asa, &params()).await.unwrap();
        let text = String::from_utf8(merged).unwrap();
        assert_eq!(text.matches("#EXT-X-STREAM-INF").count(), 1);
        assert!(text.contains("d_detail=Lq/"));
    }

    #[tokio::test]
    async fn no_committed_version_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let mut asa = AsaHandle::new(Arc::new(LocalFsStorage::new(dir.path())), 4096);
        assert!(matches!(
            build_master_playlist(&mut asa, &params()).await,
            Err(SeekerError::NotFound)
        ));

        // committed folder exists but only houses junk
        let committed = dir.path().join(status_path(USR, REQ, STATUS_COMMITTED));
        std::fs::create_dir_all(committed.join("toolong")).unwrap();
        assert!(matches!(
            build_master_playlist(&mut asa, &params()).await,
            Err(SeekerError::NotFound)
        ));
    }
}

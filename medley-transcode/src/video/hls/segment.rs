//! Segment bookkeeping and the flush-to-storage path.
//!
//! The codec library offers no non-blocking way to learn when a segment
//! file is complete, so the processor scans the local scratch folder,
//! extracts the numeric indices behind the segment filename prefix and
//! transfers every index it can prove finished. The segment with the
//! currently largest index may still be growing; it is withheld until the
//! source reports end of stream.

use std::path::PathBuf;

use tracing::debug;

use medley_core::storage::transfer::transfer_file;
use medley_core::storage::{AsaHandle, Dirent, DirentType, StorageError};

#[derive(Debug, Default, Clone, Copy)]
pub struct SegmentFlags {
    pub asalocal_open: bool,
    pub asaremote_open: bool,
    /// The working (transcoding) version folder was created by this job.
    pub version_created: bool,
    /// A stale discarded copy of this version existed at init.
    pub version_exists: bool,
    pub eof_reached: bool,
}

/// Per-job state tracking which HLS segments are ready for transfer.
#[derive(Debug)]
pub struct SegmentDescriptor {
    pub filename_prefix: String,
    /// Scratch-relative folder the muxer writes into.
    pub local_dir: PathBuf,
    /// Destination version folder (working copy).
    pub remote_dir: PathBuf,
    /// Sorted indices of segments not yet transferred, refreshed per flush.
    pub rdy_list: Vec<u32>,
    /// Largest index transferred so far.
    pub curr_idx: Option<u32>,
    pub flags: SegmentFlags,
}

impl SegmentDescriptor {
    pub fn new(filename_prefix: impl Into<String>, local_dir: PathBuf, remote_dir: PathBuf) -> Self {
        Self {
            filename_prefix: filename_prefix.into(),
            local_dir,
            remote_dir,
            rdy_list: Vec::new(),
            curr_idx: None,
            flags: SegmentFlags::default(),
        }
    }

    pub fn segment_name(&self, idx: u32) -> String {
        format!("{}{}", self.filename_prefix, idx)
    }
}

/// Extract the sorted segment indices present in a scratch-folder scan.
/// Unless `source_done`, the entry with the largest index is dropped from
/// the ready list - it may still be growing.
pub fn collect_ready_segments(entries: &[Dirent], prefix: &str, source_done: bool) -> Vec<u32> {
    let mut out: Vec<u32> = entries
        .iter()
        .filter(|e| e.dtype == DirentType::File)
        .filter_map(|e| e.name.strip_prefix(prefix)?.parse::<u32>().ok())
        .collect();
    out.sort_unstable();
    if !source_done {
        out.pop();
    }
    out
}

/// Transfer every provably finished segment, in ascending index order.
/// Transferred segments disappear from the scratch folder, so the next
/// flush only sees what the muxer produced since. Returns the number of
/// segments moved.
pub async fn flush_segments(
    desc: &mut SegmentDescriptor,
    local: &mut AsaHandle,
    dst: &mut AsaHandle,
    source_done: bool,
) -> Result<usize, StorageError> {
    local.scandir(&desc.local_dir).await?;
    let ready = collect_ready_segments(local.scandir_entries(), &desc.filename_prefix, source_done);
    desc.rdy_list = ready.clone();
    let mut moved = 0usize;
    for idx in ready {
        let name = desc.segment_name(idx);
        transfer_file(
            local,
            dst,
            &desc.local_dir.join(&name),
            &desc.remote_dir.join(&name),
        )
        .await?;
        desc.curr_idx = Some(idx);
        desc.rdy_list.retain(|queued| *queued != idx);
        moved += 1;
    }
    if moved > 0 {
        debug!(moved, up_to = ?desc.curr_idx, "flushed segments to destination");
    }
    Ok(moved)
}

/// Move one named artifact (init map, playlist) out of the scratch folder.
pub async fn flush_named_file(
    desc: &SegmentDescriptor,
    local: &mut AsaHandle,
    dst: &mut AsaHandle,
    filename: &str,
) -> Result<(), StorageError> {
    transfer_file(
        local,
        dst,
        &desc.local_dir.join(filename),
        &desc.remote_dir.join(filename),
    )
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(name: &str) -> Dirent {
        Dirent {
            name: name.into(),
            dtype: DirentType::File,
        }
    }

    #[test]
    fn collect_sorts_ascending_and_withholds_the_largest() {
        let entries = vec![
            file("seg_7"),
            file("seg_2"),
            file("playlist.m3u8"),
            file("seg_5"),
            Dirent {
                name: "seg_9".into(),
                dtype: DirentType::Dir,
            },
        ];
        // mid-stream: 7 is the largest real segment and may still grow
        assert_eq!(collect_ready_segments(&entries, "seg_", false), vec![2, 5]);
        // final flush: everything goes
        assert_eq!(
            collect_ready_segments(&entries, "seg_", true),
            vec![2, 5, 7]
        );
    }

    #[test]
    fn collect_ignores_non_numeric_suffixes() {
        let entries = vec![file("seg_3"), file("seg_tmp"), file("other_1")];
        assert_eq!(collect_ready_segments(&entries, "seg_", true), vec![3]);
    }

    #[test]
    fn collect_on_empty_folder_is_empty() {
        assert_eq!(collect_ready_segments(&[], "seg_", false), Vec::<u32>::new());
        assert_eq!(collect_ready_segments(&[], "seg_", true), Vec::<u32>::new());
    }

    #[test]
    fn single_segment_midstream_is_withheld() {
        let entries = vec![file("seg_0")];
        assert!(collect_ready_segments(&entries, "seg_", false).is_empty());
        assert_eq!(collect_ready_segments(&entries, "seg_", true), vec![0]);
    }
}

//! The storage-handle triple threaded through every transcoding job.

use std::path::{Path, PathBuf};

use medley_core::storage::AsaHandle;

/// {source, per-file local scratch, destinations} - the source processor
/// owns the source end, the destination processor owns the local scratch
/// and the destination ends; both sides share the map to locate the other's
/// handles.
#[derive(Debug)]
pub struct AsaMap {
    pub src: AsaHandle,
    pub local: AsaHandle,
    pub dst: Vec<AsaHandle>,
    /// OS base path of the local scratch store, for backends that need a
    /// real filesystem path.
    local_base: PathBuf,
}

impl AsaMap {
    pub fn new(src: AsaHandle, local: AsaHandle, dst: Vec<AsaHandle>, local_base: PathBuf) -> Self {
        Self {
            src,
            local,
            dst,
            local_base,
        }
    }

    /// Resolve a scratch-relative path to its OS path.
    pub fn local_os_path(&self, rel: &Path) -> PathBuf {
        self.local_base.join(rel)
    }

    /// The primary destination handle. Every job has at least one.
    pub fn primary_dst(&mut self) -> &mut AsaHandle {
        &mut self.dst[0]
    }
}

//! Job parameters.
//!
//! Everything in a job spec is validated by the surrounding application
//! before it reaches a processor; the pipeline only re-checks what it
//! depends on (the preload size in particular).

use std::path::PathBuf;

use serde::Deserialize;
use serde_json::Value;

/// One transcoding job as handed over by the worker invocation.
#[derive(Debug, Clone, Deserialize)]
pub struct JobSpec {
    pub usr_id: u32,
    pub upld_req_id: u32,
    /// Two-character transcoded-version tag.
    pub version: String,
    /// Path of the committed upload on the source store, relative to its
    /// base.
    pub src_path: PathBuf,
    /// Byte sizes of the uploaded parts; the first entry bounds the source
    /// preload.
    #[serde(default)]
    pub parts_size: Vec<u64>,
    /// Output container label, e.g. `hls`.
    #[serde(default)]
    pub container: Option<String>,
    /// Elementary-stream attributes (codec settings, resolutions). Opaque
    /// to the pipeline; interpreted by the AV backend.
    #[serde(default)]
    pub elementary_streams: Value,
    /// Image post-processing attributes (crop/scale). Opaque to the
    /// pipeline.
    #[serde(default)]
    pub image_filter: Value,
}

impl JobSpec {
    /// Size of the initial preload from the source store, when present.
    pub fn preload_size(&self) -> Option<u64> {
        self.parts_size.first().copied()
    }
}

//! Video source processor: local scratch preload and the decode pump.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::{debug, warn};
use uuid::Uuid;

use medley_core::storage::OpenFlags;

use crate::asa_map::AsaMap;
use crate::av::{AvStep, FetchOutcome, SourceAvContext};
use crate::error::{CATEGORY_STORAGE, CATEGORY_TRANSCODER, JobError};
use crate::job::JobSpec;
use crate::processor::SourceProcessor;

#[derive(Debug)]
pub struct VideoSourceProcessor {
    av: Box<dyn SourceAvContext>,
    scratch_rel: PathBuf,
}

impl VideoSourceProcessor {
    /// Allocate the processor together with its backend context. The local
    /// scratch file gets a unique suffix so concurrent jobs of one worker
    /// never collide.
    pub fn new(av: Box<dyn SourceAvContext>) -> Self {
        Self {
            av,
            scratch_rel: PathBuf::from(format!("vidsrc_{}", Uuid::new_v4().simple())),
        }
    }

    async fn preload(&mut self, map: &mut AsaMap, spec: &JobSpec, err: &mut JobError) {
        let Some(preload) = spec.preload_size() else {
            err.set(CATEGORY_TRANSCODER, "missing parts_size in job spec");
            return;
        };
        if let Err(e) = map.src.open(&spec.src_path, OpenFlags::read_only()).await {
            warn!(error = %e, path = %spec.src_path.display(), "cannot open source object");
            err.set(CATEGORY_STORAGE, "failed to open source object for preload");
            return;
        }
        let mut remaining = preload as usize;
        while remaining > 0 {
            let max = remaining.min(map.src.read_buf_size());
            let nread = match map.src.read(max).await {
                Ok(n) => n,
                Err(e) => {
                    warn!(error = %e, "source preload read failed");
                    err.set(CATEGORY_STORAGE, "failed to read source object for preload");
                    return;
                }
            };
            if nread == 0 {
                break;
            }
            // the two handles are distinct ends of the map; borrow them apart
            let (src, local) = (&mut map.src, &mut map.local);
            if let Err(e) = local.write(&src.read_buf()[..nread]).await {
                warn!(error = %e, "scratch write failed during preload");
                err.set(CATEGORY_STORAGE, "failed to fill local temp buffer");
                return;
            }
            remaining -= nread;
        }
        debug!(preload, scratch = %self.scratch_rel.display(), "source head preloaded");
    }
}

#[async_trait]
impl SourceProcessor for VideoSourceProcessor {
    fn backend_id(&self) -> &'static str {
        self.av.backend_id()
    }

    async fn init(&mut self, map: &mut AsaMap, spec: &JobSpec, err: &mut JobError) {
        if let Err(e) = map
            .local
            .open(&self.scratch_rel, OpenFlags::write_create())
            .await
        {
            warn!(error = %e, "cannot open local temp buffer");
            err.set(CATEGORY_STORAGE, "failed to open local temp buffer");
            return;
        }
        self.preload(map, spec, err).await;
        if !err.is_empty() {
            return;
        }
        // the backend opens the scratch by path; release our descriptor
        // first so every preloaded byte is flushed
        if let Err(e) = map.local.close().await {
            warn!(error = %e, "cannot close local temp buffer after preload");
            err.set(CATEGORY_STORAGE, "failed to settle local temp buffer");
            return;
        }
        let os_path = map.local_os_path(&self.scratch_rel);
        if let Err(e) = self.av.init(&os_path, spec) {
            warn!(error = %e, "demux context init failed");
            err.set(CATEGORY_TRANSCODER, "failed to initialize input format context");
        }
    }

    async fn proceed(&mut self, _map: &mut AsaMap, _spec: &JobSpec, err: &mut JobError) {
        loop {
            match self.av.decode_packet() {
                Ok(AvStep::Ok) => return, // one frame available
                Ok(AvStep::NeedMoreData) => match self.av.fetch_next_packet() {
                    Ok(FetchOutcome::Packet) => continue,
                    Ok(FetchOutcome::Eof) => return,
                    Err(e) => {
                        warn!(error = %e, "packet fetch failed");
                        err.set(
                            CATEGORY_TRANSCODER,
                            "error when getting next packet from local temp buffer",
                        );
                        return;
                    }
                },
                Ok(AvStep::EndOfFlushEncoder) | Err(_) => {
                    err.set(CATEGORY_TRANSCODER, "failed to decode next packet");
                    return;
                }
            }
        }
    }

    fn has_done_processing(&self) -> bool {
        self.av.has_done_decoding()
    }

    async fn deinit(&mut self, map: &mut AsaMap) {
        self.av.deinit();
        if map.src.is_open() {
            let _ = map.src.close().await;
        }
        if map.local.is_open() {
            let _ = map.local.close().await;
        }
        let scratch = self.scratch_rel.clone();
        if let Err(e) = map.local.unlink(&scratch).await {
            debug!(error = %e, "scratch file already gone at deinit");
        }
    }

    fn av_mut(&mut self) -> &mut dyn SourceAvContext {
        self.av.as_mut()
    }

    fn scratch_rel(&self) -> &Path {
        &self.scratch_rel
    }
}

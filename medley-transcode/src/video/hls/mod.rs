//! HLS destination processor.
//!
//! Couples to a video source processor through the asa-map, pumps filtered
//! frames into the segment muxer, pushes finished segments to the
//! destination store mid-stream, and finishes with the fixed manifest
//! order: init map, master playlist, per-version playlist.

pub mod seeker;
pub mod segment;

use std::path::PathBuf;

use async_trait::async_trait;
use tracing::{debug, warn};

use medley_core::storage::version::{
    STATUS_DISCARDED, STATUS_TRANSCODING, create_version, local_output_path, remove_version,
    version_path,
};

use crate::asa_map::AsaMap;
use crate::av::{AvStep, DestinationAvContext, pump_flush_encoder_once, pump_flush_filter_once, pump_once};
use crate::error::{CATEGORY_STORAGE, CATEGORY_TRANSCODER, JobError};
use crate::job::JobSpec;
use crate::processor::{DestinationProcessor, SourceProcessor};

use self::segment::{SegmentDescriptor, flush_named_file, flush_segments};

/// Filename of the fMP4 initialization map on both sides of the transfer.
pub const HLS_FMP4_FILENAME: &str = "init_map";
/// Filename of the per-resolution master playlist.
pub const HLS_MASTER_PLAYLIST_FILENAME: &str = "mst_plist.m3u8";
/// Filename of the per-version media playlist.
pub const HLS_PLAYLIST_FILENAME: &str = "plist.m3u8";
/// Prefix of segment files on the local scratch.
pub const HLS_SEGMENT_PREFIX: &str = "seg_";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Uninit,
    Pump,
    FlushFilter,
    FlushEncoder,
    SaveStorage,
    Done,
}

#[derive(Debug)]
pub struct HlsDestinationProcessor {
    av: Box<dyn DestinationAvContext>,
    stage: Stage,
    segment: Option<SegmentDescriptor>,
    local_out_rel: Option<PathBuf>,
    usr_id: u32,
    upld_req_id: u32,
    version: String,
}

impl HlsDestinationProcessor {
    pub fn new(av: Box<dyn DestinationAvContext>) -> Self {
        Self {
            av,
            stage: Stage::Uninit,
            segment: None,
            local_out_rel: None,
            usr_id: 0,
            upld_req_id: 0,
            version: String::new(),
        }
    }

    pub fn segment_descriptor(&self) -> Option<&SegmentDescriptor> {
        self.segment.as_ref()
    }

    async fn save_to_storage(&mut self, map: &mut AsaMap, err: &mut JobError) {
        let Some(desc) = self.segment.as_mut() else {
            err.set(CATEGORY_TRANSCODER, "segment descriptor missing at save");
            return;
        };
        let AsaMap { local, dst, .. } = map;
        let dst = &mut dst[0];
        if let Err(e) = flush_segments(desc, local, dst, true).await {
            warn!(error = %e, "final segment flush failed");
            err.set(CATEGORY_STORAGE, "failed to transfer trailing segments");
            return;
        }
        // fixed order: init map, master playlist, per-version playlist
        for filename in [
            HLS_FMP4_FILENAME,
            HLS_MASTER_PLAYLIST_FILENAME,
            HLS_PLAYLIST_FILENAME,
        ] {
            if let Err(e) = flush_named_file(desc, local, dst, filename).await {
                warn!(error = %e, filename, "manifest transfer failed");
                err.set(CATEGORY_STORAGE, "failed to transfer playlist artifacts");
                return;
            }
        }
        // the output now belongs to the surrounding application; deinit must
        // not roll it back
        desc.flags.version_created = false;
        debug!(version = %self.version, "hls output saved to destination storage");
    }
}

#[async_trait]
impl DestinationProcessor for HlsDestinationProcessor {
    fn backend_id(&self) -> &'static str {
        self.av.backend_id()
    }

    async fn init(
        &mut self,
        src: &mut dyn SourceProcessor,
        map: &mut AsaMap,
        spec: &JobSpec,
        err: &mut JobError,
    ) {
        if src.backend_id() != self.av.backend_id() {
            err.set(
                CATEGORY_TRANSCODER,
                "invalid backend library in source file processor",
            );
            return;
        }
        self.usr_id = spec.usr_id;
        self.upld_req_id = spec.upld_req_id;
        self.version = spec.version.clone();

        // local output folder sits next to the source scratch copy
        let local_out = local_output_path(src.scratch_rel(), &spec.version);
        if let Err(e) = map.local.mkdir(&local_out, false).await {
            warn!(error = %e, "cannot create local output folder");
            err.set(CATEGORY_STORAGE, "failed to create local output folder");
            return;
        }
        self.local_out_rel = Some(local_out.clone());

        let flags_version_exists = {
            let dst = map.primary_dst();
            // a stale discarded copy of this version is reclaimed at deinit
            let discarded =
                version_path(spec.usr_id, spec.upld_req_id, STATUS_DISCARDED, &spec.version);
            let exists = dst.scandir(&discarded).await.is_ok();

            if let Err(e) = create_version(dst, spec.usr_id, spec.upld_req_id, &spec.version).await
            {
                warn!(error = %e, version = %spec.version, "cannot create working version folder");
                err.set(CATEGORY_STORAGE, "failed to create version folder");
                return;
            }
            exists
        };

        let os_out = map.local_os_path(&local_out);
        if let Err(e) = self.av.init(src.av_mut(), &os_out, spec) {
            warn!(error = %e, "output format context init failed");
            err.set(
                CATEGORY_TRANSCODER,
                "failed to initialize output format context",
            );
            return;
        }
        if let Err(e) = self.av.init_filters(src.av_mut(), spec) {
            warn!(error = %e, "filter graph init failed");
            err.set(CATEGORY_TRANSCODER, "failed to initialize filter graphs");
            return;
        }

        let remote_dir = version_path(
            spec.usr_id,
            spec.upld_req_id,
            STATUS_TRANSCODING,
            &spec.version,
        );
        let mut desc = SegmentDescriptor::new(HLS_SEGMENT_PREFIX, local_out, remote_dir);
        desc.flags.version_created = true;
        desc.flags.version_exists = flags_version_exists;
        self.segment = Some(desc);
        self.stage = Stage::Pump;
    }

    async fn proceed(
        &mut self,
        src: &mut dyn SourceProcessor,
        map: &mut AsaMap,
        _spec: &JobSpec,
        err: &mut JobError,
    ) {
        match self.stage {
            Stage::Uninit | Stage::Done => {}
            Stage::Pump => {
                if let Err(e) = pump_once(self.av.as_mut(), src.av_mut()) {
                    warn!(error = %e, "frame pump failed");
                    err.set(CATEGORY_TRANSCODER, "failed to filter or encode frame");
                    return;
                }
                // push whatever segments are provably finished
                if let Some(desc) = self.segment.as_mut() {
                    let AsaMap { local, dst, .. } = map;
                    if let Err(e) = flush_segments(desc, local, &mut dst[0], false).await {
                        warn!(error = %e, "mid-stream segment flush failed");
                        err.set(CATEGORY_STORAGE, "failed to transfer ready segments");
                        return;
                    }
                }
                if src.has_done_processing() {
                    self.stage = Stage::FlushFilter;
                }
            }
            Stage::FlushFilter => {
                while !self.av.has_done_flushing_filter() {
                    match pump_flush_filter_once(self.av.as_mut(), src.av_mut()) {
                        Ok(AvStep::EndOfFlushEncoder) => break,
                        Ok(_) => {}
                        Err(e) => {
                            warn!(error = %e, "filter flush failed");
                            err.set(CATEGORY_TRANSCODER, "failed to flush filter graphs");
                            return;
                        }
                    }
                }
                self.stage = Stage::FlushEncoder;
            }
            Stage::FlushEncoder => {
                loop {
                    match pump_flush_encoder_once(self.av.as_mut()) {
                        Ok(AvStep::EndOfFlushEncoder) => break,
                        Ok(_) => {}
                        Err(e) => {
                            warn!(error = %e, "encoder flush failed");
                            err.set(CATEGORY_TRANSCODER, "failed to flush encoders");
                            return;
                        }
                    }
                }
                if let Err(e) = self.av.finalize_write() {
                    warn!(error = %e, "trailer write failed");
                    err.set(CATEGORY_TRANSCODER, "failed to finalize output file");
                    return;
                }
                self.stage = Stage::SaveStorage;
            }
            Stage::SaveStorage => {
                self.save_to_storage(map, err).await;
                if err.is_empty() {
                    self.stage = Stage::Done;
                }
            }
        }
    }

    fn has_done_processing(&self) -> bool {
        self.stage == Stage::Done
    }

    async fn deinit(&mut self, map: &mut AsaMap) {
        self.av.deinit();
        if map.local.is_open() {
            let _ = map.local.close().await;
        }
        // remove the local output folder contents best-effort
        if let Some(local_out) = self.local_out_rel.take() {
            if map.local.scandir(&local_out).await.is_ok() {
                let leftovers: Vec<String> = map
                    .local
                    .scandir_entries()
                    .iter()
                    .map(|e| e.name.clone())
                    .collect();
                for name in leftovers {
                    let _ = map.local.unlink(&local_out.join(name)).await;
                }
            }
            let _ = map.local.rmdir(&local_out).await;
        }
        if let Some(desc) = self.segment.take() {
            let dst = map.primary_dst();
            if desc.flags.version_exists {
                let _ = remove_version(
                    dst,
                    self.usr_id,
                    self.upld_req_id,
                    STATUS_DISCARDED,
                    &self.version,
                )
                .await;
            }
            if desc.flags.version_created {
                // the job did not hand its output over; roll the working
                // copy back
                let _ = remove_version(
                    dst,
                    self.usr_id,
                    self.upld_req_id,
                    STATUS_TRANSCODING,
                    &self.version,
                )
                .await;
            }
        }
    }
}

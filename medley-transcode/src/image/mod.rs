//! Image processor family.
//!
//! Images run through the same pump as video - decode, filter (crop/scale),
//! encode, mux - but produce a single output file per version instead of a
//! segment sequence.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::{debug, warn};
use uuid::Uuid;

use medley_core::storage::OpenFlags;
use medley_core::storage::transfer::transfer_file;
use medley_core::storage::version::{
    STATUS_TRANSCODING, create_version, local_output_path, remove_version, version_path,
};

use crate::asa_map::AsaMap;
use crate::av::{
    AvStep, DestinationAvContext, FetchOutcome, SourceAvContext, pump_flush_encoder_once,
    pump_flush_filter_once, pump_once,
};
use crate::error::{CATEGORY_STORAGE, CATEGORY_TRANSCODER, JobError};
use crate::job::JobSpec;
use crate::processor::{DestinationProcessor, SourceProcessor};

/// Name of the processed picture inside its version folder.
pub const IMAGE_OUTPUT_FILENAME: &str = "processed";

#[derive(Debug)]
pub struct ImageSourceProcessor {
    av: Box<dyn SourceAvContext>,
    scratch_rel: PathBuf,
}

impl ImageSourceProcessor {
    pub fn new(av: Box<dyn SourceAvContext>) -> Self {
        Self {
            av,
            scratch_rel: PathBuf::from(format!("imgsrc_{}", Uuid::new_v4().simple())),
        }
    }
}

#[async_trait]
impl SourceProcessor for ImageSourceProcessor {
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
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    warn!(error = %e, "source preload read failed");
                    err.set(CATEGORY_STORAGE, "failed to read source object for preload");
                    return;
                }
            };
            let (src, local) = (&mut map.src, &mut map.local);
            if let Err(e) = local.write(&src.read_buf()[..nread]).await {
                warn!(error = %e, "scratch write failed during preload");
                err.set(CATEGORY_STORAGE, "failed to fill local temp buffer");
                return;
            }
            remaining -= nread;
        }
        if let Err(e) = map.local.close().await {
            warn!(error = %e, "cannot settle local temp buffer");
            err.set(CATEGORY_STORAGE, "failed to settle local temp buffer");
            return;
        }
        let os_path = map.local_os_path(&self.scratch_rel);
        if let Err(e) = self.av.init(&os_path, spec) {
            warn!(error = %e, "image demux init failed");
            err.set(CATEGORY_TRANSCODER, "failed to initialize input format context");
        }
    }

    async fn proceed(&mut self, _map: &mut AsaMap, _spec: &JobSpec, err: &mut JobError) {
        loop {
            match self.av.decode_packet() {
                Ok(AvStep::Ok) => return,
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
pub struct ImageDestinationProcessor {
    av: Box<dyn DestinationAvContext>,
    stage: Stage,
    local_out_rel: Option<PathBuf>,
    version_created: bool,
    usr_id: u32,
    upld_req_id: u32,
    version: String,
}

impl ImageDestinationProcessor {
    pub fn new(av: Box<dyn DestinationAvContext>) -> Self {
        Self {
            av,
            stage: Stage::Uninit,
            local_out_rel: None,
            version_created: false,
            usr_id: 0,
            upld_req_id: 0,
            version: String::new(),
        }
    }
}

#[async_trait]
impl DestinationProcessor for ImageDestinationProcessor {
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

        let local_out = local_output_path(src.scratch_rel(), &spec.version);
        self.local_out_rel = Some(local_out.clone());

        if let Err(e) = create_version(
            map.primary_dst(),
            spec.usr_id,
            spec.upld_req_id,
            &spec.version,
        )
        .await
        {
            warn!(error = %e, version = %spec.version, "cannot create working version folder");
            err.set(CATEGORY_STORAGE, "failed to create version folder");
            return;
        }
        self.version_created = true;

        let os_out = map.local_os_path(&local_out);
        if let Err(e) = self.av.init(src.av_mut(), &os_out, spec) {
            warn!(error = %e, "image output context init failed");
            err.set(
                CATEGORY_TRANSCODER,
                "failed to initialize output format context",
            );
            return;
        }
        if let Err(e) = self.av.init_filters(src.av_mut(), spec) {
            warn!(error = %e, "image filter init failed");
            err.set(CATEGORY_TRANSCODER, "failed to initialize filter graphs");
            return;
        }
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
                    warn!(error = %e, "image pump failed");
                    err.set(CATEGORY_TRANSCODER, "failed to filter or encode frame");
                    return;
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
                            warn!(error = %e, "image filter flush failed");
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
                            warn!(error = %e, "image encoder flush failed");
                            err.set(CATEGORY_TRANSCODER, "failed to flush encoders");
                            return;
                        }
                    }
                }
                if let Err(e) = self.av.finalize_write() {
                    warn!(error = %e, "image trailer write failed");
                    err.set(CATEGORY_TRANSCODER, "failed to finalize output file");
                    return;
                }
                self.stage = Stage::SaveStorage;
            }
            Stage::SaveStorage => {
                let Some(local_out) = self.local_out_rel.clone() else {
                    err.set(CATEGORY_TRANSCODER, "local output path missing at save");
                    return;
                };
                let remote = version_path(
                    self.usr_id,
                    self.upld_req_id,
                    STATUS_TRANSCODING,
                    &self.version,
                )
                .join(IMAGE_OUTPUT_FILENAME);
                let AsaMap { local, dst, .. } = map;
                if let Err(e) = transfer_file(local, &mut dst[0], &local_out, &remote).await {
                    warn!(error = %e, "image output transfer failed");
                    err.set(CATEGORY_STORAGE, "failed to transfer processed image");
                    return;
                }
                self.local_out_rel = None;
                // ownership of the output passes to the application
                self.version_created = false;
                debug!(version = %self.version, "image output saved to destination storage");
                self.stage = Stage::Done;
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
        if let Some(local_out) = self.local_out_rel.take() {
            let _ = map.local.unlink(&local_out).await;
        }
        if self.version_created {
            let _ = remove_version(
                map.primary_dst(),
                self.usr_id,
                self.upld_req_id,
                STATUS_TRANSCODING,
                &self.version,
            )
            .await;
        }
    }
}

//! Processor traits and the late-binding registry.
//!
//! Variants are selected by (media-type label, backend id). The registry is
//! populated at process init from a static table of factories, and job
//! setup resolves the configured names with a plain lookup.

use std::fmt;

use async_trait::async_trait;

use crate::asa_map::AsaMap;
use crate::av::SourceAvContext;
use crate::error::JobError;
use crate::job::JobSpec;

/// Source half of a job: preload, demux and decode.
///
/// Failures accumulate into the job error object instead of a return value;
/// any recorded key aborts the current step.
#[async_trait]
pub trait SourceProcessor: Send + fmt::Debug {
    fn backend_id(&self) -> &'static str;

    /// Open the local scratch, preload the head of the source object and
    /// initialize the demux context.
    async fn init(&mut self, map: &mut AsaMap, spec: &JobSpec, err: &mut JobError);

    /// Decode until one frame is available or the source is exhausted.
    async fn proceed(&mut self, map: &mut AsaMap, spec: &JobSpec, err: &mut JobError);

    /// True once the backend reports no more frames to emit.
    fn has_done_processing(&self) -> bool;

    /// Release everything this side owns: backend context, then the source
    /// handle, then the local scratch file.
    async fn deinit(&mut self, map: &mut AsaMap);

    /// The backend context, for pairing with the destination side.
    fn av_mut(&mut self) -> &mut dyn SourceAvContext;

    /// Scratch-relative path of the preloaded source copy; the destination
    /// side derives its own local output path from it.
    fn scratch_rel(&self) -> &std::path::Path;
}

/// Destination half of a job: filter, encode, mux and save to storage.
#[async_trait]
pub trait DestinationProcessor: Send + fmt::Debug {
    fn backend_id(&self) -> &'static str;

    async fn init(
        &mut self,
        src: &mut dyn SourceProcessor,
        map: &mut AsaMap,
        spec: &JobSpec,
        err: &mut JobError,
    );

    /// One pump round; once the source reports done, subsequent rounds walk
    /// the finalization protocol (flush filters, flush encoders, write
    /// trailer, save to storage).
    async fn proceed(
        &mut self,
        src: &mut dyn SourceProcessor,
        map: &mut AsaMap,
        spec: &JobSpec,
        err: &mut JobError,
    );

    /// True once the save-to-storage chain has completed.
    fn has_done_processing(&self) -> bool;

    async fn deinit(&mut self, map: &mut AsaMap);
}

type SourceFactory = Box<dyn Fn() -> Box<dyn SourceProcessor> + Send + Sync>;
type DestinationFactory = Box<dyn Fn() -> Box<dyn DestinationProcessor> + Send + Sync>;

struct SourceEntry {
    backend_id: &'static str,
    label_match: fn(&str) -> bool,
    factory: SourceFactory,
}

struct DestinationEntry {
    backend_id: &'static str,
    label_match: fn(&str) -> bool,
    factory: DestinationFactory,
}

/// Registry of processor factories keyed by (label match, backend id).
#[derive(Default)]
pub struct ProcessorRegistry {
    sources: Vec<SourceEntry>,
    destinations: Vec<DestinationEntry>,
}

impl fmt::Debug for ProcessorRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessorRegistry")
            .field("sources", &self.sources.len())
            .field("destinations", &self.destinations.len())
            .finish()
    }
}

impl ProcessorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_source(
        &mut self,
        backend_id: &'static str,
        label_match: fn(&str) -> bool,
        factory: SourceFactory,
    ) {
        self.sources.push(SourceEntry {
            backend_id,
            label_match,
            factory,
        });
    }

    pub fn register_destination(
        &mut self,
        backend_id: &'static str,
        label_match: fn(&str) -> bool,
        factory: DestinationFactory,
    ) {
        self.destinations.push(DestinationEntry {
            backend_id,
            label_match,
            factory,
        });
    }

    /// Instantiate the first source variant matching `label` (and
    /// `backend_id`, when pinned).
    pub fn instantiate_source(
        &self,
        label: &str,
        backend_id: Option<&str>,
    ) -> Option<Box<dyn SourceProcessor>> {
        self.sources
            .iter()
            .find(|e| (e.label_match)(label) && backend_id.is_none_or(|id| id == e.backend_id))
            .map(|e| (e.factory)())
    }

    pub fn instantiate_destination(
        &self,
        label: &str,
        backend_id: Option<&str>,
    ) -> Option<Box<dyn DestinationProcessor>> {
        self.destinations
            .iter()
            .find(|e| (e.label_match)(label) && backend_id.is_none_or(|id| id == e.backend_id))
            .map(|e| (e.factory)())
    }
}

/// Case-sensitive membership test shared by the built-in label matchers.
pub fn label_in(label: &str, expected: &[&str]) -> bool {
    expected.contains(&label)
}

/// Labels the video family answers to.
pub fn video_label_match(label: &str) -> bool {
    label_in(label, &["video/mp4", "video/quicktime", "mp4", "mov", "hls"])
}

/// Labels the image family answers to.
pub fn image_label_match(label: &str) -> bool {
    label_in(
        label,
        &[
            "image/jpeg",
            "image/png",
            "image/tiff",
            "image/bmp",
            "image/gif",
            "jpg",
            "png",
            "bmp",
            "tiff",
            "gif",
        ],
    )
}

/// Drive one job from init through the finalization protocol.
///
/// The completion contract: the returned error object is non-empty exactly
/// when the job failed, and both processors have been deinitialized either
/// way.
pub async fn run_job(
    mut src: Box<dyn SourceProcessor>,
    mut dst: Box<dyn DestinationProcessor>,
    map: &mut AsaMap,
    spec: &JobSpec,
) -> JobError {
    let mut err = JobError::new();
    src.init(map, spec, &mut err).await;
    if err.is_empty() {
        dst.init(src.as_mut(), map, spec, &mut err).await;
    }
    while err.is_empty() && !dst.has_done_processing() {
        if !src.has_done_processing() {
            src.proceed(map, spec, &mut err).await;
            if !err.is_empty() {
                break;
            }
        }
        dst.proceed(src.as_mut(), map, spec, &mut err).await;
    }
    dst.deinit(map).await;
    src.deinit(map).await;
    err
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn label_matchers_cover_the_supported_types() {
        assert!(video_label_match("video/mp4"));
        assert!(video_label_match("hls"));
        assert!(!video_label_match("image/png"));
        assert!(image_label_match("image/gif"));
        assert!(image_label_match("jpg"));
        assert!(!image_label_match("video/mp4"));
    }

    #[test]
    fn registry_resolves_by_label_and_backend() {
        let mut registry = ProcessorRegistry::new();
        assert!(registry.instantiate_source("video/mp4", None).is_none());
        registry.register_source("sim", video_label_match, {
            Box::new(|| unreachable!("factory only probed, not invoked in this test"))
        });
        assert!(registry.instantiate_source("image/png", None).is_none());
        assert!(
            registry
                .instantiate_source("video/mp4", Some("other"))
                .is_none()
        );
    }
}

//! Backend AV contracts.
//!
//! The pipeline never touches codec internals; it only consumes the
//! decision points below. A backend pair (source context, destination
//! context) must share the same backend id - mixing backends across the two
//! ends of a job is refused at destination init.

use std::any::Any;
use std::fmt;
use std::path::Path;

use thiserror::Error;

use crate::job::JobSpec;

/// Step codes the pump dispatches on. Negative codec errors surface as
/// [`AvError`] instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AvStep {
    /// A frame/packet is ready; keep going.
    Ok,
    /// The stage needs more input before it can produce again.
    NeedMoreData,
    /// In flush mode only: every encoder has drained.
    EndOfFlushEncoder,
}

/// Outcome of fetching the next demuxed packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchOutcome {
    Packet,
    /// Orderly end of the source stream.
    Eof,
}

#[derive(Error, Debug)]
#[error("av backend error {code}: {message}")]
pub struct AvError {
    /// Backend-native error code (negative for codec-library errors).
    pub code: i32,
    pub message: String,
}

impl AvError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// Kind of one elementary stream, as far as filter setup cares.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Video,
    Audio,
    /// Subtitles and other copy-through streams.
    Other,
}

/// Demux/decode half of a backend.
pub trait SourceAvContext: Send + fmt::Debug {
    fn backend_id(&self) -> &'static str;

    /// Initialize the demuxer against the preloaded local scratch file.
    fn init(&mut self, scratch_path: &Path, spec: &JobSpec) -> Result<(), AvError>;

    fn deinit(&mut self);

    /// Decode the current packet. `Ok` means a frame is available;
    /// `NeedMoreData` asks for the next packet.
    fn decode_packet(&mut self) -> Result<AvStep, AvError>;

    /// Pull the next packet from the demuxer.
    fn fetch_next_packet(&mut self) -> Result<FetchOutcome, AvError>;

    /// True once the backend can emit no more frames.
    fn has_done_decoding(&self) -> bool;

    /// Name of the detected input container, used to guess the output
    /// format.
    fn demuxer_name(&self) -> &str;

    /// Stream layout of the input, index-aligned.
    fn stream_kinds(&self) -> Vec<StreamKind>;

    /// Downcast hook for the paired destination context of the same
    /// backend.
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// Filter/encode/mux half of a backend.
pub trait DestinationAvContext: Send + fmt::Debug {
    fn backend_id(&self) -> &'static str;

    /// Initialize the output format context against the local output path:
    /// guess the format from the input's demuxer name (neutral fallback),
    /// open the output file unless the format is header-less, write the
    /// header.
    fn init(
        &mut self,
        src: &mut dyn SourceAvContext,
        local_out: &Path,
        spec: &JobSpec,
    ) -> Result<(), AvError>;

    /// Build one filter graph per input stream: fps+setpts+scale for video,
    /// aresample for audio, pass-through or skip for the rest.
    fn init_filters(&mut self, src: &mut dyn SourceAvContext, spec: &JobSpec)
    -> Result<(), AvError>;

    fn deinit(&mut self);

    /// Pull one filtered frame out of the graph fed by the source's current
    /// decoded frame.
    fn filter_frame(&mut self, src: &mut dyn SourceAvContext) -> Result<AvStep, AvError>;

    /// Encode the current filtered frame. `Ok` means a packet is ready.
    fn encode(&mut self) -> Result<AvStep, AvError>;

    /// Mux the encoded packet out.
    fn write_packet(&mut self) -> Result<(), AvError>;

    /// Flush-mode filter drain (null input as the sentinel).
    fn finalize_filter(&mut self, src: &mut dyn SourceAvContext) -> Result<AvStep, AvError>;

    /// True once every stream's filter graph has drained.
    fn has_done_flushing_filter(&self) -> bool;

    /// Flush-mode encoder drain; resolves with
    /// [`AvStep::EndOfFlushEncoder`] once every encoder is dry.
    fn finalize_encode(&mut self) -> Result<AvStep, AvError>;

    /// Write the container trailer (skipped when no header was written).
    fn finalize_write(&mut self) -> Result<(), AvError>;
}

/// One pump iteration of the destination side: pull filtered frames, encode
/// each of them, write each produced packet. Returns `NeedMoreData` when
/// the source must decode another frame.
pub fn pump_once(
    dst: &mut dyn DestinationAvContext,
    src: &mut dyn SourceAvContext,
) -> Result<AvStep, AvError> {
    loop {
        match dst.filter_frame(src)? {
            AvStep::Ok => {}
            AvStep::NeedMoreData => return Ok(AvStep::NeedMoreData),
            AvStep::EndOfFlushEncoder => return Ok(AvStep::EndOfFlushEncoder),
        }
        loop {
            match dst.encode()? {
                AvStep::Ok => dst.write_packet()?,
                AvStep::NeedMoreData => break,
                AvStep::EndOfFlushEncoder => return Ok(AvStep::EndOfFlushEncoder),
            }
        }
    }
}

/// One flush-mode pump iteration while the filter graphs drain.
pub fn pump_flush_filter_once(
    dst: &mut dyn DestinationAvContext,
    src: &mut dyn SourceAvContext,
) -> Result<AvStep, AvError> {
    match dst.finalize_filter(src)? {
        AvStep::Ok => {
            loop {
                match dst.encode()? {
                    AvStep::Ok => dst.write_packet()?,
                    AvStep::NeedMoreData => break,
                    AvStep::EndOfFlushEncoder => return Ok(AvStep::EndOfFlushEncoder),
                }
            }
            Ok(AvStep::Ok)
        }
        other => Ok(other),
    }
}

/// One flush-mode pump iteration while the encoders drain.
pub fn pump_flush_encoder_once(dst: &mut dyn DestinationAvContext) -> Result<AvStep, AvError> {
    match dst.finalize_encode()? {
        AvStep::Ok => {
            dst.write_packet()?;
            Ok(AvStep::Ok)
        }
        other => Ok(other),
    }
}

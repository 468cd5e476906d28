//! `ffmpeg-next` adapter behind the AV contracts.
//!
//! The adapter re-encodes the primary video stream of the input; remaining
//! streams are dropped. Encoder settings derive from the decoded stream,
//! bounded by the `elementary_streams` attributes of the job spec.

use std::any::Any;
use std::path::Path;

use ffmpeg_next as ffmpeg;

use ffmpeg::codec;
use ffmpeg::format;
use ffmpeg::util::error::EAGAIN;
use tracing::debug;

use crate::av::{
    AvError, AvStep, DestinationAvContext, FetchOutcome, SourceAvContext, StreamKind,
};
use crate::job::JobSpec;

pub const FFMPEG_BACKEND_ID: &str = "ffmpeg";

fn av_err(context: &str, err: ffmpeg::Error) -> AvError {
    let code = match err {
        ffmpeg::Error::Other { errno } => -errno,
        _ => -1,
    };
    AvError::new(code, format!("{context}: {err}"))
}

fn is_again(err: &ffmpeg::Error) -> bool {
    matches!(err, ffmpeg::Error::Other { errno } if *errno == EAGAIN)
}

/// Demux/decode half over `ffmpeg-next`.
pub struct FfmpegSourceContext {
    ictx: Option<format::context::Input>,
    decoder: Option<codec::decoder::Video>,
    video_stream_idx: usize,
    frame: ffmpeg::frame::Video,
    demuxer_name: String,
    kinds: Vec<StreamKind>,
    eof_sent: bool,
    done: bool,
}

impl std::fmt::Debug for FfmpegSourceContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FfmpegSourceContext")
            .field("demuxer_name", &self.demuxer_name)
            .field("video_stream_idx", &self.video_stream_idx)
            .field("eof_sent", &self.eof_sent)
            .field("done", &self.done)
            .finish()
    }
}

impl Default for FfmpegSourceContext {
    fn default() -> Self {
        Self::new()
    }
}

impl FfmpegSourceContext {
    pub fn new() -> Self {
        Self {
            ictx: None,
            decoder: None,
            video_stream_idx: 0,
            frame: ffmpeg::frame::Video::empty(),
            demuxer_name: String::new(),
            kinds: Vec::new(),
            eof_sent: false,
            done: false,
        }
    }

    /// The most recently decoded frame.
    pub fn current_frame(&self) -> &ffmpeg::frame::Video {
        &self.frame
    }

    pub fn decoder(&self) -> Option<&codec::decoder::Video> {
        self.decoder.as_ref()
    }
}

impl SourceAvContext for FfmpegSourceContext {
    fn backend_id(&self) -> &'static str {
        FFMPEG_BACKEND_ID
    }

    fn init(&mut self, scratch_path: &Path, _spec: &JobSpec) -> Result<(), AvError> {
        ffmpeg::init().map_err(|e| av_err("ffmpeg init", e))?;
        let ictx = format::input(&scratch_path).map_err(|e| av_err("open input", e))?;
        self.demuxer_name = ictx.format().name().to_string();
        self.kinds = ictx
            .streams()
            .map(|s| match s.parameters().medium() {
                ffmpeg::media::Type::Video => StreamKind::Video,
                ffmpeg::media::Type::Audio => StreamKind::Audio,
                _ => StreamKind::Other,
            })
            .collect();
        let stream = ictx
            .streams()
            .best(ffmpeg::media::Type::Video)
            .ok_or_else(|| AvError::new(-1, "no video stream in input"))?;
        self.video_stream_idx = stream.index();
        let decoder = codec::context::Context::from_parameters(stream.parameters())
            .map_err(|e| av_err("decoder context", e))?
            .decoder()
            .video()
            .map_err(|e| av_err("open decoder", e))?;
        self.decoder = Some(decoder);
        self.ictx = Some(ictx);
        debug!(demuxer = %self.demuxer_name, "ffmpeg source context initialized");
        Ok(())
    }

    fn deinit(&mut self) {
        self.decoder = None;
        self.ictx = None;
    }

    fn decode_packet(&mut self) -> Result<AvStep, AvError> {
        let Some(decoder) = self.decoder.as_mut() else {
            return Err(AvError::new(-1, "decoder not initialized"));
        };
        match decoder.receive_frame(&mut self.frame) {
            Ok(()) => Ok(AvStep::Ok),
            Err(e) if is_again(&e) => {
                if self.eof_sent {
                    self.done = true;
                }
                Ok(AvStep::NeedMoreData)
            }
            Err(ffmpeg::Error::Eof) => {
                self.done = true;
                Ok(AvStep::NeedMoreData)
            }
            Err(e) => Err(av_err("receive frame", e)),
        }
    }

    fn fetch_next_packet(&mut self) -> Result<FetchOutcome, AvError> {
        let Some(ictx) = self.ictx.as_mut() else {
            return Err(AvError::new(-1, "input context not initialized"));
        };
        loop {
            match ictx.packets().next() {
                Some(Ok((stream, packet))) => {
                    if stream.index() != self.video_stream_idx {
                        continue;
                    }
                    let decoder = self
                        .decoder
                        .as_mut()
                        .ok_or_else(|| AvError::new(-1, "decoder not initialized"))?;
                    decoder
                        .send_packet(&packet)
                        .map_err(|e| av_err("send packet", e))?;
                    return Ok(FetchOutcome::Packet);
                }
                Some(Err(e)) if is_again(&e) => continue,
                Some(Err(ffmpeg::Error::Eof)) | None => {
                    if !self.eof_sent {
                        let decoder = self
                            .decoder
                            .as_mut()
                            .ok_or_else(|| AvError::new(-1, "decoder not initialized"))?;
                        decoder.send_eof().map_err(|e| av_err("send eof", e))?;
                        self.eof_sent = true;
                    }
                    return Ok(FetchOutcome::Eof);
                }
                Some(Err(e)) => return Err(av_err("read packet", e)),
            }
        }
    }

    fn has_done_decoding(&self) -> bool {
        self.done
    }

    fn demuxer_name(&self) -> &str {
        &self.demuxer_name
    }

    fn stream_kinds(&self) -> Vec<StreamKind> {
        self.kinds.clone()
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

fn downcast_src<'a>(src: &'a mut dyn SourceAvContext) -> Result<&'a mut FfmpegSourceContext, AvError> {
    src.as_any_mut()
        .downcast_mut::<FfmpegSourceContext>()
        .ok_or_else(|| AvError::new(-1, "source context belongs to a different backend"))
}

/// Filter/encode/mux half over `ffmpeg-next`.
pub struct FfmpegDestinationContext {
    octx: Option<format::context::Output>,
    encoder: Option<ffmpeg::encoder::video::Encoder>,
    graph: Option<ffmpeg::filter::Graph>,
    filtered: ffmpeg::frame::Video,
    packet: ffmpeg::Packet,
    out_width: u32,
    out_height: u32,
    out_fps: i32,
    header_written: bool,
    trailer_written: bool,
    filter_flushed: bool,
    encoder_flushed: bool,
}

impl std::fmt::Debug for FfmpegDestinationContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FfmpegDestinationContext")
            .field("header_written", &self.header_written)
            .field("trailer_written", &self.trailer_written)
            .field("filter_flushed", &self.filter_flushed)
            .field("encoder_flushed", &self.encoder_flushed)
            .finish()
    }
}

impl Default for FfmpegDestinationContext {
    fn default() -> Self {
        Self::new()
    }
}

impl FfmpegDestinationContext {
    pub fn new() -> Self {
        Self {
            octx: None,
            encoder: None,
            graph: None,
            filtered: ffmpeg::frame::Video::empty(),
            packet: ffmpeg::Packet::empty(),
            out_width: 0,
            out_height: 0,
            out_fps: 24,
            header_written: false,
            trailer_written: false,
            filter_flushed: false,
            encoder_flushed: false,
        }
    }

    fn write_current_packet(&mut self) -> Result<(), AvError> {
        let octx = self
            .octx
            .as_mut()
            .ok_or_else(|| AvError::new(-1, "output context not initialized"))?;
        self.packet.set_stream(0);
        self.packet
            .write_interleaved(octx)
            .map_err(|e| av_err("write packet", e))
    }
}

impl DestinationAvContext for FfmpegDestinationContext {
    fn backend_id(&self) -> &'static str {
        FFMPEG_BACKEND_ID
    }

    fn init(
        &mut self,
        src: &mut dyn SourceAvContext,
        local_out: &Path,
        spec: &JobSpec,
    ) -> Result<(), AvError> {
        let container = spec.container.as_deref().unwrap_or("mp4");
        let src = downcast_src(src)?;
        let dec = src
            .decoder()
            .ok_or_else(|| AvError::new(-1, "source decoder not initialized"))?;

        let mut octx = format::output_as(&local_out, container)
            .or_else(|_| format::output(&local_out))
            .map_err(|e| av_err("open output", e))?;

        let codec = ffmpeg::encoder::find(dec.id())
            .ok_or_else(|| AvError::new(-1, "no encoder for input codec"))?;
        let mut encoder = codec::context::Context::new_with_codec(codec)
            .encoder()
            .video()
            .map_err(|e| av_err("encoder context", e))?;

        let attrs = &spec.elementary_streams;
        let bound = |key: &str, fallback: u32| -> u32 {
            attrs
                .as_object()
                .and_then(|streams| {
                    streams.values().find_map(|s| {
                        s.get("attribute")
                            .and_then(|a| a.get(key))
                            .and_then(|v| v.as_u64())
                    })
                })
                .map(|v| (v as u32).min(fallback))
                .unwrap_or(fallback)
        };
        self.out_width = bound("width_pixel", dec.width());
        self.out_height = bound("height_pixel", dec.height());
        let fps = attrs
            .as_object()
            .and_then(|streams| {
                streams.values().find_map(|s| {
                    s.get("attribute")
                        .and_then(|a| a.get("framerate"))
                        .and_then(|v| v.as_i64())
                })
            })
            .unwrap_or(24) as i32;
        self.out_fps = fps.max(1);
        encoder.set_width(self.out_width);
        encoder.set_height(self.out_height);
        encoder.set_format(dec.format());
        encoder.set_time_base(dec.time_base());
        encoder.set_frame_rate(Some((self.out_fps, 1)));

        let opened = encoder.open_as(codec).map_err(|e| av_err("open encoder", e))?;
        {
            let mut stream = octx.add_stream(codec).map_err(|e| av_err("add stream", e))?;
            stream.set_parameters(&opened);
        }
        octx.write_header().map_err(|e| av_err("write header", e))?;
        self.header_written = true;
        self.encoder = Some(opened);
        self.octx = Some(octx);
        Ok(())
    }

    fn init_filters(
        &mut self,
        src: &mut dyn SourceAvContext,
        _spec: &JobSpec,
    ) -> Result<(), AvError> {
        let src = downcast_src(src)?;
        let dec = src
            .decoder()
            .ok_or_else(|| AvError::new(-1, "source decoder not initialized"))?;
        if self.encoder.is_none() {
            return Err(AvError::new(-1, "encoder not initialized"));
        }

        let mut graph = ffmpeg::filter::Graph::new();
        let pix_fmt = dec
            .format()
            .descriptor()
            .map(|d| d.name())
            .unwrap_or("yuv420p");
        let args = format!(
            "video_size={}x{}:pix_fmt={}:time_base={}/{}:pixel_aspect={}/{}",
            dec.width(),
            dec.height(),
            pix_fmt,
            dec.time_base().numerator(),
            dec.time_base().denominator(),
            dec.aspect_ratio().numerator().max(1),
            dec.aspect_ratio().denominator().max(1),
        );
        graph
            .add(
                &ffmpeg::filter::find("buffer")
                    .ok_or_else(|| AvError::new(-1, "buffer filter missing"))?,
                "in",
                &args,
            )
            .map_err(|e| av_err("buffer source", e))?;
        graph
            .add(
                &ffmpeg::filter::find("buffersink")
                    .ok_or_else(|| AvError::new(-1, "buffersink filter missing"))?,
                "out",
                "",
            )
            .map_err(|e| av_err("buffer sink", e))?;
        let chain = format!(
            "fps={},scale={}:{}",
            self.out_fps, self.out_width, self.out_height,
        );
        graph
            .output("in", 0)
            .map_err(|e| av_err("graph output", e))?
            .input("out", 0)
            .map_err(|e| av_err("graph input", e))?
            .parse(&chain)
            .map_err(|e| av_err("graph parse", e))?;
        graph.validate().map_err(|e| av_err("graph validate", e))?;
        self.graph = Some(graph);
        Ok(())
    }

    fn deinit(&mut self) {
        if self.header_written && !self.trailer_written {
            if let Some(octx) = self.octx.as_mut() {
                let _ = octx.write_trailer();
            }
            self.trailer_written = true;
        }
        self.graph = None;
        self.encoder = None;
        self.octx = None;
    }

    fn filter_frame(&mut self, src: &mut dyn SourceAvContext) -> Result<AvStep, AvError> {
        let src = downcast_src(src)?;
        let graph = self
            .graph
            .as_mut()
            .ok_or_else(|| AvError::new(-1, "filter graph not initialized"))?;
        {
            let mut sink = graph
                .get("out")
                .ok_or_else(|| AvError::new(-1, "buffersink lookup failed"))?;
            match sink.sink().frame(&mut self.filtered) {
                Ok(()) => return Ok(AvStep::Ok),
                Err(e) if is_again(&e) || matches!(e, ffmpeg::Error::Eof) => {}
                Err(e) => return Err(av_err("pull filtered frame", e)),
            }
        }
        let mut source = graph
            .get("in")
            .ok_or_else(|| AvError::new(-1, "buffer source lookup failed"))?;
        source
            .source()
            .add(src.current_frame())
            .map_err(|e| av_err("feed filter graph", e))?;
        let mut sink = graph
            .get("out")
            .ok_or_else(|| AvError::new(-1, "buffersink lookup failed"))?;
        match sink.sink().frame(&mut self.filtered) {
            Ok(()) => Ok(AvStep::Ok),
            Err(e) if is_again(&e) || matches!(e, ffmpeg::Error::Eof) => Ok(AvStep::NeedMoreData),
            Err(e) => Err(av_err("pull filtered frame", e)),
        }
    }

    fn encode(&mut self) -> Result<AvStep, AvError> {
        let encoder = self
            .encoder
            .as_mut()
            .ok_or_else(|| AvError::new(-1, "encoder not initialized"))?;
        match encoder.receive_packet(&mut self.packet) {
            Ok(()) => return Ok(AvStep::Ok),
            Err(e) if is_again(&e) => {}
            Err(ffmpeg::Error::Eof) => return Ok(AvStep::EndOfFlushEncoder),
            Err(e) => return Err(av_err("receive packet", e)),
        }
        encoder
            .send_frame(&self.filtered)
            .map_err(|e| av_err("send frame", e))?;
        match encoder.receive_packet(&mut self.packet) {
            Ok(()) => Ok(AvStep::Ok),
            Err(e) if is_again(&e) => Ok(AvStep::NeedMoreData),
            Err(ffmpeg::Error::Eof) => Ok(AvStep::EndOfFlushEncoder),
            Err(e) => Err(av_err("receive packet", e)),
        }
    }

    fn write_packet(&mut self) -> Result<(), AvError> {
        self.write_current_packet()
    }

    fn finalize_filter(&mut self, _src: &mut dyn SourceAvContext) -> Result<AvStep, AvError> {
        let graph = self
            .graph
            .as_mut()
            .ok_or_else(|| AvError::new(-1, "filter graph not initialized"))?;
        if !self.filter_flushed {
            let mut source = graph
                .get("in")
                .ok_or_else(|| AvError::new(-1, "buffer source lookup failed"))?;
            source
                .source()
                .flush()
                .map_err(|e| av_err("flush filter source", e))?;
            self.filter_flushed = true;
        }
        let mut sink = graph
            .get("out")
            .ok_or_else(|| AvError::new(-1, "buffersink lookup failed"))?;
        match sink.sink().frame(&mut self.filtered) {
            Ok(()) => Ok(AvStep::Ok),
            Err(e) if is_again(&e) || matches!(e, ffmpeg::Error::Eof) => Ok(AvStep::NeedMoreData),
            Err(e) => Err(av_err("drain filtered frame", e)),
        }
    }

    fn has_done_flushing_filter(&self) -> bool {
        self.filter_flushed
    }

    fn finalize_encode(&mut self) -> Result<AvStep, AvError> {
        let encoder = self
            .encoder
            .as_mut()
            .ok_or_else(|| AvError::new(-1, "encoder not initialized"))?;
        if !self.encoder_flushed {
            encoder.send_eof().map_err(|e| av_err("send encoder eof", e))?;
            self.encoder_flushed = true;
        }
        match encoder.receive_packet(&mut self.packet) {
            Ok(()) => Ok(AvStep::Ok),
            Err(e) if is_again(&e) => Ok(AvStep::Ok),
            Err(ffmpeg::Error::Eof) => Ok(AvStep::EndOfFlushEncoder),
            Err(e) => Err(av_err("drain packet", e)),
        }
    }

    fn finalize_write(&mut self) -> Result<(), AvError> {
        if self.header_written && !self.trailer_written {
            let octx = self
                .octx
                .as_mut()
                .ok_or_else(|| AvError::new(-1, "output context not initialized"))?;
            octx.write_trailer().map_err(|e| av_err("write trailer", e))?;
            self.trailer_written = true;
        }
        Ok(())
    }
}

/// Register the ffmpeg-backed processor variants.
pub fn register_processors(registry: &mut crate::processor::ProcessorRegistry) {
    use crate::image::{ImageDestinationProcessor, ImageSourceProcessor};
    use crate::processor::{image_label_match, video_label_match};
    use crate::video::VideoSourceProcessor;
    use crate::video::hls::HlsDestinationProcessor;

    registry.register_source(FFMPEG_BACKEND_ID, video_label_match, {
        Box::new(|| Box::new(VideoSourceProcessor::new(Box::new(FfmpegSourceContext::new()))))
    });
    registry.register_destination(FFMPEG_BACKEND_ID, video_label_match, {
        Box::new(|| {
            Box::new(HlsDestinationProcessor::new(Box::new(
                FfmpegDestinationContext::new(),
            )))
        })
    });
    registry.register_source(FFMPEG_BACKEND_ID, image_label_match, {
        Box::new(|| Box::new(ImageSourceProcessor::new(Box::new(FfmpegSourceContext::new()))))
    });
    registry.register_destination(FFMPEG_BACKEND_ID, image_label_match, {
        Box::new(|| {
            Box::new(ImageDestinationProcessor::new(Box::new(
                FfmpegDestinationContext::new(),
            )))
        })
    });
}

//! # Medley Transcode
//!
//! Transcoding processor pipeline of the medley media service.
//!
//! A job couples a source processor to a destination processor through an
//! [`asa_map::AsaMap`]: the source side owns the remote-source handle, the
//! destination side owns the local-scratch and destination handles. The
//! frame/packet pump drives demux -> decode -> filter -> encode -> mux with
//! an explicit finalization protocol, and every produced artifact moves to
//! the destination store through the core transfer protocol.
//!
//! Codec work happens behind the [`av`] contracts; the `ffmpeg` feature
//! provides the adapter over `ffmpeg-next`.

/// Per-job error object
pub mod error;

/// Job parameters as validated by the surrounding application
pub mod job;

/// Backend AV contracts: step codes and context traits
pub mod av;

/// Source/local/destination storage handle triple
pub mod asa_map;

/// Processor traits and the (media label, backend id) registry
pub mod processor;

/// Video source and HLS destination processors
pub mod video;

/// Image source and destination processors
pub mod image;

#[cfg(feature = "ffmpeg")]
/// `ffmpeg-next` adapter behind the AV contracts
pub mod ffmpeg;

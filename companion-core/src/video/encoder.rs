// Copyright (c) The ios-companion Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Frame encoders.
//!
//! Four wire formats: raw BGRA passthrough, MJPEG (one JPEG per frame),
//! Minicap (a fixed banner then length-prefixed JPEGs), and H.264 (AVCC
//! length-prefixed NAL units from a compression session). Pixel
//! compression itself is the host media toolbox's job and sits behind the
//! [`CompressionSession`] and [`JpegCompressor`] seams; this module owns
//! framing, statistics and error accounting.

use crate::{
    consumer::DataConsumer,
    errors::{CompanionError, VideoError},
    video::frame::{Frame, PixelFormat},
};
use bytes::{BufMut, Bytes, BytesMut};
use std::{
    str::FromStr,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

/// The encoding of a video stream.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum VideoEncoding {
    /// H.264 NAL units, length-prefixed.
    H264,
    /// Raw BGRA frames.
    Bgra,
    /// One JPEG per frame.
    Mjpeg,
    /// The minicap framing: banner, then length-prefixed JPEGs.
    Minicap,
}

impl VideoEncoding {
    /// String representations of all known variants.
    pub fn variants() -> [&'static str; 4] {
        ["h264", "bgra", "mjpeg", "minicap"]
    }
}

impl std::fmt::Display for VideoEncoding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::H264 => "h264",
            Self::Bgra => "bgra",
            Self::Mjpeg => "mjpeg",
            Self::Minicap => "minicap",
        };
        write!(f, "{s}")
    }
}

impl FromStr for VideoEncoding {
    type Err = CompanionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "h264" => Ok(Self::H264),
            "bgra" => Ok(Self::Bgra),
            "mjpeg" => Ok(Self::Mjpeg),
            "minicap" => Ok(Self::Minicap),
            other => Err(CompanionError::InvalidArgument(format!(
                "unrecognized video encoding: {other} (known values: {})",
                Self::variants().join(", ")
            ))),
        }
    }
}

/// Configuration for an encoder and the stream feeding it.
#[derive(Clone, Debug)]
pub struct EncoderConfig {
    /// The wire format.
    pub encoding: VideoEncoding,
    /// Frames per second for an eager stream; `None` means lazy
    /// (on-demand) streaming.
    pub frames_per_second: Option<u32>,
    /// JPEG compression quality in `0..=1`.
    pub compression_quality: f64,
    /// Downscale factor in `0..=1`; `None` means no scaling.
    pub scale_factor: Option<f64>,
    /// Average bitrate hint for H.264, bits per second.
    pub avg_bitrate: Option<u64>,
    /// Keyframe interval for H.264, in frames.
    pub keyframe_interval: u32,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            encoding: VideoEncoding::H264,
            frames_per_second: None,
            compression_quality: 0.8,
            scale_factor: None,
            avg_bitrate: None,
            keyframe_interval: 60,
        }
    }
}

/// Counters kept by every encoder.
#[derive(Debug, Default)]
pub struct EncoderStats {
    /// Frames offered to the encoder.
    pub callback_count: AtomicU64,
    /// Samples written downstream.
    pub write_count: AtomicU64,
    /// Frames dropped due to backpressure.
    pub drop_count: AtomicU64,
    /// Writes rejected by the consumer.
    pub write_failure_count: AtomicU64,
    /// Compression failures.
    pub encode_error_count: AtomicU64,
}

/// A point-in-time copy of [`EncoderStats`].
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct EncoderStatsSnapshot {
    /// Frames offered to the encoder.
    pub callback_count: u64,
    /// Samples written downstream.
    pub write_count: u64,
    /// Frames dropped due to backpressure.
    pub drop_count: u64,
    /// Writes rejected by the consumer.
    pub write_failure_count: u64,
    /// Compression failures.
    pub encode_error_count: u64,
}

impl EncoderStats {
    /// Takes a snapshot of the counters.
    pub fn snapshot(&self) -> EncoderStatsSnapshot {
        EncoderStatsSnapshot {
            callback_count: self.callback_count.load(Ordering::Relaxed),
            write_count: self.write_count.load(Ordering::Relaxed),
            drop_count: self.drop_count.load(Ordering::Relaxed),
            write_failure_count: self.write_failure_count.load(Ordering::Relaxed),
            encode_error_count: self.encode_error_count.load(Ordering::Relaxed),
        }
    }
}

/// One compressed sample out of a compression session.
#[derive(Clone, Debug)]
pub struct CompressedSample {
    /// The sample payload: one NAL unit for H.264.
    pub payload: Bytes,
    /// True for IDR/sync samples.
    pub keyframe: bool,
    /// Presentation time.
    pub presentation_time: Duration,
    /// Display duration.
    pub duration: Duration,
}

/// An H.264 compression session, implemented by the host media toolbox.
///
/// The session owns keyframe cadence and rate control; it is configured
/// from [`EncoderConfig::keyframe_interval`] and
/// [`EncoderConfig::avg_bitrate`] by whoever constructs it.
pub trait CompressionSession: Send + 'static {
    /// Submits one frame, returning zero or more compressed samples.
    fn submit(&mut self, frame: &Frame) -> Result<Vec<CompressedSample>, VideoError>;

    /// Flushes any buffered samples.
    fn finish(&mut self) -> Result<Vec<CompressedSample>, VideoError>;

    /// The sequence and picture parameter sets, once known. Required
    /// before an MP4 track can be finalized.
    fn parameter_sets(&self) -> Option<(Bytes, Bytes)>;
}

/// A JPEG compressor, implemented by the host media toolbox.
pub trait JpegCompressor: Send + Sync + 'static {
    /// Compresses one frame at the given quality in `0..=1`.
    fn compress(&self, frame: &Frame, quality: f64) -> Result<Bytes, VideoError>;
}

/// The minicap banner version this encoder emits.
const MINICAP_VERSION: u8 = 1;
/// The minicap banner length in bytes.
const MINICAP_BANNER_SIZE: u8 = 24;

/// An encoder writing frames to a consumer in one of the four formats.
pub enum FrameEncoder {
    /// Raw passthrough.
    Bgra {
        /// Shared counters.
        stats: Arc<EncoderStats>,
    },
    /// Independent JPEG per frame.
    Mjpeg {
        /// The compressor seam.
        compressor: Arc<dyn JpegCompressor>,
        /// JPEG quality in `0..=1`.
        quality: f64,
        /// Shared counters.
        stats: Arc<EncoderStats>,
    },
    /// Length-prefixed JPEGs behind a fixed banner.
    Minicap {
        /// The compressor seam.
        compressor: Arc<dyn JpegCompressor>,
        /// JPEG quality in `0..=1`.
        quality: f64,
        /// Whether the banner has been written yet.
        banner_sent: bool,
        /// Shared counters.
        stats: Arc<EncoderStats>,
    },
    /// AVCC-framed H.264.
    H264 {
        /// The compression session seam.
        session: Box<dyn CompressionSession>,
        /// Shared counters.
        stats: Arc<EncoderStats>,
    },
}

impl FrameEncoder {
    /// The shared statistics for this encoder.
    pub fn stats(&self) -> Arc<EncoderStats> {
        match self {
            Self::Bgra { stats }
            | Self::Mjpeg { stats, .. }
            | Self::Minicap { stats, .. }
            | Self::H264 { stats, .. } => Arc::clone(stats),
        }
    }

    /// Encodes and writes one frame.
    pub fn write_frame(
        &mut self,
        frame: &Frame,
        sink: &dyn DataConsumer,
    ) -> Result<(), CompanionError> {
        self.stats().callback_count.fetch_add(1, Ordering::Relaxed);
        match self {
            Self::Bgra { stats } => {
                if frame.format != PixelFormat::Bgra8888 {
                    stats.encode_error_count.fetch_add(1, Ordering::Relaxed);
                    return Err(VideoError::UnsupportedPixelFormat {
                        format: frame.format.to_string(),
                        encoding: VideoEncoding::Bgra.to_string(),
                    }
                    .into());
                }
                write_checked(sink, frame.payload.clone(), stats)
            }
            Self::Mjpeg {
                compressor,
                quality,
                stats,
            } => {
                let jpeg = compress_checked(compressor.as_ref(), frame, *quality, stats)?;
                write_checked(sink, jpeg, stats)
            }
            Self::Minicap {
                compressor,
                quality,
                banner_sent,
                stats,
            } => {
                if !*banner_sent {
                    write_checked(sink, minicap_banner(frame), stats)?;
                    *banner_sent = true;
                }
                let jpeg = compress_checked(compressor.as_ref(), frame, *quality, stats)?;
                let mut framed = BytesMut::with_capacity(4 + jpeg.len());
                framed.put_u32_le(jpeg.len() as u32);
                framed.extend_from_slice(&jpeg);
                write_checked(sink, framed.freeze(), stats)
            }
            Self::H264 { session, stats } => {
                let samples = match session.submit(frame) {
                    Ok(samples) => samples,
                    Err(err) => {
                        stats.encode_error_count.fetch_add(1, Ordering::Relaxed);
                        return Err(err.into());
                    }
                };
                for sample in samples {
                    write_checked(sink, avcc_frame(&sample.payload), stats)?;
                }
                Ok(())
            }
        }
    }

    /// Flushes buffered samples and finishes the stream.
    pub fn finish(&mut self, sink: &dyn DataConsumer) -> Result<(), CompanionError> {
        if let Self::H264 { session, stats } = self {
            let samples = match session.finish() {
                Ok(samples) => samples,
                Err(err) => {
                    stats.encode_error_count.fetch_add(1, Ordering::Relaxed);
                    return Err(err.into());
                }
            };
            for sample in samples {
                write_checked(sink, avcc_frame(&sample.payload), stats)?;
            }
        }
        Ok(())
    }
}

fn compress_checked(
    compressor: &dyn JpegCompressor,
    frame: &Frame,
    quality: f64,
    stats: &EncoderStats,
) -> Result<Bytes, CompanionError> {
    match compressor.compress(frame, quality) {
        Ok(jpeg) => Ok(jpeg),
        Err(err) => {
            stats.encode_error_count.fetch_add(1, Ordering::Relaxed);
            Err(err.into())
        }
    }
}

fn write_checked(
    sink: &dyn DataConsumer,
    payload: Bytes,
    stats: &EncoderStats,
) -> Result<(), CompanionError> {
    match sink.consume(payload) {
        Ok(()) => {
            stats.write_count.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }
        Err(err) => {
            stats.write_failure_count.fetch_add(1, Ordering::Relaxed);
            Err(err)
        }
    }
}

/// Builds the fixed minicap global banner from the first frame's geometry.
fn minicap_banner(frame: &Frame) -> Bytes {
    let mut banner = BytesMut::with_capacity(MINICAP_BANNER_SIZE as usize);
    banner.put_u8(MINICAP_VERSION);
    banner.put_u8(MINICAP_BANNER_SIZE);
    banner.put_u32_le(std::process::id());
    // Real and virtual display sizes coincide here.
    banner.put_u32_le(frame.width);
    banner.put_u32_le(frame.height);
    banner.put_u32_le(frame.width);
    banner.put_u32_le(frame.height);
    banner.put_u8((frame.rotation.degrees() / 90) as u8);
    // Quirk bitmask: none.
    banner.put_u8(0);
    banner.freeze()
}

/// Length-prefixes one NAL unit in AVCC style (big-endian u32).
fn avcc_frame(payload: &Bytes) -> Bytes {
    let mut framed = BytesMut::with_capacity(4 + payload.len());
    framed.put_u32(payload.len() as u32);
    framed.extend_from_slice(payload);
    framed.freeze()
}

// Copyright (c) The ios-companion Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! MP4 container writing.
//!
//! The writer streams compressed samples into a growing `mdat` box while
//! keeping an in-memory index of sample sizes, durations and sync samples.
//! `finalize` patches the `mdat` length and appends the `moov` box.
//! Cancelling before finalize leaves a truncated-but-well-formed prefix
//! (consistent `ftyp` + `mdat`) and writes a sidecar error file next to the
//! output, so a half-written recording is diagnosable rather than silently
//! corrupt.

use crate::{
    errors::{CompanionError, VideoError},
    video::encoder::CompressedSample,
};
use bytes::{BufMut, Bytes, BytesMut};
use camino::{Utf8Path, Utf8PathBuf};
use std::{
    fs::File,
    io::{Seek, SeekFrom, Write},
};
use tracing::debug;

/// The movie timescale: ticks per second. 90 kHz divides evenly by the
/// common frame rates.
const TIMESCALE: u32 = 90_000;

/// Track geometry and codec parameters for one H.264 video track.
#[derive(Clone, Debug)]
pub struct Mp4TrackConfig {
    /// Frame width in pixels.
    pub width: u32,
    /// Frame height in pixels.
    pub height: u32,
    /// The H.264 sequence parameter set.
    pub sps: Bytes,
    /// The H.264 picture parameter set.
    pub pps: Bytes,
}

struct SampleIndex {
    sizes: Vec<u32>,
    durations: Vec<u32>,
    sync_samples: Vec<u32>,
}

impl SampleIndex {
    fn new() -> Self {
        Self {
            sizes: Vec::new(),
            durations: Vec::new(),
            sync_samples: Vec::new(),
        }
    }

    fn total_duration(&self) -> u64 {
        self.durations.iter().map(|&d| u64::from(d)).sum()
    }
}

enum WriterState {
    Writing,
    Finalized,
    Cancelled,
}

/// Writes one H.264 video track into an MP4 file.
pub struct Mp4Writer {
    file: File,
    path: Utf8PathBuf,
    config: Mp4TrackConfig,
    index: SampleIndex,
    mdat_size_offset: u64,
    mdat_data_offset: u64,
    bytes_written: u64,
    state: WriterState,
}

impl Mp4Writer {
    /// Creates the output file and writes the container preamble.
    pub fn create(
        path: impl AsRef<Utf8Path>,
        config: Mp4TrackConfig,
    ) -> Result<Self, CompanionError> {
        let path = path.as_ref().to_owned();
        let mut file =
            File::create(&path).map_err(|error| CompanionError::io_at(path.clone(), error))?;

        let ftyp = build_box(b"ftyp", |body| {
            body.put_slice(b"isom");
            body.put_u32(0x200);
            body.put_slice(b"isom");
            body.put_slice(b"iso2");
            body.put_slice(b"avc1");
            body.put_slice(b"mp41");
        });
        file.write_all(&ftyp)
            .map_err(|error| CompanionError::io_at(path.clone(), error))?;

        // mdat with a placeholder size, patched on finalize.
        let mdat_size_offset = ftyp.len() as u64;
        file.write_all(&0u32.to_be_bytes())
            .and_then(|()| file.write_all(b"mdat"))
            .map_err(|error| CompanionError::io_at(path.clone(), error))?;
        let mdat_data_offset = mdat_size_offset + 8;

        Ok(Self {
            file,
            path,
            config,
            index: SampleIndex::new(),
            mdat_size_offset,
            mdat_data_offset,
            bytes_written: 0,
            state: WriterState::Writing,
        })
    }

    /// The output path.
    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    /// The number of samples appended so far.
    pub fn sample_count(&self) -> usize {
        self.index.sizes.len()
    }

    /// Appends one compressed sample to the track.
    pub fn append_sample(&mut self, sample: &CompressedSample) -> Result<(), CompanionError> {
        if !matches!(self.state, WriterState::Writing) {
            return Err(VideoError::WriterFinalized.into());
        }
        // Samples are stored AVCC-framed, matching the avcC length size.
        let mut framed = BytesMut::with_capacity(4 + sample.payload.len());
        framed.put_u32(sample.payload.len() as u32);
        framed.extend_from_slice(&sample.payload);

        self.file
            .write_all(&framed)
            .map_err(|error| CompanionError::io_at(self.path.clone(), error))?;
        self.bytes_written += framed.len() as u64;

        let ticks = (sample.duration.as_secs_f64() * f64::from(TIMESCALE)).round() as u32;
        self.index.sizes.push(framed.len() as u32);
        self.index.durations.push(ticks.max(1));
        if sample.keyframe {
            self.index.sync_samples.push(self.index.sizes.len() as u32);
        }
        Ok(())
    }

    /// Patches the `mdat` size and appends the `moov` box.
    pub fn finalize(mut self) -> Result<Utf8PathBuf, CompanionError> {
        if !matches!(self.state, WriterState::Writing) {
            return Err(VideoError::WriterFinalized.into());
        }
        self.patch_mdat_size()?;
        let moov = build_moov(&self.config, &self.index, self.mdat_data_offset);
        self.file
            .write_all(&moov)
            .and_then(|()| self.file.flush())
            .map_err(|error| CompanionError::io_at(self.path.clone(), error))?;
        self.state = WriterState::Finalized;
        debug!(path = %self.path, samples = self.index.sizes.len(), "mp4 finalized");
        Ok(self.path.clone())
    }

    /// Abandons the recording: leaves the consistent prefix on disk and
    /// writes a `.error` sidecar describing why.
    pub fn cancel(mut self, reason: &str) -> Result<(), CompanionError> {
        if !matches!(self.state, WriterState::Writing) {
            return Ok(());
        }
        self.patch_mdat_size()?;
        self.file
            .flush()
            .map_err(|error| CompanionError::io_at(self.path.clone(), error))?;
        self.state = WriterState::Cancelled;

        let sidecar = sidecar_path(&self.path);
        std::fs::write(&sidecar, format!("recording cancelled: {reason}\n"))
            .map_err(|error| CompanionError::io_at(sidecar.clone(), error))?;
        debug!(path = %self.path, %sidecar, "mp4 cancelled");
        Ok(())
    }

    fn patch_mdat_size(&mut self) -> Result<(), CompanionError> {
        let mdat_size = 8 + self.bytes_written;
        self.file
            .seek(SeekFrom::Start(self.mdat_size_offset))
            .and_then(|_| self.file.write_all(&(mdat_size as u32).to_be_bytes()))
            .and_then(|()| self.file.seek(SeekFrom::End(0)).map(|_| ()))
            .map_err(|error| CompanionError::io_at(self.path.clone(), error))
    }
}

/// The path of the error sidecar for an output file.
pub fn sidecar_path(output: &Utf8Path) -> Utf8PathBuf {
    let mut path = output.to_owned();
    path.set_extension("error");
    path
}

fn build_box(name: &[u8; 4], fill: impl FnOnce(&mut BytesMut)) -> Bytes {
    let mut body = BytesMut::new();
    fill(&mut body);
    let mut out = BytesMut::with_capacity(8 + body.len());
    out.put_u32((8 + body.len()) as u32);
    out.put_slice(name);
    out.extend_from_slice(&body);
    out.freeze()
}

fn build_full_box(name: &[u8; 4], version: u8, flags: u32, fill: impl FnOnce(&mut BytesMut)) -> Bytes {
    build_box(name, |body| {
        body.put_u8(version);
        body.put_slice(&flags.to_be_bytes()[1..]);
        fill(body);
    })
}

fn build_moov(config: &Mp4TrackConfig, index: &SampleIndex, mdat_data_offset: u64) -> Bytes {
    let duration = index.total_duration();
    build_box(b"moov", |moov| {
        moov.extend_from_slice(&build_mvhd(duration));
        moov.extend_from_slice(&build_trak(config, index, duration, mdat_data_offset));
    })
}

fn build_mvhd(duration: u64) -> Bytes {
    build_full_box(b"mvhd", 0, 0, |body| {
        body.put_u32(0); // creation time
        body.put_u32(0); // modification time
        body.put_u32(TIMESCALE);
        body.put_u32(duration as u32);
        body.put_u32(0x0001_0000); // rate 1.0
        body.put_u16(0x0100); // volume 1.0
        body.put_u16(0);
        body.put_u64(0);
        for value in IDENTITY_MATRIX {
            body.put_u32(value);
        }
        for _ in 0..6 {
            body.put_u32(0); // predefined
        }
        body.put_u32(2); // next track id
    })
}

const IDENTITY_MATRIX: [u32; 9] = [
    0x0001_0000,
    0,
    0,
    0,
    0x0001_0000,
    0,
    0,
    0,
    0x4000_0000,
];

fn build_trak(
    config: &Mp4TrackConfig,
    index: &SampleIndex,
    duration: u64,
    mdat_data_offset: u64,
) -> Bytes {
    build_box(b"trak", |trak| {
        // tkhd flags: enabled | in movie | in preview.
        trak.extend_from_slice(&build_full_box(b"tkhd", 0, 0x7, |body| {
            body.put_u32(0); // creation time
            body.put_u32(0); // modification time
            body.put_u32(1); // track id
            body.put_u32(0); // reserved
            body.put_u32(duration as u32);
            body.put_u64(0); // reserved
            body.put_u16(0); // layer
            body.put_u16(0); // alternate group
            body.put_u16(0); // volume (video)
            body.put_u16(0); // reserved
            for value in IDENTITY_MATRIX {
                body.put_u32(value);
            }
            body.put_u32(config.width << 16);
            body.put_u32(config.height << 16);
        }));
        trak.extend_from_slice(&build_mdia(config, index, duration, mdat_data_offset));
    })
}

fn build_mdia(
    config: &Mp4TrackConfig,
    index: &SampleIndex,
    duration: u64,
    mdat_data_offset: u64,
) -> Bytes {
    build_box(b"mdia", |mdia| {
        mdia.extend_from_slice(&build_full_box(b"mdhd", 0, 0, |body| {
            body.put_u32(0);
            body.put_u32(0);
            body.put_u32(TIMESCALE);
            body.put_u32(duration as u32);
            body.put_u16(0x55c4); // language: und
            body.put_u16(0);
        }));
        mdia.extend_from_slice(&build_full_box(b"hdlr", 0, 0, |body| {
            body.put_u32(0);
            body.put_slice(b"vide");
            body.put_u64(0);
            body.put_u32(0);
            body.put_slice(b"VideoHandler\0");
        }));
        mdia.extend_from_slice(&build_minf(config, index, mdat_data_offset));
    })
}

fn build_minf(config: &Mp4TrackConfig, index: &SampleIndex, mdat_data_offset: u64) -> Bytes {
    build_box(b"minf", |minf| {
        minf.extend_from_slice(&build_full_box(b"vmhd", 0, 1, |body| {
            body.put_u16(0); // graphics mode
            body.put_u16(0);
            body.put_u16(0);
            body.put_u16(0); // opcolor
        }));
        minf.extend_from_slice(&build_box(b"dinf", |dinf| {
            dinf.extend_from_slice(&build_full_box(b"dref", 0, 0, |body| {
                body.put_u32(1); // entry count
                // Self-contained url entry.
                body.extend_from_slice(&build_full_box(b"url ", 0, 1, |_| {}));
            }));
        }));
        minf.extend_from_slice(&build_stbl(config, index, mdat_data_offset));
    })
}

fn build_stbl(config: &Mp4TrackConfig, index: &SampleIndex, mdat_data_offset: u64) -> Bytes {
    build_box(b"stbl", |stbl| {
        stbl.extend_from_slice(&build_stsd(config));
        stbl.extend_from_slice(&build_stts(index));
        if !index.sync_samples.is_empty() {
            stbl.extend_from_slice(&build_full_box(b"stss", 0, 0, |body| {
                body.put_u32(index.sync_samples.len() as u32);
                for &sample in &index.sync_samples {
                    body.put_u32(sample);
                }
            }));
        }
        // One chunk holding every sample, starting at the mdat payload.
        stbl.extend_from_slice(&build_full_box(b"stsc", 0, 0, |body| {
            body.put_u32(1);
            body.put_u32(1); // first chunk
            body.put_u32(index.sizes.len() as u32); // samples per chunk
            body.put_u32(1); // sample description index
        }));
        stbl.extend_from_slice(&build_full_box(b"stsz", 0, 0, |body| {
            body.put_u32(0); // no uniform size
            body.put_u32(index.sizes.len() as u32);
            for &size in &index.sizes {
                body.put_u32(size);
            }
        }));
        stbl.extend_from_slice(&build_full_box(b"stco", 0, 0, |body| {
            body.put_u32(1);
            body.put_u32(mdat_data_offset as u32);
        }));
    })
}

fn build_stsd(config: &Mp4TrackConfig) -> Bytes {
    build_full_box(b"stsd", 0, 0, |body| {
        body.put_u32(1); // entry count
        body.extend_from_slice(&build_box(b"avc1", |avc1| {
            avc1.put_uint(0, 6); // reserved
            avc1.put_u16(1); // data reference index
            avc1.put_u16(0); // predefined
            avc1.put_u16(0); // reserved
            avc1.put_u64(0);
            avc1.put_u32(0); // predefined
            avc1.put_u16(config.width as u16);
            avc1.put_u16(config.height as u16);
            avc1.put_u32(0x0048_0000); // 72 dpi horizontal
            avc1.put_u32(0x0048_0000); // 72 dpi vertical
            avc1.put_u32(0); // reserved
            avc1.put_u16(1); // frame count
            avc1.put_slice(&[0u8; 32]); // compressor name
            avc1.put_u16(0x18); // depth
            avc1.put_i16(-1); // predefined
            avc1.extend_from_slice(&build_box(b"avcC", |avcc| {
                avcc.put_u8(1); // configuration version
                avcc.put_u8(config.sps.get(1).copied().unwrap_or(0x42)); // profile
                avcc.put_u8(config.sps.get(2).copied().unwrap_or(0)); // compatibility
                avcc.put_u8(config.sps.get(3).copied().unwrap_or(0x1e)); // level
                avcc.put_u8(0xff); // 4-byte NAL lengths
                avcc.put_u8(0xe1); // one SPS
                avcc.put_u16(config.sps.len() as u16);
                avcc.put_slice(&config.sps);
                avcc.put_u8(1); // one PPS
                avcc.put_u16(config.pps.len() as u16);
                avcc.put_slice(&config.pps);
            }));
        }));
    })
}

/// Run-length encodes sample durations into `stts` entries.
fn build_stts(index: &SampleIndex) -> Bytes {
    let mut runs: Vec<(u32, u32)> = Vec::new();
    for &duration in &index.durations {
        match runs.last_mut() {
            Some((count, existing)) if *existing == duration => *count += 1,
            _ => runs.push((1, duration)),
        }
    }
    build_full_box(b"stts", 0, 0, |body| {
        body.put_u32(runs.len() as u32);
        for (count, duration) in runs {
            body.put_u32(count);
            body.put_u32(duration);
        }
    })
}

// Copyright (c) The ios-companion Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Video streaming and recording pumps.
//!
//! A [`VideoStream`] pulls frames from a [`FrameSource`](crate::video::FrameSource)
//! subscription and drives a [`FrameEncoder`] into a byte consumer, either lazily (a write
//! per fresh frame) or eagerly at a fixed rate (repeating the last frame to
//! hold cadence). A [`VideoRecorder`] drives a compression session into an
//! [`Mp4Writer`] instead.
//!
//! Backpressure: when the consumer reports not-ready, the pump counts
//! consecutive starved intervals; once past a warm-up window it logs a
//! starvation warning (once) and drops frames, incrementing `drop_count`.

use crate::{
    consumer::DataConsumer,
    errors::{CompanionError, VideoError},
    fut::{Deferred, Resolver},
    session::Continuation,
    video::{
        encoder::{CompressionSession, EncoderStats, EncoderStatsSnapshot, FrameEncoder},
        frame::Frame,
        mp4::Mp4Writer,
    },
};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, warn};

/// Consecutive starved intervals tolerated before dropping starts.
const STARVATION_WARMUP: u64 = 30;

enum PumpState {
    Idle {
        encoder: FrameEncoder,
    },
    Running {
        task: tokio::task::JoinHandle<()>,
    },
    Stopped,
}

struct StreamShared {
    sink: Arc<dyn DataConsumer>,
    stats: Arc<EncoderStats>,
    completed: Deferred<()>,
    resolver: Resolver<()>,
    stop_tx: watch::Sender<bool>,
}

/// A lazy or eager encoded video stream.
pub struct VideoStream {
    shared: Arc<StreamShared>,
    frames: watch::Receiver<Option<Frame>>,
    frames_per_second: Option<u32>,
    state: Mutex<PumpState>,
}

impl VideoStream {
    /// Creates a stream around an encoder, a frame subscription and a sink.
    ///
    /// `frames_per_second` of `None` selects lazy streaming.
    pub fn new(
        encoder: FrameEncoder,
        frames: watch::Receiver<Option<Frame>>,
        sink: Arc<dyn DataConsumer>,
        frames_per_second: Option<u32>,
    ) -> Self {
        let stats = encoder.stats();
        let (resolver, completed) = Deferred::new();
        let (stop_tx, _stop_rx) = watch::channel(false);
        let shared = Arc::new(StreamShared {
            sink,
            stats,
            completed,
            resolver,
            stop_tx,
        });
        // Cancelling the completion future is the cooperative stop signal.
        {
            let stop_tx = shared.stop_tx.clone();
            shared.resolver.on_cancel(move || {
                let _ = stop_tx.send(true);
            });
        }
        Self {
            shared,
            frames,
            frames_per_second,
            state: Mutex::new(PumpState::Idle { encoder }),
        }
    }

    /// The stream's statistics.
    pub fn stats(&self) -> EncoderStatsSnapshot {
        self.shared.stats.snapshot()
    }

    /// Starts the pump task.
    pub fn start(&self) -> Result<(), CompanionError> {
        let mut state = self.state.lock().expect("stream state lock poisoned");
        let PumpState::Idle { encoder } = std::mem::replace(&mut *state, PumpState::Stopped)
        else {
            return Err(VideoError::InvalidStreamState("already started").into());
        };
        let task = tokio::spawn(pump(
            encoder,
            self.frames.clone(),
            Arc::clone(&self.shared),
            self.frames_per_second,
        ));
        *state = PumpState::Running { task };
        Ok(())
    }

    /// Stops the pump, finishes the encoder and closes the sink.
    pub async fn stop(&self) -> Result<(), CompanionError> {
        let task = {
            let mut state = self.state.lock().expect("stream state lock poisoned");
            match std::mem::replace(&mut *state, PumpState::Stopped) {
                PumpState::Running { task } => task,
                PumpState::Idle { .. } => {
                    return Err(VideoError::InvalidStreamState("never started").into());
                }
                PumpState::Stopped => return Ok(()),
            }
        };
        let _ = self.shared.stop_tx.send(true);
        let _ = task.await;
        Ok(())
    }
}

impl Continuation for VideoStream {
    fn completed(&self) -> Deferred<()> {
        self.shared.completed.clone()
    }
}

impl Clone for VideoStream {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            frames: self.frames.clone(),
            frames_per_second: self.frames_per_second,
            // Clones observe the stream; only the original can start it.
            state: Mutex::new(PumpState::Stopped),
        }
    }
}

async fn pump(
    mut encoder: FrameEncoder,
    mut frames: watch::Receiver<Option<Frame>>,
    shared: Arc<StreamShared>,
    frames_per_second: Option<u32>,
) {
    let mut stop_rx = shared.stop_tx.subscribe();
    let mut starved_intervals: u64 = 0;
    let mut starvation_logged = false;

    match frames_per_second {
        Some(fps) => {
            // Eager: hold the cadence, repeating the last frame as needed.
            let mut interval =
                tokio::time::interval(Duration::from_secs(1) / fps.max(1));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let frame = frames.borrow().clone();
                        let Some(frame) = frame else { continue };
                        if !shared.sink.is_ready() {
                            starved_intervals += 1;
                            if starved_intervals > STARVATION_WARMUP {
                                if !starvation_logged {
                                    warn!(
                                        intervals = starved_intervals,
                                        "video consumer is starving the stream; dropping frames"
                                    );
                                    starvation_logged = true;
                                }
                                shared
                                    .stats
                                    .drop_count
                                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                            }
                            continue;
                        }
                        starved_intervals = 0;
                        if let Err(err) = encoder.write_frame(&frame, shared.sink.as_ref()) {
                            debug!("eager stream write failed: {err}");
                            break;
                        }
                    }
                    _ = stop_rx.changed() => break,
                }
            }
        }
        None => {
            // Lazy: a write per fresh frame, when the consumer is ready.
            loop {
                tokio::select! {
                    changed = frames.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let frame = frames.borrow_and_update().clone();
                        let Some(frame) = frame else { continue };
                        if !shared.sink.is_ready() {
                            shared
                                .stats
                                .drop_count
                                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                            continue;
                        }
                        if let Err(err) = encoder.write_frame(&frame, shared.sink.as_ref()) {
                            debug!("lazy stream write failed: {err}");
                            break;
                        }
                    }
                    _ = stop_rx.changed() => break,
                }
            }
        }
    }

    if let Err(err) = encoder.finish(shared.sink.as_ref()) {
        debug!("encoder finish failed: {err}");
    }
    let _ = shared.sink.end_of_file();
    shared.resolver.resolve(());
}

/// Records H.264 samples from a frame subscription into an MP4 file.
pub struct VideoRecorder {
    shared: Arc<RecorderShared>,
    state: Arc<Mutex<RecorderState>>,
}

impl Clone for VideoRecorder {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            state: Arc::clone(&self.state),
        }
    }
}

struct RecorderShared {
    completed: Deferred<()>,
    resolver: Resolver<()>,
    stop_tx: watch::Sender<StopRequest>,
    stats: Arc<EncoderStats>,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
enum StopRequest {
    #[default]
    None,
    Finalize,
    Cancel,
}

enum RecorderState {
    Idle {
        session: Box<dyn CompressionSession>,
        writer: Mp4Writer,
        frames: watch::Receiver<Option<Frame>>,
        frames_per_second: u32,
    },
    Running {
        task: tokio::task::JoinHandle<Result<Option<camino::Utf8PathBuf>, CompanionError>>,
    },
    Stopped,
}

impl VideoRecorder {
    /// Creates a recorder; [`VideoRecorder::start`] begins consuming
    /// frames.
    pub fn new(
        session: Box<dyn CompressionSession>,
        writer: Mp4Writer,
        frames: watch::Receiver<Option<Frame>>,
        frames_per_second: u32,
    ) -> Self {
        let (resolver, completed) = Deferred::new();
        let (stop_tx, _) = watch::channel(StopRequest::None);
        let shared = Arc::new(RecorderShared {
            completed,
            resolver,
            stop_tx,
            stats: Arc::new(EncoderStats::default()),
        });
        {
            // Cancellation aborts the container rather than finalizing it.
            let stop_tx = shared.stop_tx.clone();
            shared.resolver.on_cancel(move || {
                let _ = stop_tx.send(StopRequest::Cancel);
            });
        }
        Self {
            shared,
            state: Arc::new(Mutex::new(RecorderState::Idle {
                session,
                writer,
                frames,
                frames_per_second,
            })),
        }
    }

    /// The recorder's statistics.
    pub fn stats(&self) -> EncoderStatsSnapshot {
        self.shared.stats.snapshot()
    }

    /// Starts recording.
    pub fn start(&self) -> Result<(), CompanionError> {
        let mut state = self.state.lock().expect("recorder state lock poisoned");
        let RecorderState::Idle {
            session,
            writer,
            frames,
            frames_per_second,
        } = std::mem::replace(&mut *state, RecorderState::Stopped)
        else {
            return Err(VideoError::InvalidStreamState("already started").into());
        };
        let task = tokio::spawn(record(
            session,
            writer,
            frames,
            frames_per_second,
            Arc::clone(&self.shared),
        ));
        *state = RecorderState::Running { task };
        Ok(())
    }

    /// Stops recording and finalizes the container, returning its path.
    pub async fn stop(&self) -> Result<camino::Utf8PathBuf, CompanionError> {
        let task = {
            let mut state = self.state.lock().expect("recorder state lock poisoned");
            match std::mem::replace(&mut *state, RecorderState::Stopped) {
                RecorderState::Running { task } => task,
                RecorderState::Idle { .. } => {
                    return Err(VideoError::InvalidStreamState("never started").into());
                }
                RecorderState::Stopped => {
                    return Err(VideoError::WriterFinalized.into());
                }
            }
        };
        let _ = self.shared.stop_tx.send(StopRequest::Finalize);
        let outcome = task
            .await
            .map_err(|err| CompanionError::Precondition(format!("recorder task failed: {err}")))??;
        outcome.ok_or_else(|| VideoError::WriterFinalized.into())
    }
}

impl Continuation for VideoRecorder {
    fn completed(&self) -> Deferred<()> {
        self.shared.completed.clone()
    }
}

async fn record(
    mut session: Box<dyn CompressionSession>,
    mut writer: Mp4Writer,
    mut frames: watch::Receiver<Option<Frame>>,
    frames_per_second: u32,
    shared: Arc<RecorderShared>,
) -> Result<Option<camino::Utf8PathBuf>, CompanionError> {
    let mut stop_rx = shared.stop_tx.subscribe();
    let mut interval =
        tokio::time::interval(Duration::from_secs(1) / frames_per_second.max(1));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    let outcome = loop {
        tokio::select! {
            _ = interval.tick() => {
                let frame = frames.borrow_and_update().clone();
                let Some(frame) = frame else { continue };
                shared
                    .stats
                    .callback_count
                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                match session.submit(&frame) {
                    Ok(samples) => {
                        for sample in samples {
                            writer.append_sample(&sample)?;
                            shared
                                .stats
                                .write_count
                                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                        }
                    }
                    Err(err) => {
                        shared
                            .stats
                            .encode_error_count
                            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                        debug!("compression failed mid-recording: {err}");
                    }
                }
            }
            _ = stop_rx.changed() => {
                break *stop_rx.borrow();
            }
        }
    };

    let result = match outcome {
        StopRequest::Cancel => {
            writer.cancel("recording cancelled")?;
            Ok(None)
        }
        _ => {
            for sample in session.finish().unwrap_or_default() {
                writer.append_sample(&sample)?;
            }
            writer.finalize().map(Some)
        }
    };
    shared.resolver.resolve(());
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        consumer::FnConsumer,
        video::{
            frame::{FrameSource, PixelFormat},
            mp4::{Mp4TrackConfig, sidecar_path},
            test_support::{FakeJpeg, FakeSession},
        },
    };
    use bytes::Bytes;

    fn source_with_one_frame() -> FrameSource {
        let source = FrameSource::new(4, 4, PixelFormat::Bgra8888);
        source.push_surface(Bytes::from(vec![1u8; 64]), None);
        source
    }

    fn counting_sink() -> (Arc<FnConsumer>, Arc<std::sync::Mutex<usize>>) {
        let written = Arc::new(std::sync::Mutex::new(0usize));
        let sink = {
            let written = Arc::clone(&written);
            FnConsumer::new(move |_chunk| {
                *written.lock().expect("lock") += 1;
            })
        };
        (sink, written)
    }

    #[tokio::test(start_paused = true)]
    async fn eager_stream_repeats_last_frame() {
        let source = source_with_one_frame();
        let (sink, _written) = counting_sink();
        let stream = VideoStream::new(
            FrameEncoder::H264 {
                session: Box::new(FakeSession::new(30)),
                stats: Arc::new(EncoderStats::default()),
            },
            source.subscribe(),
            sink,
            Some(30),
        );
        stream.start().expect("start");

        // 100ms at 30fps is at least three ticks.
        for _ in 0..10 {
            tokio::time::advance(Duration::from_millis(11)).await;
            tokio::task::yield_now().await;
        }
        stream.stop().await.expect("stop");

        let stats = stream.stats();
        assert!(
            stats.write_count >= 3,
            "one frame fed, {} written (repeats held cadence)",
            stats.write_count
        );
        assert_eq!(stats.drop_count, 0);
        stream
            .completed()
            .value()
            .await
            .expect("stream completion resolves after stop");
    }

    #[tokio::test]
    async fn lazy_stream_writes_per_fresh_frame() {
        let source = FrameSource::new(4, 4, PixelFormat::Bgra8888);
        let (sink, written) = counting_sink();
        let stream = VideoStream::new(
            FrameEncoder::Mjpeg {
                compressor: Arc::new(FakeJpeg),
                quality: 0.5,
                stats: Arc::new(EncoderStats::default()),
            },
            source.subscribe(),
            sink,
            None,
        );
        stream.start().expect("start");

        for _ in 0..3 {
            source.push_surface(Bytes::from(vec![0u8; 64]), None);
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        stream.stop().await.expect("stop");

        let count = *written.lock().expect("lock");
        assert!(
            (3..=4).contains(&count),
            "three frames, {count} writes (latest-value coalescing allowed)"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn cancelling_completion_stops_the_pump() {
        let source = source_with_one_frame();
        let (sink, _) = counting_sink();
        let stream = VideoStream::new(
            FrameEncoder::Bgra {
                stats: Arc::new(EncoderStats::default()),
            },
            source.subscribe(),
            sink,
            Some(10),
        );
        stream.start().expect("start");
        stream.completed().cancel();
        for _ in 0..5 {
            tokio::time::advance(Duration::from_millis(150)).await;
            tokio::task::yield_now().await;
        }
        // The pump exited; stopping again is a no-op rather than a hang.
        stream.stop().await.expect("stop after cancel");
    }

    #[tokio::test(start_paused = true)]
    async fn recorder_produces_mp4() {
        let dir = camino_tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("rec.mp4");
        let source = source_with_one_frame();
        let recorder = VideoRecorder::new(
            Box::new(FakeSession::new(30)),
            Mp4Writer::create(
                &path,
                Mp4TrackConfig {
                    width: 4,
                    height: 4,
                    sps: Bytes::from_static(&[0x67, 0x42, 0x00, 0x1e]),
                    pps: Bytes::from_static(&[0x68, 0xce, 0x38, 0x80]),
                },
            )
            .expect("create writer"),
            source.subscribe(),
            30,
        );
        recorder.start().expect("start");
        for _ in 0..10 {
            tokio::time::advance(Duration::from_millis(11)).await;
            tokio::task::yield_now().await;
        }
        let out = recorder.stop().await.expect("stop");
        assert_eq!(out, path);
        let data = std::fs::read(&path).expect("read");
        assert!(data.windows(4).any(|w| w == b"moov"), "finalized container");
        assert!(recorder.stats().write_count >= 3);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_recorder_leaves_sidecar() {
        let dir = camino_tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("cancelled.mp4");
        let source = source_with_one_frame();
        let recorder = VideoRecorder::new(
            Box::new(FakeSession::new(30)),
            Mp4Writer::create(
                &path,
                Mp4TrackConfig {
                    width: 4,
                    height: 4,
                    sps: Bytes::from_static(&[0x67]),
                    pps: Bytes::from_static(&[0x68]),
                },
            )
            .expect("create writer"),
            source.subscribe(),
            30,
        );
        recorder.start().expect("start");
        for _ in 0..5 {
            tokio::time::advance(Duration::from_millis(11)).await;
            tokio::task::yield_now().await;
        }
        recorder.completed().cancel();
        for _ in 0..5 {
            tokio::time::advance(Duration::from_millis(50)).await;
            tokio::task::yield_now().await;
        }
        recorder
            .completed()
            .value()
            .await
            .expect_err("completion reports cancellation");
        assert!(
            sidecar_path(&path).exists(),
            "sidecar error file written on cancel"
        );
        let data = std::fs::read(&path).expect("read");
        assert!(
            !data.windows(4).any(|w| w == b"moov"),
            "no moov in a cancelled prefix"
        );
    }
}

// Copyright (c) The ios-companion Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Video recordings as delta sessions.

use crate::{
    fut::Deferred,
    logger::Logger,
    session::{Continuation, DeltaUpdateManager, SessionUuid},
    video::{EncoderConfig, VideoRecorder},
};
use camino::Utf8PathBuf;
use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

/// Parameters for starting a recording session.
#[derive(Clone, Debug)]
pub struct RecordingConfig {
    /// Encoder settings for the recording.
    pub encoder: EncoderConfig,
    /// Where the MP4 should be written.
    pub output_path: Utf8PathBuf,
}

/// One increment of recording progress.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RecordingDelta {
    /// Samples written to the container since the last poll.
    pub samples_written: u64,
    /// Frames dropped since the recording began.
    pub total_dropped: u64,
    /// The finished container, reported on the terminal delta.
    pub output_path: Option<Utf8PathBuf>,
    /// True on the final delta.
    pub finished: bool,
}

/// A recorder wrapped with per-session progress accounting.
#[derive(Clone)]
pub struct VideoRecordingOperation {
    recorder: Arc<VideoRecorder>,
    output_path: Utf8PathBuf,
    last_write_count: Arc<Mutex<u64>>,
}

impl VideoRecordingOperation {
    /// Wraps a started recorder.
    pub fn new(recorder: Arc<VideoRecorder>, output_path: Utf8PathBuf) -> Self {
        Self {
            recorder,
            output_path,
            last_write_count: Arc::new(Mutex::new(0)),
        }
    }

    /// The wrapped recorder.
    pub fn recorder(&self) -> &Arc<VideoRecorder> {
        &self.recorder
    }

    fn progress(&self) -> (u64, u64) {
        let stats = self.recorder.stats();
        let mut last = self
            .last_write_count
            .lock()
            .expect("write count lock poisoned");
        let new_samples = stats.write_count.saturating_sub(*last);
        *last = stats.write_count;
        (new_samples, stats.drop_count)
    }
}

impl Continuation for VideoRecordingOperation {
    fn completed(&self) -> Deferred<()> {
        self.recorder.completed()
    }
}

/// A delta-update manager over video recordings.
pub type VideoSessionManager =
    DeltaUpdateManager<RecordingConfig, VideoRecordingOperation, RecordingDelta>;

/// Builds the manager around a recorder-starting closure.
pub fn video_session_manager(
    logger: Logger,
    expiration: Option<Duration>,
    capacity: Option<usize>,
    start_recorder: impl Fn(RecordingConfig) -> Deferred<VideoRecordingOperation>
    + Send
    + Sync
    + 'static,
) -> VideoSessionManager {
    DeltaUpdateManager::new(
        "video-recording",
        logger,
        expiration,
        capacity,
        start_recorder,
        |operation: &VideoRecordingOperation, _id: SessionUuid, done: &mut bool| {
            let (samples_written, total_dropped) = operation.progress();
            let finished = operation.completed().is_done();
            if finished {
                *done = true;
            }
            Deferred::resolved(RecordingDelta {
                samples_written,
                total_dropped,
                output_path: finished.then(|| operation.output_path.clone()),
                finished,
            })
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::video::{
        FrameSource, Mp4TrackConfig, Mp4Writer, PixelFormat, test_support::FakeSession,
    };
    use bytes::Bytes;

    #[tokio::test(start_paused = true)]
    async fn recording_session_reports_progress_then_path() {
        let dir = camino_tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("session.mp4");
        let source = Arc::new(FrameSource::new(4, 4, PixelFormat::Bgra8888));
        source.push_surface(Bytes::from(vec![0u8; 64]), None);

        let manager = video_session_manager(Logger::null(), None, Some(1), {
            let source = Arc::clone(&source);
            move |config| {
                let writer = Mp4Writer::create(
                    &config.output_path,
                    Mp4TrackConfig {
                        width: 4,
                        height: 4,
                        sps: Bytes::from_static(&[0x67, 0x42, 0x00, 0x1e]),
                        pps: Bytes::from_static(&[0x68, 0xce, 0x38, 0x80]),
                    },
                )
                .expect("create writer");
                let recorder = Arc::new(VideoRecorder::new(
                    Box::new(FakeSession::new(30)),
                    writer,
                    source.subscribe(),
                    30,
                ));
                recorder.start().expect("start");
                Deferred::resolved(VideoRecordingOperation::new(
                    recorder,
                    config.output_path,
                ))
            }
        });

        let session = manager
            .start(RecordingConfig {
                encoder: EncoderConfig::default(),
                output_path: path.clone(),
            })
            .await
            .expect("start");

        for _ in 0..10 {
            tokio::time::advance(Duration::from_millis(11)).await;
            tokio::task::yield_now().await;
        }
        let first = session.obtain_updates().await.expect("first delta");
        assert!(first.samples_written >= 1);
        assert!(!first.finished);

        // Stop the recorder, then terminate the session.
        session
            .operation()
            .recorder()
            .stop()
            .await
            .expect("stop recorder");
        let final_delta = session.terminate().await.expect("terminate");
        assert!(final_delta.finished);
        assert_eq!(final_delta.output_path.as_deref(), Some(path.as_path()));
        assert!(
            std::fs::read(&path)
                .expect("file")
                .windows(4)
                .any(|w| w == b"moov")
        );
    }
}

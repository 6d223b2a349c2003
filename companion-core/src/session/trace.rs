// Copyright (c) The ios-companion Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Instruments-style trace sessions.
//!
//! A trace records target activity into an on-disk trace directory while
//! streaming tool output. The operation is deliberately thin: the actual
//! trace recorder is a target binding; this module adapts whatever it
//! produces to the delta-update manager.

use crate::{
    consumer::{DataConsumer, FnConsumer},
    fut::Deferred,
    logger::Logger,
    session::{Continuation, DeltaUpdateManager, SessionUuid},
};
use camino::Utf8PathBuf;
use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

/// Parameters for starting a trace.
#[derive(Clone, Debug)]
pub struct TraceConfig {
    /// The instruments template to record with.
    pub template_name: String,
    /// Extra tool arguments.
    pub arguments: Vec<String>,
    /// Where the trace directory should be written.
    pub output_path: Utf8PathBuf,
    /// Stop automatically after this long, if set.
    pub time_limit: Option<Duration>,
}

/// One increment of trace progress.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TraceDelta {
    /// Tool output accumulated since the last poll.
    pub log_output: String,
    /// The trace directory, reported on the terminal delta.
    pub trace_path: Option<Utf8PathBuf>,
    /// True on the final delta.
    pub finished: bool,
}

/// A running trace adapted for delta sessions.
#[derive(Clone)]
pub struct TraceOperation {
    completed: Deferred<()>,
    log_buffer: Arc<Mutex<String>>,
    output_path: Utf8PathBuf,
}

impl TraceOperation {
    /// Creates the operation and the consumer that captures tool output.
    ///
    /// The caller wires the consumer to the recorder process and resolves
    /// (or cancels) `completed` through the returned future's resolver.
    pub fn new(
        completed: Deferred<()>,
        output_path: Utf8PathBuf,
    ) -> (Self, Arc<dyn DataConsumer>) {
        let log_buffer = Arc::new(Mutex::new(String::new()));
        let consumer = {
            let log_buffer = Arc::clone(&log_buffer);
            FnConsumer::new(move |chunk| {
                log_buffer
                    .lock()
                    .expect("trace log lock poisoned")
                    .push_str(&String::from_utf8_lossy(&chunk));
            })
        };
        (
            Self {
                completed,
                log_buffer,
                output_path,
            },
            consumer,
        )
    }

    /// Takes the output accumulated since the last drain.
    pub fn drain_log(&self) -> String {
        std::mem::take(&mut *self.log_buffer.lock().expect("trace log lock poisoned"))
    }

    /// The trace directory this operation writes.
    pub fn output_path(&self) -> &Utf8PathBuf {
        &self.output_path
    }
}

impl Continuation for TraceOperation {
    fn completed(&self) -> Deferred<()> {
        self.completed.clone()
    }
}

/// A delta-update manager over trace operations.
pub type TraceSessionManager = DeltaUpdateManager<TraceConfig, TraceOperation, TraceDelta>;

/// Builds a trace session manager around a recorder-starting closure.
pub fn trace_session_manager(
    logger: Logger,
    expiration: Option<Duration>,
    capacity: Option<usize>,
    start_recorder: impl Fn(TraceConfig) -> Deferred<TraceOperation> + Send + Sync + 'static,
) -> TraceSessionManager {
    DeltaUpdateManager::new(
        "instruments",
        logger,
        expiration,
        capacity,
        start_recorder,
        |operation: &TraceOperation, _id: SessionUuid, done: &mut bool| {
            let finished = operation.completed.is_done();
            if finished {
                *done = true;
            }
            Deferred::resolved(TraceDelta {
                log_output: operation.drain_log(),
                trace_path: finished.then(|| operation.output_path.clone()),
                finished,
            })
        },
    )
}

// Copyright (c) The ios-companion Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Errors produced by the companion core.

use crate::session::SessionUuid;
use camino::Utf8PathBuf;
use companion_metadata::{TargetCapability, TargetState};
use std::{sync::Arc, time::Duration};
use thiserror::Error;

/// The result of awaiting a [`Deferred`](crate::fut::Deferred) value.
pub type FutureResult<T> = Result<T, FutureError>;

/// The closed set of ways a future can fail.
///
/// Timeouts and cancellations carry no domain payload; a rejection wraps the
/// domain error produced by the operation.
#[derive(Clone, Debug, Error)]
pub enum FutureError {
    /// The wait deadline elapsed before the future became terminal.
    #[error("operation timed out after {}ms", .0.as_millis())]
    Timeout(Duration),

    /// The future was cancelled by a caller.
    #[error("operation was cancelled")]
    Cancelled,

    /// The operation failed with a domain error.
    #[error(transparent)]
    Rejected(Arc<CompanionError>),
}

impl FutureError {
    /// Wraps a domain error as a rejection.
    pub fn rejected(err: impl Into<CompanionError>) -> Self {
        Self::Rejected(Arc::new(err.into()))
    }

    /// True if this is a cancellation.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

impl From<CompanionError> for FutureError {
    fn from(err: CompanionError) -> Self {
        Self::rejected(err)
    }
}

/// The top-level error type of the companion core.
///
/// Component-specific errors nest under this so that future rejections and
/// capability results share one currency.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CompanionError {
    /// An argument was rejected before any state was mutated.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The named entity does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The operation requires state the target is not in.
    #[error("precondition not met: {0}")]
    Precondition(String),

    /// A session-manager error.
    #[error(transparent)]
    Session(#[from] SessionError),

    /// A channel or byte-transport error.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// A daemon protocol error.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// A process launch or termination error.
    #[error(transparent)]
    Process(#[from] ProcessError),

    /// A video pipeline error.
    #[error(transparent)]
    Video(#[from] VideoError),

    /// A crash-log store or parser error.
    #[error(transparent)]
    CrashLog(#[from] CrashLogError),

    /// A test-bundle preparation error.
    #[error(transparent)]
    Prepare(#[from] PrepareError),

    /// A target lifecycle error.
    #[error(transparent)]
    TargetLifecycle(#[from] TargetLifecycleError),

    /// An I/O error with the path it occurred on, if known.
    #[error("I/O error{}", display_path(.path))]
    Io {
        /// The path the operation was against.
        path: Option<Utf8PathBuf>,
        /// The underlying error.
        #[source]
        error: std::io::Error,
    },

    /// Several underlying failures, e.g. from a fan-out consumer.
    #[error("{} errors occurred: [{}]", .0.len(), join_errors(.0))]
    Aggregate(Vec<CompanionError>),

    /// The runner process crashed while an operation was in flight.
    #[error("crashed during operation: {description}")]
    CrashedDuringOperation {
        /// A description of the crash, suitable for attaching to a report.
        description: String,
    },
}

impl CompanionError {
    pub(crate) fn io(error: std::io::Error) -> Self {
        Self::Io { path: None, error }
    }

    pub(crate) fn io_at(path: impl Into<Utf8PathBuf>, error: std::io::Error) -> Self {
        Self::Io {
            path: Some(path.into()),
            error,
        }
    }

    /// Collapses a list of errors: zero becomes `Ok`, one is returned as-is,
    /// more become [`CompanionError::Aggregate`].
    pub fn aggregate(mut errors: Vec<CompanionError>) -> Result<(), CompanionError> {
        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(CompanionError::Aggregate(errors)),
        }
    }
}

impl From<std::io::Error> for CompanionError {
    fn from(error: std::io::Error) -> Self {
        Self::io(error)
    }
}

fn display_path(path: &Option<Utf8PathBuf>) -> String {
    match path {
        Some(path) => format!(" at `{path}`"),
        None => String::new(),
    }
}

fn join_errors(errors: &[CompanionError]) -> String {
    let strs: Vec<String> = errors.iter().map(|e| e.to_string()).collect();
    strs.join(", ")
}

/// An error produced by the delta-update session manager.
#[derive(Clone, Debug, Eq, PartialEq, Error)]
pub enum SessionError {
    /// No session with the given identifier exists.
    #[error("no session with identifier `{0}`")]
    UnknownSession(SessionUuid),

    /// A session lookup without an identifier found more than one candidate.
    #[error("{0} sessions are active; an identifier is required")]
    AmbiguousSession(usize),

    /// No session is active at all.
    #[error("no sessions are active")]
    NoSessions,

    /// The manager is at its configured session capacity.
    #[error("session capacity of {capacity} exceeded")]
    CapacityExceeded {
        /// The configured bound.
        capacity: usize,
    },

    /// The session is terminal and cannot be polled again.
    #[error("session `{0}` has already terminated")]
    SessionTerminated(SessionUuid),
}

/// An error at the byte-transport layer of a channel.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The underlying stream failed.
    #[error("transport I/O failed")]
    Io(#[source] std::io::Error),

    /// The peer closed the transport.
    #[error("transport closed by peer")]
    Closed,

    /// A frame exceeded the configured maximum size.
    #[error("frame of {size} bytes exceeds the {limit}-byte limit")]
    FrameTooLarge {
        /// The declared frame size.
        size: usize,
        /// The configured limit.
        limit: usize,
    },

    /// The multiplexer task is no longer running.
    #[error("channel multiplexer has shut down")]
    MultiplexerGone,
}

/// A daemon protocol error during or after the version exchange.
#[derive(Clone, Debug, Eq, PartialEq, Error)]
pub enum ProtocolError {
    /// The daemon's protocol version is below the accepted minimum.
    #[error(
        "daemon protocol version {daemon_version} is below the accepted minimum {minimum}"
    )]
    IncompatibleDaemon {
        /// The version the daemon reported.
        daemon_version: u32,
        /// The minimum the client accepts.
        minimum: u32,
    },

    /// No version packet arrived within the handshake timeout.
    #[error("no version packet was received within {}ms", .0.as_millis())]
    HandshakeTimeout(Duration),

    /// A message could not be decoded.
    #[error("malformed protocol message: {0}")]
    MalformedMessage(String),

    /// A reply arrived for an unknown correlation identifier.
    #[error("reply for unknown correlation identifier {0}")]
    UnknownCorrelation(u32),

    /// A request was made against a channel that is not ready.
    #[error("channel is {state}, not ready")]
    ChannelNotReady {
        /// The observed channel state.
        state: String,
    },
}

/// An error spawning or terminating a process.
#[derive(Debug, Error)]
pub enum ProcessError {
    /// The process could not be spawned.
    #[error("failed to spawn `{launch_path}`")]
    SpawnFailed {
        /// The binary that failed to launch.
        launch_path: Utf8PathBuf,
        /// The underlying error.
        #[source]
        error: std::io::Error,
    },

    /// A signal could not be delivered.
    #[error("failed to send signal {signal} to pid {pid}")]
    SignalFailed {
        /// The target pid.
        pid: u32,
        /// The signal number.
        signal: i32,
        /// The underlying errno description.
        #[source]
        error: std::io::Error,
    },

    /// The process did not die within the termination deadline.
    #[error("pid {pid} did not exit within {}ms of {signal}", .deadline.as_millis())]
    TerminateTimeout {
        /// The target pid.
        pid: u32,
        /// The signal that was sent.
        signal: i32,
        /// The deadline that elapsed.
        deadline: Duration,
    },

    /// The process no longer exists.
    #[error("no process with pid {0}")]
    NoSuchProcess(u32),
}

/// An error in the video pipeline.
#[derive(Debug, Error)]
pub enum VideoError {
    /// The frame's pixel format is not supported by the encoder.
    #[error("pixel format {format} is not supported by the {encoding} encoder")]
    UnsupportedPixelFormat {
        /// The frame's format.
        format: String,
        /// The encoder that rejected it.
        encoding: String,
    },

    /// The compression session failed.
    #[error("compression session failed: {0}")]
    CompressionFailed(String),

    /// The stream is already running or already stopped.
    #[error("video stream is {0}")]
    InvalidStreamState(&'static str),

    /// The container writer was used after finalize.
    #[error("MP4 writer has already been finalized")]
    WriterFinalized,

    /// The container writer received a sample without parameter sets.
    #[error("no H.264 parameter sets are available for the MP4 track")]
    MissingParameterSets,
}

/// An error parsing or watching crash logs.
#[derive(Debug, Error)]
pub enum CrashLogError {
    /// Neither parser understood the report.
    #[error("crash report could not be parsed: {0}")]
    ParseFailed(String),

    /// A required field was absent from the report.
    #[error("crash report is missing the `{0}` field")]
    MissingField(&'static str),

    /// The directory watcher failed.
    #[error("crash directory watch failed: {0}")]
    WatchFailed(String),
}

/// An error preparing a test bundle for execution.
#[derive(Debug, Error)]
pub enum PrepareError {
    /// The test bundle does not exist or is not a bundle.
    #[error("test bundle not found at `{0}`")]
    MissingTestBundle(Utf8PathBuf),

    /// The host application for an app test could not be located.
    #[error("host application not found at `{0}`")]
    MissingHostApplication(Utf8PathBuf),

    /// The bundle's code signature does not satisfy the target's policy.
    #[error("code signature of `{path}` rejected: {reason}")]
    SignatureRejected {
        /// The bundle whose signature was checked.
        path: Utf8PathBuf,
        /// Why the signature was rejected.
        reason: String,
    },

    /// The shim library directory could not be located.
    #[error("test shim directory not found at `{0}`")]
    MissingShimDirectory(Utf8PathBuf),
}

/// An error in target lifecycle management or capability dispatch.
#[derive(Clone, Debug, Eq, PartialEq, Error)]
pub enum TargetLifecycleError {
    /// A state transition outside the legal set was requested or observed.
    #[error("illegal target state transition from {from} to {to}")]
    IllegalTransition {
        /// The state the target was in.
        from: TargetState,
        /// The state that was requested.
        to: TargetState,
    },

    /// The target does not advertise the requested capability.
    #[error("target `{udid}` does not support the {capability:?} capability")]
    UnsupportedCapability {
        /// The target's udid.
        udid: String,
        /// The capability that was requested.
        capability: TargetCapability,
    },

    /// The command requires a booted target.
    #[error("target `{udid}` is {state}, not booted")]
    NotBooted {
        /// The target's udid.
        udid: String,
        /// The state the target is actually in.
        state: TargetState,
    },
}

// Copyright (c) The ios-companion Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Capability contracts.
//!
//! Each trait is the abstract surface one command family presents against
//! a specific target. Host bindings implement them; the core and the
//! outer process consume them through the forwarder. Every operation
//! returns a [`Deferred`] so that callers can await with deadlines, chain,
//! and cancel uniformly.

use crate::{
    consumer::DataConsumer,
    fut::Deferred,
    hid::HidEvent,
    process::{LaunchedProcess, ProcessSpawnConfig},
    session::{Continuation, TraceConfig, TraceOperation},
    video::EncoderConfig,
    xctest::{TestLaunchConfiguration, XctestSessionOperation},
};
use bytes::Bytes;
use camino::Utf8PathBuf;
use companion_metadata::CrashLogInfo;
use std::sync::Arc;

/// An application installed on a target.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct InstalledApplication {
    /// The bundle identifier.
    pub bundle_id: String,
    /// The display name.
    pub name: String,
    /// Where the bundle lives on the target.
    pub path: Utf8PathBuf,
    /// True if the application is currently running.
    pub running: bool,
}

/// A process visible on the target.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RunningProcess {
    /// The process identifier.
    pub pid: u32,
    /// The process name.
    pub name: String,
}

/// Boot and shutdown.
pub trait LifecycleCommands: Send + Sync + 'static {
    /// Boots the target, resolving once it reaches the booted state.
    fn boot(&self) -> Deferred<()>;

    /// Shuts the target down, resolving once it reaches shutdown.
    fn shutdown(&self) -> Deferred<()>;
}

/// Application install and inventory.
pub trait ApplicationCommands: Send + Sync + 'static {
    /// Installs an application bundle from the host filesystem.
    fn install(&self, path: Utf8PathBuf) -> Deferred<InstalledApplication>;

    /// Uninstalls by bundle identifier.
    fn uninstall(&self, bundle_id: String) -> Deferred<()>;

    /// Lists installed applications.
    fn list_applications(&self) -> Deferred<Vec<InstalledApplication>>;

    /// Launches an installed application, returning the process.
    fn launch(&self, bundle_id: String) -> Deferred<LaunchedProcess>;
}

/// Raw process spawning.
pub trait ProcessSpawnCommands: Send + Sync + 'static {
    /// Spawns a binary on the target.
    fn spawn(&self, config: ProcessSpawnConfig) -> Deferred<LaunchedProcess>;

    /// Lists processes running on the target.
    fn list_running_processes(&self) -> Deferred<Vec<RunningProcess>>;

    /// Terminates a process by pid.
    fn terminate_process(&self, pid: u32) -> Deferred<()>;
}

/// An ongoing log tail.
#[derive(Clone)]
pub struct LogTailHandle {
    completed: Deferred<()>,
}

impl LogTailHandle {
    /// Wraps a completion future as a tail handle.
    pub fn new(completed: Deferred<()>) -> Self {
        Self { completed }
    }
}

impl Continuation for LogTailHandle {
    fn completed(&self) -> Deferred<()> {
        self.completed.clone()
    }
}

/// Log tailing.
pub trait LogTailCommands: Send + Sync + 'static {
    /// Tails the target's log with the given tool arguments, writing
    /// output through the consumer until the handle is cancelled.
    fn tail_log(
        &self,
        arguments: Vec<String>,
        sink: Arc<dyn DataConsumer>,
    ) -> Deferred<LogTailHandle>;
}

/// Screenshots.
pub trait ScreenshotCommands: Send + Sync + 'static {
    /// Captures one frame as encoded image bytes.
    fn take_screenshot(&self) -> Deferred<Bytes>;
}

/// Video streaming and recording.
pub trait VideoCommands: Send + Sync + 'static {
    /// Starts an encoded stream into the consumer; the returned
    /// continuation's future resolves when the stream ends.
    fn start_stream(
        &self,
        config: EncoderConfig,
        sink: Arc<dyn DataConsumer>,
    ) -> Deferred<crate::video::VideoStream>;

    /// Starts an MP4 recording at the given path.
    fn start_recording(
        &self,
        config: EncoderConfig,
        output: Utf8PathBuf,
    ) -> Deferred<Arc<crate::video::VideoRecorder>>;
}

impl std::fmt::Debug for dyn VideoCommands {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("dyn VideoCommands").finish_non_exhaustive()
    }
}

/// XCTest execution.
pub trait XctestCommands: Send + Sync + 'static {
    /// Runs a test plan, returning the session operation once the plan is
    /// executing.
    fn run_tests(&self, launch: TestLaunchConfiguration) -> Deferred<XctestSessionOperation>;

    /// Lists the tests in a bundle without running them.
    fn list_tests(&self, bundle_path: Utf8PathBuf) -> Deferred<Vec<String>>;
}

/// Crash-log queries against the store.
pub trait CrashLogCommands: Send + Sync + 'static {
    /// All stored crashes matching the predicate.
    fn crashes(&self, predicate: crate::crashlog::CrashLogPredicate) -> Deferred<Vec<CrashLogInfo>>;

    /// The first stored or future crash matching the predicate.
    fn next_crash(&self, predicate: crate::crashlog::CrashLogPredicate) -> Deferred<CrashLogInfo>;

    /// Removes matching crashes, returning what was removed.
    fn prune_crashes(
        &self,
        predicate: crate::crashlog::CrashLogPredicate,
    ) -> Deferred<Vec<CrashLogInfo>>;
}

/// HID event synthesis.
pub trait HidCommands: Send + Sync + 'static {
    /// Sends one event to the target's input endpoint.
    fn send_event(&self, event: HidEvent) -> Deferred<()>;
}

impl std::fmt::Debug for dyn HidCommands {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("dyn HidCommands").finish_non_exhaustive()
    }
}

/// URL opening.
pub trait OpenUrlCommands: Send + Sync + 'static {
    /// Opens a URL on the target.
    fn open_url(&self, url: String) -> Deferred<()>;
}

/// Instruments-style trace recording.
pub trait InstrumentsCommands: Send + Sync + 'static {
    /// Starts a trace, returning the operation for session adaptation.
    fn start_trace(&self, config: TraceConfig) -> Deferred<TraceOperation>;
}

/// Diagnostic file access.
pub trait DiagnosticCommands: Send + Sync + 'static {
    /// Reads a diagnostic file from the target.
    fn diagnostic_file(&self, path: Utf8PathBuf) -> Deferred<Bytes>;
}

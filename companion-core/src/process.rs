// Copyright (c) The ios-companion Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Process spawning and termination.
//!
//! A [`ProcessSpawnConfig`] describes what to launch and where its IO goes;
//! [`spawn`] produces a [`LaunchedProcess`] carrying the pid, an exit future
//! with the decomposed wait status, and a deadline-bounded terminate.
//! [`TerminationStrategy`] implements the configurable kill policy with
//! SIGKILL escalation.

use crate::{
    consumer::DataConsumer,
    errors::{CompanionError, ProcessError},
    fut::Deferred,
};
use bytes::Bytes;
use camino::Utf8PathBuf;
use companion_metadata::ProcessExitSummary;
use std::{collections::BTreeMap, process::Stdio, sync::Arc, time::Duration};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    sync::mpsc,
};
use tracing::{debug, warn};

/// The signal number for SIGTERM. 15 on every platform; defined here so the
/// policy types stay platform-independent.
pub const SIGTERM: i32 = 15;

/// The signal number for SIGKILL. 9 on every platform.
pub const SIGKILL: i32 = 9;

/// Where a spawned process's stdin comes from.
pub enum InputSource {
    /// `/dev/null`.
    DevNull,
    /// Read from a file.
    FilePath(Utf8PathBuf),
    /// Inherit the companion's stdin.
    AutoDefault,
    /// Fed from a channel of byte chunks; closing the channel closes stdin.
    Stream(mpsc::UnboundedReceiver<Bytes>),
}

/// Where a spawned process's stdout or stderr goes.
pub enum OutputSink {
    /// `/dev/null`.
    DevNull,
    /// Append to a file.
    FilePath(Utf8PathBuf),
    /// Inherit the companion's own stream.
    AutoDefault,
    /// Pumped into a consumer chunk by chunk.
    Consumer(Arc<dyn DataConsumer>),
}

/// IO wiring for a spawned process.
pub struct ProcessIO {
    /// The stdin source.
    pub stdin: InputSource,
    /// The stdout sink.
    pub stdout: OutputSink,
    /// The stderr sink.
    pub stderr: OutputSink,
}

impl ProcessIO {
    /// All streams to `/dev/null`.
    pub fn null() -> Self {
        Self {
            stdin: InputSource::DevNull,
            stdout: OutputSink::DevNull,
            stderr: OutputSink::DevNull,
        }
    }

    /// Stdout and stderr into the given consumers, stdin from `/dev/null`.
    pub fn consumers(stdout: Arc<dyn DataConsumer>, stderr: Arc<dyn DataConsumer>) -> Self {
        Self {
            stdin: InputSource::DevNull,
            stdout: OutputSink::Consumer(stdout),
            stderr: OutputSink::Consumer(stderr),
        }
    }
}

/// How the target should spawn the binary.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum SpawnMode {
    /// Whatever the target considers standard.
    #[default]
    Default,
    /// Direct posix_spawn.
    PosixSpawn,
    /// Via the target's launchd.
    Launchd,
}

/// A description of a process to spawn.
pub struct ProcessSpawnConfig {
    /// The binary to launch.
    pub launch_path: Utf8PathBuf,
    /// Arguments, excluding argv[0].
    pub arguments: Vec<String>,
    /// Environment variables set for the process.
    pub environment: BTreeMap<String, String>,
    /// IO wiring.
    pub io: ProcessIO,
    /// The spawn mechanism.
    pub mode: SpawnMode,
}

impl ProcessSpawnConfig {
    /// A config with null IO and default spawn mode.
    pub fn new(launch_path: impl Into<Utf8PathBuf>, arguments: Vec<String>) -> Self {
        Self {
            launch_path: launch_path.into(),
            arguments,
            environment: BTreeMap::new(),
            io: ProcessIO::null(),
            mode: SpawnMode::Default,
        }
    }
}

struct ProcessInner {
    pid: u32,
    exit: Deferred<ProcessExitSummary>,
}

/// A running (or exited) process launched by the companion.
#[derive(Clone)]
pub struct LaunchedProcess {
    inner: Arc<ProcessInner>,
}

impl LaunchedProcess {
    /// The process identifier.
    pub fn pid(&self) -> u32 {
        self.inner.pid
    }

    /// Resolves with the decomposed exit status when the process exits.
    pub fn exit(&self) -> Deferred<ProcessExitSummary> {
        self.inner.exit.clone()
    }

    /// Sends SIGKILL and waits up to `deadline` for the exit status.
    pub async fn terminate(&self, deadline: Duration) -> Result<ProcessExitSummary, CompanionError> {
        if let Some(result) = self.inner.exit.peek() {
            return result.map_err(|_| {
                ProcessError::NoSuchProcess(self.inner.pid).into()
            });
        }
        send_signal(self.inner.pid, SIGKILL)?;
        self.inner
            .exit
            .value_with_deadline(deadline)
            .await
            .map_err(|_| {
                ProcessError::TerminateTimeout {
                    pid: self.inner.pid,
                    signal: SIGKILL,
                    deadline,
                }
                .into()
            })
    }
}

impl std::fmt::Debug for LaunchedProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LaunchedProcess")
            .field("pid", &self.inner.pid)
            .field("exited", &self.inner.exit.is_done())
            .finish()
    }
}

/// Spawns a process per the config and wires its IO.
pub async fn spawn(config: ProcessSpawnConfig) -> Result<LaunchedProcess, CompanionError> {
    let ProcessSpawnConfig {
        launch_path,
        arguments,
        environment,
        io,
        mode: _,
    } = config;

    let mut command = tokio::process::Command::new(launch_path.as_str());
    command.args(&arguments);
    for (key, value) in &environment {
        command.env(key, value);
    }
    command.kill_on_drop(false);

    let stdin_stream = match io.stdin {
        InputSource::DevNull => {
            command.stdin(Stdio::null());
            None
        }
        InputSource::AutoDefault => {
            command.stdin(Stdio::inherit());
            None
        }
        InputSource::FilePath(path) => {
            let file = std::fs::File::open(&path)
                .map_err(|error| CompanionError::io_at(path, error))?;
            command.stdin(Stdio::from(file));
            None
        }
        InputSource::Stream(rx) => {
            command.stdin(Stdio::piped());
            Some(rx)
        }
    };
    let stdout_sink = configure_output(&mut command, io.stdout, true)?;
    let stderr_sink = configure_output(&mut command, io.stderr, false)?;

    let mut child = command.spawn().map_err(|error| ProcessError::SpawnFailed {
        launch_path: launch_path.clone(),
        error,
    })?;
    let pid = child.id().ok_or_else(|| {
        CompanionError::from(ProcessError::SpawnFailed {
            launch_path: launch_path.clone(),
            error: std::io::Error::other("process exited before its pid was read"),
        })
    })?;
    debug!(%launch_path, pid, "spawned process");

    if let (Some(mut rx), Some(mut stdin)) = (stdin_stream, child.stdin.take()) {
        tokio::spawn(async move {
            while let Some(chunk) = rx.recv().await {
                if stdin.write_all(&chunk).await.is_err() {
                    break;
                }
            }
            // Dropping stdin closes the pipe.
        });
    }
    if let (Some(sink), Some(stdout)) = (stdout_sink, child.stdout.take()) {
        tokio::spawn(pump_output(stdout, sink));
    }
    if let (Some(sink), Some(stderr)) = (stderr_sink, child.stderr.take()) {
        tokio::spawn(pump_output(stderr, sink));
    }

    let (resolver, exit) = Deferred::new();
    tokio::spawn(async move {
        match child.wait().await {
            Ok(status) => {
                resolver.resolve(decompose_exit_status(status));
            }
            Err(error) => {
                resolver.reject(CompanionError::io(error));
            }
        }
    });

    Ok(LaunchedProcess {
        inner: Arc::new(ProcessInner { pid, exit }),
    })
}

fn configure_output(
    command: &mut tokio::process::Command,
    sink: OutputSink,
    is_stdout: bool,
) -> Result<Option<Arc<dyn DataConsumer>>, CompanionError> {
    let apply = |command: &mut tokio::process::Command, stdio: Stdio| {
        if is_stdout {
            command.stdout(stdio);
        } else {
            command.stderr(stdio);
        }
    };
    match sink {
        OutputSink::DevNull => {
            apply(command, Stdio::null());
            Ok(None)
        }
        OutputSink::AutoDefault => {
            apply(command, Stdio::inherit());
            Ok(None)
        }
        OutputSink::FilePath(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .map_err(|error| CompanionError::io_at(path, error))?;
            apply(command, Stdio::from(file));
            Ok(None)
        }
        OutputSink::Consumer(consumer) => {
            apply(command, Stdio::piped());
            Ok(Some(consumer))
        }
    }
}

async fn pump_output(
    mut source: impl tokio::io::AsyncRead + Unpin + Send + 'static,
    sink: Arc<dyn DataConsumer>,
) {
    let mut buf = [0u8; 8192];
    loop {
        match source.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                if sink.consume(Bytes::copy_from_slice(&buf[..n])).is_err() {
                    break;
                }
            }
            Err(err) => {
                warn!("process output pump failed: {err}");
                break;
            }
        }
    }
    let _ = sink.end_of_file();
}

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        fn decompose_exit_status(status: std::process::ExitStatus) -> ProcessExitSummary {
            use std::os::unix::process::ExitStatusExt;
            match status.signal() {
                Some(signal) => ProcessExitSummary::signalled(signal, status.core_dumped()),
                None => ProcessExitSummary::exited(status.code().unwrap_or(-1)),
            }
        }

        fn send_signal(pid: u32, signal: i32) -> Result<(), CompanionError> {
            use nix::sys::signal::{Signal, kill};
            use nix::unistd::Pid;
            let sig = Signal::try_from(signal).map_err(|_| {
                CompanionError::InvalidArgument(format!("unknown signal {signal}"))
            })?;
            kill(Pid::from_raw(pid as i32), sig).map_err(|errno| {
                ProcessError::SignalFailed {
                    pid,
                    signal,
                    error: std::io::Error::from_raw_os_error(errno as i32),
                }
                .into()
            })
        }

        fn process_exists(pid: u32) -> bool {
            use nix::sys::signal::kill;
            use nix::unistd::Pid;
            kill(Pid::from_raw(pid as i32), None).is_ok()
        }
    } else {
        fn decompose_exit_status(status: std::process::ExitStatus) -> ProcessExitSummary {
            ProcessExitSummary::exited(status.code().unwrap_or(-1))
        }

        fn send_signal(_pid: u32, _signal: i32) -> Result<(), CompanionError> {
            Err(CompanionError::Precondition(
                "signal delivery is only supported on unix hosts".to_owned(),
            ))
        }

        fn process_exists(_pid: u32) -> bool {
            false
        }
    }
}

/// Options modifying how a [`TerminationStrategy`] behaves.
#[derive(Clone, Copy, Debug, Default)]
pub struct TerminationOptions {
    /// Check that the process exists before signalling; if it does not,
    /// terminate succeeds immediately.
    pub check_exists_before_signal: bool,
    /// Wait for the process to die before returning.
    pub wait_for_death: bool,
    /// If the requested signal does not kill the process within the grace
    /// period, send SIGKILL.
    pub escalate_to_sigkill: bool,
}

/// A configured policy for terminating processes by pid.
#[derive(Clone, Copy, Debug)]
pub struct TerminationStrategy {
    signo: i32,
    options: TerminationOptions,
    grace_period: Duration,
}

impl TerminationStrategy {
    /// A strategy sending the given signal with the given options.
    pub fn new(signo: i32, options: TerminationOptions, grace_period: Duration) -> Self {
        Self {
            signo,
            options,
            grace_period,
        }
    }

    /// The default policy: SIGKILL after checking existence, waiting for
    /// death.
    pub fn default_strategy() -> Self {
        Self::new(
            SIGKILL,
            TerminationOptions {
                check_exists_before_signal: true,
                wait_for_death: true,
                escalate_to_sigkill: false,
            },
            Duration::from_secs(10),
        )
    }

    /// A graceful policy: SIGTERM, escalating to SIGKILL after the grace
    /// period.
    pub fn sigterm_with_escalation(grace_period: Duration) -> Self {
        Self::new(
            SIGTERM,
            TerminationOptions {
                check_exists_before_signal: true,
                wait_for_death: true,
                escalate_to_sigkill: true,
            },
            grace_period,
        )
    }

    /// Terminates the process with the configured policy.
    pub async fn terminate(&self, pid: u32) -> Result<(), CompanionError> {
        if self.options.check_exists_before_signal && !process_exists(pid) {
            debug!(pid, "process already gone before signalling");
            return Ok(());
        }
        send_signal(pid, self.signo)?;
        if !self.options.wait_for_death {
            return Ok(());
        }
        if self.wait_for_exit(pid, self.grace_period).await {
            return Ok(());
        }
        if self.options.escalate_to_sigkill && self.signo != SIGKILL {
            warn!(pid, signal = self.signo, "escalating to SIGKILL");
            send_signal(pid, SIGKILL)?;
            if self.wait_for_exit(pid, self.grace_period).await {
                return Ok(());
            }
        }
        Err(ProcessError::TerminateTimeout {
            pid,
            signal: self.signo,
            deadline: self.grace_period,
        }
        .into())
    }

    async fn wait_for_exit(&self, pid: u32, deadline: Duration) -> bool {
        let poll_interval = Duration::from_millis(20);
        let deadline_at = tokio::time::Instant::now() + deadline;
        loop {
            if !process_exists(pid) {
                return true;
            }
            if tokio::time::Instant::now() >= deadline_at {
                return false;
            }
            tokio::time::sleep(poll_interval).await;
        }
    }
}

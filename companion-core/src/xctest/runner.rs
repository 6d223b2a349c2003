// Copyright (c) The ios-companion Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Test-plan execution.
//!
//! Drives the full pipeline against a prepared run: transport handshake,
//! channel setup, plan execution with event translation into reporter
//! calls, and teardown with opportunistic artifact collection.
//!
//! Failure semantics: a transport error fails the in-flight case and ends
//! the plan abnormally; a runner-process exit mid-plan is materialised as
//! a crash event on the running case before the plan is reported ended;
//! plan-level timeouts kill the runner.

use crate::{
    errors::{CompanionError, FutureError},
    logger::Logger,
    process::LaunchedProcess,
    xctest::{
        bundle::PreparedTestRun,
        channel::{ChannelKind, ChannelMultiplexer, DtxChannel, RpcMessage},
        reporter::{
            CaseStatus, SuiteSummary, TestRunEvent, TestRunEventKind, XCTestReporter,
        },
        transport::{ProtocolVersionRange, TransportStream},
    },
};
use camino::Utf8PathBuf;
use serde_json::Value;
use std::{sync::Arc, time::Duration};
use tracing::{debug, warn};

/// The method asking the daemon to begin executing the plan.
const METHOD_BEGIN_TEST_PLAN: &str = "beginTestPlan";
/// The method acknowledging the end of the plan.
const METHOD_END_TEST_PLAN: &str = "endTestPlan";

/// Execution knobs for one run.
#[derive(Clone, Debug)]
pub struct TestRunStrategy {
    /// The accepted daemon protocol versions.
    pub version_range: ProtocolVersionRange,
    /// Feature tags announced in the handshake.
    pub capabilities: Vec<String>,
    /// How long to wait for the daemon's version packet.
    pub handshake_timeout: Duration,
    /// A plan-level deadline; the runner is killed when it elapses.
    pub plan_timeout: Option<Duration>,
}

impl TestRunStrategy {
    /// A strategy for the given version range with default timeouts.
    pub fn new(version_range: ProtocolVersionRange) -> Self {
        Self {
            version_range,
            capabilities: vec!["activities".to_owned(), "coverage".to_owned()],
            handshake_timeout: Duration::from_secs(30),
            plan_timeout: None,
        }
    }
}

/// What a completed run produced.
#[derive(Clone, Debug)]
pub struct TestRunOutcome {
    /// The result bundle, when requested and present.
    pub result_bundle_path: Option<Utf8PathBuf>,
    /// The coverage profile, when requested and present.
    pub coverage_path: Option<Utf8PathBuf>,
    /// True when the plan ended abnormally.
    pub abnormal: bool,
    /// The error that ended the run, when abnormal.
    pub error: Option<String>,
}

/// Runs a prepared test plan over the given transport.
///
/// `runner` is the already-launched test-runner process; its exit future
/// doubles as the crash detector.
pub async fn run_test_plan<T: TransportStream>(
    prepared: &PreparedTestRun,
    runner: LaunchedProcess,
    transport_stream: T,
    strategy: &TestRunStrategy,
    reporter: Arc<dyn XCTestReporter>,
    logger: Logger,
) -> Result<TestRunOutcome, CompanionError> {
    let logger = logger.named("test-run");

    // Phase 3: transport handshake.
    let mux = ChannelMultiplexer::connect(
        transport_stream,
        strategy.version_range,
        strategy.capabilities.clone(),
        strategy.handshake_timeout,
        logger.clone(),
    )
    .await?;
    logger.info(format!(
        "daemon handshake complete at protocol version {}",
        mux.daemon_version()
    ));

    // Phase 4: channel setup, bundle first.
    let bundle_channel = mux.open_channel(ChannelKind::Bundle).await?;
    let daemon_channel = mux.open_channel(ChannelKind::Daemon).await?;

    // Phase 5: plan execution.
    let execution = execute_plan(
        &bundle_channel,
        &daemon_channel,
        &runner,
        strategy.plan_timeout,
        reporter.as_ref(),
        &logger,
    )
    .await;

    // Phase 6: teardown in reverse open order, runner, artifacts.
    mux.shutdown().await;
    if runner.exit().peek().is_none() {
        debug!(pid = runner.pid(), "terminating surviving runner");
        let _ = runner.terminate(Duration::from_secs(10)).await;
    }
    let result_bundle_path = collect_artifact(prepared.result_bundle_path.as_ref(), &logger);
    let coverage_path = collect_artifact(prepared.coverage_path.as_ref(), &logger);

    if let Err(err) = reporter.finish() {
        warn!("reporter finalization failed: {err}");
    }

    match execution {
        Ok(()) => Ok(TestRunOutcome {
            result_bundle_path,
            coverage_path,
            abnormal: false,
            error: None,
        }),
        Err(err) => Ok(TestRunOutcome {
            result_bundle_path,
            coverage_path,
            abnormal: true,
            error: Some(err.to_string()),
        }),
    }
}

/// Artifact collection is opportunistic: absence is logged, never fatal.
fn collect_artifact(
    expected: Option<&Utf8PathBuf>,
    logger: &Logger,
) -> Option<Utf8PathBuf> {
    let path = expected?;
    if path.exists() {
        Some(path.clone())
    } else {
        logger.info(format!("expected artifact `{path}` was not produced"));
        None
    }
}

async fn execute_plan(
    bundle_channel: &DtxChannel,
    daemon_channel: &DtxChannel,
    runner: &LaunchedProcess,
    plan_timeout: Option<Duration>,
    reporter: &dyn XCTestReporter,
    logger: &Logger,
) -> Result<(), CompanionError> {
    daemon_channel
        .call(METHOD_BEGIN_TEST_PLAN, Value::Null)
        .await
        .map_err(plan_error)?;
    reporter.handle_event(&TestRunEvent::now(TestRunEventKind::PlanStarted));

    let runner_exit = runner.exit();
    let deadline = plan_timeout.unwrap_or(Duration::MAX);
    let plan_sleep = tokio::time::sleep(deadline);
    tokio::pin!(plan_sleep);

    // The case currently running, for crash and transport-failure
    // attribution.
    let mut current_case: Option<(String, String)> = None;
    let mut root_suite: Option<String> = None;

    let failure: Option<CompanionError> = loop {
        tokio::select! {
            event = bundle_channel.next_event() => {
                match event {
                    Some(message) => {
                        if let Some(done) = handle_message(
                            &message, reporter, &mut current_case, &mut root_suite, logger,
                        ) {
                            if done {
                                break None;
                            }
                        }
                    }
                    None => {
                        break Some(transport_failure(reporter, &mut current_case));
                    }
                }
            }
            event = daemon_channel.next_event() => {
                match event {
                    Some(message) => {
                        if let Some(done) = handle_message(
                            &message, reporter, &mut current_case, &mut root_suite, logger,
                        ) {
                            if done {
                                break None;
                            }
                        }
                    }
                    None => {
                        break Some(transport_failure(reporter, &mut current_case));
                    }
                }
            }
            exit = runner_exit.value() => {
                let description = match exit {
                    Ok(summary) => format!("test runner exited mid-plan: {summary}"),
                    Err(err) => format!("test runner lost mid-plan: {err}"),
                };
                reporter.handle_event(&TestRunEvent::now(
                    TestRunEventKind::RunnerCrashed { description: description.clone() },
                ));
                break Some(CompanionError::CrashedDuringOperation { description });
            }
            _ = &mut plan_sleep => {
                logger.error("plan timeout elapsed; terminating runner");
                let _ = runner.terminate(Duration::from_secs(5)).await;
                break Some(CompanionError::Precondition(format!(
                    "test plan timed out after {}s",
                    deadline.as_secs()
                )));
            }
        }
    };

    match failure {
        None => {
            // Acknowledge the end of the plan; failure to ack degrades to
            // a logged warning since all results are already in hand.
            if let Err(err) = daemon_channel.call(METHOD_END_TEST_PLAN, Value::Null).await {
                logger.warn(format!("end-of-plan acknowledgement failed: {err}"));
            }
            reporter.handle_event(&TestRunEvent::now(TestRunEventKind::PlanEnded {
                abnormal: false,
            }));
            Ok(())
        }
        Some(err) => {
            reporter.handle_event(&TestRunEvent::now(TestRunEventKind::PlanEnded {
                abnormal: true,
            }));
            Err(err)
        }
    }
}

fn plan_error(err: FutureError) -> CompanionError {
    CompanionError::Precondition(format!("test plan could not begin: {err}"))
}

/// Fails the in-flight case with a transport error and returns the error
/// that ends the plan.
fn transport_failure(
    reporter: &dyn XCTestReporter,
    current_case: &mut Option<(String, String)>,
) -> CompanionError {
    if let Some((class_name, method_name)) = current_case.take() {
        reporter.handle_event(&TestRunEvent::now(TestRunEventKind::CaseIssue {
            class_name: class_name.clone(),
            method_name: method_name.clone(),
            message: "transport to the test daemon failed".to_owned(),
            file: None,
            line: None,
        }));
        reporter.handle_event(&TestRunEvent::now(TestRunEventKind::CaseFinished {
            class_name,
            method_name,
            status: CaseStatus::Failed,
            duration: Duration::ZERO,
        }));
    }
    CompanionError::Transport(crate::errors::TransportError::Closed)
}

/// Translates one channel message into reporter events.
///
/// Returns `Some(true)` when the root suite finished and the plan is
/// complete, `Some(false)` for any other handled message, `None` for
/// messages that are not test events.
fn handle_message(
    message: &RpcMessage,
    reporter: &dyn XCTestReporter,
    current_case: &mut Option<(String, String)>,
    root_suite: &mut Option<String>,
    logger: &Logger,
) -> Option<bool> {
    let payload = &message.payload;
    let kind = match message.method.as_str() {
        "suiteDidStart" => {
            let name = string_field(payload, "name")?;
            if root_suite.is_none() {
                *root_suite = Some(name.clone());
            }
            TestRunEventKind::SuiteStarted { name }
        }
        "caseDidStart" => {
            let class_name = string_field(payload, "className")?;
            let method_name = string_field(payload, "methodName")?;
            *current_case = Some((class_name.clone(), method_name.clone()));
            TestRunEventKind::CaseStarted {
                bundle_name: string_field(payload, "bundleName").unwrap_or_default(),
                class_name,
                method_name,
            }
        }
        "caseDidRecordIssue" => TestRunEventKind::CaseIssue {
            class_name: string_field(payload, "className")?,
            method_name: string_field(payload, "methodName")?,
            message: string_field(payload, "message").unwrap_or_default(),
            file: string_field(payload, "file"),
            line: payload.get("line").and_then(Value::as_u64),
        },
        "caseDidFinish" => {
            *current_case = None;
            TestRunEventKind::CaseFinished {
                class_name: string_field(payload, "className")?,
                method_name: string_field(payload, "methodName")?,
                status: match string_field(payload, "status").as_deref() {
                    Some("passed") => CaseStatus::Passed,
                    Some("skipped") => CaseStatus::Skipped,
                    _ => CaseStatus::Failed,
                },
                duration: duration_field(payload),
            }
        }
        "activityDidStart" => TestRunEventKind::ActivityStarted {
            class_name: string_field(payload, "className").unwrap_or_default(),
            method_name: string_field(payload, "methodName").unwrap_or_default(),
            title: string_field(payload, "title")?,
            uuid: string_field(payload, "uuid")?,
        },
        "activityDidRecordAttachment" => {
            let attachment = serde_json::from_value(payload.get("attachment")?.clone())
                .map_err(|err| {
                    logger.warn(format!("undecodable attachment: {err}"));
                })
                .ok()?;
            TestRunEventKind::ActivityAttachment {
                uuid: string_field(payload, "uuid")?,
                attachment,
            }
        }
        "activityDidFinish" => TestRunEventKind::ActivityFinished {
            uuid: string_field(payload, "uuid")?,
            duration: duration_field(payload),
        },
        "output" => TestRunEventKind::Output {
            line: string_field(payload, "line").unwrap_or_default(),
        },
        "suiteDidFinish" => {
            let name = string_field(payload, "name")?;
            let summary = SuiteSummary {
                run_count: payload.get("runCount").and_then(Value::as_u64).unwrap_or(0),
                failure_count: payload
                    .get("failureCount")
                    .and_then(Value::as_u64)
                    .unwrap_or(0),
                skip_count: payload
                    .get("skipCount")
                    .and_then(Value::as_u64)
                    .unwrap_or(0),
                total_duration: duration_field(payload),
            };
            let is_root = root_suite.as_deref() == Some(name.as_str());
            reporter.handle_event(&TestRunEvent::now(TestRunEventKind::SuiteFinished {
                name,
                summary,
            }));
            return Some(is_root);
        }
        "crashed" => TestRunEventKind::RunnerCrashed {
            description: string_field(payload, "description")
                .unwrap_or_else(|| "test runner crashed".to_owned()),
        },
        other => {
            debug!(method = other, "ignoring non-test message");
            return None;
        }
    };
    reporter.handle_event(&TestRunEvent::now(kind));
    Some(false)
}

fn string_field(payload: &Value, key: &str) -> Option<String> {
    payload.get(key).and_then(Value::as_str).map(str::to_owned)
}

fn duration_field(payload: &Value) -> Duration {
    payload
        .get("durationMs")
        .and_then(Value::as_u64)
        .map(Duration::from_millis)
        .unwrap_or(Duration::ZERO)
}

/// Convenience payload builders for the daemon side of the protocol; used
/// by target bindings and tests.
pub mod protocol {
    use serde_json::{Value, json};

    /// A `suiteDidStart` payload.
    pub fn suite_did_start(name: &str) -> Value {
        json!({ "name": name })
    }

    /// A `caseDidStart` payload.
    pub fn case_did_start(bundle: &str, class: &str, method: &str) -> Value {
        json!({ "bundleName": bundle, "className": class, "methodName": method })
    }

    /// A `caseDidFinish` payload.
    pub fn case_did_finish(class: &str, method: &str, status: &str, duration_ms: u64) -> Value {
        json!({
            "className": class,
            "methodName": method,
            "status": status,
            "durationMs": duration_ms,
        })
    }

    /// A `suiteDidFinish` payload.
    pub fn suite_did_finish(name: &str, run_count: u64, failure_count: u64) -> Value {
        json!({
            "name": name,
            "runCount": run_count,
            "failureCount": failure_count,
            "skipCount": 0,
            "durationMs": 0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        process::{ProcessSpawnConfig, spawn},
        xctest::{
            bundle::PreparedTestRun,
            channel::{RpcKind, RpcMessage},
            reporter::ConsumableReporter,
            transport::{DaemonHello, FramedTransport},
        },
    };
    use companion_metadata::TestRunState;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::collections::BTreeMap;

    #[derive(serde::Serialize, serde::Deserialize)]
    struct Envelope {
        channel: u32,
        message: RpcMessage,
    }

    /// A daemon that completes the handshake, accepts both channel opens,
    /// replies to plan calls and plays back a scripted event sequence.
    async fn scripted_daemon(
        stream: tokio::io::DuplexStream,
        events: Vec<(&'static str, Value)>,
    ) {
        let mut transport = FramedTransport::new(stream);
        let _caps = transport.recv_frame().await.expect("client hello");
        transport
            .send_frame(
                &serde_json::to_vec(&DaemonHello {
                    protocol_version: 29,
                })
                .expect("hello"),
            )
            .await
            .expect("send hello");

        let mut bundle_channel = 0u32;
        let mut pending_events = Some(events);
        loop {
            let frame = match transport.recv_frame().await {
                Ok(frame) => frame,
                Err(_) => break,
            };
            let envelope: Envelope = serde_json::from_slice(&frame).expect("envelope");
            match envelope.message.method.as_str() {
                "_channel.open" => {
                    if envelope.message.payload["kind"] == json!("bundle") {
                        bundle_channel = envelope.channel;
                    }
                }
                METHOD_BEGIN_TEST_PLAN => {
                    let reply = Envelope {
                        channel: envelope.channel,
                        message: RpcMessage {
                            identifier: envelope.message.identifier,
                            method: METHOD_BEGIN_TEST_PLAN.to_owned(),
                            payload: json!({"accepted": true}),
                            kind: RpcKind::Reply,
                        },
                    };
                    transport
                        .send_frame(&serde_json::to_vec(&reply).expect("reply"))
                        .await
                        .expect("send reply");
                    // Play the script on the bundle channel.
                    for (method, payload) in pending_events.take().unwrap_or_default() {
                        let event = Envelope {
                            channel: bundle_channel,
                            message: RpcMessage {
                                identifier: 0,
                                method: (*method).to_owned(),
                                payload,
                                kind: RpcKind::Event,
                            },
                        };
                        transport
                            .send_frame(&serde_json::to_vec(&event).expect("event"))
                            .await
                            .expect("send event");
                    }
                }
                METHOD_END_TEST_PLAN => {
                    let reply = Envelope {
                        channel: envelope.channel,
                        message: RpcMessage {
                            identifier: envelope.message.identifier,
                            method: METHOD_END_TEST_PLAN.to_owned(),
                            payload: Value::Null,
                            kind: RpcKind::Reply,
                        },
                    };
                    transport
                        .send_frame(&serde_json::to_vec(&reply).expect("reply"))
                        .await
                        .expect("send reply");
                }
                _ => {}
            }
        }
    }

    fn prepared_stub(dir: &camino::Utf8Path) -> PreparedTestRun {
        PreparedTestRun {
            working_directory: dir.to_owned(),
            bundle_path: dir.join("MyTests.xctest"),
            artifact_path: dir.join("test-configuration.json"),
            host_application: None,
            runner_environment: BTreeMap::new(),
            result_bundle_path: None,
            coverage_path: None,
        }
    }

    async fn short_lived_runner() -> LaunchedProcess {
        spawn(ProcessSpawnConfig::new(
            "/bin/sleep",
            vec!["30".to_owned()],
        ))
        .await
        .expect("spawn")
    }

    #[tokio::test]
    async fn filtered_run_reports_single_pass() {
        let dir = camino_tempfile::tempdir().expect("tempdir");
        let (client, server) = tokio::io::duplex(64 * 1024);
        tokio::spawn(scripted_daemon(
            server,
            vec![
                ("suiteDidStart", protocol::suite_did_start("MyTests")),
                (
                    "caseDidStart",
                    protocol::case_did_start("MyTests", "MyTests", "testA"),
                ),
                (
                    "caseDidFinish",
                    protocol::case_did_finish("MyTests", "testA", "passed", 120),
                ),
                (
                    "suiteDidFinish",
                    protocol::suite_did_finish("MyTests", 1, 0),
                ),
            ],
        ));

        let reporter = ConsumableReporter::new();
        let runner = short_lived_runner().await;
        let outcome = run_test_plan(
            &prepared_stub(dir.path()),
            runner.clone(),
            client,
            &TestRunStrategy::new(ProtocolVersionRange {
                minimum: 25,
                maximum: 29,
            }),
            reporter.clone(),
            Logger::null(),
        )
        .await
        .expect("run");

        assert!(!outcome.abnormal);
        let updates = reporter.consume_current_results();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].method_name.as_deref(), Some("testA"));
        assert!(updates[0].passed);
        assert_eq!(reporter.run_state(), TestRunState::TerminatedNormally);
        let log = reporter.consume_log_output();
        assert!(log.contains("suite MyTests started"));
        assert!(log.contains("1 run, 0 failed"));
        // Phase 6 killed the surviving runner.
        assert!(runner.exit().is_done());
    }

    #[tokio::test]
    async fn runner_exit_mid_plan_is_a_crash() {
        let dir = camino_tempfile::tempdir().expect("tempdir");
        let (client, server) = tokio::io::duplex(64 * 1024);
        tokio::spawn(scripted_daemon(
            server,
            vec![
                ("suiteDidStart", protocol::suite_did_start("MyTests")),
                (
                    "caseDidStart",
                    protocol::case_did_start("MyTests", "MyTests", "testCrash"),
                ),
                // No further events: the runner dies instead.
            ],
        ));

        let reporter = ConsumableReporter::new();
        // A runner that exits almost immediately with SIGTERM semantics.
        let runner = spawn(ProcessSpawnConfig::new(
            "/bin/sh",
            vec!["-c".to_owned(), "sleep 0.2; exit 1".to_owned()],
        ))
        .await
        .expect("spawn");

        let outcome = run_test_plan(
            &prepared_stub(dir.path()),
            runner,
            client,
            &TestRunStrategy::new(ProtocolVersionRange {
                minimum: 25,
                maximum: 29,
            }),
            reporter.clone(),
            Logger::null(),
        )
        .await
        .expect("run returns an outcome");

        assert!(outcome.abnormal);
        assert!(outcome.error.expect("error").contains("mid-plan"));
        let updates = reporter.consume_current_results();
        assert_eq!(updates.len(), 1, "the running case was closed out");
        assert!(updates[0].crashed);
        assert_eq!(reporter.run_state(), TestRunState::TerminatedAbnormally);
    }

    #[tokio::test(start_paused = true)]
    async fn plan_timeout_ends_run_abnormally() {
        let dir = camino_tempfile::tempdir().expect("tempdir");
        let (client, server) = tokio::io::duplex(64 * 1024);
        tokio::spawn(scripted_daemon(
            server,
            vec![("suiteDidStart", protocol::suite_did_start("MyTests"))],
        ));

        let reporter = ConsumableReporter::new();
        let runner = short_lived_runner().await;
        let mut strategy = TestRunStrategy::new(ProtocolVersionRange {
            minimum: 25,
            maximum: 29,
        });
        strategy.plan_timeout = Some(Duration::from_secs(2));

        let outcome = run_test_plan(
            &prepared_stub(dir.path()),
            runner,
            client,
            &strategy,
            reporter.clone(),
            Logger::null(),
        )
        .await
        .expect("run returns an outcome");

        assert!(outcome.abnormal);
        assert!(outcome.error.expect("error").contains("timed out"));
        assert_eq!(reporter.run_state(), TestRunState::TerminatedAbnormally);
    }
}

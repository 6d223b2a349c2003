// Copyright (c) The ios-companion Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! End-to-end flows across the control plane: a filtered test run driven
//! through the delta-session surface, backed by a scripted daemon over an
//! in-memory transport and a real runner process.

use companion_core::{
    consumer::DataConsumer,
    fut::Deferred,
    logger::Logger,
    process::{ProcessSpawnConfig, spawn},
    xctest::{
        AdHocCodesigner, CodesignPolicy, ProtocolVersionRange, ShimConfiguration,
        TestLaunchConfiguration, TestRunStrategy, XCTestConfiguration, XctestSessionOperation,
        prepare_test_run,
        reporter::{CompositeReporter, ConsumableReporter, JsonStreamReporter, JunitReporter},
        run_test_plan, xctest_session_manager,
    },
};
use companion_metadata::TestRunState;
use pretty_assertions::assert_eq;
use std::{sync::Arc, time::Duration};

mod fake_daemon {
    //! A daemon that answers the handshake, accepts channel opens, replies
    //! to plan calls and replays a scripted set of test events.

    use companion_core::xctest::{
        DaemonHello, FramedTransport, RpcKind, RpcMessage, protocol,
    };
    use serde::{Deserialize, Serialize};
    use serde_json::{Value, json};

    #[derive(Serialize, Deserialize)]
    struct Envelope {
        channel: u32,
        message: RpcMessage,
    }

    pub async fn run(stream: tokio::io::DuplexStream) {
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
                "beginTestPlan" => {
                    reply(&mut transport, &envelope, json!({"accepted": true})).await;
                    let events = [
                        ("suiteDidStart", protocol::suite_did_start("MyTests")),
                        (
                            "caseDidStart",
                            protocol::case_did_start("MyTests", "MyTests", "testA"),
                        ),
                        (
                            "caseDidFinish",
                            protocol::case_did_finish("MyTests", "testA", "passed", 150),
                        ),
                        (
                            "suiteDidFinish",
                            protocol::suite_did_finish("MyTests", 1, 0),
                        ),
                    ];
                    for (method, payload) in events {
                        send_event(&mut transport, bundle_channel, method, payload).await;
                    }
                }
                "endTestPlan" => {
                    reply(&mut transport, &envelope, Value::Null).await;
                }
                _ => {}
            }
        }
    }

    async fn reply(
        transport: &mut FramedTransport<tokio::io::DuplexStream>,
        request: &Envelope,
        payload: Value,
    ) {
        let envelope = Envelope {
            channel: request.channel,
            message: RpcMessage {
                identifier: request.message.identifier,
                method: request.message.method.clone(),
                payload,
                kind: RpcKind::Reply,
            },
        };
        transport
            .send_frame(&serde_json::to_vec(&envelope).expect("serialize"))
            .await
            .expect("send reply");
    }

    async fn send_event(
        transport: &mut FramedTransport<tokio::io::DuplexStream>,
        channel: u32,
        method: &str,
        payload: Value,
    ) {
        let envelope = Envelope {
            channel,
            message: RpcMessage {
                identifier: 0,
                method: method.to_owned(),
                payload,
                kind: RpcKind::Event,
            },
        };
        transport
            .send_frame(&serde_json::to_vec(&envelope).expect("serialize"))
            .await
            .expect("send event");
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

async fn stage_fixture(
    root: &camino::Utf8Path,
) -> (TestLaunchConfiguration, ShimConfiguration) {
    let bundle = root.join("MyTests.xctest");
    tokio::fs::create_dir_all(&bundle).await.expect("mkdir");
    tokio::fs::write(bundle.join("MyTests"), "binary")
        .await
        .expect("write binary");
    tokio::fs::write(root.join(ShimConfiguration::SHIM_DYLIB_NAME), "dylib")
        .await
        .expect("write shim");
    let shims = ShimConfiguration::locate(root, None).expect("locate shims");

    let mut config = XCTestConfiguration::new(bundle.clone(), "MyTests");
    config.tests_to_run.insert("MyTests/testA".to_owned());
    config.collect_result_bundle = true;
    (TestLaunchConfiguration::new(config), shims)
}

/// Scenario: a filtered run (`tests_to_run = {"MyTests/testA"}`) observed
/// through delta polls reports the single passing case and terminates
/// normally.
#[tokio::test]
async fn filtered_run_streams_deltas_to_termination() {
    init_tracing();
    let dir = camino_tempfile::tempdir().expect("tempdir");
    let (launch, shims) = stage_fixture(dir.path()).await;
    let work = dir.path().join("run");

    let manager = xctest_session_manager(Logger::null(), None, None, move |launch| {
        let shims = shims.clone();
        let work = work.clone();
        let (resolver, operation_future) = Deferred::new();
        tokio::spawn(async move {
            let prepared = prepare_test_run(
                &launch,
                &work,
                &shims,
                &AdHocCodesigner,
                CodesignPolicy::AcceptAdHoc,
            )
            .await
            .expect("prepare");

            let artifact = tokio::fs::read_to_string(&prepared.artifact_path)
                .await
                .expect("artifact exists");
            let staged = XCTestConfiguration::from_artifact_json(&artifact).expect("parse");
            assert!(staged.tests_to_run.contains("MyTests/testA"));

            let runner = spawn(ProcessSpawnConfig::new(
                "/bin/sleep",
                vec!["30".to_owned()],
            ))
            .await
            .expect("spawn runner");

            let (client, server) = tokio::io::duplex(64 * 1024);
            tokio::spawn(fake_daemon::run(server));

            let reporter = ConsumableReporter::new();
            let operation = XctestSessionOperation::spawn(
                {
                    let reporter = Arc::clone(&reporter);
                    let strategy = TestRunStrategy::new(ProtocolVersionRange {
                        minimum: 25,
                        maximum: 29,
                    });
                    async move {
                        run_test_plan(
                            &prepared,
                            runner,
                            client,
                            &strategy,
                            reporter,
                            Logger::null(),
                        )
                        .await
                    }
                },
                reporter,
            );
            resolver.resolve(operation);
        });
        operation_future
    });

    let session = manager.start(launch).await.expect("session starts");

    // Poll until terminal, accumulating everything the run reports.
    let mut updates = Vec::new();
    let mut log_output = String::new();
    let mut state = TestRunState::NotStarted;
    for _ in 0..100 {
        let delta = session.obtain_updates().await.expect("delta");
        updates.extend(delta.updates);
        log_output.push_str(&delta.log_output);
        state = delta.state;
        if state.is_terminal() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    assert_eq!(state, TestRunState::TerminatedNormally);
    assert_eq!(updates.len(), 1);
    let update = &updates[0];
    assert_eq!(update.method_name.as_deref(), Some("testA"));
    assert_eq!(update.class_name.as_deref(), Some("MyTests"));
    assert!(update.passed);
    assert!(!update.crashed);
    assert_eq!(update.duration, Duration::from_millis(150));
    assert!(log_output.contains("suite MyTests started"));
    assert!(log_output.contains("1 run, 0 failed"));
    assert!(session.is_terminal());
    assert_eq!(manager.session_count(), 0);
}

/// The reporter fan-out writes the same run to JUnit XML and a JSON line
/// stream while the consumable reporter feeds deltas.
#[tokio::test]
async fn reporter_fan_out_produces_all_formats() {
    init_tracing();
    let dir = camino_tempfile::tempdir().expect("tempdir");
    let (launch, shims) = stage_fixture(dir.path()).await;
    let work = dir.path().join("run");

    let prepared = prepare_test_run(
        &launch,
        &work,
        &shims,
        &AdHocCodesigner,
        CodesignPolicy::AcceptAdHoc,
    )
    .await
    .expect("prepare");

    let runner = spawn(ProcessSpawnConfig::new(
        "/bin/sleep",
        vec!["30".to_owned()],
    ))
    .await
    .expect("spawn runner");
    let (client, server) = tokio::io::duplex(64 * 1024);
    tokio::spawn(fake_daemon::run(server));

    let junit_path = dir.path().join("junit.xml");
    let json_lines = Arc::new(std::sync::Mutex::new(String::new()));
    let json_sink = {
        let json_lines = Arc::clone(&json_lines);
        companion_core::consumer::FnConsumer::new(move |chunk| {
            json_lines
                .lock()
                .expect("lock")
                .push_str(&String::from_utf8_lossy(&chunk));
        })
    };
    let consumable = ConsumableReporter::new();
    let reporter = CompositeReporter::new(vec![
        consumable.clone(),
        Arc::new(JunitReporter::new("companion", junit_path.clone())),
        Arc::new(JsonStreamReporter::new(json_sink.clone())),
    ]);

    let outcome = run_test_plan(
        &prepared,
        runner,
        client,
        &TestRunStrategy::new(ProtocolVersionRange {
            minimum: 25,
            maximum: 29,
        }),
        reporter,
        Logger::null(),
    )
    .await
    .expect("run");

    assert!(!outcome.abnormal);
    // Result bundle was requested but never produced: collected
    // opportunistically, absent without failing the run.
    assert!(outcome.result_bundle_path.is_none());

    let xml = std::fs::read_to_string(&junit_path).expect("junit written");
    assert!(xml.contains("testA"));

    let stream = json_lines.lock().expect("lock").clone();
    let events: Vec<serde_json::Value> = stream
        .lines()
        .map(|line| serde_json::from_str(line).expect("JSON line"))
        .collect();
    assert!(
        events
            .iter()
            .any(|event| event["event"] == "case-finished" && event["status"] == "passed")
    );
    assert_eq!(
        consumable.run_state(),
        TestRunState::TerminatedNormally
    );
    json_sink.completed().value().await.expect("json sink drained");
}

// Copyright (c) The ios-companion Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Test runs as delta sessions.
//!
//! Adapts a running test plan to the delta-update manager: the consumable
//! reporter accumulates updates and log output between polls, and each
//! poll drains them into one [`TestRunDelta`].

use crate::{
    errors::CompanionError,
    fut::Deferred,
    logger::Logger,
    session::{Continuation, DeltaUpdateManager, SessionUuid},
    xctest::{config::TestLaunchConfiguration, reporter::ConsumableReporter, runner::TestRunOutcome},
};
use companion_metadata::{TestRunDelta, TestRunState};
use std::{
    future::Future,
    sync::{Arc, Mutex},
    time::Duration,
};

/// A test run adapted for delta sessions.
#[derive(Clone)]
pub struct XctestSessionOperation {
    reporter: Arc<ConsumableReporter>,
    completed: Deferred<()>,
    outcome: Arc<Mutex<Option<TestRunOutcome>>>,
}

impl XctestSessionOperation {
    /// Spawns the run future and wraps it as a session operation.
    ///
    /// Cancelling the completion future aborts the run task; the channel
    /// layer's teardown is cancel-safe, and the reporter keeps whatever
    /// results arrived before the abort.
    pub fn spawn<F>(run: F, reporter: Arc<ConsumableReporter>) -> Self
    where
        F: Future<Output = Result<TestRunOutcome, CompanionError>> + Send + 'static,
    {
        let (resolver, completed) = Deferred::new();
        let outcome: Arc<Mutex<Option<TestRunOutcome>>> = Arc::new(Mutex::new(None));
        let task = tokio::spawn({
            let outcome = Arc::clone(&outcome);
            async move {
                match run.await {
                    Ok(run_outcome) => {
                        outcome
                            .lock()
                            .expect("outcome lock poisoned")
                            .replace(run_outcome);
                        resolver.resolve(());
                    }
                    Err(err) => {
                        resolver.reject(err);
                    }
                }
            }
        });
        let abort = task.abort_handle();
        // Registered on the operation's own completion future: terminate()
        // cancels it, which aborts the in-flight run.
        let op = Self {
            reporter,
            completed,
            outcome,
        };
        {
            let completed = op.completed.clone();
            completed.observe(move |result| {
                if matches!(result, Err(crate::errors::FutureError::Cancelled)) {
                    abort.abort();
                }
            });
        }
        op
    }

    /// The reporter accumulating this run's results.
    pub fn reporter(&self) -> &Arc<ConsumableReporter> {
        &self.reporter
    }

    /// The run outcome, once the plan finished.
    pub fn outcome(&self) -> Option<TestRunOutcome> {
        self.outcome.lock().expect("outcome lock poisoned").clone()
    }
}

impl Continuation for XctestSessionOperation {
    fn completed(&self) -> Deferred<()> {
        self.completed.clone()
    }
}

/// A delta-update manager over test runs.
pub type XctestSessionManager =
    DeltaUpdateManager<TestLaunchConfiguration, XctestSessionOperation, TestRunDelta>;

/// Builds the manager around a run-starting closure.
///
/// The closure owns phases 1–4 (preparation, launch, transport, channels)
/// and returns the operation once the plan is executing.
pub fn xctest_session_manager(
    logger: Logger,
    expiration: Option<Duration>,
    capacity: Option<usize>,
    start_run: impl Fn(TestLaunchConfiguration) -> Deferred<XctestSessionOperation>
    + Send
    + Sync
    + 'static,
) -> XctestSessionManager {
    DeltaUpdateManager::new(
        "xctest",
        logger,
        expiration,
        capacity,
        start_run,
        |operation: &XctestSessionOperation, id: SessionUuid, done: &mut bool| {
            let updates = operation.reporter.consume_current_results();
            let log_output = operation.reporter.consume_log_output();
            let completed = operation.completed.peek();
            let mut state = operation.reporter.run_state();
            let mut error = operation.reporter.error();

            match &completed {
                Some(Ok(())) | Some(Err(_)) => {
                    *done = true;
                    if !state.is_terminal() {
                        // Terminated before the plan produced its ending
                        // event (cancellation or an early failure).
                        state = TestRunState::TerminatedAbnormally;
                    }
                    if error.is_none() {
                        if let Some(Err(err)) = &completed {
                            if !err.is_cancelled() {
                                error = Some(err.to_string());
                            }
                        }
                    }
                }
                None => {}
            }

            let outcome = operation.outcome();
            Deferred::resolved(TestRunDelta {
                session_id: id.to_string(),
                updates,
                log_output,
                result_bundle_path: outcome
                    .as_ref()
                    .and_then(|o| o.result_bundle_path.clone()),
                coverage_path: outcome.as_ref().and_then(|o| o.coverage_path.clone()),
                state,
                error,
            })
        },
    )
}

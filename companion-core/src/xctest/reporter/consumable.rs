// Copyright (c) The ios-companion Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The consumable reporter: stores every update in a queue drained by
//! delta polls.

use crate::{
    consumer::DataConsumer,
    errors::CompanionError,
    fut::Deferred,
    xctest::reporter::{CaseStatus, TestRunEvent, TestRunEventKind, XCTestReporter},
};
use bytes::Bytes;
use companion_metadata::{
    TestActivity, TestFailureInfo, TestRunState, TestRunUpdate,
};
use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

/// A case currently executing, accumulating issues and activities.
struct OpenCase {
    bundle_name: String,
    class_name: String,
    method_name: String,
    logs: Vec<String>,
    issues: Vec<TestFailureInfo>,
    // Stack of open activities; closing one folds it into its parent or
    // the finished list.
    activity_stack: Vec<TestActivity>,
    finished_activities: Vec<TestActivity>,
}

impl OpenCase {
    fn into_update(
        mut self,
        status: CaseStatus,
        duration: Duration,
    ) -> TestRunUpdate {
        // Unclosed activities (e.g. when the runner crashed mid-activity)
        // still belong to the case.
        while let Some(open) = self.activity_stack.pop() {
            self.finished_activities.push(open);
        }
        TestRunUpdate {
            bundle_name: Some(self.bundle_name),
            class_name: Some(self.class_name),
            method_name: Some(self.method_name),
            logs: self.logs,
            duration,
            passed: status == CaseStatus::Passed,
            skipped: status == CaseStatus::Skipped,
            failure_info: if status == CaseStatus::Failed {
                self.issues.into_iter().next()
            } else {
                None
            },
            activity_logs: self.finished_activities,
            crashed: status == CaseStatus::Crashed,
        }
    }
}

#[derive(Default)]
struct ConsumableState {
    updates: Vec<TestRunUpdate>,
    log_output: String,
    open_case: Option<OpenCase>,
    run_state: TestRunState,
    error: Option<String>,
    eof: bool,
}

/// Collects test results and exposes them as values consumed
/// incrementally.
///
/// Also a [`DataConsumer`]: runner output funnels into the same log
/// stream the deltas report.
pub struct ConsumableReporter {
    state: Mutex<ConsumableState>,
    completed: Deferred<()>,
    resolver: crate::fut::Resolver<()>,
}

impl ConsumableReporter {
    /// Creates an empty reporter.
    pub fn new() -> Arc<Self> {
        let (resolver, completed) = Deferred::new();
        Arc::new(Self {
            state: Mutex::new(ConsumableState::default()),
            completed,
            resolver,
        })
    }

    /// Takes the updates accumulated since the last call.
    pub fn consume_current_results(&self) -> Vec<TestRunUpdate> {
        let mut state = self.state.lock().expect("consumable state lock poisoned");
        std::mem::take(&mut state.updates)
    }

    /// Takes the log text accumulated since the last call.
    pub fn consume_log_output(&self) -> String {
        let mut state = self.state.lock().expect("consumable state lock poisoned");
        std::mem::take(&mut state.log_output)
    }

    /// The run state as of the last handled event.
    pub fn run_state(&self) -> TestRunState {
        self.state
            .lock()
            .expect("consumable state lock poisoned")
            .run_state
    }

    /// The error that ended the run abnormally, if any.
    pub fn error(&self) -> Option<String> {
        self.state
            .lock()
            .expect("consumable state lock poisoned")
            .error
            .clone()
    }

    fn append_log(&self, text: &str) {
        let mut state = self.state.lock().expect("consumable state lock poisoned");
        match &mut state.open_case {
            Some(open) => open.logs.push(text.trim_end_matches('\n').to_owned()),
            None => {
                state.log_output.push_str(text);
                if !text.ends_with('\n') {
                    state.log_output.push('\n');
                }
            }
        }
    }
}

impl XCTestReporter for ConsumableReporter {
    fn handle_event(&self, event: &TestRunEvent) {
        let mut state = self.state.lock().expect("consumable state lock poisoned");
        match &event.kind {
            TestRunEventKind::PlanStarted => {
                state.run_state = TestRunState::Running;
            }
            TestRunEventKind::SuiteStarted { name } => {
                state.log_output.push_str(&format!("suite {name} started\n"));
            }
            TestRunEventKind::CaseStarted {
                bundle_name,
                class_name,
                method_name,
            } => {
                state.open_case = Some(OpenCase {
                    bundle_name: bundle_name.clone(),
                    class_name: class_name.clone(),
                    method_name: method_name.clone(),
                    logs: Vec::new(),
                    issues: Vec::new(),
                    activity_stack: Vec::new(),
                    finished_activities: Vec::new(),
                });
            }
            TestRunEventKind::CaseIssue {
                message,
                file,
                line,
                ..
            } => {
                if let Some(open) = &mut state.open_case {
                    open.issues.push(TestFailureInfo {
                        message: message.clone(),
                        file: file.clone(),
                        line: *line,
                    });
                }
            }
            TestRunEventKind::CaseFinished {
                status, duration, ..
            } => {
                if let Some(open) = state.open_case.take() {
                    let update = open.into_update(*status, *duration);
                    state.updates.push(update);
                }
            }
            TestRunEventKind::ActivityStarted { title, uuid, .. } => {
                if let Some(open) = &mut state.open_case {
                    open.activity_stack.push(TestActivity {
                        title: title.clone(),
                        duration: Duration::ZERO,
                        uuid: uuid.clone(),
                        sub_activities: Vec::new(),
                        attachments: Vec::new(),
                    });
                }
            }
            TestRunEventKind::ActivityAttachment { uuid, attachment } => {
                if let Some(open) = &mut state.open_case {
                    if let Some(activity) = open
                        .activity_stack
                        .iter_mut()
                        .rev()
                        .find(|a| a.uuid == *uuid)
                    {
                        activity.attachments.push(attachment.clone());
                    }
                }
            }
            TestRunEventKind::ActivityFinished { uuid, duration } => {
                if let Some(open) = &mut state.open_case {
                    if let Some(position) = open
                        .activity_stack
                        .iter()
                        .rposition(|a| a.uuid == *uuid)
                    {
                        let mut finished = open.activity_stack.remove(position);
                        finished.duration = *duration;
                        match open.activity_stack.last_mut() {
                            Some(parent) => parent.sub_activities.push(finished),
                            None => open.finished_activities.push(finished),
                        }
                    }
                }
            }
            TestRunEventKind::Output { line } => {
                drop(state);
                self.append_log(line);
            }
            TestRunEventKind::SuiteFinished { name, summary } => {
                state.log_output.push_str(&format!(
                    "suite {name} finished: {} run, {} failed, {} skipped\n",
                    summary.run_count, summary.failure_count, summary.skip_count
                ));
            }
            TestRunEventKind::RunnerCrashed { description } => {
                // Materialize the crash on the running case so clients see
                // a coherent tail.
                if let Some(open) = state.open_case.take() {
                    let update = open.into_update(CaseStatus::Crashed, Duration::ZERO);
                    state.updates.push(update);
                }
                state.error = Some(description.clone());
            }
            TestRunEventKind::PlanEnded { abnormal } => {
                state.run_state = if *abnormal {
                    TestRunState::TerminatedAbnormally
                } else {
                    TestRunState::TerminatedNormally
                };
            }
        }
    }

    fn finish(&self) -> Result<(), CompanionError> {
        self.resolver.resolve(());
        Ok(())
    }
}

impl DataConsumer for ConsumableReporter {
    fn consume(&self, chunk: Bytes) -> Result<(), CompanionError> {
        {
            let state = self.state.lock().expect("consumable state lock poisoned");
            if state.eof {
                return Err(CompanionError::InvalidArgument(
                    "consumer received data after end-of-file".to_owned(),
                ));
            }
        }
        self.append_log(&String::from_utf8_lossy(&chunk));
        Ok(())
    }

    fn end_of_file(&self) -> Result<(), CompanionError> {
        let mut state = self.state.lock().expect("consumable state lock poisoned");
        if state.eof {
            return Err(CompanionError::InvalidArgument(
                "end-of-file signalled twice".to_owned(),
            ));
        }
        state.eof = true;
        Ok(())
    }

    fn completed(&self) -> Deferred<()> {
        self.completed.clone()
    }
}

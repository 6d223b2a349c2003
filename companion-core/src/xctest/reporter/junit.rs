// Copyright (c) The ios-companion Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! JUnit XML report generation.

use crate::{
    errors::CompanionError,
    xctest::reporter::{CaseStatus, TestRunEvent, TestRunEventKind, XCTestReporter},
};
use camino::Utf8PathBuf;
use indexmap::IndexMap;
use quick_junit::{NonSuccessKind, Report, TestCase, TestCaseStatus, TestSuite};
use std::sync::Mutex;

struct PendingIssue {
    message: String,
    file: Option<String>,
    line: Option<u64>,
}

#[derive(Default)]
struct JunitState {
    // Suites in start order; cases within a suite in finish order.
    suites: IndexMap<String, Vec<TestCase>>,
    current_suite: Option<String>,
    issues: IndexMap<(String, String), Vec<PendingIssue>>,
}

/// Builds a JUnit XML file from run events and writes it on finish.
pub struct JunitReporter {
    report_name: String,
    output_path: Utf8PathBuf,
    state: Mutex<JunitState>,
}

impl JunitReporter {
    /// Creates a reporter writing to `output_path`.
    pub fn new(report_name: impl Into<String>, output_path: impl Into<Utf8PathBuf>) -> Self {
        Self {
            report_name: report_name.into(),
            output_path: output_path.into(),
            state: Mutex::new(JunitState::default()),
        }
    }

    fn testcase_for(
        issues: Option<Vec<PendingIssue>>,
        class_name: &str,
        method_name: &str,
        status: CaseStatus,
        duration: std::time::Duration,
    ) -> TestCase {
        let testcase_status = match status {
            CaseStatus::Passed => TestCaseStatus::success(),
            CaseStatus::Skipped => TestCaseStatus::skipped(),
            CaseStatus::Failed => {
                let mut failed = TestCaseStatus::non_success(NonSuccessKind::Failure);
                if let Some(first) = issues.as_ref().and_then(|v| v.first()) {
                    failed.set_message(first.message.clone());
                    if let (Some(file), Some(line)) = (&first.file, first.line) {
                        failed.set_description(format!("{file}:{line}: {}", first.message));
                    }
                }
                failed
            }
            CaseStatus::Crashed => {
                let mut errored = TestCaseStatus::non_success(NonSuccessKind::Error);
                errored.set_type("crash");
                errored
            }
        };
        let mut testcase = TestCase::new(method_name, testcase_status);
        testcase.set_classname(class_name);
        testcase.set_time(duration);
        testcase
    }
}

impl XCTestReporter for JunitReporter {
    fn handle_event(&self, event: &TestRunEvent) {
        let mut state = self.state.lock().expect("junit state lock poisoned");
        match &event.kind {
            TestRunEventKind::SuiteStarted { name } => {
                state.suites.entry(name.clone()).or_default();
                state.current_suite = Some(name.clone());
            }
            TestRunEventKind::CaseIssue {
                class_name,
                method_name,
                message,
                file,
                line,
            } => {
                state
                    .issues
                    .entry((class_name.clone(), method_name.clone()))
                    .or_default()
                    .push(PendingIssue {
                        message: message.clone(),
                        file: file.clone(),
                        line: *line,
                    });
            }
            TestRunEventKind::CaseFinished {
                class_name,
                method_name,
                status,
                duration,
            } => {
                let issues = state
                    .issues
                    .shift_remove(&(class_name.clone(), method_name.clone()));
                let testcase =
                    Self::testcase_for(issues, class_name, method_name, *status, *duration);
                let suite = state
                    .current_suite
                    .clone()
                    .unwrap_or_else(|| class_name.clone());
                state.suites.entry(suite).or_default().push(testcase);
            }
            TestRunEventKind::SuiteFinished { .. } => {
                state.current_suite = None;
            }
            _ => {}
        }
    }

    fn finish(&self) -> Result<(), CompanionError> {
        let mut state = self.state.lock().expect("junit state lock poisoned");
        let mut report = Report::new(self.report_name.clone());
        for (name, cases) in state.suites.drain(..) {
            let mut suite = TestSuite::new(name);
            for case in cases {
                suite.add_test_case(case);
            }
            report.add_test_suite(suite);
        }
        let file = std::fs::File::create(&self.output_path)
            .map_err(|error| CompanionError::io_at(self.output_path.clone(), error))?;
        report.serialize(file).map_err(|err| {
            CompanionError::InvalidArgument(format!("JUnit serialization failed: {err}"))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn event(kind: TestRunEventKind) -> TestRunEvent {
        TestRunEvent::now(kind)
    }

    #[test]
    fn report_contains_suite_and_cases() {
        let dir = camino_tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("junit.xml");
        let reporter = JunitReporter::new("companion-tests", path.clone());

        reporter.handle_event(&event(TestRunEventKind::SuiteStarted {
            name: "MyTests".to_owned(),
        }));
        reporter.handle_event(&event(TestRunEventKind::CaseFinished {
            class_name: "MyTests".to_owned(),
            method_name: "testA".to_owned(),
            status: CaseStatus::Passed,
            duration: Duration::from_millis(100),
        }));
        reporter.handle_event(&event(TestRunEventKind::CaseIssue {
            class_name: "MyTests".to_owned(),
            method_name: "testB".to_owned(),
            message: "assertion failed".to_owned(),
            file: Some("MyTests.m".to_owned()),
            line: Some(7),
        }));
        reporter.handle_event(&event(TestRunEventKind::CaseFinished {
            class_name: "MyTests".to_owned(),
            method_name: "testB".to_owned(),
            status: CaseStatus::Failed,
            duration: Duration::from_millis(20),
        }));
        reporter.finish().expect("finish");

        let xml = std::fs::read_to_string(&path).expect("read");
        assert!(xml.contains("testsuite"));
        assert!(xml.contains("MyTests"));
        assert!(xml.contains("testA"));
        assert!(xml.contains("assertion failed"));
        assert!(xml.contains("MyTests.m:7"));
    }

    #[test]
    fn crash_is_reported_as_error() {
        let dir = camino_tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("crash.xml");
        let reporter = JunitReporter::new("companion-tests", path.clone());
        reporter.handle_event(&event(TestRunEventKind::SuiteStarted {
            name: "MyTests".to_owned(),
        }));
        reporter.handle_event(&event(TestRunEventKind::CaseFinished {
            class_name: "MyTests".to_owned(),
            method_name: "testCrash".to_owned(),
            status: CaseStatus::Crashed,
            duration: Duration::ZERO,
        }));
        reporter.finish().expect("finish");

        let xml = std::fs::read_to_string(&path).expect("read");
        assert!(xml.contains("error"), "crashes map to <error>");
    }
}

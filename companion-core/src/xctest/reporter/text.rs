// Copyright (c) The ios-companion Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The plain text reporter, for log files and legacy consumers.

use crate::{
    logger::Logger,
    xctest::reporter::{CaseStatus, TestRunEvent, TestRunEventKind, XCTestReporter},
};

/// Formats each event as one human-readable log line.
pub struct TextReporter {
    logger: Logger,
}

impl TextReporter {
    /// Creates a reporter logging through the given logger.
    pub fn new(logger: Logger) -> Self {
        Self {
            logger: logger.named("xctest"),
        }
    }
}

impl XCTestReporter for TextReporter {
    fn handle_event(&self, event: &TestRunEvent) {
        match &event.kind {
            TestRunEventKind::PlanStarted => self.logger.info("test plan started"),
            TestRunEventKind::SuiteStarted { name } => {
                self.logger.info(format!("suite '{name}' started"));
            }
            TestRunEventKind::CaseStarted {
                class_name,
                method_name,
                ..
            } => {
                self.logger.info(format!("{class_name}/{method_name} started"));
            }
            TestRunEventKind::CaseIssue {
                class_name,
                method_name,
                message,
                ..
            } => {
                self.logger
                    .warn(format!("{class_name}/{method_name}: {message}"));
            }
            TestRunEventKind::CaseFinished {
                class_name,
                method_name,
                status,
                duration,
            } => {
                let verdict = match status {
                    CaseStatus::Passed => "passed",
                    CaseStatus::Failed => "failed",
                    CaseStatus::Skipped => "skipped",
                    CaseStatus::Crashed => "crashed",
                };
                self.logger.info(format!(
                    "{class_name}/{method_name} {verdict} in {:.3}s",
                    duration.as_secs_f64()
                ));
            }
            TestRunEventKind::ActivityStarted { title, .. } => {
                self.logger.debug(format!("activity '{title}' started"));
            }
            TestRunEventKind::ActivityAttachment { attachment, .. } => {
                self.logger.debug(format!(
                    "attachment '{}' ({} bytes)",
                    attachment.name,
                    attachment.payload.len()
                ));
            }
            TestRunEventKind::ActivityFinished { uuid, duration } => {
                self.logger.debug(format!(
                    "activity {uuid} finished in {:.3}s",
                    duration.as_secs_f64()
                ));
            }
            TestRunEventKind::Output { line } => self.logger.debug(line),
            TestRunEventKind::SuiteFinished { name, summary } => {
                self.logger.info(format!(
                    "suite '{name}' finished: {} run, {} failed, {} skipped",
                    summary.run_count, summary.failure_count, summary.skip_count
                ));
            }
            TestRunEventKind::RunnerCrashed { description } => {
                self.logger.error(format!("runner crashed: {description}"));
            }
            TestRunEventKind::PlanEnded { abnormal } => {
                if *abnormal {
                    self.logger.error("test plan ended abnormally");
                } else {
                    self.logger.info("test plan ended");
                }
            }
        }
    }
}

// Copyright (c) The ios-companion Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Reporter events and fan-out.
//!
//! The runner translates daemon-channel traffic into [`TestRunEvent`]s and
//! hands each to a [`XCTestReporter`]. A [`CompositeReporter`] dispatches
//! to any number of concrete reporters: JUnit XML, streaming JSON, the
//! consumable in-memory buffer drained by delta polls, and a plain text
//! logger.

mod consumable;
mod json;
mod junit;
mod text;

pub use consumable::*;
pub use json::*;
pub use junit::*;
pub use text::*;

use crate::errors::CompanionError;
use chrono::{DateTime, Utc};
use companion_metadata::TestActivityAttachment;
use serde::Serialize;
use std::{sync::Arc, time::Duration};

/// The terminal status of one test case.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CaseStatus {
    /// The case passed.
    Passed,
    /// The case reported at least one failure.
    Failed,
    /// The case was skipped.
    Skipped,
    /// The runner crashed while the case was running.
    Crashed,
}

/// Counters for one finished suite.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct SuiteSummary {
    /// Cases run.
    pub run_count: u64,
    /// Cases that failed.
    pub failure_count: u64,
    /// Cases skipped.
    pub skip_count: u64,
    /// Wall-clock duration of the suite.
    pub total_duration: Duration,
}

/// A structural event in a test run.
#[derive(Clone, Debug, Serialize)]
pub struct TestRunEvent {
    /// When the event was observed.
    pub timestamp: DateTime<Utc>,
    /// What happened.
    #[serde(flatten)]
    pub kind: TestRunEventKind,
}

impl TestRunEvent {
    /// Stamps an event kind with the current time.
    pub fn now(kind: TestRunEventKind) -> Self {
        Self {
            timestamp: Utc::now(),
            kind,
        }
    }
}

/// The kinds of structural events a run produces.
#[derive(Clone, Debug, Serialize)]
#[serde(tag = "event", rename_all = "kebab-case", rename_all_fields = "kebab-case")]
pub enum TestRunEventKind {
    /// The test plan began executing.
    PlanStarted,
    /// A suite started.
    SuiteStarted {
        /// The suite name.
        name: String,
    },
    /// A case started running.
    CaseStarted {
        /// The test bundle name.
        bundle_name: String,
        /// The test class.
        class_name: String,
        /// The test method.
        method_name: String,
    },
    /// A case reported an issue.
    CaseIssue {
        /// The test class.
        class_name: String,
        /// The test method.
        method_name: String,
        /// The failure message.
        message: String,
        /// The reporting file, if known.
        file: Option<String>,
        /// The line within `file`.
        line: Option<u64>,
    },
    /// A case finished.
    CaseFinished {
        /// The test class.
        class_name: String,
        /// The test method.
        method_name: String,
        /// The terminal status.
        status: CaseStatus,
        /// How long the case ran.
        duration: Duration,
    },
    /// An activity opened.
    ActivityStarted {
        /// The owning test class.
        class_name: String,
        /// The owning test method.
        method_name: String,
        /// The activity title.
        title: String,
        /// The activity UUID.
        uuid: String,
    },
    /// An activity captured an attachment.
    ActivityAttachment {
        /// The owning activity UUID.
        uuid: String,
        /// The attachment.
        attachment: TestActivityAttachment,
    },
    /// An activity closed.
    ActivityFinished {
        /// The activity UUID.
        uuid: String,
        /// How long the activity ran.
        duration: Duration,
    },
    /// A line of runner output not attributed to a case.
    Output {
        /// The output line.
        line: String,
    },
    /// A suite finished.
    SuiteFinished {
        /// The suite name.
        name: String,
        /// The suite counters.
        summary: SuiteSummary,
    },
    /// The runner process crashed.
    RunnerCrashed {
        /// A description suitable for a report.
        description: String,
    },
    /// The test plan ended.
    PlanEnded {
        /// True when the plan ended abnormally (crash, transport failure
        /// or cancellation).
        abnormal: bool,
    },
}

/// A consumer of structural run events.
pub trait XCTestReporter: Send + Sync + 'static {
    /// Handles one event. Events for one channel arrive in FIFO order.
    fn handle_event(&self, event: &TestRunEvent);

    /// Called once after the final event; flush output here.
    fn finish(&self) -> Result<(), CompanionError> {
        Ok(())
    }
}

/// Fans events out to several reporters.
pub struct CompositeReporter {
    reporters: Vec<Arc<dyn XCTestReporter>>,
}

impl CompositeReporter {
    /// Creates a fan-out over the given reporters.
    pub fn new(reporters: Vec<Arc<dyn XCTestReporter>>) -> Arc<Self> {
        Arc::new(Self { reporters })
    }
}

impl XCTestReporter for CompositeReporter {
    fn handle_event(&self, event: &TestRunEvent) {
        for reporter in &self.reporters {
            reporter.handle_event(event);
        }
    }

    fn finish(&self) -> Result<(), CompanionError> {
        let errors: Vec<CompanionError> = self
            .reporters
            .iter()
            .filter_map(|reporter| reporter.finish().err())
            .collect();
        CompanionError::aggregate(errors)
    }
}

// Copyright (c) The ios-companion Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};
use std::{fmt, time::Duration};

/// The state of a test run, as observed through delta polls.
///
/// A run that has never produced an event is `NotStarted`. Once the test plan
/// begins executing it is `Running` until the terminal delta, which reports
/// either `TerminatedNormally` (the plan ended and was acknowledged) or
/// `TerminatedAbnormally` (a crash, transport failure or cancellation ended
/// the run early).
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TestRunState {
    /// No test-plan event has been observed yet.
    #[default]
    NotStarted,
    /// The test plan is executing.
    Running,
    /// The test plan ran to completion.
    TerminatedNormally,
    /// The run ended before the test plan completed.
    TerminatedAbnormally,
}

impl TestRunState {
    /// Returns true if no further deltas will be produced in this state.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::TerminatedNormally | Self::TerminatedAbnormally)
    }

    /// String representations of all known variants.
    pub fn variants() -> [&'static str; 4] {
        [
            "not-started",
            "running",
            "terminated-normally",
            "terminated-abnormally",
        ]
    }
}

impl fmt::Display for TestRunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::NotStarted => "not-started",
            Self::Running => "running",
            Self::TerminatedNormally => "terminated-normally",
            Self::TerminatedAbnormally => "terminated-abnormally",
        };
        write!(f, "{s}")
    }
}

/// Information about a single test failure.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct TestFailureInfo {
    /// The failure message.
    pub message: String,

    /// The file the failure was reported against, if known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,

    /// The line number within `file`, if known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<u64>,
}

/// An attachment captured within a test activity: a screenshot, a log, or
/// arbitrary binary data.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct TestActivityAttachment {
    /// The name under which the attachment was recorded.
    pub name: String,

    /// The uniform type identifier of the payload, e.g. `public.png`.
    pub uniform_type_identifier: String,

    /// The raw payload.
    #[serde(with = "serde_bytes_base64")]
    pub payload: Vec<u8>,

    /// Milliseconds since the reference date at which the attachment was
    /// captured.
    pub timestamp: f64,
}

/// A single activity recorded during a test case. Activities nest.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct TestActivity {
    /// The title of the activity.
    pub title: String,

    /// The duration of the activity.
    pub duration: Duration,

    /// The UUID assigned to the activity by the test driver.
    pub uuid: String,

    /// Activities started while this one was open.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sub_activities: Vec<TestActivity>,

    /// Attachments captured by this activity.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<TestActivityAttachment>,
}

/// An incremental update for one test case.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct TestRunUpdate {
    /// The name of the test bundle, if known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bundle_name: Option<String>,

    /// The test class name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub class_name: Option<String>,

    /// The test method name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method_name: Option<String>,

    /// Log lines attributed to this test case.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub logs: Vec<String>,

    /// How long the case took to run.
    pub duration: Duration,

    /// True if the case passed.
    pub passed: bool,

    /// True if the case was skipped rather than run.
    #[serde(default)]
    pub skipped: bool,

    /// Failure details, present when `passed` is false and the case did not
    /// crash.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_info: Option<TestFailureInfo>,

    /// Activities recorded while the case ran.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub activity_logs: Vec<TestActivity>,

    /// True if the case terminated by crashing the runner process.
    #[serde(default)]
    pub crashed: bool,
}

/// One poll's worth of test-run progress.
///
/// The concatenation of all deltas for a session approximates the full
/// stream: every case update and every log byte appears in exactly one delta.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct TestRunDelta {
    /// The identifier of the session this delta belongs to.
    pub session_id: String,

    /// Case updates since the previous delta.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub updates: Vec<TestRunUpdate>,

    /// Log text accumulated since the previous delta.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub log_output: String,

    /// The result bundle produced by the run, once collected.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_bundle_path: Option<Utf8PathBuf>,

    /// The coverage profile produced by the run, once collected.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub coverage_path: Option<Utf8PathBuf>,

    /// The state of the run as of this delta.
    pub state: TestRunState,

    /// The error that ended the run, if it ended abnormally.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

mod serde_bytes_base64 {
    //! Binary attachment payloads serialize as base64 so that deltas remain
    //! valid UTF-8 JSON.

    use base64::{Engine as _, engine::general_purpose::STANDARD};
    use serde::{Deserialize, Deserializer, Serializer, de::Error};

    pub(super) fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(&s).map_err(D::Error::custom)
    }
}

// Copyright (c) The ios-companion Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A parsed crash report, as returned to clients of the crash-log store.
///
/// The raw report text is intentionally not part of the wire value; clients
/// that need it fetch it by `identifier` so that list responses stay small.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct CrashLogInfo {
    /// The identifier of the report, unique within the store.
    pub identifier: String,

    /// The name of the crashed process.
    pub process_name: String,

    /// The pid of the crashed process.
    pub process_identifier: u32,

    /// The name of the parent process.
    pub parent_process_name: String,

    /// The pid of the parent process.
    pub parent_process_identifier: u32,

    /// The path of the crashed executable.
    pub executable_path: String,

    /// When the crash occurred.
    pub date: DateTime<Utc>,

    /// A description of the exception that terminated the process.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exception_description: Option<String>,

    /// A description of the thread that crashed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crashed_thread_description: Option<String>,
}

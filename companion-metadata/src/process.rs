// Copyright (c) The ios-companion Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use serde::{Deserialize, Serialize};
use std::fmt;

/// The decomposed exit status of a launched process.
///
/// Mirrors the information packed into a wait-style `statLoc`: either the
/// process exited with a code, or it was terminated by a signal (possibly
/// dumping core). When a signal terminated the process, `exit_code` is `-1`
/// by convention.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ProcessExitSummary {
    /// The exit code, or `-1` if the process was killed by a signal.
    pub exit_code: i32,

    /// The signal that terminated the process, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signal: Option<i32>,

    /// True if the kernel reported a core dump.
    #[serde(default)]
    pub core_dumped: bool,
}

impl ProcessExitSummary {
    /// A normal exit with the given code.
    pub fn exited(exit_code: i32) -> Self {
        Self {
            exit_code,
            signal: None,
            core_dumped: false,
        }
    }

    /// Termination by a signal.
    pub fn signalled(signal: i32, core_dumped: bool) -> Self {
        Self {
            exit_code: -1,
            signal: Some(signal),
            core_dumped,
        }
    }

    /// True if the process exited normally with code 0.
    pub fn is_success(&self) -> bool {
        self.signal.is_none() && self.exit_code == 0
    }
}

impl fmt::Display for ProcessExitSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.signal {
            Some(signal) => {
                write!(f, "terminated by signal {signal}")?;
                if self.core_dumped {
                    write!(f, " (core dumped)")?;
                }
                Ok(())
            }
            None => write!(f, "exited with code {}", self.exit_code),
        }
    }
}

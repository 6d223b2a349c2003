// Copyright (c) The ios-companion Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use serde::{Deserialize, Serialize};
use std::{collections::BTreeSet, fmt};

/// The lifecycle state of an attached target.
///
/// Targets move through these states only via the transitions enumerated in
/// [`TargetState::can_transition_to`]; in particular a target never goes from
/// `Shutdown` directly to `Booted` without passing through `Booting`.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TargetState {
    /// The target is being created and is not yet usable.
    Creating,
    /// The target exists but is not running.
    Shutdown,
    /// The target is in the process of booting.
    Booting,
    /// The target is booted and can service commands.
    Booted,
    /// The target is in the process of shutting down.
    ShuttingDown,
    /// A physical device in DFU mode.
    Dfu,
    /// A physical device in recovery mode.
    Recovery,
    /// A physical device restoring its OS.
    RestoreOs,
    /// The state could not be determined.
    Unknown,
}

impl TargetState {
    /// Returns true if `next` is a legal successor of `self`.
    ///
    /// `Unknown` is reachable from (and can resolve to) any state, since it
    /// represents a gap in observation rather than a real lifecycle step.
    pub fn can_transition_to(self, next: TargetState) -> bool {
        use TargetState::*;
        if self == next {
            return true;
        }
        match (self, next) {
            (_, Unknown) | (Unknown, _) => true,
            (Creating, Shutdown) => true,
            (Shutdown, Booting) => true,
            (Booting, Booted) => true,
            (Booting, ShuttingDown) => true,
            (Booted, ShuttingDown) => true,
            (ShuttingDown, Shutdown) => true,
            (Shutdown, Dfu | Recovery | RestoreOs) => true,
            (Dfu | Recovery | RestoreOs, Shutdown) => true,
            (Recovery, RestoreOs) => true,
            _ => false,
        }
    }

    /// String representations of all known variants.
    pub fn variants() -> [&'static str; 9] {
        [
            "creating",
            "shutdown",
            "booting",
            "booted",
            "shutting-down",
            "dfu",
            "recovery",
            "restore-os",
            "unknown",
        ]
    }
}

impl fmt::Display for TargetState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Creating => "creating",
            Self::Shutdown => "shutdown",
            Self::Booting => "booting",
            Self::Booted => "booted",
            Self::ShuttingDown => "shutting-down",
            Self::Dfu => "dfu",
            Self::Recovery => "recovery",
            Self::RestoreOs => "restore-os",
            Self::Unknown => "unknown",
        };
        write!(f, "{s}")
    }
}

/// What kind of target this is.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TargetKind {
    /// A simulator managed by the host.
    Simulator,
    /// A physical device attached to the host.
    Device,
    /// The host machine itself.
    LocalMac,
}

impl fmt::Display for TargetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Simulator => "simulator",
            Self::Device => "device",
            Self::LocalMac => "local-mac",
        };
        write!(f, "{s}")
    }
}

/// A capability tag indicating a family of commands a target supports.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TargetCapability {
    /// Boot and shutdown.
    Lifecycle,
    /// Install, list and uninstall applications.
    Applications,
    /// Spawn and launch processes.
    ProcessSpawn,
    /// Tail system and process logs.
    LogTail,
    /// Take screenshots.
    Screenshot,
    /// Record and stream video.
    Video,
    /// Run XCTest bundles.
    Xctest,
    /// Query and subscribe to crash logs.
    CrashLogs,
    /// Synthesize HID events.
    Hid,
    /// Open URLs on the target.
    OpenUrl,
    /// Record instruments-style traces.
    Instruments,
    /// Expose diagnostic files.
    Diagnostics,
}

/// A serializable description of one attached target.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct TargetDescription {
    /// The stable unique identifier of the target.
    pub udid: String,

    /// The user-visible name of the target.
    pub name: String,

    /// The current lifecycle state.
    pub state: TargetState,

    /// Whether this is a simulator, device or the local machine.
    pub kind: TargetKind,

    /// The OS version string, e.g. `iOS 17.4`.
    pub os_version: String,

    /// The architecture of the target, e.g. `arm64`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub architecture: Option<String>,

    /// The command families this target supports.
    pub capabilities: BTreeSet<TargetCapability>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn boot_path_never_skips_booting() {
        assert!(TargetState::Shutdown.can_transition_to(TargetState::Booting));
        assert!(TargetState::Booting.can_transition_to(TargetState::Booted));
        assert!(!TargetState::Shutdown.can_transition_to(TargetState::Booted));
    }

    #[test]
    fn shutdown_path() {
        assert!(TargetState::Booted.can_transition_to(TargetState::ShuttingDown));
        assert!(TargetState::ShuttingDown.can_transition_to(TargetState::Shutdown));
        assert!(!TargetState::Booted.can_transition_to(TargetState::Shutdown));
        assert!(!TargetState::Booted.can_transition_to(TargetState::Booting));
    }

    #[test]
    fn unknown_is_always_reachable() {
        for state in [
            TargetState::Creating,
            TargetState::Booted,
            TargetState::Dfu,
        ] {
            assert!(state.can_transition_to(TargetState::Unknown));
            assert!(TargetState::Unknown.can_transition_to(state));
        }
    }
}

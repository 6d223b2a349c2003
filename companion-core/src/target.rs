// Copyright (c) The ios-companion Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Target handles and lifecycle tracking.
//!
//! A target is one attached simulator or device. The concrete boot/shutdown
//! machinery lives in host-specific bindings outside this crate; the core
//! sees a [`Target`] trait for identity and state, and a
//! [`TargetStateTracker`] that validates lifecycle transitions and fans
//! state changes out to observers.

use crate::errors::{CompanionError, TargetLifecycleError};
use camino::Utf8Path;
use companion_metadata::{TargetCapability, TargetDescription, TargetState};
use tokio::sync::watch;
use tokio_stream::wrappers::WatchStream;
use tracing::debug;

/// An abstract handle identifying one simulator or device.
///
/// Implementations are supplied by the host bindings; all state mutation
/// goes through the lifecycle component that owns the tracker.
pub trait Target: Send + Sync + 'static {
    /// The current description of the target.
    fn description(&self) -> TargetDescription;

    /// The stable unique identifier.
    fn udid(&self) -> &str;

    /// The current lifecycle state.
    fn state(&self) -> TargetState;

    /// A stream of state changes, starting with the current state.
    fn state_updates(&self) -> WatchStream<TargetState>;

    /// The per-target working directory for run artifacts.
    fn working_directory(&self) -> &Utf8Path;

    /// True if the target advertises the given capability.
    fn supports(&self, capability: TargetCapability) -> bool {
        self.description().capabilities.contains(&capability)
    }

    /// Fails unless the target is booted.
    fn require_booted(&self) -> Result<(), CompanionError> {
        let state = self.state();
        if state == TargetState::Booted {
            Ok(())
        } else {
            Err(TargetLifecycleError::NotBooted {
                udid: self.udid().to_owned(),
                state,
            }
            .into())
        }
    }
}

/// Owns a target's lifecycle state and validates every transition.
///
/// There is exactly one tracker per target; capability implementations
/// observe it but only the lifecycle component advances it.
#[derive(Debug)]
pub struct TargetStateTracker {
    udid: String,
    tx: watch::Sender<TargetState>,
}

impl TargetStateTracker {
    /// Creates a tracker in the given initial state.
    pub fn new(udid: impl Into<String>, initial: TargetState) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self {
            udid: udid.into(),
            tx,
        }
    }

    /// The current state.
    pub fn state(&self) -> TargetState {
        *self.tx.borrow()
    }

    /// Advances to `next`, rejecting transitions outside the legal set.
    pub fn advance(&self, next: TargetState) -> Result<(), CompanionError> {
        let current = self.state();
        if !current.can_transition_to(next) {
            return Err(TargetLifecycleError::IllegalTransition {
                from: current,
                to: next,
            }
            .into());
        }
        if current != next {
            debug!(udid = %self.udid, from = %current, to = %next, "target state change");
            // Send only fails with no receivers, which is fine.
            let _ = self.tx.send(next);
        }
        Ok(())
    }

    /// Subscribes to state changes. The stream yields the current state
    /// first, then every subsequent change.
    pub fn updates(&self) -> WatchStream<TargetState> {
        WatchStream::new(self.tx.subscribe())
    }

    /// Waits until the target reaches `wanted`.
    pub async fn wait_for(&self, wanted: TargetState) -> Result<(), CompanionError> {
        let mut rx = self.tx.subscribe();
        loop {
            if *rx.borrow_and_update() == wanted {
                return Ok(());
            }
            rx.changed().await.map_err(|_| {
                CompanionError::Precondition("target state tracker dropped".to_owned())
            })?;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_stream::StreamExt;

    #[tokio::test]
    async fn boot_sequence_is_validated() {
        let tracker = TargetStateTracker::new("UDID-1", TargetState::Shutdown);
        tracker.advance(TargetState::Booting).expect("booting");
        tracker.advance(TargetState::Booted).expect("booted");

        let err = tracker
            .advance(TargetState::Booting)
            .expect_err("booted cannot re-enter booting");
        assert!(matches!(
            err,
            CompanionError::TargetLifecycle(TargetLifecycleError::IllegalTransition { .. })
        ));
    }

    #[tokio::test]
    async fn skipping_booting_is_rejected() {
        let tracker = TargetStateTracker::new("UDID-1", TargetState::Shutdown);
        let err = tracker
            .advance(TargetState::Booted)
            .expect_err("shutdown to booted must pass through booting");
        assert!(matches!(err, CompanionError::TargetLifecycle(_)));
        assert_eq!(tracker.state(), TargetState::Shutdown);
    }

    #[tokio::test]
    async fn updates_stream_observes_changes() {
        let tracker = TargetStateTracker::new("UDID-1", TargetState::Shutdown);
        let mut updates = tracker.updates();
        assert_eq!(updates.next().await, Some(TargetState::Shutdown));
        tracker.advance(TargetState::Booting).expect("booting");
        assert_eq!(updates.next().await, Some(TargetState::Booting));
    }

    #[tokio::test]
    async fn wait_for_resolves_on_target_state() {
        let tracker = std::sync::Arc::new(TargetStateTracker::new(
            "UDID-1",
            TargetState::Shutdown,
        ));
        let waiter = {
            let tracker = std::sync::Arc::clone(&tracker);
            tokio::spawn(async move { tracker.wait_for(TargetState::Booted).await })
        };
        tracker.advance(TargetState::Booting).expect("booting");
        tracker.advance(TargetState::Booted).expect("booted");
        waiter.await.expect("join").expect("reached booted");
    }
}

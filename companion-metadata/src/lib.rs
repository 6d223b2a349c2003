// Copyright (c) The ios-companion Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Wire-format types for the iOS companion control plane.
//!
//! The companion core is driven by an outer process (gRPC server or CLI
//! front-end) that needs a stable, serializable view of long-running
//! operations: test-run deltas, target descriptions and process exit values.
//! This crate contains those types and nothing else, so the outer process
//! can depend on it without pulling in the control plane itself.

mod crash;
mod process;
mod target;
mod test_run;

pub use crash::*;
pub use process::*;
pub use target::*;
pub use test_run::*;

// Copyright (c) The ios-companion Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The control-plane core of the iOS automation companion.
//!
//! A long-running process mediates between external clients and one
//! attached iOS target (simulator or physical device): application
//! install and launch, XCTest execution, media streaming, crash-log
//! capture and file transfer. This crate is the core of that process.
//! The outer surfaces (gRPC wiring, argv parsing, configuration files)
//! live elsewhere and drive this crate through the
//! [`CommandForwarder`](commands::CommandForwarder).
//!
//! Module map, leaves first:
//!
//! - [`fut`] — the observable future, scoped contexts, resource manager
//! - [`consumer`] / [`logger`] — byte sinks and the consumer-backed logger
//! - [`session`] — the delta-update session manager
//! - [`crashlog`] — crash parsing, storage, directory watching
//! - [`video`] — frames, encoders, streams, MP4 writing
//! - [`xctest`] — bundle prep, daemon channels, run strategy, reporters
//! - [`commands`] / [`target`] / [`process`] / [`hid`] — routing and the
//!   target-facing contracts

pub mod commands;
pub mod consumer;
pub mod crashlog;
pub mod errors;
pub mod fut;
pub mod hid;
pub mod logger;
pub mod process;
pub mod session;
pub mod target;
pub mod video;
pub mod xctest;

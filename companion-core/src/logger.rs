// Copyright (c) The ios-companion Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! A leveled, hierarchically-named logger over a [`DataConsumer`].
//!
//! Components receive a `Logger` and derive prefixed children with
//! [`Logger::named`], so a line reads `[xctest.channel] message`. Every line
//! is also mirrored into `tracing` so ambient subscribers see the same
//! stream.

use crate::consumer::{DataConsumer, NullConsumer};
use bytes::Bytes;
use std::{fmt, sync::Arc};

/// Log severity, lowest to highest.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub enum LogLevel {
    /// Diagnostic detail.
    Debug,
    /// Routine progress.
    Info,
    /// Something unexpected but recoverable.
    Warn,
    /// A failure.
    Error,
}

/// A named logger writing through a byte consumer.
#[derive(Clone)]
pub struct Logger {
    name: Arc<str>,
    level: LogLevel,
    sink: Arc<dyn DataConsumer>,
}

impl Logger {
    /// Creates a root logger writing to `sink` at the given minimum level.
    pub fn new(sink: Arc<dyn DataConsumer>, level: LogLevel) -> Self {
        Self {
            name: Arc::from(""),
            level,
            sink,
        }
    }

    /// A logger that discards everything. Useful in tests.
    pub fn null() -> Self {
        Self::new(NullConsumer::new(), LogLevel::Error)
    }

    /// Derives a child logger whose name extends this one's.
    pub fn named(&self, suffix: &str) -> Self {
        let name: Arc<str> = if self.name.is_empty() {
            Arc::from(suffix)
        } else {
            Arc::from(format!("{}.{suffix}", self.name))
        };
        Self {
            name,
            level: self.level,
            sink: Arc::clone(&self.sink),
        }
    }

    /// The logger's hierarchical name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Logs at debug level.
    pub fn debug(&self, message: impl fmt::Display) {
        self.log(LogLevel::Debug, message);
    }

    /// Logs at info level.
    pub fn info(&self, message: impl fmt::Display) {
        self.log(LogLevel::Info, message);
    }

    /// Logs at warn level.
    pub fn warn(&self, message: impl fmt::Display) {
        self.log(LogLevel::Warn, message);
    }

    /// Logs at error level.
    pub fn error(&self, message: impl fmt::Display) {
        self.log(LogLevel::Error, message);
    }

    fn log(&self, level: LogLevel, message: impl fmt::Display) {
        match level {
            LogLevel::Debug => tracing::debug!(logger = %self.name, "{message}"),
            LogLevel::Info => tracing::info!(logger = %self.name, "{message}"),
            LogLevel::Warn => tracing::warn!(logger = %self.name, "{message}"),
            LogLevel::Error => tracing::error!(logger = %self.name, "{message}"),
        }
        if level < self.level {
            return;
        }
        let line = if self.name.is_empty() {
            format!("{message}\n")
        } else {
            format!("[{}] {message}\n", self.name)
        };
        // A closed sink is not a logging failure worth surfacing.
        let _ = self.sink.consume(Bytes::from(line));
    }
}

impl fmt::Debug for Logger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Logger")
            .field("name", &self.name)
            .field("level", &self.level)
            .finish_non_exhaustive()
    }
}

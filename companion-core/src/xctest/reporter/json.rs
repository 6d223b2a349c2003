// Copyright (c) The ios-companion Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The streaming JSON reporter: one JSON object per line, written through
//! a byte consumer as events arrive.

use crate::{
    consumer::DataConsumer,
    errors::CompanionError,
    xctest::reporter::{TestRunEvent, XCTestReporter},
};
use bytes::Bytes;
use std::sync::Arc;
use tracing::warn;

/// Streams each event as one line of JSON.
pub struct JsonStreamReporter {
    sink: Arc<dyn DataConsumer>,
    pretty: bool,
}

impl JsonStreamReporter {
    /// Creates a reporter writing compact JSON lines into `sink`.
    pub fn new(sink: Arc<dyn DataConsumer>) -> Self {
        Self {
            sink,
            pretty: false,
        }
    }

    /// Switches to pretty-printed objects. Only for human consumption;
    /// machine readers expect one object per line.
    pub fn pretty(mut self) -> Self {
        self.pretty = true;
        self
    }
}

impl XCTestReporter for JsonStreamReporter {
    fn handle_event(&self, event: &TestRunEvent) {
        let serialized = if self.pretty {
            serde_json::to_string_pretty(event)
        } else {
            serde_json::to_string(event)
        };
        match serialized {
            Ok(mut line) => {
                line.push('\n');
                if let Err(err) = self.sink.consume(Bytes::from(line)) {
                    warn!("json reporter sink rejected event: {err}");
                }
            }
            Err(err) => {
                warn!("unserializable reporter event: {err}");
            }
        }
    }

    fn finish(&self) -> Result<(), CompanionError> {
        self.sink.end_of_file()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        consumer::FnConsumer,
        xctest::reporter::{CaseStatus, TestRunEventKind},
    };
    use std::{sync::Mutex, time::Duration};

    #[test]
    fn events_stream_as_json_lines() {
        let lines = Arc::new(Mutex::new(String::new()));
        let sink = {
            let lines = Arc::clone(&lines);
            FnConsumer::new(move |chunk| {
                lines
                    .lock()
                    .expect("lock")
                    .push_str(&String::from_utf8_lossy(&chunk));
            })
        };
        let reporter = JsonStreamReporter::new(sink);
        reporter.handle_event(&TestRunEvent::now(TestRunEventKind::PlanStarted));
        reporter.handle_event(&TestRunEvent::now(TestRunEventKind::CaseFinished {
            class_name: "MyTests".to_owned(),
            method_name: "testA".to_owned(),
            status: CaseStatus::Passed,
            duration: Duration::from_millis(5),
        }));
        reporter.finish().expect("finish");

        let contents = lines.lock().expect("lock").clone();
        let parsed: Vec<serde_json::Value> = contents
            .lines()
            .map(|line| serde_json::from_str(line).expect("each line is JSON"))
            .collect();
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0]["event"], "plan-started");
        assert_eq!(parsed[1]["method-name"], "testA");
    }
}

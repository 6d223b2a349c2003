// Copyright (c) The ios-companion Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Crash-report parsers.
//!
//! Two formats exist in the wild: the modern `.ips` layout, which is two
//! adjacent JSON objects (metadata then content), and the legacy plain-text
//! layout with positional field tags. Detection tries JSON first and falls
//! back to plain text.
//!
//! The JSON layout has changed under us before, so the JSON parser does not
//! assume where a field lives: it searches every object in both documents
//! for the keys it needs. Crash parsing is rare enough that reliability is
//! worth more than the wasted walk.

use crate::errors::CrashLogError;
use chrono::{DateTime, NaiveDateTime, Utc};
use companion_metadata::CrashLogInfo;
use serde_json::Value;

/// A parsed crash report plus its raw text.
#[derive(Clone, Debug, PartialEq)]
pub struct CrashLog {
    /// The extracted fields.
    pub info: CrashLogInfo,
    /// The report exactly as read from disk.
    pub raw: String,
}

/// Parses a crash report, trying concatenated-JSON then plain text.
pub fn parse_crash_log(contents: &str) -> Result<CrashLog, CrashLogError> {
    match parse_concatenated_json(contents) {
        Ok(info) => Ok(CrashLog {
            info,
            raw: contents.to_owned(),
        }),
        Err(_) => {
            let info = parse_plain_text(contents)?;
            Ok(CrashLog {
                info,
                raw: contents.to_owned(),
            })
        }
    }
}

/// Parses the two-adjacent-JSON-objects `.ips` layout.
pub fn parse_concatenated_json(contents: &str) -> Result<CrashLogInfo, CrashLogError> {
    let documents: Vec<Value> = serde_json::Deserializer::from_str(contents)
        .into_iter::<Value>()
        .collect::<Result<_, _>>()
        .map_err(|err| CrashLogError::ParseFailed(format!("invalid JSON: {err}")))?;
    if documents.is_empty() {
        return Err(CrashLogError::ParseFailed("no JSON documents".to_owned()));
    }

    let find_string = |keys: &[&str]| -> Option<String> {
        documents
            .iter()
            .find_map(|doc| find_key(doc, keys))
            .and_then(|v| match v {
                Value::String(s) => Some(s.clone()),
                Value::Number(n) => Some(n.to_string()),
                _ => None,
            })
    };
    let find_u32 = |keys: &[&str]| -> Option<u32> {
        documents
            .iter()
            .find_map(|doc| find_key(doc, keys))
            .and_then(|v| match v {
                Value::Number(n) => n.as_u64().and_then(|n| u32::try_from(n).ok()),
                Value::String(s) => s.parse().ok(),
                _ => None,
            })
    };

    let process_name = find_string(&["procName", "processName", "app_name"])
        .ok_or(CrashLogError::MissingField("procName"))?;
    let process_identifier = find_u32(&["pid"]).ok_or(CrashLogError::MissingField("pid"))?;
    let parent_process_name =
        find_string(&["parentProc"]).ok_or(CrashLogError::MissingField("parentProc"))?;
    let parent_process_identifier =
        find_u32(&["parentPid"]).ok_or(CrashLogError::MissingField("parentPid"))?;
    let executable_path =
        find_string(&["procPath"]).ok_or(CrashLogError::MissingField("procPath"))?;
    let date = find_string(&["captureTime", "timestamp", "date"])
        .and_then(|s| parse_crash_date(&s))
        .ok_or(CrashLogError::MissingField("captureTime"))?;

    let exception_description = documents
        .iter()
        .find_map(|doc| find_key(doc, &["exception"]))
        .map(describe_exception);
    let crashed_thread_description = documents
        .iter()
        .find_map(|doc| find_key(doc, &["faultingThread"]))
        .and_then(Value::as_u64)
        .map(|thread| format!("Crashed Thread: {thread}"));

    let identifier =
        find_string(&["identifier", "coalitionName", "bundleID"]).unwrap_or_else(|| {
            format!("{process_name}-{process_identifier}")
        });

    Ok(CrashLogInfo {
        identifier,
        process_name,
        process_identifier,
        parent_process_name,
        parent_process_identifier,
        executable_path,
        date,
        exception_description,
        crashed_thread_description,
    })
}

/// Walks a JSON document for the first value under any of `keys`.
fn find_key<'a>(value: &'a Value, keys: &[&str]) -> Option<&'a Value> {
    match value {
        Value::Object(map) => {
            for key in keys {
                if let Some(found) = map.get(*key) {
                    return Some(found);
                }
            }
            map.values().find_map(|v| find_key(v, keys))
        }
        Value::Array(items) => items.iter().find_map(|v| find_key(v, keys)),
        _ => None,
    }
}

fn describe_exception(exception: &Value) -> String {
    let ty = exception
        .get("type")
        .and_then(Value::as_str)
        .unwrap_or("UNKNOWN");
    let signal = exception.get("signal").and_then(Value::as_str);
    let subtype = exception.get("subtype").and_then(Value::as_str);
    let mut description = ty.to_owned();
    if let Some(signal) = signal {
        description.push_str(&format!(" ({signal})"));
    }
    if let Some(subtype) = subtype {
        description.push_str(&format!(": {subtype}"));
    }
    description
}

/// Parses the legacy plain-text crash layout by positional field tags.
pub fn parse_plain_text(contents: &str) -> Result<CrashLogInfo, CrashLogError> {
    let field = |tag: &str| -> Option<&str> {
        contents.lines().find_map(|line| {
            line.strip_prefix(tag)
                .map(|rest| rest.trim_start_matches([' ', '\t']).trim_end())
        })
    };

    let (process_name, process_identifier) = field("Process:")
        .and_then(split_name_and_pid)
        .ok_or(CrashLogError::MissingField("Process"))?;
    let (parent_process_name, parent_process_identifier) = field("Parent Process:")
        .and_then(split_name_and_pid)
        .ok_or(CrashLogError::MissingField("Parent Process"))?;
    let executable_path = field("Path:")
        .map(str::to_owned)
        .ok_or(CrashLogError::MissingField("Path"))?;
    let identifier = field("Identifier:")
        .map(str::to_owned)
        .ok_or(CrashLogError::MissingField("Identifier"))?;
    let date = field("Date/Time:")
        .and_then(parse_crash_date)
        .ok_or(CrashLogError::MissingField("Date/Time"))?;
    let exception_description = field("Exception Type:").map(str::to_owned);
    let crashed_thread_description = field("Crashed Thread:")
        .map(|thread| format!("Crashed Thread: {thread}"));

    Ok(CrashLogInfo {
        identifier,
        process_name,
        process_identifier,
        parent_process_name,
        parent_process_identifier,
        executable_path,
        date,
        exception_description,
        crashed_thread_description,
    })
}

/// Splits `Name [123]` into the name and pid.
fn split_name_and_pid(value: &str) -> Option<(String, u32)> {
    let open = value.rfind('[')?;
    let close = value.rfind(']')?;
    let pid = value.get(open + 1..close)?.trim().parse().ok()?;
    Some((value[..open].trim().to_owned(), pid))
}

fn parse_crash_date(value: &str) -> Option<DateTime<Utc>> {
    // Numeric epoch seconds first.
    if let Ok(epoch) = value.parse::<f64>() {
        return DateTime::from_timestamp(epoch as i64, 0);
    }
    if let Ok(parsed) = DateTime::parse_from_rfc3339(value) {
        return Some(parsed.with_timezone(&Utc));
    }
    // The report formats seen in practice, with and without sub-seconds and
    // zone offsets.
    const FORMATS: &[&str] = &[
        "%Y-%m-%d %H:%M:%S%.f %z",
        "%Y-%m-%d %H:%M:%S %z",
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%d %H:%M:%S",
    ];
    for format in FORMATS {
        if let Ok(parsed) = DateTime::parse_from_str(value, format) {
            return Some(parsed.with_timezone(&Utc));
        }
        if let Ok(parsed) = NaiveDateTime::parse_from_str(value, format) {
            return Some(parsed.and_utc());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const PLAIN_TEXT: &str = "\
Process:               MyApp [1234]
Path:                  /Applications/MyApp.app/MyApp
Identifier:            com.example.MyApp
Version:               1.0 (1)
Parent Process:        launchd_sim [987]

Date/Time:             2024-03-01 12:30:45.123 +0000
OS Version:            iOS 17.0

Exception Type:        EXC_BAD_ACCESS (SIGSEGV)
Crashed Thread:        0  Dispatch queue: com.apple.main-thread

Thread 0 Crashed:
0   MyApp    0x0000000100000000 main + 0
";

    const CONCATENATED_JSON: &str = r#"{"app_name":"MyApp","timestamp":"2024-03-01 12:30:45.00 +0000","bug_type":"309"}
{"procName":"MyApp","pid":1234,"parentProc":"launchd_sim","parentPid":987,"procPath":"/Applications/MyApp.app/MyApp","captureTime":"2024-03-01 12:30:45.1234 +0000","bundleID":"com.example.MyApp","exception":{"type":"EXC_BAD_ACCESS","signal":"SIGSEGV","subtype":"KERN_INVALID_ADDRESS"},"faultingThread":0}"#;

    #[test]
    fn plain_text_extracts_positional_fields() {
        let info = parse_plain_text(PLAIN_TEXT).expect("parses");
        assert_eq!(info.process_name, "MyApp");
        assert_eq!(info.process_identifier, 1234);
        assert_eq!(info.parent_process_name, "launchd_sim");
        assert_eq!(info.parent_process_identifier, 987);
        assert_eq!(info.executable_path, "/Applications/MyApp.app/MyApp");
        assert_eq!(info.identifier, "com.example.MyApp");
        assert_eq!(
            info.exception_description.as_deref(),
            Some("EXC_BAD_ACCESS (SIGSEGV)")
        );
        assert!(
            info.crashed_thread_description
                .as_deref()
                .expect("thread")
                .starts_with("Crashed Thread: 0")
        );
    }

    #[test]
    fn plain_text_fields_survive_serialization() {
        // Parsing, serialising the extracted fields, and parsing the
        // serialised form back yields the same extraction.
        let first = parse_plain_text(PLAIN_TEXT).expect("first parse");
        let serialized = serde_json::to_value(&first).expect("fields serialize");
        let second: CrashLogInfo =
            serde_json::from_value(serialized).expect("second parse");
        assert_eq!(second.identifier, first.identifier);
        assert_eq!(second.process_identifier, first.process_identifier);
        assert_eq!(second.process_name, first.process_name);
        assert_eq!(second.date, first.date);
        assert_eq!(second.exception_description, first.exception_description);
    }

    #[test]
    fn concatenated_json_searches_both_documents() {
        let info = parse_concatenated_json(CONCATENATED_JSON).expect("parses");
        assert_eq!(info.process_name, "MyApp");
        assert_eq!(info.process_identifier, 1234);
        assert_eq!(info.parent_process_name, "launchd_sim");
        assert_eq!(info.parent_process_identifier, 987);
        assert_eq!(
            info.exception_description.as_deref(),
            Some("EXC_BAD_ACCESS (SIGSEGV): KERN_INVALID_ADDRESS")
        );
        assert_eq!(
            info.crashed_thread_description.as_deref(),
            Some("Crashed Thread: 0")
        );
        assert_eq!(info.identifier, "com.example.MyApp");
    }

    #[test]
    fn json_fields_found_when_nested() {
        // Robustness against layout changes: fields may move into nested
        // objects.
        let nested = r#"{"metadata":{"app_name":"MyApp"}}
{"wrapper":{"procName":"MyApp","pid":7,"parentProc":"launchd","parentPid":1,"procPath":"/bin/app","captureTime":"2024-01-01 00:00:00 +0000"}}"#;
        let info = parse_concatenated_json(nested).expect("parses nested layout");
        assert_eq!(info.process_identifier, 7);
        assert_eq!(info.executable_path, "/bin/app");
    }

    #[test]
    fn detection_falls_back_to_plain_text() {
        let log = parse_crash_log(PLAIN_TEXT).expect("plain text accepted");
        assert_eq!(log.info.process_name, "MyApp");
        let log = parse_crash_log(CONCATENATED_JSON).expect("json accepted");
        assert_eq!(log.info.process_name, "MyApp");
        assert!(parse_crash_log("not a crash log at all").is_err());
    }

    #[test]
    fn date_formats_accepted() {
        for value in [
            "2024-03-01 12:30:45.123 +0000",
            "2024-03-01 12:30:45 +0000",
            "2024-03-01T12:30:45Z",
            "1709296245",
        ] {
            assert!(parse_crash_date(value).is_some(), "date {value} parses");
        }
        assert!(parse_crash_date("yesterday").is_none());
    }
}

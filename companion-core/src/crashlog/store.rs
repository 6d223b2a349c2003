// Copyright (c) The ios-companion Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The in-memory crash-log store.
//!
//! The store holds parsed crash reports keyed by identifier and serves
//! predicate queries: everything matching now, everything matching now or
//! in the future (as a future), and prune. Insertion happens under the
//! store mutex; subscriber notification fans out after the lock is
//! released.

use crate::{
    crashlog::CrashLog,
    fut::{Deferred, Resolver},
    logger::Logger,
};
use chrono::{DateTime, Utc};
use companion_metadata::CrashLogInfo;
use indexmap::IndexMap;
use std::sync::{Arc, Mutex};

/// A predicate over crash logs.
#[derive(Clone, Debug)]
pub enum CrashLogPredicate {
    /// Matches every crash log.
    All,
    /// Matches an exact process name.
    ProcessName(String),
    /// Matches process names containing a substring.
    ProcessNameContains(String),
    /// Matches an exact report identifier.
    Identifier(String),
    /// Matches a process identifier.
    ProcessIdentifier(u32),
    /// Matches crashes at or after a point in time.
    Since(DateTime<Utc>),
    /// Matches only if every inner predicate matches.
    And(Vec<CrashLogPredicate>),
}

impl CrashLogPredicate {
    /// Evaluates the predicate against one crash log.
    pub fn matches(&self, info: &CrashLogInfo) -> bool {
        match self {
            Self::All => true,
            Self::ProcessName(name) => info.process_name == *name,
            Self::ProcessNameContains(fragment) => info.process_name.contains(fragment),
            Self::Identifier(identifier) => info.identifier == *identifier,
            Self::ProcessIdentifier(pid) => info.process_identifier == *pid,
            Self::Since(instant) => info.date >= *instant,
            Self::And(inner) => inner.iter().all(|p| p.matches(info)),
        }
    }
}

struct Subscriber {
    predicate: CrashLogPredicate,
    resolver: Resolver<CrashLog>,
}

struct StoreInner {
    logs: IndexMap<String, CrashLog>,
    subscribers: Vec<Subscriber>,
}

/// An in-memory map of crash logs with predicate subscriptions.
#[derive(Clone)]
pub struct CrashLogStore {
    inner: Arc<Mutex<StoreInner>>,
    logger: Logger,
}

impl CrashLogStore {
    /// Creates an empty store.
    pub fn new(logger: Logger) -> Self {
        Self {
            inner: Arc::new(Mutex::new(StoreInner {
                logs: IndexMap::new(),
                subscribers: Vec::new(),
            })),
            logger: logger.named("crash-store"),
        }
    }

    /// Inserts a crash log, waking any matching subscribers.
    ///
    /// A log whose identifier is already present is ignored; directory
    /// rescans routinely revisit files.
    pub fn ingest(&self, log: CrashLog) {
        let matched: Vec<(Resolver<CrashLog>, CrashLog)> = {
            let mut inner = self.inner.lock().expect("crash store lock poisoned");
            if inner.logs.contains_key(&log.info.identifier) {
                return;
            }
            self.logger
                .debug(format!("ingested crash log {}", log.info.identifier));
            inner.logs.insert(log.info.identifier.clone(), log.clone());
            let mut matched = Vec::new();
            let mut remaining = Vec::new();
            for subscriber in inner.subscribers.drain(..) {
                if subscriber.predicate.matches(&log.info) {
                    matched.push((subscriber.resolver, log.clone()));
                } else {
                    remaining.push(subscriber);
                }
            }
            inner.subscribers = remaining;
            matched
        };
        // Notification fans out off-lock.
        for (resolver, log) in matched {
            resolver.resolve(log);
        }
    }

    /// All currently-stored crash logs matching the predicate.
    pub fn crashes(&self, predicate: &CrashLogPredicate) -> Vec<CrashLog> {
        let inner = self.inner.lock().expect("crash store lock poisoned");
        inner
            .logs
            .values()
            .filter(|log| predicate.matches(&log.info))
            .cloned()
            .collect()
    }

    /// Fetches one crash log by identifier.
    pub fn crash_log(&self, identifier: &str) -> Option<CrashLog> {
        let inner = self.inner.lock().expect("crash store lock poisoned");
        inner.logs.get(identifier).cloned()
    }

    /// Resolves with the first crash log matching the predicate: an
    /// already-stored one if any, otherwise the first future ingest that
    /// matches.
    pub fn next_crash_log(&self, predicate: CrashLogPredicate) -> Deferred<CrashLog> {
        let mut inner = self.inner.lock().expect("crash store lock poisoned");
        if let Some(existing) = inner
            .logs
            .values()
            .find(|log| predicate.matches(&log.info))
        {
            return Deferred::resolved(existing.clone());
        }
        let (resolver, future) = Deferred::new();
        inner.subscribers.push(Subscriber {
            predicate,
            resolver,
        });
        future
    }

    /// Removes and returns every stored crash log matching the predicate.
    pub fn prune(&self, predicate: &CrashLogPredicate) -> Vec<CrashLog> {
        let mut inner = self.inner.lock().expect("crash store lock poisoned");
        let (pruned, kept): (Vec<_>, Vec<_>) = inner
            .logs
            .drain(..)
            .partition(|(_, log)| predicate.matches(&log.info));
        inner.logs = kept.into_iter().collect();
        pruned.into_iter().map(|(_, log)| log).collect()
    }

    /// The number of stored crash logs.
    pub fn len(&self) -> usize {
        self.inner.lock().expect("crash store lock poisoned").logs.len()
    }

    /// True if the store holds no crash logs.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn sample(identifier: &str, process_name: &str, pid: u32) -> CrashLog {
        CrashLog {
            info: CrashLogInfo {
                identifier: identifier.to_owned(),
                process_name: process_name.to_owned(),
                process_identifier: pid,
                parent_process_name: "launchd_sim".to_owned(),
                parent_process_identifier: 1,
                executable_path: format!("/apps/{process_name}"),
                date: Utc::now(),
                exception_description: None,
                crashed_thread_description: None,
            },
            raw: String::new(),
        }
    }

    #[tokio::test]
    async fn next_crash_log_resolves_with_existing() {
        let store = CrashLogStore::new(Logger::null());
        store.ingest(sample("a", "MyApp", 10));
        let log = store
            .next_crash_log(CrashLogPredicate::ProcessName("MyApp".to_owned()))
            .value()
            .await
            .expect("existing log");
        assert_eq!(log.info.identifier, "a");
    }

    #[tokio::test]
    async fn next_crash_log_resolves_with_future_ingest() {
        let store = CrashLogStore::new(Logger::null());
        let pending = store.next_crash_log(CrashLogPredicate::ProcessName("MyApp".to_owned()));
        assert!(!pending.is_done());

        store.ingest(sample("other", "OtherApp", 11));
        assert!(!pending.is_done(), "non-matching ingest does not resolve");

        store.ingest(sample("mine", "MyApp", 12));
        let log = pending.value().await.expect("future log");
        assert_eq!(log.info.identifier, "mine");
    }

    #[tokio::test]
    async fn duplicate_identifiers_are_ignored() {
        let store = CrashLogStore::new(Logger::null());
        store.ingest(sample("a", "MyApp", 10));
        store.ingest(sample("a", "MyApp", 99));
        let logs = store.crashes(&CrashLogPredicate::All);
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].info.process_identifier, 10);
    }

    #[tokio::test]
    async fn prune_removes_and_returns_matches() {
        let store = CrashLogStore::new(Logger::null());
        store.ingest(sample("a", "MyApp", 10));
        store.ingest(sample("b", "OtherApp", 11));
        store.ingest(sample("c", "MyApp", 12));

        let pruned = store.prune(&CrashLogPredicate::ProcessName("MyApp".to_owned()));
        assert_eq!(pruned.len(), 2);
        assert_eq!(store.len(), 1);
        assert!(store.crash_log("b").is_some());
        assert!(store.crash_log("a").is_none());
    }

    #[test]
    fn compound_predicates() {
        let log = sample("a", "MyApp", 10);
        let and = CrashLogPredicate::And(vec![
            CrashLogPredicate::ProcessName("MyApp".to_owned()),
            CrashLogPredicate::ProcessIdentifier(10),
        ]);
        assert!(and.matches(&log.info));
        let and_miss = CrashLogPredicate::And(vec![
            CrashLogPredicate::ProcessName("MyApp".to_owned()),
            CrashLogPredicate::ProcessIdentifier(11),
        ]);
        assert!(!and_miss.matches(&log.info));
        assert!(
            CrashLogPredicate::ProcessNameContains("yAp".to_owned()).matches(&log.info)
        );
    }
}

// Copyright (c) The ios-companion Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The crash-report directory watcher.
//!
//! Watches one or more crash-report directories and feeds every new or
//! changed report into a [`CrashLogStore`]. One notifier exists per
//! process; components that need crash notifications receive the store (or
//! the notifier) explicitly rather than reaching for a global.

use crate::{
    crashlog::{CrashLogStore, parse_crash_log},
    errors::{CompanionError, CrashLogError},
    logger::Logger,
};
use camino::{Utf8Path, Utf8PathBuf};
use notify::{Event, EventKind, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tracing::debug;

/// File extensions that hold crash reports.
const CRASH_EXTENSIONS: &[&str] = &["ips", "crash"];

/// Watches crash-report directories and populates a store.
pub struct CrashLogNotifier {
    store: CrashLogStore,
    logger: Logger,
    // Dropping the watcher stops the native watch.
    watcher: notify::RecommendedWatcher,
    task: tokio::task::JoinHandle<()>,
}

impl CrashLogNotifier {
    /// Starts watching the given directories, ingesting existing reports
    /// first.
    pub async fn start(
        store: CrashLogStore,
        directories: Vec<Utf8PathBuf>,
        logger: Logger,
    ) -> Result<Self, CompanionError> {
        let logger = logger.named("crash-notifier");
        let (tx, rx) = mpsc::unbounded_channel::<Utf8PathBuf>();

        let mut watcher = notify::recommended_watcher({
            let tx = tx.clone();
            move |event: Result<Event, notify::Error>| {
                let Ok(event) = event else {
                    return;
                };
                if !matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_)) {
                    return;
                }
                for path in event.paths {
                    if let Ok(path) = Utf8PathBuf::from_path_buf(path) {
                        let _ = tx.send(path);
                    }
                }
            }
        })
        .map_err(|err| CrashLogError::WatchFailed(err.to_string()))?;

        for directory in &directories {
            watcher
                .watch(directory.as_std_path(), RecursiveMode::NonRecursive)
                .map_err(|err| CrashLogError::WatchFailed(err.to_string()))?;
        }

        let task = tokio::spawn(ingest_loop(store.clone(), rx, logger.clone()));
        let notifier = Self {
            store,
            logger,
            watcher,
            task,
        };

        // Reports written before the watch began still count.
        for directory in &directories {
            notifier.rescan(directory).await?;
        }
        Ok(notifier)
    }

    /// The store this notifier feeds.
    pub fn store(&self) -> &CrashLogStore {
        &self.store
    }

    /// Enumerates a directory and ingests every crash report in it.
    pub async fn rescan(&self, directory: &Utf8Path) -> Result<(), CompanionError> {
        let mut entries = tokio::fs::read_dir(directory)
            .await
            .map_err(|error| CompanionError::io_at(directory.to_owned(), error))?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|error| CompanionError::io_at(directory.to_owned(), error))?
        {
            if let Ok(path) = Utf8PathBuf::from_path_buf(entry.path()) {
                ingest_file(&self.store, &path, &self.logger).await;
            }
        }
        Ok(())
    }

    /// Stops the watcher and its ingest task.
    pub fn stop(self) {
        drop(self.watcher);
        self.task.abort();
    }
}

async fn ingest_loop(
    store: CrashLogStore,
    mut rx: mpsc::UnboundedReceiver<Utf8PathBuf>,
    logger: Logger,
) {
    while let Some(path) = rx.recv().await {
        ingest_file(&store, &path, &logger).await;
    }
}

async fn ingest_file(store: &CrashLogStore, path: &Utf8Path, logger: &Logger) {
    let is_crash_report = path
        .extension()
        .is_some_and(|ext| CRASH_EXTENSIONS.contains(&ext));
    if !is_crash_report {
        return;
    }
    let contents = match tokio::fs::read_to_string(path).await {
        Ok(contents) => contents,
        Err(err) => {
            logger.debug(format!("could not read `{path}`: {err}"));
            return;
        }
    };
    match parse_crash_log(&contents) {
        Ok(mut log) => {
            // The file stem is the canonical identifier: it is unique in
            // the report directory even when an app crashes repeatedly.
            if let Some(stem) = path.file_stem() {
                log.info.identifier = stem.to_owned();
            }
            debug!(identifier = %log.info.identifier, "crash report ingested");
            store.ingest(log);
        }
        Err(err) => {
            logger.warn(format!("unparseable crash report `{path}`: {err}"));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crashlog::CrashLogPredicate;
    use std::time::Duration;

    const REPORT: &str = "\
Process:               MyApp [1234]
Path:                  /Applications/MyApp.app/MyApp
Identifier:            com.example.MyApp
Parent Process:        launchd_sim [987]
Date/Time:             2024-03-01 12:30:45 +0000
Exception Type:        EXC_CRASH (SIGABRT)
Crashed Thread:        2
";

    #[tokio::test]
    async fn existing_reports_are_ingested_on_start() {
        let dir = camino_tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("existing.crash");
        tokio::fs::write(&path, REPORT).await.expect("write");

        let notifier = CrashLogNotifier::start(
            CrashLogStore::new(Logger::null()),
            vec![dir.path().to_owned()],
            Logger::null(),
        )
        .await
        .expect("start");

        let logs = notifier.store().crashes(&CrashLogPredicate::All);
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].info.identifier, "existing");
        notifier.stop();
    }

    #[tokio::test]
    async fn future_report_resolves_pending_predicate() {
        let dir = camino_tempfile::tempdir().expect("tempdir");
        let notifier = CrashLogNotifier::start(
            CrashLogStore::new(Logger::null()),
            vec![dir.path().to_owned()],
            Logger::null(),
        )
        .await
        .expect("start");

        let pending = notifier
            .store()
            .next_crash_log(CrashLogPredicate::ProcessName("MyApp".to_owned()));

        tokio::fs::write(dir.path().join("fresh.ips.crash"), REPORT)
            .await
            .expect("write");

        let log = pending
            .value_with_deadline(Duration::from_secs(5))
            .await
            .expect("crash arrives within the watch latency bound");
        assert_eq!(log.info.process_name, "MyApp");
        notifier.stop();
    }

    #[tokio::test]
    async fn non_crash_files_are_ignored() {
        let dir = camino_tempfile::tempdir().expect("tempdir");
        tokio::fs::write(dir.path().join("notes.txt"), "hello")
            .await
            .expect("write");
        let notifier = CrashLogNotifier::start(
            CrashLogStore::new(Logger::null()),
            vec![dir.path().to_owned()],
            Logger::null(),
        )
        .await
        .expect("start");
        assert!(notifier.store().is_empty());
        notifier.stop();
    }
}

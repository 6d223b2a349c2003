// Copyright (c) The ios-companion Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Test-bundle preparation.
//!
//! Stages a run's working directory: copies the test bundle in, writes the
//! configuration artifact, locates the host application for app/UI tests
//! and checks its signature against the target's policy.

use crate::{
    errors::{CompanionError, PrepareError},
    fut::Deferred,
    xctest::config::{TestLaunchConfiguration, build_runner_environment, ShimConfiguration},
};
use camino::{Utf8Path, Utf8PathBuf};
use std::collections::BTreeMap;
use tracing::debug;

/// The outcome of verifying a bundle's code signature.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CodesignStatus {
    /// A full, valid signature.
    Valid,
    /// An ad-hoc signature.
    AdHoc,
    /// No signature or a broken one.
    Invalid,
}

/// What signatures a target accepts.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CodesignPolicy {
    /// Physical devices require a full signature.
    RequireValid,
    /// Simulators accept ad-hoc signatures.
    AcceptAdHoc,
}

impl CodesignPolicy {
    /// Whether a status satisfies this policy.
    pub fn accepts(self, status: CodesignStatus) -> bool {
        match self {
            Self::RequireValid => status == CodesignStatus::Valid,
            Self::AcceptAdHoc => {
                matches!(status, CodesignStatus::Valid | CodesignStatus::AdHoc)
            }
        }
    }
}

/// Verifies and applies code signatures; implemented by the host bindings.
pub trait Codesigner: Send + Sync + 'static {
    /// Reports the signature status of a bundle.
    fn verify(&self, path: &Utf8Path) -> Deferred<CodesignStatus>;

    /// Applies an ad-hoc signature to a bundle.
    fn adhoc_sign(&self, path: &Utf8Path) -> Deferred<()>;
}

/// A codesigner that reports everything as ad-hoc signed. Suitable for
/// simulator targets where the kernel does not enforce signatures.
pub struct AdHocCodesigner;

impl Codesigner for AdHocCodesigner {
    fn verify(&self, _path: &Utf8Path) -> Deferred<CodesignStatus> {
        Deferred::resolved(CodesignStatus::AdHoc)
    }

    fn adhoc_sign(&self, _path: &Utf8Path) -> Deferred<()> {
        Deferred::resolved(())
    }
}

/// A fully staged test run on disk.
#[derive(Clone, Debug)]
pub struct PreparedTestRun {
    /// The per-run working directory.
    pub working_directory: Utf8PathBuf,
    /// The staged copy of the test bundle.
    pub bundle_path: Utf8PathBuf,
    /// The configuration artifact.
    pub artifact_path: Utf8PathBuf,
    /// The host application, for app/UI tests.
    pub host_application: Option<Utf8PathBuf>,
    /// The synthesized runner environment.
    pub runner_environment: BTreeMap<String, String>,
    /// Where the result bundle will be collected, if requested.
    pub result_bundle_path: Option<Utf8PathBuf>,
    /// Where the coverage profile will be written, if requested.
    pub coverage_path: Option<Utf8PathBuf>,
}

/// Stages the working directory for a run.
pub async fn prepare_test_run(
    launch: &TestLaunchConfiguration,
    working_directory: &Utf8Path,
    shims: &ShimConfiguration,
    codesigner: &dyn Codesigner,
    policy: CodesignPolicy,
) -> Result<PreparedTestRun, CompanionError> {
    let config = &launch.config;
    if !config.test_bundle_path.exists() {
        return Err(PrepareError::MissingTestBundle(config.test_bundle_path.clone()).into());
    }

    tokio::fs::create_dir_all(working_directory)
        .await
        .map_err(|error| CompanionError::io_at(working_directory.to_owned(), error))?;

    // Stage the bundle copy.
    let bundle_name = config
        .test_bundle_path
        .file_name()
        .ok_or_else(|| PrepareError::MissingTestBundle(config.test_bundle_path.clone()))?;
    let bundle_path = working_directory.join(bundle_name);
    copy_recursively(&config.test_bundle_path, &bundle_path).await?;
    debug!(from = %config.test_bundle_path, to = %bundle_path, "staged test bundle");

    // The host app stays in place; only its signature is checked.
    let host_application = match &config.test_host_path {
        Some(host) => {
            if !host.exists() {
                return Err(PrepareError::MissingHostApplication(host.clone()).into());
            }
            let status = codesigner
                .verify(host)
                .value()
                .await
                .map_err(|err| CompanionError::Precondition(err.to_string()))?;
            if !policy.accepts(status) {
                return Err(PrepareError::SignatureRejected {
                    path: host.clone(),
                    reason: format!("{status:?} signature under {policy:?} policy"),
                }
                .into());
            }
            Some(host.clone())
        }
        None => None,
    };

    let result_bundle_path = config
        .collect_result_bundle
        .then(|| working_directory.join("result.xcresult"));
    let coverage_path = config
        .collect_coverage
        .then(|| working_directory.join("coverage.profraw"));
    let log_directory = working_directory.join("logs");
    tokio::fs::create_dir_all(&log_directory)
        .await
        .map_err(|error| CompanionError::io_at(log_directory.clone(), error))?;

    // Write the artifact pointing at the staged bundle.
    let mut staged_config = config.clone();
    staged_config.test_bundle_path = bundle_path.clone();
    let artifact_path = working_directory.join("test-configuration.json");
    tokio::fs::write(&artifact_path, staged_config.to_artifact_json()?)
        .await
        .map_err(|error| CompanionError::io_at(artifact_path.clone(), error))?;

    let runner_environment = build_runner_environment(
        shims,
        &artifact_path,
        &[working_directory.join("Frameworks")],
        coverage_path.as_deref(),
        Some(&log_directory),
        &config.environment,
    );

    Ok(PreparedTestRun {
        working_directory: working_directory.to_owned(),
        bundle_path,
        artifact_path,
        host_application,
        runner_environment,
        result_bundle_path,
        coverage_path,
    })
}

/// Copies a file or directory tree.
async fn copy_recursively(from: &Utf8Path, to: &Utf8Path) -> Result<(), CompanionError> {
    if from.is_file() {
        tokio::fs::copy(from, to)
            .await
            .map_err(|error| CompanionError::io_at(from.to_owned(), error))?;
        return Ok(());
    }
    tokio::fs::create_dir_all(to)
        .await
        .map_err(|error| CompanionError::io_at(to.to_owned(), error))?;
    let mut entries = tokio::fs::read_dir(from)
        .await
        .map_err(|error| CompanionError::io_at(from.to_owned(), error))?;
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|error| CompanionError::io_at(from.to_owned(), error))?
    {
        let Ok(source) = Utf8PathBuf::from_path_buf(entry.path()) else {
            continue;
        };
        let Some(name) = source.file_name() else {
            continue;
        };
        let dest = to.join(name);
        Box::pin(copy_recursively(&source, &dest)).await?;
    }
    Ok(())
}

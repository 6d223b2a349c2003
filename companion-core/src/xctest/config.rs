// Copyright (c) The ios-companion Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Test configuration values and runner-environment synthesis.

use crate::errors::{CompanionError, PrepareError};
use camino::{Utf8Path, Utf8PathBuf};
use newtype_uuid::{TypedUuid, TypedUuidKind, TypedUuidTag};
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, BTreeSet},
    time::Duration,
};

/// The typed-UUID kind for one test run.
pub enum TestRunKind {}

impl TypedUuidKind for TestRunKind {
    fn tag() -> TypedUuidTag {
        const TAG: TypedUuidTag = TypedUuidTag::new("test-run");
        TAG
    }
}

/// Identifies one test run; embedded in the on-disk configuration artifact.
pub type TestRunUuid = TypedUuid<TestRunKind>;

/// Overrides the default shim directory location.
pub const ENV_TEST_SHIM_DIRECTORY: &str = "TEST_SHIM_DIRECTORY";
/// Propagated into the runner to place coverage output.
pub const ENV_LLVM_PROFILE_FILE: &str = "LLVM_PROFILE_FILE";
/// Propagated into the runner as the log sink directory.
pub const ENV_LOG_DIRECTORY_PATH: &str = "LOG_DIRECTORY_PATH";

/// How coverage data should be delivered.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CoverageFormat {
    /// The raw `.profraw` file.
    #[default]
    Raw,
    /// Exported after the run.
    Exported,
}

/// The serializable description of one XCTest invocation.
///
/// Written to disk as the test-configuration artifact; the injected shim
/// reads it to decide which tests to run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct XCTestConfiguration {
    /// The session this configuration belongs to.
    pub session_id: TestRunUuid,

    /// The test bundle to load.
    pub test_bundle_path: Utf8PathBuf,

    /// The host application for app and UI tests.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_host_path: Option<Utf8PathBuf>,

    /// The product module name of the bundle.
    pub module_name: String,

    /// Fully-qualified tests to run (`Class/method`); empty means all.
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub tests_to_run: BTreeSet<String>,

    /// Fully-qualified tests to skip.
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub tests_to_skip: BTreeSet<String>,

    /// Extra environment for the runner process.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub environment: BTreeMap<String, String>,

    /// Extra arguments for the runner process.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub arguments: Vec<String>,

    /// Whether to collect code coverage.
    #[serde(default)]
    pub collect_coverage: bool,

    /// How coverage is delivered when collected.
    #[serde(default)]
    pub coverage_format: CoverageFormat,

    /// Whether to collect a result bundle.
    #[serde(default)]
    pub collect_result_bundle: bool,
}

impl XCTestConfiguration {
    /// A configuration for a logic-test bundle with a fresh session id.
    pub fn new(test_bundle_path: impl Into<Utf8PathBuf>, module_name: impl Into<String>) -> Self {
        Self {
            session_id: TestRunUuid::new_v4(),
            test_bundle_path: test_bundle_path.into(),
            test_host_path: None,
            module_name: module_name.into(),
            tests_to_run: BTreeSet::new(),
            tests_to_skip: BTreeSet::new(),
            environment: BTreeMap::new(),
            arguments: Vec::new(),
            collect_coverage: false,
            coverage_format: CoverageFormat::Raw,
            collect_result_bundle: false,
        }
    }

    /// Serializes the on-disk artifact.
    pub fn to_artifact_json(&self) -> Result<String, CompanionError> {
        serde_json::to_string_pretty(self).map_err(|err| {
            CompanionError::InvalidArgument(format!("unserializable test configuration: {err}"))
        })
    }

    /// Reads an artifact back.
    pub fn from_artifact_json(contents: &str) -> Result<Self, CompanionError> {
        serde_json::from_str(contents).map_err(|err| {
            CompanionError::InvalidArgument(format!("malformed test configuration: {err}"))
        })
    }
}

/// The full launch description for a test run: configuration plus the
/// execution knobs that never reach the artifact.
#[derive(Clone, Debug)]
pub struct TestLaunchConfiguration {
    /// The serializable configuration.
    pub config: XCTestConfiguration,
    /// True for UI test bundles, which drive a separate host app.
    pub ui_testing: bool,
    /// A plan-level deadline; the runner is cancelled when it elapses.
    pub timeout: Option<Duration>,
}

impl TestLaunchConfiguration {
    /// Wraps a configuration with default execution knobs.
    pub fn new(config: XCTestConfiguration) -> Self {
        Self {
            config,
            ui_testing: false,
            timeout: None,
        }
    }
}

/// Locations of the on-target shim dylibs injected into the runner.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ShimConfiguration {
    /// The directory holding the shims.
    pub directory: Utf8PathBuf,
    /// The injected test-shim dylib.
    pub shim_dylib: Utf8PathBuf,
}

impl ShimConfiguration {
    /// The shim dylib's file name inside the shim directory.
    pub const SHIM_DYLIB_NAME: &'static str = "libShimulator.dylib";

    /// Locates the shims: the `TEST_SHIM_DIRECTORY` override wins,
    /// otherwise `default_directory` is used. The directory must exist.
    pub fn locate(
        default_directory: &Utf8Path,
        env_override: Option<&str>,
    ) -> Result<Self, CompanionError> {
        let directory = match env_override {
            Some(dir) => Utf8PathBuf::from(dir),
            None => default_directory.to_owned(),
        };
        if !directory.is_dir() {
            return Err(PrepareError::MissingShimDirectory(directory).into());
        }
        let shim_dylib = directory.join(Self::SHIM_DYLIB_NAME);
        if !shim_dylib.is_file() {
            return Err(PrepareError::MissingShimDirectory(directory).into());
        }
        Ok(Self {
            directory,
            shim_dylib,
        })
    }
}

/// Builds the environment for the test-runner process.
///
/// Layering, lowest priority first: the injection variables, the coverage
/// and log-sink plumbing, then user-supplied overrides.
pub fn build_runner_environment(
    shims: &ShimConfiguration,
    artifact_path: &Utf8Path,
    framework_search_paths: &[Utf8PathBuf],
    coverage_profile_path: Option<&Utf8Path>,
    log_directory: Option<&Utf8Path>,
    user_environment: &BTreeMap<String, String>,
) -> BTreeMap<String, String> {
    let mut env = BTreeMap::new();
    env.insert(
        "DYLD_INSERT_LIBRARIES".to_owned(),
        shims.shim_dylib.to_string(),
    );
    env.insert(
        "XCTestConfigurationFilePath".to_owned(),
        artifact_path.to_string(),
    );
    if !framework_search_paths.is_empty() {
        let joined = framework_search_paths
            .iter()
            .map(|path| path.as_str())
            .collect::<Vec<_>>()
            .join(":");
        env.insert("DYLD_FRAMEWORK_PATH".to_owned(), joined.clone());
        env.insert("DYLD_LIBRARY_PATH".to_owned(), joined);
    }
    if let Some(profile) = coverage_profile_path {
        env.insert(ENV_LLVM_PROFILE_FILE.to_owned(), profile.to_string());
    }
    if let Some(log_dir) = log_directory {
        env.insert(ENV_LOG_DIRECTORY_PATH.to_owned(), log_dir.to_string());
    }
    for (key, value) in user_environment {
        env.insert(key.clone(), value.clone());
    }
    env
}

// Copyright (c) The ios-companion Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Command routing.
//!
//! A [`CommandForwarder`] owns one target and a registry of capability
//! constructors. Lookup is by [`TargetCapability`]; a stateful capability
//! is constructed once and memoized for the forwarder's lifetime, a
//! stateless one is constructed per call. The concrete capability set is
//! closed, so instances are tagged variants rather than downcasts.

mod traits;

pub use traits::*;

use crate::{
    errors::{CompanionError, TargetLifecycleError},
    target::Target,
};
use companion_metadata::TargetCapability;
use indexmap::IndexMap;
use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};
use tracing::debug;

/// One implementation of a capability family, as stored in the registry.
#[derive(Clone)]
pub enum CapabilityInstance {
    /// Boot and shutdown.
    Lifecycle(Arc<dyn LifecycleCommands>),
    /// Application management.
    Applications(Arc<dyn ApplicationCommands>),
    /// Process spawning.
    ProcessSpawn(Arc<dyn ProcessSpawnCommands>),
    /// Log tailing.
    LogTail(Arc<dyn LogTailCommands>),
    /// Screenshots.
    Screenshot(Arc<dyn ScreenshotCommands>),
    /// Video recording and streaming.
    Video(Arc<dyn VideoCommands>),
    /// XCTest execution.
    Xctest(Arc<dyn XctestCommands>),
    /// Crash-log queries.
    CrashLogs(Arc<dyn CrashLogCommands>),
    /// HID event synthesis.
    Hid(Arc<dyn HidCommands>),
    /// URL opening.
    OpenUrl(Arc<dyn OpenUrlCommands>),
    /// Instruments-style traces.
    Instruments(Arc<dyn InstrumentsCommands>),
    /// Diagnostic file access.
    Diagnostics(Arc<dyn DiagnosticCommands>),
}

impl CapabilityInstance {
    /// The capability family this instance implements.
    pub fn capability(&self) -> TargetCapability {
        match self {
            Self::Lifecycle(_) => TargetCapability::Lifecycle,
            Self::Applications(_) => TargetCapability::Applications,
            Self::ProcessSpawn(_) => TargetCapability::ProcessSpawn,
            Self::LogTail(_) => TargetCapability::LogTail,
            Self::Screenshot(_) => TargetCapability::Screenshot,
            Self::Video(_) => TargetCapability::Video,
            Self::Xctest(_) => TargetCapability::Xctest,
            Self::CrashLogs(_) => TargetCapability::CrashLogs,
            Self::Hid(_) => TargetCapability::Hid,
            Self::OpenUrl(_) => TargetCapability::OpenUrl,
            Self::Instruments(_) => TargetCapability::Instruments,
            Self::Diagnostics(_) => TargetCapability::Diagnostics,
        }
    }
}

type BuildFn = Box<dyn Fn(&Arc<dyn Target>) -> CapabilityInstance + Send + Sync>;

/// A registered constructor for one capability family.
pub struct CommandFactory {
    capability: TargetCapability,
    stateful: bool,
    build: BuildFn,
}

impl CommandFactory {
    /// A factory whose product is memoized for the forwarder's lifetime.
    pub fn stateful(
        capability: TargetCapability,
        build: impl Fn(&Arc<dyn Target>) -> CapabilityInstance + Send + Sync + 'static,
    ) -> Self {
        Self {
            capability,
            stateful: true,
            build: Box::new(build),
        }
    }

    /// A factory whose product is constructed per call.
    pub fn stateless(
        capability: TargetCapability,
        build: impl Fn(&Arc<dyn Target>) -> CapabilityInstance + Send + Sync + 'static,
    ) -> Self {
        Self {
            capability,
            stateful: false,
            build: Box::new(build),
        }
    }
}

/// Dispatches capability lookups against one target.
pub struct CommandForwarder {
    target: Arc<dyn Target>,
    factories: IndexMap<TargetCapability, CommandFactory>,
    memoized: Mutex<HashMap<TargetCapability, CapabilityInstance>>,
}

impl CommandForwarder {
    /// Creates a forwarder from a factory registry.
    ///
    /// A factory whose capability is repeated replaces the earlier one.
    pub fn new(target: Arc<dyn Target>, factories: Vec<CommandFactory>) -> Self {
        let factories = factories
            .into_iter()
            .map(|factory| (factory.capability, factory))
            .collect();
        Self {
            target,
            factories,
            memoized: Mutex::new(HashMap::new()),
        }
    }

    /// The target this forwarder routes to.
    pub fn target(&self) -> &Arc<dyn Target> {
        &self.target
    }

    /// The capability families this forwarder can dispatch.
    pub fn capabilities(&self) -> Vec<TargetCapability> {
        self.factories.keys().copied().collect()
    }

    /// Looks up (or constructs) the implementation of a capability.
    pub fn instance(
        &self,
        capability: TargetCapability,
    ) -> Result<CapabilityInstance, CompanionError> {
        if !self.target.supports(capability) {
            return Err(TargetLifecycleError::UnsupportedCapability {
                udid: self.target.udid().to_owned(),
                capability,
            }
            .into());
        }
        let factory = self.factories.get(&capability).ok_or_else(|| {
            CompanionError::NotFound(format!("no factory registered for {capability:?}"))
        })?;
        if !factory.stateful {
            debug!(?capability, "constructing stateless capability");
            return Ok((factory.build)(&self.target));
        }
        let mut memoized = self.memoized.lock().expect("memo table lock poisoned");
        if let Some(existing) = memoized.get(&capability) {
            return Ok(existing.clone());
        }
        debug!(?capability, "constructing and memoizing stateful capability");
        let instance = (factory.build)(&self.target);
        memoized.insert(capability, instance.clone());
        Ok(instance)
    }

    /// The XCTest capability.
    pub fn xctest(&self) -> Result<Arc<dyn XctestCommands>, CompanionError> {
        match self.instance(TargetCapability::Xctest)? {
            CapabilityInstance::Xctest(commands) => Ok(commands),
            other => Err(mismatch(TargetCapability::Xctest, &other)),
        }
    }

    /// The video capability.
    pub fn video(&self) -> Result<Arc<dyn VideoCommands>, CompanionError> {
        match self.instance(TargetCapability::Video)? {
            CapabilityInstance::Video(commands) => Ok(commands),
            other => Err(mismatch(TargetCapability::Video, &other)),
        }
    }

    /// The process-spawn capability.
    pub fn process_spawn(&self) -> Result<Arc<dyn ProcessSpawnCommands>, CompanionError> {
        match self.instance(TargetCapability::ProcessSpawn)? {
            CapabilityInstance::ProcessSpawn(commands) => Ok(commands),
            other => Err(mismatch(TargetCapability::ProcessSpawn, &other)),
        }
    }

    /// The crash-log capability.
    pub fn crash_logs(&self) -> Result<Arc<dyn CrashLogCommands>, CompanionError> {
        match self.instance(TargetCapability::CrashLogs)? {
            CapabilityInstance::CrashLogs(commands) => Ok(commands),
            other => Err(mismatch(TargetCapability::CrashLogs, &other)),
        }
    }

    /// The HID capability.
    pub fn hid(&self) -> Result<Arc<dyn HidCommands>, CompanionError> {
        match self.instance(TargetCapability::Hid)? {
            CapabilityInstance::Hid(commands) => Ok(commands),
            other => Err(mismatch(TargetCapability::Hid, &other)),
        }
    }

    /// The lifecycle capability.
    pub fn lifecycle(&self) -> Result<Arc<dyn LifecycleCommands>, CompanionError> {
        match self.instance(TargetCapability::Lifecycle)? {
            CapabilityInstance::Lifecycle(commands) => Ok(commands),
            other => Err(mismatch(TargetCapability::Lifecycle, &other)),
        }
    }
}

fn mismatch(wanted: TargetCapability, got: &CapabilityInstance) -> CompanionError {
    CompanionError::InvalidArgument(format!(
        "factory for {wanted:?} produced a {:?} instance",
        got.capability()
    ))
}

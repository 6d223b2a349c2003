// Copyright (c) The ios-companion Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! A process-wide manager for expensive, pooled resources.
//!
//! Some resources (a daemon connection, a mounted disk image, a video
//! surface binding) are expensive to construct and must have at most one
//! live instance. A [`ResourceManager`] hands them out through
//! [`ScopedContext`]s: the first acquisition triggers `prepare`, later
//! acquisitions share or queue depending on the delegate's `sharable` flag,
//! and when the last user releases, a pool timer starts. Re-acquiring within
//! the pool window cancels the pending teardown; otherwise the manager
//! invokes `teardown` and returns to idle.
//!
//! State machine per resource:
//!
//! ```text
//! IDLE ──acquire──▶ PREPARING ──prepare.resolve──▶ LIVE(n=1)
//! LIVE(n) ──acquire──▶ LIVE(n+1)     (only if sharable)
//! LIVE(n) ──release──▶ LIVE(n-1)     (when n>1)
//! LIVE(1) ──release──▶ POOLED        (timer started)
//! POOLED ──acquire before timer──▶ LIVE(1)
//! POOLED ──timer fires──▶ TEARING_DOWN ──teardown.resolve──▶ IDLE
//! ```

use crate::{
    errors::FutureResult,
    fut::{Deferred, Resolver, scoped::ScopedContext},
    logger::Logger,
};
use std::{
    collections::VecDeque,
    sync::{Arc, Mutex},
    time::Duration,
};
use tracing::debug;

/// Supplies the lifecycle of a managed resource.
pub trait ResourceDelegate<T>: Send + Sync + 'static {
    /// Constructs the resource.
    fn prepare(&self, logger: &Logger) -> Deferred<T>;

    /// Destroys the resource.
    fn teardown(&self, resource: T, logger: &Logger) -> Deferred<()>;

    /// The resource's name, for logging.
    fn name(&self) -> &str;

    /// How long a released resource stays pooled before teardown. `None`
    /// tears down immediately on the last release.
    fn pool_timeout(&self) -> Option<Duration>;

    /// Whether concurrent users may share the live instance. When false,
    /// acquisitions are served one at a time in FIFO order.
    fn sharable(&self) -> bool {
        false
    }
}

enum Phase<T> {
    Idle,
    Preparing {
        waiters: Vec<Resolver<T>>,
    },
    Live {
        resource: T,
        users: usize,
        queue: VecDeque<Resolver<T>>,
    },
    Pooled {
        resource: T,
        epoch: u64,
    },
    TearingDown {
        waiters: Vec<Resolver<T>>,
    },
}

struct Inner<T> {
    delegate: Arc<dyn ResourceDelegate<T>>,
    logger: Logger,
    phase: Mutex<Phase<T>>,
    // Bumped whenever the pooled instance is reclaimed, so a stale timer
    // firing after re-acquisition is a no-op.
    epoch: Mutex<u64>,
}

/// Manages a single named resource with reference counting, FIFO queueing
/// and pool timeouts.
pub struct ResourceManager<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for ResourceManager<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Clone + Send + Sync + 'static> ResourceManager<T> {
    /// Creates a manager around a delegate.
    pub fn new(delegate: Arc<dyn ResourceDelegate<T>>, logger: Logger) -> Self {
        let logger = logger.named(delegate.name());
        Self {
            inner: Arc::new(Inner {
                delegate,
                logger,
                phase: Mutex::new(Phase::Idle),
                epoch: Mutex::new(0),
            }),
        }
    }

    /// Acquires the resource for the given purpose.
    ///
    /// The returned context's teardown releases the acquisition; it never
    /// destroys the resource directly, the manager decides that.
    pub fn acquire(&self, purpose: &str) -> ScopedContext<T> {
        debug!(resource = self.inner.delegate.name(), purpose, "acquiring");
        let acquired = self.acquire_future();
        let manager = self.clone();
        let purpose = purpose.to_owned();
        ScopedContext::new(acquired, move |_resource| manager.release(&purpose))
    }

    /// The number of current users, for diagnostics.
    pub fn user_count(&self) -> usize {
        match &*self.inner.phase.lock().expect("resource phase lock poisoned") {
            Phase::Live { users, .. } => *users,
            _ => 0,
        }
    }

    fn acquire_future(&self) -> Deferred<T> {
        enum Action {
            StartPrepare,
            None,
        }
        let (future, action) = {
            let mut phase = self.inner.phase.lock().expect("resource phase lock poisoned");
            match &mut *phase {
                Phase::Idle => {
                    let (resolver, future) = Deferred::new();
                    *phase = Phase::Preparing {
                        waiters: vec![resolver],
                    };
                    (future, Action::StartPrepare)
                }
                Phase::Preparing { waiters } => {
                    let (resolver, future) = Deferred::new();
                    waiters.push(resolver);
                    (future, Action::None)
                }
                Phase::Live {
                    resource,
                    users,
                    queue,
                } => {
                    if self.inner.delegate.sharable() {
                        *users += 1;
                        (Deferred::resolved(resource.clone()), Action::None)
                    } else {
                        let (resolver, future) = Deferred::new();
                        queue.push_back(resolver);
                        (future, Action::None)
                    }
                }
                Phase::Pooled { resource, .. } => {
                    let resource = resource.clone();
                    // Invalidate the pending pool timer.
                    *self.inner.epoch.lock().expect("epoch lock poisoned") += 1;
                    *phase = Phase::Live {
                        resource: resource.clone(),
                        users: 1,
                        queue: VecDeque::new(),
                    };
                    (Deferred::resolved(resource), Action::None)
                }
                Phase::TearingDown { waiters } => {
                    let (resolver, future) = Deferred::new();
                    waiters.push(resolver);
                    (future, Action::None)
                }
            }
        };
        if let Action::StartPrepare = action {
            self.start_prepare();
        }
        future
    }

    fn start_prepare(&self) {
        let inner = Arc::clone(&self.inner);
        let prepared = inner.delegate.prepare(&inner.logger);
        let manager = self.clone();
        prepared.observe(move |result| {
            // The phase transition and the waiter split happen under one
            // lock; resolution itself runs off-lock.
            let to_notify: Vec<(Resolver<T>, FutureResult<T>)> = {
                let mut phase = manager
                    .inner
                    .phase
                    .lock()
                    .expect("resource phase lock poisoned");
                let Phase::Preparing { waiters } = &mut *phase else {
                    return;
                };
                let waiters = std::mem::take(waiters);
                match result {
                    Ok(resource) => {
                        if manager.inner.delegate.sharable() {
                            *phase = Phase::Live {
                                resource: resource.clone(),
                                users: waiters.len().max(1),
                                queue: VecDeque::new(),
                            };
                            waiters
                                .into_iter()
                                .map(|waiter| (waiter, Ok(resource.clone())))
                                .collect()
                        } else {
                            // Serve the first; the rest queue behind it.
                            let mut iter = waiters.into_iter();
                            let first = iter.next();
                            *phase = Phase::Live {
                                resource: resource.clone(),
                                users: 1,
                                queue: iter.collect(),
                            };
                            first
                                .map(|waiter| (waiter, Ok(resource)))
                                .into_iter()
                                .collect()
                        }
                    }
                    Err(err) => {
                        // A failed prepare returns to idle; the error
                        // propagates to every queued acquirer.
                        *phase = Phase::Idle;
                        waiters
                            .into_iter()
                            .map(|waiter| (waiter, Err(err.clone())))
                            .collect()
                    }
                }
            };
            for (waiter, outcome) in to_notify {
                waiter.complete(outcome);
            }
        });
    }

    fn release(&self, purpose: &str) -> Deferred<()> {
        debug!(resource = self.inner.delegate.name(), purpose, "releasing");
        enum Action<T> {
            None,
            ServeNext { next: Resolver<T>, resource: T },
            StartPoolTimer { epoch: u64 },
            Teardown { resource: T },
        }
        let action = {
            let mut phase = self.inner.phase.lock().expect("resource phase lock poisoned");
            match &mut *phase {
                Phase::Live {
                    resource,
                    users,
                    queue,
                } => {
                    if let Some(next) = queue.pop_front() {
                        // Hand the live instance to the next queued
                        // acquirer; the user count carries over.
                        // Resolution happens off-lock.
                        Action::ServeNext {
                            next,
                            resource: resource.clone(),
                        }
                    } else if *users > 1 {
                        *users -= 1;
                        Action::None
                    } else {
                        let resource = resource.clone();
                        match self.inner.delegate.pool_timeout() {
                            Some(_) => {
                                let mut epoch =
                                    self.inner.epoch.lock().expect("epoch lock poisoned");
                                *epoch += 1;
                                let current = *epoch;
                                *phase = Phase::Pooled {
                                    resource,
                                    epoch: current,
                                };
                                Action::StartPoolTimer { epoch: current }
                            }
                            None => {
                                *phase = Phase::TearingDown {
                                    waiters: Vec::new(),
                                };
                                Action::Teardown { resource }
                            }
                        }
                    }
                }
                _ => Action::None,
            }
        };
        match action {
            Action::None => Deferred::resolved(()),
            Action::ServeNext { next, resource } => {
                if next.resolve(resource) {
                    Deferred::resolved(())
                } else {
                    // The waiter was cancelled while queued; retry the
                    // release against the remaining queue.
                    self.release(purpose)
                }
            }
            Action::StartPoolTimer { epoch } => {
                self.start_pool_timer(epoch);
                Deferred::resolved(())
            }
            Action::Teardown { resource } => self.start_teardown(resource),
        }
    }

    fn start_pool_timer(&self, epoch: u64) {
        let manager = self.clone();
        let timeout = self
            .inner
            .delegate
            .pool_timeout()
            .unwrap_or(Duration::ZERO);
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let resource = {
                let mut phase = manager
                    .inner
                    .phase
                    .lock()
                    .expect("resource phase lock poisoned");
                let current = *manager.inner.epoch.lock().expect("epoch lock poisoned");
                match &mut *phase {
                    Phase::Pooled {
                        resource,
                        epoch: pooled_epoch,
                    } if *pooled_epoch == epoch && current == epoch => {
                        let resource = resource.clone();
                        *phase = Phase::TearingDown {
                            waiters: Vec::new(),
                        };
                        Some(resource)
                    }
                    // Re-acquired (or already torn down) before the timer
                    // fired.
                    _ => None,
                }
            };
            if let Some(resource) = resource {
                let _ = manager.start_teardown(resource);
            }
        });
    }

    fn start_teardown(&self, resource: T) -> Deferred<()> {
        debug!(resource = self.inner.delegate.name(), "tearing down");
        let done = self
            .inner
            .delegate
            .teardown(resource, &self.inner.logger);
        let manager = self.clone();
        let surfaced = done.clone();
        done.observe(move |result| {
            let waiters = {
                let mut phase = manager
                    .inner
                    .phase
                    .lock()
                    .expect("resource phase lock poisoned");
                let Phase::TearingDown { waiters } = &mut *phase else {
                    return;
                };
                let waiters = std::mem::take(waiters);
                *phase = Phase::Idle;
                waiters
            };
            if let Err(err) = &result {
                if !err.is_cancelled() {
                    manager
                        .inner
                        .logger
                        .error(format!("teardown failed: {err}"));
                }
            }
            if !waiters.is_empty() {
                // Acquirers arrived mid-teardown: restart preparation and
                // splice them in as the preparing waiters.
                let mut phase = manager
                    .inner
                    .phase
                    .lock()
                    .expect("resource phase lock poisoned");
                *phase = Phase::Preparing { waiters };
                drop(phase);
                manager.start_prepare();
            }
        });
        surfaced
    }
}

impl<T: 'static> std::fmt::Debug for ResourceManager<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let phase = match &*self.inner.phase.lock().expect("resource phase lock poisoned") {
            Phase::Idle => "idle",
            Phase::Preparing { .. } => "preparing",
            Phase::Live { .. } => "live",
            Phase::Pooled { .. } => "pooled",
            Phase::TearingDown { .. } => "tearing-down",
        };
        f.debug_struct("ResourceManager")
            .field("name", &self.inner.delegate.name())
            .field("phase", &phase)
            .finish()
    }
}

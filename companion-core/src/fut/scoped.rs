// Copyright (c) The ios-companion Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Scoped resource contexts.
//!
//! A [`ScopedContext`] pairs an acquisition future with a teardown step and
//! guarantees that every teardown runs exactly once, in reverse acquisition
//! order, on all exit paths. Composing contexts with
//! [`ScopedContext::flat_then`] stacks their teardowns so that releasing the
//! composite releases the most recently acquired resource first.

use crate::{
    errors::{CompanionError, FutureError, FutureResult},
    fut::Deferred,
};
use futures::future::BoxFuture;
use std::{
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::runtime::Handle;
use tracing::warn;

type Teardown = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

/// A value owning a resource whose release is guaranteed on all exit paths.
pub struct ScopedContext<T> {
    value: Deferred<T>,
    // LIFO: teardowns are popped from the end. Shared so that composition
    // can splice a child's teardowns into its parent's stack at resolve
    // time.
    teardowns: Arc<Mutex<Vec<Teardown>>>,
    // Cleared when ownership of the stack moves to a derived context, so
    // that dropping the consumed handle does not run teardowns early.
    armed: bool,
}

impl<T: Clone + Send + 'static> ScopedContext<T> {
    /// Pairs an acquisition future with a teardown closure.
    ///
    /// The teardown receives the acquired value; if acquisition never
    /// resolved, the teardown is skipped.
    pub fn new(
        acquire: Deferred<T>,
        teardown: impl FnOnce(T) -> Deferred<()> + Send + 'static,
    ) -> Self {
        let value = acquire.clone();
        let stack: Vec<Teardown> = vec![Box::new(move || match acquire.peek() {
            Some(Ok(resource)) => {
                let done = teardown(resource);
                Box::pin(async move {
                    if let Err(err) = done.value().await {
                        if !err.is_cancelled() {
                            warn!("scoped teardown failed: {err}");
                        }
                    }
                })
            }
            _ => Box::pin(async {}),
        })];
        Self {
            value,
            teardowns: Arc::new(Mutex::new(stack)),
            armed: true,
        }
    }

    /// A context around an already-acquired value.
    pub fn resolved(
        value: T,
        teardown: impl FnOnce(T) -> Deferred<()> + Send + 'static,
    ) -> Self {
        Self::new(Deferred::resolved(value), teardown)
    }

    /// A context with no teardown, useful at the root of a composition.
    pub fn pure(value: T) -> Self {
        Self {
            value: Deferred::resolved(value),
            teardowns: Arc::new(Mutex::new(Vec::new())),
            armed: true,
        }
    }

    /// The acquisition future ("use asynchronously").
    pub fn value(&self) -> Deferred<T> {
        self.value.clone()
    }

    /// Waits up to `limit` for the acquisition to complete ("use now").
    pub async fn use_now(&self, limit: Duration) -> FutureResult<T> {
        self.value.value_with_deadline(limit).await
    }

    /// Composes this context with a further acquisition.
    ///
    /// The returned context's teardown releases the inner resource before
    /// this one's.
    pub fn flat_then<U: Clone + Send + 'static>(
        mut self,
        f: impl FnOnce(T) -> ScopedContext<U> + Send + 'static,
    ) -> ScopedContext<U> {
        self.armed = false;
        let stack = Arc::clone(&self.teardowns);
        let value = self.value.flat_then({
            let stack = Arc::clone(&stack);
            move |resource| {
                let child = f(resource);
                // Spliced after our own entries: popped (released) first.
                // The child handle then drops with an empty stack.
                let mut child_stack = child
                    .teardowns
                    .lock()
                    .expect("teardown stack lock poisoned");
                stack
                    .lock()
                    .expect("teardown stack lock poisoned")
                    .append(&mut child_stack);
                drop(child_stack);
                child.value()
            }
        });
        ScopedContext {
            value,
            teardowns: stack,
            armed: true,
        }
    }

    /// Derives a context with the same teardown whose value is mapped.
    pub fn map<U: Clone + Send + 'static>(
        mut self,
        f: impl FnOnce(T) -> U + Send + 'static,
    ) -> ScopedContext<U> {
        self.armed = false;
        let teardowns = Arc::clone(&self.teardowns);
        let value = self.value.then(move |v| Ok(f(v)));
        ScopedContext {
            value,
            teardowns,
            armed: true,
        }
    }

    /// Releases the context: runs all teardowns in reverse acquisition
    /// order and returns when the last one completes.
    pub async fn release(self) {
        let teardowns = drain(&self.teardowns);
        for teardown in teardowns.into_iter().rev() {
            teardown().await;
        }
    }

    /// Cancels the pending acquisition and releases anything acquired so
    /// far.
    pub async fn abort(self) {
        self.value.cancel();
        self.release().await;
    }
}

fn drain(stack: &Mutex<Vec<Teardown>>) -> Vec<Teardown> {
    let mut stack = stack.lock().expect("teardown stack lock poisoned");
    stack.drain(..).collect()
}

impl<T> Drop for ScopedContext<T> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let teardowns = drain(&self.teardowns);
        if teardowns.is_empty() {
            return;
        }
        // A dropped context still owes its teardowns; run them on the
        // ambient runtime when one exists.
        match Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    for teardown in teardowns.into_iter().rev() {
                        teardown().await;
                    }
                });
            }
            Err(_) => {
                warn!(
                    count = teardowns.len(),
                    "scoped context dropped outside a runtime; teardowns skipped"
                );
            }
        }
    }
}

/// Runs `body` against the context's value, then releases the context
/// regardless of the body's outcome.
pub async fn scoped<T, R, F>(ctx: ScopedContext<T>, body: F) -> FutureResult<R>
where
    T: Clone + Send + 'static,
    F: AsyncFnOnce(T) -> Result<R, CompanionError>,
{
    let value = match ctx.value().value().await {
        Ok(value) => value,
        Err(err) => {
            ctx.release().await;
            return Err(err);
        }
    };
    let result = body(value).await;
    ctx.release().await;
    result.map_err(FutureError::rejected)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn recording_context(
        label: usize,
        order: &Arc<Mutex<Vec<usize>>>,
    ) -> ScopedContext<usize> {
        let order = Arc::clone(order);
        ScopedContext::resolved(label, move |value| {
            order.lock().expect("order lock").push(value);
            Deferred::resolved(())
        })
    }

    #[tokio::test]
    async fn teardown_runs_on_release() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let ctx = recording_context(1, &order);
        assert_eq!(
            ctx.use_now(Duration::from_millis(10)).await.expect("value"),
            1
        );
        ctx.release().await;
        assert_eq!(*order.lock().expect("order lock"), vec![1]);
    }

    #[tokio::test]
    async fn composition_releases_in_reverse_order() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let composed = recording_context(1, &order).flat_then({
            let order = Arc::clone(&order);
            move |_| recording_context(2, &order)
        });
        assert_eq!(
            composed
                .use_now(Duration::from_millis(10))
                .await
                .expect("value"),
            2
        );
        composed.release().await;
        assert_eq!(*order.lock().expect("order lock"), vec![2, 1]);
    }

    #[tokio::test]
    async fn three_stage_composition_is_lifo() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let composed = recording_context(1, &order)
            .flat_then({
                let order = Arc::clone(&order);
                move |_| recording_context(2, &order)
            })
            .flat_then({
                let order = Arc::clone(&order);
                move |_| recording_context(3, &order)
            });
        composed.release().await;
        assert_eq!(*order.lock().expect("order lock"), vec![3, 2, 1]);
    }

    #[tokio::test]
    async fn scoped_releases_after_body_error() {
        let count = Arc::new(AtomicUsize::new(0));
        let ctx = {
            let count = Arc::clone(&count);
            ScopedContext::resolved(7u32, move |_| {
                count.fetch_add(1, Ordering::SeqCst);
                Deferred::resolved(())
            })
        };
        let result: FutureResult<u32> = scoped(ctx, async |_| {
            Err(CompanionError::Precondition("nope".into()))
        })
        .await;
        assert!(result.is_err());
        assert_eq!(count.load(Ordering::SeqCst), 1, "teardown ran despite error");
    }

    #[tokio::test]
    async fn scoped_releases_after_success() {
        let count = Arc::new(AtomicUsize::new(0));
        let ctx = {
            let count = Arc::clone(&count);
            ScopedContext::resolved(7u32, move |_| {
                count.fetch_add(1, Ordering::SeqCst);
                Deferred::resolved(())
            })
        };
        let result = scoped(ctx, async |v| Ok(v * 2)).await;
        assert_eq!(result.expect("body value"), 14);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn drop_spawns_teardown() {
        let count = Arc::new(AtomicUsize::new(0));
        {
            let count = Arc::clone(&count);
            let ctx = ScopedContext::resolved(1u32, move |_| {
                count.fetch_add(1, Ordering::SeqCst);
                Deferred::resolved(())
            });
            drop(ctx);
        }
        // The teardown is spawned onto the runtime; yield until it runs.
        for _ in 0..10 {
            if count.load(Ordering::SeqCst) == 1 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn map_keeps_teardown_alive() {
        let count = Arc::new(AtomicUsize::new(0));
        let ctx = {
            let count = Arc::clone(&count);
            ScopedContext::resolved(21u32, move |_| {
                count.fetch_add(1, Ordering::SeqCst);
                Deferred::resolved(())
            })
        };
        let mapped = ctx.map(|v| v * 2);
        assert_eq!(count.load(Ordering::SeqCst), 0, "mapping must not release");
        assert_eq!(
            mapped.use_now(Duration::from_millis(10)).await.expect("value"),
            42
        );
        mapped.release().await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unresolved_acquisition_skips_teardown() {
        let count = Arc::new(AtomicUsize::new(0));
        let (_resolver, pending) = Deferred::<u32>::new();
        let ctx = {
            let count = Arc::clone(&count);
            ScopedContext::new(pending, move |_| {
                count.fetch_add(1, Ordering::SeqCst);
                Deferred::resolved(())
            })
        };
        ctx.release().await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }
}

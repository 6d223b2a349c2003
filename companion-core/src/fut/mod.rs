// Copyright (c) The ios-companion Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The asynchronous primitive layer.
//!
//! [`Deferred`] is a single-assignment cell with three terminal states:
//! resolved with a value, rejected with a domain error, or cancelled. Every
//! long-running capability in the companion hands one of these back, which
//! gives callers a uniform way to await with a deadline, chain follow-up
//! work, observe completion on a queue of their choosing, and cancel
//! cooperatively.
//!
//! Cancellation is a cascade: cancelling a derived future propagates to its
//! source, and producers register hooks via [`Resolver::on_cancel`] so that
//! in-flight work is abandoned at the next suspension point.

use crate::errors::{CompanionError, FutureError, FutureResult};
use std::{
    fmt,
    future::Future,
    pin::Pin,
    sync::{Arc, Mutex},
    task::{Context, Poll, Waker},
    time::Duration,
};
use tokio::runtime::Handle;

pub mod resource;
pub mod scoped;

type Observer<T> = Box<dyn FnOnce(FutureResult<T>) + Send>;
type CancelHook = Box<dyn FnOnce() + Send>;

enum State<T> {
    Pending {
        wakers: Vec<Waker>,
        observers: Vec<Observer<T>>,
        cancel_hooks: Vec<CancelHook>,
    },
    Done(FutureResult<T>),
}

struct Shared<T> {
    state: Mutex<State<T>>,
}

impl<T: Clone> Shared<T> {
    fn new_pending() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(State::Pending {
                wakers: Vec::new(),
                observers: Vec::new(),
                cancel_hooks: Vec::new(),
            }),
        })
    }

    fn new_done(result: FutureResult<T>) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(State::Done(result)),
        })
    }

    /// Transitions to a terminal state. Returns false if already terminal.
    ///
    /// The lock is released before wakers and observers run, so completing
    /// two futures concurrently can never deadlock one against the other.
    fn complete(&self, result: FutureResult<T>, run_cancel_hooks: bool) -> bool {
        let (wakers, observers, hooks) = {
            let mut state = self.state.lock().expect("future state lock poisoned");
            match &mut *state {
                State::Pending {
                    wakers,
                    observers,
                    cancel_hooks,
                } => {
                    let wakers = std::mem::take(wakers);
                    let observers = std::mem::take(observers);
                    let hooks = std::mem::take(cancel_hooks);
                    *state = State::Done(result.clone());
                    (wakers, observers, hooks)
                }
                State::Done(_) => return false,
            }
        };
        if run_cancel_hooks {
            for hook in hooks {
                hook();
            }
        }
        for waker in wakers {
            waker.wake();
        }
        for observer in observers {
            observer(result.clone());
        }
        true
    }

    /// Registers an observer, or fires it immediately if already terminal.
    fn observe(&self, observer: Observer<T>) {
        let result = {
            let mut state = self.state.lock().expect("future state lock poisoned");
            match &mut *state {
                State::Pending { observers, .. } => {
                    observers.push(observer);
                    return;
                }
                State::Done(result) => result.clone(),
            }
        };
        observer(result);
    }

    fn add_cancel_hook(&self, hook: CancelHook) {
        let run_now = {
            let mut state = self.state.lock().expect("future state lock poisoned");
            match &mut *state {
                State::Pending { cancel_hooks, .. } => {
                    cancel_hooks.push(hook);
                    return;
                }
                State::Done(Err(FutureError::Cancelled)) => true,
                State::Done(_) => false,
            }
        };
        if run_now {
            hook();
        }
    }
}

impl<T> Shared<T> {
    fn peek(&self) -> Option<FutureResult<T>>
    where
        T: Clone,
    {
        match &*self.state.lock().expect("future state lock poisoned") {
            State::Pending { .. } => None,
            State::Done(result) => Some(result.clone()),
        }
    }

    /// Terminal cancellation without a `T: Clone` bound; the cancelled
    /// result carries no value, so observers can each be handed a fresh
    /// one. Used by the resolver's drop.
    fn cancel_in_place(&self) {
        let (wakers, observers, hooks) = {
            let mut state = self.state.lock().expect("future state lock poisoned");
            match &mut *state {
                State::Pending {
                    wakers,
                    observers,
                    cancel_hooks,
                } => {
                    let taken = (
                        std::mem::take(wakers),
                        std::mem::take(observers),
                        std::mem::take(cancel_hooks),
                    );
                    *state = State::Done(Err(FutureError::Cancelled));
                    taken
                }
                State::Done(_) => return,
            }
        };
        for hook in hooks {
            hook();
        }
        for waker in wakers {
            waker.wake();
        }
        for observer in observers {
            observer(Err(FutureError::Cancelled));
        }
    }
}

/// The producer side of a [`Deferred`].
///
/// A resolver is not `Clone`: exactly one producer owns the right to
/// complete the future. The first terminal transition wins; later calls are
/// no-ops returning false. Dropping a resolver without completing marks the
/// future cancelled, so an abandoned producer can never wedge an awaiter.
pub struct Resolver<T> {
    shared: Arc<Shared<T>>,
}

impl<T: Clone + Send + 'static> Resolver<T> {
    /// Resolves the future with a value.
    pub fn resolve(&self, value: T) -> bool {
        self.shared.complete(Ok(value), false)
    }

    /// Rejects the future with a domain error.
    pub fn reject(&self, err: impl Into<CompanionError>) -> bool {
        self.shared
            .complete(Err(FutureError::rejected(err)), false)
    }

    /// Completes the future with an existing result.
    pub fn complete(&self, result: FutureResult<T>) -> bool {
        let cancelled = matches!(result, Err(FutureError::Cancelled));
        self.shared.complete(result, cancelled)
    }

    /// Registers a hook invoked when (and only when) the future is
    /// cancelled. If the future is already cancelled, the hook runs
    /// immediately.
    pub fn on_cancel(&self, hook: impl FnOnce() + Send + 'static) {
        self.shared.add_cancel_hook(Box::new(hook));
    }

    /// True if the consumer side cancelled the future.
    pub fn is_cancelled(&self) -> bool {
        matches!(
            self.shared.peek(),
            Some(Err(FutureError::Cancelled))
        )
    }
}

impl<T> Drop for Resolver<T> {
    fn drop(&mut self) {
        // An abandoned producer counts as cancellation of the work.
        self.shared.cancel_in_place();
    }
}

impl<T> fmt::Debug for Resolver<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resolver").finish_non_exhaustive()
    }
}

/// A single-assignment observable future.
///
/// All clones observe the same terminal state. Each observer is notified
/// exactly once; awaiting after completion returns the stored result
/// immediately.
pub struct Deferred<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for Deferred<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> fmt::Debug for Deferred<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match &*self.shared.state.lock().expect("future state lock poisoned") {
            State::Pending { .. } => "pending",
            State::Done(Ok(_)) => "resolved",
            State::Done(Err(FutureError::Cancelled)) => "cancelled",
            State::Done(Err(_)) => "rejected",
        };
        f.debug_struct("Deferred").field("state", &state).finish()
    }
}

impl<T: Clone + Send + 'static> Deferred<T> {
    /// Creates a pending future and its resolver.
    pub fn new() -> (Resolver<T>, Deferred<T>) {
        let shared = Shared::new_pending();
        (
            Resolver {
                shared: Arc::clone(&shared),
            },
            Deferred { shared },
        )
    }

    /// A future that is already resolved.
    pub fn resolved(value: T) -> Self {
        Self {
            shared: Shared::new_done(Ok(value)),
        }
    }

    /// A future that is already rejected.
    pub fn rejected(err: impl Into<CompanionError>) -> Self {
        Self {
            shared: Shared::new_done(Err(FutureError::rejected(err))),
        }
    }

    /// A future that is already cancelled.
    pub fn cancelled() -> Self {
        Self {
            shared: Shared::new_done(Err(FutureError::Cancelled)),
        }
    }

    /// A future carrying an existing result.
    pub fn from_result(result: FutureResult<T>) -> Self {
        Self {
            shared: Shared::new_done(result),
        }
    }

    /// Awaits the terminal state.
    pub fn value(&self) -> ValueFuture<T> {
        ValueFuture {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Awaits the terminal state, converting an elapsed deadline into
    /// [`FutureError::Timeout`].
    pub async fn value_with_deadline(&self, deadline: Duration) -> FutureResult<T> {
        match tokio::time::timeout(deadline, self.value()).await {
            Ok(result) => result,
            Err(_) => Err(FutureError::Timeout(deadline)),
        }
    }

    /// Returns the terminal state without waiting, or `None` if pending.
    pub fn peek(&self) -> Option<FutureResult<T>> {
        self.shared.peek()
    }

    /// True once the future is terminal.
    pub fn is_done(&self) -> bool {
        self.shared.peek().is_some()
    }

    /// Marks the future cancelled and runs the producer's cancellation
    /// hooks. Cooperative: producers abandon work at their next suspension
    /// point. No-op if already terminal.
    pub fn cancel(&self) {
        self.shared.complete(Err(FutureError::Cancelled), true);
    }

    /// Registers a completion callback that runs on the provided runtime
    /// handle. The callback fires exactly once, including for futures that
    /// are already terminal at registration time.
    pub fn on_complete(
        &self,
        handle: &Handle,
        callback: impl FnOnce(FutureResult<T>) + Send + 'static,
    ) {
        let handle = handle.clone();
        self.shared.observe(Box::new(move |result| {
            handle.spawn(async move {
                callback(result);
            });
        }));
    }

    /// Registers a completion observer invoked inline on the completing
    /// task. Used by combinators; external callers should prefer
    /// [`Deferred::on_complete`].
    pub(crate) fn observe(&self, observer: impl FnOnce(FutureResult<T>) + Send + 'static) {
        self.shared.observe(Box::new(observer));
    }

    /// Derives a future by applying `f` to the resolved value.
    ///
    /// Errors pass through unchanged; cancelling the derived future cancels
    /// this one.
    pub fn then<U: Clone + Send + 'static>(
        &self,
        f: impl FnOnce(T) -> Result<U, CompanionError> + Send + 'static,
    ) -> Deferred<U> {
        let (resolver, derived) = Deferred::new();
        let parent = self.clone();
        resolver.on_cancel(move || parent.cancel());
        let resolver = Arc::new(resolver);
        self.observe(move |result| {
            match result {
                Ok(value) => match f(value) {
                    Ok(mapped) => resolver.resolve(mapped),
                    Err(err) => resolver.reject(err),
                },
                Err(err) => resolver.complete(Err(err)),
            };
        });
        derived
    }

    /// Derives a future by chaining into another future-producing step.
    ///
    /// Cancelling the derived future cancels this one and, once it exists,
    /// the inner future produced by `f`.
    pub fn flat_then<U: Clone + Send + 'static>(
        &self,
        f: impl FnOnce(T) -> Deferred<U> + Send + 'static,
    ) -> Deferred<U> {
        let (resolver, derived) = Deferred::new();
        let inner_slot: Arc<Mutex<Option<Deferred<U>>>> = Arc::new(Mutex::new(None));
        let parent = self.clone();
        {
            let inner_slot = Arc::clone(&inner_slot);
            resolver.on_cancel(move || {
                parent.cancel();
                if let Some(inner) = inner_slot.lock().expect("slot lock poisoned").take() {
                    inner.cancel();
                }
            });
        }
        let resolver = Arc::new(resolver);
        self.observe(move |result| match result {
            Ok(value) => {
                let inner = f(value);
                inner_slot
                    .lock()
                    .expect("slot lock poisoned")
                    .replace(inner.clone());
                inner.observe(move |inner_result| {
                    resolver.complete(inner_result);
                });
            }
            Err(err) => {
                resolver.complete(Err(err));
            }
        });
        derived
    }

    /// Resolves with the first future to become terminal; the losers are
    /// cancelled. Cancelling the race cancels every input.
    pub fn race(futures: Vec<Deferred<T>>) -> Deferred<T> {
        if futures.is_empty() {
            return Deferred::rejected(CompanionError::InvalidArgument(
                "cannot race zero futures".to_owned(),
            ));
        }
        let (resolver, winner) = Deferred::new();
        {
            let futures = futures.clone();
            resolver.on_cancel(move || {
                for fut in &futures {
                    fut.cancel();
                }
            });
        }
        let resolver = Arc::new(resolver);
        for (index, fut) in futures.iter().enumerate() {
            let resolver = Arc::clone(&resolver);
            let losers: Vec<Deferred<T>> = futures
                .iter()
                .enumerate()
                .filter(|(i, _)| *i != index)
                .map(|(_, f)| f.clone())
                .collect();
            fut.observe(move |result| {
                if resolver.complete(result) {
                    for loser in losers {
                        loser.cancel();
                    }
                }
            });
        }
        winner
    }

    /// Derives a future that is rejected with [`FutureError::Timeout`] if
    /// this one is not terminal within `duration`. Must be called within a
    /// tokio runtime.
    pub fn with_timeout(&self, duration: Duration) -> Deferred<T> {
        let (resolver, derived) = Deferred::new();
        let parent = self.clone();
        resolver.on_cancel({
            let parent = parent.clone();
            move || parent.cancel()
        });
        let resolver = Arc::new(resolver);
        {
            let resolver = Arc::clone(&resolver);
            self.observe(move |result| {
                resolver.complete(result);
            });
        }
        tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            if resolver.complete(Err(FutureError::Timeout(duration))) {
                parent.cancel();
            }
        });
        derived
    }
}

/// The awaitable view of a [`Deferred`], produced by [`Deferred::value`].
pub struct ValueFuture<T> {
    shared: Arc<Shared<T>>,
}

impl<T: Clone> Future for ValueFuture<T> {
    type Output = FutureResult<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut state = self
            .shared
            .state
            .lock()
            .expect("future state lock poisoned");
        match &mut *state {
            State::Done(result) => Poll::Ready(result.clone()),
            State::Pending { wakers, .. } => {
                if !wakers.iter().any(|w| w.will_wake(cx.waker())) {
                    wakers.push(cx.waker().clone());
                }
                Poll::Pending
            }
        }
    }
}

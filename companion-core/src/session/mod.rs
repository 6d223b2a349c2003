// Copyright (c) The ios-companion Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The delta-update session manager.
//!
//! Turns an unbounded long-running operation (a test run, a video
//! recording, an instruments trace) into a polling API: `start` creates the
//! operation and registers a [`DeltaSession`]; clients call
//! `obtain_updates` to receive the increments produced since their last
//! poll, and `terminate` to cancel the operation and drain the final
//! increment.
//!
//! The manager is parameterised by the creation parameter `P`, the concrete
//! operation `O` (which carries a completion future, giving it a
//! cancellation handle), and the delta type `D`. The session table lock is
//! held only to resolve ids; polling itself runs off-lock, serialised
//! per-session.

mod trace;
mod video;

pub use trace::*;
pub use video::*;

use crate::{
    errors::{CompanionError, FutureResult, SessionError},
    fut::Deferred,
    logger::Logger,
};
use indexmap::IndexMap;
use newtype_uuid::{TypedUuid, TypedUuidKind, TypedUuidTag};
use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};
use tokio::time::Instant;
use tracing::debug;

/// The typed-UUID kind for delta sessions.
pub enum SessionKind {}

impl TypedUuidKind for SessionKind {
    fn tag() -> TypedUuidTag {
        const TAG: TypedUuidTag = TypedUuidTag::new("session");
        TAG
    }
}

/// The unique identifier of a delta session.
pub type SessionUuid = TypedUuid<SessionKind>;

/// A long-running operation observable through a session.
///
/// The completion future doubles as the cancellation handle: cancelling it
/// asks the operation to abandon work, and it resolves once outstanding
/// writes have drained.
pub trait Continuation: Clone + Send + Sync + 'static {
    /// The operation's completion future.
    fn completed(&self) -> Deferred<()>;
}

type CreateFn<P, O> = Box<dyn Fn(P) -> Deferred<O> + Send + Sync>;
type PollFn<O, D> = Box<dyn Fn(&O, SessionUuid, &mut bool) -> Deferred<D> + Send + Sync>;

struct SessionState<O> {
    id: SessionUuid,
    operation: O,
    created_at: Instant,
    last_accessed: Mutex<Instant>,
    terminal: AtomicBool,
    // Serialises polls on one session so increments stay ordered.
    poll_gate: tokio::sync::Mutex<()>,
}

struct ManagerInner<P, O, D> {
    name: String,
    logger: Logger,
    expiration: Option<Duration>,
    capacity: Option<usize>,
    create: CreateFn<P, O>,
    poll: PollFn<O, D>,
    sessions: Mutex<IndexMap<SessionUuid, Arc<SessionState<O>>>>,
}

/// A manager of delta-update sessions.
pub struct DeltaUpdateManager<P, O, D> {
    inner: Arc<ManagerInner<P, O, D>>,
    sweeper: Option<Arc<SweeperGuard>>,
}

struct SweeperGuard(tokio::task::JoinHandle<()>);

impl Drop for SweeperGuard {
    fn drop(&mut self) {
        self.0.abort();
    }
}

impl<P, O, D> Clone for DeltaUpdateManager<P, O, D> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            sweeper: self.sweeper.clone(),
        }
    }
}

impl<P, O, D> DeltaUpdateManager<P, O, D>
where
    P: Send + 'static,
    O: Continuation,
    D: Clone + Send + 'static,
{
    /// Creates a manager.
    ///
    /// `create` maps a parameter to an operation; `poll` maps an operation
    /// to its next increment, setting the done flag when no further
    /// increments will appear. `expiration`, if set, evicts sessions not
    /// polled within the window. `capacity`, if set, bounds concurrent
    /// sessions.
    pub fn new(
        name: impl Into<String>,
        logger: Logger,
        expiration: Option<Duration>,
        capacity: Option<usize>,
        create: impl Fn(P) -> Deferred<O> + Send + Sync + 'static,
        poll: impl Fn(&O, SessionUuid, &mut bool) -> Deferred<D> + Send + Sync + 'static,
    ) -> Self {
        let name = name.into();
        let inner = Arc::new(ManagerInner {
            logger: logger.named(&name),
            name,
            expiration,
            capacity,
            create: Box::new(create),
            poll: Box::new(poll),
            sessions: Mutex::new(IndexMap::new()),
        });
        let sweeper = expiration.map(|window| {
            Arc::new(SweeperGuard(tokio::spawn(Self::sweep_loop(
                Arc::clone(&inner),
                window,
            ))))
        });
        Self { inner, sweeper }
    }

    /// Starts a session: creates the operation, allocates a unique id and
    /// stores the session.
    pub async fn start(&self, params: P) -> Result<DeltaSession<P, O, D>, CompanionError> {
        if let Some(capacity) = self.inner.capacity {
            let live = self.inner.sessions.lock().expect("session table lock poisoned").len();
            if live >= capacity {
                return Err(SessionError::CapacityExceeded { capacity }.into());
            }
        }
        let operation = (self.inner.create)(params)
            .value()
            .await
            .map_err(future_to_companion)?;
        let id = SessionUuid::new_v4();
        let state = Arc::new(SessionState {
            id,
            operation,
            created_at: Instant::now(),
            last_accessed: Mutex::new(Instant::now()),
            terminal: AtomicBool::new(false),
            poll_gate: tokio::sync::Mutex::new(()),
        });
        {
            let mut sessions = self.inner.sessions.lock().expect("session table lock poisoned");
            // UUIDs are unique for the lifetime of the manager by
            // construction; a collision would be a logic error.
            let existing = sessions.insert(id, Arc::clone(&state));
            assert!(existing.is_none(), "session id collision");
        }
        debug!(manager = %self.inner.name, session = %id, "session started");
        Ok(DeltaSession {
            manager: self.clone(),
            state,
        })
    }

    /// Retrieves a session by id, or the single active session when `id`
    /// is `None`.
    pub fn session(
        &self,
        id: Option<SessionUuid>,
    ) -> Result<DeltaSession<P, O, D>, CompanionError> {
        let sessions = self.inner.sessions.lock().expect("session table lock poisoned");
        let state = match id {
            Some(id) => sessions
                .get(&id)
                .ok_or(SessionError::UnknownSession(id))?
                .clone(),
            None => match sessions.len() {
                0 => return Err(SessionError::NoSessions.into()),
                1 => sessions[0].clone(),
                n => return Err(SessionError::AmbiguousSession(n).into()),
            },
        };
        Ok(DeltaSession {
            manager: self.clone(),
            state,
        })
    }

    /// The number of live sessions.
    pub fn session_count(&self) -> usize {
        self.inner.sessions.lock().expect("session table lock poisoned").len()
    }

    fn remove(&self, id: SessionUuid) {
        let mut sessions = self.inner.sessions.lock().expect("session table lock poisoned");
        sessions.shift_remove(&id);
    }

    async fn sweep_loop(inner: Arc<ManagerInner<P, O, D>>, window: Duration) {
        let mut interval = tokio::time::interval(window.min(Duration::from_secs(10)));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            let expired: Vec<Arc<SessionState<O>>> = {
                let sessions = inner.sessions.lock().expect("session table lock poisoned");
                sessions
                    .values()
                    .filter(|state| {
                        state
                            .last_accessed
                            .lock()
                            .expect("last-access lock poisoned")
                            .elapsed()
                            > window
                    })
                    .cloned()
                    .collect()
            };
            for state in expired {
                debug!(
                    manager = %inner.name,
                    session = %state.id,
                    "session expired without polling"
                );
                // Terminate the underlying operation, then drop the entry.
                state.operation.completed().cancel();
                state.terminal.store(true, Ordering::SeqCst);
                inner
                    .sessions
                    .lock()
                    .expect("session table lock poisoned")
                    .shift_remove(&state.id);
                inner
                    .logger
                    .info(format!("evicted expired session {}", state.id));
            }
        }
    }
}

fn future_to_companion(err: crate::errors::FutureError) -> CompanionError {
    match err {
        crate::errors::FutureError::Rejected(inner) => {
            // The manager never swallows errors; unwrap the shared error or
            // re-describe it when other holders exist.
            match Arc::try_unwrap(inner) {
                Ok(err) => err,
                Err(shared) => CompanionError::Precondition(shared.to_string()),
            }
        }
        other => CompanionError::Precondition(other.to_string()),
    }
}

/// A handle to one identified, incrementally-observable operation.
pub struct DeltaSession<P, O, D> {
    manager: DeltaUpdateManager<P, O, D>,
    state: Arc<SessionState<O>>,
}

impl<P, O, D> Clone for DeltaSession<P, O, D> {
    fn clone(&self) -> Self {
        Self {
            manager: self.manager.clone(),
            state: Arc::clone(&self.state),
        }
    }
}

impl<P, O, D> std::fmt::Debug for DeltaSession<P, O, D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeltaSession")
            .field("id", &self.state.id)
            .finish_non_exhaustive()
    }
}

impl<P, O, D> DeltaSession<P, O, D>
where
    P: Send + 'static,
    O: Continuation,
    D: Clone + Send + 'static,
{
    /// The session's unique identifier.
    pub fn id(&self) -> SessionUuid {
        self.state.id
    }

    /// When the session was created.
    pub fn created_at(&self) -> Instant {
        self.state.created_at
    }

    /// True once the session has produced its final delta.
    pub fn is_terminal(&self) -> bool {
        self.state.terminal.load(Ordering::SeqCst)
    }

    /// The underlying operation.
    pub fn operation(&self) -> &O {
        &self.state.operation
    }

    /// Obtains the increment accumulated since the last poll.
    pub async fn obtain_updates(&self) -> FutureResult<D> {
        self.touch();
        if self.is_terminal() {
            return Err(crate::errors::FutureError::rejected(
                SessionError::SessionTerminated(self.state.id),
            ));
        }
        let _gate = self.state.poll_gate.lock().await;
        let mut done = false;
        let delta =
            (self.manager.inner.poll)(&self.state.operation, self.state.id, &mut done);
        let result = delta.value().await;
        if done {
            self.state.terminal.store(true, Ordering::SeqCst);
            self.manager.remove(self.state.id);
        }
        result
    }

    /// Terminates the session: cancels the operation, drains the final
    /// delta, marks the session terminal and removes it from the manager.
    pub async fn terminate(&self) -> FutureResult<D> {
        self.touch();
        let _gate = self.state.poll_gate.lock().await;
        self.state.operation.completed().cancel();
        let mut done = false;
        let delta =
            (self.manager.inner.poll)(&self.state.operation, self.state.id, &mut done);
        let result = delta.value().await;
        self.state.terminal.store(true, Ordering::SeqCst);
        self.manager.remove(self.state.id);
        debug!(session = %self.state.id, "session terminated");
        result
    }

    fn touch(&self) {
        *self
            .state
            .last_accessed
            .lock()
            .expect("last-access lock poisoned") = Instant::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{
        collections::HashSet,
        sync::atomic::{AtomicUsize, Ordering as AtomicOrdering},
    };

    /// A toy operation producing one counter increment per poll, done after
    /// a fixed number of polls.
    #[derive(Clone)]
    struct CountingOperation {
        completed: Deferred<()>,
        // Held so the completion future stays pending until cancelled.
        _resolver: Arc<crate::fut::Resolver<()>>,
        polls: Arc<AtomicUsize>,
        limit: usize,
    }

    impl Continuation for CountingOperation {
        fn completed(&self) -> Deferred<()> {
            self.completed.clone()
        }
    }

    fn counting_manager(
        capacity: Option<usize>,
        expiration: Option<Duration>,
        limit: usize,
    ) -> DeltaUpdateManager<(), CountingOperation, Vec<usize>> {
        DeltaUpdateManager::new(
            "counting",
            Logger::null(),
            expiration,
            capacity,
            move |()| {
                let (resolver, completed) = Deferred::<()>::new();
                Deferred::resolved(CountingOperation {
                    completed,
                    _resolver: Arc::new(resolver),
                    polls: Arc::new(AtomicUsize::new(0)),
                    limit,
                })
            },
            |operation, _id, done| {
                let count = operation.polls.fetch_add(1, AtomicOrdering::SeqCst) + 1;
                let cancelled = operation.completed.is_done();
                if count >= operation.limit || cancelled {
                    *done = true;
                }
                if cancelled {
                    // Terminal poll after cancellation: empty delta.
                    Deferred::resolved(Vec::new())
                } else {
                    Deferred::resolved(vec![count])
                }
            },
        )
    }

    #[tokio::test]
    async fn ids_are_pairwise_distinct() {
        let manager = counting_manager(None, None, usize::MAX);
        let mut seen = HashSet::new();
        for _ in 0..50 {
            let session = manager.start(()).await.expect("start");
            assert!(seen.insert(session.id()), "duplicate session id");
        }
    }

    #[tokio::test]
    async fn deltas_arrive_in_poll_order() {
        let manager = counting_manager(None, None, usize::MAX);
        let session = manager.start(()).await.expect("start");
        assert_eq!(session.obtain_updates().await.expect("poll"), vec![1]);
        assert_eq!(session.obtain_updates().await.expect("poll"), vec![2]);
        assert_eq!(session.obtain_updates().await.expect("poll"), vec![3]);
    }

    #[tokio::test]
    async fn done_flag_removes_session() {
        let manager = counting_manager(None, None, 2);
        let session = manager.start(()).await.expect("start");
        session.obtain_updates().await.expect("poll 1");
        assert_eq!(manager.session_count(), 1);
        session.obtain_updates().await.expect("poll 2 sets done");
        assert_eq!(manager.session_count(), 0);
        assert!(session.is_terminal());
        assert!(session.obtain_updates().await.is_err());
    }

    #[tokio::test]
    async fn capacity_rejects_then_frees() {
        let manager = counting_manager(Some(1), None, usize::MAX);
        let first = manager.start(()).await.expect("first start");

        let err = manager.start(()).await.expect_err("at capacity");
        assert!(matches!(
            err,
            CompanionError::Session(SessionError::CapacityExceeded { capacity: 1 })
        ));

        first.terminate().await.expect("terminate");
        let third = manager.start(()).await.expect("slot freed");
        assert_eq!(manager.session_count(), 1);
        drop(third);
    }

    #[tokio::test]
    async fn terminate_before_first_poll_returns_empty_terminal_delta() {
        let manager = counting_manager(None, None, usize::MAX);
        let session = manager.start(()).await.expect("start");
        let final_delta = session.terminate().await.expect("terminate");
        assert!(final_delta.is_empty());
        assert!(session.is_terminal());
        assert_eq!(manager.session_count(), 0);
    }

    #[tokio::test]
    async fn terminate_cancels_operation() {
        let manager = counting_manager(None, None, usize::MAX);
        let session = manager.start(()).await.expect("start");
        let completed = session.operation().completed();
        session.terminate().await.expect("terminate");
        assert!(matches!(
            completed.peek(),
            Some(Err(crate::errors::FutureError::Cancelled))
        ));
    }

    #[tokio::test]
    async fn lookup_without_id() {
        let manager = counting_manager(None, None, usize::MAX);
        assert!(matches!(
            manager.session(None),
            Err(CompanionError::Session(SessionError::NoSessions))
        ));

        let only = manager.start(()).await.expect("start");
        let found = manager.session(None).expect("single session");
        assert_eq!(found.id(), only.id());

        manager.start(()).await.expect("second");
        assert!(matches!(
            manager.session(None),
            Err(CompanionError::Session(SessionError::AmbiguousSession(2)))
        ));
    }

    #[tokio::test]
    async fn lookup_by_unknown_id_fails() {
        let manager = counting_manager(None, None, usize::MAX);
        let ghost = SessionUuid::new_v4();
        assert!(matches!(
            manager.session(Some(ghost)),
            Err(CompanionError::Session(SessionError::UnknownSession(id))) if id == ghost
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn expiration_evicts_unpolled_sessions() {
        let manager = counting_manager(None, Some(Duration::from_secs(30)), usize::MAX);
        let session = manager.start(()).await.expect("start");
        let completed = session.operation().completed();

        tokio::time::advance(Duration::from_secs(61)).await;
        // Give the sweeper a chance to run.
        for _ in 0..20 {
            tokio::task::yield_now().await;
            if manager.session_count() == 0 {
                break;
            }
            tokio::time::advance(Duration::from_secs(11)).await;
        }
        assert_eq!(manager.session_count(), 0, "expired session evicted");
        assert!(completed.is_done(), "underlying operation terminated");
    }
}

//! Bounded pool of engine sessions on one lazily launched engine.
//!
//! At most `max_sessions` sessions exist at any time. Callers beyond that
//! queue in FIFO order. A released slot is handed straight to the oldest live
//! waiter with a freshly opened session, so the in-use count only drops when
//! nobody is waiting.

use std::{
    collections::VecDeque,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use metrics::gauge;
use tokio::sync::{Mutex as AsyncMutex, oneshot};
use tracing::{debug, info, warn};

use super::types::{Clip, Engine, EngineError, EngineLauncher, EngineSession, Viewport};
use crate::application::compose::RenderDocument;

const METRIC_SESSIONS_IN_USE: &str = "cardsmith_engine_sessions_in_use";
const METRIC_WAITERS: &str = "cardsmith_engine_waiters";

type SessionResult = Result<Box<dyn EngineSession>, EngineError>;
type Waiter = oneshot::Sender<SessionResult>;

#[derive(Debug, Clone, Copy)]
pub struct PoolConfig {
    pub max_sessions: usize,
    pub acquire_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_sessions: 2,
            acquire_timeout: Duration::from_secs(60),
        }
    }
}

/// Point-in-time view of pool occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub in_use: usize,
    pub waiting: usize,
    pub max_sessions: usize,
    pub launched: bool,
}

#[derive(Clone)]
pub struct EnginePool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    launcher: Arc<dyn EngineLauncher>,
    engine: AsyncMutex<Option<Arc<dyn Engine>>>,
    state: Mutex<PoolState>,
    config: PoolConfig,
}

#[derive(Default)]
struct PoolState {
    in_use: usize,
    waiters: VecDeque<Waiter>,
    launched: bool,
    shut_down: bool,
}

enum Admission {
    Reserved,
    Queued(oneshot::Receiver<SessionResult>),
}

impl EnginePool {
    pub fn new(launcher: Arc<dyn EngineLauncher>, config: PoolConfig) -> Self {
        let config = PoolConfig {
            max_sessions: config.max_sessions.max(1),
            ..config
        };
        Self {
            inner: Arc::new(PoolInner {
                launcher,
                engine: AsyncMutex::new(None),
                state: Mutex::new(PoolState::default()),
                config,
            }),
        }
    }

    /// Borrow a session, waiting up to `acquire_timeout` when all are in use.
    pub async fn acquire(&self) -> Result<PooledSession, EngineError> {
        let admission = {
            let mut state = self.inner.lock_state();
            if state.shut_down {
                return Err(EngineError::unavailable("engine pool is shut down"));
            }
            if state.in_use < self.inner.config.max_sessions {
                state.in_use += 1;
                self.inner.publish(&state);
                Admission::Reserved
            } else {
                let (tx, rx) = oneshot::channel();
                state.waiters.push_back(tx);
                self.inner.publish(&state);
                Admission::Queued(rx)
            }
        };

        let session = match admission {
            Admission::Reserved => match self.inner.open_session().await {
                Ok(session) => session,
                Err(err) => {
                    self.inner.pass_slot().await;
                    return Err(err);
                }
            },
            Admission::Queued(rx) => self.wait_for_handoff(rx).await?,
        };

        Ok(PooledSession {
            session: Some(session),
            pool: self.inner.clone(),
        })
    }

    async fn wait_for_handoff(
        &self,
        mut rx: oneshot::Receiver<SessionResult>,
    ) -> Result<Box<dyn EngineSession>, EngineError> {
        let timeout = self.inner.config.acquire_timeout;
        match tokio::time::timeout(timeout, &mut rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(EngineError::unavailable("engine pool is shut down")),
            Err(_) => {
                // A hand-off may have landed between the deadline and now.
                rx.close();
                match rx.try_recv() {
                    Ok(result) => result,
                    Err(_) => {
                        debug!(
                            target = "cardsmith::render::pool",
                            timeout_ms = timeout.as_millis() as u64,
                            "Gave up waiting for an engine session"
                        );
                        // Drop our closed sender so waiting counts stay honest.
                        let state = self.inner.prune_waiters();
                        self.inner.publish(&state);
                        Err(EngineError::AcquireTimeout(timeout))
                    }
                }
            }
        }
    }

    /// Close `session` and give its slot to the next waiter.
    pub async fn release(&self, session: PooledSession) {
        session.release().await;
    }

    /// Fail all waiters and close the engine. Safe to call more than once.
    pub async fn shutdown(&self) {
        let waiters = {
            let mut state = self.inner.lock_state();
            if state.shut_down {
                return;
            }
            state.shut_down = true;
            let waiters: Vec<Waiter> = state.waiters.drain(..).collect();
            self.inner.publish(&state);
            waiters
        };

        for waiter in waiters {
            let _ = waiter.send(Err(EngineError::unavailable(
                "engine pool is shutting down",
            )));
        }

        let engine = self.inner.engine.lock().await.take();
        if let Some(engine) = engine {
            engine.close().await;
            info!(target = "cardsmith::render::pool", "Engine closed");
        }
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.inner.lock_state();
        PoolStats {
            in_use: state.in_use,
            waiting: state.waiters.iter().filter(|w| !w.is_closed()).count(),
            max_sessions: self.inner.config.max_sessions,
            launched: state.launched,
        }
    }
}

impl PoolInner {
    fn lock_state(&self) -> MutexGuard<'_, PoolState> {
        // The guarded counters stay consistent even if a holder panicked.
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn prune_waiters(&self) -> MutexGuard<'_, PoolState> {
        let mut state = self.lock_state();
        state.waiters.retain(|waiter| !waiter.is_closed());
        state
    }

    fn publish(&self, state: &PoolState) {
        gauge!(METRIC_SESSIONS_IN_USE).set(state.in_use as f64);
        gauge!(METRIC_WAITERS).set(state.waiters.len() as f64);
    }

    async fn engine(&self) -> Result<Arc<dyn Engine>, EngineError> {
        let mut slot = self.engine.lock().await;
        if let Some(engine) = slot.as_ref() {
            return Ok(engine.clone());
        }
        if self.lock_state().shut_down {
            return Err(EngineError::unavailable("engine pool is shut down"));
        }

        let engine = self.launcher.launch().await.map_err(|err| match err {
            EngineError::Unavailable(message) => EngineError::Unavailable(message),
            other => EngineError::unavailable(other.to_string()),
        })?;
        *slot = Some(engine.clone());
        self.lock_state().launched = true;
        info!(target = "cardsmith::render::pool", "Engine launched");
        Ok(engine)
    }

    async fn open_session(&self) -> SessionResult {
        let engine = self.engine().await?;
        engine.open_session().await
    }

    /// Hand the caller's slot to the next live waiter, or free it.
    async fn pass_slot(&self) {
        loop {
            let waiter = {
                let mut state = self.lock_state();
                let next = loop {
                    match state.waiters.pop_front() {
                        Some(waiter) if waiter.is_closed() => continue,
                        other => break other,
                    }
                };
                match next {
                    Some(waiter) if !state.shut_down => {
                        self.publish(&state);
                        waiter
                    }
                    _ => {
                        state.in_use = state.in_use.saturating_sub(1);
                        self.publish(&state);
                        return;
                    }
                }
            };

            match self.open_session().await {
                Ok(session) => match waiter.send(Ok(session)) {
                    Ok(()) => return,
                    Err(Ok(mut session)) => {
                        // The waiter timed out while we were opening.
                        session.close().await;
                    }
                    Err(Err(_)) => {}
                },
                Err(err) => {
                    warn!(
                        target = "cardsmith::render::pool",
                        error = %err,
                        "Failed to open a session for a queued render"
                    );
                    let _ = waiter.send(Err(err));
                }
            }
        }
    }
}

async fn return_session(pool: Arc<PoolInner>, mut session: Box<dyn EngineSession>) {
    session.close().await;
    pool.pass_slot().await;
}

/// A session borrowed from an [`EnginePool`].
///
/// Dropping it without calling [`PooledSession::release`] still returns the
/// slot, from a spawned task.
pub struct PooledSession {
    session: Option<Box<dyn EngineSession>>,
    pool: Arc<PoolInner>,
}

impl PooledSession {
    fn live(&mut self) -> Result<&mut Box<dyn EngineSession>, EngineError> {
        self.session
            .as_mut()
            .ok_or_else(|| EngineError::session("session already released"))
    }

    pub async fn set_viewport(&mut self, viewport: Viewport) -> Result<(), EngineError> {
        self.live()?.set_viewport(viewport).await
    }

    pub async fn load(&mut self, document: &RenderDocument) -> Result<(), EngineError> {
        self.live()?.load(document).await
    }

    pub async fn capture(&mut self, clip: Clip) -> Result<bytes::Bytes, EngineError> {
        self.live()?.capture(clip).await
    }

    pub async fn release(mut self) {
        if let Some(session) = self.session.take() {
            return_session(self.pool.clone(), session).await;
        }
    }
}

impl Drop for PooledSession {
    fn drop(&mut self) {
        let Some(session) = self.session.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(return_session(self.pool.clone(), session));
            }
            Err(_) => {
                // No runtime left to close on; free the slot so the count stays right.
                drop(session);
                let mut state = self.pool.lock_state();
                state.in_use = state.in_use.saturating_sub(1);
                self.pool.publish(&state);
            }
        }
    }
}

use anyhow::Result;
use futures::FutureExt;
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Mutex, Notify, Semaphore};
use tracing::{debug, error, info, warn};

use crate::browser::driver::SessionProvider;
use crate::browser::session::BrowserSession;

/// How long force_kill waits for any one session to quit
const FORCE_CLOSE_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("session pool is not initialized")]
    NotInitialized,

    #[error("session pool is draining and admits no new work")]
    Draining,

    #[error("session pool is closed")]
    Closed,

    #[error("pooled task panicked")]
    TaskPanicked,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PoolState {
    Uninitialized = 0,
    Initializing = 1,
    Ready = 2,
    Draining = 3,
    Closed = 4,
}

impl PoolState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => PoolState::Uninitialized,
            1 => PoolState::Initializing,
            2 => PoolState::Ready,
            3 => PoolState::Draining,
            _ => PoolState::Closed,
        }
    }

    fn admission_error(self) -> PoolError {
        match self {
            PoolState::Uninitialized | PoolState::Initializing => PoolError::NotInitialized,
            PoolState::Draining => PoolError::Draining,
            _ => PoolError::Closed,
        }
    }
}

/// Health snapshot of the pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolStatus {
    pub initialized: bool,
    pub active_sessions: usize,
    pub capacity: usize,
}

/// Decrements the active counter however the borrow ends
struct ActiveGuard<'a> {
    active: &'a AtomicUsize,
    drained: &'a Notify,
}

impl<'a> ActiveGuard<'a> {
    fn enter(active: &'a AtomicUsize, drained: &'a Notify) -> Self {
        active.fetch_add(1, Ordering::SeqCst);
        Self { active, drained }
    }
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        if self.active.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.drained.notify_waiters();
        }
    }
}

/// Bounded set of browser sessions lent out one task at a time.
///
/// The semaphore is the only admission gate: a task holds a permit for as
/// long as it holds a session, so borrowed sessions never exceed
/// `capacity`. Sessions are cleared before they go back to the idle list
/// and discarded if clearing fails.
///
/// Every session the pool created and has not discarded, borrowed or
/// idle, stays in `live` so `force_kill` can reach it.
pub struct SessionPool {
    provider: Arc<dyn SessionProvider>,
    capacity: usize,
    state: AtomicU8,
    permits: Semaphore,
    idle: Mutex<Vec<Arc<dyn BrowserSession>>>,
    live: Mutex<HashMap<String, Arc<dyn BrowserSession>>>,
    active: AtomicUsize,
    drained: Notify,
}

impl SessionPool {
    pub fn new(provider: Arc<dyn SessionProvider>, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            provider,
            capacity,
            state: AtomicU8::new(PoolState::Uninitialized as u8),
            permits: Semaphore::new(capacity),
            idle: Mutex::new(Vec::with_capacity(capacity)),
            live: Mutex::new(HashMap::new()),
            active: AtomicUsize::new(0),
            drained: Notify::new(),
        }
    }

    pub fn state(&self) -> PoolState {
        PoolState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn transition(&self, from: PoolState, to: PoolState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Start the session provider. Calling it on a ready pool is a no-op.
    pub async fn init(&self) -> Result<()> {
        if self.state() == PoolState::Ready {
            return Ok(());
        }
        if !self.transition(PoolState::Uninitialized, PoolState::Initializing) {
            return Err(self.state().admission_error().into());
        }

        info!("Initializing session pool with capacity {}", self.capacity);
        match self.provider.start().await {
            Ok(()) => {
                if !self.transition(PoolState::Initializing, PoolState::Ready) {
                    // force_kill ran while the provider was starting
                    return Err(PoolError::Closed.into());
                }
                info!("Session pool ready");
                Ok(())
            }
            Err(e) => {
                self.transition(PoolState::Initializing, PoolState::Uninitialized);
                Err(e.context("Failed to start session provider"))
            }
        }
    }

    /// Run `task` with a session borrowed from the pool.
    ///
    /// Waits for a free slot, then reuses an idle session or creates one.
    /// The session is cleared after the task ends, whether it returned an
    /// error or panicked, and the task's own result is returned.
    pub async fn acquire_and_run<F, Fut, T>(&self, task: F) -> Result<T>
    where
        F: FnOnce(Arc<dyn BrowserSession>) -> Fut + Send,
        Fut: Future<Output = Result<T>> + Send,
        T: Send,
    {
        let state = self.state();
        if state != PoolState::Ready {
            return Err(state.admission_error().into());
        }

        let _permit = match self.permits.acquire().await {
            Ok(permit) => permit,
            Err(_) => return Err(self.state().admission_error().into()),
        };

        // close() may have started while this call was queued
        let state = self.state();
        if state != PoolState::Ready {
            return Err(state.admission_error().into());
        }

        let _active = ActiveGuard::enter(&self.active, &self.drained);

        let session = self.checkout().await?;
        let session_id = session.id();
        debug!("[{}] Session borrowed ({} active)", session_id, self.active.load(Ordering::SeqCst));

        let outcome = AssertUnwindSafe(task(session.clone())).catch_unwind().await;

        self.release(session).await;

        match outcome {
            Ok(result) => result,
            Err(_) => {
                error!("[{}] Pooled task panicked", session_id);
                Err(PoolError::TaskPanicked.into())
            }
        }
    }

    async fn checkout(&self) -> Result<Arc<dyn BrowserSession>> {
        loop {
            let reused = self.idle.lock().await.pop();
            match reused {
                Some(session) if session.is_alive().await => return Ok(session),
                Some(session) => {
                    warn!("[{}] Idle session is no longer alive, replacing it", session.id());
                    self.discard(session).await;
                }
                None => {
                    let session = self.provider.create_session().await?;
                    self.live.lock().await.insert(session.id(), session.clone());
                    return Ok(session);
                }
            }
        }
    }

    /// Clear a returned session and put it back, or discard it
    async fn release(&self, session: Arc<dyn BrowserSession>) {
        let id = session.id();

        if let Err(e) = session.clear_state().await {
            warn!("[{}] Failed to clear session state, discarding session: {:#}", id, e);
            self.discard(session).await;
            return;
        }

        if self.state() == PoolState::Ready {
            self.idle.lock().await.push(session);
            debug!("[{}] Session returned to pool", id);
        } else {
            self.discard(session).await;
        }
    }

    async fn discard(&self, session: Arc<dyn BrowserSession>) {
        self.live.lock().await.remove(&session.id());
        let age = chrono::Utc::now() - session.created_at();
        debug!("[{}] Discarding session after {} s", session.id(), age.num_seconds());
        if let Err(e) = session.close().await {
            warn!("[{}] Failed to close session: {:#}", session.id(), e);
        }
    }

    async fn wait_for_drain(&self) {
        loop {
            let notified = self.drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.active.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Stop admitting work, wait up to `timeout` for borrowed sessions to
    /// come back, then release every pooled resource.
    ///
    /// Returns an error when sessions were still borrowed at the deadline
    /// or the provider failed to shut down; callers fall back to
    /// `force_kill` in that case.
    pub async fn close(&self, timeout: Duration) -> Result<()> {
        loop {
            match self.state() {
                PoolState::Ready => {
                    if self.transition(PoolState::Ready, PoolState::Draining) {
                        break;
                    }
                }
                PoolState::Uninitialized | PoolState::Initializing => {
                    self.state.store(PoolState::Closed as u8, Ordering::SeqCst);
                    self.permits.close();
                    return Ok(());
                }
                PoolState::Draining | PoolState::Closed => return Ok(()),
            }
        }

        info!("Draining session pool ({} active sessions)", self.active.load(Ordering::SeqCst));
        self.permits.close();

        let drained = tokio::time::timeout(timeout, self.wait_for_drain()).await.is_ok();
        let still_active = self.active.load(Ordering::SeqCst);
        if !drained {
            warn!(
                "{} sessions still active after {} ms; closing the pool anyway",
                still_active,
                timeout.as_millis()
            );
        }

        let idle: Vec<_> = self.idle.lock().await.drain(..).collect();
        for session in idle {
            self.discard(session).await;
        }

        let shutdown = self.provider.shutdown().await;
        self.state.store(PoolState::Closed as u8, Ordering::SeqCst);

        if let Err(e) = shutdown {
            error!("Session provider shutdown failed: {:#}", e);
            return Err(e.context("Failed to shut down session provider"));
        }
        if !drained {
            anyhow::bail!("{} sessions still active when the pool closed", still_active);
        }

        info!("Session pool closed");
        Ok(())
    }

    /// Terminate the backing process(es) without the graceful protocol.
    /// In-flight tasks lose their sessions.
    ///
    /// When the provider owns no process (a remote driver), every live
    /// session is quit directly instead, each bounded by a short timeout.
    pub async fn force_kill(&self) {
        warn!("Force-killing session pool");
        self.state.store(PoolState::Closed as u8, Ordering::SeqCst);
        self.permits.close();
        self.idle.lock().await.clear();
        let sessions: Vec<_> = self.live.lock().await.drain().map(|(_, session)| session).collect();

        if !self.provider.owns_process() {
            let closes = sessions.iter().map(|session| async move {
                match tokio::time::timeout(FORCE_CLOSE_TIMEOUT, session.close()).await {
                    Ok(Ok(())) => debug!("[{}] Session quit", session.id()),
                    Ok(Err(e)) => warn!("[{}] Failed to quit session: {:#}", session.id(), e),
                    Err(_) => warn!(
                        "[{}] Session did not quit within {} ms",
                        session.id(),
                        FORCE_CLOSE_TIMEOUT.as_millis()
                    ),
                }
            });
            futures::future::join_all(closes).await;
        }

        self.provider.force_kill().await;
    }

    pub fn status(&self) -> PoolStatus {
        PoolStatus {
            initialized: self.state() == PoolState::Ready,
            active_sessions: self.active.load(Ordering::SeqCst),
            capacity: self.capacity,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::session::MockBrowserSession;
    use crate::browser::stub::{StubListing, StubProvider, StubSite};
    use async_trait::async_trait;
    use std::sync::atomic::AtomicBool;

    fn provider() -> Arc<StubProvider> {
        Arc::new(StubProvider::new(StubSite::new(vec![StubListing::growing(5, 5, 2)])))
    }

    async fn ready_pool(provider: Arc<StubProvider>, capacity: usize) -> Arc<SessionPool> {
        let pool = Arc::new(SessionPool::new(provider, capacity));
        pool.init().await.unwrap();
        pool
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_borrows_never_exceed_capacity() {
        let provider = provider();
        let pool = ready_pool(provider.clone(), 3).await;
        let current = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let pool = pool.clone();
            let current = current.clone();
            let peak = peak.clone();
            handles.push(tokio::spawn(async move {
                pool.acquire_and_run(|_session| async move {
                    let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    current.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                })
                .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(peak.load(Ordering::SeqCst), 3);
        assert!(provider.sessions_created() <= 3);
        assert_eq!(pool.status().active_sessions, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn session_state_is_cleared_after_success_and_failure() {
        let provider = provider();
        let pool = ready_pool(provider.clone(), 1).await;

        let id = pool
            .acquire_and_run(|session| async move {
                session.navigate("https://shop.example.com/search?q=a").await?;
                Ok(session.id())
            })
            .await
            .unwrap();
        assert!(provider.page(&id).unwrap().cookies().is_empty());

        let failed: Result<()> = pool
            .acquire_and_run(|session| async move {
                session.navigate("https://shop.example.com/search?q=b").await?;
                anyhow::bail!("extraction exploded")
            })
            .await;
        assert!(failed.is_err());

        // the next borrower gets the same session without leftover cookies
        let provider_for_check = provider.clone();
        let leftover = pool
            .acquire_and_run(move |session| async move {
                Ok(provider_for_check.page(&session.id()).unwrap().cookies())
            })
            .await
            .unwrap();
        assert!(leftover.is_empty());
        assert_eq!(provider.sessions_created(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn panicking_task_is_reported_and_slot_released() {
        let provider = provider();
        let pool = ready_pool(provider.clone(), 1).await;

        async fn explode() -> Result<()> {
            panic!("boom")
        }

        let result = pool.acquire_and_run(|_session| explode()).await;
        let error = result.unwrap_err();
        assert!(matches!(error.downcast_ref::<PoolError>(), Some(PoolError::TaskPanicked)));
        assert_eq!(pool.status().active_sessions, 0);

        tokio_test::assert_ok!(pool.acquire_and_run(|_session| async move { Ok(()) }).await);
    }

    #[tokio::test]
    async fn uninitialized_pool_rejects_work() {
        let pool = SessionPool::new(provider(), 1);
        let result: Result<()> = pool.acquire_and_run(|_session| async move { Ok(()) }).await;
        assert!(matches!(
            result.unwrap_err().downcast_ref::<PoolError>(),
            Some(PoolError::NotInitialized)
        ));
        assert!(!pool.status().initialized);
    }

    #[tokio::test]
    async fn failed_start_leaves_pool_uninitialized() {
        let provider = Arc::new(StubProvider::failing_start(StubSite::new(vec![])));
        let pool = SessionPool::new(provider, 1);
        assert!(pool.init().await.is_err());
        assert_eq!(pool.state(), PoolState::Uninitialized);
    }

    #[tokio::test(start_paused = true)]
    async fn close_waits_for_in_flight_work() {
        let provider = provider();
        let pool = ready_pool(provider.clone(), 2).await;

        let (started_tx, started_rx) = tokio::sync::oneshot::channel();
        let worker_pool = pool.clone();
        let in_flight = tokio::spawn(async move {
            worker_pool
                .acquire_and_run(move |_session| async move {
                    let _ = started_tx.send(());
                    tokio::time::sleep(Duration::from_millis(500)).await;
                    Ok(42)
                })
                .await
        });
        started_rx.await.unwrap();
        assert_eq!(pool.status().active_sessions, 1);

        tokio_test::assert_ok!(pool.close(Duration::from_secs(2)).await);
        assert_eq!(in_flight.await.unwrap().unwrap(), 42);
        assert_eq!(pool.state(), PoolState::Closed);
        assert!(provider.was_shut_down());
        assert!(provider.pages().iter().all(|p| p.is_closed()));

        let late: Result<()> = pool.acquire_and_run(|_session| async move { Ok(()) }).await;
        assert!(matches!(late.unwrap_err().downcast_ref::<PoolError>(), Some(PoolError::Closed)));
    }

    #[tokio::test(start_paused = true)]
    async fn close_times_out_and_force_kill_finishes_the_job() {
        let provider = provider();
        let pool = ready_pool(provider.clone(), 1).await;

        let (started_tx, started_rx) = tokio::sync::oneshot::channel();
        let worker_pool = pool.clone();
        let _stuck = tokio::spawn(async move {
            worker_pool
                .acquire_and_run(move |_session| async move {
                    let _ = started_tx.send(());
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    Ok(())
                })
                .await
        });
        started_rx.await.unwrap();

        let closed = pool.close(Duration::from_secs(1)).await;
        assert!(closed.is_err());

        pool.force_kill().await;
        assert!(provider.was_killed());
        assert_eq!(pool.state(), PoolState::Closed);
    }

    #[tokio::test]
    async fn status_reports_capacity() {
        let pool = ready_pool(provider(), 4).await;
        assert_eq!(
            pool.status(),
            PoolStatus {
                initialized: true,
                active_sessions: 0,
                capacity: 4,
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn force_kill_quits_sessions_on_a_remote_driver() {
        let provider = Arc::new(StubProvider::remote(StubSite::new(vec![StubListing::growing(5, 5, 2)])));
        let pool = ready_pool(provider.clone(), 2).await;

        let (started_tx, started_rx) = tokio::sync::oneshot::channel();
        let worker_pool = pool.clone();
        let _stuck = tokio::spawn(async move {
            worker_pool
                .acquire_and_run(move |_session| async move {
                    let _ = started_tx.send(());
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    Ok(())
                })
                .await
        });
        started_rx.await.unwrap();

        // a second session that goes back to the idle list
        pool.acquire_and_run(|_session| async move { Ok(()) }).await.unwrap();
        assert_eq!(provider.sessions_created(), 2);
        assert!(provider.pages().iter().all(|p| !p.is_closed()));

        pool.force_kill().await;

        assert!(provider.was_killed());
        assert!(provider.pages().iter().all(|p| p.is_closed()));
        assert_eq!(pool.state(), PoolState::Closed);
    }

    /// Hands out prepared sessions in order
    struct ScriptedProvider {
        sessions: std::sync::Mutex<Vec<Arc<dyn BrowserSession>>>,
        shut_down: AtomicBool,
    }

    #[async_trait]
    impl SessionProvider for ScriptedProvider {
        async fn start(&self) -> Result<()> {
            Ok(())
        }

        async fn create_session(&self) -> Result<Arc<dyn BrowserSession>> {
            let mut sessions = self.sessions.lock().unwrap();
            anyhow::ensure!(!sessions.is_empty(), "no sessions left");
            Ok(sessions.remove(0))
        }

        async fn shutdown(&self) -> Result<()> {
            self.shut_down.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn force_kill(&self) {}

        fn owns_process(&self) -> bool {
            false
        }
    }

    fn scripted_session(
        id: &str,
        clears: bool,
        closes: bool,
        closed: Arc<std::sync::Mutex<Vec<String>>>,
    ) -> Arc<dyn BrowserSession> {
        let name = id.to_string();
        let mut session = MockBrowserSession::new();
        session.expect_id().return_const(name.clone());
        session.expect_created_at().return_const(chrono::Utc::now());
        session.expect_is_alive().returning(|| true);
        session.expect_clear_state().returning(move || {
            if clears {
                Ok(())
            } else {
                Err(anyhow::anyhow!("localStorage is not available"))
            }
        });
        session.expect_close().returning(move || {
            closed.lock().unwrap().push(name.clone());
            if closes {
                Ok(())
            } else {
                Err(anyhow::anyhow!("invalid session id"))
            }
        });
        Arc::new(session)
    }

    #[tokio::test]
    async fn failed_cleanup_discards_the_session_and_close_keeps_going() {
        let closed = Arc::new(std::sync::Mutex::new(Vec::new()));
        let provider = Arc::new(ScriptedProvider {
            sessions: std::sync::Mutex::new(vec![
                scripted_session("s0", false, false, closed.clone()),
                scripted_session("s1", true, false, closed.clone()),
                scripted_session("s2", true, true, closed.clone()),
            ]),
            shut_down: AtomicBool::new(false),
        });
        let pool = SessionPool::new(provider.clone(), 2);
        pool.init().await.unwrap();

        let first = pool.acquire_and_run(|session| async move { Ok(session.id()) }).await.unwrap();
        assert_eq!(first, "s0");
        assert_eq!(*closed.lock().unwrap(), vec!["s0".to_string()]);

        // s0 could not be cleared, so it is never lent out again
        let second = pool.acquire_and_run(|session| async move { Ok(session.id()) }).await.unwrap();
        assert_eq!(second, "s1");

        let (a, b) = tokio::join!(
            pool.acquire_and_run(|session| async move {
                tokio::task::yield_now().await;
                Ok(session.id())
            }),
            pool.acquire_and_run(|session| async move {
                tokio::task::yield_now().await;
                Ok(session.id())
            }),
        );
        let mut borrowed = vec![a.unwrap(), b.unwrap()];
        borrowed.sort();
        assert_eq!(borrowed, vec!["s1".to_string(), "s2".to_string()]);

        // s1 fails to close; s2 is still closed and the provider shut down
        tokio_test::assert_ok!(pool.close(Duration::from_secs(1)).await);
        let mut attempted = closed.lock().unwrap().clone();
        attempted.sort();
        assert_eq!(attempted, vec!["s0".to_string(), "s1".to_string(), "s2".to_string()]);
        assert!(provider.shut_down.load(Ordering::SeqCst));
        assert_eq!(pool.state(), PoolState::Closed);
    }
}

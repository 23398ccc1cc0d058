//! Browser automation seam and session pool.
//!
//! The browser backend itself lives outside this crate; it plugs in through
//! [`BrowserLauncher`] and [`BrowserSession`]. [`BrowserPool`] bounds how many
//! sessions exist and hands them out one caller at a time. A [`BrowserLease`]
//! puts its session back when dropped, whatever the exit path.

use async_trait::async_trait;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::{Semaphore, SemaphorePermit};

use super::{CollectError, CollectRequest, Collector, RawPage, ScrapeMethod};

/// One live browser instance.
#[async_trait]
pub trait BrowserSession: Send {
    async fn navigate(&mut self, request: &CollectRequest) -> Result<RawPage, CollectError>;

    async fn close(&mut self) {}
}

#[async_trait]
pub trait BrowserLauncher: Send + Sync {
    async fn launch(&self, headless: bool) -> Result<Box<dyn BrowserSession>, CollectError>;
}

/// How long [`BrowserPool::close`] waits for outstanding leases by default.
pub const DEFAULT_CLOSE_GRACE: Duration = Duration::from_secs(30);

pub struct BrowserPool {
    size: usize,
    close_grace: Duration,
    permits: Semaphore,
    sessions: Mutex<Vec<Box<dyn BrowserSession>>>,
}

impl std::fmt::Debug for BrowserPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrowserPool")
            .field("size", &self.size)
            .field("available", &self.available())
            .finish()
    }
}

impl BrowserPool {
    pub fn from_sessions(sessions: Vec<Box<dyn BrowserSession>>) -> Self {
        let size = sessions.len();
        Self {
            size,
            close_grace: DEFAULT_CLOSE_GRACE,
            permits: Semaphore::new(size),
            sessions: Mutex::new(sessions),
        }
    }

    /// Launches `size` sessions up front. On failure, the sessions already
    /// launched are closed before the error is returned.
    pub async fn launch(
        launcher: &dyn BrowserLauncher,
        size: usize,
        headless: bool,
    ) -> Result<Self, CollectError> {
        let mut sessions = Vec::with_capacity(size);
        for _ in 0..size {
            match launcher.launch(headless).await {
                Ok(session) => sessions.push(session),
                Err(err) => {
                    log::error!(
                        "browser launch failed after {} of {} sessions: {}",
                        sessions.len(),
                        size,
                        err
                    );
                    for mut session in sessions {
                        session.close().await;
                    }
                    return Err(err);
                }
            }
        }
        log::info!("browser pool of {} sessions ready", sessions.len());
        Ok(Self::from_sessions(sessions))
    }

    pub fn with_close_grace(mut self, grace: Duration) -> Self {
        self.close_grace = grace;
        self
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    /// Waits for a free session. Fails only once the pool is closed.
    pub async fn acquire(&self) -> Result<BrowserLease<'_>, CollectError> {
        let permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| CollectError::Unavailable("browser pool closed".into()))?;
        let session = self
            .sessions
            .lock()
            .expect("browser pool poisoned")
            .pop()
            .ok_or_else(|| CollectError::Unavailable("browser pool drained".into()))?;
        Ok(BrowserLease {
            pool: self,
            session: Some(session),
            _permit: permit,
        })
    }

    /// Refuses new leases and closes every session.
    ///
    /// Outstanding leases get the close grace to come back. A lease returned
    /// after that has its session closed on the runtime instead of pooled.
    pub async fn close(&self) {
        let all = u32::try_from(self.size).unwrap_or(u32::MAX);
        let returned = tokio::time::timeout(self.close_grace, self.permits.acquire_many(all)).await;
        if returned.is_err() {
            log::warn!(
                "closing browser pool with {} sessions still leased",
                self.size.saturating_sub(self.available())
            );
        }

        let idle: Vec<_> = {
            let mut sessions = self.sessions.lock().expect("browser pool poisoned");
            self.permits.close();
            sessions.drain(..).collect()
        };
        drop(returned);
        for mut session in idle {
            session.close().await;
        }
        log::info!("browser pool closed");
    }
}

/// Exclusive use of one pooled session.
pub struct BrowserLease<'a> {
    pool: &'a BrowserPool,
    session: Option<Box<dyn BrowserSession>>,
    _permit: SemaphorePermit<'a>,
}

impl BrowserLease<'_> {
    pub fn session(&mut self) -> &mut dyn BrowserSession {
        self.session
            .as_deref_mut()
            .expect("lease holds its session until dropped")
    }
}

impl Drop for BrowserLease<'_> {
    fn drop(&mut self) {
        let Some(mut session) = self.session.take() else {
            return;
        };
        // Checked under the sessions lock, which close() holds while closing
        // the semaphore, so a session is either pooled before the drain or
        // closed here.
        let mut sessions = self.pool.sessions.lock().expect("browser pool poisoned");
        if !self.pool.permits.is_closed() {
            sessions.push(session);
            return;
        }
        drop(sessions);
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move { session.close().await });
            }
            Err(_) => log::warn!("browser session released after pool close, outside a runtime"),
        }
    }
}

/// Collector backed by the engine's browser pool, once one is installed.
#[derive(Debug, Default)]
pub struct BrowserCollector {
    pool: RwLock<Option<Arc<BrowserPool>>>,
}

impl BrowserCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn install(&self, pool: Arc<BrowserPool>) {
        *self.pool.write().expect("browser collector poisoned") = Some(pool);
    }

    pub fn take(&self) -> Option<Arc<BrowserPool>> {
        self.pool.write().expect("browser collector poisoned").take()
    }

    pub fn pool(&self) -> Option<Arc<BrowserPool>> {
        self.pool.read().expect("browser collector poisoned").clone()
    }
}

#[async_trait]
impl Collector for BrowserCollector {
    fn method(&self) -> ScrapeMethod {
        ScrapeMethod::Browser
    }

    async fn collect(&self, request: &CollectRequest) -> Result<RawPage, CollectError> {
        let pool = self
            .pool()
            .ok_or_else(|| CollectError::Unavailable("browser backend not started".into()))?;
        // Waiting for a free session is not bounded; navigation is.
        let mut lease = pool.acquire().await?;
        tokio::time::timeout(request.timeout, lease.session().navigate(request))
            .await
            .map_err(|_| CollectError::Timeout(request.timeout))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use url::Url;

    struct SleepySession {
        id: usize,
        active: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
        closed: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl BrowserSession for SleepySession {
        async fn navigate(&mut self, request: &CollectRequest) -> Result<RawPage, CollectError> {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_secs(5)).await;
            self.active.fetch_sub(1, Ordering::SeqCst);
            Ok(RawPage::html(200, request.url.clone(), format!("session {}", self.id)))
        }

        async fn close(&mut self) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Launcher {
        launched: AtomicUsize,
        fail_at: Option<usize>,
        active: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
        closed: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl BrowserLauncher for Launcher {
        async fn launch(&self, _headless: bool) -> Result<Box<dyn BrowserSession>, CollectError> {
            let id = self.launched.fetch_add(1, Ordering::SeqCst);
            if self.fail_at == Some(id) {
                return Err(CollectError::Backend("chromium exited".into()));
            }
            Ok(Box::new(SleepySession {
                id,
                active: self.active.clone(),
                peak: self.peak.clone(),
                closed: self.closed.clone(),
            }))
        }
    }

    fn launcher() -> Launcher {
        Launcher {
            launched: AtomicUsize::new(0),
            fail_at: None,
            active: Arc::new(AtomicUsize::new(0)),
            peak: Arc::new(AtomicUsize::new(0)),
            closed: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn request() -> CollectRequest {
        CollectRequest::new(Url::parse("https://example.com/").unwrap(), "generic")
    }

    #[tokio::test(start_paused = true)]
    async fn exhaustion_serializes_callers() {
        let launcher = launcher();
        let pool = Arc::new(BrowserPool::launch(&launcher, 2, true).await.unwrap());
        let collector = Arc::new(BrowserCollector::new());
        collector.install(pool.clone());

        let mut handles = Vec::new();
        for _ in 0..5 {
            let collector = collector.clone();
            handles.push(tokio::spawn(async move { collector.collect(&request()).await }));
        }
        for handle in handles {
            assert!(handle.await.unwrap().is_ok());
        }

        assert_eq!(launcher.peak.load(Ordering::SeqCst), 2);
        assert_eq!(pool.available(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_lease_returns_session() {
        let launcher = launcher();
        let pool = BrowserPool::launch(&launcher, 1, true).await.unwrap();

        let attempt = async {
            let mut lease = pool.acquire().await?;
            lease.session().navigate(&request()).await
        };
        let timed_out = tokio::time::timeout(Duration::from_secs(1), attempt).await;
        assert!(timed_out.is_err());
        assert_eq!(pool.available(), 1);

        let mut lease = pool.acquire().await.unwrap();
        assert!(lease.session().navigate(&request()).await.is_ok());
    }

    #[tokio::test]
    async fn missing_backend_fails_fast() {
        let collector = BrowserCollector::new();
        let err = collector.collect(&request()).await.unwrap_err();
        assert!(matches!(err, CollectError::Unavailable(_)));
    }

    #[tokio::test]
    async fn closed_pool_refuses_leases() {
        let launcher = launcher();
        let pool = BrowserPool::launch(&launcher, 1, true).await.unwrap();
        pool.close().await;
        assert!(pool.acquire().await.is_err());
    }

    #[tokio::test]
    async fn failed_launch_closes_started_sessions() {
        let launcher = Launcher {
            fail_at: Some(2),
            ..launcher()
        };
        let err = BrowserPool::launch(&launcher, 3, true).await.unwrap_err();
        assert!(matches!(err, CollectError::Backend(_)));
        assert_eq!(launcher.closed.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn close_waits_for_outstanding_lease() {
        let launcher = launcher();
        let pool = BrowserPool::launch(&launcher, 2, true).await.unwrap();
        let lease = pool.acquire().await.unwrap();

        let release = async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            drop(lease);
        };
        tokio::join!(pool.close(), release);

        assert_eq!(launcher.closed.load(Ordering::SeqCst), 2);
        assert!(pool.acquire().await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn lease_outliving_close_grace_is_still_closed() {
        let launcher = launcher();
        let pool = BrowserPool::launch(&launcher, 1, true)
            .await
            .unwrap()
            .with_close_grace(Duration::from_secs(5));
        let lease = pool.acquire().await.unwrap();

        pool.close().await;
        assert_eq!(launcher.closed.load(Ordering::SeqCst), 0);

        drop(lease);
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(launcher.closed.load(Ordering::SeqCst), 1);
    }
}

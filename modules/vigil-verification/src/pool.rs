//! Browser session pool.
//!
//! Checked-out sessions are bounded by a semaphore. Idle sessions are kept in
//! a small list and probed before reuse; a failed probe closes the session and
//! a fresh one is opened. The backend's initializer runs once, shared by
//! concurrent first callers, with retry and exponential backoff. A failed
//! initialization is not remembered, so the next acquire tries again.

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use rand::Rng;
use tokio::sync::{OnceCell, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};

use vigil_common::config::BrowserConfig;

use crate::error::{Result, VerificationError};
use crate::session::{BrowserSession, SessionBackend};

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub max_sessions: usize,
    pub max_idle: usize,
    pub probe_timeout: Duration,
    pub init_timeout: Duration,
    /// Total initialization attempts per acquire.
    pub init_retries: u32,
    pub init_backoff: Duration,
}

impl From<&BrowserConfig> for PoolConfig {
    fn from(config: &BrowserConfig) -> Self {
        Self {
            max_sessions: config.max_sessions.max(1),
            max_idle: config.max_idle,
            probe_timeout: Duration::from_secs(config.probe_timeout_secs),
            init_timeout: Duration::from_secs(config.init_timeout_secs),
            init_retries: config.init_retries.max(1),
            init_backoff: Duration::from_millis(500),
        }
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self::from(&BrowserConfig::default())
    }
}

/// A checked-out session. Hand it back with [`SessionPool::release`];
/// dropping it instead discards the session without closing it.
pub struct PooledSession {
    session: Box<dyn BrowserSession>,
    _permit: OwnedSemaphorePermit,
}

impl Deref for PooledSession {
    type Target = dyn BrowserSession;

    fn deref(&self) -> &Self::Target {
        self.session.as_ref()
    }
}

impl DerefMut for PooledSession {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.session.as_mut()
    }
}

pub struct SessionPool {
    backend: Arc<dyn SessionBackend>,
    config: PoolConfig,
    permits: Arc<Semaphore>,
    idle: Mutex<Vec<Box<dyn BrowserSession>>>,
    initialized: OnceCell<()>,
    opened: AtomicUsize,
}

impl SessionPool {
    pub fn new(backend: Arc<dyn SessionBackend>, config: PoolConfig) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(config.max_sessions)),
            backend,
            config,
            idle: Mutex::new(Vec::new()),
            initialized: OnceCell::new(),
            opened: AtomicUsize::new(0),
        }
    }

    fn idle_list(&self) -> MutexGuard<'_, Vec<Box<dyn BrowserSession>>> {
        self.idle.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn idle_count(&self) -> usize {
        self.idle_list().len()
    }

    /// Sessions opened over the pool's lifetime.
    pub fn opened_count(&self) -> usize {
        self.opened.load(Ordering::Relaxed)
    }

    pub async fn acquire(&self) -> Result<PooledSession> {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| VerificationError::SessionUnavailable("pool closed".to_string()))?;

        loop {
            let Some(mut session) = self.idle_list().pop() else {
                break;
            };
            match tokio::time::timeout(self.config.probe_timeout, session.probe()).await {
                Ok(Ok(())) if session.is_healthy() => {
                    debug!("Reusing idle browser session");
                    return Ok(PooledSession {
                        session,
                        _permit: permit,
                    });
                }
                Ok(Ok(())) => debug!("Idle session unhealthy, replacing"),
                Ok(Err(e)) => warn!(error = %e, "Idle session failed probe, replacing"),
                Err(_) => warn!("Idle session probe timed out, replacing"),
            }
            session.close().await;
        }

        self.ensure_initialized().await?;

        let session =
            tokio::time::timeout(self.config.init_timeout, self.backend.open_session()).await??;
        self.opened.fetch_add(1, Ordering::Relaxed);
        Ok(PooledSession {
            session,
            _permit: permit,
        })
    }

    /// Return a session. Healthy sessions are kept while the idle list has
    /// room; everything else is closed.
    pub async fn release(&self, pooled: PooledSession) {
        let PooledSession { session, _permit } = pooled;

        let to_close = if session.is_healthy() {
            let mut idle = self.idle_list();
            if idle.len() < self.config.max_idle {
                idle.push(session);
                None
            } else {
                Some(session)
            }
        } else {
            Some(session)
        };

        if let Some(mut session) = to_close {
            session.close().await;
        }
    }

    /// Close a session that must not be reused, freeing its slot.
    pub async fn discard(&self, pooled: PooledSession) {
        let PooledSession { mut session, _permit } = pooled;
        session.close().await;
    }

    /// Close every idle session.
    pub async fn shutdown(&self) {
        let sessions: Vec<_> = self.idle_list().drain(..).collect();
        for mut session in sessions {
            session.close().await;
        }
    }

    async fn ensure_initialized(&self) -> Result<()> {
        self.initialized
            .get_or_try_init(|| self.initialize_with_retry())
            .await
            .map(|_| ())
    }

    async fn initialize_with_retry(&self) -> Result<()> {
        let attempts = self.config.init_retries.max(1);
        let mut last_error = None;

        for attempt in 0..attempts {
            match tokio::time::timeout(self.config.init_timeout, self.backend.initialize()).await {
                Ok(Ok(())) => {
                    info!(attempt = attempt + 1, "Browser backend initialized");
                    return Ok(());
                }
                Ok(Err(e)) => last_error = Some(e),
                Err(elapsed) => last_error = Some(elapsed.into()),
            }

            if attempt + 1 < attempts {
                let backoff = self.config.init_backoff * 2u32.pow(attempt);
                let jitter = Duration::from_millis(rand::rng().random_range(0..100));
                warn!(
                    attempt = attempt + 1,
                    backoff_ms = (backoff + jitter).as_millis() as u64,
                    "Browser backend initialization failed, retrying"
                );
                tokio::time::sleep(backoff + jitter).await;
            }
        }

        let reason = last_error
            .map(|e| e.to_string())
            .unwrap_or_else(|| "unknown error".to_string());
        Err(VerificationError::SessionUnavailable(format!(
            "initialization failed after {attempts} attempts: {reason}"
        )))
    }
}

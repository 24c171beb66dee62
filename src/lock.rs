//! Mutual exclusion of protocol runs touching the same channel.
//!
//! [LockService] implements acquire-with-retry and release-with-retry on top
//! of a [LockBackend] that only knows single attempts. The backend may be a
//! shared service used by several processes; [MemoryLockBackend] covers a
//! single process.

use std::{collections::HashMap, fmt::Debug, future::Future, sync::Arc, time::Duration};

use async_trait::async_trait;
use rand::Rng;
use tokio::{sync::Mutex, time::Instant};
use tracing::{debug, warn};

use crate::{config::LockConfig, error::ProtocolError};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LockError {
    #[error("lock service unavailable: {0}")]
    Unavailable(String),
    #[error("lock {0} is not held with this token")]
    NotHeld(String),
}

impl From<LockError> for ProtocolError {
    fn from(e: LockError) -> Self {
        Self::Lock(e.to_string())
    }
}

/// Proof of ownership handed out on acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockToken(pub u128);

#[async_trait]
pub trait LockBackend: Send + Sync + Debug {
    /// One acquisition attempt. `Ok(None)` if someone else holds the lock.
    async fn try_acquire(&self, key: &str, lease: Duration)
        -> Result<Option<LockToken>, LockError>;

    async fn release(&self, key: &str, token: LockToken) -> Result<(), LockError>;
}

#[derive(Debug, Default)]
struct Leases {
    held: HashMap<String, (LockToken, Instant)>,
    unavailable: bool,
}

/// In-process [LockBackend] with expiring leases.
#[derive(Debug, Default)]
pub struct MemoryLockBackend {
    leases: Mutex<Leases>,
}

impl MemoryLockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate an unreachable lock service.
    pub async fn set_unavailable(&self, unavailable: bool) {
        self.leases.lock().await.unavailable = unavailable;
    }
}

#[async_trait]
impl LockBackend for MemoryLockBackend {
    async fn try_acquire(
        &self,
        key: &str,
        lease: Duration,
    ) -> Result<Option<LockToken>, LockError> {
        let mut leases = self.leases.lock().await;
        if leases.unavailable {
            return Err(LockError::Unavailable("backend marked unavailable".into()));
        }

        let now = Instant::now();
        if let Some((_, expires)) = leases.held.get(key) {
            if *expires > now {
                return Ok(None);
            }
        }
        let token = LockToken(rand::random());
        leases.held.insert(key.to_string(), (token, now + lease));
        Ok(Some(token))
    }

    async fn release(&self, key: &str, token: LockToken) -> Result<(), LockError> {
        let mut leases = self.leases.lock().await;
        if leases.unavailable {
            return Err(LockError::Unavailable("backend marked unavailable".into()));
        }
        match leases.held.get(key) {
            Some((held, _)) if *held == token => {
                leases.held.remove(key);
                Ok(())
            }
            _ => Err(LockError::NotHeld(key.to_string())),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LockService {
    backend: Arc<dyn LockBackend>,
    config: LockConfig,
}

impl LockService {
    pub fn new(backend: Arc<dyn LockBackend>, config: LockConfig) -> Self {
        Self { backend, config }
    }

    pub fn config(&self) -> &LockConfig {
        &self.config
    }

    /// Run `body` while holding `key`, with the configured lease.
    pub async fn with_lock<T, F, Fut>(&self, key: &str, body: F) -> Result<T, ProtocolError>
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = Result<T, ProtocolError>> + Send,
        T: Send,
    {
        self.with_lock_timeout(key, self.config.ttl(), body).await
    }

    /// Run `body` while holding `key` for at most `lease`.
    ///
    /// Fails without running `body` if the lock cannot be acquired within the
    /// configured retries. The lock is released whatever `body` returns, and
    /// also when `body` panics or this future is dropped. A failing release
    /// is retried and finally only logged, the result of `body` stands.
    pub async fn with_lock_timeout<T, F, Fut>(
        &self,
        key: &str,
        lease: Duration,
        body: F,
    ) -> Result<T, ProtocolError>
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = Result<T, ProtocolError>> + Send,
        T: Send,
    {
        let held = HeldLock {
            backend: self.backend.clone(),
            config: self.config.clone(),
            key: key.to_string(),
            token: Some(self.acquire(key, lease).await?),
        };
        let started = Instant::now();

        let res = body().await;

        if started.elapsed() > lease {
            warn!(key, ?lease, "lock lease expired before the body finished");
        }
        held.release().await;
        res
    }

    async fn acquire(&self, key: &str, lease: Duration) -> Result<LockToken, ProtocolError> {
        let mut last_error = None;
        for attempt in 0..=self.config.acquire_retries {
            match self.backend.try_acquire(key, lease).await {
                Ok(Some(token)) => {
                    debug!(key, attempt, "lock acquired");
                    return Ok(token);
                }
                Ok(None) => debug!(key, attempt, "lock busy"),
                Err(e) => {
                    debug!(key, attempt, error = %e, "lock backend error");
                    last_error = Some(e);
                }
            }
            if attempt < self.config.acquire_retries {
                tokio::time::sleep(self.retry_delay()).await;
            }
        }

        Err(match last_error {
            Some(e) => e.into(),
            None => ProtocolError::Lock(format!(
                "{key} still held after {} attempts",
                self.config.acquire_retries + 1
            )),
        })
    }

    fn retry_delay(&self) -> Duration {
        let jitter = match self.config.retry_jitter_ms {
            0 => 0,
            j => rand::thread_rng().gen_range(0..=j),
        };
        self.config.retry_delay() + Duration::from_millis(jitter)
    }
}

/// An acquired lock. Released explicitly on the normal path; if the holder
/// unwinds or is dropped mid-body the release runs on a spawned task.
struct HeldLock {
    backend: Arc<dyn LockBackend>,
    config: LockConfig,
    key: String,
    token: Option<LockToken>,
}

impl HeldLock {
    async fn release(mut self) {
        if let Some(token) = self.token.take() {
            release(self.backend.as_ref(), &self.config, &self.key, token).await;
        }
    }
}

impl Drop for HeldLock {
    fn drop(&mut self) {
        let Some(token) = self.token.take() else {
            return;
        };
        let backend = self.backend.clone();
        let config = self.config.clone();
        let key = std::mem::take(&mut self.key);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                warn!(key = %key, "run left the lock without releasing it, releasing");
                handle.spawn(async move {
                    release(backend.as_ref(), &config, &key, token).await;
                });
            }
            Err(_) => warn!(
                key = %key,
                "no runtime to release the lock, it stays held until its lease expires"
            ),
        }
    }
}

async fn release(backend: &dyn LockBackend, config: &LockConfig, key: &str, token: LockToken) {
    for attempt in 0..=config.release_retries {
        match backend.release(key, token).await {
            Ok(()) => {
                debug!(key, "lock released");
                return;
            }
            // Expired and maybe taken by someone else, nothing to undo.
            Err(e @ LockError::NotHeld(_)) => {
                warn!(key, error = %e, "lock was no longer held at release");
                return;
            }
            Err(e) => {
                warn!(key, attempt, error = %e, "lock release failed, retrying");
            }
        }
        if attempt < config.release_retries {
            tokio::time::sleep(config.release_retry_delay()).await;
        }
    }
    warn!(
        key,
        "giving up on releasing the lock, it stays held until its lease expires"
    );
}

//! Scoped lock acquisition for the build pipeline.
//!
//! [`StorageLockManager`] hides whether locks live in a local store or behind
//! the synchronization server: it only sees a [`LockBackend`]. It adds what a
//! single backend call does not give: waiting for busy locks, background lease
//! renewal, and release on every exit path.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures::FutureExt;
use tokio::task::JoinHandle;
use werf_core::{LockHandle, LockMode, SynchronizationConfig, acquisition_id, lease_owner};

use crate::locker::{AcquireOptions, AcquireOutcome, LockBackend, LockError};
use crate::names;

const MIN_RENEW_INTERVAL: Duration = Duration::from_millis(1);

/// What to do when a lock is held by someone else.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitPolicy {
    /// Fail with [`LockError::Busy`] right away.
    NoWait,
    /// Poll until acquired or the limit passes, then fail with
    /// [`LockError::Timeout`].
    Timeout(Duration),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockOptions {
    pub mode: LockMode,
    pub ttl: Duration,
    pub wait: WaitPolicy,
    pub poll_interval: Duration,
}

impl Default for LockOptions {
    fn default() -> Self {
        Self {
            mode: LockMode::Exclusive,
            ttl: Duration::from_secs(30),
            wait: WaitPolicy::Timeout(Duration::from_secs(600)),
            poll_interval: Duration::from_secs(1),
        }
    }
}

impl LockOptions {
    pub fn from_config(config: &SynchronizationConfig) -> werf_core::Result<Self> {
        Ok(Self {
            mode: LockMode::Exclusive,
            ttl: config.ttl()?,
            wait: WaitPolicy::Timeout(config.acquire_timeout()?),
            poll_interval: config.poll_interval()?,
        })
    }

    pub fn shared(self) -> Self {
        Self {
            mode: LockMode::Shared,
            ..self
        }
    }

    pub fn no_wait(self) -> Self {
        Self {
            wait: WaitPolicy::NoWait,
            ..self
        }
    }
}

/// Single entry point for taking locks on behalf of one werf process.
#[derive(Clone)]
pub struct StorageLockManager {
    backend: Arc<dyn LockBackend>,
    holder_id: String,
    defaults: LockOptions,
}

impl std::fmt::Debug for StorageLockManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageLockManager")
            .field("holder_id", &self.holder_id)
            .field("defaults", &self.defaults)
            .finish_non_exhaustive()
    }
}

impl StorageLockManager {
    pub fn new(
        backend: Arc<dyn LockBackend>,
        holder_id: impl Into<String>,
        defaults: LockOptions,
    ) -> Self {
        Self {
            backend,
            holder_id: holder_id.into(),
            defaults,
        }
    }

    pub fn holder_id(&self) -> &str {
        &self.holder_id
    }

    pub fn defaults(&self) -> &LockOptions {
        &self.defaults
    }

    /// Take `lock_name`, waiting as `options.wait` allows.
    ///
    /// Each call holds its own lease, so tasks sharing this manager exclude
    /// each other like separate processes do. The returned guard renews the
    /// lease every `ttl / 3` until released.
    pub async fn acquire(
        &self,
        lock_name: &str,
        options: &LockOptions,
    ) -> Result<LockGuard, LockError> {
        let request = AcquireOptions {
            holder_id: acquisition_id(&self.holder_id),
            ttl: options.ttl,
            mode: options.mode,
        };
        let started = tokio::time::Instant::now();
        let mut announced = false;

        loop {
            let holder = match self.backend.acquire(lock_name, &request).await? {
                AcquireOutcome::Acquired(handle) => {
                    if announced {
                        tracing::info!(
                            lock_name,
                            waited_ms = started.elapsed().as_millis() as u64,
                            "lock acquired after waiting",
                        );
                    }
                    return Ok(LockGuard::start(
                        Arc::clone(&self.backend),
                        handle,
                        options.ttl,
                    ));
                }
                AcquireOutcome::Busy { holder } => {
                    holder.map(|holder| lease_owner(&holder).to_owned())
                }
            };

            let limit = match options.wait {
                WaitPolicy::NoWait => {
                    return Err(LockError::Busy {
                        lock_name: lock_name.to_owned(),
                        holder,
                    });
                }
                WaitPolicy::Timeout(limit) => limit,
            };

            let waited = started.elapsed();
            if waited >= limit {
                return Err(LockError::Timeout {
                    lock_name: lock_name.to_owned(),
                    waited,
                });
            }
            if !announced {
                tracing::info!(
                    lock_name,
                    holder = holder.as_deref().unwrap_or("unknown"),
                    "waiting for lock held by another process",
                );
                announced = true;
            }
            tokio::time::sleep(options.poll_interval.min(limit - waited)).await;
        }
    }

    /// Run `f` while holding `lock_name`.
    ///
    /// The lock is released however `f` ends: success, error, or panic (the
    /// panic is resumed after release). A lease lost during `f` turns a
    /// successful result into [`LockError::LeaseLost`].
    pub async fn with_lock<T, E, F, Fut>(
        &self,
        lock_name: &str,
        options: &LockOptions,
        f: F,
    ) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<LockError>,
    {
        let guard = self.acquire(lock_name, options).await?;
        let outcome = AssertUnwindSafe(async move { f().await })
            .catch_unwind()
            .await;

        let lost = guard.is_lost();
        let handle = guard.handle().clone();
        if let Err(e) = guard.release().await {
            tracing::warn!(
                lock_name,
                error = %e,
                "failed to release lock, it will expire after its ttl",
            );
        }

        match outcome {
            Err(panic) => std::panic::resume_unwind(panic),
            Ok(Ok(_)) if lost => Err(LockError::LeaseLost {
                lock_name: handle.lock_name,
                holder_id: handle.holder_id,
            }
            .into()),
            Ok(result) => result,
        }
    }

    /// Per-stage lock with the manager's default options.
    pub async fn acquire_stage_lock(
        &self,
        project: &str,
        stage: &str,
    ) -> Result<LockGuard, LockError> {
        self.acquire(&names::stage_lock_name(project, stage), &self.defaults)
            .await
    }
}

/// A held lock. Release explicitly with [`LockGuard::release`]; dropping the
/// guard schedules a best-effort release on the current runtime.
pub struct LockGuard {
    backend: Arc<dyn LockBackend>,
    handle: LockHandle,
    renewal: Option<JoinHandle<()>>,
    lost: Arc<AtomicBool>,
    released: bool,
}

impl std::fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockGuard")
            .field("handle", &self.handle)
            .field("lost", &self.is_lost())
            .finish_non_exhaustive()
    }
}

impl LockGuard {
    fn start(backend: Arc<dyn LockBackend>, handle: LockHandle, ttl: Duration) -> Self {
        let lost = Arc::new(AtomicBool::new(false));
        let renewal = tokio::spawn(renew_until_lost(
            Arc::clone(&backend),
            handle.clone(),
            ttl,
            Arc::clone(&lost),
        ));

        Self {
            backend,
            handle,
            renewal: Some(renewal),
            lost,
            released: false,
        }
    }

    pub fn handle(&self) -> &LockHandle {
        &self.handle
    }

    /// Whether renewal found the lease taken over by someone else.
    pub fn is_lost(&self) -> bool {
        self.lost.load(Ordering::Acquire)
    }

    pub async fn release(mut self) -> Result<(), LockError> {
        self.released = true;
        if let Some(renewal) = self.renewal.take() {
            renewal.abort();
        }
        self.backend.release(&self.handle).await
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Some(renewal) = self.renewal.take() {
            renewal.abort();
        }
        if self.released {
            return;
        }

        let lock_name = self.handle.lock_name.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let backend = Arc::clone(&self.backend);
                let handle = self.handle.clone();
                runtime.spawn(async move {
                    if let Err(e) = backend.release(&handle).await {
                        tracing::warn!(
                            lock_name = %handle.lock_name,
                            error = %e,
                            "release of dropped lock failed, it will expire after its ttl",
                        );
                    }
                });
                tracing::debug!(%lock_name, "lock guard dropped, release scheduled");
            }
            Err(e) => tracing::warn!(
                %lock_name,
                error = %e,
                "lock guard dropped outside a runtime, lock will expire after its ttl",
            ),
        }
    }
}

async fn renew_until_lost(
    backend: Arc<dyn LockBackend>,
    handle: LockHandle,
    ttl: Duration,
    lost: Arc<AtomicBool>,
) {
    let interval = (ttl / 3).max(MIN_RENEW_INTERVAL);
    loop {
        tokio::time::sleep(interval).await;
        match backend.renew_lease(&handle, ttl).await {
            Ok(()) => {
                tracing::trace!(lock_name = %handle.lock_name, "lease renewed");
            }
            Err(e @ LockError::LeaseLost { .. }) => {
                tracing::warn!(lock_name = %handle.lock_name, error = %e, "lock lease lost");
                lost.store(true, Ordering::Release);
                return;
            }
            Err(e) => {
                tracing::warn!(
                    lock_name = %handle.lock_name,
                    error = %e,
                    "lease renewal failed, retrying at next interval",
                );
            }
        }
    }
}

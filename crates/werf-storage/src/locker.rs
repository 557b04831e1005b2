//! Named locks with TTL leases, built purely on compare-and-swap.

use std::sync::Arc;
use std::time::Duration;

use werf_core::{
    Clock, Lease, LockHandle, LockMode, LockRecord, RetryError, RetryPolicy, Retryable,
    SystemClock,
};

use crate::store::{self, CasOutcome, OptimisticLockingStore, StoreError, Versioned};

/// Who is asking for a lock, for how long, and with what intent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcquireOptions {
    pub holder_id: String,
    pub ttl: Duration,
    pub mode: LockMode,
}

impl AcquireOptions {
    pub fn exclusive(holder_id: impl Into<String>, ttl: Duration) -> Self {
        Self {
            holder_id: holder_id.into(),
            ttl,
            mode: LockMode::Exclusive,
        }
    }

    pub fn shared(holder_id: impl Into<String>, ttl: Duration) -> Self {
        Self {
            holder_id: holder_id.into(),
            ttl,
            mode: LockMode::Shared,
        }
    }
}

/// A busy lock is an expected outcome, not an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcquireOutcome {
    Acquired(LockHandle),
    Busy { holder: Option<String> },
}

/// Acquire/renew/release capability shared by the local locker and the
/// synchronization server client.
#[async_trait::async_trait]
pub trait LockBackend: Send + Sync {
    /// Try once to take `lock_name`. Never waits for a live holder.
    async fn acquire(
        &self,
        lock_name: &str,
        options: &AcquireOptions,
    ) -> Result<AcquireOutcome, LockError>;

    /// Push the lease expiry `ttl` into the future.
    async fn renew_lease(&self, handle: &LockHandle, ttl: Duration) -> Result<(), LockError>;

    /// Drop the holder's lease. Releasing a lock held by someone else is a
    /// no-op.
    async fn release(&self, handle: &LockHandle) -> Result<(), LockError>;
}

#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("lock {lock_name} was modified concurrently")]
    CasConflict { lock_name: String },

    #[error("gave up on lock {lock_name} after {attempts} conflicting writes")]
    ConflictRetriesExhausted { lock_name: String, attempts: u32 },

    #[error("lease of {holder_id} on lock {lock_name} was lost")]
    LeaseLost { lock_name: String, holder_id: String },

    #[error("lock {lock_name} is busy{}", held_by(holder))]
    Busy {
        lock_name: String,
        holder: Option<String>,
    },

    #[error("timed out after {waited:?} waiting for lock {lock_name}")]
    Timeout { lock_name: String, waited: Duration },

    #[error("synchronization server error: {detail}")]
    Remote { detail: String, retryable: bool },

    #[error("invalid lock request: {0}")]
    InvalidRequest(String),
}

fn held_by(holder: &Option<String>) -> String {
    holder
        .as_deref()
        .map(|holder| format!(" (held by {holder})"))
        .unwrap_or_default()
}

impl Retryable for LockError {
    fn is_retryable(&self) -> bool {
        match self {
            Self::Store(e) => e.is_retryable(),
            Self::CasConflict { .. } => true,
            Self::Remote { retryable, .. } => *retryable,
            _ => false,
        }
    }

    fn is_contention(&self) -> bool {
        matches!(self, Self::CasConflict { .. })
    }
}

/// Store key holding the record of `lock_name`.
pub fn lock_key(lock_name: &str) -> String {
    format!("lock/{lock_name}")
}

/// [`LockBackend`] that keeps lock records in an optimistic store.
///
/// Every mutation reads the record, decides, and writes back with the version
/// it read. A lost race is retried with backoff up to the policy's budget.
pub struct DistributedLocker<S: ?Sized = dyn OptimisticLockingStore> {
    store: Arc<S>,
    policy: RetryPolicy,
    clock: Arc<dyn Clock>,
}

impl<S: ?Sized> Clone for DistributedLocker<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            policy: self.policy,
            clock: Arc::clone(&self.clock),
        }
    }
}

impl<S> std::fmt::Debug for DistributedLocker<S>
where
    S: OptimisticLockingStore + ?Sized,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DistributedLocker")
            .field("store", &self.store.backend_name())
            .field("policy", &self.policy)
            .finish()
    }
}

impl<S> DistributedLocker<S>
where
    S: OptimisticLockingStore + ?Sized,
{
    pub fn new(store: Arc<S>, policy: RetryPolicy) -> Self {
        Self::with_clock(store, policy, Arc::new(SystemClock))
    }

    pub fn with_clock(store: Arc<S>, policy: RetryPolicy, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            policy,
            clock,
        }
    }

    async fn acquire_once(
        &self,
        lock_name: &str,
        options: &AcquireOptions,
    ) -> Result<AcquireOutcome, LockError> {
        let key = lock_key(lock_name);
        let current = self.store.get(&key).await?;
        let now = self.clock.now();
        let holder_id = options.holder_id.as_str();
        let lease = Lease::new(holder_id, options.ttl, now);

        let fresh = |lease: Lease| LockRecord {
            generation: current.version,
            ..LockRecord::new(lock_name, options.mode, lease)
        };
        let record = match read_record(&key, &current)? {
            None => fresh(lease),
            Some(mut record) => {
                record.prune_expired(now);
                let sole_holder =
                    record.holders.len() == 1 && record.lease_of(holder_id).is_some();

                if record.holders.is_empty() {
                    fresh(lease)
                } else if sole_holder {
                    record.mode = options.mode;
                    record.holders = vec![lease];
                    record
                } else if record.mode == LockMode::Shared && options.mode == LockMode::Shared {
                    match record.lease_of_mut(holder_id) {
                        Some(existing) => *existing = lease,
                        None => record.holders.push(lease),
                    }
                    record
                } else {
                    return Ok(AcquireOutcome::Busy {
                        holder: record.other_holder(holder_id, now).map(str::to_owned),
                    });
                }
            }
        };

        self.write(&key, lock_name, record.generation, Some(&record))
            .await?;

        Ok(AcquireOutcome::Acquired(LockHandle {
            lock_name: lock_name.to_owned(),
            holder_id: holder_id.to_owned(),
            mode: options.mode,
        }))
    }

    async fn renew_once(&self, handle: &LockHandle, ttl: Duration) -> Result<(), LockError> {
        let key = lock_key(&handle.lock_name);
        let current = self.store.get(&key).await?;
        let now = self.clock.now();

        let lease_lost = || LockError::LeaseLost {
            lock_name: handle.lock_name.clone(),
            holder_id: handle.holder_id.clone(),
        };

        // An expired lease nobody has taken over yet can still be renewed;
        // a takeover prunes it from the record.
        let mut record = read_record(&key, &current)?.ok_or_else(lease_lost)?;
        let lease = record
            .lease_of_mut(&handle.holder_id)
            .ok_or_else(lease_lost)?;
        *lease = Lease::new(handle.holder_id.as_str(), ttl, now);

        self.write(&key, &handle.lock_name, record.generation, Some(&record))
            .await
    }

    async fn release_once(&self, handle: &LockHandle) -> Result<(), LockError> {
        let key = lock_key(&handle.lock_name);
        let current = self.store.get(&key).await?;

        let Some(mut record) = read_record(&key, &current)? else {
            tracing::debug!(lock_name = %handle.lock_name, "release of absent lock ignored");
            return Ok(());
        };
        if record.lease_of(&handle.holder_id).is_none() {
            tracing::debug!(
                lock_name = %handle.lock_name,
                holder_id = %handle.holder_id,
                "release by non-holder ignored",
            );
            return Ok(());
        }

        record
            .holders
            .retain(|lease| lease.holder_id != handle.holder_id);
        record.prune_expired(self.clock.now());

        let next = (!record.holders.is_empty()).then_some(&record);
        self.write(&key, &handle.lock_name, record.generation, next)
            .await
    }

    async fn write(
        &self,
        key: &str,
        lock_name: &str,
        expected_version: u64,
        record: Option<&LockRecord>,
    ) -> Result<(), LockError> {
        let value = record.map(|r| store::encode(key, r)).transpose()?;
        match self
            .store
            .compare_and_swap(key, expected_version, value)
            .await?
        {
            CasOutcome::Swapped { .. } => Ok(()),
            CasOutcome::Conflict { .. } => Err(LockError::CasConflict {
                lock_name: lock_name.to_owned(),
            }),
        }
    }
}

/// Decode the lock record in `current`, stamped with the version it was read at.
fn read_record(key: &str, current: &Versioned) -> Result<Option<LockRecord>, StoreError> {
    Ok(store::decode::<LockRecord>(key, current)?.map(|record| LockRecord {
        generation: current.version,
        ..record
    }))
}

fn exhausted(err: RetryError<LockError>) -> LockError {
    match err {
        RetryError::Exhausted {
            attempts,
            source: LockError::CasConflict { lock_name },
            ..
        } => LockError::ConflictRetriesExhausted {
            lock_name,
            attempts,
        },
        other => other.into_inner(),
    }
}

#[async_trait::async_trait]
impl<S> LockBackend for DistributedLocker<S>
where
    S: OptimisticLockingStore + ?Sized,
{
    async fn acquire(
        &self,
        lock_name: &str,
        options: &AcquireOptions,
    ) -> Result<AcquireOutcome, LockError> {
        if lock_name.is_empty() {
            return Err(LockError::InvalidRequest("lock name is empty".into()));
        }
        if options.holder_id.is_empty() {
            return Err(LockError::InvalidRequest("holder id is empty".into()));
        }
        if options.ttl.is_zero() {
            return Err(LockError::InvalidRequest("lease ttl must be positive".into()));
        }

        let outcome = self
            .policy
            .run("acquire lock", || self.acquire_once(lock_name, options))
            .await
            .map_err(exhausted)?;

        match &outcome {
            AcquireOutcome::Acquired(handle) => tracing::debug!(
                lock_name,
                holder_id = %handle.holder_id,
                mode = %handle.mode,
                backend = self.store.backend_name(),
                "lock acquired",
            ),
            AcquireOutcome::Busy { holder } => tracing::debug!(
                lock_name,
                holder = holder.as_deref().unwrap_or("unknown"),
                "lock busy",
            ),
        }
        Ok(outcome)
    }

    async fn renew_lease(&self, handle: &LockHandle, ttl: Duration) -> Result<(), LockError> {
        if ttl.is_zero() {
            return Err(LockError::InvalidRequest("lease ttl must be positive".into()));
        }
        self.policy
            .run("renew lock lease", || self.renew_once(handle, ttl))
            .await
            .map_err(exhausted)
    }

    async fn release(&self, handle: &LockHandle) -> Result<(), LockError> {
        self.policy
            .run("release lock", || self.release_once(handle))
            .await
            .map_err(exhausted)?;
        tracing::debug!(lock_name = %handle.lock_name, holder_id = %handle.holder_id, "lock released");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;
    use chrono::{TimeZone, Utc};
    use werf_core::ManualClock;

    const TTL: Duration = Duration::from_secs(5);

    fn locker() -> (DistributedLocker<InMemoryStore>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
        ));
        let locker = DistributedLocker::with_clock(
            Arc::new(InMemoryStore::new()),
            RetryPolicy::immediate(5),
            clock.clone(),
        );
        (locker, clock)
    }

    fn handle(outcome: AcquireOutcome) -> LockHandle {
        match outcome {
            AcquireOutcome::Acquired(handle) => handle,
            busy => panic!("expected acquisition, got {busy:?}"),
        }
    }

    #[tokio::test]
    async fn second_holder_sees_busy_until_ttl_elapses() {
        let (locker, clock) = locker();

        handle(
            locker
                .acquire("demo/install", &AcquireOptions::exclusive("ci-1", TTL))
                .await
                .unwrap(),
        );

        let outcome = locker
            .acquire("demo/install", &AcquireOptions::exclusive("ci-2", TTL))
            .await
            .unwrap();
        assert_eq!(
            outcome,
            AcquireOutcome::Busy {
                holder: Some("ci-1".into())
            }
        );

        clock.advance(TTL);
        let handle = handle(
            locker
                .acquire("demo/install", &AcquireOptions::exclusive("ci-2", TTL))
                .await
                .unwrap(),
        );
        assert_eq!(handle.holder_id, "ci-2");
    }

    #[tokio::test]
    async fn reacquire_by_holder_extends_lease() {
        let (locker, clock) = locker();
        let opts = AcquireOptions::exclusive("ci-1", TTL);

        locker.acquire("l", &opts).await.unwrap();
        clock.advance(Duration::from_secs(4));
        handle(locker.acquire("l", &opts).await.unwrap());

        clock.advance(Duration::from_secs(4));
        let outcome = locker
            .acquire("l", &AcquireOptions::exclusive("ci-2", TTL))
            .await
            .unwrap();
        assert!(matches!(outcome, AcquireOutcome::Busy { .. }));
    }

    #[tokio::test]
    async fn shared_holders_coexist_and_block_exclusive() {
        let (locker, _clock) = locker();

        let a = handle(locker.acquire("l", &AcquireOptions::shared("a", TTL)).await.unwrap());
        let b = handle(locker.acquire("l", &AcquireOptions::shared("b", TTL)).await.unwrap());

        let outcome = locker
            .acquire("l", &AcquireOptions::exclusive("c", TTL))
            .await
            .unwrap();
        assert!(matches!(outcome, AcquireOutcome::Busy { .. }));

        locker.release(&a).await.unwrap();
        let outcome = locker
            .acquire("l", &AcquireOptions::exclusive("c", TTL))
            .await
            .unwrap();
        assert_eq!(
            outcome,
            AcquireOutcome::Busy {
                holder: Some("b".into())
            }
        );

        locker.release(&b).await.unwrap();
        handle(locker.acquire("l", &AcquireOptions::exclusive("c", TTL)).await.unwrap());
    }

    #[tokio::test]
    async fn exclusive_holder_blocks_shared() {
        let (locker, _clock) = locker();
        locker
            .acquire("l", &AcquireOptions::exclusive("w", TTL))
            .await
            .unwrap();

        let outcome = locker
            .acquire("l", &AcquireOptions::shared("r", TTL))
            .await
            .unwrap();
        assert!(matches!(outcome, AcquireOutcome::Busy { .. }));
    }

    #[tokio::test]
    async fn release_by_non_holder_is_noop() {
        let (locker, _clock) = locker();
        let owned = handle(
            locker
                .acquire("l", &AcquireOptions::exclusive("ci-1", TTL))
                .await
                .unwrap(),
        );

        let impostor = LockHandle {
            holder_id: "ci-2".into(),
            ..owned.clone()
        };
        locker.release(&impostor).await.unwrap();

        let outcome = locker
            .acquire("l", &AcquireOptions::exclusive("ci-3", TTL))
            .await
            .unwrap();
        assert!(matches!(outcome, AcquireOutcome::Busy { .. }));
    }

    #[tokio::test]
    async fn release_clears_record() {
        let (locker, _clock) = locker();
        let owned = handle(
            locker
                .acquire("l", &AcquireOptions::exclusive("ci-1", TTL))
                .await
                .unwrap(),
        );

        locker.release(&owned).await.unwrap();
        assert!(locker.store.get(&lock_key("l")).await.unwrap().value.is_none());

        // Releasing twice is harmless.
        locker.release(&owned).await.unwrap();
    }

    #[tokio::test]
    async fn renew_keeps_lock_past_original_ttl() {
        let (locker, clock) = locker();
        let owned = handle(
            locker
                .acquire("l", &AcquireOptions::exclusive("ci-1", TTL))
                .await
                .unwrap(),
        );

        clock.advance(Duration::from_secs(4));
        locker.renew_lease(&owned, TTL).await.unwrap();
        clock.advance(Duration::from_secs(4));

        let outcome = locker
            .acquire("l", &AcquireOptions::exclusive("ci-2", TTL))
            .await
            .unwrap();
        assert!(matches!(outcome, AcquireOutcome::Busy { .. }));
    }

    #[tokio::test]
    async fn renew_after_takeover_reports_lease_lost() {
        let (locker, clock) = locker();
        let owned = handle(
            locker
                .acquire("l", &AcquireOptions::exclusive("ci-1", TTL))
                .await
                .unwrap(),
        );

        clock.advance(TTL);
        locker
            .acquire("l", &AcquireOptions::exclusive("ci-2", TTL))
            .await
            .unwrap();

        let err = locker.renew_lease(&owned, TTL).await.unwrap_err();
        assert!(matches!(err, LockError::LeaseLost { .. }), "{err}");
    }

    #[tokio::test]
    async fn invalid_requests_are_rejected() {
        let (locker, _clock) = locker();
        let err = locker
            .acquire("", &AcquireOptions::exclusive("ci-1", TTL))
            .await
            .unwrap_err();
        assert!(matches!(err, LockError::InvalidRequest(_)));

        let err = locker
            .acquire("l", &AcquireOptions::exclusive("ci-1", Duration::ZERO))
            .await
            .unwrap_err();
        assert!(matches!(err, LockError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn records_carry_the_version_they_were_read_at() {
        let (locker, _clock) = locker();
        let opts = AcquireOptions::exclusive("ci-1", TTL);
        locker.acquire("l", &opts).await.unwrap();
        locker.acquire("l", &opts).await.unwrap();

        let key = lock_key("l");
        let current = locker.store.get(&key).await.unwrap();
        let record = read_record(&key, &current).unwrap().unwrap();
        assert_eq!(current.version, 2);
        assert_eq!(record.generation, 2);

        // A write based on a stale read loses.
        let stale = LockRecord {
            generation: 1,
            ..record
        };
        let err = locker
            .write(&key, "l", stale.generation, Some(&stale))
            .await
            .unwrap_err();
        assert!(matches!(err, LockError::CasConflict { .. }));
    }

    #[tokio::test]
    async fn corrupt_record_is_fatal() {
        let (locker, _clock) = locker();
        locker
            .store
            .compare_and_swap(&lock_key("l"), 0, Some("not json".into()))
            .await
            .unwrap();

        let err = locker
            .acquire("l", &AcquireOptions::exclusive("ci-1", TTL))
            .await
            .unwrap_err();
        assert!(matches!(err, LockError::Store(StoreError::Decode { .. })));
    }

    /// Store whose writes always lose the race.
    #[derive(Debug, Default)]
    struct AlwaysConflicting;

    #[async_trait::async_trait]
    impl OptimisticLockingStore for AlwaysConflicting {
        fn backend_name(&self) -> &'static str {
            "always-conflicting"
        }

        async fn get(&self, _key: &str) -> Result<Versioned, StoreError> {
            Ok(Versioned::default())
        }

        async fn compare_and_swap(
            &self,
            _key: &str,
            expected_version: u64,
            _value: Option<String>,
        ) -> Result<CasOutcome, StoreError> {
            Ok(CasOutcome::Conflict {
                current: expected_version + 1,
            })
        }

        async fn keys_with_prefix(&self, _prefix: &str) -> Result<Vec<String>, StoreError> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn endless_conflicts_exhaust_the_budget() {
        let locker = DistributedLocker::new(Arc::new(AlwaysConflicting), RetryPolicy::immediate(3));
        let err = locker
            .acquire("l", &AcquireOptions::exclusive("ci-1", TTL))
            .await
            .unwrap_err();
        match err {
            LockError::ConflictRetriesExhausted { lock_name, attempts } => {
                assert_eq!(lock_name, "l");
                assert_eq!(attempts, 3);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_acquires_have_single_winner() {
        let locker = Arc::new(DistributedLocker::new(
            Arc::new(InMemoryStore::new()),
            RetryPolicy::immediate(50),
        ));

        let tasks: Vec<_> = (0..12)
            .map(|i| {
                let locker = Arc::clone(&locker);
                tokio::spawn(async move {
                    locker
                        .acquire("l", &AcquireOptions::exclusive(format!("ci-{i}"), TTL))
                        .await
                        .unwrap()
                })
            })
            .collect();

        let mut acquired = 0;
        for task in tasks {
            if matches!(task.await.unwrap(), AcquireOutcome::Acquired(_)) {
                acquired += 1;
            }
        }
        assert_eq!(acquired, 1);
    }
}

//! Mapping from `(project, signature)` to built stage records.
//!
//! Several records may exist for one signature while builders race. The
//! earliest by [`StageRecord::canonical_cmp`] is canonical and is always
//! stored first; later ones stay listed until cleanup removes them.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use werf_core::{RetryError, RetryPolicy, Retryable, StageRecord, StageSignature};

use crate::store::{self, CasOutcome, OptimisticLockingStore, StoreError, Versioned};

/// Answer to a publish attempt. Losing the race is not an error: the caller
/// discards its own artifact and adopts `canonical`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishOutcome {
    pub accepted: bool,
    pub canonical: StageRecord,
}

#[async_trait::async_trait]
pub trait StagesStorageCache: Send + Sync {
    /// Every record of every signature in `project`.
    async fn get_all_stages(&self, project: &str) -> Result<Vec<StageRecord>, CacheError>;

    async fn delete_all_stages(&self, project: &str) -> Result<(), CacheError>;

    /// Records for `signature`, canonical first.
    async fn get_stages_by_signature(
        &self,
        project: &str,
        signature: &StageSignature,
    ) -> Result<Vec<StageRecord>, CacheError>;

    /// Replace the records of `signature` wholesale.
    async fn store_stages_by_signature(
        &self,
        project: &str,
        signature: &StageSignature,
        records: &[StageRecord],
    ) -> Result<(), CacheError>;

    async fn delete_stages_by_signature(
        &self,
        project: &str,
        signature: &StageSignature,
    ) -> Result<(), CacheError>;

    /// The canonical record, if any. Takes no lock.
    async fn lookup(
        &self,
        project: &str,
        signature: &StageSignature,
    ) -> Result<Option<StageRecord>, CacheError>;

    /// Offer `candidate` as the canonical record of `signature`. Accepted
    /// only when nothing is stored yet or it is strictly earlier than the
    /// current canonical record.
    async fn publish(
        &self,
        project: &str,
        signature: &StageSignature,
        candidate: &StageRecord,
    ) -> Result<PublishOutcome, CacheError>;
}

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("stages of {project}/{signature} were modified concurrently")]
    CasConflict { project: String, signature: String },

    #[error("gave up updating stages of {project}/{signature} after {attempts} conflicting writes")]
    ConflictRetriesExhausted {
        project: String,
        signature: String,
        attempts: u32,
    },

    #[error("record for signature {actual} cannot be stored under {expected}")]
    SignatureMismatch { expected: String, actual: String },

    #[error("invalid {what} {value:?}: must be non-empty and contain no '/'")]
    InvalidKey { what: &'static str, value: String },

    #[error("synchronization server error: {detail}")]
    Remote { detail: String, retryable: bool },
}

impl Retryable for CacheError {
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

/// Stored value under one signature key.
#[derive(Debug, Default, Serialize, Deserialize)]
struct SignatureEntry {
    records: Vec<StageRecord>,
}

fn signature_prefix(project: &str) -> String {
    format!("stages/{project}/")
}

fn signature_key(project: &str, signature: &StageSignature) -> String {
    format!("stages/{project}/{signature}")
}

fn validate(what: &'static str, value: &str) -> Result<(), CacheError> {
    if value.is_empty() || value.contains('/') {
        return Err(CacheError::InvalidKey {
            what,
            value: value.to_owned(),
        });
    }
    Ok(())
}

fn validate_key(project: &str, signature: &StageSignature) -> Result<(), CacheError> {
    validate("project name", project)?;
    validate("stage signature", signature.as_str())
}

fn check_signature(signature: &StageSignature, record: &StageRecord) -> Result<(), CacheError> {
    if record.signature != *signature {
        return Err(CacheError::SignatureMismatch {
            expected: signature.to_string(),
            actual: record.signature.to_string(),
        });
    }
    Ok(())
}

fn sort_canonical(records: &mut [StageRecord]) {
    records.sort_by(|a, b| a.canonical_cmp(b));
}

/// [`StagesStorageCache`] kept in an optimistic store, one key per
/// signature.
pub struct StoreStagesStorageCache<S: ?Sized = dyn OptimisticLockingStore> {
    store: Arc<S>,
    policy: RetryPolicy,
}

impl<S: ?Sized> Clone for StoreStagesStorageCache<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            policy: self.policy,
        }
    }
}

impl<S> std::fmt::Debug for StoreStagesStorageCache<S>
where
    S: OptimisticLockingStore + ?Sized,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreStagesStorageCache")
            .field("store", &self.store.backend_name())
            .field("policy", &self.policy)
            .finish()
    }
}

impl<S> StoreStagesStorageCache<S>
where
    S: OptimisticLockingStore + ?Sized,
{
    pub fn new(store: Arc<S>, policy: RetryPolicy) -> Self {
        Self { store, policy }
    }

    async fn read(&self, key: &str) -> Result<(Vec<StageRecord>, Versioned), CacheError> {
        let current = self.store.get(key).await?;
        let mut records = store::decode::<SignatureEntry>(key, &current)?
            .unwrap_or_default()
            .records;
        sort_canonical(&mut records);
        Ok((records, current))
    }

    async fn write(
        &self,
        key: &str,
        project: &str,
        signature: &str,
        expected_version: u64,
        records: Vec<StageRecord>,
    ) -> Result<(), CacheError> {
        let value = if records.is_empty() {
            None
        } else {
            Some(store::encode(key, &SignatureEntry { records })?)
        };
        match self
            .store
            .compare_and_swap(key, expected_version, value)
            .await?
        {
            CasOutcome::Swapped { .. } => Ok(()),
            CasOutcome::Conflict { .. } => Err(CacheError::CasConflict {
                project: project.to_owned(),
                signature: signature.to_owned(),
            }),
        }
    }

    async fn replace_once(
        &self,
        key: &str,
        project: &str,
        signature: &str,
        records: &[StageRecord],
    ) -> Result<(), CacheError> {
        let current = self.store.get(key).await?;
        let mut records = records.to_vec();
        sort_canonical(&mut records);
        self.write(key, project, signature, current.version, records)
            .await
    }

    async fn publish_once(
        &self,
        key: &str,
        project: &str,
        signature: &StageSignature,
        candidate: &StageRecord,
    ) -> Result<PublishOutcome, CacheError> {
        let (mut records, current) = self.read(key).await?;

        if let Some(canonical) = records.first() {
            if canonical == candidate {
                return Ok(PublishOutcome {
                    accepted: true,
                    canonical: canonical.clone(),
                });
            }
            if !candidate.is_earlier_than(canonical) {
                tracing::info!(
                    project,
                    signature = %signature,
                    candidate = %candidate.image_id,
                    canonical = %canonical.image_id,
                    "publish lost to an earlier stage",
                );
                return Ok(PublishOutcome {
                    accepted: false,
                    canonical: canonical.clone(),
                });
            }
        }

        records.retain(|record| record != candidate);
        records.insert(0, candidate.clone());
        self.write(key, project, signature.as_str(), current.version, records)
            .await?;

        tracing::debug!(
            project,
            signature = %signature,
            image_id = %candidate.image_id,
            "stage published",
        );
        Ok(PublishOutcome {
            accepted: true,
            canonical: candidate.clone(),
        })
    }
}

fn exhausted(err: RetryError<CacheError>) -> CacheError {
    match err {
        RetryError::Exhausted {
            attempts,
            source: CacheError::CasConflict { project, signature },
            ..
        } => CacheError::ConflictRetriesExhausted {
            project,
            signature,
            attempts,
        },
        other => other.into_inner(),
    }
}

#[async_trait::async_trait]
impl<S> StagesStorageCache for StoreStagesStorageCache<S>
where
    S: OptimisticLockingStore + ?Sized,
{
    async fn get_all_stages(&self, project: &str) -> Result<Vec<StageRecord>, CacheError> {
        validate("project name", project)?;
        let mut all = Vec::new();
        for key in self.store.keys_with_prefix(&signature_prefix(project)).await? {
            all.extend(self.read(&key).await?.0);
        }
        Ok(all)
    }

    async fn delete_all_stages(&self, project: &str) -> Result<(), CacheError> {
        validate("project name", project)?;
        let prefix = signature_prefix(project);
        for key in self.store.keys_with_prefix(&prefix).await? {
            let signature = key.trim_start_matches(&prefix);
            self.policy
                .run("delete stages", || self.replace_once(&key, project, signature, &[]))
                .await
                .map_err(exhausted)?;
        }
        tracing::info!(project, "all stages removed from cache");
        Ok(())
    }

    async fn get_stages_by_signature(
        &self,
        project: &str,
        signature: &StageSignature,
    ) -> Result<Vec<StageRecord>, CacheError> {
        validate_key(project, signature)?;
        Ok(self.read(&signature_key(project, signature)).await?.0)
    }

    async fn store_stages_by_signature(
        &self,
        project: &str,
        signature: &StageSignature,
        records: &[StageRecord],
    ) -> Result<(), CacheError> {
        validate_key(project, signature)?;
        for record in records {
            check_signature(signature, record)?;
        }
        let key = signature_key(project, signature);
        self.policy
            .run("store stages", || {
                self.replace_once(&key, project, signature.as_str(), records)
            })
            .await
            .map_err(exhausted)
    }

    async fn delete_stages_by_signature(
        &self,
        project: &str,
        signature: &StageSignature,
    ) -> Result<(), CacheError> {
        self.store_stages_by_signature(project, signature, &[])
            .await
    }

    async fn lookup(
        &self,
        project: &str,
        signature: &StageSignature,
    ) -> Result<Option<StageRecord>, CacheError> {
        Ok(self
            .get_stages_by_signature(project, signature)
            .await?
            .into_iter()
            .next())
    }

    async fn publish(
        &self,
        project: &str,
        signature: &StageSignature,
        candidate: &StageRecord,
    ) -> Result<PublishOutcome, CacheError> {
        validate_key(project, signature)?;
        check_signature(signature, candidate)?;
        let key = signature_key(project, signature);
        self.policy
            .run("publish stage", || {
                self.publish_once(&key, project, signature, candidate)
            })
            .await
            .map_err(exhausted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;
    use chrono::{DateTime, Duration, TimeZone, Utc};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    fn cache() -> StoreStagesStorageCache<InMemoryStore> {
        StoreStagesStorageCache::new(Arc::new(InMemoryStore::new()), RetryPolicy::immediate(50))
    }

    fn sig() -> StageSignature {
        StageSignature::from("abc123")
    }

    #[tokio::test]
    async fn later_publisher_adopts_earlier_record() {
        let cache = cache();
        let a = StageRecord::at("img-A", "abc123", t0());
        let b = StageRecord::at("img-B", "abc123", t0() + Duration::seconds(3));

        let outcome = cache.publish("demo", &sig(), &a).await.unwrap();
        assert!(outcome.accepted);

        let outcome = cache.publish("demo", &sig(), &b).await.unwrap();
        assert!(!outcome.accepted);
        assert_eq!(outcome.canonical, a);

        let found = cache.lookup("demo", &sig()).await.unwrap().unwrap();
        assert_eq!(found.image_id, "img-A");
    }

    #[tokio::test]
    async fn earlier_record_arriving_late_takes_over() {
        let cache = cache();
        let a = StageRecord::at("img-A", "abc123", t0());
        let b = StageRecord::at("img-B", "abc123", t0() + Duration::seconds(3));

        assert!(cache.publish("demo", &sig(), &b).await.unwrap().accepted);
        let outcome = cache.publish("demo", &sig(), &a).await.unwrap();
        assert!(outcome.accepted);
        assert_eq!(outcome.canonical, a);

        // The superseded record stays listed for cleanup.
        let records = cache.get_stages_by_signature("demo", &sig()).await.unwrap();
        assert_eq!(records, vec![a.clone(), b]);
        assert_eq!(cache.lookup("demo", &sig()).await.unwrap(), Some(a));
    }

    #[tokio::test]
    async fn republishing_canonical_record_is_idempotent() {
        let cache = cache();
        let a = StageRecord::at("img-A", "abc123", t0());

        cache.publish("demo", &sig(), &a).await.unwrap();
        let outcome = cache.publish("demo", &sig(), &a).await.unwrap();
        assert!(outcome.accepted);
        assert_eq!(
            cache.get_stages_by_signature("demo", &sig()).await.unwrap(),
            vec![a]
        );
    }

    #[tokio::test]
    async fn lookup_misses_on_unknown_signature() {
        let cache = cache();
        assert!(cache.lookup("demo", &sig()).await.unwrap().is_none());
        assert!(cache.get_all_stages("demo").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn store_get_delete_by_signature() {
        let cache = cache();
        let late = StageRecord::at("img-B", "abc123", t0() + Duration::seconds(1));
        let early = StageRecord::at("img-A", "abc123", t0());

        cache
            .store_stages_by_signature("demo", &sig(), &[late.clone(), early.clone()])
            .await
            .unwrap();
        assert_eq!(
            cache.get_stages_by_signature("demo", &sig()).await.unwrap(),
            vec![early, late]
        );

        cache.delete_stages_by_signature("demo", &sig()).await.unwrap();
        assert!(cache.lookup("demo", &sig()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn projects_do_not_share_stages() {
        let cache = cache();
        let demo = StageRecord::at("img-demo", "s1", t0());
        let other = StageRecord::at("img-other", "s2", t0());

        cache.publish("demo", &"s1".into(), &demo).await.unwrap();
        cache.publish("other", &"s2".into(), &other).await.unwrap();

        assert_eq!(cache.get_all_stages("demo").await.unwrap(), vec![demo]);

        cache.delete_all_stages("demo").await.unwrap();
        assert!(cache.get_all_stages("demo").await.unwrap().is_empty());
        assert_eq!(cache.get_all_stages("other").await.unwrap(), vec![other]);
    }

    #[tokio::test]
    async fn mismatched_signature_is_rejected() {
        let cache = cache();
        let record = StageRecord::at("img", "other-sig", t0());
        let err = cache.publish("demo", &sig(), &record).await.unwrap_err();
        assert!(matches!(err, CacheError::SignatureMismatch { .. }), "{err}");
    }

    #[tokio::test]
    async fn slash_in_project_is_rejected() {
        let cache = cache();
        let err = cache.lookup("demo/evil", &sig()).await.unwrap_err();
        assert!(matches!(err, CacheError::InvalidKey { what: "project name", .. }));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_publishes_converge_on_earliest() {
        let cache = Arc::new(cache());
        let records: Vec<_> = (0..10)
            .map(|i| StageRecord::at(format!("img-{i}"), "abc123", t0() + Duration::milliseconds(i * 7)))
            .collect();

        // Spawn in reverse so the earliest record does not start first.
        let tasks: Vec<_> = records
            .iter()
            .rev()
            .cloned()
            .map(|record| {
                let cache = Arc::clone(&cache);
                tokio::spawn(async move { cache.publish("demo", &sig(), &record).await.unwrap() })
            })
            .collect();

        for task in tasks {
            task.await.unwrap();
        }

        let canonical = cache.lookup("demo", &sig()).await.unwrap().unwrap();
        assert_eq!(canonical, records[0]);

        // Every builder re-checking afterwards adopts the same record.
        for record in &records {
            let outcome = cache.publish("demo", &sig(), record).await.unwrap();
            assert_eq!(outcome.canonical, records[0]);
            assert_eq!(outcome.accepted, record == &records[0]);
        }
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            /// The canonical record after all publishes is the earliest one,
            /// whatever order they arrived in.
            #[test]
            fn canonical_is_independent_of_arrival_order(
                offsets in proptest::collection::hash_set(0i64..10_000, 1..12)
                    .prop_map(|set| set.into_iter().collect::<Vec<_>>())
                    .prop_shuffle()
            ) {
                let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
                rt.block_on(async {
                    let cache = cache();
                    let earliest = *offsets.iter().min().unwrap();
                    for offset in &offsets {
                        let record = StageRecord::at(
                            format!("img-{offset}"),
                            "abc123",
                            t0() + Duration::milliseconds(*offset),
                        );
                        cache.publish("demo", &sig(), &record).await.unwrap();
                    }
                    let canonical = cache.lookup("demo", &sig()).await.unwrap().unwrap();
                    prop_assert_eq!(canonical.image_id, format!("img-{earliest}"));
                    Ok(())
                })?;
            }
        }
    }
}

use std::sync::Arc;

use werf_core::{StageRecord, StageSignature};
use werf_storage::{
    LockGuard, PublishOutcome, StagesStorageCache, StorageLockManager, names,
};

use crate::conveyor::ConveyorError;

/// The build pipeline's view of locking and the stage cache.
#[derive(Clone)]
pub struct StageCoordinator {
    locks: StorageLockManager,
    cache: Arc<dyn StagesStorageCache>,
}

impl std::fmt::Debug for StageCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageCoordinator")
            .field("locks", &self.locks)
            .finish_non_exhaustive()
    }
}

impl StageCoordinator {
    pub fn new(locks: StorageLockManager, cache: Arc<dyn StagesStorageCache>) -> Self {
        Self { locks, cache }
    }

    pub fn locks(&self) -> &StorageLockManager {
        &self.locks
    }

    pub fn cache(&self) -> &Arc<dyn StagesStorageCache> {
        &self.cache
    }

    /// Hold the per-stage lock; release through the returned guard.
    pub async fn acquire_stage_lock(
        &self,
        project: &str,
        stage: &str,
    ) -> Result<LockGuard, ConveyorError> {
        Ok(self.locks.acquire_stage_lock(project, stage).await?)
    }

    /// Canonical record for `signature`, without locking.
    pub async fn lookup_cached_stage(
        &self,
        project: &str,
        signature: &StageSignature,
    ) -> Result<Option<StageRecord>, ConveyorError> {
        Ok(self.cache.lookup(project, signature).await?)
    }

    /// Offer `record` as canonical while holding the signature's lock.
    pub async fn publish_stage(
        &self,
        project: &str,
        signature: &StageSignature,
        record: &StageRecord,
    ) -> Result<PublishOutcome, ConveyorError> {
        let lock_name = names::stage_signature_lock_name(project, signature);
        self.locks
            .with_lock(&lock_name, self.locks.defaults(), || async {
                Ok(self.cache.publish(project, signature, record).await?)
            })
            .await
    }
}

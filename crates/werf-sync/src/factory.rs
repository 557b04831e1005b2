//! Construction of per-client lock and cache backends.

use std::path::PathBuf;
use std::sync::Arc;

use sha2::{Digest, Sha256};
use werf_core::{ClientId, RetryPolicy};
use werf_kube::{KubeClient, KubectlExecutor, KubernetesAnnotationsStore, RealExecutor};
use werf_storage::{
    DistributedLocker, FileStore, InMemoryStore, LockBackend, OptimisticLockingStore,
    StagesStorageCache, StoreStagesStorageCache,
};

use crate::error::SyncError;

/// Namespace holding every client's lock ConfigMap.
pub const KUBERNETES_LOCKS_NAMESPACE: &str = "werf-synchronization";
pub const DEFAULT_KUBERNETES_NAMESPACE_PREFIX: &str = "werf-synchronization-";

const MAX_NAMESPACE_LEN: usize = 63;
/// Hex digits of the client id digest kept when a namespace is shortened.
const NAMESPACE_DIGEST_LEN: usize = 12;

/// The backends serving one client.
#[derive(Clone)]
pub struct ClientSession {
    pub locker: Arc<dyn LockBackend>,
    pub cache: Arc<dyn StagesStorageCache>,
}

impl std::fmt::Debug for ClientSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientSession").finish_non_exhaustive()
    }
}

/// Builds isolated backends for a client id. Called once per client.
pub trait BackendFactory: Send + Sync {
    fn name(&self) -> &'static str;

    fn create(&self, client_id: &ClientId) -> Result<ClientSession, SyncError>;
}

fn session(
    locks: Arc<dyn OptimisticLockingStore>,
    stages: Arc<dyn OptimisticLockingStore>,
    policy: RetryPolicy,
) -> ClientSession {
    ClientSession {
        locker: Arc::new(DistributedLocker::new(locks, policy)),
        cache: Arc::new(StoreStagesStorageCache::new(stages, policy)),
    }
}

// ── Local ──

/// File stores under `<dir>/<client_id>`, or in-memory stores when a
/// directory is not configured.
#[derive(Debug, Clone)]
pub struct LocalBackendFactory {
    lock_dir: Option<PathBuf>,
    cache_dir: Option<PathBuf>,
    policy: RetryPolicy,
}

impl LocalBackendFactory {
    pub fn new(lock_dir: Option<PathBuf>, cache_dir: Option<PathBuf>, policy: RetryPolicy) -> Self {
        Self {
            lock_dir,
            cache_dir,
            policy,
        }
    }

    /// Everything in memory; state lives as long as the server.
    pub fn in_memory(policy: RetryPolicy) -> Self {
        Self::new(None, None, policy)
    }

    fn store(dir: Option<&PathBuf>, client_id: &ClientId) -> Arc<dyn OptimisticLockingStore> {
        match dir {
            Some(dir) => Arc::new(FileStore::new(dir.join(client_id.as_str()))),
            None => Arc::new(InMemoryStore::new()),
        }
    }
}

impl BackendFactory for LocalBackendFactory {
    fn name(&self) -> &'static str {
        "local"
    }

    fn create(&self, client_id: &ClientId) -> Result<ClientSession, SyncError> {
        Ok(session(
            Self::store(self.lock_dir.as_ref(), client_id),
            Self::store(self.cache_dir.as_ref(), client_id),
            self.policy,
        ))
    }
}

// ── Kubernetes ──

/// Locks in ConfigMap `werf-<client_id>` of [`KUBERNETES_LOCKS_NAMESPACE`];
/// stages in ConfigMap `werf-<client_id>` of `<prefix><client_id>`.
pub struct KubernetesBackendFactory<E: KubectlExecutor = RealExecutor> {
    client: Arc<KubeClient<E>>,
    namespace_prefix: String,
    policy: RetryPolicy,
}

impl<E: KubectlExecutor> KubernetesBackendFactory<E> {
    pub fn new(
        client: Arc<KubeClient<E>>,
        namespace_prefix: impl Into<String>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            client,
            namespace_prefix: namespace_prefix.into(),
            policy,
        }
    }

    /// Namespace of `client_id`'s stage cache.
    ///
    /// Ids too long to follow the prefix keep a leading stem plus a digest of
    /// the whole id, so distinct clients still get distinct namespaces.
    pub fn cache_namespace(&self, client_id: &ClientId) -> Result<String, SyncError> {
        let prefix = &self.namespace_prefix;
        let id = client_id.as_str();
        if prefix.len() + id.len() <= MAX_NAMESPACE_LEN {
            return Ok(format!("{prefix}{id}"));
        }

        let room = MAX_NAMESPACE_LEN.saturating_sub(prefix.len());
        if room < NAMESPACE_DIGEST_LEN {
            return Err(SyncError::InvalidField {
                field: "kubernetes-namespace-prefix",
                reason: format!(
                    "prefix {prefix:?} leaves fewer than {NAMESPACE_DIGEST_LEN} of {MAX_NAMESPACE_LEN} namespace characters"
                ),
            });
        }

        let digest = hex::encode(Sha256::digest(id.as_bytes()));
        let digest = &digest[..NAMESPACE_DIGEST_LEN];
        let stem = id[..room.saturating_sub(NAMESPACE_DIGEST_LEN + 1)].trim_end_matches('-');
        if stem.is_empty() {
            Ok(format!("{prefix}{digest}"))
        } else {
            Ok(format!("{prefix}{stem}-{digest}"))
        }
    }
}

impl<E: KubectlExecutor + 'static> BackendFactory for KubernetesBackendFactory<E> {
    fn name(&self) -> &'static str {
        "kubernetes"
    }

    fn create(&self, client_id: &ClientId) -> Result<ClientSession, SyncError> {
        let cache_namespace = self.cache_namespace(client_id)?;
        Ok(session(
            Arc::new(KubernetesAnnotationsStore::for_client(
                Arc::clone(&self.client),
                KUBERNETES_LOCKS_NAMESPACE,
                client_id,
            )),
            Arc::new(KubernetesAnnotationsStore::for_client(
                Arc::clone(&self.client),
                cache_namespace,
                client_id,
            )),
            self.policy,
        ))
    }
}

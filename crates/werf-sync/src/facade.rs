//! Resolution of `[synchronization] address` into a lock manager and a
//! stage cache.
//!
//! ```text
//! ":local"             → DistributedLocker + StoreStagesStorageCache over FileStore
//! "http://host:port"   → SyncClient (both traits) against a synchronization server
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use werf_core::{ClientId, LOCAL_SYNCHRONIZATION, RetryPolicy, WerfConfig};
use werf_storage::{LockOptions, StagesStorageCache, StorageLockManager};

use crate::client::{SyncClient, client_id_for_project};
use crate::error::SyncError;
use crate::factory::{BackendFactory, LocalBackendFactory};

/// Where synchronization happens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SynchronizationAddress {
    Local,
    /// Base URL of a synchronization server, without a trailing slash.
    Remote(String),
}

impl SynchronizationAddress {
    pub fn parse(address: &str) -> Result<Self, SyncError> {
        let address = address.trim();
        if address == LOCAL_SYNCHRONIZATION {
            return Ok(Self::Local);
        }

        let invalid = |reason: String| SyncError::InvalidAddress {
            address: address.to_owned(),
            reason,
        };
        let url = reqwest::Url::parse(address).map_err(|e| invalid(e.to_string()))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(invalid(format!(
                "expected {LOCAL_SYNCHRONIZATION} or an http(s) URL, got scheme {:?}",
                url.scheme()
            )));
        }
        match url.host_str() {
            Some(host) if !host.is_empty() => {}
            _ => return Err(invalid("host is empty".to_owned())),
        }

        Ok(Self::Remote(address.trim_end_matches('/').to_owned()))
    }

    pub fn is_local(&self) -> bool {
        matches!(self, Self::Local)
    }
}

fn default_dir(kind: &str) -> PathBuf {
    std::env::temp_dir().join("werf").join(kind)
}

/// Lock manager and stage cache for one project, local or remote.
#[derive(Clone)]
pub struct Synchronization {
    address: SynchronizationAddress,
    client_id: ClientId,
    locks: StorageLockManager,
    cache: Arc<dyn StagesStorageCache>,
}

impl std::fmt::Debug for Synchronization {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Synchronization")
            .field("address", &self.address)
            .field("client_id", &self.client_id)
            .field("locks", &self.locks)
            .finish_non_exhaustive()
    }
}

impl Synchronization {
    /// Resolve `config` for its project. `address` overrides
    /// `[synchronization] address` when given.
    pub fn from_config(config: &WerfConfig, address: Option<&str>) -> Result<Self, SyncError> {
        let sync = &config.synchronization;
        let address =
            SynchronizationAddress::parse(address.unwrap_or(sync.address.as_str()))?;
        let client_id = client_id_for_project(config.project_name()?);
        let policy = config.retry.policy()?;
        let defaults = LockOptions::from_config(sync)?;

        match address {
            SynchronizationAddress::Local => Self::local(
                client_id,
                sync.local_lock_manager_base_dir
                    .clone()
                    .unwrap_or_else(|| default_dir("local_lock_manager")),
                sync.local_stages_storage_cache_base_dir
                    .clone()
                    .unwrap_or_else(|| default_dir("local_stages_storage_cache")),
                policy,
                defaults,
            ),
            SynchronizationAddress::Remote(url) => {
                Ok(Self::remote(url, client_id, policy, defaults))
            }
        }
    }

    /// File-backed locks and cache under `<dir>/<client_id>`.
    pub fn local(
        client_id: ClientId,
        lock_dir: PathBuf,
        cache_dir: PathBuf,
        policy: RetryPolicy,
        defaults: LockOptions,
    ) -> Result<Self, SyncError> {
        let factory = LocalBackendFactory::new(Some(lock_dir), Some(cache_dir), policy);
        let session = factory.create(&client_id)?;
        tracing::debug!(client_id = %client_id, "using local synchronization");
        Ok(Self {
            address: SynchronizationAddress::Local,
            locks: StorageLockManager::new(session.locker, new_holder_id(), defaults),
            cache: session.cache,
            client_id,
        })
    }

    pub fn remote(
        base_url: impl Into<String>,
        client_id: ClientId,
        policy: RetryPolicy,
        defaults: LockOptions,
    ) -> Self {
        let client = Arc::new(SyncClient::new(base_url, client_id.clone(), policy));
        tracing::debug!(
            client_id = %client_id,
            server = client.base_url(),
            "using synchronization server",
        );
        Self {
            address: SynchronizationAddress::Remote(client.base_url().to_owned()),
            locks: StorageLockManager::new(client.clone(), new_holder_id(), defaults),
            cache: client,
            client_id,
        }
    }

    pub fn address(&self) -> &SynchronizationAddress {
        &self.address
    }

    pub fn client_id(&self) -> &ClientId {
        &self.client_id
    }

    pub fn locks(&self) -> &StorageLockManager {
        &self.locks
    }

    pub fn cache(&self) -> Arc<dyn StagesStorageCache> {
        Arc::clone(&self.cache)
    }
}

/// Identity of this process as a lock holder.
fn new_holder_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn addresses_are_validated() {
        assert_eq!(
            SynchronizationAddress::parse(" :local ").unwrap(),
            SynchronizationAddress::Local
        );
        assert_eq!(
            SynchronizationAddress::parse("http://sync.ci:55581/").unwrap(),
            SynchronizationAddress::Remote("http://sync.ci:55581".into())
        );

        for bad in ["", "local", "ftp://sync.ci", "http://sync.ci:port", "http://:55581"] {
            assert!(
                matches!(
                    SynchronizationAddress::parse(bad),
                    Err(SyncError::InvalidAddress { .. })
                ),
                "{bad:?} should be rejected"
            );
        }
    }

    #[test]
    fn remote_config_needs_a_project_name() {
        let mut config = WerfConfig::default();
        config.synchronization.address = "http://localhost:55581".into();
        assert!(matches!(
            Synchronization::from_config(&config, None),
            Err(SyncError::Config(_))
        ));

        config.project.name = Some("demo".into());
        let sync = Synchronization::from_config(&config, None).unwrap();
        assert_eq!(sync.client_id().as_str(), "demo");
        assert!(!sync.address().is_local());
    }

    #[test]
    fn address_override_wins_over_config() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = WerfConfig::default();
        config.project.name = Some("demo".into());
        config.synchronization.address = "http://localhost:55581".into();
        config.synchronization.local_lock_manager_base_dir = Some(dir.path().join("locks"));
        config.synchronization.local_stages_storage_cache_base_dir =
            Some(dir.path().join("stages"));

        let sync = Synchronization::from_config(&config, Some(":local")).unwrap();
        assert!(sync.address().is_local());
    }
}

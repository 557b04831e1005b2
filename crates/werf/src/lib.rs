//! Distributed locking and stage build-cache synchronization for werf.
//!
//! This is the unified facade crate that re-exports all werf sub-crates.
//! Use feature flags to control which components are included.
//!
//! # Feature flags
//!
//! | Feature | Default | Crate | Description |
//! |---------|---------|-------|-------------|
//! | `core` | yes | [`werf-core`](https://crates.io/crates/werf-core) | Shared types, retry policy, `werf.toml` |
//! | `storage` | yes | [`werf-storage`](https://crates.io/crates/werf-storage) | CAS stores, distributed locker, stages cache, lock manager |
//! | `kube` | no | [`werf-kube`](https://crates.io/crates/werf-kube) | Kubernetes ConfigMap annotation store |
//! | `build` | yes | [`werf-build`](https://crates.io/crates/werf-build) | Stage signatures and the stage conveyor |
//! | `sync` | yes | [`werf-sync`](https://crates.io/crates/werf-sync) | Synchronization server, client and `:local`/remote wiring |
//!
//! `sync` pulls in `kube`, since the server can keep state in a cluster.
//!
//! # Quick start
//!
//! ```toml
//! [dependencies]
//! werf = "0.4"
//! ```
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use werf::{RetryPolicy, StageRecord, StageSignature};
//! use werf::storage::{
//!     DistributedLocker, FileStore, LockOptions, StagesStorageCache, StorageLockManager,
//!     StoreStagesStorageCache, names,
//! };
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let store = Arc::new(FileStore::new("/tmp/werf/demo"));
//! let locker = DistributedLocker::new(Arc::clone(&store), RetryPolicy::default());
//! let cache = StoreStagesStorageCache::new(store, RetryPolicy::default());
//! let locks = StorageLockManager::new(Arc::new(locker), "ci-job-1", LockOptions::default());
//!
//! let signature = StageSignature::from("5d41402abc4b2a76b9719d911017c592");
//! let record = StageRecord::new("sha256:0b1c", signature.clone());
//! let lock_name = names::stage_signature_lock_name("demo", &signature);
//! let outcome = locks
//!     .with_lock(&lock_name, locks.defaults(), || async {
//!         Ok::<_, Box<dyn std::error::Error>>(cache.publish("demo", &signature, &record).await?)
//!     })
//!     .await?;
//! println!("canonical image: {}", outcome.canonical.image_id);
//! # Ok(())
//! # }
//! ```

// Core types flattened into root namespace for convenience.
#[cfg(feature = "core")]
pub use werf_core::*;

/// Optimistic stores, the distributed locker, the stages storage cache and
/// the lock manager.
///
/// See [`werf-storage`](https://crates.io/crates/werf-storage) for details.
#[cfg(feature = "storage")]
pub mod storage {
    pub use werf_storage::*;
}

/// Kubernetes-backed optimistic store driven through `kubectl`.
///
/// See [`werf-kube`](https://crates.io/crates/werf-kube) for details.
#[cfg(feature = "kube")]
pub mod kube {
    pub use werf_kube::*;
}

/// Stage signatures, build planning and the cache-aware stage conveyor.
///
/// See [`werf-build`](https://crates.io/crates/werf-build) for details.
#[cfg(feature = "build")]
pub mod build {
    pub use werf_build::*;
}

/// Synchronization server, its HTTP client and the `:local`/remote facade.
///
/// See [`werf-sync`](https://crates.io/crates/werf-sync) for details.
#[cfg(feature = "sync")]
pub mod sync {
    pub use werf_sync::*;
}

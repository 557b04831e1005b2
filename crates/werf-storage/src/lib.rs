//! Distributed locking and stage cache bookkeeping for werf.
//!
//! # Layers
//!
//! ```text
//! StorageLockManager ── scoped acquisition, waiting, lease renewal
//!   └─ LockBackend ──── DistributedLocker (local) | remote server client
//!        └─ OptimisticLockingStore ── InMemoryStore | FileStore | Kubernetes annotations
//!
//! StagesStorageCache ── StoreStagesStorageCache (local) | remote server client
//!   └─ OptimisticLockingStore
//! ```
//!
//! Every mutation of lock or cache state is a compare-and-swap against the
//! store; nothing is written blindly. Reads never take a lock.

pub mod cache;
pub mod locker;
pub mod manager;
pub mod names;
pub mod store;

pub use cache::{CacheError, PublishOutcome, StagesStorageCache, StoreStagesStorageCache};
pub use locker::{AcquireOptions, AcquireOutcome, DistributedLocker, LockBackend, LockError};
pub use manager::{LockGuard, LockOptions, StorageLockManager, WaitPolicy};
pub use store::{
    CasOutcome, FileStore, InMemoryStore, OptimisticLockingStore, StoreError, Versioned,
};

//! Cross-host coordination of werf builds.
//!
//! A synchronization server exposes per-client lockers and stage caches over
//! HTTP/JSON; [`SyncClient`] speaks that protocol and implements the same
//! [`werf_storage::LockBackend`] and [`werf_storage::StagesStorageCache`]
//! traits as the local backends, so callers cannot tell them apart.
//! [`Synchronization`] picks one of the two from `werf.toml`.

pub mod client;
pub mod error;
pub mod facade;
pub mod factory;
pub mod protocol;
pub mod registry;
pub mod server;

pub use client::{SyncClient, client_id_for_project, new_client_id};
pub use error::SyncError;
pub use facade::{Synchronization, SynchronizationAddress};
pub use factory::{
    BackendFactory, ClientSession, DEFAULT_KUBERNETES_NAMESPACE_PREFIX,
    KUBERNETES_LOCKS_NAMESPACE, KubernetesBackendFactory, LocalBackendFactory,
};
pub use registry::ClientRegistry;
pub use server::{
    DEFAULT_HOST, DEFAULT_PORT, DEFAULT_TTL, ServerConfig, ServerState, SynchronizationServer,
    router,
};

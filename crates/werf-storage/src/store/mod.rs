//! Compare-and-swap primitive over a shared backing medium.

mod file;
mod memory;

pub use file::FileStore;
pub use memory::InMemoryStore;

use serde::Serialize;
use serde::de::DeserializeOwned;
use std::path::PathBuf;
use werf_core::Retryable;

/// Current value of a key and the version it was read at.
///
/// Version `0` means the key has never been written (or was removed by a
/// backend that does not keep tombstones). `value: None` means absent.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Versioned {
    pub value: Option<String>,
    pub version: u64,
}

/// Result of a compare-and-swap attempt. A conflict is not an error: the
/// caller re-reads and retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CasOutcome {
    Swapped { version: u64 },
    Conflict { current: u64 },
}

impl CasOutcome {
    pub fn is_swapped(&self) -> bool {
        matches!(self, Self::Swapped { .. })
    }
}

/// Key/value store with optimistic concurrency.
///
/// `compare_and_swap` succeeds iff the stored version equals
/// `expected_version`, then bumps the version. Writing `None` removes the
/// value.
#[async_trait::async_trait]
pub trait OptimisticLockingStore: Send + Sync {
    /// Short backend name for logs and errors.
    fn backend_name(&self) -> &'static str;

    async fn get(&self, key: &str) -> Result<Versioned, StoreError>;

    async fn compare_and_swap(
        &self,
        key: &str,
        expected_version: u64,
        value: Option<String>,
    ) -> Result<CasOutcome, StoreError>;

    /// Keys currently holding a value that start with `prefix`, sorted.
    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError>;
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("{backend} store unavailable: {detail}")]
    Unavailable {
        backend: &'static str,
        detail: String,
    },

    #[error("store I/O failed at {path}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("malformed value stored under {key:?}")]
    Decode {
        key: String,
        source: serde_json::Error,
    },

    #[error("failed to encode value for {key:?}")]
    Encode {
        key: String,
        source: serde_json::Error,
    },

    #[error("{backend} store rejected the request: {detail}")]
    Rejected {
        backend: &'static str,
        detail: String,
    },
}

impl Retryable for StoreError {
    fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable { .. } | Self::Io { .. })
    }
}

/// Decode the JSON value under `key`, returning it with its version.
pub(crate) fn decode<T: DeserializeOwned>(
    key: &str,
    current: &Versioned,
) -> Result<Option<T>, StoreError> {
    current
        .value
        .as_deref()
        .map(|raw| {
            serde_json::from_str(raw).map_err(|e| StoreError::Decode {
                key: key.to_owned(),
                source: e,
            })
        })
        .transpose()
}

pub(crate) fn encode<T: Serialize>(key: &str, value: &T) -> Result<String, StoreError> {
    serde_json::to_string(value).map_err(|e| StoreError::Encode {
        key: key.to_owned(),
        source: e,
    })
}

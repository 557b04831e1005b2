use std::fs::{File, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use fs2::FileExt;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::{CasOutcome, OptimisticLockingStore, StoreError, Versioned};

const LOCK_FILE_NAME: &str = ".store.lock";

/// Store persisted as one JSON file per key under a base directory.
///
/// Compare-and-swap holds an exclusive `flock` on a store-wide lock file
/// while it reads, compares, and atomically renames the new value into place,
/// so concurrent processes on one host see a linearizable history. Reads take
/// no lock; they always observe a complete file thanks to the rename.
#[derive(Debug, Clone)]
pub struct FileStore {
    base_dir: PathBuf,
}

/// On-disk envelope. Keeps the original key so listings can be answered
/// without reversing the file name hash.
#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    key: String,
    version: u64,
    value: Option<String>,
}

impl FileStore {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&Path) -> Result<T, StoreError> + Send + 'static,
    {
        let base_dir = self.base_dir.clone();
        tokio::task::spawn_blocking(move || f(&base_dir))
            .await
            .map_err(|e| StoreError::Unavailable {
                backend: "file",
                detail: format!("blocking task failed: {e}"),
            })?
    }
}

#[async_trait::async_trait]
impl OptimisticLockingStore for FileStore {
    fn backend_name(&self) -> &'static str {
        "file"
    }

    async fn get(&self, key: &str) -> Result<Versioned, StoreError> {
        let key = key.to_owned();
        self.blocking(move |dir| {
            Ok(read_envelope(&entry_path(dir, &key))?
                .map(|envelope| Versioned {
                    value: envelope.value,
                    version: envelope.version,
                })
                .unwrap_or_default())
        })
        .await
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected_version: u64,
        value: Option<String>,
    ) -> Result<CasOutcome, StoreError> {
        let key = key.to_owned();
        self.blocking(move |dir| {
            let _lock = lock_store(dir)?;

            let path = entry_path(dir, &key);
            let current = read_envelope(&path)?.map_or(0, |envelope| envelope.version);
            if current != expected_version {
                return Ok(CasOutcome::Conflict { current });
            }

            let envelope = Envelope {
                key: key.clone(),
                version: current + 1,
                value,
            };
            write_envelope(&path, &envelope)?;
            Ok(CasOutcome::Swapped {
                version: envelope.version,
            })
        })
        .await
    }

    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let prefix = prefix.to_owned();
        self.blocking(move |dir| {
            let entries = match std::fs::read_dir(dir) {
                Ok(entries) => entries,
                Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
                Err(e) => {
                    return Err(StoreError::Io {
                        path: dir.to_path_buf(),
                        source: e,
                    });
                }
            };

            let mut keys = Vec::new();
            for entry in entries {
                let entry = entry.map_err(|e| StoreError::Io {
                    path: dir.to_path_buf(),
                    source: e,
                })?;
                let path = entry.path();
                if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                    continue;
                }
                if let Some(envelope) = read_envelope(&path)?
                    && envelope.value.is_some()
                    && envelope.key.starts_with(&prefix)
                {
                    keys.push(envelope.key);
                }
            }
            keys.sort();
            Ok(keys)
        })
        .await
    }
}

fn entry_path(dir: &Path, key: &str) -> PathBuf {
    let digest = Sha256::digest(key.as_bytes());
    dir.join(format!("{}.json", hex::encode(digest)))
}

fn lock_store(dir: &Path) -> Result<File, StoreError> {
    std::fs::create_dir_all(dir).map_err(|e| StoreError::Io {
        path: dir.to_path_buf(),
        source: e,
    })?;

    let lock_path = dir.join(LOCK_FILE_NAME);
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(&lock_path)
        .map_err(|e| StoreError::Io {
            path: lock_path.clone(),
            source: e,
        })?;

    file.lock_exclusive().map_err(|e| StoreError::Io {
        path: lock_path,
        source: e,
    })?;

    // Released when the handle is dropped.
    Ok(file)
}

fn read_envelope(path: &Path) -> Result<Option<Envelope>, StoreError> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(StoreError::Io {
                path: path.to_path_buf(),
                source: e,
            });
        }
    };

    serde_json::from_str(&raw)
        .map(Some)
        .map_err(|e| StoreError::Decode {
            key: path.display().to_string(),
            source: e,
        })
}

fn write_envelope(path: &Path, envelope: &Envelope) -> Result<(), StoreError> {
    let raw = serde_json::to_string(envelope).map_err(|e| StoreError::Encode {
        key: envelope.key.clone(),
        source: e,
    })?;

    let tmp_path = path.with_extension("json.tmp");
    std::fs::write(&tmp_path, raw).map_err(|e| StoreError::Io {
        path: tmp_path.clone(),
        source: e,
    })?;
    std::fs::rename(&tmp_path, path).map_err(|e| StoreError::Io {
        path: path.to_path_buf(),
        source: e,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::contract;
    use std::sync::Arc;
    use tempfile::TempDir;

    #[tokio::test]
    async fn cas_on_fresh_key() {
        let tmp = TempDir::new().unwrap();
        contract::cas_on_fresh_key(&FileStore::new(tmp.path())).await;
    }

    #[tokio::test]
    async fn stale_version_conflicts() {
        let tmp = TempDir::new().unwrap();
        contract::stale_version_conflicts(&FileStore::new(tmp.path())).await;
    }

    #[tokio::test]
    async fn delete_and_list() {
        let tmp = TempDir::new().unwrap();
        contract::delete_and_list(&FileStore::new(tmp.path())).await;
    }

    #[tokio::test]
    async fn missing_directory_reads_as_empty() {
        let tmp = TempDir::new().unwrap();
        let store = FileStore::new(tmp.path().join("not-yet"));

        assert_eq!(store.get("k").await.unwrap(), Versioned::default());
        assert!(store.keys_with_prefix("").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn state_survives_reopen() {
        let tmp = TempDir::new().unwrap();
        FileStore::new(tmp.path())
            .compare_and_swap("lock/demo", 0, Some("held".into()))
            .await
            .unwrap();

        let reopened = FileStore::new(tmp.path());
        let current = reopened.get("lock/demo").await.unwrap();
        assert_eq!(current.value.as_deref(), Some("held"));
        assert_eq!(current.version, 1);
    }

    #[tokio::test]
    async fn corrupt_entry_is_a_decode_error() {
        let tmp = TempDir::new().unwrap();
        let store = FileStore::new(tmp.path());
        std::fs::write(entry_path(tmp.path(), "k"), "{not json").unwrap();

        let err = store.get("k").await.unwrap_err();
        assert!(matches!(err, StoreError::Decode { .. }));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_cas_has_single_winner() {
        let tmp = TempDir::new().unwrap();
        let store = Arc::new(FileStore::new(tmp.path()));
        store.compare_and_swap("k", 0, Some("seed".into())).await.unwrap();

        let tasks: Vec<_> = (0..8)
            .map(|i| {
                let store = Arc::clone(&store);
                tokio::spawn(async move {
                    store
                        .compare_and_swap("k", 1, Some(format!("writer-{i}")))
                        .await
                        .unwrap()
                })
            })
            .collect();

        let mut winners = 0;
        for task in tasks {
            if task.await.unwrap().is_swapped() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }
}

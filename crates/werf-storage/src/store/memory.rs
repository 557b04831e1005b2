use std::collections::HashMap;

use parking_lot::Mutex;

use super::{CasOutcome, OptimisticLockingStore, StoreError, Versioned};

/// Process-local store guarded by a single mutex.
///
/// Deleted keys keep a tombstone so versions stay monotonic.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    entries: Mutex<HashMap<String, Versioned>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl OptimisticLockingStore for InMemoryStore {
    fn backend_name(&self) -> &'static str {
        "in-memory"
    }

    async fn get(&self, key: &str) -> Result<Versioned, StoreError> {
        Ok(self.entries.lock().get(key).cloned().unwrap_or_default())
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected_version: u64,
        value: Option<String>,
    ) -> Result<CasOutcome, StoreError> {
        let mut entries = self.entries.lock();
        let entry = entries.entry(key.to_owned()).or_default();

        if entry.version != expected_version {
            return Ok(CasOutcome::Conflict {
                current: entry.version,
            });
        }

        entry.version += 1;
        entry.value = value;
        Ok(CasOutcome::Swapped {
            version: entry.version,
        })
    }

    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let mut keys: Vec<String> = self
            .entries
            .lock()
            .iter()
            .filter(|(key, entry)| key.starts_with(prefix) && entry.value.is_some())
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort();
        Ok(keys)
    }
}

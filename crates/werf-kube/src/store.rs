use std::error::Error as _;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use werf_core::ClientId;
use werf_storage::{CasOutcome, OptimisticLockingStore, StoreError, Versioned};

use crate::client::{ConfigMap, KubeClient, KubeError};
use crate::executor::{KubectlExecutor, RealExecutor};

pub const ANNOTATION_PREFIX: &str = "werf.io/";

/// Hex characters of the key digest used in annotation names. Annotation
/// names are limited to 63 characters after the prefix.
const ANNOTATION_DIGEST_LEN: usize = 32;

/// Kubernetes rejects objects whose annotations (names and values) exceed
/// this many bytes in total.
pub const MAX_ANNOTATIONS_BYTES: usize = 256 * 1024;

const BACKEND: &str = "kubernetes";

/// Optimistic store kept in the annotations of a single ConfigMap.
///
/// Each key lives in its own annotation holding `{key, version, value}`.
/// Writes replace the whole ConfigMap guarded by its resourceVersion, so a
/// concurrent write to any key surfaces as a conflict and the caller re-reads.
/// Deleted keys keep a tombstone annotation so versions stay monotonic.
pub struct KubernetesAnnotationsStore<E: KubectlExecutor = RealExecutor> {
    client: Arc<KubeClient<E>>,
    namespace: String,
    name: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    key: String,
    version: u64,
    value: Option<String>,
}

impl<E: KubectlExecutor> KubernetesAnnotationsStore<E> {
    pub fn new(
        client: Arc<KubeClient<E>>,
        namespace: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            client,
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Store in ConfigMap `werf-<client_id>` of `namespace`.
    pub fn for_client(
        client: Arc<KubeClient<E>>,
        namespace: impl Into<String>,
        client_id: &ClientId,
    ) -> Self {
        Self::new(client, namespace, configmap_name(client_id))
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn configmap_name(&self) -> &str {
        &self.name
    }

    /// Fetch the ConfigMap, creating it (and its namespace) on first use.
    async fn load(&self) -> Result<ConfigMap, StoreError> {
        if let Some(configmap) = self
            .client
            .get_configmap(&self.namespace, &self.name)
            .await
            .map_err(store_error)?
        {
            return Ok(configmap);
        }

        self.client
            .ensure_namespace(&self.namespace)
            .await
            .map_err(store_error)?;
        self.client
            .create_configmap(&ConfigMap::new(&self.namespace, &self.name))
            .await
            .map_err(store_error)?;

        self.client
            .get_configmap(&self.namespace, &self.name)
            .await
            .map_err(store_error)?
            .ok_or_else(|| StoreError::Unavailable {
                backend: BACKEND,
                detail: format!(
                    "configmap {}/{} vanished right after creation",
                    self.namespace, self.name
                ),
            })
    }
}

pub fn configmap_name(client_id: &ClientId) -> String {
    format!("werf-{client_id}")
}

fn annotation_name(key: &str) -> String {
    let digest = hex::encode(Sha256::digest(key.as_bytes()));
    format!("{ANNOTATION_PREFIX}{}", &digest[..ANNOTATION_DIGEST_LEN])
}

/// Whether `name` is an annotation written by this store rather than by
/// some other tool sharing the `werf.io/` prefix.
fn is_store_annotation(name: &str) -> bool {
    name.strip_prefix(ANNOTATION_PREFIX).is_some_and(|digest| {
        digest.len() == ANNOTATION_DIGEST_LEN
            && digest.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
    })
}

fn annotations_size(configmap: &ConfigMap) -> usize {
    configmap
        .metadata
        .annotations
        .iter()
        .map(|(name, value)| name.len() + value.len())
        .sum()
}

fn read_envelope(configmap: &ConfigMap, key: &str) -> Result<Option<Envelope>, StoreError> {
    configmap
        .metadata
        .annotations
        .get(&annotation_name(key))
        .map(|raw| decode_envelope(key, raw))
        .transpose()
}

fn decode_envelope(key: &str, raw: &str) -> Result<Envelope, StoreError> {
    serde_json::from_str(raw).map_err(|e| StoreError::Decode {
        key: key.to_owned(),
        source: e,
    })
}

fn store_error(err: KubeError) -> StoreError {
    let mut detail = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        detail.push_str(": ");
        detail.push_str(&cause.to_string());
        source = cause.source();
    }

    if err.is_transient() {
        StoreError::Unavailable {
            backend: BACKEND,
            detail,
        }
    } else {
        StoreError::Rejected {
            backend: BACKEND,
            detail,
        }
    }
}

#[async_trait::async_trait]
impl<E: KubectlExecutor> OptimisticLockingStore for KubernetesAnnotationsStore<E> {
    fn backend_name(&self) -> &'static str {
        BACKEND
    }

    async fn get(&self, key: &str) -> Result<Versioned, StoreError> {
        let configmap = self.load().await?;
        Ok(read_envelope(&configmap, key)?
            .map(|envelope| Versioned {
                value: envelope.value,
                version: envelope.version,
            })
            .unwrap_or_default())
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected_version: u64,
        value: Option<String>,
    ) -> Result<CasOutcome, StoreError> {
        let mut configmap = self.load().await?;
        let current = read_envelope(&configmap, key)?.map_or(0, |e| e.version);
        if current != expected_version {
            return Ok(CasOutcome::Conflict { current });
        }

        let envelope = Envelope {
            key: key.to_owned(),
            version: current + 1,
            value,
        };
        let raw = serde_json::to_string(&envelope).map_err(|e| StoreError::Encode {
            key: key.to_owned(),
            source: e,
        })?;
        configmap
            .metadata
            .annotations
            .insert(annotation_name(key), raw);

        let size = annotations_size(&configmap);
        if size > MAX_ANNOTATIONS_BYTES {
            return Err(StoreError::Rejected {
                backend: BACKEND,
                detail: format!(
                    "writing {key} would grow the annotations of configmap {}/{} to {size} bytes, over the {MAX_ANNOTATIONS_BYTES} byte limit",
                    self.namespace, self.name
                ),
            });
        }

        match self.client.replace_configmap(&configmap).await {
            Ok(()) => Ok(CasOutcome::Swapped {
                version: envelope.version,
            }),
            Err(KubeError::Conflict { .. }) => {
                // Another key may have changed; report whatever this key is at
                // now and let the caller re-read.
                let latest = self.load().await?;
                let current = read_envelope(&latest, key)?.map_or(0, |e| e.version);
                tracing::debug!(
                    namespace = %self.namespace,
                    configmap = %self.name,
                    key,
                    current,
                    "configmap changed concurrently",
                );
                Ok(CasOutcome::Conflict { current })
            }
            Err(e) => Err(store_error(e)),
        }
    }

    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let configmap = self.load().await?;
        let mut keys = Vec::new();
        for (name, raw) in &configmap.metadata.annotations {
            if !is_store_annotation(name) {
                tracing::trace!(annotation = %name, "skipping foreign annotation");
                continue;
            }
            let envelope = decode_envelope(name, raw)?;
            if envelope.value.is_some() && envelope.key.starts_with(prefix) {
                keys.push(envelope.key);
            }
        }
        keys.sort();
        Ok(keys)
    }
}

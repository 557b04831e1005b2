use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::executor::{KubectlExecutor, RealExecutor};
use crate::kubectl::KubectlError;

/// Which cluster kubectl talks to. Empty fields fall back to kubectl's own
/// defaults (current context, `KUBECONFIG`).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KubeTarget {
    pub context: Option<String>,
    pub kubeconfig: Option<PathBuf>,
}

/// The subset of a ConfigMap werf reads and writes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigMap {
    pub api_version: String,
    pub kind: String,
    pub metadata: ObjectMeta,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub data: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    pub name: String,
    pub namespace: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_version: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
    /// Labels, uid, and other fields werf does not touch, kept so a replace
    /// does not clear them.
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl ConfigMap {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            api_version: "v1".to_owned(),
            kind: "ConfigMap".to_owned(),
            metadata: ObjectMeta {
                name: name.into(),
                namespace: namespace.into(),
                ..ObjectMeta::default()
            },
            data: BTreeMap::new(),
        }
    }
}

/// Kubernetes operations client, parameterized over the executor for
/// testability.
pub struct KubeClient<E: KubectlExecutor = RealExecutor> {
    executor: E,
    target: KubeTarget,
}

impl KubeClient<RealExecutor> {
    pub fn new(target: KubeTarget) -> Self {
        Self {
            executor: RealExecutor,
            target,
        }
    }
}

impl<E: KubectlExecutor> KubeClient<E> {
    pub fn with_executor(executor: E, target: KubeTarget) -> Self {
        Self { executor, target }
    }

    pub fn target(&self) -> &KubeTarget {
        &self.target
    }

    // ── Namespaces ──

    /// Create `namespace` unless it already exists.
    pub async fn ensure_namespace(&self, namespace: &str) -> Result<(), KubeError> {
        match self
            .executor
            .exec(&self.command(None, ["create", "namespace", namespace]))
            .await
        {
            Ok(_) => {
                tracing::info!(namespace, "created namespace");
                Ok(())
            }
            Err(e) if e.is_already_exists() => Ok(()),
            Err(e) => Err(KubeError::Kubectl {
                action: "create namespace",
                source: e,
            }),
        }
    }

    // ── ConfigMaps ──

    pub async fn get_configmap(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ConfigMap>, KubeError> {
        let output = match self
            .executor
            .exec(&self.command(Some(namespace), ["get", "configmap", name, "-o", "json"]))
            .await
        {
            Ok(output) => output,
            Err(e) if e.is_not_found() => return Ok(None),
            Err(e) => {
                return Err(KubeError::Kubectl {
                    action: "get configmap",
                    source: e,
                });
            }
        };

        serde_json::from_str(&output)
            .map(Some)
            .map_err(|e| KubeError::Decode {
                action: "get configmap",
                source: e,
            })
    }

    /// Create `configmap`. Returns `false` if it already existed.
    pub async fn create_configmap(&self, configmap: &ConfigMap) -> Result<bool, KubeError> {
        let manifest = encode(configmap)?;
        match self
            .executor
            .exec_with_stdin(
                &self.command(Some(&configmap.metadata.namespace), ["create", "-f", "-"]),
                &manifest,
            )
            .await
        {
            Ok(_) => {
                tracing::debug!(
                    namespace = %configmap.metadata.namespace,
                    name = %configmap.metadata.name,
                    "created configmap",
                );
                Ok(true)
            }
            Err(e) if e.is_already_exists() => Ok(false),
            Err(e) => Err(KubeError::Kubectl {
                action: "create configmap",
                source: e,
            }),
        }
    }

    /// Replace `configmap` guarded by its `resourceVersion`.
    ///
    /// A stale resourceVersion yields [`KubeError::Conflict`].
    pub async fn replace_configmap(&self, configmap: &ConfigMap) -> Result<(), KubeError> {
        let manifest = encode(configmap)?;
        match self
            .executor
            .exec_with_stdin(
                &self.command(Some(&configmap.metadata.namespace), ["replace", "-f", "-"]),
                &manifest,
            )
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if e.is_conflict() => Err(KubeError::Conflict {
                namespace: configmap.metadata.namespace.clone(),
                name: configmap.metadata.name.clone(),
            }),
            Err(e) => Err(KubeError::Kubectl {
                action: "replace configmap",
                source: e,
            }),
        }
    }

    // ── Helper ──

    fn command<const N: usize>(&self, namespace: Option<&str>, a: [&str; N]) -> Vec<String> {
        let mut args = Vec::with_capacity(N + 6);
        if let Some(context) = &self.target.context {
            args.extend(["--context".to_owned(), context.clone()]);
        }
        if let Some(kubeconfig) = &self.target.kubeconfig {
            args.extend([
                "--kubeconfig".to_owned(),
                kubeconfig.display().to_string(),
            ]);
        }
        if let Some(namespace) = namespace {
            args.extend(["--namespace".to_owned(), namespace.to_owned()]);
        }
        args.extend(a.iter().map(|s| (*s).to_owned()));
        args
    }
}

fn encode(configmap: &ConfigMap) -> Result<Vec<u8>, KubeError> {
    serde_json::to_vec(configmap).map_err(|e| KubeError::Encode {
        name: configmap.metadata.name.clone(),
        source: e,
    })
}

// ── Error types ──

#[derive(Debug, thiserror::Error)]
pub enum KubeError {
    #[error("kubectl {action} failed")]
    Kubectl {
        action: &'static str,
        source: KubectlError,
    },

    #[error("configmap {namespace}/{name} was modified concurrently")]
    Conflict { namespace: String, name: String },

    #[error("unexpected kubectl output for {action}")]
    Decode {
        action: &'static str,
        source: serde_json::Error,
    },

    #[error("failed to encode configmap {name}")]
    Encode {
        name: String,
        source: serde_json::Error,
    },
}

impl KubeError {
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Kubectl { source, .. } => source.is_transient(),
            _ => false,
        }
    }
}

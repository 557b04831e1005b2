//! Kubernetes-backed coordination for werf.
//!
//! Lock and stage cache records are kept as annotations on one ConfigMap per
//! synchronization client, read and written through `kubectl`.

pub mod client;
pub mod executor;
pub mod kubectl;
pub mod store;

pub use client::{ConfigMap, KubeClient, KubeError, KubeTarget, ObjectMeta};
pub use executor::{KubectlExecutor, RealExecutor};
pub use kubectl::KubectlError;
pub use store::{KubernetesAnnotationsStore, MAX_ANNOTATIONS_BYTES, configmap_name};

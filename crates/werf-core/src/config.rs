use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::RetryPolicy;
use crate::duration::{parse_duration, parse_positive_duration};

/// Address value selecting process-local locking and caching.
pub const LOCAL_SYNCHRONIZATION: &str = ":local";

/// werf.toml configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WerfConfig {
    #[serde(default)]
    pub project: ProjectConfig,
    #[serde(default)]
    pub synchronization: SynchronizationConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    /// Stage definitions in build order
    #[serde(default, rename = "stage")]
    pub stages: Vec<StageDefinition>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProjectConfig {
    /// Project name; lock and cache keys are scoped by it
    pub name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SynchronizationConfig {
    /// `:local` or the base URL of a synchronization server
    #[serde(default = "default_address")]
    pub address: String,
    /// Lease lifetime of an acquired lock
    #[serde(default = "default_ttl")]
    pub ttl: String,
    /// How long to wait for a busy lock before giving up
    #[serde(default = "default_acquire_timeout")]
    pub acquire_timeout: String,
    /// Pause between attempts while waiting for a busy lock
    #[serde(default = "default_poll_interval")]
    pub poll_interval: String,
    /// Directory for file-backed lock records in local mode
    #[serde(default)]
    pub local_lock_manager_base_dir: Option<PathBuf>,
    /// Directory for file-backed stage cache records in local mode
    #[serde(default)]
    pub local_stages_storage_cache_base_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay")]
    pub base_delay: String,
    #[serde(default = "default_max_delay")]
    pub max_delay: String,
}

/// One cacheable stage as declared in werf.toml.
///
/// ```toml
/// [[stage]]
/// name = "install"
/// git_paths = ["package.json", "package-lock.json"]
/// set_fields = ["packages"]
///
/// [stage.config]
/// run = "npm ci"
/// packages = ["curl", "git"]
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageDefinition {
    pub name: String,
    /// Declared configuration; every field participates in the signature
    #[serde(default)]
    pub config: BTreeMap<String, toml::Value>,
    /// Repository paths whose content feeds the stage
    #[serde(default)]
    pub git_paths: Vec<String>,
    /// Config fields whose arrays are unordered sets
    #[serde(default)]
    pub set_fields: Vec<String>,
}

impl Default for SynchronizationConfig {
    fn default() -> Self {
        Self {
            address: default_address(),
            ttl: default_ttl(),
            acquire_timeout: default_acquire_timeout(),
            poll_interval: default_poll_interval(),
            local_lock_manager_base_dir: None,
            local_stages_storage_cache_base_dir: None,
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay: default_base_delay(),
            max_delay: default_max_delay(),
        }
    }
}

impl WerfConfig {
    /// Load from werf.toml at the given path, or return defaults if not found.
    pub fn load(project_dir: &std::path::Path) -> crate::Result<Self> {
        let config_path = project_dir.join("werf.toml");
        if config_path.exists() {
            let content =
                std::fs::read_to_string(&config_path).map_err(|e| crate::Error::ConfigLoad {
                    path: config_path.clone(),
                    source: e,
                })?;
            let config: Self =
                toml::from_str(&content).map_err(|e| crate::Error::ConfigParse {
                    path: config_path.clone(),
                    source: e,
                })?;
            tracing::debug!(path = %config_path.display(), stages = config.stages.len(), "loaded werf.toml");
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    /// Project name, required by every lock and cache operation.
    pub fn project_name(&self) -> crate::Result<&str> {
        match self.project.name.as_deref() {
            Some(name) if !name.trim().is_empty() => Ok(name),
            _ => Err(crate::Error::invalid_field(
                "project.name",
                "not set in werf.toml; set [project].name",
            )),
        }
    }
}

impl SynchronizationConfig {
    pub fn is_local(&self) -> bool {
        self.address.trim() == LOCAL_SYNCHRONIZATION
    }

    pub fn ttl(&self) -> crate::Result<Duration> {
        parse_positive_duration("synchronization.ttl", &self.ttl)
    }

    pub fn acquire_timeout(&self) -> crate::Result<Duration> {
        parse_duration("synchronization.acquire_timeout", &self.acquire_timeout)
    }

    pub fn poll_interval(&self) -> crate::Result<Duration> {
        parse_positive_duration("synchronization.poll_interval", &self.poll_interval)
    }
}

impl RetryConfig {
    /// Validate and convert into a [`RetryPolicy`].
    pub fn policy(&self) -> crate::Result<RetryPolicy> {
        if self.max_attempts == 0 {
            return Err(crate::Error::invalid_field(
                "retry.max_attempts",
                "must be at least 1",
            ));
        }
        Ok(RetryPolicy {
            max_attempts: self.max_attempts,
            base_delay: parse_duration("retry.base_delay", &self.base_delay)?,
            max_delay: parse_duration("retry.max_delay", &self.max_delay)?,
        })
    }
}

fn default_address() -> String {
    LOCAL_SYNCHRONIZATION.to_owned()
}

fn default_ttl() -> String {
    "30s".to_owned()
}

fn default_acquire_timeout() -> String {
    "10m".to_owned()
}

fn default_poll_interval() -> String {
    "1s".to_owned()
}

fn default_max_attempts() -> u32 {
    5
}

fn default_base_delay() -> String {
    "100ms".to_owned()
}

fn default_max_delay() -> String {
    "5s".to_owned()
}

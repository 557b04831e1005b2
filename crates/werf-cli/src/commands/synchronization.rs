use std::path::PathBuf;
use std::sync::Arc;

use anyhow::bail;
use clap::parser::ValueSource;
use clap::{ArgMatches, Args};
use werf_core::RetryPolicy;
use werf_kube::{KubeClient, KubeTarget};
use werf_sync::{
    BackendFactory, DEFAULT_KUBERNETES_NAMESPACE_PREFIX, KubernetesBackendFactory,
    LocalBackendFactory, ServerConfig, SynchronizationServer,
};

#[derive(Args, Debug)]
pub struct SynchronizationArgs {
    /// Keep locks and stages in local files or memory
    #[arg(
        long,
        env = "WERF_LOCAL",
        default_value_t = true,
        num_args = 0..=1,
        require_equals = true,
        default_missing_value = "true",
        value_parser = clap::builder::BoolishValueParser::new()
    )]
    local: bool,
    /// Keep locks and stages in Kubernetes ConfigMap annotations
    #[arg(long, env = "WERF_KUBERNETES")]
    kubernetes: bool,
    /// Prefix of the per-client namespaces holding stages
    #[arg(
        long,
        default_value = DEFAULT_KUBERNETES_NAMESPACE_PREFIX,
        env = "WERF_KUBERNETES_NAMESPACE_PREFIX"
    )]
    kubernetes_namespace_prefix: String,
    #[arg(long, default_value = werf_sync::DEFAULT_HOST, env = "WERF_HOST")]
    host: String,
    #[arg(long, default_value = "55581", env = "WERF_PORT")]
    port: String,
    /// Lease lifetime for clients that do not request one, e.g. 30s
    #[arg(long, env = "WERF_TTL")]
    ttl: Option<String>,
    /// Lock files live under <dir>/<client-id>; in memory when unset
    #[arg(long, env = "WERF_LOCAL_LOCK_MANAGER_BASE_DIR")]
    local_lock_manager_base_dir: Option<PathBuf>,
    /// Stage files live under <dir>/<client-id>; in memory when unset
    #[arg(long, env = "WERF_LOCAL_STAGES_STORAGE_CACHE_BASE_DIR")]
    local_stages_storage_cache_base_dir: Option<PathBuf>,
    #[arg(long, env = "WERF_KUBE_CONTEXT")]
    kube_context: Option<String>,
    #[arg(long, env = "WERF_KUBE_CONFIG")]
    kube_config: Option<PathBuf>,
}

/// Where the server keeps locks and stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Backend {
    Local,
    Kubernetes,
}

/// Command line beats environment beats default. Asking for both backends
/// at the same level is an error.
fn select_backend(
    local: (bool, Option<ValueSource>),
    kubernetes: (bool, Option<ValueSource>),
) -> anyhow::Result<Backend> {
    fn rank(source: Option<ValueSource>) -> u8 {
        match source {
            Some(ValueSource::CommandLine) => 2,
            Some(ValueSource::EnvVariable) => 1,
            _ => 0,
        }
    }

    let (local, local_source) = local;
    let (kubernetes, kube_source) = kubernetes;
    if !kubernetes {
        return Ok(Backend::Local);
    }
    if !local {
        return Ok(Backend::Kubernetes);
    }
    match rank(kube_source).cmp(&rank(local_source)) {
        std::cmp::Ordering::Greater => Ok(Backend::Kubernetes),
        std::cmp::Ordering::Less => Ok(Backend::Local),
        std::cmp::Ordering::Equal => match kube_source {
            Some(ValueSource::EnvVariable) => {
                bail!("WERF_LOCAL cannot be used with WERF_KUBERNETES")
            }
            _ => bail!("--local cannot be used with --kubernetes"),
        },
    }
}

impl SynchronizationArgs {
    fn backend(&self, matches: &ArgMatches) -> anyhow::Result<Backend> {
        select_backend(
            (self.local, matches.value_source("local")),
            (self.kubernetes, matches.value_source("kubernetes")),
        )
    }

    fn factory(&self, backend: Backend, policy: RetryPolicy) -> Arc<dyn BackendFactory> {
        match backend {
            Backend::Kubernetes => {
                let client = KubeClient::new(KubeTarget {
                    context: self.kube_context.clone(),
                    kubeconfig: self.kube_config.clone(),
                });
                Arc::new(KubernetesBackendFactory::new(
                    Arc::new(client),
                    self.kubernetes_namespace_prefix.as_str(),
                    policy,
                ))
            }
            Backend::Local => Arc::new(LocalBackendFactory::new(
                self.local_lock_manager_base_dir.clone(),
                self.local_stages_storage_cache_base_dir.clone(),
                policy,
            )),
        }
    }
}

/// Run the synchronization server until SIGINT or SIGTERM.
///
/// `matches` are the subcommand's own, used to tell flags from environment.
pub async fn synchronization(
    args: SynchronizationArgs,
    matches: &ArgMatches,
) -> anyhow::Result<()> {
    let backend = args.backend(matches)?;
    let config = ServerConfig::parse(&args.host, &args.port, args.ttl.as_deref())?;
    tracing::debug!(
        ?backend,
        host = %args.host,
        port = %args.port,
        "starting synchronization server",
    );
    let factory = args.factory(backend, RetryPolicy::default());

    let mut server = SynchronizationServer::new(config, factory);
    let addr = server.start().await?;
    println!("Synchronization server listening on http://{addr}");

    shutdown_signal().await?;
    println!("Shutting down...");
    server.shutdown().await?;
    Ok(())
}

async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut terminate = signal(SignalKind::terminate())?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => result?,
            _ = terminate.recv() => {}
        }
    }
    #[cfg(not(unix))]
    tokio::signal::ctrl_c().await?;

    Ok(())
}

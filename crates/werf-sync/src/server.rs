//! HTTP front of the per-client lockers and stage caches.
//!
//! ```text
//! Stopped ── start() ──> Starting ── bound ──> Running
//!    ^                                            │
//!    └──────── drained ── ShuttingDown <── shutdown()
//! ```

use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use werf_core::ClientId;
use werf_core::duration::parse_positive_duration;
use werf_storage::{CacheError, LockError};

use crate::error::SyncError;
use crate::factory::{BackendFactory, ClientSession};
use crate::protocol::{
    self, AcquireRequest, AcquireResponse, Done, ErrorBody, ErrorKind, LookupResponse,
    NewClientIdResponse, ProjectRequest, PublishRequest, ReleaseRequest, RenewLeaseRequest,
    SignatureRequest, StagesResponse, StoreStagesRequest,
};
use crate::registry::ClientRegistry;

pub const DEFAULT_HOST: &str = "localhost";
pub const DEFAULT_PORT: u16 = 55581;
pub const DEFAULT_TTL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Stopped,
    Starting,
    Running,
    ShuttingDown,
}

impl fmt::Display for ServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::ShuttingDown => "shutting down",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Lease lifetime for acquire requests that do not name one
    pub default_ttl: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_owned(),
            port: DEFAULT_PORT,
            default_ttl: DEFAULT_TTL,
        }
    }
}

impl ServerConfig {
    /// Validate raw flag values.
    pub fn parse(host: &str, port: &str, ttl: Option<&str>) -> Result<Self, SyncError> {
        let host = host.trim();
        if host.is_empty() {
            return Err(SyncError::InvalidField {
                field: "host",
                reason: "must not be empty".to_owned(),
            });
        }
        let port = port.trim().parse::<u16>().map_err(|e| SyncError::InvalidField {
            field: "port",
            reason: format!("{port:?} is not a port number: {e}"),
        })?;
        let default_ttl = match ttl {
            Some(ttl) => parse_positive_duration("ttl", ttl)?,
            None => DEFAULT_TTL,
        };

        Ok(Self {
            host: host.to_owned(),
            port,
            default_ttl,
        })
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// A synchronization server with an explicit lifecycle.
pub struct SynchronizationServer {
    config: ServerConfig,
    registry: Arc<ClientRegistry>,
    state: Arc<Mutex<ServerState>>,
    running: Option<Running>,
}

struct Running {
    addr: SocketAddr,
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<std::io::Result<()>>,
}

impl fmt::Debug for SynchronizationServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SynchronizationServer")
            .field("config", &self.config)
            .field("state", &self.state())
            .field("local_addr", &self.local_addr())
            .finish_non_exhaustive()
    }
}

impl SynchronizationServer {
    pub fn new(config: ServerConfig, factory: Arc<dyn BackendFactory>) -> Self {
        Self {
            config,
            registry: Arc::new(ClientRegistry::new(factory)),
            state: Arc::new(Mutex::new(ServerState::Stopped)),
            running: None,
        }
    }

    pub fn state(&self) -> ServerState {
        *self.state.lock()
    }

    pub fn registry(&self) -> &Arc<ClientRegistry> {
        &self.registry
    }

    /// Address actually bound, once running.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running.as_ref().map(|running| running.addr)
    }

    fn transition(&self, from: ServerState, to: ServerState) -> Result<(), SyncError> {
        let mut state = self.state.lock();
        if *state != from {
            return Err(SyncError::State {
                state: *state,
                expected: from,
            });
        }
        tracing::debug!(from = %from, to = %to, "synchronization server state change");
        *state = to;
        Ok(())
    }

    /// Bind the socket and begin serving in the background.
    pub async fn start(&mut self) -> Result<SocketAddr, SyncError> {
        self.transition(ServerState::Stopped, ServerState::Starting)?;

        let bind_address = self.config.bind_address();
        let listener = match tokio::net::TcpListener::bind(&bind_address).await {
            Ok(listener) => listener,
            Err(e) => {
                *self.state.lock() = ServerState::Stopped;
                return Err(SyncError::Bind {
                    addr: bind_address,
                    source: e,
                });
            }
        };
        let addr = listener.local_addr().map_err(|e| {
            *self.state.lock() = ServerState::Stopped;
            SyncError::Bind {
                addr: bind_address.clone(),
                source: e,
            }
        })?;

        let app = router(Arc::clone(&self.registry), self.config.default_ttl);
        let (shutdown, signal) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    if signal.await.is_err() {
                        tracing::debug!("server handle dropped, shutting down");
                    }
                })
                .await
        });

        self.running = Some(Running {
            addr,
            shutdown,
            task,
        });
        self.transition(ServerState::Starting, ServerState::Running)?;
        tracing::info!(
            %addr,
            backend = self.registry.backend_name(),
            "synchronization server listening",
        );
        Ok(addr)
    }

    /// Stop accepting connections and wait for in-flight requests.
    pub async fn shutdown(&mut self) -> Result<(), SyncError> {
        self.transition(ServerState::Running, ServerState::ShuttingDown)?;
        let Some(running) = self.running.take() else {
            *self.state.lock() = ServerState::Stopped;
            return Ok(());
        };

        tracing::info!(addr = %running.addr, "draining synchronization server");
        if running.shutdown.send(()).is_err() {
            tracing::debug!("server task already finished");
        }
        let result = match running.task.await {
            Ok(result) => result,
            Err(e) => Err(std::io::Error::other(e)),
        };
        *self.state.lock() = ServerState::Stopped;

        result.map_err(|e| SyncError::Serve {
            addr: running.addr,
            source: e,
        })?;
        tracing::info!(addr = %running.addr, "synchronization server stopped");
        Ok(())
    }

    /// Serve until `signal` resolves, then shut down gracefully.
    pub async fn run_until<F>(mut self, signal: F) -> Result<(), SyncError>
    where
        F: Future<Output = ()>,
    {
        self.start().await?;
        signal.await;
        self.shutdown().await
    }
}

// ── Routing ──

#[derive(Clone)]
struct AppState {
    registry: Arc<ClientRegistry>,
    default_ttl: Duration,
}

impl AppState {
    fn session(&self, client_id: &str) -> Result<ClientSession, ApiError> {
        let client_id = ClientId::parse(client_id).map_err(|e| ApiError::bad_request(e.to_string()))?;
        Ok(self.registry.session(&client_id)?)
    }
}

/// The server's routes over `registry`.
pub fn router(registry: Arc<ClientRegistry>, default_ttl: Duration) -> Router {
    let client = |route: &str| format!("/{{client_id}}/{route}");

    Router::new()
        .route(protocol::HEALTH, get(health))
        .route(protocol::NEW_CLIENT_ID, post(new_client_id))
        .route(&client(protocol::LOCKER_ACQUIRE), post(acquire))
        .route(&client(protocol::LOCKER_RENEW_LEASE), post(renew_lease))
        .route(&client(protocol::LOCKER_RELEASE), post(release))
        .route(&client(protocol::CACHE_GET_ALL_STAGES), post(get_all_stages))
        .route(&client(protocol::CACHE_DELETE_ALL_STAGES), post(delete_all_stages))
        .route(
            &client(protocol::CACHE_GET_STAGES_BY_SIGNATURE),
            post(get_stages_by_signature),
        )
        .route(
            &client(protocol::CACHE_STORE_STAGES_BY_SIGNATURE),
            post(store_stages_by_signature),
        )
        .route(
            &client(protocol::CACHE_DELETE_STAGES_BY_SIGNATURE),
            post(delete_stages_by_signature),
        )
        .route(&client(protocol::CACHE_LOOKUP), post(lookup))
        .route(&client(protocol::CACHE_PUBLISH), post(publish))
        .layer(TraceLayer::new_for_http())
        .with_state(AppState {
            registry,
            default_ttl,
        })
}

type ApiResult<T> = Result<Json<T>, ApiError>;

async fn health() -> &'static str {
    "ok"
}

async fn new_client_id() -> Json<NewClientIdResponse> {
    let client_id = ClientId::generate();
    tracing::debug!(%client_id, "minted client id");
    Json(NewClientIdResponse { client_id })
}

// ── Locker handlers ──

async fn acquire(
    State(state): State<AppState>,
    Path(client_id): Path<String>,
    body: Result<Json<AcquireRequest>, JsonRejection>,
) -> ApiResult<AcquireResponse> {
    let session = state.session(&client_id)?;
    let Json(request) = body?;
    let options = request.options(state.default_ttl);
    let outcome = session.locker.acquire(&request.lock_name, &options).await?;
    Ok(Json(outcome.into()))
}

async fn renew_lease(
    State(state): State<AppState>,
    Path(client_id): Path<String>,
    body: Result<Json<RenewLeaseRequest>, JsonRejection>,
) -> ApiResult<Done> {
    let session = state.session(&client_id)?;
    let Json(request) = body?;
    session
        .locker
        .renew_lease(&request.handle, Duration::from_millis(request.ttl_ms))
        .await?;
    Ok(Json(Done::default()))
}

async fn release(
    State(state): State<AppState>,
    Path(client_id): Path<String>,
    body: Result<Json<ReleaseRequest>, JsonRejection>,
) -> ApiResult<Done> {
    let session = state.session(&client_id)?;
    let Json(request) = body?;
    session.locker.release(&request.handle).await?;
    Ok(Json(Done::default()))
}

// ── Stages storage cache handlers ──

async fn get_all_stages(
    State(state): State<AppState>,
    Path(client_id): Path<String>,
    body: Result<Json<ProjectRequest>, JsonRejection>,
) -> ApiResult<StagesResponse> {
    let session = state.session(&client_id)?;
    let Json(request) = body?;
    let stages = session.cache.get_all_stages(&request.project).await?;
    Ok(Json(StagesResponse { stages }))
}

async fn delete_all_stages(
    State(state): State<AppState>,
    Path(client_id): Path<String>,
    body: Result<Json<ProjectRequest>, JsonRejection>,
) -> ApiResult<Done> {
    let session = state.session(&client_id)?;
    let Json(request) = body?;
    session.cache.delete_all_stages(&request.project).await?;
    Ok(Json(Done::default()))
}

async fn get_stages_by_signature(
    State(state): State<AppState>,
    Path(client_id): Path<String>,
    body: Result<Json<SignatureRequest>, JsonRejection>,
) -> ApiResult<StagesResponse> {
    let session = state.session(&client_id)?;
    let Json(request) = body?;
    let stages = session
        .cache
        .get_stages_by_signature(&request.project, &request.signature)
        .await?;
    Ok(Json(StagesResponse { stages }))
}

async fn store_stages_by_signature(
    State(state): State<AppState>,
    Path(client_id): Path<String>,
    body: Result<Json<StoreStagesRequest>, JsonRejection>,
) -> ApiResult<Done> {
    let session = state.session(&client_id)?;
    let Json(request) = body?;
    session
        .cache
        .store_stages_by_signature(&request.project, &request.signature, &request.records)
        .await?;
    Ok(Json(Done::default()))
}

async fn delete_stages_by_signature(
    State(state): State<AppState>,
    Path(client_id): Path<String>,
    body: Result<Json<SignatureRequest>, JsonRejection>,
) -> ApiResult<Done> {
    let session = state.session(&client_id)?;
    let Json(request) = body?;
    session
        .cache
        .delete_stages_by_signature(&request.project, &request.signature)
        .await?;
    Ok(Json(Done::default()))
}

async fn lookup(
    State(state): State<AppState>,
    Path(client_id): Path<String>,
    body: Result<Json<SignatureRequest>, JsonRejection>,
) -> ApiResult<LookupResponse> {
    let session = state.session(&client_id)?;
    let Json(request) = body?;
    let record = session
        .cache
        .lookup(&request.project, &request.signature)
        .await?;
    Ok(Json(LookupResponse { record }))
}

async fn publish(
    State(state): State<AppState>,
    Path(client_id): Path<String>,
    body: Result<Json<PublishRequest>, JsonRejection>,
) -> ApiResult<werf_storage::PublishOutcome> {
    let session = state.session(&client_id)?;
    let Json(request) = body?;
    let outcome = session
        .cache
        .publish(&request.project, &request.signature, &request.record)
        .await?;
    Ok(Json(outcome))
}

// ── Errors ──

/// A failed call, answered as `{error, retryable, kind}`.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    body: ErrorBody,
}

impl ApiError {
    fn new(body: ErrorBody) -> Self {
        let status = if matches!(body.kind, ErrorKind::BadRequest | ErrorKind::SignatureMismatch) {
            StatusCode::BAD_REQUEST
        } else if body.retryable {
            StatusCode::SERVICE_UNAVAILABLE
        } else {
            StatusCode::INTERNAL_SERVER_ERROR
        };
        Self { status, body }
    }

    fn bad_request(error: impl Into<String>) -> Self {
        Self::new(ErrorBody::new(ErrorKind::BadRequest, error, false))
    }
}

impl From<LockError> for ApiError {
    fn from(e: LockError) -> Self {
        Self::new(ErrorBody::from(&e))
    }
}

impl From<CacheError> for ApiError {
    fn from(e: CacheError) -> Self {
        Self::new(ErrorBody::from(&e))
    }
}

impl From<SyncError> for ApiError {
    fn from(e: SyncError) -> Self {
        Self::new(ErrorBody::new(
            ErrorKind::Internal,
            protocol::error_chain(&e),
            false,
        ))
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::bad_request(rejection.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            tracing::warn!(
                status = self.status.as_u16(),
                error = %self.body.error,
                "synchronization request failed",
            );
        } else {
            tracing::debug!(
                status = self.status.as_u16(),
                error = %self.body.error,
                "rejected synchronization request",
            );
        }
        (self.status, Json(self.body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_validates_fields() {
        let config = ServerConfig::parse("0.0.0.0", "9000", Some("1m")).unwrap();
        assert_eq!(config.bind_address(), "0.0.0.0:9000");
        assert_eq!(config.default_ttl, Duration::from_secs(60));

        let err = ServerConfig::parse("", "9000", None).unwrap_err();
        assert!(err.to_string().contains("host"));

        let err = ServerConfig::parse("localhost", "http", None).unwrap_err();
        assert!(err.to_string().contains("port"));

        let err = ServerConfig::parse("localhost", "9000", Some("0s")).unwrap_err();
        assert!(err.to_string().contains("ttl"));
    }

    #[test]
    fn statuses_follow_error_class() {
        let busy_store = ApiError::from(LockError::CasConflict {
            lock_name: "l".to_owned(),
        });
        assert_eq!(busy_store.status, StatusCode::SERVICE_UNAVAILABLE);

        let invalid = ApiError::from(LockError::InvalidRequest("empty".to_owned()));
        assert_eq!(invalid.status, StatusCode::BAD_REQUEST);

        let mismatch = ApiError::from(CacheError::SignatureMismatch {
            expected: "a".to_owned(),
            actual: "b".to_owned(),
        });
        assert_eq!(mismatch.status, StatusCode::BAD_REQUEST);

        let corrupt = ApiError::from(LockError::Store(werf_storage::StoreError::Rejected {
            backend: "kubernetes",
            detail: "forbidden".to_owned(),
        }));
        assert_eq!(corrupt.status, StatusCode::INTERNAL_SERVER_ERROR);
    }
}

//! JSON bodies exchanged between the synchronization server and its clients.
//!
//! Every call is a `POST` with a JSON body; durations travel as milliseconds.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use werf_core::{ClientId, LockHandle, LockMode, StageRecord, StageSignature};
use werf_storage::{AcquireOptions, AcquireOutcome, CacheError, LockError};

// ── Routes ──

pub const HEALTH: &str = "/health";
pub const NEW_CLIENT_ID: &str = "/new-client-id";

pub const LOCKER_ACQUIRE: &str = "locker/acquire";
pub const LOCKER_RENEW_LEASE: &str = "locker/renew-lease";
pub const LOCKER_RELEASE: &str = "locker/release";

pub const CACHE_GET_ALL_STAGES: &str = "stages-storage-cache/get-all-stages";
pub const CACHE_DELETE_ALL_STAGES: &str = "stages-storage-cache/delete-all-stages";
pub const CACHE_GET_STAGES_BY_SIGNATURE: &str = "stages-storage-cache/get-stages-by-signature";
pub const CACHE_STORE_STAGES_BY_SIGNATURE: &str = "stages-storage-cache/store-stages-by-signature";
pub const CACHE_DELETE_STAGES_BY_SIGNATURE: &str =
    "stages-storage-cache/delete-stages-by-signature";
pub const CACHE_LOOKUP: &str = "stages-storage-cache/lookup";
pub const CACHE_PUBLISH: &str = "stages-storage-cache/publish";

// ── Locker ──

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewClientIdResponse {
    pub client_id: ClientId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcquireRequest {
    pub lock_name: String,
    pub holder_id: String,
    #[serde(default)]
    pub mode: LockMode,
    /// Lease lifetime; the server's default TTL applies when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_ms: Option<u64>,
}

impl AcquireRequest {
    pub fn new(lock_name: &str, options: &AcquireOptions) -> Self {
        Self {
            lock_name: lock_name.to_owned(),
            holder_id: options.holder_id.clone(),
            mode: options.mode,
            ttl_ms: Some(millis(options.ttl)),
        }
    }

    pub fn options(&self, default_ttl: Duration) -> AcquireOptions {
        AcquireOptions {
            holder_id: self.holder_id.clone(),
            ttl: self.ttl_ms.map(Duration::from_millis).unwrap_or(default_ttl),
            mode: self.mode,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AcquireResponse {
    Acquired { handle: LockHandle },
    Busy { holder: Option<String> },
}

impl From<AcquireOutcome> for AcquireResponse {
    fn from(outcome: AcquireOutcome) -> Self {
        match outcome {
            AcquireOutcome::Acquired(handle) => Self::Acquired { handle },
            AcquireOutcome::Busy { holder } => Self::Busy { holder },
        }
    }
}

impl From<AcquireResponse> for AcquireOutcome {
    fn from(response: AcquireResponse) -> Self {
        match response {
            AcquireResponse::Acquired { handle } => Self::Acquired(handle),
            AcquireResponse::Busy { holder } => Self::Busy { holder },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenewLeaseRequest {
    pub handle: LockHandle,
    pub ttl_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseRequest {
    pub handle: LockHandle,
}

// ── Stages storage cache ──

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectRequest {
    pub project: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureRequest {
    pub project: String,
    pub signature: StageSignature,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreStagesRequest {
    pub project: String,
    pub signature: StageSignature,
    pub records: Vec<StageRecord>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishRequest {
    pub project: String,
    pub signature: StageSignature,
    pub record: StageRecord,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StagesResponse {
    pub stages: Vec<StageRecord>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LookupResponse {
    pub record: Option<StageRecord>,
}

/// Empty success body.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Done {}

// ── Errors ──

/// Error classes the client maps back onto typed errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    BadRequest,
    LeaseLost,
    ConflictRetriesExhausted,
    SignatureMismatch,
    Unavailable,
    Internal,
}

/// Body of every non-2xx response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    pub retryable: bool,
    #[serde(default = "internal")]
    pub kind: ErrorKind,
}

fn internal() -> ErrorKind {
    ErrorKind::Internal
}

impl ErrorBody {
    pub fn new(kind: ErrorKind, error: impl Into<String>, retryable: bool) -> Self {
        Self {
            error: error.into(),
            retryable,
            kind,
        }
    }
}

impl From<&LockError> for ErrorBody {
    fn from(e: &LockError) -> Self {
        use werf_core::Retryable;

        let kind = match e {
            LockError::InvalidRequest(_) => ErrorKind::BadRequest,
            LockError::LeaseLost { .. } => ErrorKind::LeaseLost,
            LockError::ConflictRetriesExhausted { .. } => ErrorKind::ConflictRetriesExhausted,
            e if e.is_retryable() => ErrorKind::Unavailable,
            _ => ErrorKind::Internal,
        };
        Self::new(kind, error_chain(e), e.is_retryable())
    }
}

impl From<&CacheError> for ErrorBody {
    fn from(e: &CacheError) -> Self {
        use werf_core::Retryable;

        let kind = match e {
            CacheError::InvalidKey { .. } => ErrorKind::BadRequest,
            CacheError::SignatureMismatch { .. } => ErrorKind::SignatureMismatch,
            CacheError::ConflictRetriesExhausted { .. } => ErrorKind::ConflictRetriesExhausted,
            e if e.is_retryable() => ErrorKind::Unavailable,
            _ => ErrorKind::Internal,
        };
        Self::new(kind, error_chain(e), e.is_retryable())
    }
}

/// `error: cause: cause` on one line.
pub(crate) fn error_chain(e: &dyn std::error::Error) -> String {
    let mut out = e.to_string();
    let mut source = e.source();
    while let Some(cause) = source {
        out.push_str(": ");
        out.push_str(&cause.to_string());
        source = cause.source();
    }
    out
}

pub(crate) fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_response_is_tagged() {
        let busy = serde_json::to_value(AcquireResponse::Busy {
            holder: Some("ci-1".to_owned()),
        })
        .unwrap();
        assert_eq!(busy["status"], "busy");
        assert_eq!(busy["holder"], "ci-1");
    }

    #[test]
    fn missing_ttl_uses_server_default() {
        let request: AcquireRequest =
            serde_json::from_str(r#"{"lock_name":"demo/install","holder_id":"ci-1"}"#).unwrap();
        let options = request.options(Duration::from_secs(45));
        assert_eq!(options.ttl, Duration::from_secs(45));
        assert_eq!(options.mode, LockMode::Exclusive);
    }

    #[test]
    fn error_body_without_kind_is_internal() {
        let body: ErrorBody =
            serde_json::from_str(r#"{"error":"boom","retryable":false}"#).unwrap();
        assert_eq!(body.kind, ErrorKind::Internal);
    }

    #[test]
    fn lock_errors_classify() {
        let lost = ErrorBody::from(&LockError::LeaseLost {
            lock_name: "l".to_owned(),
            holder_id: "h".to_owned(),
        });
        assert_eq!(lost.kind, ErrorKind::LeaseLost);
        assert!(!lost.retryable);

        let conflict = ErrorBody::from(&LockError::CasConflict {
            lock_name: "l".to_owned(),
        });
        assert_eq!(conflict.kind, ErrorKind::Unavailable);
        assert!(conflict.retryable);
    }
}

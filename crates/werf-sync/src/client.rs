//! Remote [`LockBackend`] and [`StagesStorageCache`] served by a
//! synchronization server.

use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use sha2::{Digest, Sha256};
use werf_core::{ClientId, LockHandle, RetryError, RetryPolicy, StageRecord, StageSignature};
use werf_storage::{
    AcquireOptions, AcquireOutcome, CacheError, LockBackend, LockError, PublishOutcome,
    StagesStorageCache,
};

use crate::error::SyncError;
use crate::protocol::{
    self, AcquireRequest, AcquireResponse, Done, ErrorBody, ErrorKind, LookupResponse,
    NewClientIdResponse, ProjectRequest, PublishRequest, ReleaseRequest, RenewLeaseRequest,
    SignatureRequest, StagesResponse, StoreStagesRequest, millis,
};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Client of one synchronization server, acting as one client id.
#[derive(Debug, Clone)]
pub struct SyncClient {
    http: reqwest::Client,
    base_url: String,
    client_id: ClientId,
    policy: RetryPolicy,
}

impl SyncClient {
    /// `base_url` is the server root, e.g. `http://localhost:55581`.
    pub fn new(base_url: impl Into<String>, client_id: ClientId, policy: RetryPolicy) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_owned(),
            client_id,
            policy,
        }
    }

    pub fn client_id(&self) -> &ClientId {
        &self.client_id
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// `GET /health`, retried like every other call.
    pub async fn health(&self) -> Result<(), SyncError> {
        let url = format!("{}{}", self.base_url, protocol::HEALTH);
        with_retries(&self.policy, &url, || async {
            let response = self
                .http
                .get(&url)
                .timeout(REQUEST_TIMEOUT)
                .send()
                .await
                .map_err(|e| SyncError::Http {
                    url: url.clone(),
                    source: e,
                })?;
            check_status(&url, response).await.map(|_| ())
        })
        .await
    }

    async fn call<Req, Resp>(&self, route: &str, request: &Req) -> Result<Resp, SyncError>
    where
        Req: Serialize + Sync,
        Resp: DeserializeOwned,
    {
        let url = format!("{}/{}/{route}", self.base_url, self.client_id);
        with_retries(&self.policy, &url, || post_json(&self.http, &url, request)).await
    }
}

/// Ask the server at `base_url` for a fresh client id.
pub async fn new_client_id(base_url: &str, policy: &RetryPolicy) -> Result<ClientId, SyncError> {
    let http = reqwest::Client::new();
    let url = format!("{}{}", base_url.trim_end_matches('/'), protocol::NEW_CLIENT_ID);
    let request = Done::default();
    let response: NewClientIdResponse =
        with_retries(policy, &url, || post_json(&http, &url, &request)).await?;
    Ok(response.client_id)
}

/// Stable client id for `project`: the name itself when it is a valid id,
/// otherwise a sanitized form with a digest suffix.
pub fn client_id_for_project(project: &str) -> ClientId {
    if let Ok(id) = ClientId::parse(project) {
        return id;
    }

    let sanitized: String = project
        .to_ascii_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect();
    let digest = hex::encode(Sha256::digest(project.as_bytes()));
    let stem: String = sanitized.trim_matches('-').chars().take(40).collect();
    let candidate = format!("{}-{}", stem.trim_end_matches('-'), &digest[..12]);

    // Empty stems leave a leading '-' before the digest.
    ClientId::parse(candidate.trim_start_matches('-')).unwrap_or_else(|_| ClientId::generate())
}

async fn post_json<Req, Resp>(
    http: &reqwest::Client,
    url: &str,
    request: &Req,
) -> Result<Resp, SyncError>
where
    Req: Serialize + ?Sized,
    Resp: DeserializeOwned,
{
    let response = http
        .post(url)
        .json(request)
        .timeout(REQUEST_TIMEOUT)
        .send()
        .await
        .map_err(|e| SyncError::Http {
            url: url.to_owned(),
            source: e,
        })?;

    check_status(url, response)
        .await?
        .json()
        .await
        .map_err(|e| SyncError::Decode {
            url: url.to_owned(),
            source: e,
        })
}

async fn check_status(url: &str, response: reqwest::Response) -> Result<reqwest::Response, SyncError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let text = match response.text().await {
        Ok(text) => text,
        Err(e) => format!("unreadable body: {e}"),
    };
    let body = serde_json::from_str::<ErrorBody>(&text).unwrap_or_else(|_| {
        ErrorBody::new(
            ErrorKind::Internal,
            format!("status {status}: {text}"),
            status.is_server_error(),
        )
    });
    Err(SyncError::Server {
        url: url.to_owned(),
        status: status.as_u16(),
        body,
    })
}

async fn with_retries<T, F, Fut>(policy: &RetryPolicy, url: &str, op: F) -> Result<T, SyncError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, SyncError>>,
{
    policy
        .run(&format!("POST {url}"), op)
        .await
        .map_err(|e| match e {
            RetryError::Exhausted {
                attempts, source, ..
            } => {
                tracing::error!(
                    url,
                    attempts,
                    error = %protocol::error_chain(&source),
                    "synchronization server unreachable",
                );
                SyncError::RetriesExhausted {
                    url: url.to_owned(),
                    attempts,
                    source: Box::new(source),
                }
            }
            RetryError::Permanent(e) => e,
        })
}

// ── Error mapping ──

/// Server-side error body, when the failure came from the server.
fn server_body(e: &SyncError) -> Option<&ErrorBody> {
    match e {
        SyncError::Server { body, .. } => Some(body),
        _ => None,
    }
}

fn remote(e: &SyncError) -> (String, bool) {
    use werf_core::Retryable;

    let retryable = match e {
        SyncError::RetriesExhausted { .. } => true,
        e => e.is_retryable(),
    };
    (protocol::error_chain(e), retryable)
}

fn lock_error(e: SyncError, handle: Option<&LockHandle>) -> LockError {
    match (server_body(&e).map(|body| body.kind), handle) {
        (Some(ErrorKind::LeaseLost), Some(handle)) => LockError::LeaseLost {
            lock_name: handle.lock_name.clone(),
            holder_id: handle.holder_id.clone(),
        },
        (Some(ErrorKind::BadRequest), _) => {
            LockError::InvalidRequest(server_body(&e).map(|b| b.error.clone()).unwrap_or_default())
        }
        _ => {
            let (detail, retryable) = remote(&e);
            LockError::Remote { detail, retryable }
        }
    }
}

fn cache_error(e: SyncError, signature: Option<(&StageSignature, &StageRecord)>) -> CacheError {
    match (server_body(&e).map(|body| body.kind), signature) {
        (Some(ErrorKind::SignatureMismatch), Some((expected, record))) => {
            CacheError::SignatureMismatch {
                expected: expected.to_string(),
                actual: record.signature.to_string(),
            }
        }
        _ => {
            let (detail, retryable) = remote(&e);
            CacheError::Remote { detail, retryable }
        }
    }
}

#[async_trait::async_trait]
impl LockBackend for SyncClient {
    async fn acquire(
        &self,
        lock_name: &str,
        options: &AcquireOptions,
    ) -> Result<AcquireOutcome, LockError> {
        let response: AcquireResponse = self
            .call(protocol::LOCKER_ACQUIRE, &AcquireRequest::new(lock_name, options))
            .await
            .map_err(|e| lock_error(e, None))?;
        Ok(response.into())
    }

    async fn renew_lease(&self, handle: &LockHandle, ttl: Duration) -> Result<(), LockError> {
        let request = RenewLeaseRequest {
            handle: handle.clone(),
            ttl_ms: millis(ttl),
        };
        let _: Done = self
            .call(protocol::LOCKER_RENEW_LEASE, &request)
            .await
            .map_err(|e| lock_error(e, Some(handle)))?;
        Ok(())
    }

    async fn release(&self, handle: &LockHandle) -> Result<(), LockError> {
        let request = ReleaseRequest {
            handle: handle.clone(),
        };
        let _: Done = self
            .call(protocol::LOCKER_RELEASE, &request)
            .await
            .map_err(|e| lock_error(e, Some(handle)))?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl StagesStorageCache for SyncClient {
    async fn get_all_stages(&self, project: &str) -> Result<Vec<StageRecord>, CacheError> {
        let request = ProjectRequest {
            project: project.to_owned(),
        };
        let response: StagesResponse = self
            .call(protocol::CACHE_GET_ALL_STAGES, &request)
            .await
            .map_err(|e| cache_error(e, None))?;
        Ok(response.stages)
    }

    async fn delete_all_stages(&self, project: &str) -> Result<(), CacheError> {
        let request = ProjectRequest {
            project: project.to_owned(),
        };
        let _: Done = self
            .call(protocol::CACHE_DELETE_ALL_STAGES, &request)
            .await
            .map_err(|e| cache_error(e, None))?;
        Ok(())
    }

    async fn get_stages_by_signature(
        &self,
        project: &str,
        signature: &StageSignature,
    ) -> Result<Vec<StageRecord>, CacheError> {
        let request = SignatureRequest {
            project: project.to_owned(),
            signature: signature.clone(),
        };
        let response: StagesResponse = self
            .call(protocol::CACHE_GET_STAGES_BY_SIGNATURE, &request)
            .await
            .map_err(|e| cache_error(e, None))?;
        Ok(response.stages)
    }

    async fn store_stages_by_signature(
        &self,
        project: &str,
        signature: &StageSignature,
        records: &[StageRecord],
    ) -> Result<(), CacheError> {
        let request = StoreStagesRequest {
            project: project.to_owned(),
            signature: signature.clone(),
            records: records.to_vec(),
        };
        let mismatched = records.iter().find(|r| &r.signature != signature);
        let _: Done = self
            .call(protocol::CACHE_STORE_STAGES_BY_SIGNATURE, &request)
            .await
            .map_err(|e| cache_error(e, mismatched.map(|record| (signature, record))))?;
        Ok(())
    }

    async fn delete_stages_by_signature(
        &self,
        project: &str,
        signature: &StageSignature,
    ) -> Result<(), CacheError> {
        let request = SignatureRequest {
            project: project.to_owned(),
            signature: signature.clone(),
        };
        let _: Done = self
            .call(protocol::CACHE_DELETE_STAGES_BY_SIGNATURE, &request)
            .await
            .map_err(|e| cache_error(e, None))?;
        Ok(())
    }

    async fn lookup(
        &self,
        project: &str,
        signature: &StageSignature,
    ) -> Result<Option<StageRecord>, CacheError> {
        let request = SignatureRequest {
            project: project.to_owned(),
            signature: signature.clone(),
        };
        let response: LookupResponse = self
            .call(protocol::CACHE_LOOKUP, &request)
            .await
            .map_err(|e| cache_error(e, None))?;
        Ok(response.record)
    }

    async fn publish(
        &self,
        project: &str,
        signature: &StageSignature,
        candidate: &StageRecord,
    ) -> Result<PublishOutcome, CacheError> {
        let request = PublishRequest {
            project: project.to_owned(),
            signature: signature.clone(),
            record: candidate.clone(),
        };
        let outcome: PublishOutcome = self
            .call(protocol::CACHE_PUBLISH, &request)
            .await
            .map_err(|e| cache_error(e, Some((signature, candidate))))?;
        if !outcome.accepted {
            tracing::info!(
                project,
                signature = %signature,
                canonical = %outcome.canonical.image_id,
                "publish lost to an earlier build",
            );
        }
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_project_names_are_used_verbatim() {
        assert_eq!(client_id_for_project("demo").as_str(), "demo");
    }

    #[test]
    fn other_names_are_sanitized_deterministically() {
        let a = client_id_for_project("My Project/API");
        let b = client_id_for_project("My Project/API");
        assert_eq!(a, b);
        assert!(a.as_str().starts_with("my-project-api-"));

        // Different names that sanitize alike stay distinct.
        assert_ne!(client_id_for_project("My Project"), client_id_for_project("my_project"));

        let long = client_id_for_project(&"X".repeat(200));
        assert!(long.as_str().len() <= 58);
    }

    #[test]
    fn trailing_slash_is_trimmed() {
        let client = SyncClient::new(
            "http://localhost:55581/",
            ClientId::parse("demo").unwrap(),
            RetryPolicy::default(),
        );
        assert_eq!(client.base_url(), "http://localhost:55581");
    }
}

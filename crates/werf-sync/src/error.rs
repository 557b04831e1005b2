use std::net::SocketAddr;

use werf_core::Retryable;

use crate::protocol::ErrorBody;

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    // ── Configuration ──
    #[error("invalid synchronization address {address:?}: {reason}")]
    InvalidAddress { address: String, reason: String },

    #[error("invalid {field}: {reason}")]
    InvalidField { field: &'static str, reason: String },

    #[error(transparent)]
    Config(#[from] werf_core::Error),

    // ── Server lifecycle ──
    #[error("failed to bind synchronization server to {addr}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },

    #[error("synchronization server on {addr} failed")]
    Serve {
        addr: SocketAddr,
        source: std::io::Error,
    },

    #[error("synchronization server is {state}, expected {expected}")]
    State {
        state: crate::server::ServerState,
        expected: crate::server::ServerState,
    },

    // ── Client ──
    #[error("request to {url} failed")]
    Http { url: String, source: reqwest::Error },

    #[error("{url} answered {status}: {}", body.error)]
    Server {
        url: String,
        status: u16,
        body: ErrorBody,
    },

    #[error("unexpected response from {url}")]
    Decode { url: String, source: reqwest::Error },

    #[error("synchronization server at {url} unreachable after {attempts} attempts")]
    RetriesExhausted {
        url: String,
        attempts: u32,
        source: Box<SyncError>,
    },
}

impl Retryable for SyncError {
    fn is_retryable(&self) -> bool {
        match self {
            Self::Http { source, .. } => {
                source.is_connect() || source.is_timeout() || source.is_request()
            }
            Self::Server { body, .. } => body.retryable,
            _ => false,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum KubectlError {
    #[error("kubectl not found, install: https://kubernetes.io/docs/tasks/tools/")]
    NotFound { source: std::io::Error },

    #[error("kubectl command failed: {args:?}\n{stderr}")]
    CommandFailed { args: Vec<String>, stderr: String },

    #[error("kubectl output was not valid UTF-8")]
    InvalidUtf8 { source: std::string::FromUtf8Error },

    #[error("failed to write to kubectl stdin")]
    StdinWrite { source: std::io::Error },
}

impl KubectlError {
    fn stderr(&self) -> &str {
        match self {
            Self::CommandFailed { stderr, .. } => stderr,
            _ => "",
        }
    }

    /// The API server refused a write made against a stale resourceVersion.
    pub fn is_conflict(&self) -> bool {
        let stderr = self.stderr();
        stderr.contains("(Conflict)") || stderr.contains("the object has been modified")
    }

    pub fn is_not_found(&self) -> bool {
        self.stderr().contains("(NotFound)")
    }

    pub fn is_already_exists(&self) -> bool {
        self.stderr().contains("(AlreadyExists)")
    }

    /// Network or API server hiccup worth retrying.
    pub fn is_transient(&self) -> bool {
        const MARKERS: &[&str] = &[
            "Unable to connect to the server",
            "connection refused",
            "i/o timeout",
            "TLS handshake timeout",
            "(ServiceUnavailable)",
            "(InternalError)",
            "(Timeout)",
            "(TooManyRequests)",
            "etcdserver: request timed out",
        ];
        let stderr = self.stderr();
        MARKERS.iter().any(|marker| stderr.contains(marker))
    }
}

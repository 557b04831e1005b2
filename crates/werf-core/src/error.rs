use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to load config from {path}")]
    ConfigLoad {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config at {path}")]
    ConfigParse {
        path: PathBuf,
        source: toml::de::Error,
    },

    // ── Field validation ──
    #[error("invalid duration {value:?} for {field}: {reason}")]
    InvalidDuration {
        field: String,
        value: String,
        reason: &'static str,
    },

    #[error("invalid {field}: {reason}")]
    InvalidField { field: String, reason: String },

    #[error("invalid client id {value:?}: {reason}")]
    InvalidClientId { value: String, reason: &'static str },
}

impl Error {
    pub(crate) fn invalid_field(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidField {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

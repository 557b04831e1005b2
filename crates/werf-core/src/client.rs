use std::fmt;

use serde::{Deserialize, Serialize};

use crate::Error;

/// Kubernetes object names are limited to 63 characters and the backend
/// prefixes client ids with `werf-`.
const MAX_CLIENT_ID_LEN: usize = 58;

/// Identifies one synchronization client (typically one project in one CI
/// installation). The server scopes lock and cache namespaces by this id.
///
/// # Examples
///
/// ```
/// use werf_core::ClientId;
///
/// let id = ClientId::parse("demo-ci").unwrap();
/// assert_eq!(id.as_str(), "demo-ci");
/// assert!(ClientId::parse("Not Valid").is_err());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ClientId(String);

impl ClientId {
    /// Mint a fresh random client id.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Validate a client id supplied by a remote caller.
    ///
    /// Ids must be lowercase alphanumerics and hyphens, start and end with an
    /// alphanumeric, and fit into a Kubernetes object name.
    pub fn parse(value: &str) -> crate::Result<Self> {
        let invalid = |reason| Error::InvalidClientId {
            value: value.to_owned(),
            reason,
        };

        if value.is_empty() {
            return Err(invalid("must not be empty"));
        }
        if value.len() > MAX_CLIENT_ID_LEN {
            return Err(invalid("longer than 58 characters"));
        }
        if !value
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        {
            return Err(invalid(
                "only lowercase letters, digits, and '-' are allowed",
            ));
        }
        if value.starts_with('-') || value.ends_with('-') {
            return Err(invalid("must start and end with a letter or digit"));
        }

        Ok(Self(value.to_owned()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for ClientId {
    type Error = Error;

    fn try_from(value: String) -> crate::Result<Self> {
        Self::parse(&value)
    }
}

impl From<ClientId> for String {
    fn from(id: ClientId) -> Self {
        id.0
    }
}

use std::cmp::Ordering;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Deterministic content hash identifying a stage's build inputs.
///
/// Computed fresh on every build invocation; never mutated.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StageSignature(String);

impl StageSignature {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StageSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for StageSignature {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl From<String> for StageSignature {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// One physical build artifact produced for a [`StageSignature`].
///
/// Records are immutable once created. Several may exist for one signature
/// while concurrent builders race; the canonical one is the earliest by
/// [`StageRecord::canonical_cmp`].
///
/// # Examples
///
/// ```
/// use chrono::{Duration, TimeZone, Utc};
/// use werf_core::StageRecord;
///
/// let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
/// let a = StageRecord::at("img-A", "abc123", t0);
/// let b = StageRecord::at("img-B", "abc123", t0 + Duration::seconds(3));
/// assert!(a.is_earlier_than(&b));
/// assert_eq!(a.tag(), format!("abc123-{}", t0.timestamp_millis()));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageRecord {
    /// Opaque identifier assigned by the image backend
    pub image_id: String,
    pub signature: StageSignature,
    /// Millisecond timestamp minted at build completion; part of the storage tag
    pub unique_id: u64,
    pub created_at: DateTime<Utc>,
}

impl StageRecord {
    /// Record a freshly built artifact, stamped with the current time.
    pub fn new(image_id: impl Into<String>, signature: impl Into<StageSignature>) -> Self {
        Self::at(image_id, signature, Utc::now())
    }

    /// Record an artifact built at `created_at`. The unique id is the
    /// millisecond timestamp of `created_at`.
    pub fn at(
        image_id: impl Into<String>,
        signature: impl Into<StageSignature>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            image_id: image_id.into(),
            signature: signature.into(),
            unique_id: u64::try_from(created_at.timestamp_millis()).unwrap_or(0),
            created_at,
        }
    }

    /// Storage tag: `<signature>-<unique_id>`.
    pub fn tag(&self) -> String {
        format!("{}-{}", self.signature, self.unique_id)
    }

    /// Total order deciding which record is canonical.
    ///
    /// Earlier `created_at` wins, then the smaller `unique_id`, then the
    /// lexicographically smaller `image_id`.
    pub fn canonical_cmp(&self, other: &Self) -> Ordering {
        self.created_at
            .cmp(&other.created_at)
            .then_with(|| self.unique_id.cmp(&other.unique_id))
            .then_with(|| self.image_id.cmp(&other.image_id))
    }

    pub fn is_earlier_than(&self, other: &Self) -> bool {
        self.canonical_cmp(other) == Ordering::Less
    }
}

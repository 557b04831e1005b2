use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Access intent requested by a lock holder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockMode {
    /// Single holder, write access
    #[default]
    Exclusive,
    /// Any number of shared holders, read access
    Shared,
}

impl fmt::Display for LockMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exclusive => f.write_str("exclusive"),
            Self::Shared => f.write_str("shared"),
        }
    }
}

/// A time-limited claim on a lock by one holder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub holder_id: String,
    pub expires_at: DateTime<Utc>,
}

impl Lease {
    pub fn new(holder_id: impl Into<String>, ttl: Duration, now: DateTime<Utc>) -> Self {
        Self {
            holder_id: holder_id.into(),
            expires_at: expiry(now, ttl),
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Lease holder id for one acquisition by `owner`, as `<owner>/<uuid>`.
///
/// Tasks of one process share an owner but never a lease, so releasing one
/// acquisition cannot drop another.
pub fn acquisition_id(owner: &str) -> String {
    format!("{owner}/{}", uuid::Uuid::new_v4().simple())
}

/// Owner part of a holder id minted by [`acquisition_id`]. Other ids are
/// returned unchanged.
pub fn lease_owner(holder_id: &str) -> &str {
    match holder_id.rsplit_once('/') {
        Some((owner, lease)) if is_lease_suffix(lease) => owner,
        _ => holder_id,
    }
}

fn is_lease_suffix(s: &str) -> bool {
    s.len() == 32 && s.bytes().all(|b| b.is_ascii_hexdigit())
}

/// Stored state of one named lock.
///
/// Mutated only through compare-and-swap on the backing store; `generation`
/// is the store version the record was read at and is never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRecord {
    pub lock_name: String,
    pub mode: LockMode,
    pub holders: Vec<Lease>,
    #[serde(skip)]
    pub generation: u64,
}

impl LockRecord {
    pub fn new(lock_name: impl Into<String>, mode: LockMode, lease: Lease) -> Self {
        Self {
            lock_name: lock_name.into(),
            mode,
            holders: vec![lease],
            generation: 0,
        }
    }

    /// Drop every lease that has expired by `now`.
    pub fn prune_expired(&mut self, now: DateTime<Utc>) {
        self.holders.retain(|lease| !lease.is_expired(now));
    }

    /// A record with no live leases is free to be taken over.
    pub fn is_free(&self, now: DateTime<Utc>) -> bool {
        self.holders.iter().all(|lease| lease.is_expired(now))
    }

    pub fn lease_of(&self, holder_id: &str) -> Option<&Lease> {
        self.holders.iter().find(|lease| lease.holder_id == holder_id)
    }

    pub fn lease_of_mut(&mut self, holder_id: &str) -> Option<&mut Lease> {
        self.holders
            .iter_mut()
            .find(|lease| lease.holder_id == holder_id)
    }

    /// First live holder other than `holder_id`, for busy diagnostics.
    pub fn other_holder(&self, holder_id: &str, now: DateTime<Utc>) -> Option<&str> {
        self.holders
            .iter()
            .find(|lease| lease.holder_id != holder_id && !lease.is_expired(now))
            .map(|lease| lease.holder_id.as_str())
    }
}

/// Proof of a successful acquisition, needed to renew or release.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LockHandle {
    pub lock_name: String,
    pub holder_id: String,
    pub mode: LockMode,
}

impl fmt::Display for LockHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}, held by {})", self.lock_name, self.mode, self.holder_id)
    }
}

pub(crate) fn expiry(now: DateTime<Utc>, ttl: Duration) -> DateTime<Utc> {
    let ttl = chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::days(36_500));
    now.checked_add_signed(ttl).unwrap_or(DateTime::<Utc>::MAX_UTC)
}

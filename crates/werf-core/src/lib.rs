//! Core types and configuration for werf stage synchronization.
//!
//! This crate defines the `werf.toml` schema ([`WerfConfig`]), the records
//! shared by every backend ([`StageRecord`], [`LockRecord`]), the bounded
//! retry policy used around optimistic writes ([`RetryPolicy`]), and shared
//! error types.

pub mod client;
pub mod clock;
pub mod config;
pub mod duration;
pub mod error;
pub mod lock;
pub mod retry;
pub mod stage;

pub use client::ClientId;
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{
    ProjectConfig, RetryConfig, StageDefinition, SynchronizationConfig, WerfConfig,
    LOCAL_SYNCHRONIZATION,
};
pub use error::{Error, Result};
pub use lock::{Lease, LockHandle, LockMode, LockRecord, acquisition_id, lease_owner};
pub use retry::{RetryError, RetryPolicy, Retryable};
pub use stage::{StageRecord, StageSignature};

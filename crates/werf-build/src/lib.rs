//! Stage signatures and the cache-aware stage conveyor for werf.
//!
//! # Build pipeline
//!
//! ```text
//! werf.toml [[stage]]
//!   1. Plan       ── config fields + git tree digest + reset marker
//!   2. Signature  ── sha256 chained over the previous stage's signature
//!   3. Lookup     ── StagesStorageCache::lookup (no lock)
//!   4. Build      ── StageBuilder::build on cache miss
//!   5. Publish    ── StagesStorageCache::publish under the signature lock
//!   6. Reconcile  ── a rejected build is discarded and the canonical record adopted
//! ```
//!
//! The whole run holds the project's stages-and-images lock in shared mode,
//! which only cleanup takes exclusively.

pub mod conveyor;
pub mod coordinator;
pub mod git;
pub mod plan;
pub mod signature;

pub use conveyor::{
    BuilderError, Conveyor, ConveyorError, ConveyorOptions, StageBuilder, StageOutcome,
    StageSource,
};
pub use coordinator::StageCoordinator;
pub use git::GitError;
pub use plan::plan_stages;
pub use signature::{
    ConfigValue, SignatureError, StageConfig, StageInputs, compute_chain, compute_signature,
};

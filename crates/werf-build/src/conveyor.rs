//! Walks a project's stages in order, reusing cached ones and publishing
//! fresh builds.
//!
//! ```text
//! for each stage:
//!   signature ── chained to the previous stage (base image digest first)
//!   lookup    ── hit: reuse, no lock taken
//!   build     ── StageBuilder::build on top of the previous stage
//!   publish   ── under <project>/stage/<signature>
//!   rejected? ── StageBuilder::discard own image, adopt the canonical one
//! ```
//!
//! Concurrent builders may build the same stage twice; only the cache write
//! is serialized. With `serialize_builds` the per-stage lock is held around
//! lookup, build, and publish instead.

use std::error::Error as StdError;
use std::sync::Arc;

use werf_core::{Clock, StageRecord, StageSignature, SystemClock};
use werf_storage::{CacheError, LockError, names};

use crate::coordinator::StageCoordinator;
use crate::git::GitError;
use crate::signature::{SignatureError, StageInputs, compute_chain};

pub type BuilderError = Box<dyn StdError + Send + Sync>;

/// Produces and disposes of stage images.
#[async_trait::async_trait]
pub trait StageBuilder: Send + Sync {
    /// Build `stage` on top of `parent` (the base image for the first stage)
    /// and return the new image id.
    async fn build(
        &self,
        stage: &str,
        signature: &StageSignature,
        parent: Option<&StageRecord>,
    ) -> Result<String, BuilderError>;

    /// Remove an image that lost the publish race.
    async fn discard(&self, image_id: &str) -> Result<(), BuilderError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageSource {
    /// Found in the cache before building
    Cached,
    /// Built here and accepted as canonical
    Built,
    /// Built here, but an earlier build won; its record was adopted
    Adopted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageOutcome {
    pub name: String,
    pub signature: StageSignature,
    pub record: StageRecord,
    pub source: StageSource,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConveyorOptions {
    /// Hold the per-stage lock around lookup, build, and publish
    pub serialize_builds: bool,
}

pub struct Conveyor<B: StageBuilder> {
    coordinator: StageCoordinator,
    builder: B,
    project: String,
    options: ConveyorOptions,
    clock: Arc<dyn Clock>,
}

impl<B: StageBuilder> Conveyor<B> {
    pub fn new(
        coordinator: StageCoordinator,
        builder: B,
        project: impl Into<String>,
        options: ConveyorOptions,
    ) -> Self {
        Self {
            coordinator,
            builder,
            project: project.into(),
            options,
            clock: Arc::new(SystemClock),
        }
    }

    /// Stamp built records with `clock` instead of the system time.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn builder(&self) -> &B {
        &self.builder
    }

    /// Bring every stage up to date, returning the record used for each.
    ///
    /// Holds the project's stages-and-images lock shared for the whole run so
    /// cleanup cannot remove stages mid-build.
    pub async fn run(
        &self,
        base_image_digest: &str,
        stages: &[StageInputs],
    ) -> Result<Vec<StageOutcome>, ConveyorError> {
        let locks = self.coordinator.locks();
        let lock_name = names::stages_and_images_lock_name(&self.project);

        locks
            .with_lock(&lock_name, &locks.defaults().shared(), || async {
                let mut outcomes: Vec<StageOutcome> = Vec::with_capacity(stages.len());
                for (name, signature) in compute_chain(base_image_digest, stages) {
                    let parent = outcomes.last().map(|outcome| &outcome.record);
                    let outcome = self.stage(&name, &signature, parent).await?;
                    tracing::info!(
                        project = %self.project,
                        stage = %name,
                        signature = %signature,
                        image_id = %outcome.record.image_id,
                        source = ?outcome.source,
                        "stage ready",
                    );
                    outcomes.push(outcome);
                }
                Ok(outcomes)
            })
            .await
    }

    async fn stage(
        &self,
        name: &str,
        signature: &StageSignature,
        parent: Option<&StageRecord>,
    ) -> Result<StageOutcome, ConveyorError> {
        if !self.options.serialize_builds {
            return self.lookup_or_build(name, signature, parent).await;
        }

        let locks = self.coordinator.locks();
        locks
            .with_lock(
                &names::stage_lock_name(&self.project, name),
                locks.defaults(),
                || self.lookup_or_build(name, signature, parent),
            )
            .await
    }

    async fn lookup_or_build(
        &self,
        name: &str,
        signature: &StageSignature,
        parent: Option<&StageRecord>,
    ) -> Result<StageOutcome, ConveyorError> {
        let project = self.project.as_str();
        let outcome = |record, source| StageOutcome {
            name: name.to_owned(),
            signature: signature.clone(),
            record,
            source,
        };

        if let Some(record) = self
            .coordinator
            .lookup_cached_stage(project, signature)
            .await?
        {
            return Ok(outcome(record, StageSource::Cached));
        }

        let image_id = self
            .builder
            .build(name, signature, parent)
            .await
            .map_err(|source| ConveyorError::Build {
                stage: name.to_owned(),
                source,
            })?;
        let record = StageRecord::at(image_id, signature.clone(), self.clock.now());

        let published = self
            .coordinator
            .publish_stage(project, signature, &record)
            .await?;
        if published.accepted {
            return Ok(outcome(published.canonical, StageSource::Built));
        }

        tracing::info!(
            project,
            stage = name,
            discarded = %record.image_id,
            adopted = %published.canonical.image_id,
            "another build of this stage finished first, adopting it",
        );
        if let Err(e) = self.builder.discard(&record.image_id).await {
            tracing::warn!(
                image_id = %record.image_id,
                error = %e,
                "failed to discard superseded image, cleanup will remove it",
            );
        }
        Ok(outcome(published.canonical, StageSource::Adopted))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConveyorError {
    #[error(transparent)]
    Lock(#[from] LockError),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Signature(#[from] SignatureError),

    #[error(transparent)]
    Git(#[from] GitError),

    #[error("building stage {stage} failed")]
    Build { stage: String, source: BuilderError },
}

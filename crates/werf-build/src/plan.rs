use std::path::Path;

use werf_core::WerfConfig;

use crate::conveyor::ConveyorError;
use crate::git;
use crate::signature::{StageConfig, StageInputs};

/// Signature inputs of every `[[stage]]` in `config`, in declaration order.
///
/// Git digests are taken from the repository at `repo_dir`. A reset marker on
/// HEAD becomes the force-distinct input of every stage.
pub fn plan_stages(config: &WerfConfig, repo_dir: &Path) -> Result<Vec<StageInputs>, ConveyorError> {
    let uses_git = config.stages.iter().any(|stage| !stage.git_paths.is_empty());
    let force_distinct = if uses_git || repo_dir.join(".git").exists() {
        git::reset_commit(repo_dir)?
    } else {
        None
    };

    config
        .stages
        .iter()
        .map(|definition| {
            let git_digest = if definition.git_paths.is_empty() {
                None
            } else {
                Some(git::tree_digest(repo_dir, &definition.git_paths)?)
            };
            Ok(StageInputs {
                name: definition.name.clone(),
                config: StageConfig::from_definition(definition)?,
                git_digest,
                force_distinct: force_distinct.clone(),
            })
        })
        .collect()
}

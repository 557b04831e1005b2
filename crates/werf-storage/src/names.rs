//! Well-known lock names shared by every werf process working on a project.

use werf_core::StageSignature;

/// Serializes work on one stage of a project: `<project>/<stage>`.
pub fn stage_lock_name(project: &str, stage: &str) -> String {
    format!("{project}/{stage}")
}

/// Guards publishing of one stage signature: `<project>/stage/<signature>`.
pub fn stage_signature_lock_name(project: &str, signature: &StageSignature) -> String {
    format!("{project}/stage/{signature}")
}

/// Taken shared by builders and exclusive by cleanup.
pub fn stages_and_images_lock_name(project: &str) -> String {
    format!("{project}/stages-and-images")
}

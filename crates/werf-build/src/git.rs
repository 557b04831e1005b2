//! Git inputs of stage signatures.

use std::path::Path;
use std::process::Command;

use sha2::{Digest, Sha256};

/// Commit message markers that force every stage to rebuild.
pub const RESET_MARKERS: &[&str] = &["[werf reset]", "[reset werf]"];

/// Digest of the HEAD tree entries under `paths`.
///
/// Built from `git ls-tree -r HEAD -- <paths>`, so it changes exactly when a
/// blob under one of the paths changes, is added, or is removed.
pub fn tree_digest(repo_dir: &Path, paths: &[String]) -> Result<String, GitError> {
    let mut args = vec!["ls-tree", "-r", "HEAD", "--"];
    args.extend(paths.iter().map(String::as_str));
    let listing = git(repo_dir, &args)?;

    Ok(hex::encode(Sha256::digest(listing.as_bytes())))
}

pub fn head_commit(repo_dir: &Path) -> Result<String, GitError> {
    Ok(git(repo_dir, &["rev-parse", "HEAD"])?.trim().to_owned())
}

pub fn has_reset_marker(message: &str) -> bool {
    RESET_MARKERS.iter().any(|marker| message.contains(marker))
}

/// HEAD's hash if its message carries a reset marker.
pub fn reset_commit(repo_dir: &Path) -> Result<Option<String>, GitError> {
    let message = git(repo_dir, &["log", "-1", "--format=%B"])?;
    if !has_reset_marker(&message) {
        return Ok(None);
    }
    let commit = head_commit(repo_dir)?;
    tracing::info!(%commit, "reset marker found, forcing new stage signatures");
    Ok(Some(commit))
}

fn git(repo_dir: &Path, args: &[&str]) -> Result<String, GitError> {
    let output = Command::new("git")
        .args(args)
        .current_dir(repo_dir)
        .output()
        .map_err(|e| GitError::GitCommand {
            detail: format!("failed to execute git {}", args.first().unwrap_or(&"")),
            source: e,
        })?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(GitError::GitFailed {
            detail: format!(
                "git {} exited with {}: {}",
                args.join(" "),
                output.status,
                stderr.trim()
            ),
        });
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

#[derive(Debug, thiserror::Error)]
pub enum GitError {
    #[error("git command failed: {detail}")]
    GitCommand {
        detail: String,
        source: std::io::Error,
    },
    #[error("git failed: {detail}")]
    GitFailed { detail: String },
}

//! Working-copy lifecycle.
//!
//! A stage that touches a repository gets a `Workspace`: either a
//! persistent checkout under `<root>/<repo>/<branch>` that survives across
//! runs (amortizing clone cost while an issue cycles through stages), or a
//! scratch directory that disappears when the workspace is dropped.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tempfile::TempDir;

use crate::config::WorkspaceConfig;
use crate::gitops::RevisionControl;

/// A checked-out working copy. Dropping an ephemeral workspace removes its
/// directory; persistent workspaces outlive the value.
pub struct Workspace {
    path: PathBuf,
    scratch: Option<TempDir>,
}

impl Workspace {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_persistent(&self) -> bool {
        self.scratch.is_none()
    }
}

pub struct WorkspaceManager {
    root: Option<PathBuf>,
    terminal_states: Vec<String>,
}

impl WorkspaceManager {
    pub fn new(cfg: &WorkspaceConfig) -> Self {
        Self {
            root: cfg.root.clone(),
            terminal_states: cfg.terminal_states.clone(),
        }
    }

    /// The persistent workspace directory for a repo+branch, or `None` when
    /// no workspace root is configured.
    pub fn persistent_path(&self, repo: &str, branch: &str) -> Option<PathBuf> {
        self.root.as_ref().map(|root| root.join(repo).join(branch))
    }

    /// Prepare a working copy for `target_branch` of `repo`.
    ///
    /// Persistent: reuse the existing checkout (fetch, hard-reset, clean) or
    /// clone `base_branch` into place on first use. Ephemeral: clone
    /// `base_branch` into a scratch directory.
    pub async fn acquire(
        &self,
        git: &dyn RevisionControl,
        repo: &str,
        base_branch: &str,
        target_branch: &str,
        identifier: &str,
    ) -> Result<Workspace> {
        if let Some(path) = self.persistent_path(repo, target_branch) {
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .context("creating workspace parent directory")?;
            }

            if path.join(".git").is_dir() {
                eprintln!(
                    "[workspace] reusing persistent workspace {} for {}",
                    path.display(),
                    identifier
                );
                git.fetch(&path).await.context("fetching in workspace")?;
                git.reset_to_remote(&path, target_branch)
                    .await
                    .context("resetting workspace")?;
            } else {
                git.clone_repo(repo, base_branch, &path)
                    .await
                    .context("cloning into workspace")?;
            }
            return Ok(Workspace {
                path,
                scratch: None,
            });
        }

        let scratch = tempfile::Builder::new()
            .prefix(&format!("aiflow-{}-", identifier))
            .tempdir()
            .context("creating scratch directory")?;
        git.clone_repo(repo, base_branch, scratch.path())
            .await
            .context("cloning repository")?;
        Ok(Workspace {
            path: scratch.path().to_path_buf(),
            scratch: Some(scratch),
        })
    }

    /// Whether `state` ends an issue's pipeline life.
    pub fn is_terminal(&self, state: &str) -> bool {
        self.terminal_states
            .iter()
            .any(|s| s.eq_ignore_ascii_case(state))
    }

    /// Remove the persistent workspace for `repo`+`branch` when the issue
    /// just transitioned into a terminal state.
    pub async fn cleanup_if_terminal(&self, next_state: &str, repo: &str, branch: &str) {
        if !self.is_terminal(next_state) {
            return;
        }
        let Some(path) = self.persistent_path(repo, branch) else {
            return;
        };
        if path.exists() {
            eprintln!(
                "[workspace] removing workspace {} (issue reached {})",
                path.display(),
                next_state
            );
            if let Err(e) = tokio::fs::remove_dir_all(&path).await {
                eprintln!(
                    "[workspace] failed to remove workspace {}: {}",
                    path.display(),
                    e
                );
            }
        }
    }
}

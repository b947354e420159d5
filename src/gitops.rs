//! Revision-control operations via the `git` and `gh` CLIs.
//!
//! The daemon never links a git library; every operation shells out, which
//! keeps authentication (ssh keys, gh auth) in the operator's hands. The
//! `RevisionControl` trait is the seam the stage executors are written
//! against, so tests substitute a scripted double.

use std::path::Path;
use std::sync::LazyLock;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use regex::Regex;
use tokio::process::Command;

/// Network-heavy operations (clone, push) get their own fixed deadline,
/// independent of any stage timeout.
const NETWORK_TIMEOUT: Duration = Duration::from_secs(120);

/// Branch-name length cap.
const MAX_BRANCH_LEN: usize = 60;

/// Operations the stage executors need from the hosting side.
#[async_trait]
pub trait RevisionControl: Send + Sync {
    /// Shallow-clone `repo` at `branch` into `dir` and configure the commit
    /// identity in the clone.
    async fn clone_repo(&self, repo: &str, branch: &str, dir: &Path) -> Result<()>;
    /// Fetch all refs from origin, unshallowing first if needed.
    async fn fetch(&self, dir: &Path) -> Result<()>;
    /// Check out `branch` and hard-reset it to its remote counterpart, then
    /// remove untracked files.
    async fn reset_to_remote(&self, dir: &Path, branch: &str) -> Result<()>;
    /// Create and check out a new local branch.
    async fn create_branch(&self, dir: &Path, name: &str) -> Result<()>;
    /// Fetch a remote branch and check it out locally, whether or not a
    /// local branch of that name already exists.
    async fn fetch_and_checkout(&self, dir: &Path, branch: &str) -> Result<()>;
    async fn branch_exists_on_remote(&self, dir: &Path, branch: &str) -> Result<bool>;
    /// Whether the working tree has uncommitted changes.
    async fn has_changes(&self, dir: &Path) -> Result<bool>;
    /// Stage everything and commit.
    async fn commit_all(&self, dir: &Path, message: &str) -> Result<()>;
    /// Push `branch` to origin with upstream tracking.
    async fn push(&self, dir: &Path, branch: &str) -> Result<()>;
    /// Open a pull request and return its URL.
    async fn create_pr(
        &self,
        dir: &Path,
        title: &str,
        body: &str,
        base: &str,
        head: &str,
    ) -> Result<String>;
    /// Post a comment on an existing pull request.
    async fn comment_on_pr(&self, dir: &Path, pr_url: &str, body: &str) -> Result<()>;
    /// Remove a scratch directory. Best effort.
    fn cleanup(&self, dir: &Path);
}

/// CLI-backed implementation.
pub struct GitCli {
    pub author_name: String,
    pub author_email: String,
}

impl GitCli {
    /// Create a `GitCli` after verifying that both `git` and `gh` are on
    /// PATH. Returns an error naming whichever tools are missing.
    pub fn new() -> Result<Self> {
        let missing: Vec<&str> = ["git", "gh"]
            .into_iter()
            .filter(|tool| !tool_on_path(tool))
            .collect();
        if !missing.is_empty() {
            bail!("required tools not found in PATH: {}", missing.join(", "));
        }
        Ok(Self {
            author_name: "aiflow".to_string(),
            author_email: "aiflow@noreply".to_string(),
        })
    }

    async fn git(&self, dir: &Path, args: &[&str]) -> Result<String> {
        let output = Command::new("git")
            .arg("-C")
            .arg(dir)
            .args(args)
            .output()
            .await
            .with_context(|| format!("running git {}", args.join(" ")))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let stdout = String::from_utf8_lossy(&output.stdout);
            let detail = if stderr.trim().is_empty() {
                stdout.trim().to_string()
            } else {
                stderr.trim().to_string()
            };
            bail!("git {}: {}", args.first().unwrap_or(&""), detail);
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn configure_identity(&self, dir: &Path) -> Result<()> {
        self.git(dir, &["config", "user.name", &self.author_name])
            .await?;
        self.git(dir, &["config", "user.email", &self.author_email])
            .await?;
        Ok(())
    }
}

#[async_trait]
impl RevisionControl for GitCli {
    async fn clone_repo(&self, repo: &str, branch: &str, dir: &Path) -> Result<()> {
        let url = format!("git@github.com:{}.git", repo);
        let clone = async {
            let output = Command::new("git")
                .args(["clone", "--depth", "1", "--branch", branch, &url])
                .arg(dir)
                .output()
                .await
                .context("running git clone")?;
            if !output.status.success() {
                let stderr = String::from_utf8_lossy(&output.stderr);
                bail!("git clone: {}", stderr.trim());
            }
            Ok(())
        };
        tokio::time::timeout(NETWORK_TIMEOUT, clone)
            .await
            .map_err(|_| anyhow::anyhow!("git clone of {} timed out", repo))??;

        // Without a local identity, unattended commits fail in fresh clones.
        self.configure_identity(dir).await
    }

    async fn fetch(&self, dir: &Path) -> Result<()> {
        let args: &[&str] = if dir.join(".git").join("shallow").exists() {
            &["fetch", "--unshallow", "origin"]
        } else {
            &["fetch", "origin"]
        };
        self.git(dir, args).await?;
        Ok(())
    }

    async fn reset_to_remote(&self, dir: &Path, branch: &str) -> Result<()> {
        self.git(dir, &["checkout", branch]).await?;

        let remote_ref = format!("origin/{}", branch);
        if let Err(reset_err) = self.git(dir, &["reset", "--hard", &remote_ref]).await {
            // A branch that was never pushed has no remote counterpart; the
            // local checkout is then already the best available state.
            if self
                .git(dir, &["rev-parse", "--verify", &remote_ref])
                .await
                .is_ok()
            {
                return Err(reset_err);
            }
        }

        self.git(dir, &["clean", "-fd"]).await?;
        Ok(())
    }

    async fn create_branch(&self, dir: &Path, name: &str) -> Result<()> {
        self.git(dir, &["checkout", "-b", name]).await?;
        Ok(())
    }

    async fn fetch_and_checkout(&self, dir: &Path, branch: &str) -> Result<()> {
        // Explicit refspec so the origin/<branch> tracking ref is updated
        // even in shallow single-branch clones.
        let refspec = format!("refs/heads/{0}:refs/remotes/origin/{0}", branch);
        self.git(dir, &["fetch", "origin", &refspec]).await?;

        let remote_ref = format!("origin/{}", branch);
        if self
            .git(dir, &["checkout", "-b", branch, &remote_ref])
            .await
            .is_err()
        {
            // Local branch already exists: check it out and match the remote.
            self.git(dir, &["checkout", branch]).await?;
            self.git(dir, &["reset", "--hard", &remote_ref]).await?;
        }
        Ok(())
    }

    async fn branch_exists_on_remote(&self, dir: &Path, branch: &str) -> Result<bool> {
        let out = self
            .git(dir, &["ls-remote", "--heads", "origin", branch])
            .await?;
        Ok(!out.trim().is_empty())
    }

    async fn has_changes(&self, dir: &Path) -> Result<bool> {
        let out = self.git(dir, &["status", "--porcelain"]).await?;
        Ok(!out.trim().is_empty())
    }

    async fn commit_all(&self, dir: &Path, message: &str) -> Result<()> {
        self.git(dir, &["add", "-A"]).await?;
        self.git(dir, &["commit", "-m", message]).await?;
        Ok(())
    }

    async fn push(&self, dir: &Path, branch: &str) -> Result<()> {
        tokio::time::timeout(NETWORK_TIMEOUT, self.git(dir, &["push", "-u", "origin", branch]))
            .await
            .map_err(|_| anyhow::anyhow!("git push of {} timed out", branch))??;
        Ok(())
    }

    async fn create_pr(
        &self,
        dir: &Path,
        title: &str,
        body: &str,
        base: &str,
        head: &str,
    ) -> Result<String> {
        let output = Command::new("gh")
            .args([
                "pr", "create", "--title", title, "--body", body, "--base", base, "--head", head,
            ])
            .current_dir(dir)
            .output()
            .await
            .context("running gh pr create")?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!("gh pr create: {}", stderr.trim());
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    async fn comment_on_pr(&self, dir: &Path, pr_url: &str, body: &str) -> Result<()> {
        let output = Command::new("gh")
            .args(["pr", "comment", pr_url, "--body", body])
            .current_dir(dir)
            .output()
            .await
            .context("running gh pr comment")?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!("gh pr comment: {}", stderr.trim());
        }
        Ok(())
    }

    fn cleanup(&self, dir: &Path) {
        let _ = std::fs::remove_dir_all(dir);
    }
}

fn tool_on_path(name: &str) -> bool {
    let Some(path) = std::env::var_os("PATH") else {
        return false;
    };
    std::env::split_paths(&path).any(|dir| dir.join(name).is_file())
}

static NON_ALPHANUMERIC: LazyLock<Regex> =
    LazyLock::new(|| Regex::new("[^a-z0-9]+").expect("static pattern"));

/// Derive a git-safe branch name from an issue identifier and title.
///
/// `"ENG-123"` + `"Fix auth bug"` → `"eng-123-fix-auth-bug"`. Lowercase,
/// non-alphanumeric runs collapsed to `-`, trimmed, capped at 60 chars.
/// Idempotent: sanitizing a sanitized name is a no-op.
pub fn sanitize_branch_name(identifier: &str, title: &str) -> String {
    let raw = format!("{}-{}", identifier, title).to_lowercase();
    let mut name = NON_ALPHANUMERIC
        .replace_all(&raw, "-")
        .trim_matches('-')
        .to_string();
    if name.len() > MAX_BRANCH_LEN {
        // Output of the regex pass is pure ASCII, so byte slicing is safe.
        name.truncate(MAX_BRANCH_LEN);
        name = name.trim_end_matches('-').to_string();
    }
    name
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_basic() {
        assert_eq!(
            sanitize_branch_name("ENG-123", "Fix auth bug"),
            "eng-123-fix-auth-bug"
        );
    }

    #[test]
    fn test_sanitize_collapses_symbol_runs() {
        assert_eq!(
            sanitize_branch_name("ENG-7", "add login!! (OAuth2 / SSO)"),
            "eng-7-add-login-oauth2-sso"
        );
    }

    #[test]
    fn test_sanitize_trims_leading_and_trailing_dashes() {
        assert_eq!(sanitize_branch_name("-ENG-1-", "--weird--"), "eng-1-weird");
    }

    #[test]
    fn test_sanitize_caps_length_and_retrims() {
        let long_title = "a".repeat(50) + " b";
        let name = sanitize_branch_name("ENG-1234", &long_title);
        assert!(name.len() <= 60);
        assert!(!name.ends_with('-'));
    }

    #[test]
    fn test_sanitize_is_idempotent() {
        let cases = [
            ("ENG-7", "add login"),
            ("ENG-1", "Ünïcode títle with café"),
            ("X", &"y".repeat(200)),
        ];
        for (identifier, title) in cases {
            let once = sanitize_branch_name(identifier, title);
            let twice = sanitize_branch_name(&once, "");
            // Re-sanitizing appends "-", which trims back off.
            assert_eq!(once, twice);
        }
    }

    #[test]
    fn test_sanitize_output_shape() {
        let shape = Regex::new("^[a-z0-9]([a-z0-9-]*[a-z0-9])?$").unwrap();
        for (identifier, title) in [
            ("ENG-7", "add login"),
            ("OPS-99", "###"),
            ("A", "B"),
            ("ENG-1", "emoji 🎉 title"),
        ] {
            let name = sanitize_branch_name(identifier, title);
            assert!(
                shape.is_match(&name),
                "{:?} does not match shape",
                name
            );
            assert!(name.len() <= 60);
        }
    }

    #[test]
    fn test_sanitize_all_symbols_collapses_to_empty() {
        assert_eq!(sanitize_branch_name("!!!", "???"), "");
    }

    #[test]
    fn test_tool_on_path_finds_sh() {
        assert!(tool_on_path("sh"));
        assert!(!tool_on_path("definitely-not-a-real-binary-1234"));
    }

    #[tokio::test]
    async fn test_git_cli_against_real_repository() {
        // Exercises the porcelain wrappers against an actual repo. Skipped
        // when git is unavailable.
        if !tool_on_path("git") {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path();
        let git = GitCli {
            author_name: "aiflow".to_string(),
            author_email: "aiflow@noreply".to_string(),
        };

        let init = Command::new("git")
            .args(["init", "-b", "main"])
            .arg(path)
            .output()
            .await
            .unwrap();
        assert!(init.status.success());
        git.configure_identity(path).await.unwrap();

        assert!(!git.has_changes(path).await.unwrap());
        std::fs::write(path.join("a.txt"), "hello").unwrap();
        assert!(git.has_changes(path).await.unwrap());

        git.commit_all(path, "ENG-7: add login\n\nGenerated by aiflow")
            .await
            .unwrap();
        assert!(!git.has_changes(path).await.unwrap());

        git.create_branch(path, "eng-7-add-login").await.unwrap();
        let head = git
            .git(path, &["rev-parse", "--abbrev-ref", "HEAD"])
            .await
            .unwrap();
        assert_eq!(head.trim(), "eng-7-add-login");
    }
}

//! Stage executors.
//!
//! Three flavors, selected by stage flags:
//! - plain: run the command, decide from the exit code
//! - creates-artifact: run inside a working copy, publish a branch and
//!   pull request, and bind them to the issue
//! - uses-artifact: run on the branch an earlier stage created
//!
//! Plus the comment-driven re-run used by approval gates, which reports but
//! never advances the issue.
//!
//! Exit-code policy everywhere: 0 advances (or gates), 2 skips quietly,
//! anything else fails the run, posts a feedback comment, and moves the
//! issue to the stage's failure state when one is configured.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;

use crate::config::{ContextMode, StageConfig};
use crate::errors::RunnerError;
use crate::gitops::{sanitize_branch_name, RevisionControl};
use crate::ledger::{BranchBinding, LedgerHandle};
use crate::meta;
use crate::runner::{CommentContext, RunInput, Runner};
use crate::tracker::{CommentNode, IssueDetails, Tracker};
use crate::workspace::WorkspaceManager;

/// Prefix on every comment the system posts. Comments starting with this
/// are never treated as human input, which is what breaks feedback loops.
pub const COMMENT_PREFIX: &str = "**aiflow:";

const MAX_FAILURE_COMMENT_CHARS: usize = 3_000;
const MAX_SUCCESS_OUTPUT_CHARS: usize = 10_000;

pub struct StageExecutor {
    tracker: Arc<dyn Tracker>,
    ledger: LedgerHandle,
    runner: Arc<Runner>,
    git: Option<Arc<dyn RevisionControl>>,
    workspaces: Arc<WorkspaceManager>,
    context_mode: ContextMode,
    cancel: CancellationToken,
}

impl StageExecutor {
    pub fn new(
        tracker: Arc<dyn Tracker>,
        ledger: LedgerHandle,
        runner: Arc<Runner>,
        git: Option<Arc<dyn RevisionControl>>,
        workspaces: Arc<WorkspaceManager>,
        context_mode: ContextMode,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            tracker,
            ledger,
            runner,
            git,
            workspaces,
            context_mode,
            cancel,
        }
    }

    /// Execute a claimed run, selecting the flavor from the stage flags.
    pub async fn execute(
        &self,
        run_id: i64,
        details: &IssueDetails,
        stage: &StageConfig,
        state_name: &str,
        labels: &[String],
    ) {
        if let Some(git) = self.git.clone() {
            if stage.uses_artifact {
                return self
                    .run_uses_artifact(&git, run_id, details, stage, state_name, labels)
                    .await;
            }
            if stage.creates_artifact {
                return self
                    .run_creates_artifact(&git, run_id, details, stage, state_name, labels)
                    .await;
            }
        }
        self.run_plain(run_id, details, stage, state_name, labels)
            .await
    }

    /// Execute a comment-driven re-run. Reports the result as a comment but
    /// never transitions the issue: the approval gate stays closed until an
    /// operator moves the state by hand.
    pub async fn execute_rerun(
        &self,
        run_id: i64,
        details: &IssueDetails,
        stage: &StageConfig,
        state_name: &str,
        labels: &[String],
        comments: Vec<CommentContext>,
    ) {
        if let Some(git) = self.git.clone() {
            if stage.creates_artifact || stage.uses_artifact {
                return self
                    .rerun_with_git(&git, run_id, details, stage, state_name, labels, comments)
                    .await;
            }
        }
        self.rerun_plain(run_id, details, stage, state_name, labels, comments)
            .await
    }

    // ── Flavors ───────────────────────────────────────────────────────

    async fn run_plain(
        &self,
        run_id: i64,
        details: &IssueDetails,
        stage: &StageConfig,
        state_name: &str,
        labels: &[String],
    ) {
        let mut input = self.build_input(details, stage, state_name, labels);
        input.comments = self.fetch_all_comments(details).await;

        let outcome = match self.runner.run(&self.cancel, input).await {
            Ok(outcome) => outcome,
            Err(e) => {
                return self
                    .handle_runner_error(run_id, details, stage, e, true)
                    .await
            }
        };

        match outcome.exit_code {
            0 => {
                eprintln!(
                    "[stage] {} succeeded for {}",
                    stage.name, details.identifier
                );
                if !self.complete_run(run_id, 0, &outcome.stdout, "", "").await {
                    return;
                }
                self.finish_success(details, stage, &outcome.stdout, "", None)
                    .await;
            }
            2 => {
                eprintln!("[stage] {} skipped for {}", stage.name, details.identifier);
                self.complete_run(run_id, 2, "skipped", "", "").await;
            }
            code => {
                let msg = failure_message(&outcome.stderr, &outcome.stdout);
                eprintln!(
                    "[stage] {} failed for {} (exit {})",
                    stage.name, details.identifier, code
                );
                self.fail_run(run_id, code, &msg).await;
                self.fail_and_transition(&details.id, &details.identifier, stage, &msg)
                    .await;
            }
        }
    }

    async fn run_creates_artifact(
        &self,
        git: &Arc<dyn RevisionControl>,
        run_id: i64,
        details: &IssueDetails,
        stage: &StageConfig,
        state_name: &str,
        labels: &[String],
    ) {
        let branch_name = sanitize_branch_name(&details.identifier, &details.title);

        let (repo, base_branch) = match resolve_repo_config(details) {
            Ok(pair) => pair,
            Err(e) => {
                let msg = format!("{:#}", e);
                eprintln!("[stage] resolving repo config for {}: {}", details.identifier, msg);
                self.fail_run(run_id, -1, &msg).await;
                self.fail_and_transition(&details.id, &details.identifier, stage, &msg)
                    .await;
                return;
            }
        };

        let ws = match self
            .workspaces
            .acquire(git.as_ref(), &repo, &base_branch, &branch_name, &details.identifier)
            .await
        {
            Ok(ws) => ws,
            Err(e) => {
                let msg = format!("failed to set up workspace: {:#}", e);
                eprintln!("[stage] {} for {}", msg, details.identifier);
                self.fail_run(run_id, -1, &msg).await;
                self.fail_and_transition(&details.id, &details.identifier, stage, &msg)
                    .await;
                return;
            }
        };

        // Cycling detection is by remote presence, not ledger state, so a
        // branch pushed outside the pipeline is still picked up.
        let branch_exists = match git.branch_exists_on_remote(ws.path(), &branch_name).await {
            Ok(exists) => exists,
            Err(e) => {
                eprintln!(
                    "[stage] checking remote branch for {}: {:#}",
                    details.identifier, e
                );
                false
            }
        };

        let mut pr_url = String::new();
        if branch_exists {
            if let Ok(Some(prev)) = self.first_branch(&details.id).await {
                pr_url = prev.pr_url.unwrap_or_default();
            }
            // Persistent workspaces already have the branch checked out.
            if !ws.is_persistent() {
                if let Err(e) = git.fetch_and_checkout(ws.path(), &branch_name).await {
                    let msg = format!("failed to fetch existing branch: {:#}", e);
                    self.fail_run(run_id, -1, &msg).await;
                    self.fail_and_transition(&details.id, &details.identifier, stage, &msg)
                        .await;
                    return;
                }
            }
            eprintln!(
                "[stage] reusing existing branch {} for {}",
                branch_name, details.identifier
            );
        } else if let Err(e) = git.create_branch(ws.path(), &branch_name).await {
            let msg = format!("failed to create branch: {:#}", e);
            self.fail_run(run_id, -1, &msg).await;
            self.fail_and_transition(&details.id, &details.identifier, stage, &msg)
                .await;
            return;
        }

        let mut input = self.build_input(details, stage, state_name, labels);
        input.work_dir = Some(ws.path().to_path_buf());
        input.branch_name = Some(branch_name.clone());
        input.comments = self.fetch_all_comments(details).await;

        let outcome = match self.runner.run(&self.cancel, input).await {
            Ok(outcome) => outcome,
            Err(e) => {
                return self
                    .handle_runner_error(run_id, details, stage, e, true)
                    .await
            }
        };

        match outcome.exit_code {
            0 => {
                if branch_exists {
                    // Push to the existing branch; the PR updates itself.
                    match self
                        .commit_and_push(git.as_ref(), ws.path(), &branch_name, details, &stage.name)
                        .await
                    {
                        Ok(pushed) => {
                            if pushed && !pr_url.is_empty() {
                                self.comment_on_artifact(
                                    git.as_ref(),
                                    ws.path(),
                                    &pr_url,
                                    &stage.name,
                                    &details.identifier,
                                )
                                .await;
                            }
                        }
                        Err(e) => {
                            let msg = format!("subprocess succeeded but push failed: {:#}", e);
                            self.fail_run(run_id, -1, &msg).await;
                            self.fail_and_transition(&details.id, &details.identifier, stage, &msg)
                                .await;
                            return;
                        }
                    }
                } else {
                    match self
                        .commit_and_create_pr(
                            git.as_ref(),
                            ws.path(),
                            &branch_name,
                            &base_branch,
                            details,
                        )
                        .await
                    {
                        Ok(url) => {
                            pr_url = url;
                            if !pr_url.is_empty() {
                                self.persist_branch_binding(details, &branch_name, &pr_url)
                                    .await;
                            }
                        }
                        Err(e) => {
                            let msg =
                                format!("subprocess succeeded but PR creation failed: {:#}", e);
                            self.fail_run(run_id, -1, &msg).await;
                            self.fail_and_transition(&details.id, &details.identifier, stage, &msg)
                                .await;
                            return;
                        }
                    }
                }

                eprintln!(
                    "[stage] {} succeeded for {} (pr: {})",
                    stage.name,
                    details.identifier,
                    if pr_url.is_empty() { "-" } else { &pr_url }
                );
                if !self
                    .complete_run(run_id, 0, &outcome.stdout, &pr_url, &branch_name)
                    .await
                {
                    return;
                }
                self.finish_success(
                    details,
                    stage,
                    &outcome.stdout,
                    &pr_url,
                    Some((repo.as_str(), branch_name.as_str())),
                )
                .await;
            }
            2 => {
                eprintln!("[stage] {} skipped for {}", stage.name, details.identifier);
                self.complete_run(run_id, 2, "skipped", &pr_url, &branch_name)
                    .await;
            }
            code => {
                let msg = failure_message(&outcome.stderr, &outcome.stdout);
                eprintln!(
                    "[stage] {} failed for {} (exit {})",
                    stage.name, details.identifier, code
                );
                self.fail_run(run_id, code, &msg).await;
                self.fail_and_transition(&details.id, &details.identifier, stage, &msg)
                    .await;
            }
        }
    }

    async fn run_uses_artifact(
        &self,
        git: &Arc<dyn RevisionControl>,
        run_id: i64,
        details: &IssueDetails,
        stage: &StageConfig,
        state_name: &str,
        labels: &[String],
    ) {
        let (repo, base_branch) = match resolve_repo_config(details) {
            Ok(pair) => pair,
            Err(e) => {
                let msg = format!("{:#}", e);
                self.fail_run(run_id, -1, &msg).await;
                self.fail_and_transition(&details.id, &details.identifier, stage, &msg)
                    .await;
                return;
            }
        };

        let prev = match self.first_branch(&details.id).await {
            Ok(prev) => prev,
            Err(e) => {
                let msg = format!("failed to look up branch: {:#}", e);
                self.fail_run(run_id, -1, &msg).await;
                self.fail_and_transition(&details.id, &details.identifier, stage, &msg)
                    .await;
                return;
            }
        };
        let Some(prev) = prev.filter(|p| !p.branch_name.is_empty()) else {
            let msg = "no existing branch found for this issue";
            eprintln!("[stage] {} ({} in {})", msg, details.identifier, stage.name);
            self.fail_run(run_id, -1, msg).await;
            self.fail_and_transition(&details.id, &details.identifier, stage, msg)
                .await;
            return;
        };

        let branch_name = prev.branch_name;
        let pr_url = prev.pr_url.unwrap_or_default();

        let ws = match self
            .workspaces
            .acquire(git.as_ref(), &repo, &base_branch, &branch_name, &details.identifier)
            .await
        {
            Ok(ws) => ws,
            Err(e) => {
                let msg = format!("failed to set up workspace: {:#}", e);
                self.fail_run(run_id, -1, &msg).await;
                self.fail_and_transition(&details.id, &details.identifier, stage, &msg)
                    .await;
                return;
            }
        };

        if !ws.is_persistent() {
            if let Err(e) = git.fetch_and_checkout(ws.path(), &branch_name).await {
                let msg = format!("failed to fetch branch: {:#}", e);
                self.fail_run(run_id, -1, &msg).await;
                self.fail_and_transition(&details.id, &details.identifier, stage, &msg)
                    .await;
                return;
            }
        }

        let mut input = self.build_input(details, stage, state_name, labels);
        input.work_dir = Some(ws.path().to_path_buf());
        input.branch_name = Some(branch_name.clone());
        input.comments = self.fetch_all_comments(details).await;

        let outcome = match self.runner.run(&self.cancel, input).await {
            Ok(outcome) => outcome,
            Err(e) => {
                return self
                    .handle_runner_error(run_id, details, stage, e, true)
                    .await
            }
        };

        match outcome.exit_code {
            0 => {
                match self
                    .commit_and_push(git.as_ref(), ws.path(), &branch_name, details, &stage.name)
                    .await
                {
                    Ok(pushed) => {
                        if pushed && !pr_url.is_empty() {
                            self.comment_on_artifact(
                                git.as_ref(),
                                ws.path(),
                                &pr_url,
                                &stage.name,
                                &details.identifier,
                            )
                            .await;
                        }
                    }
                    Err(e) => {
                        let msg = format!("subprocess succeeded but push failed: {:#}", e);
                        self.fail_run(run_id, -1, &msg).await;
                        self.fail_and_transition(&details.id, &details.identifier, stage, &msg)
                            .await;
                        return;
                    }
                }

                eprintln!(
                    "[stage] {} succeeded for {} (pr: {})",
                    stage.name,
                    details.identifier,
                    if pr_url.is_empty() { "-" } else { &pr_url }
                );
                if !self
                    .complete_run(run_id, 0, &outcome.stdout, &pr_url, &branch_name)
                    .await
                {
                    return;
                }
                self.finish_success(
                    details,
                    stage,
                    &outcome.stdout,
                    &pr_url,
                    Some((repo.as_str(), branch_name.as_str())),
                )
                .await;
            }
            2 => {
                eprintln!("[stage] {} skipped for {}", stage.name, details.identifier);
                self.complete_run(run_id, 2, "skipped", &pr_url, &branch_name)
                    .await;
            }
            code => {
                let msg = failure_message(&outcome.stderr, &outcome.stdout);
                self.fail_run(run_id, code, &msg).await;
                self.fail_and_transition(&details.id, &details.identifier, stage, &msg)
                    .await;
            }
        }
    }

    async fn rerun_plain(
        &self,
        run_id: i64,
        details: &IssueDetails,
        stage: &StageConfig,
        state_name: &str,
        labels: &[String],
        comments: Vec<CommentContext>,
    ) {
        let mut input = self.build_input(details, stage, state_name, labels);
        input.comments = comments;

        let outcome = match self.runner.run(&self.cancel, input).await {
            Ok(outcome) => outcome,
            Err(e) => {
                return self
                    .handle_runner_error(run_id, details, stage, e, false)
                    .await
            }
        };

        match outcome.exit_code {
            0 => {
                self.complete_run(run_id, 0, &outcome.stdout, "", "").await;
                let comment = format_success_comment(&stage.name, &outcome.stdout, "");
                self.post(&details.id, &details.identifier, &comment).await;
            }
            2 => {
                self.complete_run(run_id, 2, "skipped", "", "").await;
            }
            code => {
                let msg = failure_message(&outcome.stderr, &outcome.stdout);
                self.fail_run(run_id, code, &msg).await;
                self.post_failure_comment(&details.id, &details.identifier, &stage.name, &msg)
                    .await;
            }
        }
    }

    async fn rerun_with_git(
        &self,
        git: &Arc<dyn RevisionControl>,
        run_id: i64,
        details: &IssueDetails,
        stage: &StageConfig,
        state_name: &str,
        labels: &[String],
        comments: Vec<CommentContext>,
    ) {
        let (repo, base_branch) = match resolve_repo_config(details) {
            Ok(pair) => pair,
            Err(e) => {
                let msg = format!("{:#}", e);
                self.fail_run(run_id, -1, &msg).await;
                self.post_failure_comment(&details.id, &details.identifier, &stage.name, &msg)
                    .await;
                return;
            }
        };

        // uses-artifact stages share the issue's canonical branch; a
        // creates-artifact stage re-runs against its own last result.
        let prev = if stage.uses_artifact {
            self.first_branch(&details.id).await
        } else {
            let (issue_id, stage_name) = (details.id.clone(), stage.name.clone());
            self.ledger
                .call(move |l| l.last_completed_run(&issue_id, &stage_name))
                .await
        };
        let prev = match prev {
            Ok(prev) => prev,
            Err(e) => {
                let msg = format!("failed to look up previous run: {:#}", e);
                eprintln!("[stage] {} for {}", msg, details.identifier);
                self.fail_run(run_id, -1, &msg).await;
                return;
            }
        };

        let existing: Option<BranchBinding> = prev.filter(|p| !p.branch_name.is_empty());
        let is_rerun = existing.is_some();
        let (branch_name, mut pr_url) = match &existing {
            // No prior branch (comment arrived before any artifact stage
            // ran): fall back to first-creation on a fresh branch.
            None => (
                sanitize_branch_name(&details.identifier, &details.title),
                String::new(),
            ),
            Some(prev) => (
                prev.branch_name.clone(),
                prev.pr_url.clone().unwrap_or_default(),
            ),
        };

        let ws = match self
            .workspaces
            .acquire(git.as_ref(), &repo, &base_branch, &branch_name, &details.identifier)
            .await
        {
            Ok(ws) => ws,
            Err(e) => {
                let msg = format!("failed to set up workspace: {:#}", e);
                self.fail_run(run_id, -1, &msg).await;
                self.post_failure_comment(&details.id, &details.identifier, &stage.name, &msg)
                    .await;
                return;
            }
        };

        if is_rerun {
            if !ws.is_persistent() {
                if let Err(e) = git.fetch_and_checkout(ws.path(), &branch_name).await {
                    let msg = format!("failed to fetch branch: {:#}", e);
                    self.fail_run(run_id, -1, &msg).await;
                    self.post_failure_comment(&details.id, &details.identifier, &stage.name, &msg)
                        .await;
                    return;
                }
            }
        } else if let Err(e) = git.create_branch(ws.path(), &branch_name).await {
            let msg = format!("failed to create branch: {:#}", e);
            self.fail_run(run_id, -1, &msg).await;
            self.post_failure_comment(&details.id, &details.identifier, &stage.name, &msg)
                .await;
            return;
        }

        let mut input = self.build_input(details, stage, state_name, labels);
        input.work_dir = Some(ws.path().to_path_buf());
        input.branch_name = Some(branch_name.clone());
        input.comments = comments;

        let outcome = match self.runner.run(&self.cancel, input).await {
            Ok(outcome) => outcome,
            Err(e) => {
                return self
                    .handle_runner_error(run_id, details, stage, e, false)
                    .await
            }
        };

        match outcome.exit_code {
            0 => {
                if is_rerun {
                    match self
                        .commit_and_push(git.as_ref(), ws.path(), &branch_name, details, &stage.name)
                        .await
                    {
                        Ok(pushed) => {
                            if pushed && !pr_url.is_empty() {
                                self.comment_on_artifact(
                                    git.as_ref(),
                                    ws.path(),
                                    &pr_url,
                                    &stage.name,
                                    &details.identifier,
                                )
                                .await;
                            }
                        }
                        Err(e) => {
                            let msg = format!("re-run succeeded but push failed: {:#}", e);
                            self.fail_run(run_id, -1, &msg).await;
                            self.post_failure_comment(
                                &details.id,
                                &details.identifier,
                                &stage.name,
                                &msg,
                            )
                            .await;
                            return;
                        }
                    }
                } else {
                    match self
                        .commit_and_create_pr(
                            git.as_ref(),
                            ws.path(),
                            &branch_name,
                            &base_branch,
                            details,
                        )
                        .await
                    {
                        Ok(url) => {
                            pr_url = url;
                            if !pr_url.is_empty() {
                                self.persist_branch_binding(details, &branch_name, &pr_url)
                                    .await;
                            }
                        }
                        Err(e) => {
                            let msg =
                                format!("subprocess succeeded but PR creation failed: {:#}", e);
                            self.fail_run(run_id, -1, &msg).await;
                            self.post_failure_comment(
                                &details.id,
                                &details.identifier,
                                &stage.name,
                                &msg,
                            )
                            .await;
                            return;
                        }
                    }
                }

                self.complete_run(run_id, 0, &outcome.stdout, &pr_url, &branch_name)
                    .await;
                let comment = format_success_comment(&stage.name, &outcome.stdout, &pr_url);
                self.post(&details.id, &details.identifier, &comment).await;
            }
            2 => {
                self.complete_run(run_id, 2, "skipped", &pr_url, &branch_name)
                    .await;
            }
            code => {
                let msg = failure_message(&outcome.stderr, &outcome.stdout);
                self.fail_run(run_id, code, &msg).await;
                self.post_failure_comment(&details.id, &details.identifier, &stage.name, &msg)
                    .await;
            }
        }
    }

    // ── Shared plumbing ───────────────────────────────────────────────

    fn build_input(
        &self,
        details: &IssueDetails,
        stage: &StageConfig,
        state_name: &str,
        labels: &[String],
    ) -> RunInput {
        RunInput {
            issue_id: details.id.clone(),
            issue_identifier: details.identifier.clone(),
            issue_title: details.title.clone(),
            issue_description: details.description.clone(),
            issue_url: details.url.clone(),
            issue_state: state_name.to_string(),
            issue_labels: labels.to_vec(),
            stage_name: stage.name.clone(),
            next_state: stage.next_state.clone(),
            prompt: stage.prompt_text.clone(),
            command: stage.command.clone(),
            args: stage.args.clone(),
            timeout: stage.timeout(),
            context_mode: self.context_mode,
            work_dir: None,
            branch_name: None,
            comments: Vec::new(),
        }
    }

    /// All comments on the issue, unfiltered, for cross-stage context.
    async fn fetch_all_comments(&self, details: &IssueDetails) -> Vec<CommentContext> {
        match self.tracker.get_issue_comments(&details.id).await {
            Ok(nodes) => to_comment_context(&nodes),
            Err(e) => {
                eprintln!(
                    "[stage] fetching cross-stage comments for {}: {}",
                    details.identifier, e
                );
                Vec::new()
            }
        }
    }

    async fn first_branch(&self, issue_id: &str) -> Result<Option<BranchBinding>> {
        let issue_id = issue_id.to_string();
        self.ledger
            .call(move |l| l.first_branch_for_issue(&issue_id))
            .await
    }

    async fn handle_runner_error(
        &self,
        run_id: i64,
        details: &IssueDetails,
        stage: &StageConfig,
        err: RunnerError,
        transition: bool,
    ) {
        if matches!(err, RunnerError::Cancelled) {
            // Shutdown path: leave the row running; startup recovery
            // rewrites it once the process is back.
            eprintln!(
                "[stage] {} cancelled for {}",
                stage.name, details.identifier
            );
            return;
        }

        eprintln!(
            "[stage] subprocess execution error for {} ({}): {}",
            details.identifier, stage.name, err
        );
        let msg = err.to_string();
        let recorded = self
            .ledger
            .call({
                let msg = msg.clone();
                move |l| l.timeout(run_id, &msg)
            })
            .await;
        if let Err(e) = recorded {
            eprintln!("[stage] recording run timeout failed: {:#}", e);
            return;
        }

        if transition {
            self.fail_and_transition(&details.id, &details.identifier, stage, &msg)
                .await;
        } else {
            self.post_failure_comment(&details.id, &details.identifier, &stage.name, &msg)
                .await;
        }
    }

    /// Record a completed run. Returns false (and skips any transition)
    /// when the write fails.
    async fn complete_run(
        &self,
        run_id: i64,
        exit_code: i32,
        output: &str,
        pr_url: &str,
        branch_name: &str,
    ) -> bool {
        let (output, pr_url, branch_name) = (
            output.to_string(),
            pr_url.to_string(),
            branch_name.to_string(),
        );
        match self
            .ledger
            .call(move |l| l.complete(run_id, exit_code, &output, &pr_url, &branch_name))
            .await
        {
            Ok(()) => true,
            Err(e) => {
                eprintln!("[stage] recording run completion failed: {:#}", e);
                false
            }
        }
    }

    async fn fail_run(&self, run_id: i64, exit_code: i32, error: &str) {
        let error = error.to_string();
        if let Err(e) = self
            .ledger
            .call(move |l| l.fail(run_id, exit_code, &error))
            .await
        {
            eprintln!("[stage] recording run failure failed: {:#}", e);
        }
    }

    async fn finish_success(
        &self,
        details: &IssueDetails,
        stage: &StageConfig,
        output: &str,
        pr_url: &str,
        repo_branch: Option<(&str, &str)>,
    ) {
        if stage.wait_for_approval {
            // Approval gate: report and hold position.
            let comment = format_success_comment(&stage.name, output, pr_url);
            self.post(&details.id, &details.identifier, &comment).await;
            return;
        }

        self.transition_and_comment(&details.id, &details.identifier, stage, output, pr_url)
            .await;
        if let Some((repo, branch)) = repo_branch {
            self.workspaces
                .cleanup_if_terminal(&stage.next_state, repo, branch)
                .await;
        }
    }

    async fn transition_and_comment(
        &self,
        issue_id: &str,
        identifier: &str,
        stage: &StageConfig,
        output: &str,
        pr_url: &str,
    ) {
        let Some(next_state_id) = self.tracker.resolve_state_id(&stage.next_state) else {
            eprintln!(
                "[stage] cannot resolve next state {:?} for {}",
                stage.next_state, identifier
            );
            return;
        };

        if let Err(e) = self.tracker.update_issue_state(issue_id, &next_state_id).await {
            eprintln!(
                "[stage] transitioning {} to {:?}: {}",
                identifier, stage.next_state, e
            );
            return;
        }
        eprintln!("[stage] transitioned {} to {:?}", identifier, stage.next_state);

        let comment = format_success_comment(&stage.name, output, pr_url);
        self.post(issue_id, identifier, &comment).await;
    }

    /// Post the failure comment, then transition to the stage's failure
    /// state when one is configured.
    async fn fail_and_transition(
        &self,
        issue_id: &str,
        identifier: &str,
        stage: &StageConfig,
        err_msg: &str,
    ) {
        self.post_failure_comment(issue_id, identifier, &stage.name, err_msg)
            .await;

        let Some(failure_state) = stage.failure_state() else {
            return;
        };
        let Some(state_id) = self.tracker.resolve_state_id(failure_state) else {
            eprintln!(
                "[stage] cannot resolve failure state {:?} for {}",
                failure_state, identifier
            );
            return;
        };
        if let Err(e) = self.tracker.update_issue_state(issue_id, &state_id).await {
            eprintln!(
                "[stage] transitioning {} to failure state {:?}: {}",
                identifier, failure_state, e
            );
            return;
        }
        eprintln!(
            "[stage] transitioned {} to failure state {:?}",
            identifier, failure_state
        );
    }

    async fn post_failure_comment(
        &self,
        issue_id: &str,
        identifier: &str,
        stage_name: &str,
        err_msg: &str,
    ) {
        let comment = format!(
            "{} stage `{}` failed**\n\n```\n{}\n```",
            COMMENT_PREFIX,
            stage_name,
            truncate_text(err_msg, MAX_FAILURE_COMMENT_CHARS)
        );
        self.post(issue_id, identifier, &comment).await;
    }

    async fn post(&self, issue_id: &str, identifier: &str, body: &str) {
        if let Err(e) = self.tracker.post_comment(issue_id, body).await {
            eprintln!("[stage] posting comment on {}: {}", identifier, e);
        }
    }

    async fn persist_branch_binding(&self, details: &IssueDetails, branch: &str, pr_url: &str) {
        let new_description = meta::append_branch_metadata(&details.description, branch, pr_url);
        if let Err(e) = self
            .tracker
            .update_issue_description(&details.id, &new_description)
            .await
        {
            eprintln!(
                "[stage] updating description with branch metadata for {}: {}",
                details.identifier, e
            );
        }
    }

    /// Commit, push, and open the pull request. Returns the PR URL, or an
    /// empty string when the working tree had no changes (still success).
    async fn commit_and_create_pr(
        &self,
        git: &dyn RevisionControl,
        dir: &std::path::Path,
        branch: &str,
        base_branch: &str,
        details: &IssueDetails,
    ) -> Result<String> {
        if !git.has_changes(dir).await.context("checking for changes")? {
            eprintln!("[stage] no changes after subprocess for {}", details.identifier);
            return Ok(String::new());
        }

        let message = format!(
            "{}: {}\n\nGenerated by aiflow",
            details.identifier, details.title
        );
        git.commit_all(dir, &message)
            .await
            .context("committing changes")?;
        git.push(dir, branch).await.context("pushing branch")?;

        let title = format!("{}: {}", details.identifier, details.title);
        let body = format!("Generated by aiflow\n\nIssue: {}", details.url);
        git.create_pr(dir, &title, &body, base_branch, branch)
            .await
            .context("creating PR")
    }

    /// Commit and push to an existing branch. Returns true when changes
    /// were actually pushed.
    async fn commit_and_push(
        &self,
        git: &dyn RevisionControl,
        dir: &std::path::Path,
        branch: &str,
        details: &IssueDetails,
        stage_name: &str,
    ) -> Result<bool> {
        if !git.has_changes(dir).await.context("checking for changes")? {
            eprintln!("[stage] no changes after subprocess for {}", details.identifier);
            return Ok(false);
        }

        let message = cycle_commit_message(details, stage_name);
        git.commit_all(dir, &message)
            .await
            .context("committing changes")?;
        git.push(dir, branch).await.context("pushing branch")?;
        Ok(true)
    }

    async fn comment_on_artifact(
        &self,
        git: &dyn RevisionControl,
        dir: &std::path::Path,
        pr_url: &str,
        stage_name: &str,
        identifier: &str,
    ) {
        let body = format!(
            "{} stage `{}` pushed new commits**\n\nIssue: {}",
            COMMENT_PREFIX, stage_name, identifier
        );
        if let Err(e) = git.comment_on_pr(dir, pr_url, &body).await {
            eprintln!(
                "[stage] failed to comment on PR {} for {}: {:#}",
                pr_url, identifier, e
            );
        }
    }
}

/// Commit message for pushes onto an existing branch. The stage suffix
/// tells reviewers which cycle produced each commit; the first-creation
/// commit carries only the issue line.
fn cycle_commit_message(details: &IssueDetails, stage_name: &str) -> String {
    format!(
        "{}: {}\n\nGenerated by aiflow (stage: {})",
        details.identifier, details.title, stage_name
    )
}

fn resolve_repo_config(details: &IssueDetails) -> Result<(String, String)> {
    let project = details
        .project
        .as_ref()
        .with_context(|| format!("issue {} has no project", details.identifier))?;
    let parsed = meta::parse_project_meta(&project.description)
        .with_context(|| format!("issue {}: project {:?}", details.identifier, project.name))?;
    Ok((parsed.github_repo, parsed.default_branch))
}

fn failure_message(stderr: &str, stdout: &str) -> String {
    if stderr.trim().is_empty() {
        stdout.to_string()
    } else {
        stderr.to_string()
    }
}

/// Convert tracker comments for subprocess context, keeping everything.
/// Downstream stages see earlier stage reports this way.
pub fn to_comment_context(nodes: &[CommentNode]) -> Vec<CommentContext> {
    nodes
        .iter()
        .map(|n| CommentContext {
            author: n.user.name.clone(),
            body: n.body.clone(),
        })
        .collect()
}

/// Convert tracker comments for a re-run, dropping the system's own
/// comments so the gate cannot feed on its own output.
pub fn filter_system_comments(nodes: &[CommentNode]) -> Vec<CommentContext> {
    nodes
        .iter()
        .filter(|n| !n.body.starts_with(COMMENT_PREFIX))
        .map(|n| CommentContext {
            author: n.user.name.clone(),
            body: n.body.clone(),
        })
        .collect()
}

fn format_success_comment(stage_name: &str, output: &str, pr_url: &str) -> String {
    let output = output.trim();

    let header = if !pr_url.is_empty() {
        format!(
            "{} stage `{}` completed**\n\n**PR:** {}",
            COMMENT_PREFIX, stage_name, pr_url
        )
    } else if output.is_empty() {
        return format!("{} stage `{}` completed** (no output)", COMMENT_PREFIX, stage_name);
    } else {
        format!("{} stage `{}` completed**", COMMENT_PREFIX, stage_name)
    };

    if output.is_empty() {
        header
    } else {
        format!(
            "{}\n\n{}",
            header,
            truncate_text(output, MAX_SUCCESS_OUTPUT_CHARS)
        )
    }
}

fn truncate_text(s: &str, max_len: usize) -> String {
    if s.len() <= max_len {
        return s.to_string();
    }
    let mut end = max_len;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}\n... (truncated)", &s[..end])
}

//! Bounded-concurrency subprocess executor.
//!
//! Every stage run funnels through one `Runner`, whose semaphore is the
//! daemon's sole admission-control point. The child is spawned with the
//! composed prompt as its final argument, the full issue context in
//! `AIFLOW_*` environment variables (and optionally a JSON document on
//! stdin), and both output streams drained into bounded sinks so a chatty
//! child can never block on a full pipe.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::config::ContextMode;
use crate::errors::RunnerError;

/// Cap per captured stream. Writes past this are counted and dropped.
pub const MAX_OUTPUT_BYTES: usize = 1 << 20;

/// A human (or earlier-stage) comment passed to the subprocess as context.
#[derive(Debug, Clone, Serialize)]
pub struct CommentContext {
    pub author: String,
    pub body: String,
}

/// Everything needed to run one stage command.
#[derive(Debug, Clone, Default)]
pub struct RunInput {
    pub issue_id: String,
    pub issue_identifier: String,
    pub issue_title: String,
    pub issue_description: String,
    pub issue_url: String,
    pub issue_state: String,
    pub issue_labels: Vec<String>,

    pub stage_name: String,
    pub next_state: String,
    pub prompt: String,
    pub command: String,
    pub args: Vec<String>,
    pub timeout: Duration,
    pub context_mode: ContextMode,

    // Set when the stage runs inside a working copy.
    pub work_dir: Option<PathBuf>,
    pub branch_name: Option<String>,

    pub comments: Vec<CommentContext>,
}

/// Outcome of a subprocess run that actually exited.
#[derive(Debug)]
pub struct RunOutcome {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

/// Buffer that accepts at most `limit` bytes and counts the rest.
struct BoundedBuf {
    data: Vec<u8>,
    limit: usize,
    dropped: usize,
}

impl BoundedBuf {
    fn new(limit: usize) -> Self {
        Self {
            data: Vec::new(),
            limit,
            dropped: 0,
        }
    }

    fn push(&mut self, chunk: &[u8]) {
        let remaining = self.limit.saturating_sub(self.data.len());
        if remaining == 0 {
            self.dropped += chunk.len();
            return;
        }
        if chunk.len() > remaining {
            self.data.extend_from_slice(&chunk[..remaining]);
            self.dropped += chunk.len() - remaining;
        } else {
            self.data.extend_from_slice(chunk);
        }
    }

    fn into_string(self) -> String {
        let mut text = String::from_utf8_lossy(&self.data).into_owned();
        if self.dropped > 0 {
            text.push_str(&format!("\n... ({} bytes truncated)", self.dropped));
        }
        text
    }
}

/// Subprocess executor with a fixed concurrency budget.
pub struct Runner {
    sem: Arc<Semaphore>,
}

impl Runner {
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            sem: Arc::new(Semaphore::new(max_concurrent.max(1))),
        }
    }

    /// Execute a stage command.
    ///
    /// Returns `Ok` with the child's exit code for any run that exited on
    /// its own, including non-zero exits. Errors are reserved for
    /// cancellation, the per-stage deadline, and spawn/I/O failures.
    pub async fn run(
        &self,
        cancel: &CancellationToken,
        input: RunInput,
    ) -> Result<RunOutcome, RunnerError> {
        let permit = tokio::select! {
            _ = cancel.cancelled() => return Err(RunnerError::Cancelled),
            permit = self.sem.clone().acquire_owned() => {
                permit.map_err(|_| RunnerError::Cancelled)?
            }
        };
        let _permit = permit;

        let composed = compose_prompt(&input);
        let use_stdin = matches!(input.context_mode, ContextMode::Stdin | ContextMode::Both);

        let mut cmd = Command::new(&input.command);
        cmd.args(&input.args)
            .arg(&composed)
            .stdin(if use_stdin {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &input.work_dir {
            cmd.current_dir(dir);
        }
        // The parent environment is inherited; AIFLOW_* keys are appended.
        for (key, value) in build_env(&input, &composed) {
            cmd.env(key, value);
        }

        let mut child = cmd.spawn().map_err(|e| RunnerError::Spawn {
            command: input.command.clone(),
            source: e,
        })?;

        // Drain both streams concurrently. The child must never block on a
        // full pipe, so the readers keep consuming even after the cap, and
        // they start before the stdin write: a child that talks while it
        // reads would otherwise deadlock against a large stdin document.
        let stdout_task = tokio::spawn(drain(child.stdout.take()));
        let stderr_task = tokio::spawn(drain(child.stderr.take()));

        if use_stdin {
            if let Some(mut stdin) = child.stdin.take() {
                let doc = stdin_document(&input).to_string();
                stdin.write_all(doc.as_bytes()).await?;
                // Dropping stdin closes the pipe so the child sees EOF.
            }
        }

        let status = tokio::select! {
            _ = cancel.cancelled() => {
                let _ = child.start_kill();
                let _ = child.wait().await;
                return Err(RunnerError::Cancelled);
            }
            waited = tokio::time::timeout(input.timeout, child.wait()) => match waited {
                Ok(Ok(status)) => status,
                Ok(Err(e)) => return Err(RunnerError::Io(e)),
                Err(_) => {
                    let _ = child.start_kill();
                    let _ = child.wait().await;
                    return Err(RunnerError::TimedOut { after: input.timeout });
                }
            }
        };

        let stdout = stdout_task.await.unwrap_or_default();
        let stderr = stderr_task.await.unwrap_or_default();

        Ok(RunOutcome {
            // A signal-killed child has no exit status; record -1.
            exit_code: status.code().unwrap_or(-1),
            stdout,
            stderr,
        })
    }
}

async fn drain<R>(stream: Option<R>) -> String
where
    R: AsyncReadExt + Unpin,
{
    let Some(mut stream) = stream else {
        return String::new();
    };
    let mut sink = BoundedBuf::new(MAX_OUTPUT_BYTES);
    let mut buf = [0u8; 8192];
    loop {
        match stream.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => sink.push(&buf[..n]),
        }
    }
    sink.into_string()
}

/// Compose the prompt the child receives as its final argument: issue
/// header, optional context lines, a divider, the stage prompt, and any
/// comments.
pub fn compose_prompt(input: &RunInput) -> String {
    let mut text = String::new();
    text.push_str(&format!(
        "Issue: {} - {}\n",
        input.issue_identifier, input.issue_title
    ));
    if !input.issue_description.is_empty() {
        text.push_str(&format!("Description: {}\n", input.issue_description));
    }
    if !input.issue_url.is_empty() {
        text.push_str(&format!("URL: {}\n", input.issue_url));
    }
    if !input.issue_labels.is_empty() {
        text.push_str(&format!("Labels: {}\n", input.issue_labels.join(", ")));
    }
    text.push_str("\n---\n\n");
    text.push_str(&input.prompt);

    if !input.comments.is_empty() {
        text.push_str("\n\n---\n\nComments:\n");
        for comment in &input.comments {
            text.push_str(&format!("\n[{}]:\n{}\n", comment.author, comment.body));
        }
    }

    text
}

fn build_env(input: &RunInput, composed_prompt: &str) -> Vec<(String, String)> {
    let mut env = vec![
        ("AIFLOW_ISSUE_ID".to_string(), input.issue_id.clone()),
        (
            "AIFLOW_ISSUE_IDENTIFIER".to_string(),
            input.issue_identifier.clone(),
        ),
        ("AIFLOW_ISSUE_TITLE".to_string(), input.issue_title.clone()),
        (
            "AIFLOW_ISSUE_DESCRIPTION".to_string(),
            input.issue_description.clone(),
        ),
        ("AIFLOW_ISSUE_URL".to_string(), input.issue_url.clone()),
        ("AIFLOW_ISSUE_STATE".to_string(), input.issue_state.clone()),
        (
            "AIFLOW_ISSUE_LABELS".to_string(),
            input.issue_labels.join(","),
        ),
        ("AIFLOW_STAGE_NAME".to_string(), input.stage_name.clone()),
        ("AIFLOW_NEXT_STATE".to_string(), input.next_state.clone()),
        ("AIFLOW_PROMPT".to_string(), composed_prompt.to_string()),
    ];
    if let Some(dir) = &input.work_dir {
        env.push((
            "AIFLOW_WORK_DIR".to_string(),
            dir.to_string_lossy().into_owned(),
        ));
    }
    if let Some(branch) = &input.branch_name {
        env.push(("AIFLOW_BRANCH".to_string(), branch.clone()));
    }
    if !input.comments.is_empty() {
        if let Ok(json) = serde_json::to_string(&input.comments) {
            env.push(("AIFLOW_COMMENTS".to_string(), json));
        }
    }
    env
}

fn stdin_document(input: &RunInput) -> serde_json::Value {
    let mut doc = serde_json::json!({
        "issue_id": input.issue_id,
        "issue_identifier": input.issue_identifier,
        "issue_title": input.issue_title,
        "issue_description": input.issue_description,
        "issue_url": input.issue_url,
        "issue_state": input.issue_state,
        "issue_labels": input.issue_labels,
        "stage_name": input.stage_name,
        "next_state": input.next_state,
        "prompt": input.prompt,
    });
    if let Some(dir) = &input.work_dir {
        doc["work_dir"] = serde_json::json!(dir.to_string_lossy());
    }
    if let Some(branch) = &input.branch_name {
        doc["branch_name"] = serde_json::json!(branch);
    }
    if !input.comments.is_empty() {
        doc["comments"] = serde_json::json!(input.comments);
    }
    doc
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> RunInput {
        RunInput {
            issue_id: "uuid-7".to_string(),
            issue_identifier: "ENG-7".to_string(),
            issue_title: "add login".to_string(),
            stage_name: "implement".to_string(),
            next_state: "Security Review".to_string(),
            prompt: "implement the issue".to_string(),
            command: "sh".to_string(),
            // The composed prompt lands in $0 of the -c script.
            args: vec!["-c".to_string(), script.to_string()],
            timeout: Duration::from_secs(10),
            ..RunInput::default()
        }
    }

    #[tokio::test]
    async fn test_exit_code_zero_and_stdout_captured() {
        let runner = Runner::new(2);
        let outcome = runner
            .run(&CancellationToken::new(), sh("echo hello"))
            .await
            .unwrap();
        assert_eq!(outcome.exit_code, 0);
        assert_eq!(outcome.stdout.trim(), "hello");
        assert!(outcome.stderr.is_empty());
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_a_result_not_an_error() {
        let runner = Runner::new(2);
        let outcome = runner
            .run(&CancellationToken::new(), sh("echo oops >&2; exit 3"))
            .await
            .unwrap();
        assert_eq!(outcome.exit_code, 3);
        assert_eq!(outcome.stderr.trim(), "oops");
    }

    #[tokio::test]
    async fn test_skip_exit_code() {
        let runner = Runner::new(2);
        let outcome = runner
            .run(&CancellationToken::new(), sh("exit 2"))
            .await
            .unwrap();
        assert_eq!(outcome.exit_code, 2);
    }

    #[tokio::test]
    async fn test_timeout_kills_the_child() {
        let runner = Runner::new(2);
        let mut input = sh("sleep 30");
        input.timeout = Duration::from_millis(200);
        let started = std::time::Instant::now();
        let err = runner
            .run(&CancellationToken::new(), input)
            .await
            .unwrap_err();
        assert!(err.is_timeout());
        assert!(err.to_string().starts_with("subprocess timed out after"));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_spawn_failure_is_distinct_from_timeout() {
        let runner = Runner::new(2);
        let mut input = sh("true");
        input.command = "definitely-not-a-real-binary-1234".to_string();
        let err = runner
            .run(&CancellationToken::new(), input)
            .await
            .unwrap_err();
        assert!(matches!(err, RunnerError::Spawn { .. }));
    }

    #[tokio::test]
    async fn test_cancelled_token_short_circuits() {
        let runner = Runner::new(2);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = runner.run(&cancel, sh("sleep 30")).await.unwrap_err();
        assert!(matches!(err, RunnerError::Cancelled));
    }

    #[tokio::test]
    async fn test_output_is_bounded_and_child_never_blocks() {
        let runner = Runner::new(2);
        // 2 MiB of output: well past the cap and past any pipe buffer, so
        // this test also proves the drain keeps the child from blocking.
        let outcome = runner
            .run(
                &CancellationToken::new(),
                sh("dd if=/dev/zero bs=1024 count=2048 2>/dev/null | tr '\\0' 'a'"),
            )
            .await
            .unwrap();
        assert_eq!(outcome.exit_code, 0);
        assert!(outcome.stdout.len() <= MAX_OUTPUT_BYTES + 64);
        assert!(outcome.stdout.ends_with("bytes truncated)"));
    }

    #[tokio::test]
    async fn test_env_carries_issue_context() {
        let runner = Runner::new(2);
        let outcome = runner
            .run(
                &CancellationToken::new(),
                sh("printf '%s/%s/%s' \"$AIFLOW_ISSUE_IDENTIFIER\" \"$AIFLOW_STAGE_NAME\" \"$AIFLOW_NEXT_STATE\""),
            )
            .await
            .unwrap();
        assert_eq!(outcome.stdout, "ENG-7/implement/Security Review");
    }

    #[tokio::test]
    async fn test_composed_prompt_is_final_argument() {
        let runner = Runner::new(2);
        let outcome = runner
            .run(&CancellationToken::new(), sh("printf '%s' \"$0\""))
            .await
            .unwrap();
        assert!(outcome.stdout.starts_with("Issue: ENG-7 - add login\n"));
        assert!(outcome.stdout.contains("\n---\n"));
        assert!(outcome.stdout.ends_with("implement the issue"));
    }

    #[tokio::test]
    async fn test_stdin_mode_pipes_json_document() {
        let runner = Runner::new(2);
        let mut input = sh("cat");
        input.context_mode = ContextMode::Stdin;
        input.comments = vec![CommentContext {
            author: "ava".to_string(),
            body: "ship it".to_string(),
        }];
        let outcome = runner.run(&CancellationToken::new(), input).await.unwrap();
        let doc: serde_json::Value = serde_json::from_str(&outcome.stdout).unwrap();
        assert_eq!(doc["issue_identifier"], "ENG-7");
        assert_eq!(doc["prompt"], "implement the issue");
        assert_eq!(doc["comments"][0]["author"], "ava");
    }

    #[tokio::test]
    async fn test_stdin_write_does_not_deadlock_against_eager_output() {
        let runner = Runner::new(2);
        // The child fills its stdout past the pipe buffer before touching
        // stdin, while the stdin document is itself larger than a pipe
        // buffer. Both sides must be pumped concurrently to finish.
        let mut input = sh(
            "dd if=/dev/zero bs=1024 count=200 2>/dev/null | tr '\\0' 'a'; cat >/dev/null",
        );
        input.context_mode = ContextMode::Stdin;
        // Past a pipe buffer, but safely under the kernel's per-argument
        // limit (the description is also part of the composed prompt).
        input.issue_description = "x".repeat(100 * 1024);
        input.timeout = Duration::from_secs(10);
        let outcome = runner.run(&CancellationToken::new(), input).await.unwrap();
        assert_eq!(outcome.exit_code, 0);
        assert_eq!(outcome.stdout.len(), 200 * 1024);
    }

    #[test]
    fn test_compose_prompt_includes_comments_block() {
        let mut input = sh("true");
        input.issue_description = "needs oauth".to_string();
        input.issue_url = "https://tracker/ENG-7".to_string();
        input.issue_labels = vec!["auto".to_string(), "backend".to_string()];
        input.comments = vec![
            CommentContext {
                author: "ava".to_string(),
                body: "use the existing session store".to_string(),
            },
            CommentContext {
                author: "raj".to_string(),
                body: "and add tests".to_string(),
            },
        ];
        let prompt = compose_prompt(&input);
        assert!(prompt.contains("Description: needs oauth\n"));
        assert!(prompt.contains("URL: https://tracker/ENG-7\n"));
        assert!(prompt.contains("Labels: auto, backend\n"));
        assert!(prompt.contains("Comments:\n"));
        assert!(prompt.contains("[ava]:\nuse the existing session store\n"));
        assert!(prompt.contains("[raj]:\nand add tests\n"));
    }

    #[test]
    fn test_compose_prompt_omits_empty_sections() {
        let input = sh("true");
        let prompt = compose_prompt(&input);
        assert!(!prompt.contains("Description:"));
        assert!(!prompt.contains("Labels:"));
        assert!(!prompt.contains("Comments:"));
    }

    #[test]
    fn test_bounded_buf_trailer_counts_dropped_bytes() {
        let mut buf = BoundedBuf::new(8);
        buf.push(b"12345");
        buf.push(b"67890");
        let text = buf.into_string();
        assert!(text.starts_with("12345678"));
        assert!(text.ends_with("... (2 bytes truncated)"));
    }

    #[test]
    fn test_env_includes_workdir_branch_and_comments() {
        let mut input = sh("true");
        input.work_dir = Some(PathBuf::from("/tmp/ws"));
        input.branch_name = Some("eng-7-add-login".to_string());
        input.comments = vec![CommentContext {
            author: "ava".to_string(),
            body: "hi".to_string(),
        }];
        let env = build_env(&input, "prompt");
        let get = |key: &str| {
            env.iter()
                .find(|(k, _)| k == key)
                .map(|(_, v)| v.clone())
        };
        assert_eq!(get("AIFLOW_WORK_DIR").unwrap(), "/tmp/ws");
        assert_eq!(get("AIFLOW_BRANCH").unwrap(), "eng-7-add-login");
        assert!(get("AIFLOW_COMMENTS").unwrap().contains("\"ava\""));
    }
}

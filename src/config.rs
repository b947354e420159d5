//! Runtime configuration and the pipeline model.
//!
//! Configuration is a single TOML file. Stage prompt files are resolved
//! relative to the config file's directory and read into memory at load
//! time, so a running daemon never touches prompt files again.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

/// Minimum allowed scan interval in poll mode.
pub const MIN_POLL_INTERVAL_SECS: u64 = 10;

const DEFAULT_STAGE_TIMEOUT_SECS: u64 = 3600;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    pub tracker: TrackerConfig,
    #[serde(default)]
    pub subprocess: SubprocessConfig,
    #[serde(default)]
    pub workspace: WorkspaceConfig,
    pub pipeline: Vec<StageConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
        }
    }
}

fn default_port() -> u16 {
    8080
}

/// How events arrive from the tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IngressMode {
    /// HTTP webhook endpoint with signature verification.
    #[default]
    Webhook,
    /// Periodic scan of each stage's trigger state.
    Poll,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TrackerConfig {
    pub api_key: String,
    pub team_key: String,
    #[serde(default)]
    pub mode: IngressMode,
    /// Shared secret for webhook signature verification (webhook mode).
    #[serde(default)]
    pub webhook_secret: Option<String>,
    /// Scan interval in seconds (poll mode). Must be at least 10.
    #[serde(default)]
    pub poll_interval: Option<u64>,
    /// GraphQL endpoint override, mainly for tests.
    #[serde(default)]
    pub api_url: Option<String>,
}

impl TrackerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval.unwrap_or(MIN_POLL_INTERVAL_SECS))
    }
}

/// What the stage command receives beyond its argv prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContextMode {
    /// `AIFLOW_*` environment variables only.
    #[default]
    Env,
    /// JSON document on stdin only (env vars still set).
    Stdin,
    /// Both stdin JSON and environment variables.
    Both,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SubprocessConfig {
    #[serde(default)]
    pub context_mode: ContextMode,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
}

impl Default for SubprocessConfig {
    fn default() -> Self {
        Self {
            context_mode: ContextMode::default(),
            max_concurrent: default_max_concurrent(),
        }
    }
}

fn default_max_concurrent() -> usize {
    3
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkspaceConfig {
    /// Root directory for persistent workspaces. Absent means every run
    /// clones into a scratch directory that is removed afterwards.
    #[serde(default)]
    pub root: Option<PathBuf>,
    /// Workflow states that end an issue's pipeline life. Transitioning into
    /// one of these removes the issue's persistent workspace.
    #[serde(default = "default_terminal_states")]
    pub terminal_states: Vec<String>,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            root: None,
            terminal_states: default_terminal_states(),
        }
    }
}

fn default_terminal_states() -> Vec<String> {
    vec!["Done".to_string()]
}

/// One pipeline stage: a tracker state bound to a command.
#[derive(Debug, Clone, Deserialize)]
pub struct StageConfig {
    pub name: String,
    /// Workflow state that triggers this stage.
    pub trigger_state: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Inline prompt text. Exactly one of `prompt` / `prompt_file`.
    #[serde(default)]
    pub prompt: Option<String>,
    /// Prompt file, resolved relative to the config file.
    #[serde(default)]
    pub prompt_file: Option<PathBuf>,
    /// Resolved prompt text, populated during validation.
    #[serde(skip)]
    pub prompt_text: String,
    /// State the issue moves to when the stage succeeds.
    pub next_state: String,
    /// State the issue moves to when the stage fails. None = stay put.
    #[serde(default)]
    pub failure_state: Option<String>,
    /// Per-run timeout in seconds.
    #[serde(default = "default_stage_timeout")]
    pub timeout: u64,
    /// Label filter: the issue must carry at least one of these. Empty = no
    /// filter.
    #[serde(default)]
    pub labels: Vec<String>,
    /// Stage runs in a working copy and publishes a pull request.
    #[serde(default)]
    pub creates_artifact: bool,
    /// Stage runs on the branch created by an earlier stage.
    #[serde(default)]
    pub uses_artifact: bool,
    /// Report but do not advance; a human comment re-runs the stage.
    #[serde(default)]
    pub wait_for_approval: bool,
}

fn default_stage_timeout() -> u64 {
    DEFAULT_STAGE_TIMEOUT_SECS
}

impl StageConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }

    /// Failure state, treating the empty string as unset.
    pub fn failure_state(&self) -> Option<&str> {
        self.failure_state.as_deref().filter(|s| !s.is_empty())
    }
}

impl Config {
    /// Read and validate a TOML config file. Prompt files are resolved
    /// relative to the config file's directory and read into each stage.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        let mut cfg: Config = toml::from_str(&data).context("parsing config")?;
        let config_dir = path.parent().unwrap_or_else(|| Path::new("."));
        cfg.validate(config_dir).context("validating config")?;
        Ok(cfg)
    }

    fn validate(&mut self, config_dir: &Path) -> Result<()> {
        if self.tracker.api_key.is_empty() {
            bail!("tracker.api_key is required");
        }
        if self.tracker.team_key.is_empty() {
            bail!("tracker.team_key is required");
        }

        match self.tracker.mode {
            IngressMode::Webhook => {
                if self
                    .tracker
                    .webhook_secret
                    .as_deref()
                    .unwrap_or_default()
                    .is_empty()
                {
                    bail!("tracker.webhook_secret is required when mode is \"webhook\"");
                }
            }
            IngressMode::Poll => {
                let interval = self
                    .tracker
                    .poll_interval
                    .context("tracker.poll_interval is required when mode is \"poll\"")?;
                if interval < MIN_POLL_INTERVAL_SECS {
                    bail!(
                        "tracker.poll_interval must be at least {}s, got {}s",
                        MIN_POLL_INTERVAL_SECS,
                        interval
                    );
                }
            }
        }

        if self.subprocess.max_concurrent == 0 {
            self.subprocess.max_concurrent = default_max_concurrent();
        }

        if self.workspace.terminal_states.is_empty() {
            self.workspace.terminal_states = default_terminal_states();
        }
        if let Some(root) = &self.workspace.root {
            std::fs::create_dir_all(root)
                .with_context(|| format!("creating workspace root {}", root.display()))?;
        }

        if self.pipeline.is_empty() {
            bail!("at least one pipeline stage is required");
        }

        let mut seen_states: Vec<String> = Vec::new();
        for (i, stage) in self.pipeline.iter_mut().enumerate() {
            if stage.name.is_empty() {
                bail!("pipeline[{}].name is required", i);
            }
            if stage.trigger_state.is_empty() {
                bail!("pipeline[{}].trigger_state is required", i);
            }
            if stage.command.is_empty() {
                bail!("pipeline[{}].command is required", i);
            }
            if stage.next_state.is_empty() {
                bail!("pipeline[{}].next_state is required", i);
            }

            stage.prompt_text = match (&stage.prompt, &stage.prompt_file) {
                (Some(_), Some(_)) => bail!(
                    "pipeline[{}] has both prompt and prompt_file (mutually exclusive)",
                    i
                ),
                (Some(text), None) => text.clone(),
                (None, Some(file)) => {
                    let path = if file.is_absolute() {
                        file.clone()
                    } else {
                        config_dir.join(file)
                    };
                    std::fs::read_to_string(&path).with_context(|| {
                        format!("pipeline[{}].prompt_file {}", i, path.display())
                    })?
                }
                (None, None) => bail!("pipeline[{}] needs prompt or prompt_file", i),
            };

            if stage.timeout == 0 {
                stage.timeout = DEFAULT_STAGE_TIMEOUT_SECS;
            }
            if stage.creates_artifact && stage.uses_artifact {
                bail!(
                    "pipeline[{}] has both creates_artifact and uses_artifact (mutually exclusive)",
                    i
                );
            }
            if let Some(failure) = stage.failure_state() {
                if failure.eq_ignore_ascii_case(&stage.trigger_state) {
                    bail!("pipeline[{}] failure_state cannot equal trigger_state", i);
                }
            }
            if seen_states
                .iter()
                .any(|s| s.eq_ignore_ascii_case(&stage.trigger_state))
            {
                bail!("duplicate trigger_state {:?} in pipeline", stage.trigger_state);
            }
            seen_states.push(stage.trigger_state.clone());
        }

        Ok(())
    }

    /// Find the stage whose trigger state matches, case-insensitively.
    pub fn find_stage(&self, state_name: &str) -> Option<&StageConfig> {
        self.pipeline
            .iter()
            .find(|s| s.trigger_state.eq_ignore_ascii_case(state_name))
    }
}

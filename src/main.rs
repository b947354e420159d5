use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use aiflow::config::{Config, IngressMode};
use aiflow::dispatch::Dispatcher;
use aiflow::executor::StageExecutor;
use aiflow::gitops::GitCli;
use aiflow::ingress;
use aiflow::ledger::{Ledger, LedgerHandle, STALE_RUN_MAX_AGE};
use aiflow::runner::Runner;
use aiflow::scan::Scanner;
use aiflow::tracker::{ApiClient, Tracker};
use aiflow::workspace::WorkspaceManager;

#[derive(Parser)]
#[command(name = "aiflow")]
#[command(version, about = "Drives issue-tracker tickets through AI agent pipeline stages")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the orchestrator daemon
    Run {
        /// Path to the TOML config file
        #[arg(long, default_value = "aiflow.toml")]
        config: PathBuf,
        /// Path to the SQLite run ledger
        #[arg(long, default_value = "aiflow.db")]
        db: PathBuf,
    },
    /// Validate a config file and exit
    Check {
        #[arg(long, default_value = "aiflow.toml")]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Run { config, db } => run(&config, &db).await,
        Commands::Check { config } => {
            let cfg = Config::load(&config)?;
            println!(
                "config ok: {} stage(s), {} mode",
                cfg.pipeline.len(),
                match cfg.tracker.mode {
                    IngressMode::Webhook => "webhook",
                    IngressMode::Poll => "poll",
                }
            );
            Ok(())
        }
    }
}

async fn run(config_path: &PathBuf, db_path: &PathBuf) -> Result<()> {
    let cfg = Arc::new(Config::load(config_path)?);
    eprintln!(
        "[main] config loaded: port {}, team {}, {} stage(s)",
        cfg.server.port,
        cfg.tracker.team_key,
        cfg.pipeline.len()
    );

    let ledger = LedgerHandle::new(Ledger::open(db_path)?);
    let recovered = ledger
        .call(|l| l.recover_stale(STALE_RUN_MAX_AGE))
        .await
        .context("recovering stale runs")?;
    if recovered > 0 {
        eprintln!("[main] recovered {} stale run(s) from previous process", recovered);
    }

    let tracker: Arc<dyn Tracker> = Arc::new(ApiClient::new(
        &cfg.tracker.api_key,
        cfg.tracker.api_url.as_deref(),
    ));
    tracker
        .load_workflow_states(&cfg.tracker.team_key)
        .await
        .context("loading workflow states from tracker")?;

    // Fail fast on config that names states the tracker does not have.
    for stage in &cfg.pipeline {
        for (field, state) in [
            ("trigger_state", Some(stage.trigger_state.as_str())),
            ("next_state", Some(stage.next_state.as_str())),
            ("failure_state", stage.failure_state()),
        ] {
            if let Some(state) = state {
                if tracker.resolve_state_id(state).is_none() {
                    bail!(
                        "pipeline stage {:?}: {} {:?} not found in tracker workflow",
                        stage.name,
                        field,
                        state
                    );
                }
            }
        }
    }

    // Artifact stages need git and gh; without them the daemon still serves
    // plain stages.
    let git = match GitCli::new() {
        Ok(git) => Some(Arc::new(git) as Arc<dyn aiflow::gitops::RevisionControl>),
        Err(e) => {
            eprintln!("[main] git tooling unavailable, artifact stages disabled: {}", e);
            None
        }
    };

    let cancel = CancellationToken::new();
    let runner = Arc::new(Runner::new(cfg.subprocess.max_concurrent));
    let workspaces = Arc::new(WorkspaceManager::new(&cfg.workspace));
    let executor = Arc::new(StageExecutor::new(
        tracker.clone(),
        ledger.clone(),
        runner,
        git,
        workspaces,
        cfg.subprocess.context_mode,
        cancel.clone(),
    ));
    let dispatcher = Arc::new(Dispatcher::new(
        cfg.clone(),
        tracker.clone(),
        ledger,
        executor,
    ));

    // Ctrl-C cancels the root token. In-flight children are killed; their
    // ledger rows stay `running` and startup recovery rewrites them.
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("[main] shutting down");
            shutdown.cancel();
        }
    });

    match cfg.tracker.mode {
        IngressMode::Webhook => {
            let secret = cfg
                .tracker
                .webhook_secret
                .clone()
                .context("webhook mode requires tracker.webhook_secret")?;
            ingress::serve(cfg.server.port, &secret, dispatcher, cancel).await?;
        }
        IngressMode::Poll => {
            Scanner::new(cfg, tracker, dispatcher).run(cancel).await;
        }
    }

    eprintln!("[main] shutdown complete");
    Ok(())
}

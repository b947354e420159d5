//! Poll-mode scanner.
//!
//! Deployments that cannot expose a webhook endpoint run the scanner
//! instead: on an interval, every stage's trigger state is queried for
//! issues, and each hit takes the same dispatch path a state-change event
//! would. Ledger claims make the repeat sightings of a still-running issue
//! harmless.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::dispatch::Dispatcher;
use crate::tracker::Tracker;

pub struct Scanner {
    cfg: Arc<Config>,
    tracker: Arc<dyn Tracker>,
    dispatcher: Arc<Dispatcher>,
}

impl Scanner {
    pub fn new(cfg: Arc<Config>, tracker: Arc<dyn Tracker>, dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            cfg,
            tracker,
            dispatcher,
        }
    }

    /// Scan immediately, then on every interval tick until cancelled.
    pub async fn run(&self, cancel: CancellationToken) {
        let interval = self.cfg.tracker.poll_interval();
        eprintln!(
            "[scan] starting with interval {:?} across {} stages",
            interval,
            self.cfg.pipeline.len()
        );

        self.scan_once(&cancel).await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    eprintln!("[scan] stopping");
                    return;
                }
                _ = tokio::time::sleep(interval) => self.scan_once(&cancel).await,
            }
        }
    }

    /// One pass over every stage's trigger state.
    pub async fn scan_once(&self, cancel: &CancellationToken) {
        for stage in &self.cfg.pipeline {
            if cancel.is_cancelled() {
                return;
            }

            let issues = match self
                .tracker
                .get_issues_by_state(&self.cfg.tracker.team_key, &stage.trigger_state)
                .await
            {
                Ok(issues) => issues,
                Err(e) => {
                    eprintln!(
                        "[scan] querying issues for stage {} ({:?}): {}",
                        stage.name, stage.trigger_state, e
                    );
                    continue;
                }
            };

            if !issues.is_empty() {
                eprintln!(
                    "[scan] {} issue(s) in {:?} for stage {}",
                    issues.len(),
                    stage.trigger_state,
                    stage.name
                );
            }

            for issue in issues {
                let dispatcher = self.dispatcher.clone();
                tokio::spawn(async move { dispatcher.handle_scanned_issue(issue).await });
            }
        }
    }
}

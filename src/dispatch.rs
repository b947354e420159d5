//! Event dispatch.
//!
//! The dispatcher turns ingress events (state changes, new comments,
//! periodic scan hits) into claimed stage runs. It owns the policy checks:
//! did the state really change, is there a stage for it, does the issue
//! carry the required labels, and is a run already active for this
//! issue+stage pair. Admission control for actual subprocess work lives in
//! the runner's semaphore, not here.

use std::sync::Arc;

use crate::config::Config;
use crate::executor::{filter_system_comments, StageExecutor, COMMENT_PREFIX};
use crate::ledger::LedgerHandle;
use crate::tracker::{IssueDetails, Tracker};

/// A workflow-state change on an issue.
#[derive(Debug, Clone)]
pub struct StateChangeEvent {
    pub issue_id: String,
    pub previous_state_id: Option<String>,
    pub current_state_id: String,
}

/// A newly created comment on an issue.
#[derive(Debug, Clone)]
pub struct CommentEvent {
    pub issue_id: String,
    pub comment_id: String,
    pub body: String,
}

pub struct Dispatcher {
    cfg: Arc<Config>,
    tracker: Arc<dyn Tracker>,
    ledger: LedgerHandle,
    executor: Arc<StageExecutor>,
}

impl Dispatcher {
    pub fn new(
        cfg: Arc<Config>,
        tracker: Arc<dyn Tracker>,
        ledger: LedgerHandle,
        executor: Arc<StageExecutor>,
    ) -> Self {
        Self {
            cfg,
            tracker,
            ledger,
            executor,
        }
    }

    /// Handle a state-change event end to end.
    pub async fn handle_state_change(&self, event: StateChangeEvent) {
        // Updates that did not actually move the state are noise.
        match &event.previous_state_id {
            None => return,
            Some(prev) if *prev == event.current_state_id => return,
            Some(_) => {}
        }

        let Some(state_name) = self.tracker.resolve_state_name(&event.current_state_id) else {
            eprintln!(
                "[dispatch] unknown state id {:?} on issue {}",
                event.current_state_id, event.issue_id
            );
            return;
        };

        if self.cfg.find_stage(&state_name).is_none() {
            return;
        }

        let details = match self.tracker.get_issue(&event.issue_id).await {
            Ok(details) => details,
            Err(e) => {
                eprintln!(
                    "[dispatch] fetching issue {}: {}",
                    event.issue_id, e
                );
                return;
            }
        };

        self.dispatch_issue(details, &state_name).await;
    }

    /// Scan-mode entry: the issue was found sitting in a stage's trigger
    /// state, no update payload involved.
    pub async fn handle_scanned_issue(&self, details: IssueDetails) {
        let state_name = details.state.name.clone();
        self.dispatch_issue(details, &state_name).await;
    }

    async fn dispatch_issue(&self, details: IssueDetails, state_name: &str) {
        let Some(stage) = self.cfg.find_stage(state_name) else {
            return;
        };

        let labels = details.label_names();
        if !matches_labels(&stage.labels, &labels) {
            return;
        }

        let (run_id, claimed) = match self.claim(&details.id, &stage.name).await {
            Ok(pair) => pair,
            Err(e) => {
                eprintln!(
                    "[dispatch] run claim failed for {}: {:#}",
                    details.identifier, e
                );
                return;
            }
        };
        if !claimed {
            eprintln!(
                "[dispatch] run already in progress for {} ({}), skipping",
                details.identifier, stage.name
            );
            return;
        }

        eprintln!(
            "[dispatch] starting stage {} for {} (state {:?})",
            stage.name, details.identifier, state_name
        );
        self.executor
            .execute(run_id, &details, stage, state_name, &labels)
            .await;
    }

    /// Handle a comment-create event. Only stages holding an approval gate
    /// react to comments, and the system's own comments never trigger.
    pub async fn handle_comment(&self, event: CommentEvent) {
        if event.body.starts_with(COMMENT_PREFIX) {
            return;
        }

        let details = match self.tracker.get_issue(&event.issue_id).await {
            Ok(details) => details,
            Err(e) => {
                eprintln!(
                    "[dispatch] fetching issue {} for comment {}: {}",
                    event.issue_id, event.comment_id, e
                );
                return;
            }
        };

        let state_name = details.state.name.clone();
        let Some(stage) = self.cfg.find_stage(&state_name) else {
            return;
        };
        if !stage.wait_for_approval {
            return;
        }

        let labels = details.label_names();
        if !matches_labels(&stage.labels, &labels) {
            return;
        }

        let (run_id, claimed) = match self.claim(&details.id, &stage.name).await {
            Ok(pair) => pair,
            Err(e) => {
                eprintln!(
                    "[dispatch] run claim failed for comment re-run on {}: {:#}",
                    details.identifier, e
                );
                return;
            }
        };
        if !claimed {
            eprintln!(
                "[dispatch] run already in progress for {} ({}), skipping re-run",
                details.identifier, stage.name
            );
            return;
        }

        // The subprocess context gets human comments only.
        let comments = match self.tracker.get_issue_comments(&details.id).await {
            Ok(nodes) => filter_system_comments(&nodes),
            Err(e) => {
                eprintln!(
                    "[dispatch] fetching comments for {}: {}",
                    details.identifier, e
                );
                let msg = format!("failed to fetch comments: {}", e);
                let _ = self
                    .ledger
                    .call(move |l| l.fail(run_id, -1, &msg))
                    .await;
                return;
            }
        };

        eprintln!(
            "[dispatch] starting comment re-run of {} for {} ({} comments)",
            stage.name,
            details.identifier,
            comments.len()
        );
        self.executor
            .execute_rerun(run_id, &details, stage, &state_name, &labels, comments)
            .await;
    }

    async fn claim(&self, issue_id: &str, stage_name: &str) -> anyhow::Result<(i64, bool)> {
        let (issue_id, stage_name) = (issue_id.to_string(), stage_name.to_string());
        self.ledger
            .call(move |l| l.claim(&issue_id, &stage_name))
            .await
    }
}

/// An empty filter admits everything; otherwise the issue must carry at
/// least one required label, compared case-insensitively.
fn matches_labels(required: &[String], issue_labels: &[String]) -> bool {
    if required.is_empty() {
        return true;
    }
    required.iter().any(|req| {
        issue_labels
            .iter()
            .any(|have| have.eq_ignore_ascii_case(req))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{
        ContextMode, StageConfig, SubprocessConfig, TrackerConfig, WorkspaceConfig,
    };
    use crate::ledger::{Ledger, RunStatus};
    use crate::runner::Runner;
    use crate::tracker::testing::{issue_fixture, MockTracker};
    use crate::tracker::CommentNode;
    use crate::workspace::WorkspaceManager;
    use tokio_util::sync::CancellationToken;

    fn test_config(stages: Vec<StageConfig>) -> Config {
        Config {
            server: Default::default(),
            tracker: TrackerConfig {
                api_key: "key".to_string(),
                team_key: "ENG".to_string(),
                mode: Default::default(),
                webhook_secret: Some("shh".to_string()),
                poll_interval: None,
                api_url: None,
            },
            subprocess: SubprocessConfig::default(),
            workspace: WorkspaceConfig::default(),
            pipeline: stages,
        }
    }

    fn stage(trigger: &str, script: &str) -> StageConfig {
        StageConfig {
            name: "implement".to_string(),
            trigger_state: trigger.to_string(),
            command: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
            prompt: None,
            prompt_file: None,
            prompt_text: "implement".to_string(),
            next_state: "Security Review".to_string(),
            failure_state: None,
            timeout: 10,
            labels: Vec::new(),
            creates_artifact: false,
            uses_artifact: false,
            wait_for_approval: false,
        }
    }

    struct Fixture {
        tracker: Arc<MockTracker>,
        ledger: LedgerHandle,
        dispatcher: Arc<Dispatcher>,
    }

    fn fixture(stages: Vec<StageConfig>) -> Fixture {
        let cfg = Arc::new(test_config(stages));
        let tracker = Arc::new(MockTracker::new(issue_fixture()));
        let ledger = LedgerHandle::new(Ledger::open_in_memory().unwrap());
        let executor = Arc::new(StageExecutor::new(
            tracker.clone(),
            ledger.clone(),
            Arc::new(Runner::new(3)),
            None,
            Arc::new(WorkspaceManager::new(&WorkspaceConfig::default())),
            ContextMode::Env,
            CancellationToken::new(),
        ));
        let dispatcher = Arc::new(Dispatcher::new(
            cfg,
            tracker.clone(),
            ledger.clone(),
            executor,
        ));
        Fixture {
            tracker,
            ledger,
            dispatcher,
        }
    }

    fn state_change(previous: Option<&str>, current: &str) -> StateChangeEvent {
        StateChangeEvent {
            issue_id: "uuid-7".to_string(),
            previous_state_id: previous.map(|s| s.to_string()),
            current_state_id: current.to_string(),
        }
    }

    async fn completed_runs(f: &Fixture) -> usize {
        // Claim probing: the pair is free again only once the run finished.
        let (_, claimable) = f
            .ledger
            .call(|l| l.claim("probe", "probe"))
            .await
            .unwrap();
        assert!(claimable);
        f.ledger
            .call(|l| {
                Ok(match l.get_run(1)? {
                    Some(run) if run.status == RunStatus::Completed => 1,
                    _ => 0,
                })
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_state_change_runs_matching_stage() {
        let f = fixture(vec![stage("In Progress", "echo ran")]);
        f.dispatcher
            .handle_state_change(state_change(Some("st-todo"), "st-progress"))
            .await;
        assert_eq!(f.tracker.state_updates(), vec!["st-review".to_string()]);
        assert_eq!(completed_runs(&f).await, 1);
    }

    #[tokio::test]
    async fn test_no_op_update_is_dropped() {
        let f = fixture(vec![stage("In Progress", "echo ran")]);
        f.dispatcher
            .handle_state_change(state_change(None, "st-progress"))
            .await;
        f.dispatcher
            .handle_state_change(state_change(Some("st-progress"), "st-progress"))
            .await;
        assert!(f.tracker.state_updates().is_empty());
        assert!(f.tracker.posted().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_state_id_is_dropped() {
        let f = fixture(vec![stage("In Progress", "echo ran")]);
        f.dispatcher
            .handle_state_change(state_change(Some("st-todo"), "st-nonexistent"))
            .await;
        assert!(f.tracker.state_updates().is_empty());
    }

    #[tokio::test]
    async fn test_state_without_stage_is_dropped() {
        let f = fixture(vec![stage("Todo", "echo ran")]);
        // Issue fixture sits in "In Progress"; only "Todo" has a stage.
        f.dispatcher
            .handle_state_change(state_change(Some("st-todo"), "st-progress"))
            .await;
        assert!(f.tracker.state_updates().is_empty());
    }

    #[tokio::test]
    async fn test_label_filter_blocks_unlabeled_issue() {
        let mut labeled = stage("In Progress", "echo ran");
        labeled.labels = vec!["urgent".to_string()];
        let f = fixture(vec![labeled]);
        f.dispatcher
            .handle_state_change(state_change(Some("st-todo"), "st-progress"))
            .await;
        assert!(f.tracker.state_updates().is_empty());
    }

    #[tokio::test]
    async fn test_label_filter_is_case_insensitive() {
        let mut labeled = stage("In Progress", "echo ran");
        labeled.labels = vec!["AUTO".to_string()];
        let f = fixture(vec![labeled]);
        f.dispatcher
            .handle_state_change(state_change(Some("st-todo"), "st-progress"))
            .await;
        assert_eq!(f.tracker.state_updates().len(), 1);
    }

    #[tokio::test]
    async fn test_webhook_storm_admits_exactly_one_run() {
        let f = fixture(vec![stage("In Progress", "sleep 0.3; echo ran")]);
        let mut tasks = Vec::new();
        for _ in 0..5 {
            let dispatcher = f.dispatcher.clone();
            tasks.push(tokio::spawn(async move {
                dispatcher
                    .handle_state_change(state_change(Some("st-todo"), "st-progress"))
                    .await;
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        // Exactly one run executed and exactly one transition happened.
        assert_eq!(f.tracker.state_updates(), vec!["st-review".to_string()]);
        assert_eq!(f.tracker.posted().len(), 1);
    }

    #[tokio::test]
    async fn test_comment_on_gated_stage_reruns_without_transition() {
        let mut gated = stage("In Progress", "echo replanned");
        gated.wait_for_approval = true;
        let f = fixture(vec![gated]);
        f.tracker.comments.lock().unwrap().extend([
            CommentNode {
                id: "c1".to_string(),
                body: "**aiflow: stage `implement` completed**".to_string(),
                created_at: String::new(),
                user: Default::default(),
            },
            CommentNode {
                id: "c2".to_string(),
                body: "please use oauth".to_string(),
                created_at: String::new(),
                user: crate::tracker::CommentAuthor {
                    name: "ava".to_string(),
                },
            },
        ]);

        f.dispatcher
            .handle_comment(CommentEvent {
                issue_id: "uuid-7".to_string(),
                comment_id: "c2".to_string(),
                body: "please use oauth".to_string(),
            })
            .await;

        assert!(f.tracker.state_updates().is_empty());
        let posted = f.tracker.posted();
        assert_eq!(posted.len(), 1);
        assert!(posted[0].contains("completed"));
    }

    #[tokio::test]
    async fn test_system_comment_never_triggers() {
        let mut gated = stage("In Progress", "echo replanned");
        gated.wait_for_approval = true;
        let f = fixture(vec![gated]);

        f.dispatcher
            .handle_comment(CommentEvent {
                issue_id: "uuid-7".to_string(),
                comment_id: "c1".to_string(),
                body: "**aiflow: stage `implement` completed**".to_string(),
            })
            .await;

        assert!(f.tracker.posted().is_empty());
    }

    #[tokio::test]
    async fn test_comment_on_non_gated_stage_is_ignored() {
        let f = fixture(vec![stage("In Progress", "echo ran")]);
        f.dispatcher
            .handle_comment(CommentEvent {
                issue_id: "uuid-7".to_string(),
                comment_id: "c1".to_string(),
                body: "run it again".to_string(),
            })
            .await;
        assert!(f.tracker.posted().is_empty());
    }

    #[tokio::test]
    async fn test_scanned_issue_takes_state_change_path() {
        let f = fixture(vec![stage("In Progress", "echo ran")]);
        f.dispatcher.handle_scanned_issue(issue_fixture()).await;
        assert_eq!(f.tracker.state_updates(), vec!["st-review".to_string()]);
    }

    #[test]
    fn test_matches_labels() {
        let labels = vec!["auto".to_string(), "Backend".to_string()];
        assert!(matches_labels(&[], &labels));
        assert!(matches_labels(&["AUTO".to_string()], &labels));
        assert!(matches_labels(
            &["missing".to_string(), "backend".to_string()],
            &labels
        ));
        assert!(!matches_labels(&["urgent".to_string()], &labels));
        assert!(!matches_labels(&["urgent".to_string()], &[]));
    }
}

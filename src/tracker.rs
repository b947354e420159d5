//! Issue-tracker contract and GraphQL API client.
//!
//! The rest of the daemon only sees the `Tracker` trait; `ApiClient` is the
//! production implementation against a Linear-compatible GraphQL endpoint.
//! Workflow states are loaded once at startup into a bidirectional
//! name↔id cache so webhook payloads (which carry ids) and pipeline config
//! (which carries names) can meet in the middle without extra round trips.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;

use crate::errors::TrackerError;

const DEFAULT_API_URL: &str = "https://api.linear.app/graphql";
const MAX_ATTEMPTS: u32 = 3;
const BASE_RETRY_DELAY: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Deserialize)]
pub struct StateRef {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Label {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LabelConnection {
    #[serde(default)]
    pub nodes: Vec<Label>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProjectRef {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
}

/// Full issue details as fetched from the tracker.
#[derive(Debug, Clone, Deserialize)]
pub struct IssueDetails {
    pub id: String,
    pub identifier: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub url: String,
    pub state: StateRef,
    #[serde(default)]
    pub labels: LabelConnection,
    #[serde(default)]
    pub project: Option<ProjectRef>,
}

impl IssueDetails {
    pub fn label_names(&self) -> Vec<String> {
        self.labels.nodes.iter().map(|l| l.name.clone()).collect()
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CommentAuthor {
    #[serde(default)]
    pub name: String,
}

/// One comment on an issue, oldest first.
#[derive(Debug, Clone, Deserialize)]
pub struct CommentNode {
    pub id: String,
    pub body: String,
    #[serde(rename = "createdAt", default)]
    pub created_at: String,
    #[serde(default)]
    pub user: CommentAuthor,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkflowState {
    pub id: String,
    pub name: String,
    #[serde(rename = "type", default)]
    pub state_type: String,
}

/// The tracker operations the pipeline core consumes.
#[async_trait]
pub trait Tracker: Send + Sync {
    /// Populate the name↔id workflow-state cache for a team.
    async fn load_workflow_states(&self, team_key: &str) -> Result<(), TrackerError>;
    fn resolve_state_id(&self, name: &str) -> Option<String>;
    fn resolve_state_name(&self, id: &str) -> Option<String>;
    async fn get_issue(&self, id: &str) -> Result<IssueDetails, TrackerError>;
    async fn update_issue_state(&self, issue_id: &str, state_id: &str) -> Result<(), TrackerError>;
    async fn update_issue_description(
        &self,
        issue_id: &str,
        description: &str,
    ) -> Result<(), TrackerError>;
    async fn get_issue_comments(&self, issue_id: &str) -> Result<Vec<CommentNode>, TrackerError>;
    async fn post_comment(&self, issue_id: &str, body: &str) -> Result<(), TrackerError>;
    /// Issues currently sitting in the named state (scan mode).
    async fn get_issues_by_state(
        &self,
        team_key: &str,
        state_name: &str,
    ) -> Result<Vec<IssueDetails>, TrackerError>;
}

#[derive(Debug, Deserialize)]
struct GraphqlResponse<T> {
    data: Option<T>,
    #[serde(default)]
    errors: Vec<GraphqlError>,
}

#[derive(Debug, Deserialize)]
struct GraphqlError {
    message: String,
}

#[derive(Default)]
struct StateCache {
    by_name: HashMap<String, String>,
    by_id: HashMap<String, String>,
}

/// GraphQL tracker client with retries and a workflow-state cache.
pub struct ApiClient {
    api_key: String,
    endpoint: String,
    http: reqwest::Client,
    cache: RwLock<StateCache>,
}

impl ApiClient {
    pub fn new(api_key: &str, endpoint: Option<&str>) -> Self {
        Self {
            api_key: api_key.to_string(),
            endpoint: endpoint.unwrap_or(DEFAULT_API_URL).to_string(),
            http: reqwest::Client::new(),
            cache: RwLock::new(StateCache::default()),
        }
    }

    /// POST a GraphQL request, retrying transient failures with exponential
    /// backoff. Cancellation is by dropping the future; permanent failures
    /// (4xx other than 429, application errors) return immediately.
    async fn execute<T: DeserializeOwned>(
        &self,
        query: &str,
        variables: serde_json::Value,
    ) -> Result<T, TrackerError> {
        let body = json!({ "query": query, "variables": variables });

        let mut last_err: Option<TrackerError> = None;
        for attempt in 0..MAX_ATTEMPTS {
            if attempt > 0 {
                let delay = BASE_RETRY_DELAY * 2u32.pow(attempt - 1);
                eprintln!(
                    "[tracker] retrying API request (attempt {} of {}) after {:?}",
                    attempt + 1,
                    MAX_ATTEMPTS,
                    delay
                );
                tokio::time::sleep(delay).await;
            }

            match self.execute_once(&body).await {
                Ok(data) => return Ok(data),
                Err(e) => {
                    if !e.is_retryable() {
                        return Err(e);
                    }
                    eprintln!("[tracker] API request failed: {}", e);
                    last_err = Some(e);
                }
            }
        }

        Err(TrackerError::RetriesExhausted {
            attempts: MAX_ATTEMPTS,
            source: Box::new(last_err.unwrap_or_else(|| {
                TrackerError::Api("request failed without a recorded error".to_string())
            })),
        })
    }

    async fn execute_once<T: DeserializeOwned>(
        &self,
        body: &serde_json::Value,
    ) -> Result<T, TrackerError> {
        let response = self
            .http
            .post(&self.endpoint)
            .header("Content-Type", "application/json")
            .header("Authorization", &self.api_key)
            .json(body)
            .send()
            .await?
            .error_for_status()?;

        let parsed: GraphqlResponse<T> = response.json().await?;
        if let Some(first) = parsed.errors.first() {
            return Err(TrackerError::Api(format!(
                "graphql errors: {}",
                first.message
            )));
        }
        parsed
            .data
            .ok_or_else(|| TrackerError::Api("response carried no data".to_string()))
    }
}

#[derive(Debug, Deserialize)]
struct TeamsData {
    teams: NodeList<TeamStates>,
}

#[derive(Debug, Deserialize)]
struct NodeList<T> {
    nodes: Vec<T>,
}

#[derive(Debug, Deserialize)]
struct TeamStates {
    states: NodeList<WorkflowState>,
}

#[derive(Debug, Deserialize)]
struct IssueData {
    issue: IssueDetails,
}

#[derive(Debug, Deserialize)]
struct IssueCommentsData {
    issue: CommentsHolder,
}

#[derive(Debug, Deserialize)]
struct CommentsHolder {
    comments: NodeList<CommentNode>,
}

#[derive(Debug, Deserialize)]
struct IssuesData {
    issues: NodeList<IssueDetails>,
}

#[derive(Debug, Deserialize)]
struct SuccessFlag {
    success: bool,
}

#[derive(Debug, Deserialize)]
struct IssueUpdateData {
    #[serde(rename = "issueUpdate")]
    issue_update: SuccessFlag,
}

#[derive(Debug, Deserialize)]
struct CommentCreateData {
    #[serde(rename = "commentCreate")]
    comment_create: SuccessFlag,
}

const ISSUE_FIELDS: &str = "id identifier title description url \
     state { id name } \
     labels { nodes { id name } } \
     project { name description }";

#[async_trait]
impl Tracker for ApiClient {
    async fn load_workflow_states(&self, team_key: &str) -> Result<(), TrackerError> {
        let query = "query($teamKey: String!) {
            teams(filter: { key: { eq: $teamKey } }) {
                nodes { states { nodes { id name type } } }
            }
        }";
        let data: TeamsData = self
            .execute(query, json!({ "teamKey": team_key }))
            .await?;
        let team = data
            .teams
            .nodes
            .into_iter()
            .next()
            .ok_or_else(|| TrackerError::Api(format!("team {:?} not found", team_key)))?;

        let mut cache = self.cache.write().expect("state cache poisoned");
        for state in team.states.nodes {
            eprintln!(
                "[tracker] loaded workflow state {:?} ({})",
                state.name, state.state_type
            );
            cache.by_name.insert(state.name.clone(), state.id.clone());
            cache.by_id.insert(state.id, state.name);
        }
        Ok(())
    }

    fn resolve_state_id(&self, name: &str) -> Option<String> {
        self.cache
            .read()
            .expect("state cache poisoned")
            .by_name
            .get(name)
            .cloned()
    }

    fn resolve_state_name(&self, id: &str) -> Option<String> {
        self.cache
            .read()
            .expect("state cache poisoned")
            .by_id
            .get(id)
            .cloned()
    }

    async fn get_issue(&self, id: &str) -> Result<IssueDetails, TrackerError> {
        let query = format!(
            "query($id: String!) {{ issue(id: $id) {{ {} }} }}",
            ISSUE_FIELDS
        );
        let data: IssueData = self.execute(&query, json!({ "id": id })).await?;
        Ok(data.issue)
    }

    async fn update_issue_state(&self, issue_id: &str, state_id: &str) -> Result<(), TrackerError> {
        let query = "mutation($id: String!, $stateId: String!) {
            issueUpdate(id: $id, input: { stateId: $stateId }) { success }
        }";
        let data: IssueUpdateData = self
            .execute(query, json!({ "id": issue_id, "stateId": state_id }))
            .await?;
        if !data.issue_update.success {
            return Err(TrackerError::Api(
                "issue update returned success=false".to_string(),
            ));
        }
        Ok(())
    }

    async fn update_issue_description(
        &self,
        issue_id: &str,
        description: &str,
    ) -> Result<(), TrackerError> {
        let query = "mutation($id: String!, $description: String!) {
            issueUpdate(id: $id, input: { description: $description }) { success }
        }";
        let data: IssueUpdateData = self
            .execute(query, json!({ "id": issue_id, "description": description }))
            .await?;
        if !data.issue_update.success {
            return Err(TrackerError::Api(
                "description update returned success=false".to_string(),
            ));
        }
        Ok(())
    }

    async fn get_issue_comments(&self, issue_id: &str) -> Result<Vec<CommentNode>, TrackerError> {
        let query = "query($id: String!) {
            issue(id: $id) {
                comments(orderBy: createdAt) {
                    nodes { id body createdAt user { name } }
                }
            }
        }";
        let data: IssueCommentsData = self.execute(query, json!({ "id": issue_id })).await?;
        Ok(data.issue.comments.nodes)
    }

    async fn post_comment(&self, issue_id: &str, body: &str) -> Result<(), TrackerError> {
        let query = "mutation($issueId: String!, $body: String!) {
            commentCreate(input: { issueId: $issueId, body: $body }) { success }
        }";
        let data: CommentCreateData = self
            .execute(query, json!({ "issueId": issue_id, "body": body }))
            .await?;
        if !data.comment_create.success {
            return Err(TrackerError::Api(
                "comment create returned success=false".to_string(),
            ));
        }
        Ok(())
    }

    async fn get_issues_by_state(
        &self,
        team_key: &str,
        state_name: &str,
    ) -> Result<Vec<IssueDetails>, TrackerError> {
        let query = format!(
            "query($teamKey: String!, $stateName: String!) {{
                issues(filter: {{
                    team: {{ key: {{ eq: $teamKey }} }},
                    state: {{ name: {{ eq: $stateName }} }}
                }}) {{ nodes {{ {} }} }}
            }}",
            ISSUE_FIELDS
        );
        let data: IssuesData = self
            .execute(
                &query,
                json!({ "teamKey": team_key, "stateName": state_name }),
            )
            .await?;
        Ok(data.issues.nodes)
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_issue_details_deserialize_from_api_shape() {
        let payload = serde_json::json!({
            "id": "uuid-7",
            "identifier": "ENG-7",
            "title": "add login",
            "description": "desc",
            "url": "https://tracker/ENG-7",
            "state": { "id": "st-1", "name": "In Progress" },
            "labels": { "nodes": [ { "id": "lb-1", "name": "auto" } ] },
            "project": { "name": "Shop", "description": "---\ngithub_repo: acme/shop\n---" }
        });
        let issue: IssueDetails = serde_json::from_value(payload).unwrap();
        assert_eq!(issue.identifier, "ENG-7");
        assert_eq!(issue.label_names(), vec!["auto".to_string()]);
        assert_eq!(issue.project.unwrap().name, "Shop");
    }

    #[test]
    fn test_issue_details_tolerates_missing_optional_fields() {
        let payload = serde_json::json!({
            "id": "uuid-7",
            "identifier": "ENG-7",
            "title": "add login",
            "state": { "id": "st-1", "name": "Todo" }
        });
        let issue: IssueDetails = serde_json::from_value(payload).unwrap();
        assert!(issue.description.is_empty());
        assert!(issue.labels.nodes.is_empty());
        assert!(issue.project.is_none());
    }

    #[test]
    fn test_comment_node_deserialize() {
        let payload = serde_json::json!({
            "id": "c-1",
            "body": "looks good",
            "createdAt": "2026-08-01T10:00:00.000Z",
            "user": { "name": "ava" }
        });
        let comment: CommentNode = serde_json::from_value(payload).unwrap();
        assert_eq!(comment.user.name, "ava");
        assert_eq!(comment.created_at, "2026-08-01T10:00:00.000Z");
    }

    #[test]
    fn test_graphql_errors_surface_as_api_error() {
        let raw = r#"{"data": null, "errors": [{"message": "bad input"}]}"#;
        let parsed: GraphqlResponse<serde_json::Value> = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed.errors[0].message, "bad input");
        assert!(parsed.data.is_none() || parsed.data == Some(serde_json::Value::Null));
    }

    #[test]
    fn test_state_cache_resolves_both_directions() {
        let client = ApiClient::new("key", None);
        {
            let mut cache = client.cache.write().unwrap();
            cache
                .by_name
                .insert("In Progress".to_string(), "st-1".to_string());
            cache
                .by_id
                .insert("st-1".to_string(), "In Progress".to_string());
        }
        assert_eq!(client.resolve_state_id("In Progress").unwrap(), "st-1");
        assert_eq!(client.resolve_state_name("st-1").unwrap(), "In Progress");
        assert!(client.resolve_state_id("Missing").is_none());
    }
}

//! Webhook ingress.
//!
//! A small axum front that authenticates tracker webhooks (HMAC-SHA256 over
//! the raw body, hex-encoded in a header), filters them down to the two
//! event kinds the pipeline reacts to, and hands them to the dispatcher on
//! freshly spawned tasks so the HTTP response is never held hostage by a
//! stage run.

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use tokio_util::sync::CancellationToken;

use crate::dispatch::{CommentEvent, Dispatcher, StateChangeEvent};

const MAX_BODY_BYTES: usize = 1 << 20;
const SIGNATURE_HEADER: &str = "Linear-Signature";
const TIMESTAMP_HEADER: &str = "Linear-Delivery";
const MAX_TIMESTAMP_DRIFT_SECS: i64 = 60;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Deserialize)]
struct WebhookPayload {
    #[serde(default)]
    action: String,
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    data: serde_json::Value,
    #[serde(rename = "updatedFrom", default)]
    updated_from: Option<serde_json::Value>,
}

#[derive(Clone)]
pub struct IngressState {
    secret: Arc<str>,
    dispatcher: Arc<Dispatcher>,
}

pub fn build_router(secret: &str, dispatcher: Arc<Dispatcher>) -> Router {
    let state = IngressState {
        secret: Arc::from(secret),
        dispatcher,
    };
    Router::new()
        .route("/webhook", post(webhook_handler))
        .route("/health", get(health_handler))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .with_state(state)
}

/// Bind and serve until the cancellation token fires.
pub async fn serve(
    port: u16,
    secret: &str,
    dispatcher: Arc<Dispatcher>,
    cancel: CancellationToken,
) -> Result<()> {
    let app = build_router(secret, dispatcher);
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("binding to port {}", port))?;
    eprintln!("[ingress] listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
        .context("server error")?;
    Ok(())
}

async fn health_handler() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn webhook_handler(
    State(state): State<IngressState>,
    headers: HeaderMap,
    body: Bytes,
) -> StatusCode {
    let Some(signature) = headers.get(SIGNATURE_HEADER).and_then(|v| v.to_str().ok()) else {
        eprintln!("[ingress] missing webhook signature");
        return StatusCode::UNAUTHORIZED;
    };
    if !verify_signature(&state.secret, &body, signature) {
        eprintln!("[ingress] invalid webhook signature");
        return StatusCode::UNAUTHORIZED;
    }

    // Replay protection: reject deliveries that are too old (when the
    // header is present and parseable at all).
    if let Some(ts) = headers.get(TIMESTAMP_HEADER).and_then(|v| v.to_str().ok()) {
        if let Ok(delivered) = chrono::DateTime::parse_from_rfc3339(ts) {
            let drift = (chrono::Utc::now() - delivered.with_timezone(&chrono::Utc)).num_seconds();
            if drift.abs() > MAX_TIMESTAMP_DRIFT_SECS {
                eprintln!("[ingress] webhook timestamp too old ({}s drift)", drift);
                return StatusCode::BAD_REQUEST;
            }
        }
    }

    let payload: WebhookPayload = match serde_json::from_slice(&body) {
        Ok(payload) => payload,
        Err(e) => {
            eprintln!("[ingress] parsing webhook payload: {}", e);
            return StatusCode::BAD_REQUEST;
        }
    };

    dispatch_payload(&state.dispatcher, payload);
    StatusCode::OK
}

/// Filter to the event kinds the pipeline consumes and hand each to the
/// dispatcher on its own task.
fn dispatch_payload(dispatcher: &Arc<Dispatcher>, payload: WebhookPayload) {
    let field = |value: &serde_json::Value, key: &str| -> Option<String> {
        value
            .get(key)
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    };

    match (payload.kind.as_str(), payload.action.as_str()) {
        ("Issue", "update") => {
            let Some(issue_id) = field(&payload.data, "id") else {
                return;
            };
            let Some(current_state_id) = field(&payload.data, "stateId") else {
                return;
            };
            let previous_state_id = payload
                .updated_from
                .as_ref()
                .and_then(|u| field(u, "stateId"));
            let event = StateChangeEvent {
                issue_id,
                previous_state_id,
                current_state_id,
            };
            let dispatcher = dispatcher.clone();
            tokio::spawn(async move { dispatcher.handle_state_change(event).await });
        }
        ("Comment", "create") => {
            let Some(issue_id) = field(&payload.data, "issueId") else {
                return;
            };
            let Some(comment_id) = field(&payload.data, "id") else {
                return;
            };
            let body = field(&payload.data, "body").unwrap_or_default();
            let event = CommentEvent {
                issue_id,
                comment_id,
                body,
            };
            let dispatcher = dispatcher.clone();
            tokio::spawn(async move { dispatcher.handle_comment(event).await });
        }
        _ => {}
    }
}

fn verify_signature(secret: &str, body: &[u8], signature_hex: &str) -> bool {
    let Ok(signature) = hex::decode(signature_hex) else {
        return false;
    };
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("hmac accepts any key length");
    mac.update(body);
    // verify_slice is the constant-time comparison.
    mac.verify_slice(&signature).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, ContextMode, StageConfig, SubprocessConfig, TrackerConfig, WorkspaceConfig};
    use crate::executor::StageExecutor;
    use crate::ledger::{Ledger, LedgerHandle};
    use crate::runner::Runner;
    use crate::tracker::testing::{issue_fixture, MockTracker};
    use crate::workspace::WorkspaceManager;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    const SECRET: &str = "test-webhook-secret";

    fn sign(body: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(SECRET.as_bytes()).unwrap();
        mac.update(body.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    fn test_app() -> (Router, Arc<MockTracker>) {
        let stage = StageConfig {
            name: "implement".to_string(),
            trigger_state: "In Progress".to_string(),
            command: "sh".to_string(),
            args: vec!["-c".to_string(), "echo ran".to_string()],
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
        };
        let cfg = Arc::new(Config {
            server: Default::default(),
            tracker: TrackerConfig {
                api_key: "key".to_string(),
                team_key: "ENG".to_string(),
                mode: Default::default(),
                webhook_secret: Some(SECRET.to_string()),
                poll_interval: None,
                api_url: None,
            },
            subprocess: SubprocessConfig::default(),
            workspace: WorkspaceConfig::default(),
            pipeline: vec![stage],
        });
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
        let dispatcher = Arc::new(crate::dispatch::Dispatcher::new(
            cfg,
            tracker.clone(),
            ledger,
            executor,
        ));
        (build_router(SECRET, dispatcher), tracker)
    }

    fn webhook_request(body: &str, signature: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder()
            .method("POST")
            .uri("/webhook")
            .header("content-type", "application/json");
        if let Some(sig) = signature {
            builder = builder.header(SIGNATURE_HEADER, sig);
        }
        builder.body(Body::from(body.to_string())).unwrap()
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let (app, _) = test_app();
        let resp = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_missing_signature_is_unauthorized() {
        let (app, _) = test_app();
        let resp = app.oneshot(webhook_request("{}", None)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_bad_signature_is_unauthorized() {
        let (app, _) = test_app();
        let resp = app
            .oneshot(webhook_request("{}", Some("deadbeef")))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_malformed_payload_is_bad_request() {
        let (app, _) = test_app();
        let body = "not json";
        let resp = app
            .oneshot(webhook_request(body, Some(&sign(body))))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_stale_timestamp_is_rejected() {
        let (app, _) = test_app();
        let body = r#"{"type":"Issue","action":"update","data":{}}"#;
        let request = Request::builder()
            .method("POST")
            .uri("/webhook")
            .header(SIGNATURE_HEADER, sign(body))
            .header(TIMESTAMP_HEADER, "2020-01-01T00:00:00Z")
            .body(Body::from(body))
            .unwrap();
        let resp = app.oneshot(request).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_irrelevant_event_kinds_are_acknowledged_and_ignored() {
        let (app, tracker) = test_app();
        let body = r#"{"type":"Label","action":"create","data":{"id":"x"}}"#;
        let resp = app
            .oneshot(webhook_request(body, Some(&sign(body))))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(tracker.state_updates().is_empty());
    }

    #[tokio::test]
    async fn test_issue_update_webhook_drives_a_stage_run() {
        let (app, tracker) = test_app();
        let body = r#"{
            "type": "Issue",
            "action": "update",
            "data": { "id": "uuid-7", "stateId": "st-progress" },
            "updatedFrom": { "stateId": "st-todo" }
        }"#;
        let resp = app
            .oneshot(webhook_request(body, Some(&sign(body))))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        // The run happens on a spawned task; wait for the transition.
        for _ in 0..40 {
            if !tracker.state_updates().is_empty() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        }
        assert_eq!(tracker.state_updates(), vec!["st-review".to_string()]);
    }

    #[test]
    fn test_verify_signature_round_trip() {
        let body = b"payload bytes";
        let mut mac = HmacSha256::new_from_slice(SECRET.as_bytes()).unwrap();
        mac.update(body);
        let good = hex::encode(mac.finalize().into_bytes());
        assert!(verify_signature(SECRET, body, &good));
        assert!(!verify_signature(SECRET, body, "00112233"));
        assert!(!verify_signature(SECRET, body, "not hex at all"));
        assert!(!verify_signature("other-secret", body, &good));
    }
}

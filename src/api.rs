//! REST API Server for the payments agent runtime
//!
//! Exposes the workflow engine and session quotas via HTTP endpoints
//! Integrates with frontend UI

use axum::{
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::engine::WorkflowEngine;
use crate::error::AgentError;
use crate::models::{value_truthy, ExecutionState, WorkflowStatus};
use crate::session::{Metric, SessionStore};

/// =============================
/// Request Models
/// =============================

#[derive(Debug, Deserialize)]
pub struct ChatIn {
    #[serde(rename = "sessionId")]
    pub session_id: Option<String>,
    pub message: String,
    /// Optional caller hints: {customerId, from, to, currency}
    pub extras: Option<Map<String, Value>>,
}

#[derive(Debug, Deserialize)]
pub struct ApprovalIn {
    #[serde(rename = "approvalId")]
    pub approval_id: String,
    pub decision: String,
    /// Last known state for a stateless resume. The stored snapshot is
    /// used when this is omitted.
    #[serde(rename = "lastState")]
    pub last_state: Option<ExecutionState>,
}

#[derive(Debug, Deserialize)]
pub struct UpgradeIn {
    #[serde(rename = "sessionId")]
    pub session_id: String,
    #[serde(rename = "accessKey")]
    pub access_key: String,
}

#[derive(Debug, Deserialize)]
pub struct SessionQuery {
    #[serde(rename = "sessionId")]
    pub session_id: String,
}

/// =============================
/// API State
/// =============================

#[derive(Clone)]
pub struct ApiState {
    pub engine: Arc<WorkflowEngine>,
    pub sessions: Arc<SessionStore>,
}

/// =============================
/// Input & Message Shaping
/// =============================

/// Folds caller hints into the text the planner sees.
fn compose_input(message: &str, extras: Option<&Map<String, Value>>) -> String {
    let Some(extras) = extras else {
        return message.to_string();
    };

    let mut hints = Vec::new();
    if let Some(customer_id) = extras.get("customerId").filter(|v| !v.is_null()) {
        hints.push(format!("customerId={}", render_hint(customer_id)));
    }
    if let Some(from) = extras.get("from").filter(|v| value_truthy(v)) {
        hints.push(format!("from={}", render_hint(from)));
    }
    if let Some(to) = extras.get("to").filter(|v| value_truthy(v)) {
        hints.push(format!("to={}", render_hint(to)));
    }
    if let Some(currency) = extras.get("currency").filter(|v| value_truthy(v)) {
        hints.push(format!("fxBase={}", render_hint(currency)));
    }

    if hints.is_empty() {
        message.to_string()
    } else {
        format!("{}\n\n[context: {}]", message, hints.join(", "))
    }
}

fn render_hint(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn summary_text(state: &ExecutionState) -> Option<String> {
    state
        .result
        .as_ref()
        .and_then(|result| result.get("summary"))
        .and_then(Value::as_str)
        .map(str::to_string)
}

/// Rough token estimate for quota accounting: four bytes per token, rounded up.
fn approx_tokens(text: &str) -> i64 {
    ((text.len() + 3) / 4) as i64
}

/// One chat-shaped assistant message built from a terminal state. The
/// full state rides along as `resume` on chat responses so the client
/// can hand it back later with an approval decision.
fn assistant_message(
    state: &ExecutionState,
    content: String,
    include_resume: bool,
) -> crate::Result<Value> {
    let mut pending = match state.status {
        WorkflowStatus::Ok => None,
        _ => state.pending_approval.clone(),
    };
    // Resume blobs trimmed by the client may drop the nested id.
    if let (Some(pending), Some(id)) = (pending.as_mut(), &state.approval_id) {
        if pending.approval_id.is_empty() {
            pending.approval_id = id.clone();
        }
    }

    let mut message = json!({
        "id": uuid::Uuid::new_v4().to_string(),
        "role": "assistant",
        "content": content,
        "trace": state.trace,
        "tool_calls": state.tool_calls,
        "pending_approval": pending,
        "notifications": state.notifications,
        "ts": chrono::Utc::now().to_rfc3339(),
    });
    if include_resume {
        message["resume"] = serde_json::to_value(state)?;
    }
    Ok(message)
}

/// =============================
/// Error Mapping
/// =============================

/// Maps runtime errors onto the HTTP envelope the frontend expects.
fn error_response(error: AgentError) -> (StatusCode, Json<Value>) {
    match error {
        AgentError::UnknownSession(_) => (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "code": "unknown_session" })),
        ),
        AgentError::RateLimited {
            metric,
            retry_after_secs,
        } => (
            StatusCode::TOO_MANY_REQUESTS,
            Json(json!({
                "code": "rate_limited",
                "where": "session",
                "metric": metric,
                "retryAfterSec": retry_after_secs,
            })),
        ),
        AgentError::InvalidAccessKey(_) => (
            StatusCode::BAD_REQUEST,
            Json(json!({ "detail": "invalid access key" })),
        ),
        AgentError::ApprovalNotFound(_) => (
            StatusCode::NOT_FOUND,
            Json(json!({ "detail": "approval not found" })),
        ),
        AgentError::InvalidDecision(decision) => (
            StatusCode::BAD_REQUEST,
            Json(json!({ "detail": format!("invalid decision: {}", decision) })),
        ),
        other => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "detail": other.to_string() })),
        ),
    }
}

/// =============================
/// Health Endpoint
/// =============================

async fn health() -> Json<Value> {
    Json(json!({ "ok": true }))
}

/// =============================
/// Chat Endpoint
/// =============================

async fn chat(
    State(state): State<ApiState>,
    Json(body): Json<ChatIn>,
) -> (StatusCode, Json<Value>) {
    info!("Received chat request: {}", body.message);

    let session_id = body
        .session_id
        .as_deref()
        .map(str::trim)
        .filter(|sid| !sid.is_empty())
        .map(str::to_string);

    // Each request costs one unit up front, before any planning runs.
    if let Some(sid) = &session_id {
        if let Err(error) = state.sessions.bump(sid, Metric::Requests, 1).await {
            return error_response(error);
        }
        if let Err(error) = state.sessions.touch(sid).await {
            return error_response(error);
        }
    }

    let input = compose_input(&body.message, body.extras.as_ref());
    let extras = body.extras.unwrap_or_default();

    let outcome = match state.engine.invoke(&input, Vec::new(), extras).await {
        Ok(outcome) => outcome,
        Err(error) => return error_response(error),
    };

    // Tool usage is charged by how many calls the workflow actually made.
    if let Some(sid) = &session_id {
        let count = outcome.tool_calls.len() as i64;
        if let Err(error) = state.sessions.bump(sid, Metric::Tools, count).await {
            return error_response(error);
        }
    }

    let content = summary_text(&outcome).unwrap_or_else(|| {
        let raw = outcome
            .result
            .as_ref()
            .map(Value::to_string)
            .unwrap_or_else(|| "null".to_string());
        format!("Here's what I found:\n\n```json\n{}\n```", raw)
    });

    // Token cost approximates the response length, charged after composition.
    if let Some(sid) = &session_id {
        if let Err(error) = state
            .sessions
            .bump(sid, Metric::Tokens, approx_tokens(&content))
            .await
        {
            return error_response(error);
        }
    }

    match assistant_message(&outcome, content, true) {
        Ok(message) => (StatusCode::OK, Json(message)),
        Err(error) => error_response(error),
    }
}

/// =============================
/// Approval Endpoint
/// =============================

async fn approval(
    State(state): State<ApiState>,
    Json(body): Json<ApprovalIn>,
) -> (StatusCode, Json<Value>) {
    info!(
        approval_id = %body.approval_id,
        decision = %body.decision,
        "Received approval decision"
    );

    let outcome = match state
        .engine
        .resolve_approval(&body.approval_id, &body.decision, body.last_state)
        .await
    {
        Ok(outcome) => outcome,
        Err(error) => return error_response(error),
    };

    let content = summary_text(&outcome).unwrap_or_else(|| "Action handled.".to_string());
    match assistant_message(&outcome, content, false) {
        Ok(message) => (StatusCode::OK, Json(message)),
        Err(error) => error_response(error),
    }
}

/// =============================
/// Session Endpoints
/// =============================

async fn session_start(
    State(state): State<ApiState>,
    headers: HeaderMap,
) -> (StatusCode, Json<Value>) {
    let ip = headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .unwrap_or("")
        .trim()
        .to_string();
    let user_agent = headers
        .get("user-agent")
        .and_then(|value| value.to_str().ok())
        .unwrap_or("")
        .to_string();

    match state.sessions.start_session(&ip, &user_agent).await {
        Ok(profile) => (
            StatusCode::OK,
            Json(json!({
                "sessionId": profile.session_id,
                "tier": profile.tier,
                "limits": profile.limits,
            })),
        ),
        Err(error) => error_response(error),
    }
}

async fn session_upgrade(
    State(state): State<ApiState>,
    Json(body): Json<UpgradeIn>,
) -> (StatusCode, Json<Value>) {
    match state
        .sessions
        .upgrade(&body.session_id, &body.access_key)
        .await
    {
        Ok(profile) => (
            StatusCode::OK,
            Json(json!({
                "sessionId": profile.session_id,
                "tier": profile.tier,
                "limits": profile.limits,
            })),
        ),
        Err(error) => error_response(error),
    }
}

async fn session_limits(
    State(state): State<ApiState>,
    Query(query): Query<SessionQuery>,
) -> (StatusCode, Json<Value>) {
    match state.sessions.get(&query.session_id).await {
        Ok(Some(profile)) => (
            StatusCode::OK,
            Json(json!({
                "sessionId": profile.session_id,
                "tier": profile.tier,
                "limits": profile.limits,
            })),
        ),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(json!({ "detail": "unknown session" })),
        ),
        Err(error) => error_response(error),
    }
}

async fn session_usage(
    State(state): State<ApiState>,
    Query(query): Query<SessionQuery>,
) -> (StatusCode, Json<Value>) {
    match state.sessions.live_usage(&query.session_id).await {
        Ok(usage) => match serde_json::to_value(&usage) {
            Ok(value) => (StatusCode::OK, Json(value)),
            Err(error) => error_response(error.into()),
        },
        Err(error) => error_response(error),
    }
}

/// =============================
/// Router
/// =============================

pub fn create_router(engine: Arc<WorkflowEngine>, sessions: Arc<SessionStore>) -> Router {
    let state = ApiState { engine, sessions };

    Router::new()
        .route("/health", get(health))
        .route("/chat", post(chat))
        .route("/workflow/approval", post(approval))
        .route("/session/start", post(session_start))
        .route("/session/upgrade", post(session_upgrade))
        .route("/session/limits", get(session_limits))
        .route("/session/usage", get(session_usage))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// =============================
/// Server Startup
/// =============================

pub async fn start_server(
    engine: Arc<WorkflowEngine>,
    sessions: Arc<SessionStore>,
    port: u16,
) -> std::result::Result<(), Box<dyn std::error::Error>> {
    let router = create_router(engine, sessions);

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port)).await?;

    info!("API Server listening on http://0.0.0.0:{}", port);
    info!("Local: http://127.0.0.1:{}", port);

    axum::serve(listener, router).await?;

    Ok(())
}

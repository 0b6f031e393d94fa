//! MCP node HTTP transport
//!
//! A small Streamable-HTTP style endpoint at `/mcp` that keeps its sessions in
//! process memory, which is exactly the state the affinity filter exists to
//! protect. `POST` carries JSON-RPC, `GET` opens the session's event stream
//! and `DELETE` ends the session on this instance.

use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Request, State},
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode},
    middleware::{self, Next},
    response::{
        sse::{Event, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use futures::Stream;
use serde_json::{json, Value};
use tokio::sync::RwLock;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::affinity::{session_affinity, SessionAffinityFilter, DEFAULT_SESSION_HEADER};
use crate::types::OwnerId;

use super::types::{
    JsonRpcRequest, JsonRpcResponse, INTERNAL_ERROR, METHOD_NOT_FOUND, SESSION_NOT_FOUND,
    SESSION_REQUIRED,
};

/// Route of the protocol endpoint
pub const MCP_PATH: &str = "/mcp";

/// Response header naming the instance that produced the response
pub const INSTANCE_HEADER: &str = "x-mcp-instance";

pub const PROTOCOL_VERSION: &str = "2025-03-26";

const DEFAULT_HEARTBEAT: Duration = Duration::from_secs(15);

#[derive(Debug, Clone)]
pub struct NodeSession {
    pub created_at: DateTime<Utc>,
    pub client: Option<String>,
}

/// Shared state for node handlers
#[derive(Clone)]
pub struct NodeState {
    owner_id: OwnerId,
    sessions: Arc<RwLock<HashMap<String, NodeSession>>>,
    affinity: Option<Arc<SessionAffinityFilter>>,
    session_header: HeaderName,
    heartbeat: Duration,
}

impl NodeState {
    pub fn new(owner_id: OwnerId) -> Self {
        Self {
            owner_id,
            sessions: Arc::new(RwLock::new(HashMap::new())),
            affinity: None,
            session_header: HeaderName::from_static(DEFAULT_SESSION_HEADER),
            heartbeat: DEFAULT_HEARTBEAT,
        }
    }

    /// Claim new sessions through `filter` and route requests with it
    pub fn with_affinity(mut self, filter: Arc<SessionAffinityFilter>) -> Self {
        self.session_header = filter.session_header().clone();
        self.affinity = Some(filter);
        self
    }

    pub fn with_heartbeat(mut self, heartbeat: Duration) -> Self {
        self.heartbeat = heartbeat;
        self
    }

    pub async fn has_session(&self, session_id: &str) -> bool {
        self.sessions.read().await.contains_key(session_id)
    }

    fn session_id(&self, headers: &HeaderMap) -> Option<String> {
        headers
            .get(&self.session_header)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map(str::to_string)
    }
}

/// Create the node router, with the affinity filter in front when configured
pub fn node_router(state: NodeState) -> Router {
    let affinity = state.affinity.clone();

    let router = Router::new()
        .route(
            MCP_PATH,
            post(handle_mcp_post).get(handle_mcp_get).delete(handle_mcp_delete),
        )
        .route("/health", get(handle_health))
        .layer(middleware::from_fn_with_state(state.clone(), instance_header));

    // Outside the instance tag, so forwarded responses keep the owner's tag
    let router = match affinity {
        Some(filter) => router.layer(middleware::from_fn_with_state(filter, session_affinity)),
        None => router,
    };

    router
        .fallback(fallback_handler)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Handle POST /mcp
async fn handle_mcp_post(
    State(state): State<NodeState>,
    headers: HeaderMap,
    Json(request): Json<JsonRpcRequest>,
) -> Response {
    tracing::debug!(method = %request.method, id = ?request.id, "MCP request received");

    let id = request.id.clone().unwrap_or(Value::Null);
    if request.method == "initialize" {
        return initialize(&state, id, &request).await;
    }

    let Some(session_id) = state.session_id(&headers) else {
        return rpc_response(
            StatusCode::BAD_REQUEST,
            JsonRpcResponse::error(id, SESSION_REQUIRED, "Missing session id"),
        );
    };
    if !state.has_session(&session_id).await {
        tracing::debug!(session_id = %session_id, "Unknown session");
        return rpc_response(
            StatusCode::NOT_FOUND,
            JsonRpcResponse::error(id, SESSION_NOT_FOUND, "Session not found"),
        );
    }

    if request.is_notification() {
        return (StatusCode::ACCEPTED, "").into_response();
    }

    let response = match request.method.as_str() {
        "ping" => JsonRpcResponse::success(id, json!({})),
        other => JsonRpcResponse::error(id, METHOD_NOT_FOUND, format!("Method not found: {}", other)),
    };
    rpc_response(StatusCode::OK, response)
}

async fn initialize(state: &NodeState, id: Value, request: &JsonRpcRequest) -> Response {
    let session_id = Uuid::new_v4().to_string();
    let client = request
        .params
        .as_ref()
        .and_then(|p| p.pointer("/clientInfo/name"))
        .and_then(Value::as_str)
        .map(str::to_string);

    // Visible locally before siblings can route to it
    state.sessions.write().await.insert(
        session_id.clone(),
        NodeSession {
            created_at: Utc::now(),
            client: client.clone(),
        },
    );

    if let Some(filter) = &state.affinity {
        if let Err(e) = filter.claim_local(&session_id).await {
            tracing::error!(session_id = %session_id, error = %e, "Failed to claim new session");
            state.sessions.write().await.remove(&session_id);
            return rpc_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                JsonRpcResponse::error(id, INTERNAL_ERROR, "Could not register session"),
            );
        }
    }

    tracing::info!(session_id = %session_id, client = ?client, "Session created");

    let result = json!({
        "protocolVersion": PROTOCOL_VERSION,
        "capabilities": {},
        "serverInfo": {
            "name": "mcp-affinity-node",
            "version": env!("CARGO_PKG_VERSION"),
            "instance": state.owner_id.as_str(),
        },
    });
    let mut response = rpc_response(StatusCode::OK, JsonRpcResponse::success(id, result));
    if let Ok(value) = HeaderValue::from_str(&session_id) {
        response.headers_mut().insert(state.session_header.clone(), value);
    }
    response
}

/// Handle GET /mcp: the session's event stream
async fn handle_mcp_get(State(state): State<NodeState>, headers: HeaderMap) -> Response {
    let Some(session_id) = state.session_id(&headers) else {
        return json_error(StatusCode::BAD_REQUEST, "Missing session id");
    };
    if !state.has_session(&session_id).await {
        return json_error(StatusCode::NOT_FOUND, "Session not found");
    }

    tracing::debug!(session_id = %session_id, "Opening event stream");
    Sse::new(event_stream(state, session_id)).into_response()
}

/// `ready` naming this instance, then heartbeats until the session ends
fn event_stream(
    state: NodeState,
    session_id: String,
) -> impl Stream<Item = Result<Event, Infallible>> {
    async_stream::stream! {
        let ready = json!({ "instance": state.owner_id.as_str(), "sessionId": session_id });
        yield Ok::<_, Infallible>(Event::default().event("ready").data(ready.to_string()));

        let mut ticker = tokio::time::interval(state.heartbeat);
        ticker.tick().await;
        let mut sequence: u64 = 0;
        loop {
            ticker.tick().await;
            if !state.has_session(&session_id).await {
                tracing::debug!(session_id = %session_id, "Session ended, closing event stream");
                break;
            }
            sequence += 1;
            yield Ok(Event::default().event("heartbeat").data(sequence.to_string()));
        }
    }
}

/// Handle DELETE /mcp: forget the session on this instance
async fn handle_mcp_delete(State(state): State<NodeState>, headers: HeaderMap) -> Response {
    let Some(session_id) = state.session_id(&headers) else {
        return json_error(StatusCode::BAD_REQUEST, "Missing session id");
    };

    match state.sessions.write().await.remove(&session_id) {
        Some(session) => {
            let lifetime = Utc::now() - session.created_at;
            tracing::info!(
                session_id = %session_id,
                client = ?session.client,
                lifetime_secs = lifetime.num_seconds(),
                "Session terminated"
            );
            StatusCode::NO_CONTENT.into_response()
        }
        None => json_error(StatusCode::NOT_FOUND, "Session not found"),
    }
}

async fn handle_health(State(state): State<NodeState>) -> Response {
    let sessions = state.sessions.read().await;
    let active: Vec<Value> = sessions
        .values()
        .map(|session| {
            json!({
                "client": session.client,
                "createdAt": session.created_at.to_rfc3339(),
            })
        })
        .collect();

    Json(json!({
        "status": "ok",
        "instance": state.owner_id.as_str(),
        "sessions": sessions.len(),
        "activeSessions": active,
    }))
    .into_response()
}

/// Tag every response produced here with this instance's id
async fn instance_header(State(state): State<NodeState>, request: Request, next: Next) -> Response {
    let mut response = next.run(request).await;
    if let Ok(value) = HeaderValue::from_str(state.owner_id.as_str()) {
        response
            .headers_mut()
            .insert(HeaderName::from_static(INSTANCE_HEADER), value);
    }
    response
}

async fn fallback_handler(request: Request) -> impl IntoResponse {
    tracing::warn!("Unmatched route: {}", request.uri());

    (
        StatusCode::NOT_FOUND,
        [("content-type", "application/json")],
        r#"{"error": "Not found", "hint": "MCP endpoint is at /mcp"}"#,
    )
}

fn rpc_response(status: StatusCode, body: JsonRpcResponse) -> Response {
    (status, Json(body)).into_response()
}

fn json_error(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}

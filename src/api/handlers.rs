// API request handlers

use axum::{
    body::Bytes,
    extract::{Query, State},
    http::{HeaderMap, Method, Uri},
    response::{IntoResponse, Json, Response},
};
use serde_json::{json, Value};
use std::collections::HashMap;

use super::AppState;
use crate::proxy::orchestrator::ClientRequest;

fn client_request(
    method: Method,
    uri: &Uri,
    query: HashMap<String, String>,
    headers: HeaderMap,
    body: Bytes,
) -> ClientRequest {
    ClientRequest {
        method,
        path: uri.path().to_string(),
        query,
        headers,
        body,
    }
}

// Root endpoint
pub async fn root() -> Json<Value> {
    Json(json!({
        "message": "Gemini Relay",
        "endpoints": [
            "POST /v1/chat/completions",
            "GET /v1/models",
            "GET /v1beta/models",
            "POST /v1beta/models/{model}:generateContent",
            "POST /v1beta/models/{model}:streamGenerateContent",
            "GET /api/status",
            "GET /ws"
        ]
    }))
}

pub async fn health(State(state): State<AppState>) -> Json<Value> {
    let registry = state.orchestrator.registry();
    Json(json!({
        "status": "ok",
        "live_channels": registry.live_channel_count(),
        "pending_requests": registry.pending_requests()
    }))
}

// OpenAI compatible endpoints
pub async fn openai_models(
    State(state): State<AppState>,
    method: Method,
    uri: Uri,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Response {
    let request = client_request(method, &uri, query, headers, Bytes::new());
    state.orchestrator.list_openai_models(request).await
}

pub async fn chat_completions(
    State(state): State<AppState>,
    method: Method,
    uri: Uri,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let request = client_request(method, &uri, query, headers, body);
    state.orchestrator.handle_openai_request(request).await
}

// Native Gemini endpoints
pub async fn native_models(
    State(state): State<AppState>,
    method: Method,
    uri: Uri,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Response {
    let request = client_request(method, &uri, query, headers, Bytes::new());
    state.orchestrator.list_native_models(request).await
}

pub async fn native_handler(
    State(state): State<AppState>,
    method: Method,
    uri: Uri,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    tracing::debug!("Native request: {} {}", method, uri.path());
    let request = client_request(method, &uri, query, headers, body);
    state.orchestrator.handle_native_request(request).await
}

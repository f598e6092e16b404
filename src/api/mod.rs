// HTTP API Server module

use anyhow::Result;
use axum::{
    body::Body,
    extract::State,
    http::{header, Method, Request},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{any, get, post},
    Router,
};
use once_cell::sync::OnceCell;
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::oneshot;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

pub mod channel;
mod handlers;
pub mod management;
pub mod model_router;
pub mod streaming;

use crate::error::ProxyError;
use crate::proxy::orchestrator::Orchestrator;

static SERVER_HANDLE: OnceCell<RwLock<Option<oneshot::Sender<()>>>> = OnceCell::new();

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    pub channel_token: Option<String>,
}

impl AppState {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        Self {
            orchestrator,
            channel_token: None,
        }
    }

    pub fn with_channel_token(mut self, token: Option<String>) -> Self {
        self.channel_token = token;
        self
    }
}

fn query_param(request: &Request<Body>, name: &str) -> Option<String> {
    request.uri().query().and_then(|query| {
        query
            .split('&')
            .filter_map(|pair| pair.split_once('='))
            .find(|(key, _)| *key == name)
            .map(|(_, value)| value.to_string())
    })
}

/// Pull the client key from `Authorization`, `x-goog-api-key` or `?key=`.
fn request_api_key(request: &Request<Body>) -> Option<String> {
    let headers = request.headers();
    if let Some(auth) = headers.get(header::AUTHORIZATION).and_then(|v| v.to_str().ok()) {
        return Some(auth.strip_prefix("Bearer ").unwrap_or(auth).trim().to_string());
    }
    if let Some(key) = headers.get("x-goog-api-key").and_then(|v| v.to_str().ok()) {
        return Some(key.trim().to_string());
    }
    query_param(request, "key")
}

/// API Key authentication middleware
async fn auth_middleware(State(state): State<AppState>, request: Request<Body>, next: Next) -> Response {
    let api_keys = state.orchestrator.shared_config().read().api_keys.clone();

    // If no API keys configured, allow all requests
    if api_keys.is_empty() {
        return next.run(request).await;
    }

    match request_api_key(&request) {
        Some(key) if api_keys.contains(&key) => next.run(request).await,
        _ => {
            tracing::warn!("Rejected {} {}: invalid API key", request.method(), request.uri().path());
            ProxyError::Auth("Invalid API key".to_string()).into_response()
        }
    }
}

/// Gate for `/ws`: the channel token (`?token=` or any API-key carrier) or a
/// configured API key. Open only when neither is configured.
async fn channel_auth_middleware(State(state): State<AppState>, request: Request<Body>, next: Next) -> Response {
    let api_keys = state.orchestrator.shared_config().read().api_keys.clone();
    if state.channel_token.is_none() && api_keys.is_empty() {
        return next.run(request).await;
    }

    let credential = query_param(&request, "token").or_else(|| request_api_key(&request));
    let accepted = credential
        .map(|c| state.channel_token.as_deref() == Some(c.as_str()) || api_keys.contains(&c))
        .unwrap_or(false);
    if accepted {
        next.run(request).await
    } else {
        tracing::warn!("Rejected upstream channel connection: invalid token");
        ProxyError::Auth("Invalid channel token".to_string()).into_response()
    }
}

/// Build the full router. Split out of [`start_server`] so tests can drive it.
pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any);

    // Routes that require API key authentication
    let protected_routes = Router::new()
        .route("/v1/models", get(handlers::openai_models))
        .route("/v1/chat/completions", post(handlers::chat_completions))
        .route("/v1beta/models", get(handlers::native_models))
        .route("/v1beta/*path", any(handlers::native_handler))
        .route("/v1/*path", any(handlers::native_handler))
        .route("/api/status", get(management::get_status))
        .route("/api/switch-account", post(management::switch_account))
        .route("/api/streaming-mode", post(management::set_streaming_mode))
        .layer(middleware::from_fn_with_state(state.clone(), auth_middleware));

    // The automation layer authenticates with its own token
    let channel_routes = Router::new()
        .route("/ws", get(channel::channel_ws))
        .layer(middleware::from_fn_with_state(state.clone(), channel_auth_middleware));

    // Routes that don't require authentication
    let public_routes = Router::new()
        .route("/", get(handlers::root))
        .route("/health", get(handlers::health));

    Router::new()
        .merge(protected_routes)
        .merge(channel_routes)
        .merge(public_routes)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

pub async fn start_server(state: AppState, host: &str, port: u16) -> Result<()> {
    let host = if host.is_empty() { "0.0.0.0" } else { host };
    let addr = format!("{}:{}", host, port);

    let app = router(state);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("API server listening on {}", addr);

    let (tx, rx) = oneshot::channel::<()>();

    SERVER_HANDLE
        .get_or_init(|| RwLock::new(None))
        .write()
        .replace(tx);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            rx.await.ok();
        })
        .await?;

    Ok(())
}

pub async fn stop_server() -> Result<()> {
    if let Some(lock) = SERVER_HANDLE.get() {
        if let Some(tx) = lock.write().take() {
            let _ = tx.send(());
            tracing::info!("API server stopped");
        }
    }
    Ok(())
}

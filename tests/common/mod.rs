// Shared fixtures: an in-process automation channel and a scripted session manager

#![allow(dead_code)]

use async_trait::async_trait;
use axum::response::Response;
use http_body_util::BodyExt;
use parking_lot::{Mutex, RwLock};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use gemini_relay::auth::StaticAccountDirectory;
use gemini_relay::config::AppConfig;
use gemini_relay::error::SessionError;
use gemini_relay::proxy::orchestrator::Orchestrator;
use gemini_relay::proxy::registry::ConnectionRegistry;
use gemini_relay::proxy::rotation::Rotator;
use gemini_relay::proxy::session::SessionManager;

/// Session manager that always succeeds and records every switch.
pub struct FakeSessions {
    current: AtomicUsize,
    calls: Mutex<Vec<usize>>,
}

impl FakeSessions {
    pub fn new(current: usize) -> Arc<Self> {
        Arc::new(Self {
            current: AtomicUsize::new(current),
            calls: Mutex::new(Vec::new()),
        })
    }

    pub fn calls(&self) -> Vec<usize> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl SessionManager for FakeSessions {
    async fn ensure_channel_for(&self, index: usize) -> Result<(), SessionError> {
        self.calls.lock().push(index);
        self.current.store(index, Ordering::SeqCst);
        Ok(())
    }

    fn current_index(&self) -> usize {
        self.current.load(Ordering::SeqCst)
    }
}

/// One scripted upstream reply, routed after `after`.
pub struct Reply {
    pub after: Duration,
    pub frame: String,
}

pub fn now(frame: String) -> Reply {
    Reply {
        after: Duration::ZERO,
        frame,
    }
}

pub fn later(after: Duration, frame: String) -> Reply {
    Reply { after, frame }
}

pub fn headers(id: &str, status: u16) -> String {
    json!({
        "request_id": id,
        "event_type": "response_headers",
        "status": status,
        "headers": {"content-type": "text/event-stream"}
    })
    .to_string()
}

pub fn chunk(id: &str, data: &str) -> String {
    json!({"request_id": id, "event_type": "chunk", "data": data}).to_string()
}

pub fn close(id: &str) -> String {
    json!({"request_id": id, "event_type": "stream_close"}).to_string()
}

pub fn error(id: &str, status: u16, message: &str) -> String {
    json!({"request_id": id, "event_type": "error", "status": status, "message": message}).to_string()
}

/// A complete non-streaming reply carrying `body`.
pub fn full_reply(id: &str, body: &str) -> Vec<Reply> {
    vec![now(chunk(id, body)), now(close(id))]
}

pub fn native_text(text: &str) -> String {
    json!({
        "candidates": [{
            "content": {"role": "model", "parts": [{"text": text}]},
            "finishReason": "STOP"
        }]
    })
    .to_string()
}

type Script = dyn Fn(&Value, usize) -> Vec<Reply> + Send + Sync;

pub struct Harness {
    pub orchestrator: Arc<Orchestrator>,
    pub registry: Arc<ConnectionRegistry>,
    pub rotator: Arc<Rotator>,
    pub sessions: Arc<FakeSessions>,
    pub forwarded: Arc<Mutex<Vec<Value>>>,
    pub cancels: Arc<Mutex<Vec<String>>>,
}

impl Harness {
    pub fn forwarded(&self) -> Vec<Value> {
        self.forwarded.lock().clone()
    }

    pub fn cancels(&self) -> Vec<String> {
        self.cancels.lock().clone()
    }
}

/// Wire an orchestrator to a fake automation channel driven by `script`.
///
/// The script sees each forwarded request frame and how many frames came
/// before it.
pub fn harness(
    config: AppConfig,
    accounts: &[usize],
    script: impl Fn(&Value, usize) -> Vec<Reply> + Send + Sync + 'static,
) -> Harness {
    let registry = Arc::new(ConnectionRegistry::new());
    let sessions = FakeSessions::new(accounts.first().copied().unwrap_or(0));
    let rotator = Arc::new(Rotator::new(
        sessions.clone(),
        Arc::new(StaticAccountDirectory::new(accounts.iter().copied())),
    ));
    let orchestrator = Arc::new(Orchestrator::new(
        registry.clone(),
        rotator.clone(),
        Arc::new(RwLock::new(config)),
    ));

    let forwarded = Arc::new(Mutex::new(Vec::new()));
    let cancels = Arc::new(Mutex::new(Vec::new()));
    let script: Arc<Script> = Arc::new(script);

    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    registry.add_channel(tx);
    {
        let registry = registry.clone();
        let forwarded = forwarded.clone();
        let cancels = cancels.clone();
        tokio::spawn(async move {
            let mut seen = 0;
            while let Some(frame) = rx.recv().await {
                let value: Value = serde_json::from_str(&frame).unwrap();
                if value["event_type"] == "cancel_request" {
                    cancels.lock().push(value["request_id"].as_str().unwrap().to_string());
                    continue;
                }
                forwarded.lock().push(value.clone());
                for reply in script(&value, seen) {
                    let registry = registry.clone();
                    if reply.after.is_zero() {
                        registry.route_inbound(&reply.frame);
                    } else {
                        tokio::spawn(async move {
                            tokio::time::sleep(reply.after).await;
                            registry.route_inbound(&reply.frame);
                        });
                    }
                }
                seen += 1;
            }
        });
    }

    Harness {
        orchestrator,
        registry,
        rotator,
        sessions,
        forwarded,
        cancels,
    }
}

pub fn request_id(frame: &Value) -> String {
    frame["request_id"].as_str().unwrap().to_string()
}

pub async fn body_text(response: Response) -> String {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    String::from_utf8(bytes.to_vec()).unwrap()
}

/// Split an SSE body into its event blocks.
pub fn sse_events(body: &str) -> Vec<String> {
    body.split("\n\n")
        .filter(|event| !event.trim().is_empty())
        .map(|event| event.to_string())
        .collect()
}

/// JSON payload of a single-line `data:` event.
pub fn event_json(event: &str) -> Value {
    serde_json::from_str(event.strip_prefix("data: ").unwrap()).unwrap()
}

// Request orchestrator - admission, dispatch with retry and response delivery

use axum::body::Body;
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

use super::queue::MessageQueue;
use super::registry::ConnectionRegistry;
use super::rotation::{RotationSnapshot, Rotator, SwitchOutcome};
use super::translator::{self, ChatCompletionRequest};
use super::{InboundMessage, ProxyRequest, UpstreamMode};
use crate::api::model_router;
use crate::api::streaming::{self, SseReframer};
use crate::auth::{describe_accounts, AccountInfo};
use crate::config::{AppConfig, SharedConfig, StreamingMode};
use crate::error::{ProxyError, QueueError, RotationError};

/// Headers never forwarded upstream.
const USER_ABORT_STATUS: u16 = 499;
const USER_ABORT_PHRASE: &str = "aborted by user";

const STRIPPED_REQUEST_HEADERS: &[&str] = &[
    "host",
    "connection",
    "keep-alive",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "content-length",
    "accept-encoding",
    "authorization",
    "x-goog-api-key",
    "cookie",
];

/// Upstream response headers that do not survive re-framing.
const STRIPPED_RESPONSE_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "transfer-encoding",
    "content-length",
    "content-encoding",
];

/// An inbound client call, already split from the HTTP layer.
#[derive(Debug, Clone)]
pub struct ClientRequest {
    pub method: Method,
    pub path: String,
    pub query: HashMap<String, String>,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// API dialect the client speaks.
#[derive(Debug, Clone)]
enum Dialect {
    Native,
    /// Carries the model id to echo back.
    OpenAi { model: String },
}

/// A classified request, ready to dispatch.
#[derive(Debug)]
struct Plan {
    proxy: ProxyRequest,
    dialect: Dialect,
    client_stream: bool,
    delivery: UpstreamMode,
}

/// Why a request could not be served.
#[derive(Debug)]
struct Failure {
    status: u16,
    message: String,
    /// The upstream itself reported the failure, nothing is left running.
    terminal: bool,
}

impl Failure {
    fn upstream(status: u16, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            terminal: true,
        }
    }

    fn local(status: u16, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            terminal: false,
        }
    }

    fn from_queue(err: QueueError, waited: Duration) -> Self {
        match err {
            QueueError::Timeout => Self::local(
                504,
                format!("no upstream message within {}s", waited.as_secs()),
            ),
            other => Self::local(500, other.to_string()),
        }
    }

    /// The automation layer reports a user-initiated abort as status 499 or
    /// with the `aborted by user` phrase. Other aborts are ordinary failures.
    fn is_user_abort(&self) -> bool {
        self.status == USER_ABORT_STATUS || self.message.to_ascii_lowercase().contains(USER_ABORT_PHRASE)
    }
}

/// Fully accumulated upstream reply.
#[derive(Debug, Default)]
struct Collected {
    status: u16,
    headers: HashMap<String, String>,
    body: String,
}

/// Removes the request's queue however the request ends, and tells the
/// automation layer to stop when the client left before the upstream finished.
struct RequestGuard {
    registry: Arc<ConnectionRegistry>,
    request_id: String,
    completed: bool,
}

impl RequestGuard {
    fn new(registry: Arc<ConnectionRegistry>, request_id: &str) -> Self {
        Self {
            registry,
            request_id: request_id.to_string(),
            completed: false,
        }
    }

    fn complete(&mut self) {
        self.completed = true;
    }
}

impl Drop for RequestGuard {
    fn drop(&mut self) {
        self.registry.destroy_queue(&self.request_id);
        if !self.completed {
            tracing::info!("[{}] Request abandoned before upstream finished, cancelling", self.request_id);
            self.registry.send_cancel(&self.request_id);
        }
    }
}

/// Items handed from a pump task to the response body.
enum Outbound {
    Data(Bytes),
    /// Last item. A usage rotation runs once everything before it was taken.
    Finished { rotate: bool },
}

fn streaming_body(mut rx: mpsc::Receiver<Outbound>, rotator: Arc<Rotator>) -> Body {
    let stream = async_stream::stream! {
        while let Some(item) = rx.recv().await {
            match item {
                Outbound::Data(bytes) => yield Ok::<Bytes, Infallible>(bytes),
                Outbound::Finished { rotate } => {
                    if rotate {
                        rotator.spawn_deferred_rotation();
                    }
                    break;
                }
            }
        }
    };
    Body::from_stream(stream)
}

fn complete_body(bytes: Bytes, rotate: bool, rotator: Arc<Rotator>) -> Body {
    let stream = async_stream::stream! {
        yield Ok::<Bytes, Infallible>(bytes);
        if rotate {
            rotator.spawn_deferred_rotation();
        }
    };
    Body::from_stream(stream)
}

fn build_response(status: u16, content_type: &str, body: Body) -> Response {
    let mut response = Response::new(body);
    *response.status_mut() = StatusCode::from_u16(status).unwrap_or(StatusCode::OK);
    if let Ok(value) = HeaderValue::from_str(content_type) {
        response.headers_mut().insert(header::CONTENT_TYPE, value);
    }
    response
}

fn unix_now() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Status endpoint payload.
#[derive(Debug, Clone, Serialize)]
pub struct RelayStatus {
    #[serde(flatten)]
    pub rotation: RotationSnapshot,
    pub current_account: String,
    pub streaming_mode: StreamingMode,
    pub live_channels: usize,
    pub pending_requests: usize,
    pub accounts: Vec<AccountInfo>,
}

/// Serves client requests over the shared upstream channel.
pub struct Orchestrator {
    registry: Arc<ConnectionRegistry>,
    rotator: Arc<Rotator>,
    config: SharedConfig,
}

impl Orchestrator {
    pub fn new(registry: Arc<ConnectionRegistry>, rotator: Arc<Rotator>, config: SharedConfig) -> Self {
        Self {
            registry,
            rotator,
            config,
        }
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn rotator(&self) -> &Arc<Rotator> {
        &self.rotator
    }

    pub fn shared_config(&self) -> &SharedConfig {
        &self.config
    }

    fn config(&self) -> AppConfig {
        self.config.read().clone()
    }

    pub fn status(&self) -> RelayStatus {
        let rotation = self.rotator.snapshot();
        RelayStatus {
            current_account: self.rotator.accounts().name_of(rotation.current_index),
            rotation,
            streaming_mode: self.config.read().streaming_mode,
            live_channels: self.registry.live_channel_count(),
            pending_requests: self.registry.pending_requests(),
            accounts: describe_accounts(self.rotator.accounts().as_ref()),
        }
    }

    /// Rotate to `index`, or to the next usable account.
    pub async fn switch_account(&self, index: Option<usize>) -> Result<SwitchOutcome, RotationError> {
        match index {
            Some(index) => self.rotator.switch_to_specific(index).await,
            None => self.rotator.switch_to_next().await,
        }
    }

    /// Refuse new work while rotating; bring the channel back if it is gone.
    async fn admit(&self) -> Result<(), ProxyError> {
        if self.rotator.state().is_system_busy() {
            return Err(ProxyError::Busy);
        }
        if self.registry.has_live_channel() {
            return Ok(());
        }
        match self.rotator.recover().await {
            Ok(true) => Ok(()),
            Ok(false) => Err(ProxyError::Busy),
            Err(e) => {
                tracing::error!("Channel recovery failed: {}", e);
                Err(ProxyError::TransportUnavailable(e.to_string()))
            }
        }
    }

    pub async fn handle_native_request(&self, request: ClientRequest) -> Response {
        if let Err(e) = self.admit().await {
            return e.into_response();
        }
        let config = self.config();
        let plan = plan_native(request, &config);
        self.execute(plan, config).await
    }

    pub async fn handle_openai_request(&self, request: ClientRequest) -> Response {
        if let Err(e) = self.admit().await {
            return e.into_response();
        }
        let config = self.config();
        match plan_openai(&request, &config) {
            Ok(plan) => self.execute(plan, config).await,
            Err(e) => {
                tracing::warn!("Rejecting chat completion: {}", e);
                e.into_response()
            }
        }
    }

    /// Native model listing, with pseudo-streaming twins under mix mode.
    pub async fn list_native_models(&self, request: ClientRequest) -> Response {
        match self.fetch_models(request).await {
            Ok(list) => axum::Json(list).into_response(),
            Err(e) => e.into_response(),
        }
    }

    pub async fn list_openai_models(&self, request: ClientRequest) -> Response {
        match self.fetch_models(request).await {
            Ok(list) => axum::Json(model_router::native_to_openai_models(&list, unix_now())).into_response(),
            Err(e) => e.into_response(),
        }
    }

    async fn fetch_models(&self, request: ClientRequest) -> Result<Value, ProxyError> {
        self.admit().await?;
        let config = self.config();
        let mut query = forwarded_query(&request.query);
        query.entry("pageSize".to_string()).or_insert_with(|| "1000".to_string());
        let proxy = ProxyRequest {
            request_id: uuid::Uuid::new_v4().to_string(),
            method: "GET".to_string(),
            path: "/v1beta/models".to_string(),
            headers: HashMap::new(),
            query_params: query,
            body: String::new(),
            streaming_mode: UpstreamMode::Fake,
            is_generative: false,
            requested_model: None,
            normalized_model: None,
        };

        let collected = self.fetch_complete(&proxy, &config).await?;
        self.rotator.record_success(false, &config);
        let mut list: Value = serde_json::from_str(&collected.body).map_err(|e| ProxyError::Upstream {
            status: 502,
            message: format!("model list is not JSON: {}", e),
        })?;
        if config.streaming_mode == StreamingMode::Mix {
            model_router::augment_native_models(&mut list);
        }
        Ok(list)
    }

    async fn execute(&self, plan: Plan, config: AppConfig) -> Response {
        tracing::info!(
            "[{}] {} {} (client stream: {}, delivery: {:?})",
            plan.proxy.request_id,
            plan.proxy.method,
            plan.proxy.path,
            plan.client_stream,
            plan.delivery
        );

        if !plan.client_stream {
            return self.deliver_complete(plan, config).await;
        }

        let request_id = plan.proxy.request_id.clone();
        let queue = match self.registry.create_queue(&request_id) {
            Ok(queue) => queue,
            Err(e) => return ProxyError::from(e).into_response(),
        };
        let guard = RequestGuard::new(self.registry.clone(), &request_id);
        let ctx = StreamContext {
            request_id,
            dialect: plan.dialect.clone(),
            is_generative: plan.proxy.is_generative,
            created: unix_now(),
            config,
            rotator: self.rotator.clone(),
        };

        match plan.delivery {
            UpstreamMode::Real => self.deliver_real(plan, ctx, queue, guard).await,
            UpstreamMode::Fake => self.deliver_fake(plan, ctx, queue, guard),
        }
    }

    /// Dispatch, wait for the whole upstream reply and account for failures.
    async fn fetch_complete(&self, proxy: &ProxyRequest, config: &AppConfig) -> Result<Collected, ProxyError> {
        let mut queue = self.registry.create_queue(&proxy.request_id)?;
        let mut guard = RequestGuard::new(self.registry.clone(), &proxy.request_id);

        let outcome = match dispatch(&self.registry, proxy, &mut queue, config).await {
            Ok(first) => collect(first, &mut queue, config.stream_idle_timeout()).await,
            Err(failure) => Err(failure),
        };
        match outcome {
            Ok(collected) => {
                guard.complete();
                Ok(collected)
            }
            Err(failure) => {
                if failure.terminal {
                    guard.complete();
                }
                let message = account_failure(&self.rotator, &proxy.request_id, &failure, config).await;
                Err(ProxyError::Upstream {
                    status: failure.status,
                    message,
                })
            }
        }
    }

    async fn deliver_complete(&self, plan: Plan, config: AppConfig) -> Response {
        let collected = match self.fetch_complete(&plan.proxy, &config).await {
            Ok(collected) => collected,
            Err(e) => return e.into_response(),
        };
        let rotate = self.rotator.record_success(plan.proxy.is_generative, &config);

        let (content_type, body) = match &plan.dialect {
            Dialect::Native => {
                let content_type = collected
                    .headers
                    .iter()
                    .find(|(k, _)| k.eq_ignore_ascii_case("content-type"))
                    .map(|(_, v)| v.clone())
                    .unwrap_or_else(|| "application/json".to_string());
                let body = if plan.proxy.is_generative {
                    translator::inline_images_to_markdown(&collected.body)
                } else {
                    collected.body
                };
                (content_type, body)
            }
            Dialect::OpenAi { model } => {
                let body = match translator::parse_native_response(&collected.body) {
                    Ok(response) => translator::native_to_openai_response(
                        &response,
                        &plan.proxy.request_id,
                        model,
                        unix_now(),
                    )
                    .to_string(),
                    Err(e) => {
                        tracing::warn!(
                            "[{}] Upstream body is not JSON, passing through: {}",
                            plan.proxy.request_id,
                            e
                        );
                        collected.body
                    }
                };
                ("application/json".to_string(), body)
            }
        };

        tracing::info!("[{}] Completed ({} bytes)", plan.proxy.request_id, body.len());
        build_response(
            collected.status,
            &content_type,
            complete_body(Bytes::from(body), rotate, self.rotator.clone()),
        )
    }

    /// Pass upstream chunks through as they arrive. Headers go out only once
    /// the first upstream message is in, so early failures can still be
    /// reported with a proper status.
    async fn deliver_real(
        &self,
        plan: Plan,
        ctx: StreamContext,
        mut queue: MessageQueue,
        mut guard: RequestGuard,
    ) -> Response {
        let first = match dispatch(&self.registry, &plan.proxy, &mut queue, &ctx.config).await {
            Ok(first) => first,
            Err(failure) => {
                if failure.terminal {
                    guard.complete();
                }
                let message = account_failure(&self.rotator, &ctx.request_id, &failure, &ctx.config).await;
                return ProxyError::Upstream {
                    status: failure.status,
                    message,
                }
                .into_response();
            }
        };

        let (status, upstream_headers, pending) = match first {
            InboundMessage::HeaderInfo { status, headers } => (status, headers, None),
            other => (200, HashMap::new(), Some(other)),
        };

        let (tx, rx) = mpsc::channel(32);
        let body = streaming_body(rx, self.rotator.clone());
        let dialect = ctx.dialect.clone();
        tokio::spawn(pump_real(ctx, queue, guard, pending, tx));

        let mut response = build_response(status, "text/event-stream", body);
        let headers = response.headers_mut();
        if let Dialect::Native = dialect {
            for (name, value) in &upstream_headers {
                if STRIPPED_RESPONSE_HEADERS.contains(&name.to_ascii_lowercase().as_str()) {
                    continue;
                }
                if let (Ok(name), Ok(value)) = (
                    HeaderName::from_bytes(name.as_bytes()),
                    HeaderValue::from_str(value),
                ) {
                    headers.insert(name, value);
                }
            }
        }
        headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
        response
    }

    /// Open the stream right away and keep it alive with heartbeats while the
    /// upstream reply is accumulated.
    fn deliver_fake(
        &self,
        plan: Plan,
        ctx: StreamContext,
        queue: MessageQueue,
        guard: RequestGuard,
    ) -> Response {
        let (tx, rx) = mpsc::channel(32);
        let body = streaming_body(rx, self.rotator.clone());
        tokio::spawn(pump_fake(ctx, self.registry.clone(), plan.proxy, queue, guard, tx));

        let mut response = build_response(200, "text/event-stream", body);
        response
            .headers_mut()
            .insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
        response
    }
}

/// Send the request and wait for its first message, retrying on failure.
///
/// Every attempt reuses the request id. A user abort ends the loop at once.
async fn dispatch(
    registry: &ConnectionRegistry,
    proxy: &ProxyRequest,
    queue: &mut MessageQueue,
    config: &AppConfig,
) -> Result<InboundMessage, Failure> {
    let attempts = config.max_retries.max(1);
    let first_timeout = config.first_message_timeout();
    let frame = proxy.to_frame();
    let mut attempt = 1;

    loop {
        let failure = match registry.send_to_first_live(frame.clone()) {
            Err(e) => Failure::local(503, e.to_string()),
            Ok(()) => match queue.dequeue(Some(first_timeout)).await {
                Ok(InboundMessage::Error { status, message }) => Failure::upstream(status, message),
                Ok(InboundMessage::HeaderInfo { status, .. }) if status >= 400 => {
                    let body = drain_error_body(queue, config.stream_idle_timeout()).await;
                    Failure::upstream(status, body)
                }
                Ok(message) => return Ok(message),
                Err(e) => Failure::from_queue(e, first_timeout),
            },
        };

        if failure.is_user_abort() {
            tracing::info!("[{}] Aborted by user: {}", proxy.request_id, failure.message);
            return Err(failure);
        }
        if attempt >= attempts {
            tracing::warn!(
                "[{}] Giving up after {} attempt(s): {} {}",
                proxy.request_id,
                attempt,
                failure.status,
                failure.message
            );
            return Err(failure);
        }
        tracing::warn!(
            "[{}] Attempt {}/{} failed ({}): {}, retrying in {}ms",
            proxy.request_id,
            attempt,
            attempts,
            failure.status,
            failure.message,
            config.retry_delay_ms
        );
        tokio::time::sleep(config.retry_delay()).await;
        attempt += 1;
    }
}

/// Body of an upstream reply whose headers already carry an error status.
async fn drain_error_body(queue: &mut MessageQueue, idle: Duration) -> String {
    let mut body = String::new();
    while let Ok(message) = queue.dequeue(Some(idle)).await {
        match message {
            InboundMessage::Chunk { data } => body.push_str(&data),
            InboundMessage::Error { message, .. } => {
                body.push_str(&message);
                break;
            }
            InboundMessage::StreamEnd => break,
            InboundMessage::HeaderInfo { .. } => {}
        }
    }
    if body.is_empty() {
        body.push_str("upstream returned an error status");
    }
    body
}

async fn collect(first: InboundMessage, queue: &mut MessageQueue, idle: Duration) -> Result<Collected, Failure> {
    let mut collected = Collected {
        status: 200,
        ..Collected::default()
    };
    let mut next = first;
    loop {
        match next {
            InboundMessage::HeaderInfo { status, headers } => {
                collected.status = status;
                collected.headers = headers;
            }
            InboundMessage::Chunk { data } => collected.body.push_str(&data),
            InboundMessage::StreamEnd => return Ok(collected),
            InboundMessage::Error { status, message } => return Err(Failure::upstream(status, message)),
        }
        next = queue
            .dequeue(Some(idle))
            .await
            .map_err(|e| Failure::from_queue(e, idle))?;
    }
}

/// Run failure accounting and build the client-facing message.
async fn account_failure(rotator: &Rotator, request_id: &str, failure: &Failure, config: &AppConfig) -> String {
    if failure.is_user_abort() {
        return failure.message.clone();
    }
    match rotator.handle_request_failure(failure.status, config).await {
        Some(notice) => {
            tracing::info!("[{}] {}", request_id, notice);
            format!("{} {}", failure.message, notice)
        }
        None => failure.message.clone(),
    }
}

/// Per-stream state shared by the pump tasks.
struct StreamContext {
    request_id: String,
    dialect: Dialect,
    is_generative: bool,
    created: i64,
    config: AppConfig,
    rotator: Arc<Rotator>,
}

impl StreamContext {
    fn heartbeat(&self) -> Bytes {
        match &self.dialect {
            Dialect::Native => streaming::native_heartbeat(),
            Dialect::OpenAi { model } => streaming::openai_heartbeat(&self.request_id, model, self.created),
        }
    }

    fn translate_chunk(&self, reframer: &mut SseReframer, data: &str) -> Vec<Bytes> {
        match &self.dialect {
            Dialect::Native => vec![Bytes::from(data.to_string())],
            Dialect::OpenAi { model } => reframer
                .push(data)
                .iter()
                .filter_map(|payload| {
                    streaming::translate_native_event(payload, &self.request_id, model, self.created)
                })
                .collect(),
        }
    }

    /// Leftover partial event and the end-of-stream sentinel.
    fn closing_frames(&self, reframer: &mut SseReframer) -> Vec<Bytes> {
        match &self.dialect {
            Dialect::Native => Vec::new(),
            Dialect::OpenAi { model } => {
                let mut frames: Vec<Bytes> = reframer
                    .finish()
                    .and_then(|payload| {
                        streaming::translate_native_event(&payload, &self.request_id, model, self.created)
                    })
                    .into_iter()
                    .collect();
                frames.push(streaming::done_frame());
                frames
            }
        }
    }

    fn fake_events(&self, body: &str) -> Vec<Bytes> {
        match &self.dialect {
            Dialect::Native => streaming::native_fake_stream_events(body),
            Dialect::OpenAi { model } => {
                let mut frames =
                    streaming::openai_fake_stream_events(body, &self.request_id, model, self.created);
                frames.push(streaming::done_frame());
                frames
            }
        }
    }

    fn error_frames(&self, status: u16, message: &str) -> Vec<Bytes> {
        match &self.dialect {
            Dialect::Native => vec![streaming::native_error_event(status, message)],
            Dialect::OpenAi { model } => vec![
                streaming::openai_error_event(&self.request_id, model, self.created, message),
                streaming::done_frame(),
            ],
        }
    }

    /// Emit the in-band error and close the stream.
    async fn fail(&self, failure: Failure, mut guard: RequestGuard, tx: &mpsc::Sender<Outbound>) {
        if failure.terminal {
            guard.complete();
        }
        let message = account_failure(&self.rotator, &self.request_id, &failure, &self.config).await;
        for frame in self.error_frames(failure.status, &message) {
            if tx.send(Outbound::Data(frame)).await.is_err() {
                return;
            }
        }
        let _ = tx.send(Outbound::Finished { rotate: false }).await;
    }

    async fn succeed(&self, frames: Vec<Bytes>, tx: &mpsc::Sender<Outbound>) {
        for frame in frames {
            if tx.send(Outbound::Data(frame)).await.is_err() {
                return;
            }
        }
        let rotate = self.rotator.record_success(self.is_generative, &self.config);
        tracing::info!("[{}] Stream completed", self.request_id);
        let _ = tx.send(Outbound::Finished { rotate }).await;
    }
}

async fn pump_real(
    ctx: StreamContext,
    mut queue: MessageQueue,
    mut guard: RequestGuard,
    pending: Option<InboundMessage>,
    tx: mpsc::Sender<Outbound>,
) {
    let idle = ctx.config.stream_idle_timeout();
    let mut reframer = SseReframer::new();
    let mut next = pending;

    let result = loop {
        let message = match next.take() {
            Some(message) => message,
            None => tokio::select! {
                received = queue.dequeue(Some(idle)) => match received {
                    Ok(message) => message,
                    Err(e) => break Err(Failure::from_queue(e, idle)),
                },
                _ = tx.closed() => {
                    tracing::info!("[{}] Client went away mid-stream", ctx.request_id);
                    return;
                }
            },
        };
        match message {
            InboundMessage::HeaderInfo { .. } => {}
            InboundMessage::Chunk { data } => {
                for frame in ctx.translate_chunk(&mut reframer, &data) {
                    if tx.send(Outbound::Data(frame)).await.is_err() {
                        return;
                    }
                }
            }
            InboundMessage::StreamEnd => break Ok(()),
            InboundMessage::Error { status, message } => break Err(Failure::upstream(status, message)),
        }
    };

    match result {
        Ok(()) => {
            guard.complete();
            let frames = ctx.closing_frames(&mut reframer);
            ctx.succeed(frames, &tx).await;
        }
        Err(failure) => {
            tracing::warn!("[{}] Stream failed mid-flight: {}", ctx.request_id, failure.message);
            ctx.fail(failure, guard, &tx).await;
        }
    }
}

async fn pump_fake(
    ctx: StreamContext,
    registry: Arc<ConnectionRegistry>,
    proxy: ProxyRequest,
    mut queue: MessageQueue,
    mut guard: RequestGuard,
    tx: mpsc::Sender<Outbound>,
) {
    let config = &ctx.config;
    let work = async {
        let first = dispatch(&registry, &proxy, &mut queue, config).await?;
        collect(first, &mut queue, config.stream_idle_timeout()).await
    };
    tokio::pin!(work);

    let period = config.heartbeat_interval();
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    let outcome = loop {
        tokio::select! {
            outcome = &mut work => break outcome,
            _ = ticker.tick() => {
                if tx.send(Outbound::Data(ctx.heartbeat())).await.is_err() {
                    return;
                }
            }
            _ = tx.closed() => return,
        }
    };

    match outcome {
        Ok(collected) => {
            guard.complete();
            let frames = ctx.fake_events(&collected.body);
            ctx.succeed(frames, &tx).await;
        }
        Err(failure) => ctx.fail(failure, guard, &tx).await,
    }
}

fn forwarded_query(query: &HashMap<String, String>) -> HashMap<String, String> {
    query
        .iter()
        .filter(|(k, _)| k.as_str() != "key")
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

fn forwarded_headers(headers: &HeaderMap) -> HashMap<String, String> {
    headers
        .iter()
        .filter(|(name, _)| !STRIPPED_REQUEST_HEADERS.contains(&name.as_str()))
        .filter_map(|(name, value)| Some((name.as_str().to_string(), value.to_str().ok()?.to_string())))
        .collect()
}

fn accepts_event_stream(headers: &HeaderMap) -> bool {
    headers
        .get(header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.contains("text/event-stream"))
        .unwrap_or(false)
}

/// Split `/v1beta/models/{model}:{action}` into its three parts.
fn split_model_path(path: &str) -> Option<(&str, &str, &str)> {
    let start = path.find("models/")? + "models/".len();
    let colon = path[start..].rfind(':')? + start;
    Some((&path[..start], &path[start..colon], &path[colon + 1..]))
}

fn is_generative_action(action: &str) -> bool {
    matches!(action, "generateContent" | "streamGenerateContent")
}

fn plan_native(request: ClientRequest, config: &AppConfig) -> Plan {
    let is_generative = split_model_path(&request.path)
        .map(|(_, _, action)| is_generative_action(action))
        .unwrap_or(false);
    let client_stream = request.path.contains(":streamGenerateContent")
        || request.query.get("alt").map(|alt| alt == "sse").unwrap_or(false)
        || accepts_event_stream(&request.headers);

    let mut query = forwarded_query(&request.query);
    let mut path = request.path.clone();
    let mut requested_model = None;
    let mut normalized_model = None;
    let mut delivery = match config.streaming_mode {
        StreamingMode::Fake => UpstreamMode::Fake,
        _ => UpstreamMode::Real,
    };

    if let Some((prefix, model, action)) = split_model_path(&request.path) {
        let resolved = model_router::resolve_model(model, config.streaming_mode);
        delivery = resolved.delivery;
        let upstream_mode = if client_stream { delivery } else { UpstreamMode::Fake };
        let action = if upstream_mode == UpstreamMode::Fake && action == "streamGenerateContent" {
            query.remove("alt");
            "generateContent"
        } else {
            action
        };
        path = format!("{}{}:{}", prefix, resolved.upstream, action);
        requested_model = Some(resolved.requested);
        normalized_model = Some(resolved.upstream);
    }

    let streaming_mode = if client_stream { delivery } else { UpstreamMode::Fake };
    Plan {
        proxy: ProxyRequest {
            request_id: uuid::Uuid::new_v4().to_string(),
            method: request.method.as_str().to_string(),
            path,
            headers: forwarded_headers(&request.headers),
            query_params: query,
            body: String::from_utf8_lossy(&request.body).into_owned(),
            streaming_mode,
            is_generative,
            requested_model,
            normalized_model,
        },
        dialect: Dialect::Native,
        client_stream,
        delivery,
    }
}

fn plan_openai(request: &ClientRequest, config: &AppConfig) -> Result<Plan, ProxyError> {
    let chat = ChatCompletionRequest::parse(&request.body)?;
    if chat.model.trim().is_empty() {
        return Err(ProxyError::Translation("model is required".to_string()));
    }

    let resolved = model_router::resolve_model(&chat.model, config.streaming_mode);
    let streaming_mode = if chat.stream { resolved.delivery } else { UpstreamMode::Fake };
    let mut query = HashMap::new();
    let action = match streaming_mode {
        UpstreamMode::Real => {
            query.insert("alt".to_string(), "sse".to_string());
            "streamGenerateContent"
        }
        UpstreamMode::Fake => "generateContent",
    };
    let body = serde_json::to_string(&chat.to_native()).map_err(|e| ProxyError::Translation(e.to_string()))?;
    let headers = HashMap::from([("content-type".to_string(), "application/json".to_string())]);

    Ok(Plan {
        proxy: ProxyRequest {
            request_id: uuid::Uuid::new_v4().to_string(),
            method: "POST".to_string(),
            path: format!("/v1beta/models/{}:{}", resolved.upstream, action),
            headers,
            query_params: query,
            body,
            streaming_mode,
            is_generative: true,
            requested_model: Some(resolved.requested.clone()),
            normalized_model: Some(resolved.upstream),
        },
        dialect: Dialect::OpenAi {
            model: resolved.requested,
        },
        client_stream: chat.stream,
        delivery: resolved.delivery,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn native_request(path: &str) -> ClientRequest {
        ClientRequest {
            method: Method::POST,
            path: path.to_string(),
            query: HashMap::from([("key".to_string(), "secret".to_string())]),
            headers: HeaderMap::new(),
            body: Bytes::from_static(b"{}"),
        }
    }

    fn config(mode: StreamingMode) -> AppConfig {
        AppConfig {
            streaming_mode: mode,
            ..AppConfig::default()
        }
    }

    #[test]
    fn splits_model_paths() {
        assert_eq!(
            split_model_path("/v1beta/models/fake-stream/gemini-2.5-pro:streamGenerateContent"),
            Some(("/v1beta/models/", "fake-stream/gemini-2.5-pro", "streamGenerateContent"))
        );
        assert_eq!(split_model_path("/v1beta/models"), None);
    }

    #[test]
    fn native_stream_under_mix_uses_marker() {
        let plan = plan_native(
            native_request("/v1beta/models/fake-stream/gemini-2.5-pro:streamGenerateContent"),
            &config(StreamingMode::Mix),
        );
        assert!(plan.client_stream);
        assert_eq!(plan.delivery, UpstreamMode::Fake);
        assert_eq!(plan.proxy.streaming_mode, UpstreamMode::Fake);
        assert_eq!(plan.proxy.path, "/v1beta/models/gemini-2.5-pro:generateContent");
        assert_eq!(plan.proxy.requested_model.as_deref(), Some("fake-stream/gemini-2.5-pro"));
        assert!(!plan.proxy.query_params.contains_key("key"));
        assert!(plan.proxy.is_generative);
    }

    #[test]
    fn native_real_stream_keeps_path() {
        let plan = plan_native(
            native_request("/v1beta/models/gemini-2.5-pro:streamGenerateContent"),
            &config(StreamingMode::Real),
        );
        assert_eq!(plan.proxy.streaming_mode, UpstreamMode::Real);
        assert_eq!(plan.proxy.path, "/v1beta/models/gemini-2.5-pro:streamGenerateContent");
        assert!(plan.proxy.is_generative);
    }

    #[test]
    fn non_streaming_always_goes_upstream_fake() {
        let plan = plan_native(
            native_request("/v1beta/models/gemini-2.5-pro:generateContent"),
            &config(StreamingMode::Real),
        );
        assert!(!plan.client_stream);
        assert_eq!(plan.proxy.streaming_mode, UpstreamMode::Fake);

        let plan = plan_native(native_request("/v1beta/models/gemini-2.5-pro:countTokens"), &config(StreamingMode::Real));
        assert!(!plan.proxy.is_generative);
    }

    #[test]
    fn accept_header_selects_streaming() {
        let mut request = native_request("/v1beta/models/gemini-2.5-pro:generateContent");
        request
            .headers
            .insert(header::ACCEPT, HeaderValue::from_static("text/event-stream"));
        request
            .headers
            .insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer secret"));
        let plan = plan_native(request, &config(StreamingMode::Real));
        assert!(plan.client_stream);
        assert!(!plan.proxy.headers.contains_key("authorization"));
        assert_eq!(plan.proxy.headers.get("accept").map(String::as_str), Some("text/event-stream"));
    }

    #[test]
    fn openai_plan_translates_body() {
        let request = ClientRequest {
            method: Method::POST,
            path: "/v1/chat/completions".to_string(),
            query: HashMap::new(),
            headers: HeaderMap::new(),
            body: Bytes::from_static(
                br#"{"model":"gemini-2.5-pro","stream":true,"messages":[{"role":"user","content":"hi"}]}"#,
            ),
        };
        let plan = plan_openai(&request, &config(StreamingMode::Real)).unwrap();
        assert_eq!(plan.proxy.path, "/v1beta/models/gemini-2.5-pro:streamGenerateContent");
        assert_eq!(plan.proxy.query_params.get("alt").map(String::as_str), Some("sse"));
        assert_eq!(plan.proxy.streaming_mode, UpstreamMode::Real);
        let body: Value = serde_json::from_str(&plan.proxy.body).unwrap();
        assert_eq!(body["contents"][0]["parts"][0]["text"], "hi");
    }

    #[test]
    fn openai_plan_rejects_missing_model() {
        let request = ClientRequest {
            method: Method::POST,
            path: "/v1/chat/completions".to_string(),
            query: HashMap::new(),
            headers: HeaderMap::new(),
            body: Bytes::from_static(br#"{"messages":[]}"#),
        };
        assert!(matches!(
            plan_openai(&request, &config(StreamingMode::Real)),
            Err(ProxyError::Translation(_))
        ));
    }

    #[test]
    fn only_user_aborts_are_recognised() {
        assert!(Failure::upstream(500, "Request Aborted by user").is_user_abort());
        assert!(Failure::upstream(499, "client closed request").is_user_abort());
        assert!(!Failure::upstream(500, "quota exceeded").is_user_abort());
        assert!(!Failure::upstream(500, "upstream fetch aborted: deadline exceeded").is_user_abort());
    }
}

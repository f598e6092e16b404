// SSE streaming support for API responses

use bytes::Bytes;
use serde_json::{json, Value};

use crate::proxy::translator::{self, parse_native_response};

pub const DONE_PAYLOAD: &str = "[DONE]";

/// One `data:` event frame.
pub fn sse_data(payload: &str) -> Bytes {
    let mut frame = String::with_capacity(payload.len() + 8);
    for line in payload.split('\n') {
        frame.push_str("data: ");
        frame.push_str(line);
        frame.push('\n');
    }
    frame.push('\n');
    Bytes::from(frame)
}

pub fn done_frame() -> Bytes {
    sse_data(DONE_PAYLOAD)
}

/// Reassembles SSE events from arbitrarily split or merged chunks.
///
/// Each complete event yields the `data:` lines joined with `\n`. Comment-only
/// and empty events are dropped, as is a literal `[DONE]`.
#[derive(Debug, Default)]
pub struct SseReframer {
    buffer: String,
}

impl SseReframer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &str) -> Vec<String> {
        self.buffer.push_str(chunk);
        if self.buffer.contains('\r') {
            self.buffer = self.buffer.replace("\r\n", "\n");
        }

        let mut events = Vec::new();
        while let Some(pos) = self.buffer.find("\n\n") {
            let segment: String = self.buffer.drain(..pos + 2).collect();
            if let Some(payload) = event_payload(&segment) {
                events.push(payload);
            }
        }
        events
    }

    /// Whatever is left once the upstream has closed without a final blank line.
    pub fn finish(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.buffer);
        event_payload(&rest)
    }
}

fn event_payload(segment: &str) -> Option<String> {
    let lines: Vec<&str> = segment
        .lines()
        .filter_map(|line| line.strip_prefix("data:"))
        .map(|data| data.strip_prefix(' ').unwrap_or(data))
        .collect();
    if lines.is_empty() {
        return None;
    }
    let payload = lines.join("\n");
    if payload.trim().is_empty() || payload.trim() == DONE_PAYLOAD {
        return None;
    }
    Some(payload)
}

/// Translate one reassembled native event into an OpenAI chunk frame.
///
/// Payloads that are not valid native JSON are forwarded untouched.
pub fn translate_native_event(payload: &str, id: &str, model: &str, created: i64) -> Option<Bytes> {
    match parse_native_response(payload) {
        Ok(response) => translator::native_to_openai_chunk(&response, id, model, created)
            .map(|chunk| sse_data(&chunk.to_string())),
        Err(e) => {
            tracing::warn!("[{}] Untranslatable upstream event, passing through: {}", id, e);
            Some(sse_data(payload))
        }
    }
}

/// Content-free keep-alive event.
pub fn openai_heartbeat(id: &str, model: &str, created: i64) -> Bytes {
    sse_data(&translator::openai_chunk(id, model, created, json!({}), None).to_string())
}

pub fn native_heartbeat() -> Bytes {
    Bytes::from_static(b": heartbeat\n\n")
}

/// The two synthesized events of a pseudo stream, from the accumulated body.
pub fn openai_fake_stream_events(body: &str, id: &str, model: &str, created: i64) -> Vec<Bytes> {
    let (content, reasoning, finish_reason, usage) = match parse_native_response(body) {
        Ok(response) => {
            let extracted = response.extract().unwrap_or_default();
            let usage = response.openai_usage();
            (
                extracted.content,
                extracted.reasoning,
                extracted.finish_reason.unwrap_or_else(|| "stop".to_string()),
                usage,
            )
        }
        Err(e) => {
            tracing::warn!("[{}] Upstream body is not JSON, sending it as text: {}", id, e);
            (body.to_string(), String::new(), "stop".to_string(), None)
        }
    };

    let mut delta = json!({ "role": "assistant", "content": content });
    if !reasoning.is_empty() {
        delta["reasoning_content"] = json!(reasoning);
    }
    let content_event = translator::openai_chunk(id, model, created, delta, None);
    let mut finish_event =
        translator::openai_chunk(id, model, created, json!({}), Some(&finish_reason));
    if let Some(usage) = usage {
        finish_event["usage"] = usage;
    }

    vec![
        sse_data(&content_event.to_string()),
        sse_data(&finish_event.to_string()),
    ]
}

pub fn native_fake_stream_events(body: &str) -> Vec<Bytes> {
    let raw: Value = serde_json::from_str(body).unwrap_or(Value::Null);
    let root = raw.get("response").unwrap_or(&raw);

    let (content, reasoning, finish_reason) = match parse_native_response(body) {
        Ok(response) => {
            let extracted = response.extract().unwrap_or_default();
            (
                extracted.content,
                extracted.reasoning,
                extracted.finish_reason.unwrap_or_else(|| "STOP".to_string()),
            )
        }
        Err(e) => {
            tracing::warn!("Upstream body is not JSON, sending it as text: {}", e);
            (body.to_string(), String::new(), "STOP".to_string())
        }
    };

    let mut parts = Vec::new();
    if !reasoning.is_empty() {
        parts.push(json!({ "text": reasoning, "thought": true }));
    }
    parts.push(json!({ "text": content }));

    let content_event = json!({
        "candidates": [{
            "content": { "role": "model", "parts": parts },
            "index": 0
        }]
    });
    let mut finish_event = json!({
        "candidates": [{
            "content": { "role": "model", "parts": [{ "text": "" }] },
            "finishReason": finish_reason,
            "index": 0
        }]
    });
    if let Some(usage) = root.get("usageMetadata") {
        finish_event["usageMetadata"] = usage.clone();
    }
    if let Some(version) = root.get("modelVersion") {
        finish_event["modelVersion"] = version.clone();
    }

    vec![
        sse_data(&content_event.to_string()),
        sse_data(&finish_event.to_string()),
    ]
}

/// In-band terminal error once headers are already on the wire.
pub fn openai_error_event(id: &str, model: &str, created: i64, message: &str) -> Bytes {
    let delta = json!({ "role": "assistant", "content": format!("[relay error] {}", message) });
    sse_data(&translator::openai_chunk(id, model, created, delta, Some("stop")).to_string())
}

pub fn native_error_event(status: u16, message: &str) -> Bytes {
    sse_data(
        &json!({
            "error": {
                "code": status,
                "message": message,
                "status": "UPSTREAM_ERROR"
            }
        })
        .to_string(),
    )
}

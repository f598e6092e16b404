// Proxy core - request multiplexing over the upstream automation channel

pub mod orchestrator;
pub mod queue;
pub mod registry;
pub mod rotation;
pub mod session;
pub mod translator;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// How the automation layer should return the upstream reply.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum UpstreamMode {
    /// Forward chunks as the upstream produces them.
    Real,
    /// Accumulate the full body and send it as one chunk.
    Fake,
}

/// One outbound call to the upstream layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyRequest {
    pub request_id: String,
    pub method: String,
    pub path: String,
    pub headers: HashMap<String, String>,
    pub query_params: HashMap<String, String>,
    pub body: String,
    pub streaming_mode: UpstreamMode,
    pub is_generative: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requested_model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub normalized_model: Option<String>,
}

impl ProxyRequest {
    /// Wire frame sent over the channel.
    pub fn to_frame(&self) -> String {
        let mut value = serde_json::to_value(self).unwrap_or_default();
        if let Some(obj) = value.as_object_mut() {
            obj.insert("event_type".to_string(), "proxy_request".into());
        }
        value.to_string()
    }
}

/// Advisory notice that a client went away.
pub fn cancel_frame(request_id: &str) -> String {
    serde_json::json!({
        "event_type": "cancel_request",
        "request_id": request_id
    })
    .to_string()
}

/// A message received from the upstream channel for one request.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    HeaderInfo {
        status: u16,
        headers: HashMap<String, String>,
    },
    Chunk {
        data: String,
    },
    StreamEnd,
    Error {
        status: u16,
        message: String,
    },
}

impl InboundMessage {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::StreamEnd | Self::Error { .. })
    }
}

/// JSON envelope the automation layer sends back.
#[derive(Debug, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
enum Envelope {
    ResponseHeaders {
        request_id: String,
        #[serde(default = "default_status")]
        status: u16,
        #[serde(default)]
        headers: HashMap<String, String>,
    },
    Chunk {
        request_id: String,
        #[serde(default)]
        data: String,
    },
    StreamClose {
        request_id: String,
    },
    Error {
        request_id: String,
        #[serde(default = "default_error_status")]
        status: u16,
        #[serde(default)]
        message: String,
    },
}

fn default_status() -> u16 {
    200
}

fn default_error_status() -> u16 {
    500
}

/// Parse an inbound frame into its request id and message.
pub fn parse_envelope(text: &str) -> Result<(String, InboundMessage), serde_json::Error> {
    let envelope: Envelope = serde_json::from_str(text)?;
    Ok(match envelope {
        Envelope::ResponseHeaders {
            request_id,
            status,
            headers,
        } => (request_id, InboundMessage::HeaderInfo { status, headers }),
        Envelope::Chunk { request_id, data } => (request_id, InboundMessage::Chunk { data }),
        Envelope::StreamClose { request_id } => (request_id, InboundMessage::StreamEnd),
        Envelope::Error {
            request_id,
            status,
            message,
        } => (request_id, InboundMessage::Error { status, message }),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_each_envelope_kind() {
        let (id, msg) =
            parse_envelope(r#"{"request_id":"r1","event_type":"response_headers","status":201,"headers":{"content-type":"text/event-stream"}}"#)
                .unwrap();
        assert_eq!(id, "r1");
        assert!(matches!(msg, InboundMessage::HeaderInfo { status: 201, .. }));

        let (_, msg) = parse_envelope(r#"{"request_id":"r1","event_type":"chunk","data":"abc"}"#).unwrap();
        assert_eq!(msg, InboundMessage::Chunk { data: "abc".to_string() });

        let (_, msg) = parse_envelope(r#"{"request_id":"r1","event_type":"stream_close"}"#).unwrap();
        assert!(msg.is_terminal());

        let (_, msg) = parse_envelope(r#"{"request_id":"r1","event_type":"error","message":"boom"}"#).unwrap();
        assert_eq!(
            msg,
            InboundMessage::Error {
                status: 500,
                message: "boom".to_string()
            }
        );
    }

    #[test]
    fn rejects_unknown_event_type() {
        assert!(parse_envelope(r#"{"request_id":"r1","event_type":"nope"}"#).is_err());
    }

    #[test]
    fn request_frame_is_tagged() {
        let request = ProxyRequest {
            request_id: "abc".to_string(),
            method: "POST".to_string(),
            path: "/v1beta/models/gemini-2.5-pro:generateContent".to_string(),
            headers: HashMap::new(),
            query_params: HashMap::new(),
            body: "{}".to_string(),
            streaming_mode: UpstreamMode::Fake,
            is_generative: true,
            requested_model: None,
            normalized_model: None,
        };
        let frame: serde_json::Value = serde_json::from_str(&request.to_frame()).unwrap();
        assert_eq!(frame["event_type"], "proxy_request");
        assert_eq!(frame["streaming_mode"], "fake");
        assert_eq!(frame["request_id"], "abc");
    }
}

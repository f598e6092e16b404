// Request/Response translator between the OpenAI and native Gemini dialects

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::ProxyError;

const SAFETY_CATEGORIES: [&str; 4] = [
    "HARM_CATEGORY_HARASSMENT",
    "HARM_CATEGORY_HATE_SPEECH",
    "HARM_CATEGORY_SEXUALLY_EXPLICIT",
    "HARM_CATEGORY_DANGEROUS_CONTENT",
];

// ---------------------------------------------------------------------------
// Native dialect
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Blob {
    #[serde(rename = "mimeType", alias = "mime_type", default)]
    pub mime_type: Option<String>,
    pub data: String,
}

/// One part of a native content block.
///
/// Upstream replies use both camelCase and snake_case for inline data; both
/// resolve to [`Part::InlineData`] here.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum Part {
    Text {
        text: String,
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        thought: bool,
    },
    InlineData {
        #[serde(rename = "inlineData", alias = "inline_data")]
        inline_data: Blob,
    },
    Other(Value),
}

impl Part {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text {
            text: text.into(),
            thought: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Content {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default)]
    pub parts: Vec<Part>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SafetySetting {
    pub category: String,
    pub threshold: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_k: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_output_tokens: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_sequences: Option<Vec<String>>,
}

impl GenerationConfig {
    fn is_empty(&self) -> bool {
        self.temperature.is_none()
            && self.top_p.is_none()
            && self.top_k.is_none()
            && self.max_output_tokens.is_none()
            && self.stop_sequences.is_none()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NativeRequest {
    pub contents: Vec<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_instruction: Option<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generation_config: Option<GenerationConfig>,
    pub safety_settings: Vec<SafetySetting>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Candidate {
    #[serde(default)]
    pub content: Option<Content>,
    #[serde(default)]
    pub finish_reason: Option<String>,
    #[serde(default)]
    pub index: u32,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct PromptFeedback {
    #[serde(default)]
    pub block_reason: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct UsageMetadata {
    #[serde(default)]
    pub prompt_token_count: u64,
    #[serde(default)]
    pub candidates_token_count: u64,
    #[serde(default)]
    pub total_token_count: u64,
    #[serde(default)]
    pub thoughts_token_count: u64,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct GenerateContentResponse {
    #[serde(default)]
    pub candidates: Vec<Candidate>,
    #[serde(default)]
    pub prompt_feedback: Option<PromptFeedback>,
    #[serde(default)]
    pub usage_metadata: Option<UsageMetadata>,
    #[serde(default)]
    pub model_version: Option<String>,
}

/// Upstream bodies come either bare or wrapped in `{"response": ...}`.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum NativeEnvelope {
    Wrapped { response: GenerateContentResponse },
    Bare(GenerateContentResponse),
}

pub fn parse_native_response(body: &str) -> Result<GenerateContentResponse, serde_json::Error> {
    Ok(match serde_json::from_str::<NativeEnvelope>(body)? {
        NativeEnvelope::Wrapped { response } => response,
        NativeEnvelope::Bare(response) => response,
    })
}

// ---------------------------------------------------------------------------
// OpenAI request -> native request
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct ChatCompletionRequest {
    #[serde(default)]
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub stream: bool,
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub top_p: Option<f64>,
    #[serde(default)]
    pub top_k: Option<f64>,
    #[serde(default)]
    pub max_tokens: Option<u64>,
    #[serde(default)]
    pub stop: Option<StopSequences>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum StopSequences {
    One(String),
    Many(Vec<String>),
}

#[derive(Debug, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    #[serde(default)]
    pub content: MessageContent,
}

#[derive(Debug, Deserialize, Default)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
    #[default]
    Empty,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
    #[serde(other)]
    Unsupported,
}

#[derive(Debug, Deserialize)]
pub struct ImageUrl {
    pub url: String,
}

/// Split a `data:<mime>;base64,<payload>` URL.
pub fn parse_data_url(url: &str) -> Option<(String, String)> {
    let rest = url.strip_prefix("data:")?;
    let (mime, data) = rest.split_once(";base64,")?;
    if mime.is_empty() || data.is_empty() {
        return None;
    }
    Some((mime.to_string(), data.to_string()))
}

fn content_parts(content: &MessageContent) -> Vec<Part> {
    match content {
        MessageContent::Text(text) => vec![Part::text(text.clone())],
        MessageContent::Parts(items) => items
            .iter()
            .filter_map(|item| match item {
                ContentPart::Text { text } => Some(Part::text(text.clone())),
                ContentPart::ImageUrl { image_url } => match parse_data_url(&image_url.url) {
                    Some((mime, data)) => Some(Part::InlineData {
                        inline_data: Blob {
                            mime_type: Some(mime),
                            data,
                        },
                    }),
                    None => {
                        tracing::warn!("Skipping non-data image URL in chat message");
                        None
                    }
                },
                ContentPart::Unsupported => None,
            })
            .collect(),
        MessageContent::Empty => Vec::new(),
    }
}

fn message_text(content: &MessageContent) -> String {
    content_parts(content)
        .into_iter()
        .filter_map(|part| match part {
            Part::Text { text, .. } => Some(text),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("\n")
}

impl ChatCompletionRequest {
    pub fn parse(body: &[u8]) -> Result<Self, ProxyError> {
        serde_json::from_slice(body).map_err(|e| ProxyError::Translation(e.to_string()))
    }

    /// Build the native request body for this chat request.
    pub fn to_native(&self) -> NativeRequest {
        let mut system_texts = Vec::new();
        let mut contents = Vec::new();

        for message in &self.messages {
            if message.role == "system" {
                let text = message_text(&message.content);
                if !text.is_empty() {
                    system_texts.push(text);
                }
                continue;
            }
            let role = if message.role == "assistant" {
                "model"
            } else {
                "user"
            };
            contents.push(Content {
                role: Some(role.to_string()),
                parts: content_parts(&message.content),
            });
        }

        let system_instruction = (!system_texts.is_empty()).then(|| Content {
            role: None,
            parts: vec![Part::text(system_texts.join("\n"))],
        });

        let generation_config = GenerationConfig {
            temperature: self.temperature,
            top_p: self.top_p,
            top_k: self.top_k,
            max_output_tokens: self.max_tokens,
            stop_sequences: self.stop.as_ref().map(|stop| match stop {
                StopSequences::One(s) => vec![s.clone()],
                StopSequences::Many(v) => v.clone(),
            }),
        };

        NativeRequest {
            contents,
            system_instruction,
            generation_config: (!generation_config.is_empty()).then_some(generation_config),
            safety_settings: SAFETY_CATEGORIES
                .iter()
                .map(|category| SafetySetting {
                    category: category.to_string(),
                    threshold: "BLOCK_NONE".to_string(),
                })
                .collect(),
        }
    }
}

// ---------------------------------------------------------------------------
// Native response -> OpenAI response
// ---------------------------------------------------------------------------

pub fn markdown_image(mime_type: Option<&str>, data: &str) -> String {
    format!(
        "![image](data:{};base64,{})",
        mime_type.filter(|m| !m.is_empty()).unwrap_or("image/png"),
        data
    )
}

/// Text extracted from the first candidate of a native response.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Extracted {
    pub content: String,
    pub reasoning: String,
    pub finish_reason: Option<String>,
}

impl GenerateContentResponse {
    /// First candidate's answer, an image rendered as markdown taking priority
    /// over text. A prompt blocked by safety filters yields a synthetic answer.
    pub fn extract(&self) -> Option<Extracted> {
        let Some(candidate) = self.candidates.first() else {
            let reason = self
                .prompt_feedback
                .as_ref()
                .and_then(|f| f.block_reason.as_deref())?;
            return Some(Extracted {
                content: format!(
                    "[The request was blocked by the upstream safety filter: {}]",
                    reason
                ),
                reasoning: String::new(),
                finish_reason: Some("stop".to_string()),
            });
        };

        let parts = candidate
            .content
            .as_ref()
            .map(|c| c.parts.as_slice())
            .unwrap_or_default();

        let image = parts.iter().find_map(|part| match part {
            Part::InlineData { inline_data } => {
                Some(markdown_image(inline_data.mime_type.as_deref(), &inline_data.data))
            }
            _ => None,
        });

        let mut content = String::new();
        let mut reasoning = String::new();
        for part in parts {
            if let Part::Text { text, thought } = part {
                if *thought {
                    reasoning.push_str(text);
                } else {
                    content.push_str(text);
                }
            }
        }

        Some(Extracted {
            content: image.unwrap_or(content),
            reasoning,
            finish_reason: candidate.finish_reason.clone(),
        })
    }

    pub(crate) fn openai_usage(&self) -> Option<Value> {
        self.usage_metadata.as_ref().map(|usage| {
            json!({
                "prompt_tokens": usage.prompt_token_count,
                "completion_tokens": usage.candidates_token_count + usage.thoughts_token_count,
                "total_tokens": usage.total_token_count
            })
        })
    }
}

/// Streaming chunk in the OpenAI dialect.
pub fn openai_chunk(
    id: &str,
    model: &str,
    created: i64,
    delta: Value,
    finish_reason: Option<&str>,
) -> Value {
    json!({
        "id": format!("chatcmpl-{}", id),
        "object": "chat.completion.chunk",
        "created": created,
        "model": model,
        "choices": [{
            "index": 0,
            "delta": delta,
            "finish_reason": finish_reason
        }]
    })
}

/// Translate one streamed native event. `None` when it carries nothing.
pub fn native_to_openai_chunk(
    response: &GenerateContentResponse,
    id: &str,
    model: &str,
    created: i64,
) -> Option<Value> {
    let extracted = response.extract()?;
    let mut delta = json!({ "role": "assistant", "content": extracted.content });
    if !extracted.reasoning.is_empty() {
        delta["reasoning_content"] = json!(extracted.reasoning);
    }
    let mut chunk = openai_chunk(id, model, created, delta, extracted.finish_reason.as_deref());
    if let Some(usage) = response.openai_usage() {
        chunk["usage"] = usage;
    }
    Some(chunk)
}

/// Non-streaming `chat.completion` body.
pub fn native_to_openai_response(
    response: &GenerateContentResponse,
    id: &str,
    model: &str,
    created: i64,
) -> Value {
    let extracted = response.extract().unwrap_or_default();
    let mut message = json!({ "role": "assistant", "content": extracted.content });
    if !extracted.reasoning.is_empty() {
        message["reasoning_content"] = json!(extracted.reasoning);
    }
    let mut body = json!({
        "id": format!("chatcmpl-{}", id),
        "object": "chat.completion",
        "created": created,
        "model": model,
        "choices": [{
            "index": 0,
            "message": message,
            "finish_reason": extracted.finish_reason.unwrap_or_else(|| "stop".to_string())
        }]
    });
    if let Some(usage) = response.openai_usage() {
        body["usage"] = usage;
    }
    body
}

/// Replace inline image parts of a native body with markdown text parts.
///
/// Bodies that are not JSON are returned unchanged.
pub fn inline_images_to_markdown(body: &str) -> String {
    let mut value: Value = match serde_json::from_str(body) {
        Ok(v) => v,
        Err(e) => {
            tracing::warn!("Upstream body is not JSON, passing through: {}", e);
            return body.to_string();
        }
    };

    let root = if value.get("response").is_some() {
        &mut value["response"]
    } else {
        &mut value
    };
    let mut changed = false;
    if let Some(candidates) = root.get_mut("candidates").and_then(|c| c.as_array_mut()) {
        for candidate in candidates {
            let Some(parts) = candidate
                .get_mut("content")
                .and_then(|c| c.get_mut("parts"))
                .and_then(|p| p.as_array_mut())
            else {
                continue;
            };
            for part in parts.iter_mut() {
                if let Ok(Part::InlineData { inline_data }) = serde_json::from_value::<Part>(part.clone()) {
                    *part = json!({
                        "text": markdown_image(inline_data.mime_type.as_deref(), &inline_data.data)
                    });
                    changed = true;
                }
            }
        }
    }

    if changed {
        value.to_string()
    } else {
        body.to_string()
    }
}

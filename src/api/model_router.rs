// Model router module for mix streaming mode
// Resolves the per-request delivery discipline from the model id and
// advertises the pseudo-streaming variants in model listings

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{json, Value};

use crate::config::StreamingMode;
use crate::proxy::UpstreamMode;

/// Marker prefix selecting pseudo streaming under mix mode
pub const FAKE_STREAM_PREFIX: &str = "fake-stream/";

/// Model families that never get a pseudo-streaming variant
static NON_TEXT_MODEL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)embed|audio|vision|image|video|search|moderation").expect("valid regex")
});

/// Result of model resolution
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedModel {
    /// Identifier as the client sent it, echoed back in responses
    pub requested: String,
    /// Identifier forwarded upstream, marker stripped
    pub upstream: String,
    /// Delivery discipline for a streaming client
    pub delivery: UpstreamMode,
}

/// Resolve a model id against the global streaming mode.
///
/// Only mix mode looks at the marker; under real or fake the id is forwarded
/// verbatim and the global mode applies.
pub fn resolve_model(requested: &str, mode: StreamingMode) -> ResolvedModel {
    let (upstream, delivery) = match mode {
        StreamingMode::Real => (requested, UpstreamMode::Real),
        StreamingMode::Fake => (requested, UpstreamMode::Fake),
        StreamingMode::Mix => match requested.strip_prefix(FAKE_STREAM_PREFIX) {
            Some(stripped) => (stripped, UpstreamMode::Fake),
            None => (requested, UpstreamMode::Real),
        },
    };
    ResolvedModel {
        requested: requested.to_string(),
        upstream: upstream.to_string(),
        delivery,
    }
}

/// Whether a model gets a pseudo-streaming twin in listings
pub fn is_text_model(id: &str, entry: &Value) -> bool {
    if id.starts_with(FAKE_STREAM_PREFIX) || NON_TEXT_MODEL.is_match(id) {
        return false;
    }
    match entry.get("supportedGenerationMethods").and_then(|m| m.as_array()) {
        Some(methods) => methods.iter().any(|m| m == "generateContent"),
        None => true,
    }
}

fn bare_id(name: &str) -> &str {
    name.strip_prefix("models/").unwrap_or(name)
}

/// Add a `fake-stream/` twin after every text-generation model of a native
/// model list. Existing twins are not duplicated.
pub fn augment_native_models(list: &mut Value) {
    let Some(models) = list.get_mut("models").and_then(|m| m.as_array_mut()) else {
        return;
    };

    let existing: Vec<String> = models
        .iter()
        .filter_map(|m| m.get("name").and_then(|n| n.as_str()))
        .map(|n| bare_id(n).to_string())
        .collect();

    let mut augmented = Vec::with_capacity(models.len() * 2);
    for entry in models.drain(..) {
        let id = entry
            .get("name")
            .and_then(|n| n.as_str())
            .map(|n| bare_id(n).to_string());
        let twin = id.filter(|id| is_text_model(id, &entry)).and_then(|id| {
            let twin_id = format!("{}{}", FAKE_STREAM_PREFIX, id);
            if existing.contains(&twin_id) {
                return None;
            }
            let mut twin = entry.clone();
            twin["name"] = json!(format!("models/{}", twin_id));
            if let Some(display) = entry.get("displayName").and_then(|d| d.as_str()) {
                twin["displayName"] = json!(format!("{} (fake stream)", display));
            }
            Some(twin)
        });
        augmented.push(entry);
        augmented.extend(twin);
    }
    *models = augmented;
}

/// Render a native model list as an OpenAI `list` object
pub fn native_to_openai_models(list: &Value, created: i64) -> Value {
    let data: Vec<Value> = list
        .get("models")
        .and_then(|m| m.as_array())
        .map(|models| {
            models
                .iter()
                .filter_map(|m| m.get("name").and_then(|n| n.as_str()))
                .map(|name| {
                    json!({
                        "id": bare_id(name),
                        "object": "model",
                        "created": created,
                        "owned_by": "google"
                    })
                })
                .collect()
        })
        .unwrap_or_default();
    json!({ "object": "list", "data": data })
}

//! Message normalization.
//!
//! Turns the loosely-typed client message array into [`ChatMessage`] values
//! in the provider's strict content schema. Normalization never fails:
//! malformed input degrades to an empty or stringified message.

use serde_json::{Map, Value};

use super::types::{ChatMessage, ContentPart, MessageContent, Role};

/// A normalized message history plus the signals routing needs.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Conversation {
    pub messages: Vec<ChatMessage>,
    /// Some message carried a top-level `image_url` field.
    pub legacy_image: bool,
}

impl Conversation {
    /// True when any message has an image part or a legacy image field.
    pub fn has_image(&self) -> bool {
        self.legacy_image || self.messages.iter().any(ChatMessage::has_image)
    }

    /// Text of the most recent `user` message, if there is one.
    pub fn last_user_text(&self) -> Option<String> {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(ChatMessage::text)
    }
}

/// Normalize a client message array.
///
/// Entries that are not JSON objects are dropped.
pub fn normalize_messages(raw: &[Value]) -> Conversation {
    let mut conversation = Conversation::default();

    for (idx, entry) in raw.iter().enumerate() {
        let Value::Object(message) = entry else {
            tracing::warn!(index = idx, "Dropping message that is not a JSON object");
            continue;
        };

        let legacy_image = legacy_image_url(message);
        conversation.legacy_image |= legacy_image.is_some();

        let content = normalize_content(idx, message.get("content"), legacy_image);
        conversation.messages.push(ChatMessage {
            role: Role::from_client(message.get("role").and_then(Value::as_str)),
            content,
        });
    }

    conversation
}

fn normalize_content(idx: usize, content: Option<&Value>, legacy_image: Option<&str>) -> MessageContent {
    match (content, legacy_image) {
        // Legacy single-image message: text first, then the image.
        (content, Some(url)) if !matches!(content, Some(Value::Array(_))) => {
            MessageContent::Parts(vec![
                ContentPart::text(scalar_text(content)),
                ContentPart::image(url),
            ])
        }
        (Some(Value::Array(items)), _) => {
            let parts: Vec<ContentPart> = items.iter().filter_map(content_part).collect();
            if parts.is_empty() {
                MessageContent::Text(String::new())
            } else {
                MessageContent::Parts(parts)
            }
        }
        (content, _) => {
            if !matches!(content, Some(Value::String(_))) {
                tracing::debug!(index = idx, "Coercing non-string message content");
            }
            MessageContent::Text(scalar_text(content))
        }
    }
}

/// The top-level `image_url` of a legacy message: a non-empty string, or an
/// object holding a non-empty `url`.
fn legacy_image_url(message: &Map<String, Value>) -> Option<&str> {
    image_reference(message.get("image_url")?)
}

fn image_reference(value: &Value) -> Option<&str> {
    let url = match value {
        Value::String(url) => url.as_str(),
        Value::Object(obj) => obj.get("url")?.as_str()?,
        _ => return None,
    };
    (!url.is_empty()).then_some(url)
}

/// Convert one content-list entry; entries with other tags are dropped, as
/// are image entries without a usable URL.
fn content_part(item: &Value) -> Option<ContentPart> {
    let item = item.as_object()?;
    match item.get("type")?.as_str()? {
        "text" => Some(ContentPart::text(scalar_text(item.get("text")))),
        "image_url" => Some(ContentPart::image(image_reference(item.get("image_url")?)?)),
        _ => None,
    }
}

/// String form of a scalar: strings as-is, numbers and booleans in their
/// textual form, everything else (absent, null, objects) as the empty string.
fn scalar_text(value: Option<&Value>) -> String {
    match value {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        Some(Value::Bool(b)) => b.to_string(),
        _ => String::new(),
    }
}

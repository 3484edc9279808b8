//! Client and upstream wire types.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::RelayConfig;
use crate::error::{Error, Result};

/// Role of a chat message after normalization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    /// Map a client-supplied role; anything unrecognized or missing becomes `user`.
    pub fn from_client(role: Option<&str>) -> Self {
        match role.map(|r| r.trim().to_ascii_lowercase()).as_deref() {
            Some("system") => Role::System,
            Some("assistant") => Role::Assistant,
            _ => Role::User,
        }
    }
}

/// Image reference inside a content part.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageUrl {
    pub url: String,
}

/// One typed piece of multimodal content, in the provider's shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
}

impl ContentPart {
    pub fn text(text: impl Into<String>) -> Self {
        ContentPart::Text { text: text.into() }
    }

    pub fn image(url: impl Into<String>) -> Self {
        ContentPart::ImageUrl {
            image_url: ImageUrl { url: url.into() },
        }
    }
}

/// Message content: plain text or a non-empty ordered list of parts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

/// A chat message safe to hand to the upstream API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: MessageContent,
}

impl ChatMessage {
    pub fn has_image(&self) -> bool {
        match &self.content {
            MessageContent::Text(_) => false,
            MessageContent::Parts(parts) => parts
                .iter()
                .any(|p| matches!(p, ContentPart::ImageUrl { .. })),
        }
    }

    /// The textual content; text parts are joined with a single space.
    pub fn text(&self) -> String {
        match &self.content {
            MessageContent::Text(text) => text.clone(),
            MessageContent::Parts(parts) => parts
                .iter()
                .filter_map(|p| match p {
                    ContentPart::Text { text } => Some(text.as_str()),
                    ContentPart::ImageUrl { .. } => None,
                })
                .collect::<Vec<_>>()
                .join(" "),
        }
    }
}

/// A client chat request, extracted leniently from the JSON body.
///
/// Only `messages` is validated here; every other field degrades to its
/// default when missing or of the wrong type.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub messages: Vec<Value>,
    pub model: Option<String>,
    pub temperature: Option<Value>,
    pub max_tokens: Option<Value>,
    /// Transport preference; defaults to streaming.
    pub stream: bool,
}

impl ChatRequest {
    pub fn from_json(body: Value) -> Result<Self> {
        let Value::Object(mut body) = body else {
            return Err(Error::BadRequest(
                "Request body must be a JSON object.".to_string(),
            ));
        };

        let messages = match body.remove("messages") {
            Some(Value::Array(messages)) => messages,
            _ => {
                return Err(Error::BadRequest(
                    "Messages are required and must be an array.".to_string(),
                ))
            }
        };

        let model = match body.remove("model") {
            Some(Value::String(model)) => Some(model),
            _ => None,
        };

        let stream = body
            .get("stream")
            .and_then(Value::as_bool)
            .unwrap_or(true);

        Ok(Self {
            messages,
            model,
            temperature: body.remove("temperature").filter(|v| !v.is_null()),
            max_tokens: body.remove("max_tokens").filter(|v| !v.is_null()),
            stream,
        })
    }
}

/// Read a number from a JSON number or a numeric string.
fn numeric(value: &Value) -> Option<f64> {
    let n = match value {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s.trim().parse::<f64>().ok()?,
        _ => return None,
    };
    n.is_finite().then_some(n)
}

/// Sampling parameters after clamping.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GenerationParams {
    pub temperature: f32,
    pub max_tokens: u32,
}

impl GenerationParams {
    pub const MAX_TEMPERATURE: f32 = 2.0;

    /// Clamp client-supplied parameters against the relay limits.
    ///
    /// Temperature falls back to the configured default when missing or
    /// non-numeric, and is held to `[0, 2]`. `max_tokens` falls back to the
    /// cap when missing, non-numeric or not positive, and never exceeds it.
    pub fn resolve(temperature: Option<&Value>, max_tokens: Option<&Value>, relay: &RelayConfig) -> Self {
        let temperature = temperature
            .and_then(numeric)
            .map(|t| (t as f32).clamp(0.0, Self::MAX_TEMPERATURE))
            .unwrap_or(relay.default_temperature);

        let cap = relay.max_tokens_cap;
        let max_tokens = max_tokens
            .and_then(numeric)
            .map(f64::trunc)
            .filter(|n| *n >= 1.0)
            .map(|n| if n >= cap as f64 { cap } else { n as u32 })
            .unwrap_or(cap);

        Self {
            temperature,
            max_tokens,
        }
    }
}

/// Body sent to the upstream chat-completion endpoint.
#[derive(Debug, Serialize)]
pub struct UpstreamRequest<'a> {
    pub model: &'a str,
    pub messages: &'a [ChatMessage],
    pub stream: bool,
    pub temperature: f32,
    pub max_tokens: u32,
}

/// Non-streaming upstream completion (only the fields the relay reads).
#[derive(Debug, Clone, Deserialize)]
pub struct ChatCompletionResponse {
    #[serde(default)]
    pub choices: Vec<Choice>,
}

/// A completion choice.
#[derive(Debug, Clone, Deserialize)]
pub struct Choice {
    pub message: AssistantMessage,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AssistantMessage {
    #[serde(default)]
    pub content: Option<String>,
}

impl ChatCompletionResponse {
    /// Text of the first choice, empty when the provider returned none.
    pub fn into_text(self) -> String {
        self.choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .unwrap_or_default()
    }
}

/// Event delivered to the client on the streaming transport.
///
/// Zero or more `Content` events are followed by exactly one terminal
/// `Done` or `Error` event.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Content(String),
    Done,
    Error(String),
}

impl StreamEvent {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, StreamEvent::Content(_))
    }

    pub fn to_json(&self) -> Value {
        match self {
            StreamEvent::Content(content) => serde_json::json!({ "content": content }),
            StreamEvent::Done => serde_json::json!({ "done": true }),
            StreamEvent::Error(error) => serde_json::json!({ "error": error }),
        }
    }

    /// Encode as one SSE frame: `data: <json>\n\n`.
    pub fn to_frame(&self) -> Bytes {
        Bytes::from(format!("data: {}\n\n", self.to_json()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn role_from_client_defaults_to_user() {
        assert_eq!(Role::from_client(Some("system")), Role::System);
        assert_eq!(Role::from_client(Some("Assistant")), Role::Assistant);
        assert_eq!(Role::from_client(Some("tool")), Role::User);
        assert_eq!(Role::from_client(None), Role::User);
    }

    #[test]
    fn message_serializes_in_provider_shape() {
        let message = ChatMessage {
            role: Role::User,
            content: MessageContent::Parts(vec![
                ContentPart::text("what is this?"),
                ContentPart::image("https://img.example/cat.png"),
            ]),
        };
        let value = serde_json::to_value(&message).unwrap();
        assert_eq!(
            value,
            json!({
                "role": "user",
                "content": [
                    {"type": "text", "text": "what is this?"},
                    {"type": "image_url", "image_url": {"url": "https://img.example/cat.png"}}
                ]
            })
        );
        assert!(message.has_image());
        assert_eq!(message.text(), "what is this?");
    }

    #[test]
    fn chat_request_requires_message_array() {
        let err = ChatRequest::from_json(json!({"model": "auto"})).unwrap_err();
        assert!(matches!(err, Error::BadRequest(_)));

        let err = ChatRequest::from_json(json!({"messages": "hi"})).unwrap_err();
        assert!(matches!(err, Error::BadRequest(_)));

        let err = ChatRequest::from_json(json!(["not", "an", "object"])).unwrap_err();
        assert!(matches!(err, Error::BadRequest(_)));
    }

    #[test]
    fn chat_request_lenient_fields() {
        let request = ChatRequest::from_json(json!({
            "messages": [],
            "model": 42,
            "stream": "no",
            "temperature": null
        }))
        .unwrap();
        assert!(request.model.is_none());
        assert!(request.stream, "non-boolean stream flag keeps the default");
        assert!(request.temperature.is_none());

        let request =
            ChatRequest::from_json(json!({"messages": [], "model": "auto", "stream": false}))
                .unwrap();
        assert_eq!(request.model.as_deref(), Some("auto"));
        assert!(!request.stream);
    }

    fn params(temperature: Value, max_tokens: Value) -> GenerationParams {
        GenerationParams::resolve(Some(&temperature), Some(&max_tokens), &RelayConfig::default())
    }

    #[test]
    fn generation_params_defaults() {
        let p = GenerationParams::resolve(None, None, &RelayConfig::default());
        assert_eq!(p.temperature, 0.7);
        assert_eq!(p.max_tokens, 4096);

        let p = params(json!("warm"), json!({"a": 1}));
        assert_eq!(p.temperature, 0.7);
        assert_eq!(p.max_tokens, 4096);
    }

    #[test]
    fn generation_params_clamped() {
        let p = params(json!(5.0), json!(100_000));
        assert_eq!(p.temperature, 2.0);
        assert_eq!(p.max_tokens, 4096);

        let p = params(json!(-1), json!(-20));
        assert_eq!(p.temperature, 0.0);
        assert_eq!(p.max_tokens, 4096);

        let p = params(json!("0.2"), json!("512.9"));
        assert_eq!(p.temperature, 0.2);
        assert_eq!(p.max_tokens, 512);

        let p = params(json!(0), json!(1));
        assert_eq!(p.temperature, 0.0, "zero is a valid temperature");
        assert_eq!(p.max_tokens, 1);
    }

    #[test]
    fn stream_event_frames() {
        assert_eq!(
            StreamEvent::Content("Hel".to_string()).to_frame(),
            Bytes::from_static(b"data: {\"content\":\"Hel\"}\n\n")
        );
        assert_eq!(
            StreamEvent::Done.to_frame(),
            Bytes::from_static(b"data: {\"done\":true}\n\n")
        );
        assert_eq!(
            StreamEvent::Error("boom".to_string()).to_frame(),
            Bytes::from_static(b"data: {\"error\":\"boom\"}\n\n")
        );
        assert!(StreamEvent::Done.is_terminal());
        assert!(!StreamEvent::Content(String::new()).is_terminal());
    }

    #[test]
    fn completion_response_text() {
        let response: ChatCompletionResponse = serde_json::from_value(json!({
            "id": "chatcmpl-1",
            "choices": [{"index": 0, "message": {"role": "assistant", "content": "Hello"}}]
        }))
        .unwrap();
        assert_eq!(response.into_text(), "Hello");

        let empty: ChatCompletionResponse = serde_json::from_value(json!({"choices": []})).unwrap();
        assert_eq!(empty.into_text(), "");
    }
}

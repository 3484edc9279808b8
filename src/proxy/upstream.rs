//! HTTP client for the OpenAI-compatible completion endpoint.

use std::time::Duration;

use axum::http::header;
use reqwest::Client;
use serde_json::Value;

use super::stream::{error_message, fragment_stream, FragmentStream};
use super::types::{ChatCompletionResponse, ChatMessage, GenerationParams, UpstreamRequest};
use crate::config::{ApiKey, UpstreamConfig};
use crate::error::{Error, Result};

/// Client for one upstream provider.
#[derive(Clone)]
pub struct UpstreamClient {
    http: Client,
    completions_url: String,
    api_key: Option<ApiKey>,
    request_timeout: Duration,
}

impl UpstreamClient {
    pub fn new(config: &UpstreamConfig) -> Result<Self> {
        // No whole-request timeout on the client: streams are supervised by
        // the relay's idle timeout instead.
        let http = Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .build()?;

        Ok(Self {
            http,
            completions_url: format!("{}/chat/completions", config.url.trim_end_matches('/')),
            api_key: config.api_key.clone(),
            request_timeout: Duration::from_secs(config.request_timeout_secs),
        })
    }

    pub fn completions_url(&self) -> &str {
        &self.completions_url
    }

    /// Open a streaming completion and return its text fragments.
    ///
    /// An upstream that answers with a buffered JSON completion instead of
    /// an event stream yields its whole text as a single fragment.
    pub async fn stream_completion(
        &self,
        model: &str,
        messages: &[ChatMessage],
        params: GenerationParams,
    ) -> Result<FragmentStream> {
        let response = self.send(model, messages, params, true, None).await?;
        if !is_json(&response) {
            return Ok(fragment_stream(response.bytes_stream()));
        }

        tracing::warn!(model = %model, "Upstream did not stream, relaying buffered completion");
        let completion: ChatCompletionResponse = response.json().await.map_err(|e| {
            tracing::error!(error = %e, "Failed to parse buffered upstream response");
            Error::UpstreamStream(format!("unreadable buffered completion: {}", e))
        })?;

        let text = completion.into_text();
        let fragments = (!text.is_empty()).then_some(Ok(text));
        let stream: FragmentStream = Box::pin(futures::stream::iter(fragments));
        Ok(stream)
    }

    /// Run a non-streaming completion and return the assistant text.
    pub async fn complete(
        &self,
        model: &str,
        messages: &[ChatMessage],
        params: GenerationParams,
    ) -> Result<String> {
        let response = self
            .send(model, messages, params, false, Some(self.request_timeout))
            .await?;

        let completion: ChatCompletionResponse = response.json().await.map_err(|e| {
            tracing::error!(error = %e, "Failed to parse upstream response");
            Error::Http(e)
        })?;

        Ok(completion.into_text())
    }

    async fn send(
        &self,
        model: &str,
        messages: &[ChatMessage],
        params: GenerationParams,
        stream: bool,
        timeout: Option<Duration>,
    ) -> Result<reqwest::Response> {
        let body = UpstreamRequest {
            model,
            messages,
            stream,
            temperature: params.temperature,
            max_tokens: params.max_tokens,
        };

        let mut request = self
            .http
            .post(&self.completions_url)
            .header(header::CONTENT_TYPE, "application/json")
            .json(&body);

        if let Some(api_key) = &self.api_key {
            request = request.header(
                header::AUTHORIZATION,
                format!("Bearer {}", api_key.expose_secret()),
            );
        }

        if let Some(timeout) = timeout {
            request = request.timeout(timeout);
        }

        let response = request.send().await.map_err(|e| {
            tracing::error!(error = %e, model = %model, "Failed to reach upstream");
            Error::Http(e)
        })?;

        let status = response.status();
        if !status.is_success() {
            let error_body = response.text().await.unwrap_or_default();
            tracing::error!(
                status = %status,
                model = %model,
                body = %error_body,
                "Upstream returned error"
            );
            return Err(Error::Upstream {
                status: status.as_u16(),
                message: upstream_error_message(&error_body),
            });
        }

        Ok(response)
    }
}

/// Whether the response carries a JSON document rather than an event stream.
fn is_json(response: &reqwest::Response) -> bool {
    response
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(';').next())
        .map(|mime| {
            let mime = mime.trim().to_ascii_lowercase();
            mime == "application/json" || mime.ends_with("+json")
        })
        .unwrap_or(false)
}

/// Extract `error.message` from a failure body, falling back to the raw text.
fn upstream_error_message(body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| v.get("error").filter(|e| !e.is_null()).map(error_message))
        .unwrap_or_else(|| {
            let trimmed = body.trim();
            if trimmed.is_empty() {
                "no response body".to_string()
            } else {
                trimmed.to_string()
            }
        })
}

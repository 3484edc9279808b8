//! HTTP request handlers.

use std::time::Instant;

use axum::{
    extract::{rejection::JsonRejection, rejection::QueryRejection, Extension, Query, State},
    http::{header, HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;
use serde_json::Value;
use sqlx::SqlitePool;

use super::images::{build_image_url, random_seed, ImageRequest};
use super::normalize::normalize_messages;
use super::relay::{RelayRequest, RelayStatus};
use super::server::{AppState, RequestId};
use super::types::{ChatRequest, GenerationParams};
use crate::error::Error;
use crate::router::ModelSelection;
use crate::storage::logging::{spawn_log_write, RequestLog};
use crate::storage::logs::{clamp_limit, list_recent};

/// Response header: model the request was routed to.
pub const MODEL_HEADER: &str = "x-chatrelay-model";
/// Response header: why that model was chosen.
pub const ROUTE_REASON_HEADER: &str = "x-chatrelay-route-reason";

/// Attach routing headers to a chat response.
fn attach_route_headers(response: &mut Response, selection: &ModelSelection) {
    let headers = response.headers_mut();
    if let Ok(value) = HeaderValue::from_str(&selection.routed) {
        headers.insert(HeaderName::from_static(MODEL_HEADER), value);
    }
    headers.insert(
        HeaderName::from_static(ROUTE_REASON_HEADER),
        HeaderValue::from_static(selection.reason.as_str()),
    );
}

/// Map a body rejection, keeping the 413 for bodies over the size limit.
fn body_error(rejection: JsonRejection) -> Error {
    if rejection.status() == StatusCode::PAYLOAD_TOO_LARGE {
        Error::PayloadTooLarge(rejection.body_text())
    } else {
        Error::BadRequest(rejection.body_text())
    }
}

/// Log fields known once routing is done; completed when the relay finishes.
///
/// Dropped without [`PendingLog::finish`] (the client went away while the
/// handler was still awaiting upstream), it records a `disconnected` row.
struct PendingLog {
    db: Option<SqlitePool>,
    correlation_id: String,
    requested_model: Option<String>,
    routed_model: String,
    route_reason: String,
    streaming: bool,
    message_count: usize,
    start: Instant,
    finished: bool,
}

impl PendingLog {
    fn finish(mut self, outcome: RelayStatus, output_chars: usize, error_message: Option<String>) {
        self.record(outcome, output_chars, error_message);
    }

    fn record(&mut self, outcome: RelayStatus, output_chars: usize, error_message: Option<String>) {
        self.finished = true;
        let latency_ms = self.start.elapsed().as_millis() as i64;
        tracing::info!(
            correlation_id = %self.correlation_id,
            model = %self.routed_model,
            outcome = %outcome,
            output_chars,
            latency_ms,
            "Chat request finished"
        );

        let Some(pool) = &self.db else {
            return;
        };
        spawn_log_write(
            pool,
            RequestLog {
                correlation_id: std::mem::take(&mut self.correlation_id),
                timestamp: chrono::Utc::now().to_rfc3339(),
                requested_model: self.requested_model.take(),
                routed_model: std::mem::take(&mut self.routed_model),
                route_reason: std::mem::take(&mut self.route_reason),
                streaming: self.streaming,
                message_count: self.message_count,
                output_chars,
                latency_ms,
                outcome: outcome.as_str().to_string(),
                error_message,
            },
        );
    }
}

impl Drop for PendingLog {
    fn drop(&mut self) {
        if !self.finished {
            self.record(RelayStatus::Disconnected, 0, None);
        }
    }
}

/// Structured routing decision for one chat request.
fn log_route_decision(request_id: &RequestId, selection: &ModelSelection) {
    tracing::info!(
        correlation_id = %request_id.0,
        requested = ?selection.requested,
        routed = %selection.routed,
        reason = %selection.reason,
        "Routed request"
    );
}

/// Handle POST /api/chat (and the legacy POST /chat)
pub async fn chat(
    State(state): State<AppState>,
    Extension(request_id): Extension<RequestId>,
    body: Result<Json<Value>, JsonRejection>,
) -> Result<Response, Error> {
    let start = Instant::now();
    let Json(body) = body.map_err(body_error)?;
    let request = ChatRequest::from_json(body)?;

    tracing::info!(
        requested_model = ?request.model,
        messages = request.messages.len(),
        stream = request.stream,
        "Received chat request"
    );

    let conversation = normalize_messages(&request.messages);
    let selection = state.router.route(&conversation, request.model.as_deref());
    log_route_decision(&request_id, &selection);
    let params = GenerationParams::resolve(
        request.temperature.as_ref(),
        request.max_tokens.as_ref(),
        &state.config.relay,
    );

    let relay_request = RelayRequest {
        model: selection.routed.clone(),
        messages: conversation.messages,
        params,
    };

    let pending = PendingLog {
        db: state.db.clone(),
        correlation_id: request_id.0.to_string(),
        requested_model: selection.requested.clone(),
        routed_model: selection.routed.clone(),
        route_reason: selection.reason.to_string(),
        streaming: request.stream,
        message_count: relay_request.messages.len(),
        start,
        finished: false,
    };

    let mut response = if request.stream {
        let (body, handle) = state.relay.spawn_stream(relay_request);

        tokio::spawn(async move {
            match handle.await {
                Ok(outcome) => {
                    let output_chars = outcome.output_chars();
                    pending.finish(outcome.status, output_chars, outcome.error);
                }
                Err(e) => {
                    tracing::error!(error = %e, "Relay task failed");
                    pending.finish(RelayStatus::Failed, 0, Some(e.to_string()));
                }
            }
        });

        Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, "text/event-stream")
            .header(header::CACHE_CONTROL, "no-cache")
            .body(body)
            .map_err(|e| Error::Internal(e.to_string()))?
    } else {
        match state.relay.complete(&relay_request).await {
            Ok(content) => {
                pending.finish(RelayStatus::Completed, content.chars().count(), None);
                Json(serde_json::json!({ "content": content })).into_response()
            }
            Err(e) => {
                pending.finish(RelayStatus::Failed, 0, Some(e.to_string()));
                e.into_response()
            }
        }
    };

    attach_route_headers(&mut response, &selection);
    Ok(response)
}

/// Handle GET /api/health
pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "upstream_key_configured": state.config.upstream.api_key.is_some(),
        "request_log": state.db.is_some(),
    }))
}

/// Handle GET /api/models - the catalog, led by the `auto` entry
pub async fn list_models(State(state): State<AppState>) -> impl IntoResponse {
    let auto = serde_json::json!({
        "id": state.router.config().auto_sentinel,
        "object": "model",
        "name": "Auto",
        "description": "Picks a model per request from the conversation",
        "owned_by": "chatrelay",
    });

    let models = std::iter::once(auto).chain(state.config.models.iter().map(|m| {
        serde_json::json!({
            "id": m.id,
            "object": "model",
            "name": m.name,
            "description": m.description,
            "context_window": m.context_window,
            "owned_by": "upstream",
        })
    }));

    Json(serde_json::json!({
        "object": "list",
        "data": models.collect::<Vec<_>>()
    }))
}

/// Handle POST /api/generate-image
pub async fn generate_image(
    State(state): State<AppState>,
    body: Result<Json<ImageRequest>, JsonRejection>,
) -> Result<Json<Value>, Error> {
    let Json(request) = body.map_err(body_error)?;
    let url = build_image_url(&state.config.images, &request, random_seed())?;

    tracing::info!(model = %request.target_model(), "Generated image URL");

    Ok(Json(serde_json::json!({ "imageUrl": url.to_string() })))
}

/// Query parameters for GET /api/requests.
#[derive(Debug, Deserialize)]
pub struct ListRequestsParams {
    pub limit: Option<u32>,
}

/// Handle GET /api/requests - most recent request log rows
pub async fn list_requests(
    State(state): State<AppState>,
    params: Result<Query<ListRequestsParams>, QueryRejection>,
) -> Result<Json<Value>, Error> {
    let Query(params) = params.map_err(|e| Error::BadRequest(e.body_text()))?;
    let pool = state
        .db
        .as_ref()
        .ok_or_else(|| Error::Unavailable("Request log is not configured".to_string()))?;

    let rows = list_recent(pool, clamp_limit(params.limit)).await?;

    Ok(Json(serde_json::json!({ "requests": rows })))
}

/// Plain 404 body in the crate's error shape.
pub async fn not_found() -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(serde_json::json!({ "error": "Not found" })),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::RouteReason;
    use axum::body::Body;
    use std::io::Write;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tempfile::TempDir;

    /// In-memory log sink for asserting on emitted events.
    #[derive(Clone, Default)]
    struct CapturedLogs(Arc<Mutex<Vec<u8>>>);

    impl Write for CapturedLogs {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn pending(db: Option<SqlitePool>) -> PendingLog {
        PendingLog {
            db,
            correlation_id: "req-1".to_string(),
            requested_model: None,
            routed_model: "llama-3.1-8b-instant".to_string(),
            route_reason: "length-default".to_string(),
            streaming: false,
            message_count: 1,
            start: Instant::now(),
            finished: false,
        }
    }

    fn empty_response() -> Response {
        Response::builder()
            .status(StatusCode::OK)
            .body(Body::empty())
            .unwrap()
    }

    #[test]
    fn test_attach_route_headers() {
        let mut response = empty_response();
        attach_route_headers(
            &mut response,
            &ModelSelection {
                requested: Some("mixtral-8x7b".to_string()),
                routed: "llama-3.3-70b-versatile".to_string(),
                reason: RouteReason::DecommissionedFallback,
            },
        );
        let headers = response.headers();
        assert_eq!(headers.get(MODEL_HEADER).unwrap(), "llama-3.3-70b-versatile");
        assert_eq!(
            headers.get(ROUTE_REASON_HEADER).unwrap(),
            "decommissioned-fallback"
        );
    }

    #[test]
    fn test_unrepresentable_model_id_skips_header() {
        let mut response = empty_response();
        attach_route_headers(
            &mut response,
            &ModelSelection {
                requested: Some("bad\nid".to_string()),
                routed: "bad\nid".to_string(),
                reason: RouteReason::Explicit,
            },
        );
        assert!(response.headers().get(MODEL_HEADER).is_none());
        assert_eq!(
            response.headers().get(ROUTE_REASON_HEADER).unwrap(),
            "explicit"
        );
    }

    #[test]
    fn test_route_decision_is_logged_with_fields() {
        let logs = CapturedLogs::default();
        let writer = logs.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .with_ansi(false)
            .finish();

        tracing::subscriber::with_default(subscriber, || {
            log_route_decision(
                &RequestId(uuid::Uuid::nil()),
                &ModelSelection {
                    requested: Some("mixtral-8x7b".to_string()),
                    routed: "llama-3.3-70b-versatile".to_string(),
                    reason: RouteReason::DecommissionedFallback,
                },
            );
        });

        let output = String::from_utf8(logs.0.lock().unwrap().clone()).unwrap();
        assert!(output.contains("Routed request"), "{}", output);
        assert!(output.contains("routed=llama-3.3-70b-versatile"), "{}", output);
        assert!(output.contains("reason=decommissioned-fallback"), "{}", output);
        assert!(output.contains("requested=Some(\"mixtral-8x7b\")"), "{}", output);
    }

    #[tokio::test]
    async fn test_dropped_pending_log_records_disconnect() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("requests.db");
        let pool = crate::storage::init_pool(path.to_str().unwrap()).await.unwrap();

        drop(pending(Some(pool.clone())));

        let mut rows = Vec::new();
        for _ in 0..100 {
            rows = list_recent(&pool, 10).await.unwrap();
            if !rows.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].correlation_id, "req-1");
        assert_eq!(rows[0].outcome, "disconnected");
        assert!(!rows[0].streaming);
    }

    #[tokio::test]
    async fn test_finished_pending_log_writes_once() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("requests.db");
        let pool = crate::storage::init_pool(path.to_str().unwrap()).await.unwrap();

        pending(Some(pool.clone())).finish(RelayStatus::Completed, 12, None);

        let mut rows = Vec::new();
        for _ in 0..100 {
            rows = list_recent(&pool, 10).await.unwrap();
            if !rows.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        // Give a stray drop-time write a chance to land
        tokio::time::sleep(Duration::from_millis(100)).await;
        let rows_after = list_recent(&pool, 10).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows_after.len(), 1);
        assert_eq!(rows_after[0].outcome, "completed");
        assert_eq!(rows_after[0].output_chars, 12);
    }
}

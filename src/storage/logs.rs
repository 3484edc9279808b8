//! Query functions for the request listing endpoint.

use serde::Serialize;
use sqlx::SqlitePool;

/// Rows returned when the client does not ask for a count.
pub const DEFAULT_LIMIT: u32 = 50;
/// Upper bound on rows per listing.
pub const MAX_LIMIT: u32 = 500;

/// A single request log row from the database.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct LogRow {
    pub id: i64,
    pub correlation_id: String,
    pub timestamp: String,
    pub requested_model: Option<String>,
    pub routed_model: String,
    pub route_reason: String,
    pub streaming: bool,
    pub message_count: i64,
    pub output_chars: i64,
    pub latency_ms: i64,
    pub outcome: String,
    pub error_message: Option<String>,
}

/// Clamp a client-supplied limit to `1..=MAX_LIMIT`.
pub fn clamp_limit(limit: Option<u32>) -> u32 {
    limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT)
}

/// Most recent request logs, newest first.
pub async fn list_recent(pool: &SqlitePool, limit: u32) -> Result<Vec<LogRow>, sqlx::Error> {
    sqlx::query_as::<_, LogRow>(
        "SELECT id, correlation_id, timestamp, requested_model, routed_model, route_reason, \
         streaming, message_count, output_chars, latency_ms, outcome, error_message \
         FROM requests ORDER BY id DESC LIMIT ?",
    )
    .bind(limit as i64)
    .fetch_all(pool)
    .await
}

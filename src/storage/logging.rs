//! Request logging data types and database operations.

use sqlx::SqlitePool;

/// A finished chat request, ready for database insertion.
///
/// All fields are owned types to satisfy `tokio::spawn` `'static` requirement.
#[derive(Debug, Clone)]
pub struct RequestLog {
    pub correlation_id: String,
    pub timestamp: String,
    pub requested_model: Option<String>,
    pub routed_model: String,
    pub route_reason: String,
    pub streaming: bool,
    pub message_count: usize,
    pub output_chars: usize,
    pub latency_ms: i64,
    /// `completed`, `failed` or `disconnected`.
    pub outcome: String,
    pub error_message: Option<String>,
}

impl RequestLog {
    /// Insert this log entry into the database.
    pub async fn insert(&self, pool: &SqlitePool) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT INTO requests (
                correlation_id, timestamp, requested_model, routed_model, route_reason,
                streaming, message_count, output_chars,
                latency_ms, outcome, error_message
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&self.correlation_id)
        .bind(&self.timestamp)
        .bind(self.requested_model.as_deref())
        .bind(&self.routed_model)
        .bind(&self.route_reason)
        .bind(self.streaming)
        .bind(self.message_count as i64)
        .bind(self.output_chars as i64)
        .bind(self.latency_ms)
        .bind(&self.outcome)
        .bind(self.error_message.as_deref())
        .execute(pool)
        .await?;
        Ok(())
    }
}

/// Spawn a fire-and-forget database write.
///
/// If the write fails, a warning is logged but the error is not propagated.
pub fn spawn_log_write(pool: &SqlitePool, log: RequestLog) {
    let pool = pool.clone();
    tokio::spawn(async move {
        if let Err(e) = log.insert(&pool).await {
            tracing::warn!(
                correlation_id = %log.correlation_id,
                error = %e,
                "Failed to write request log to database"
            );
        }
    });
}

//! HTTP server setup and configuration.

use axum::{
    extract::{DefaultBodyLimit, Request},
    http::{HeaderName, HeaderValue},
    middleware::{self, Next},
    response::Response,
    routing::{get, post},
    Router,
};
use sqlx::SqlitePool;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use super::handlers;
use super::relay::Relay;
use super::upstream::UpstreamClient;
use crate::config::Config;
use crate::error::Result;
use crate::router::ModelRouter;

/// Response header: correlation ID (UUID v4).
pub const REQUEST_ID_HEADER: &str = "x-chatrelay-request-id";

/// Correlation ID assigned to every incoming request.
#[derive(Debug, Clone, Copy)]
pub struct RequestId(pub Uuid);

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub router: Arc<ModelRouter>,
    pub relay: Relay,
    pub config: Arc<Config>,
    pub db: Option<SqlitePool>,
}

impl AppState {
    /// Build the router and upstream client from configuration.
    pub fn new(config: Config, db: Option<SqlitePool>) -> Result<Self> {
        let router = ModelRouter::new(config.routing.clone())?;
        let upstream = UpstreamClient::new(&config.upstream)?;
        let relay = Relay::new(upstream, config.relay.idle_timeout());

        Ok(Self {
            router: Arc::new(router),
            relay,
            config: Arc::new(config),
            db,
        })
    }
}

/// Assign a [`RequestId`] and echo it on the response.
async fn request_id_middleware(mut request: Request, next: Next) -> Response {
    let request_id = RequestId(Uuid::new_v4());
    request.extensions_mut().insert(request_id);

    let mut response = next.run(request).await;
    if let Ok(value) = HeaderValue::from_str(&request_id.0.to_string()) {
        response
            .headers_mut()
            .insert(HeaderName::from_static(REQUEST_ID_HEADER), value);
    }
    response
}

/// Create the axum router with all endpoints.
pub fn create_router(state: AppState) -> Router {
    let max_body_bytes = state.config.server.max_body_bytes;

    Router::new()
        .route("/api/chat", post(handlers::chat))
        // Legacy path served by the same pipeline
        .route("/chat", post(handlers::chat))
        .route("/api/health", get(handlers::health))
        .route("/api/models", get(handlers::list_models))
        .route("/api/generate-image", post(handlers::generate_image))
        .route("/api/requests", get(handlers::list_requests))
        .fallback(handlers::not_found)
        .layer(DefaultBodyLimit::max(max_body_bytes))
        .with_state(state)
        .layer(middleware::from_fn(request_id_middleware))
        .layer(TraceLayer::new_for_http())
}

/// Run the HTTP server.
pub async fn run_server(config: Config) -> anyhow::Result<()> {
    let listen_addr = config.server.listen.clone();

    let db = if config.database.is_some() && config.logging.log_requests {
        let db_path = config.database().path;
        let pool = crate::storage::init_pool(&db_path).await?;
        tracing::info!(path = %db_path, "Request log enabled");
        Some(pool)
    } else {
        None
    };

    let state = AppState::new(config, db)?;
    let app = create_router(state);

    let listener = tokio::net::TcpListener::bind(&listen_addr).await?;
    tracing::info!(address = %listen_addr, "Starting chatrelay server");

    axum::serve(listener, app).await?;

    Ok(())
}

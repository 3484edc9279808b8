//! HTTP relay module.
//!
//! This module provides the chat API: it normalizes client messages,
//! routes them to an upstream model and relays the completion back as
//! SSE frames or a single JSON body.

mod handlers;
pub mod images;
pub mod normalize;
pub mod relay;
mod server;
pub mod stream;
pub mod types;
pub mod upstream;

pub use handlers::{MODEL_HEADER, ROUTE_REASON_HEADER};
pub use normalize::{normalize_messages, Conversation};
pub use relay::{Relay, RelayOutcome, RelayRequest, RelayStatus};
pub use server::{create_router, run_server, AppState, RequestId, REQUEST_ID_HEADER};
pub use types::{ChatMessage, ContentPart, GenerationParams, MessageContent, Role, StreamEvent};
pub use upstream::UpstreamClient;

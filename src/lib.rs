//! chatrelay - model-routing streaming relay for OpenAI-compatible chat APIs
//!
//! This library provides the core functionality for the relay: message
//! normalization, model routing, upstream streaming and the request log.

pub mod config;
pub mod error;
pub mod proxy;
pub mod router;
pub mod storage;

pub use config::Config;
pub use error::{Error, Result};

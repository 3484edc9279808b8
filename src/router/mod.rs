//! Router module for upstream model selection.
//!
//! This module decides which upstream model serves a request based on:
//! - Image content (vision override)
//! - Retired model substitution
//! - Explicit client choice
//! - Keyword and length heuristics for `auto`

mod heuristics;
mod selector;

pub use heuristics::{QueryClassifier, QueryProfile};
pub use selector::{ModelRouter, ModelSelection, RouteReason};

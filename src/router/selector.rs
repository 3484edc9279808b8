//! Upstream model selection logic.

use serde::Serialize;

use super::heuristics::{QueryClassifier, QueryProfile};
use crate::config::{ConfigError, RoutingConfig};
use crate::proxy::normalize::Conversation;

/// Why a model was chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum RouteReason {
    /// The client named a usable model.
    Explicit,
    /// Image content forced the vision model.
    MultimodalOverride,
    /// The request was empty, named a retired model, or named an unknown namespace.
    DecommissionedFallback,
    /// `auto` resolved through a keyword or long-context predicate.
    HeuristicAuto,
    /// `auto` resolved through query length alone.
    LengthDefault,
}

impl RouteReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RouteReason::Explicit => "explicit",
            RouteReason::MultimodalOverride => "multimodal-override",
            RouteReason::DecommissionedFallback => "decommissioned-fallback",
            RouteReason::HeuristicAuto => "heuristic-auto",
            RouteReason::LengthDefault => "length-default",
        }
    }
}

impl std::fmt::Display for RouteReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The routing decision for one request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModelSelection {
    /// What the client asked for, if anything.
    pub requested: Option<String>,
    pub routed: String,
    pub reason: RouteReason,
}

/// Router resolving the upstream model id for each request.
///
/// Holds only immutable data, so one instance is shared by all requests.
#[derive(Debug, Clone)]
pub struct ModelRouter {
    config: RoutingConfig,
    classifier: QueryClassifier,
}

impl ModelRouter {
    /// Create a router from a routing table, compiling its vocabulary.
    pub fn new(config: RoutingConfig) -> Result<Self, ConfigError> {
        let classifier = QueryClassifier::new(&config.vocabulary)?;
        Ok(Self { config, classifier })
    }

    /// Resolve the model for a normalized conversation.
    ///
    /// Rules are a priority chain: vision override, retired/empty
    /// substitution, explicit id, `auto` heuristics, then a namespace check
    /// on the result. Never fails.
    pub fn route(&self, conversation: &Conversation, requested: Option<&str>) -> ModelSelection {
        let requested = requested.map(str::trim).filter(|id| !id.is_empty());
        let multimodal = conversation.has_image();

        let (mut routed, mut reason) = if multimodal {
            (
                self.config.vision_model.clone(),
                RouteReason::MultimodalOverride,
            )
        } else {
            match requested {
                None => (
                    self.config.default_model.clone(),
                    RouteReason::DecommissionedFallback,
                ),
                Some(id) => match self.retired_replacement(id) {
                    Some(replacement) => {
                        tracing::info!(
                            requested = %id,
                            replacement = %replacement,
                            "Substituting retired model"
                        );
                        (replacement.to_string(), RouteReason::DecommissionedFallback)
                    }
                    None if id == self.config.auto_sentinel => self.select_auto(conversation),
                    None => (id.to_string(), RouteReason::Explicit),
                },
            }
        };

        if !self.is_known_namespace(&routed) {
            let fallback = if multimodal {
                &self.config.vision_model
            } else {
                &self.config.default_model
            };
            tracing::warn!(
                model = %routed,
                fallback = %fallback,
                "Model namespace not served upstream"
            );
            routed = fallback.clone();
            if !multimodal {
                reason = RouteReason::DecommissionedFallback;
            }
        }

        ModelSelection {
            requested: requested.map(str::to_string),
            routed,
            reason,
        }
    }

    /// First retired-model rule whose matcher occurs in `id`.
    fn retired_replacement(&self, id: &str) -> Option<&str> {
        self.config
            .retired
            .iter()
            .find(|rule| id.contains(rule.matcher.as_str()))
            .map(|rule| rule.replacement.as_str())
    }

    /// Heuristic selection for the `auto` sentinel.
    fn select_auto(&self, conversation: &Conversation) -> (String, RouteReason) {
        let Some(query) = conversation.last_user_text() else {
            tracing::debug!("No user message to classify, using default model");
            return (
                self.config.default_model.clone(),
                RouteReason::LengthDefault,
            );
        };

        let profile = self
            .classifier
            .classify(&query, self.config.long_context_chars);
        let choice = self.pick(&profile);
        tracing::debug!(?profile, routed = %choice.0, "Auto-selected model");
        choice
    }

    /// Decision table. Long-context or writing outranks math or coding, which
    /// outranks the length split; predicate counts never matter.
    fn pick(&self, profile: &QueryProfile) -> (String, RouteReason) {
        let c = &self.config;
        if profile.long_context || profile.writing {
            (c.long_context_model.clone(), RouteReason::HeuristicAuto)
        } else if profile.math || profile.coding {
            (c.reasoning_model.clone(), RouteReason::HeuristicAuto)
        } else if profile.chars < c.short_query_chars {
            (c.fast_model.clone(), RouteReason::LengthDefault)
        } else {
            (c.versatile_model.clone(), RouteReason::LengthDefault)
        }
    }

    fn is_known_namespace(&self, id: &str) -> bool {
        match id.split_once('/') {
            None => true,
            Some((namespace, _)) => self.config.namespaces.iter().any(|n| n == namespace),
        }
    }

    /// Get the routing table.
    pub fn config(&self) -> &RoutingConfig {
        &self.config
    }
}

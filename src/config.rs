//! Configuration parsing and validation for chatrelay.

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::path::Path;
use std::time::Duration;

/// Root configuration structure.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub relay: RelayConfig,
    #[serde(default)]
    pub routing: RoutingConfig,
    /// Model catalog advertised on `GET /api/models`.
    #[serde(default = "default_catalog")]
    pub models: Vec<ModelEntry>,
    #[serde(default)]
    pub images: ImagesConfig,
    pub database: Option<DatabaseConfig>,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            upstream: UpstreamConfig::default(),
            relay: RelayConfig::default(),
            routing: RoutingConfig::default(),
            models: default_catalog(),
            images: ImagesConfig::default(),
            database: None,
            logging: LoggingConfig::default(),
        }
    }
}

/// HTTP server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Address to listen on (e.g., "127.0.0.1:3000")
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Largest accepted request body; base64 image data URLs need room
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

fn default_listen() -> String {
    "127.0.0.1:3000".to_string()
}

fn default_max_body_bytes() -> usize {
    50 * 1024 * 1024
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            max_body_bytes: default_max_body_bytes(),
        }
    }
}

/// Database configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Path to SQLite database file
    #[serde(default = "default_db_path")]
    pub path: String,
}

fn default_db_path() -> String {
    "./chatrelay.db".to_string()
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

/// API key wrapper that redacts in Debug/Display/Serialize and zeroizes on drop.
///
/// Only accessible via `.expose_secret()`, so every use is grep-auditable.
#[derive(Clone)]
pub struct ApiKey(SecretString);

impl ApiKey {
    /// Access the raw key value.
    pub fn expose_secret(&self) -> &str {
        self.0.expose_secret()
    }
}

impl std::fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[REDACTED]")
    }
}

impl std::fmt::Display for ApiKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[REDACTED]")
    }
}

impl Serialize for ApiKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str("[REDACTED]")
    }
}

impl<'de> serde::Deserialize<'de> for ApiKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        String::deserialize(deserializer).map(|s| ApiKey(SecretString::from(s)))
    }
}

impl From<String> for ApiKey {
    fn from(s: String) -> Self {
        ApiKey(SecretString::from(s))
    }
}

impl From<&str> for ApiKey {
    fn from(s: &str) -> Self {
        ApiKey(SecretString::from(s))
    }
}

/// How an API key was resolved.
#[derive(Debug, Clone, PartialEq)]
pub enum KeySource {
    /// Key was a literal string in config (no ${} references)
    Literal,
    /// Key contained ${VAR} references expanded from environment
    EnvExpanded,
    /// Key was auto-discovered from convention env var (holds var name)
    Convention(String),
    /// No key available
    None,
}

impl std::fmt::Display for KeySource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KeySource::Literal => write!(f, "config-literal"),
            KeySource::EnvExpanded => write!(f, "env-expanded"),
            KeySource::Convention(var) => write!(f, "convention ({})", var),
            KeySource::None => write!(f, "none"),
        }
    }
}

/// Upstream (OpenAI-compatible) completion API.
#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamConfig {
    /// Base URL, e.g. "https://api.groq.com/openai/v1"
    #[serde(default = "default_upstream_url")]
    pub url: String,
    pub api_key: Option<ApiKey>,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    /// Whole-request timeout for non-streaming completions.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

fn default_upstream_url() -> String {
    "https://api.groq.com/openai/v1".to_string()
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_request_timeout() -> u64 {
    120
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            url: default_upstream_url(),
            api_key: None,
            connect_timeout_secs: default_connect_timeout(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

/// Generation limits and stream supervision.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Longest wait for the next upstream fragment before the stream is failed.
    pub idle_timeout_secs: u64,
    pub default_temperature: f32,
    /// Hard cap on `max_tokens`; also the default when the client sends none.
    pub max_tokens_cap: u32,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: 60,
            default_temperature: 0.7,
            max_tokens_cap: 4096,
        }
    }
}

impl RelayConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

/// Substitution for a retired upstream model.
///
/// `matcher` is a case-sensitive substring of the requested id.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct RetiredModelRule {
    pub matcher: String,
    pub replacement: String,
}

impl RetiredModelRule {
    fn new(matcher: &str, replacement: &str) -> Self {
        Self {
            matcher: matcher.to_string(),
            replacement: replacement.to_string(),
        }
    }
}

/// Keyword lists for the automatic model heuristics.
///
/// Terms match whole words, case-insensitively; multi-word terms are allowed.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Vocabulary {
    pub coding: Vec<String>,
    pub math: Vec<String>,
    pub writing: Vec<String>,
    pub long_context: Vec<String>,
}

fn words(list: &[&str]) -> Vec<String> {
    list.iter().map(|w| w.to_string()).collect()
}

impl Default for Vocabulary {
    fn default() -> Self {
        Self {
            coding: words(&[
                "code", "program", "debug", "function", "class", "api", "javascript", "python",
                "java", "cpp", "rust", "go", "sql", "html", "css", "react", "node", "express",
                "algorithm", "git", "github", "bug", "error", "exception", "variable", "async",
                "await", "database", "docker", "kubernetes", "testing", "optimization",
                "refactor", "design pattern", "architecture", "microservices", "json", "xml",
                "yaml", "csv", "regex",
            ]),
            math: words(&[
                "math", "calculate", "equation", "formula", "algebra", "calculus", "geometry",
                "statistics", "probability", "matrix", "vector", "solve", "theorem", "proof",
                "graph", "data analysis", "machine learning", "neural network", "tensorflow",
                "pytorch", "pandas", "numpy",
            ]),
            writing: words(&[
                "write", "essay", "article", "blog", "story", "fiction", "novel", "poem",
                "grammar", "spelling", "edit", "proofread", "draft", "outline", "creative",
                "literature", "thesis", "dissertation", "academic", "translate", "language",
            ]),
            long_context: words(&[
                "document",
                "analyze",
                "summary",
                "extract",
                "find in",
                "search through",
                "large file",
                "entire text",
                "full content",
            ]),
        }
    }
}

/// Immutable routing table consumed by [`crate::router::ModelRouter`].
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RoutingConfig {
    /// Safe conversational default (empty or retired requests land here).
    pub default_model: String,
    pub vision_model: String,
    pub long_context_model: String,
    pub reasoning_model: String,
    pub fast_model: String,
    pub versatile_model: String,
    /// Requested id that asks for heuristic selection.
    pub auto_sentinel: String,
    /// Queries longer than this (in characters) count as long-context.
    pub long_context_chars: usize,
    /// Queries shorter than this (in characters) go to the fast model.
    pub short_query_chars: usize,
    /// Namespaces (the part before `/`) the upstream is known to serve.
    pub namespaces: Vec<String>,
    /// Evaluated in order; first matching rule wins.
    pub retired: Vec<RetiredModelRule>,
    pub vocabulary: Vocabulary,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        let safe_default = "llama-3.3-70b-versatile";
        Self {
            default_model: safe_default.to_string(),
            vision_model: "llama-3.2-11b-vision-preview".to_string(),
            long_context_model: "openai/gpt-oss-120b".to_string(),
            reasoning_model: "qwen/qwen3-32b".to_string(),
            fast_model: "llama-3.1-8b-instant".to_string(),
            versatile_model: safe_default.to_string(),
            auto_sentinel: "auto".to_string(),
            long_context_chars: 8000,
            short_query_chars: 200,
            namespaces: words(&["qwen", "openai", "groq"]),
            retired: vec![
                RetiredModelRule::new("mixtral", safe_default),
                RetiredModelRule::new("gemma-7b", safe_default),
                RetiredModelRule::new("llama3-", safe_default),
            ],
            vocabulary: Vocabulary::default(),
        }
    }
}

impl RoutingConfig {
    fn model_ids(&self) -> [(&'static str, &str); 6] {
        [
            ("default_model", &self.default_model),
            ("vision_model", &self.vision_model),
            ("long_context_model", &self.long_context_model),
            ("reasoning_model", &self.reasoning_model),
            ("fast_model", &self.fast_model),
            ("versatile_model", &self.versatile_model),
        ]
    }
}

/// A model advertised to clients.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ModelEntry {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub context_window: Option<u64>,
}

fn model_entry(id: &str, name: &str, description: &str, context_window: u64) -> ModelEntry {
    ModelEntry {
        id: id.to_string(),
        name: name.to_string(),
        description: description.to_string(),
        context_window: Some(context_window),
    }
}

fn default_catalog() -> Vec<ModelEntry> {
    vec![
        model_entry(
            "llama-3.3-70b-versatile",
            "Llama 3.3 70B",
            "High capability with excellent reasoning",
            128_000,
        ),
        model_entry(
            "llama-3.1-8b-instant",
            "Llama 3.1 8B",
            "Fast and efficient for most everyday tasks",
            128_000,
        ),
        model_entry(
            "llama-3.2-11b-vision-preview",
            "Llama 3.2 Vision",
            "Understand and analyze images",
            128_000,
        ),
        model_entry(
            "qwen/qwen3-32b",
            "Qwen 3 32B",
            "Reasoning model for logic, coding and math",
            131_072,
        ),
        model_entry(
            "openai/gpt-oss-120b",
            "GPT-OSS 120B",
            "Open-weight flagship for long-form writing and research",
            131_072,
        ),
        model_entry(
            "openai/gpt-oss-20b",
            "GPT-OSS 20B",
            "Efficient open-weight model",
            131_072,
        ),
        model_entry(
            "groq/compound",
            "Groq Compound",
            "Agentic system with web search and tools",
            131_072,
        ),
        model_entry(
            "groq/compound-mini",
            "Groq Compound Mini",
            "Efficient agentic system",
            131_072,
        ),
    ]
}

/// Image URL generation (`POST /api/generate-image`).
#[derive(Debug, Clone, Deserialize)]
pub struct ImagesConfig {
    #[serde(default = "default_images_url")]
    pub url: String,
    pub api_key: Option<ApiKey>,
}

fn default_images_url() -> String {
    "https://gen.pollinations.ai/image/".to_string()
}

impl Default for ImagesConfig {
    fn default() -> Self {
        Self {
            url: default_images_url(),
            api_key: None,
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Whether to log requests to database
    #[serde(default = "default_true")]
    pub log_requests: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            log_requests: true,
        }
    }
}

impl Config {
    /// Load configuration from a TOML file (keys taken literally).
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = read_config(path.as_ref())?;
        Self::parse_str(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse_str(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content).map_err(ConfigError::Parse)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.upstream.url.trim().is_empty() {
            return Err(ConfigError::Validation(
                "upstream.url must not be empty".to_string(),
            ));
        }

        for (field, id) in self.routing.model_ids() {
            if id.trim().is_empty() {
                return Err(ConfigError::Validation(format!(
                    "routing.{} must not be empty",
                    field
                )));
            }
        }

        for rule in &self.routing.retired {
            if rule.matcher.is_empty() || rule.replacement.is_empty() {
                return Err(ConfigError::Validation(format!(
                    "retired model rule '{}' -> '{}' has an empty side",
                    rule.matcher, rule.replacement
                )));
            }
        }

        if self.server.max_body_bytes == 0 {
            return Err(ConfigError::Validation(
                "server.max_body_bytes must be greater than zero".to_string(),
            ));
        }

        if self.relay.idle_timeout_secs == 0 {
            return Err(ConfigError::Validation(
                "relay.idle_timeout_secs must be greater than zero".to_string(),
            ));
        }

        if self.relay.max_tokens_cap == 0 {
            return Err(ConfigError::Validation(
                "relay.max_tokens_cap must be greater than zero".to_string(),
            ));
        }

        if let Err(e) = reqwest::Url::parse(&self.images.url) {
            return Err(ConfigError::Validation(format!(
                "images.url '{}' is not a valid URL: {}",
                self.images.url, e
            )));
        }

        crate::router::QueryClassifier::new(&self.routing.vocabulary)?;

        if self.upstream.api_key.is_none() {
            tracing::warn!("No upstream API key configured - upstream will likely reject requests");
        }

        Ok(())
    }

    /// Get database config with defaults.
    pub fn database(&self) -> DatabaseConfig {
        self.database.clone().unwrap_or_default()
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Configuration validation error: {0}")]
    Validation(String),

    #[error("Environment variable '{var}' not set for [{section}]: {message}")]
    EnvVar {
        var: String,
        section: String,
        message: String,
    },
}

fn read_config(path: &Path) -> Result<String, ConfigError> {
    std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
        path: path.display().to_string(),
        source: e,
    })
}

/// Raw upstream section; `api_key` may contain `${VAR}` references not yet expanded.
#[derive(Deserialize)]
pub struct RawUpstreamConfig {
    #[serde(default = "default_upstream_url")]
    url: String,
    api_key: Option<String>,
    #[serde(default = "default_connect_timeout")]
    connect_timeout_secs: u64,
    #[serde(default = "default_request_timeout")]
    request_timeout_secs: u64,
}

impl Default for RawUpstreamConfig {
    fn default() -> Self {
        Self {
            url: default_upstream_url(),
            api_key: None,
            connect_timeout_secs: default_connect_timeout(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

/// Raw images section; `api_key` may contain `${VAR}` references not yet expanded.
#[derive(Deserialize)]
pub struct RawImagesConfig {
    #[serde(default = "default_images_url")]
    url: String,
    api_key: Option<String>,
}

impl Default for RawImagesConfig {
    fn default() -> Self {
        Self {
            url: default_images_url(),
            api_key: None,
        }
    }
}

/// Raw configuration deserialized directly from TOML.
#[derive(Deserialize)]
pub struct RawConfig {
    #[serde(default)]
    server: ServerConfig,
    #[serde(default)]
    upstream: RawUpstreamConfig,
    #[serde(default)]
    relay: RelayConfig,
    #[serde(default)]
    routing: RoutingConfig,
    #[serde(default = "default_catalog")]
    models: Vec<ModelEntry>,
    #[serde(default)]
    images: RawImagesConfig,
    database: Option<DatabaseConfig>,
    #[serde(default)]
    logging: LoggingConfig,
}

impl Default for RawConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            upstream: RawUpstreamConfig::default(),
            relay: RelayConfig::default(),
            routing: RoutingConfig::default(),
            models: default_catalog(),
            images: RawImagesConfig::default(),
            database: None,
            logging: LoggingConfig::default(),
        }
    }
}

/// Expand all `${VAR}` references in a string using a custom lookup function.
///
/// Supports multiple `${VAR}` in one string (e.g., `${SCHEME}://${HOST}/v1`).
/// Fails on first missing variable, unclosed `${`, or empty variable name.
fn expand_env_vars_with<F>(input: &str, section: &str, lookup: F) -> Result<String, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    if !input.contains("${") {
        return Ok(input.to_string());
    }

    let mut result = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(start) = rest.find("${") {
        result.push_str(&rest[..start]);
        let after = &rest[start + 2..];

        let end = after.find('}').ok_or_else(|| ConfigError::EnvVar {
            var: "<unclosed>".to_string(),
            section: section.to_string(),
            message: format!("Unclosed '${{' in config value: {}", input),
        })?;

        let var_name = &after[..end];
        if var_name.is_empty() {
            return Err(ConfigError::EnvVar {
                var: "".to_string(),
                section: section.to_string(),
                message: "Empty variable name in '${}' reference".to_string(),
            });
        }

        let value = lookup(var_name).ok_or_else(|| ConfigError::EnvVar {
            var: var_name.to_string(),
            section: section.to_string(),
            message: format!(
                "Environment variable '{}' is not set (referenced in [{}])",
                var_name, section
            ),
        })?;

        result.push_str(&value);
        rest = &after[end + 1..];
    }

    result.push_str(rest);
    Ok(result)
}

/// Derive the convention-based env var name for a config section's key.
///
/// - "upstream" -> "CHATRELAY_UPSTREAM_API_KEY"
/// - "images" -> "CHATRELAY_IMAGES_API_KEY"
pub fn convention_env_var_name(section: &str) -> String {
    let upper_snake = section.to_uppercase().replace(['-', ' '], "_");
    format!("CHATRELAY_{}_API_KEY", upper_snake)
}

/// Resolve a raw key value: expand `${VAR}`, keep literals, or try the convention variable.
fn resolve_key_with<F>(
    raw: Option<String>,
    section: &str,
    lookup: F,
) -> Result<(Option<ApiKey>, KeySource), ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    match raw {
        Some(raw_key) if raw_key.contains("${") => {
            let expanded = expand_env_vars_with(&raw_key, section, &lookup)?;
            Ok((Some(ApiKey::from(expanded)), KeySource::EnvExpanded))
        }
        Some(raw_key) => Ok((Some(ApiKey::from(raw_key)), KeySource::Literal)),
        None => {
            let var_name = convention_env_var_name(section);
            match lookup(&var_name) {
                Some(value) => Ok((Some(ApiKey::from(value)), KeySource::Convention(var_name))),
                None => Ok((None, KeySource::None)),
            }
        }
    }
}

fn env_lookup(name: &str) -> Option<String> {
    std::env::var(name).ok()
}

impl Config {
    /// Convert raw (deserialized) config to final config with env var expansion.
    ///
    /// Returns per-section key source information alongside the config.
    pub fn from_raw(raw: RawConfig) -> Result<(Self, Vec<(String, KeySource)>), ConfigError> {
        Self::from_raw_with(raw, env_lookup)
    }

    fn from_raw_with<F>(
        raw: RawConfig,
        lookup: F,
    ) -> Result<(Self, Vec<(String, KeySource)>), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let (upstream_key, upstream_source) =
            resolve_key_with(raw.upstream.api_key, "upstream", &lookup)?;
        let (images_key, images_source) = resolve_key_with(raw.images.api_key, "images", &lookup)?;

        let config = Config {
            server: raw.server,
            upstream: UpstreamConfig {
                url: raw.upstream.url,
                api_key: upstream_key,
                connect_timeout_secs: raw.upstream.connect_timeout_secs,
                request_timeout_secs: raw.upstream.request_timeout_secs,
            },
            relay: raw.relay,
            routing: raw.routing,
            models: raw.models,
            images: ImagesConfig {
                url: raw.images.url,
                api_key: images_key,
            },
            database: raw.database,
            logging: raw.logging,
        };

        let key_sources = vec![
            ("upstream".to_string(), upstream_source),
            ("images".to_string(), images_source),
        ];

        Ok((config, key_sources))
    }

    /// Load configuration from a TOML file with environment variable expansion.
    ///
    /// Reads the file, parses it as `RawConfig`, expands `${VAR}` references
    /// (or applies the convention lookup) and validates the result.
    pub fn from_file_with_env(
        path: impl AsRef<Path>,
    ) -> Result<(Self, Vec<(String, KeySource)>), ConfigError> {
        let content = read_config(path.as_ref())?;
        let raw: RawConfig = toml::from_str(&content).map_err(ConfigError::Parse)?;
        let (config, key_sources) = Self::from_raw(raw)?;
        config.validate()?;

        Ok((config, key_sources))
    }
}

//! Image URL generation.
//!
//! No image bytes pass through the relay: the client gets a URL on the image
//! service and fetches it directly.

use rand::Rng;
use reqwest::Url;
use serde::Deserialize;

use crate::config::ImagesConfig;
use crate::error::{Error, Result};

/// Model used when the client names none.
pub const DEFAULT_IMAGE_MODEL: &str = "flux";

/// Client model ids the image service knows under another name.
const MODEL_ALIASES: &[(&str, &str)] = &[("bytedance-seed/seedream-4.5", "seedream")];

/// Body of `POST /api/generate-image`.
#[derive(Debug, Clone, Deserialize)]
pub struct ImageRequest {
    #[serde(default)]
    pub prompt: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub enhance: Option<bool>,
}

impl ImageRequest {
    /// The prompt, rejecting a missing or blank one.
    pub fn prompt(&self) -> Result<&str> {
        self.prompt
            .as_deref()
            .filter(|p| !p.trim().is_empty())
            .ok_or_else(|| Error::BadRequest("Prompt is required".to_string()))
    }

    /// Service-side model name.
    pub fn target_model(&self) -> &str {
        let model = self
            .model
            .as_deref()
            .filter(|m| !m.is_empty())
            .unwrap_or(DEFAULT_IMAGE_MODEL);
        MODEL_ALIASES
            .iter()
            .find(|(alias, _)| *alias == model)
            .map(|(_, target)| *target)
            .unwrap_or(model)
    }
}

/// Random seed in `[0, 2^31 - 1)`.
pub fn random_seed() -> u32 {
    rand::rng().random_range(0..i32::MAX as u32)
}

/// Build the image URL: the prompt as the last path segment, parameters in the query.
pub fn build_image_url(config: &ImagesConfig, request: &ImageRequest, seed: u32) -> Result<Url> {
    let prompt = request.prompt()?;

    let mut url = Url::parse(&config.url)
        .map_err(|e| Error::Internal(format!("images.url '{}' is invalid: {}", config.url, e)))?;

    url.path_segments_mut()
        .map_err(|_| Error::Internal(format!("images.url '{}' cannot take a path", config.url)))?
        .pop_if_empty()
        .push(prompt);

    {
        let mut query = url.query_pairs_mut();
        query
            .append_pair("model", request.target_model())
            .append_pair("seed", &seed.to_string())
            .append_pair("enhance", if request.enhance.unwrap_or(true) { "true" } else { "false" })
            .append_pair("nologo", "true");
        if let Some(key) = &config.api_key {
            query.append_pair("key", key.expose_secret());
        }
    }

    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ApiKey;

    fn request(prompt: Option<&str>, model: Option<&str>, enhance: Option<bool>) -> ImageRequest {
        ImageRequest {
            prompt: prompt.map(str::to_string),
            model: model.map(str::to_string),
            enhance,
        }
    }

    #[test]
    fn test_default_url() {
        let url = build_image_url(
            &ImagesConfig::default(),
            &request(Some("a red fox"), None, None),
            42,
        )
        .unwrap();
        assert_eq!(
            url.as_str(),
            "https://gen.pollinations.ai/image/a%20red%20fox?model=flux&seed=42&enhance=true&nologo=true"
        );
    }

    #[test]
    fn test_prompt_is_one_path_segment() {
        let url = build_image_url(
            &ImagesConfig::default(),
            &request(Some("cats/dogs?"), None, Some(false)),
            1,
        )
        .unwrap();
        assert_eq!(url.path(), "/image/cats%2Fdogs%3F");
        assert!(url.query().unwrap().contains("enhance=false"));
    }

    #[test]
    fn test_alias_and_key() {
        let config = ImagesConfig {
            api_key: Some(ApiKey::from("pk-123")),
            ..ImagesConfig::default()
        };
        let url = build_image_url(
            &config,
            &request(Some("sky"), Some("bytedance-seed/seedream-4.5"), None),
            7,
        )
        .unwrap();
        let pairs: Vec<(String, String)> = url
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        assert!(pairs.contains(&("model".to_string(), "seedream".to_string())));
        assert!(pairs.contains(&("key".to_string(), "pk-123".to_string())));
    }

    #[test]
    fn test_missing_prompt_is_bad_request() {
        for prompt in [None, Some(""), Some("   ")] {
            let err = build_image_url(&ImagesConfig::default(), &request(prompt, None, None), 0)
                .unwrap_err();
            assert!(matches!(err, Error::BadRequest(_)));
        }
    }

    #[test]
    fn test_base_without_trailing_slash() {
        let config = ImagesConfig {
            url: "http://localhost:8080/image".to_string(),
            ..ImagesConfig::default()
        };
        let url = build_image_url(&config, &request(Some("x"), Some("turbo"), None), 3).unwrap();
        assert_eq!(url.path(), "/image/x");
        assert!(url.query().unwrap().starts_with("model=turbo&"));
    }

    #[test]
    fn test_seed_range() {
        for _ in 0..100 {
            assert!(random_seed() < i32::MAX as u32);
        }
    }
}

//! Integration tests for the full Config::from_file_with_env pipeline.
//!
//! These tests exercise the end-to-end flow: TOML file -> raw parse -> env var
//! expansion -> final Config with KeySource metadata.
//!
//! Each test uses its own temp file and env var names to avoid parallel test interference.

use chatrelay::config::{Config, KeySource};
use std::io::Write;
use tempfile::NamedTempFile;

fn write_config(content: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().expect("create temp config");
    file.write_all(content.as_bytes()).expect("write temp config");
    file
}

fn source_for<'a>(key_sources: &'a [(String, KeySource)], section: &str) -> &'a KeySource {
    key_sources
        .iter()
        .find(|(name, _)| name == section)
        .map(|(_, s)| s)
        .unwrap_or_else(|| panic!("key source for [{}] should exist", section))
}

/// `${VAR}` references in api_key are expanded from the environment.
#[test]
fn test_env_expansion_resolves_var() {
    let var_name = "CHATRELAY_TEST_EXPAND_KEY";
    let var_value = "gsk_resolved";

    unsafe { std::env::set_var(var_name, var_value) };

    let file = write_config(&format!(
        r#"
[server]
listen = "127.0.0.1:19876"

[upstream]
url = "https://example.com/openai/v1"
api_key = "${{{}}}"
"#,
        var_name
    ));

    let result = Config::from_file_with_env(file.path());
    assert!(
        result.is_ok(),
        "from_file_with_env should succeed: {:?}",
        result.err()
    );
    let (config, key_sources) = result.unwrap();

    assert_eq!(
        config.upstream.api_key.as_ref().unwrap().expose_secret(),
        var_value,
        "api_key should be expanded from env var"
    );
    assert_eq!(*source_for(&key_sources, "upstream"), KeySource::EnvExpanded);

    unsafe { std::env::remove_var(var_name) };
}

/// Missing env vars produce errors naming the variable and the section.
#[test]
fn test_env_expansion_missing_var_errors() {
    let var_name = "CHATRELAY_TEST_DEFINITELY_MISSING";
    unsafe { std::env::remove_var(var_name) };

    let file = write_config(&format!(
        r#"
[upstream]
api_key = "${{{}}}"
"#,
        var_name
    ));

    let err = Config::from_file_with_env(file.path())
        .err()
        .expect("from_file_with_env should fail for missing env var")
        .to_string();
    assert!(err.contains(var_name), "Error should name the variable: {}", err);
    assert!(err.contains("upstream"), "Error should name the section: {}", err);
}

/// A literal key is used as-is, and a multi-reference key expands every part.
#[test]
fn test_literal_and_multi_reference_keys() {
    unsafe { std::env::set_var("CHATRELAY_TEST_PART_A", "pk") };
    unsafe { std::env::set_var("CHATRELAY_TEST_PART_B", "secret") };

    let file = write_config(
        r#"
[upstream]
api_key = "gsk_literal"

[images]
api_key = "${CHATRELAY_TEST_PART_A}_${CHATRELAY_TEST_PART_B}"
"#,
    );

    let (config, key_sources) = Config::from_file_with_env(file.path()).unwrap();
    assert_eq!(
        config.upstream.api_key.as_ref().unwrap().expose_secret(),
        "gsk_literal"
    );
    assert_eq!(*source_for(&key_sources, "upstream"), KeySource::Literal);
    assert_eq!(
        config.images.api_key.as_ref().unwrap().expose_secret(),
        "pk_secret"
    );
    assert_eq!(*source_for(&key_sources, "images"), KeySource::EnvExpanded);

    unsafe { std::env::remove_var("CHATRELAY_TEST_PART_A") };
    unsafe { std::env::remove_var("CHATRELAY_TEST_PART_B") };
}

/// With no api_key in the file, the convention variable is consulted.
#[test]
fn test_env_convention_discovers_key() {
    let var_name = "CHATRELAY_IMAGES_API_KEY";
    unsafe { std::env::set_var(var_name, "pk_convention") };

    let file = write_config(
        r#"
[upstream]
api_key = "gsk_literal"

[images]
url = "https://gen.pollinations.ai/image/"
"#,
    );

    let (config, key_sources) = Config::from_file_with_env(file.path()).unwrap();
    assert_eq!(
        config.images.api_key.as_ref().unwrap().expose_secret(),
        "pk_convention"
    );
    assert_eq!(
        *source_for(&key_sources, "images"),
        KeySource::Convention(var_name.to_string())
    );

    unsafe { std::env::remove_var(var_name) };
}

/// Keys never leak through Debug output of the loaded config.
#[test]
fn test_loaded_key_is_redacted_in_debug() {
    let file = write_config(
        r#"
[upstream]
api_key = "gsk_do_not_print"
"#,
    );

    let (config, _) = Config::from_file_with_env(file.path()).unwrap();
    let debug = format!("{:?}", config);
    assert!(!debug.contains("gsk_do_not_print"));
    assert!(debug.contains("[REDACTED]"));
}

/// Validation still runs after expansion.
#[test]
fn test_validation_runs_after_expansion() {
    let file = write_config(
        r#"
[upstream]
api_key = "gsk_literal"

[relay]
idle_timeout_secs = 0
"#,
    );

    let err = Config::from_file_with_env(file.path())
        .err()
        .expect("zero idle timeout should be rejected")
        .to_string();
    assert!(err.contains("idle_timeout_secs"), "{}", err);
}

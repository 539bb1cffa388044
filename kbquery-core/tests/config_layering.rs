//! Integration tests for layered configuration loading.

use kbquery_core::config::{PipelineConfig, load_config, load_config_file};
use kbquery_core::error::ConfigError;
use pretty_assertions::assert_eq;
use std::fs;
use std::path::Path;

fn write_workspace_config(dir: &Path, body: &str) {
    let config_dir = dir.join(".kbquery");
    fs::create_dir_all(&config_dir).unwrap();
    fs::write(config_dir.join("config.toml"), body).unwrap();
}

#[test]
fn test_defaults_without_any_files() {
    let dir = tempfile::tempdir().unwrap();
    let config = load_config(Some(dir.path()), None).unwrap();
    assert_eq!(config, PipelineConfig::default());
}

#[test]
fn test_workspace_file_overrides_defaults() {
    let dir = tempfile::tempdir().unwrap();
    write_workspace_config(
        dir.path(),
        r#"
        [diversity]
        lambda = 0.5
        evidence_budget = 8

        [timeouts]
        reranker_ms = 2500
        "#,
    );

    let config = load_config(Some(dir.path()), None).unwrap();
    assert!((config.diversity.lambda - 0.5).abs() < f32::EPSILON);
    assert_eq!(config.diversity.evidence_budget, 8);
    assert_eq!(config.timeouts.reranker_ms, 2500);
    // Untouched sections keep their defaults.
    assert_eq!(config.retrieval.top_k_per_variant, 15);
    assert_eq!(config.retry.max_retries, 1);
}

#[test]
fn test_explicit_overrides_win() {
    let dir = tempfile::tempdir().unwrap();
    write_workspace_config(dir.path(), "[diversity]\nevidence_budget = 8\n");

    let mut overrides = PipelineConfig::default();
    overrides.diversity.evidence_budget = 3;
    let config = load_config(Some(dir.path()), Some(&overrides)).unwrap();
    assert_eq!(config.diversity.evidence_budget, 3);
}

#[test]
fn test_invalid_workspace_value_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    write_workspace_config(dir.path(), "[expansion]\nmax_variants = 9\n");

    let err = load_config(Some(dir.path()), None).unwrap_err();
    assert!(matches!(err, ConfigError::Invalid { .. }));
}

#[test]
fn test_malformed_toml_is_a_parse_error() {
    let dir = tempfile::tempdir().unwrap();
    write_workspace_config(dir.path(), "[diversity]\nlambda = \"high\"\n");

    let err = load_config(Some(dir.path()), None).unwrap_err();
    assert!(matches!(err, ConfigError::ParseError { .. }));
}

#[test]
fn test_load_config_file_missing() {
    let dir = tempfile::tempdir().unwrap();
    let missing = dir.path().join("nope.toml");
    let err = load_config_file(&missing).unwrap_err();
    assert!(matches!(err, ConfigError::FileNotFound { .. }));
}

#[test]
fn test_load_config_file_explicit() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("pipeline.toml");
    fs::write(&path, "[retrieval]\ntop_k_per_variant = 4\n[rerank]\nenabled = false\n").unwrap();

    let config = load_config_file(&path).unwrap();
    assert_eq!(config.retrieval.top_k_per_variant, 4);
    assert!(!config.rerank.enabled);
    assert_eq!(config.max_candidate_pool(), 12);
}

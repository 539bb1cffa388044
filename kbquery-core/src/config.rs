//! Configuration system for the kbquery pipeline.
//!
//! Uses `figment` for layered configuration: defaults -> config file -> environment -> overrides.
//! Configuration is loaded from the user config dir (`config.toml`) and/or
//! `.kbquery/config.toml` in the workspace directory, then handed to the
//! orchestrator at construction. Library code never reads process state itself.

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{ConfigError, ServiceKind};

/// Hard ceiling on query variants (original + paraphrases) per query.
pub const MAX_QUERY_VARIANTS: usize = 5;

/// Top-level pipeline configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default)]
    pub expansion: ExpansionConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub rerank: RerankConfig,
    #[serde(default)]
    pub diversity: DiversityConfig,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    #[serde(default)]
    pub retry: RetryConfig,
}

/// Query expansion settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExpansionConfig {
    /// Ask the text generator for paraphrases at all.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Number of paraphrases requested in the prompt.
    #[serde(default = "default_paraphrase_count")]
    pub paraphrase_count: usize,
    /// Maximum variants kept, including the original.
    #[serde(default = "default_max_variants")]
    pub max_variants: usize,
}

impl Default for ExpansionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            paraphrase_count: default_paraphrase_count(),
            max_variants: default_max_variants(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_paraphrase_count() -> usize {
    2
}

fn default_max_variants() -> usize {
    3
}

/// Vector retrieval settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievalConfig {
    /// Nearest neighbours requested per query variant.
    #[serde(default = "default_top_k_per_variant")]
    pub top_k_per_variant: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k_per_variant: default_top_k_per_variant(),
        }
    }
}

fn default_top_k_per_variant() -> usize {
    15
}

/// Cross-encoder reranking settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RerankConfig {
    /// When disabled the similarity-order fallback is used directly.
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl Default for RerankConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

/// Maximal Marginal Relevance settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiversityConfig {
    /// Relevance/novelty trade-off in [0, 1]. 1.0 is pure relevance.
    #[serde(default = "default_lambda")]
    pub lambda: f32,
    /// Maximum number of selected evidence items.
    #[serde(default = "default_evidence_budget")]
    pub evidence_budget: usize,
    /// Embed candidates the store returned without a vector before selection.
    #[serde(default = "default_true")]
    pub embed_missing: bool,
}

impl Default for DiversityConfig {
    fn default() -> Self {
        Self {
            lambda: default_lambda(),
            evidence_budget: default_evidence_budget(),
            embed_missing: true,
        }
    }
}

fn default_lambda() -> f32 {
    0.7
}

fn default_evidence_budget() -> usize {
    5
}

/// Per-call timeouts for each collaborator, in milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeoutConfig {
    #[serde(default = "default_embedder_ms")]
    pub embedder_ms: u64,
    #[serde(default = "default_vector_store_ms")]
    pub vector_store_ms: u64,
    #[serde(default = "default_text_generator_ms")]
    pub text_generator_ms: u64,
    #[serde(default = "default_reranker_ms")]
    pub reranker_ms: u64,
    #[serde(default = "default_structured_query_ms")]
    pub structured_query_ms: u64,
    #[serde(default = "default_prediction_ms")]
    pub prediction_ms: u64,
    #[serde(default = "default_catalog_ms")]
    pub catalog_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            embedder_ms: default_embedder_ms(),
            vector_store_ms: default_vector_store_ms(),
            text_generator_ms: default_text_generator_ms(),
            reranker_ms: default_reranker_ms(),
            structured_query_ms: default_structured_query_ms(),
            prediction_ms: default_prediction_ms(),
            catalog_ms: default_catalog_ms(),
        }
    }
}

impl TimeoutConfig {
    /// Timeout applied to a single call against `service`.
    pub fn for_service(&self, service: ServiceKind) -> Duration {
        let ms = match service {
            ServiceKind::Embedder => self.embedder_ms,
            ServiceKind::VectorStore => self.vector_store_ms,
            ServiceKind::TextGenerator => self.text_generator_ms,
            ServiceKind::Reranker => self.reranker_ms,
            ServiceKind::StructuredQuery => self.structured_query_ms,
            ServiceKind::Prediction => self.prediction_ms,
            ServiceKind::Catalog => self.catalog_ms,
        };
        Duration::from_millis(ms)
    }
}

fn default_embedder_ms() -> u64 {
    5_000
}

fn default_vector_store_ms() -> u64 {
    5_000
}

fn default_text_generator_ms() -> u64 {
    15_000
}

fn default_reranker_ms() -> u64 {
    10_000
}

fn default_structured_query_ms() -> u64 {
    30_000
}

fn default_prediction_ms() -> u64 {
    60_000
}

fn default_catalog_ms() -> u64 {
    2_000
}

/// Retry policy for transient collaborator failures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Retries after the first attempt. Kept small; semantic failures are never retried.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    #[serde(default)]
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            jitter: false,
        }
    }
}

fn default_max_retries() -> u32 {
    1
}

fn default_initial_backoff_ms() -> u64 {
    200
}

fn default_max_backoff_ms() -> u64 {
    2_000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

impl PipelineConfig {
    /// Check cross-field constraints that serde defaults cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |message: String| Err(ConfigError::Invalid { message });

        if !(0.0..=1.0).contains(&self.diversity.lambda) {
            return invalid(format!(
                "diversity.lambda must be within [0, 1], got {}",
                self.diversity.lambda
            ));
        }
        if self.diversity.evidence_budget == 0 {
            return invalid("diversity.evidence_budget must be at least 1".into());
        }
        if self.retrieval.top_k_per_variant == 0 {
            return invalid("retrieval.top_k_per_variant must be at least 1".into());
        }
        if self.expansion.max_variants == 0 || self.expansion.max_variants > MAX_QUERY_VARIANTS {
            return invalid(format!(
                "expansion.max_variants must be within 1..={MAX_QUERY_VARIANTS}, got {}",
                self.expansion.max_variants
            ));
        }
        if self.retry.max_retries > 3 {
            return invalid(format!(
                "retry.max_retries must be at most 3, got {}",
                self.retry.max_retries
            ));
        }
        if self.retry.backoff_multiplier < 1.0 {
            return invalid("retry.backoff_multiplier must be >= 1.0".into());
        }
        Ok(())
    }

    /// Upper bound on the candidate pool a single query can produce.
    pub fn max_candidate_pool(&self) -> usize {
        self.expansion.max_variants * self.retrieval.top_k_per_variant
    }
}

/// Load configuration from layered sources.
///
/// Priority (highest to lowest):
/// 1. Explicit overrides (passed as argument)
/// 2. Environment variables (prefixed with `KBQUERY_`, `__` for nesting)
/// 3. Workspace-local config (`.kbquery/config.toml`)
/// 4. User config (`~/.config/kbquery/config.toml`)
/// 5. Built-in defaults
pub fn load_config(
    workspace: Option<&Path>,
    overrides: Option<&PipelineConfig>,
) -> Result<PipelineConfig, ConfigError> {
    let mut figment = Figment::from(Serialized::defaults(PipelineConfig::default()));

    if let Some(config_dir) = directories::ProjectDirs::from("dev", "kbquery", "kbquery") {
        let user_config = config_dir.config_dir().join("config.toml");
        if user_config.exists() {
            figment = figment.merge(Toml::file(&user_config));
        }
    }

    if let Some(ws) = workspace {
        let ws_config = ws.join(".kbquery").join("config.toml");
        if ws_config.exists() {
            figment = figment.merge(Toml::file(&ws_config));
        }
    }

    // KBQUERY_DIVERSITY__LAMBDA, KBQUERY_RETRY__MAX_RETRIES, etc.
    figment = figment.merge(Env::prefixed("KBQUERY_").split("__"));

    if let Some(overrides) = overrides {
        figment = figment.merge(Serialized::defaults(overrides));
    }

    let config: PipelineConfig = figment.extract()?;
    config.validate()?;
    Ok(config)
}

/// Load configuration from a single explicit TOML file layered over defaults.
pub fn load_config_file(path: &Path) -> Result<PipelineConfig, ConfigError> {
    if !path.exists() {
        return Err(ConfigError::FileNotFound {
            path: path.to_path_buf(),
        });
    }
    let config: PipelineConfig = Figment::from(Serialized::defaults(PipelineConfig::default()))
        .merge(Toml::file(path))
        .extract()?;
    config.validate()?;
    Ok(config)
}

//! # kbquery-core
//!
//! Shared foundation for the kbquery retrieval pipeline: the per-query data
//! model, collaborator traits (embedder, vector store, text generator,
//! relevance scorer, structured-query and prediction engines, catalog),
//! error taxonomy, layered configuration and the timeout/retry policy that
//! wraps every external call.

pub mod config;
pub mod error;
pub mod providers;
pub mod retry;
pub mod types;
pub mod vector;

// Re-exports
pub use config::{PipelineConfig, load_config, load_config_file};
pub use error::{ConfigError, ErrorClass, ExternalError, PipelineError, ServiceKind};
pub use providers::{
    CollectionCatalog, Embedder, GenerationConstraints, PredictionEngine, RelevanceScorer,
    StructuredQueryEngine, TextGenerator, VectorHit, VectorStore,
};
pub use retry::call_with_policy;
pub use types::{
    Branch, BranchReport, BranchStatus, Candidate, CandidateCounts, CollectionProfile,
    Diagnostics, EvidenceBundle, EvidenceOutcome, ExecutionPlan, Metadata, PipelineStage,
    PredictionPoint, PredictionResult, PredictionSpec, Query, QueryIntent, QueryVariant,
    ScoredCandidate, SelectedEvidence, StageTimings, StructuredResult, VariantOrigin,
};

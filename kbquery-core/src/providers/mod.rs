//! External collaborator contracts.
//!
//! The pipeline depends only on these traits. Concrete backends (model servers,
//! vector databases, SQL agents) live outside the core; `local` ships small
//! in-process implementations and `mock` ships scriptable test doubles.

pub mod local;
pub mod mock;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ExternalError;
use crate::types::{CollectionProfile, Metadata, PredictionResult, PredictionSpec, StructuredResult};

pub use local::{InMemoryVectorStore, LexicalRelevanceScorer, LocalEmbedder};
pub use mock::{
    MockCatalog, MockEmbedder, MockPredictionEngine, MockRelevanceScorer, MockStructuredEngine,
    MockTextGenerator, MockVectorStore,
};

/// Maps text to a fixed-dimension, cosine-comparable vector.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Generate an embedding for a single text.
    async fn embed(&self, text: &str) -> Result<Vec<f32>, ExternalError>;

    /// Generate embeddings for a batch of texts, in input order.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ExternalError> {
        let mut out = Vec::with_capacity(texts.len());
        for text in texts {
            out.push(self.embed(text).await?);
        }
        Ok(out)
    }

    /// Return the dimensionality of embeddings.
    fn dimensions(&self) -> usize;

    /// Return the provider name.
    fn provider_name(&self) -> &str;
}

/// A single nearest-neighbour hit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorHit {
    pub item_id: String,
    pub document_id: String,
    /// Cosine similarity to the query vector.
    pub similarity: f32,
    pub content: String,
    #[serde(default)]
    pub metadata: Metadata,
    /// The stored vector, when the store returns it.
    #[serde(default)]
    pub vector: Option<Vec<f32>>,
}

/// Nearest-neighbour search over one collection.
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Top-`top_k` hits by descending similarity. An empty or unknown
    /// collection yields an empty list, not an error.
    async fn search(
        &self,
        collection_id: &str,
        query_vector: &[f32],
        top_k: usize,
    ) -> Result<Vec<VectorHit>, ExternalError>;
}

/// Generation constraints passed alongside a prompt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationConstraints {
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
}

impl Default for GenerationConstraints {
    fn default() -> Self {
        Self {
            max_tokens: Some(256),
            temperature: Some(0.0),
        }
    }
}

/// Black-box text generation (LLM).
#[async_trait]
pub trait TextGenerator: Send + Sync {
    async fn generate(
        &self,
        prompt: &str,
        constraints: &GenerationConstraints,
    ) -> Result<String, ExternalError>;
}

/// Pairwise (query, passage) relevance model, e.g. a cross-encoder.
#[async_trait]
pub trait RelevanceScorer: Send + Sync {
    /// Higher is more relevant.
    async fn score(&self, query: &str, passage: &str) -> Result<f32, ExternalError>;

    /// Score many passages against one query, in input order.
    ///
    /// `None` marks a passage the model could not score. An `Err` means the
    /// model itself failed and no score in the batch is usable.
    async fn score_batch(
        &self,
        query: &str,
        passages: &[&str],
    ) -> Result<Vec<Option<f32>>, ExternalError> {
        score_pairwise(self, query, passages).await
    }

    fn model_name(&self) -> &str;
}

/// Score passages one pair at a time.
///
/// An input-specific error on one passage yields `None` for that passage only.
/// Any other error, or every passage being rejected, fails the whole batch.
pub async fn score_pairwise<S>(
    scorer: &S,
    query: &str,
    passages: &[&str],
) -> Result<Vec<Option<f32>>, ExternalError>
where
    S: RelevanceScorer + ?Sized,
{
    let mut out = Vec::with_capacity(passages.len());
    let mut first_rejection = None;
    for (index, passage) in passages.iter().enumerate() {
        match scorer.score(query, passage).await {
            Ok(score) => out.push(Some(score)),
            Err(e) if e.is_input_specific() => {
                tracing::debug!(index, error = %e, "Passage could not be scored");
                first_rejection.get_or_insert(e);
                out.push(None);
            }
            Err(e) => return Err(e),
        }
    }
    match first_rejection {
        Some(e) if out.iter().all(Option::is_none) => Err(e),
        _ => Ok(out),
    }
}

/// Executes natural-language-derived queries against tabular data.
///
/// "No matching rows" is `row_count == 0`, never an error.
#[async_trait]
pub trait StructuredQueryEngine: Send + Sync {
    async fn run(&self, collection_id: &str, request: &str)
    -> Result<StructuredResult, ExternalError>;
}

/// Predictive analytics over a collection's tabular data.
#[async_trait]
pub trait PredictionEngine: Send + Sync {
    async fn run(
        &self,
        collection_id: &str,
        spec: &PredictionSpec,
    ) -> Result<PredictionResult, ExternalError>;
}

/// Reports what kind of data a collection holds.
#[async_trait]
pub trait CollectionCatalog: Send + Sync {
    async fn profile(&self, collection_id: &str) -> Result<CollectionProfile, ExternalError>;
}

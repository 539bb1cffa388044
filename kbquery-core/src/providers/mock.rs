//! Scriptable test doubles for every collaborator trait.
//!
//! Each mock counts its calls, can be told to fail, and can be slowed down
//! with a delay to exercise timeouts and cancellation.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;

use super::local::LocalEmbedder;
use super::{
    CollectionCatalog, Embedder, GenerationConstraints, PredictionEngine, RelevanceScorer,
    StructuredQueryEngine, TextGenerator, VectorHit, VectorStore, score_pairwise,
};
use crate::error::{ExternalError, ServiceKind};
use crate::types::{CollectionProfile, PredictionResult, PredictionSpec, StructuredResult};

async fn maybe_sleep(delay: Option<Duration>) {
    if let Some(delay) = delay {
        tokio::time::sleep(delay).await;
    }
}

/// Consume one of the scripted transient failures, if any remain.
fn take_transient(remaining: &AtomicU32, service: ServiceKind) -> Result<(), ExternalError> {
    let took = remaining
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok();
    if took {
        Err(ExternalError::unavailable(service, "scripted transient failure"))
    } else {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Text generation
// ---------------------------------------------------------------------------

/// Text generator returning queued responses, then a fallback.
pub struct MockTextGenerator {
    responses: Mutex<VecDeque<Result<String, ExternalError>>>,
    fallback: Result<String, ExternalError>,
    prompts: Mutex<Vec<String>>,
    delay: Option<Duration>,
}

impl MockTextGenerator {
    pub fn new() -> Self {
        Self {
            responses: Mutex::new(VecDeque::new()),
            fallback: Ok(String::new()),
            prompts: Mutex::new(Vec::new()),
            delay: None,
        }
    }

    /// Always return the given text.
    pub fn with_response(text: &str) -> Self {
        Self {
            fallback: Ok(text.to_string()),
            ..Self::new()
        }
    }

    /// Always fail with the given error.
    pub fn failing(error: ExternalError) -> Self {
        Self {
            fallback: Err(error),
            ..Self::new()
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Queue a result for the next `generate` call.
    pub fn queue(&self, result: Result<String, ExternalError>) {
        self.responses.lock().unwrap().push_back(result);
    }

    pub fn calls(&self) -> usize {
        self.prompts.lock().unwrap().len()
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }
}

impl Default for MockTextGenerator {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TextGenerator for MockTextGenerator {
    async fn generate(
        &self,
        prompt: &str,
        _constraints: &GenerationConstraints,
    ) -> Result<String, ExternalError> {
        self.prompts.lock().unwrap().push(prompt.to_string());
        maybe_sleep(self.delay).await;
        let queued = self.responses.lock().unwrap().pop_front();
        queued.unwrap_or_else(|| self.fallback.clone())
    }
}

// ---------------------------------------------------------------------------
// Embedder
// ---------------------------------------------------------------------------

/// Deterministic embedder (backed by [`LocalEmbedder`]) with failure injection.
pub struct MockEmbedder {
    inner: LocalEmbedder,
    failing_texts: HashSet<String>,
    always_fail: Option<ExternalError>,
    transient_failures: AtomicU32,
    calls: AtomicUsize,
    delay: Option<Duration>,
}

impl MockEmbedder {
    pub fn new() -> Self {
        Self {
            inner: LocalEmbedder::new(64),
            failing_texts: HashSet::new(),
            always_fail: None,
            transient_failures: AtomicU32::new(0),
            calls: AtomicUsize::new(0),
            delay: None,
        }
    }

    /// Fail permanently whenever asked to embed exactly `text`.
    pub fn fail_on(mut self, text: &str) -> Self {
        self.failing_texts.insert(text.to_string());
        self
    }

    pub fn failing(error: ExternalError) -> Self {
        Self {
            always_fail: Some(error),
            ..Self::new()
        }
    }

    /// Fail the first `n` calls with a transient error.
    pub fn fail_first(self, n: u32) -> Self {
        self.transient_failures.store(n, Ordering::SeqCst);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// The vector this mock returns for `text` when it does not fail.
    pub fn vector_for(&self, text: &str) -> Vec<f32> {
        self.inner.embed_sync(text)
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Default for MockEmbedder {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Embedder for MockEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, ExternalError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        maybe_sleep(self.delay).await;
        if let Some(err) = &self.always_fail {
            return Err(err.clone());
        }
        if self.failing_texts.contains(text) {
            return Err(ExternalError::invalid_input(
                ServiceKind::Embedder,
                format!("refusing to embed '{text}'"),
            ));
        }
        take_transient(&self.transient_failures, ServiceKind::Embedder)?;
        Ok(self.inner.embed_sync(text))
    }

    fn dimensions(&self) -> usize {
        self.inner.dimensions()
    }

    fn provider_name(&self) -> &str {
        "mock"
    }
}

// ---------------------------------------------------------------------------
// Vector store
// ---------------------------------------------------------------------------

/// Vector store returning scripted hits.
///
/// Hits registered with [`MockVectorStore::on_vector`] are returned for that
/// exact query vector; any other vector gets the default hits.
pub struct MockVectorStore {
    default_hits: Vec<VectorHit>,
    scripted: Vec<(Vec<f32>, Vec<VectorHit>)>,
    error: Option<ExternalError>,
    transient_failures: AtomicU32,
    calls: AtomicUsize,
    delay: Option<Duration>,
}

impl MockVectorStore {
    pub fn new() -> Self {
        Self {
            default_hits: Vec::new(),
            scripted: Vec::new(),
            error: None,
            transient_failures: AtomicU32::new(0),
            calls: AtomicUsize::new(0),
            delay: None,
        }
    }

    pub fn with_hits(hits: Vec<VectorHit>) -> Self {
        Self {
            default_hits: hits,
            ..Self::new()
        }
    }

    pub fn failing(error: ExternalError) -> Self {
        Self {
            error: Some(error),
            ..Self::new()
        }
    }

    pub fn on_vector(mut self, vector: Vec<f32>, hits: Vec<VectorHit>) -> Self {
        self.scripted.push((vector, hits));
        self
    }

    pub fn fail_first(self, n: u32) -> Self {
        self.transient_failures.store(n, Ordering::SeqCst);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Build a hit without a stored vector.
    pub fn hit(id: &str, document_id: &str, similarity: f32, content: &str) -> VectorHit {
        VectorHit {
            item_id: id.to_string(),
            document_id: document_id.to_string(),
            similarity,
            content: content.to_string(),
            metadata: Default::default(),
            vector: None,
        }
    }
}

impl Default for MockVectorStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl VectorStore for MockVectorStore {
    async fn search(
        &self,
        _collection_id: &str,
        query_vector: &[f32],
        top_k: usize,
    ) -> Result<Vec<VectorHit>, ExternalError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        maybe_sleep(self.delay).await;
        if let Some(err) = &self.error {
            return Err(err.clone());
        }
        take_transient(&self.transient_failures, ServiceKind::VectorStore)?;

        let hits = self
            .scripted
            .iter()
            .find(|(vector, _)| vector.as_slice() == query_vector)
            .map(|(_, hits)| hits)
            .unwrap_or(&self.default_hits);
        Ok(hits.iter().take(top_k).cloned().collect())
    }
}

// ---------------------------------------------------------------------------
// Relevance scorer
// ---------------------------------------------------------------------------

/// Relevance scorer with per-passage scores.
pub struct MockRelevanceScorer {
    scores: HashMap<String, f32>,
    rejected: HashSet<String>,
    default_score: f32,
    error: Option<ExternalError>,
    wrong_length: bool,
    calls: AtomicUsize,
    delay: Option<Duration>,
}

impl MockRelevanceScorer {
    pub fn new() -> Self {
        Self {
            scores: HashMap::new(),
            rejected: HashSet::new(),
            default_score: 0.0,
            error: None,
            wrong_length: false,
            calls: AtomicUsize::new(0),
            delay: None,
        }
    }

    /// Score `passage` (exact content) as `score`.
    pub fn with_score(mut self, passage: &str, score: f32) -> Self {
        self.scores.insert(passage.to_string(), score);
        self
    }

    /// Fail `passage` (exact content) with `InvalidInput`, as a model does
    /// for an oversized or unparsable input.
    pub fn rejecting(mut self, passage: &str) -> Self {
        self.rejected.insert(passage.to_string());
        self
    }

    pub fn with_default_score(mut self, score: f32) -> Self {
        self.default_score = score;
        self
    }

    pub fn failing(error: ExternalError) -> Self {
        Self {
            error: Some(error),
            ..Self::new()
        }
    }

    /// Return one score too few from `score_batch`.
    pub fn with_wrong_length(mut self) -> Self {
        self.wrong_length = true;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Default for MockRelevanceScorer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RelevanceScorer for MockRelevanceScorer {
    async fn score(&self, _query: &str, passage: &str) -> Result<f32, ExternalError> {
        if let Some(err) = &self.error {
            return Err(err.clone());
        }
        if self.rejected.contains(passage) {
            return Err(ExternalError::invalid_input(
                ServiceKind::Reranker,
                format!("cannot score passage of {} chars", passage.len()),
            ));
        }
        Ok(self
            .scores
            .get(passage)
            .copied()
            .unwrap_or(self.default_score))
    }

    async fn score_batch(
        &self,
        query: &str,
        passages: &[&str],
    ) -> Result<Vec<Option<f32>>, ExternalError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        maybe_sleep(self.delay).await;
        let mut out = score_pairwise(self, query, passages).await?;
        if self.wrong_length {
            out.pop();
        }
        Ok(out)
    }

    fn model_name(&self) -> &str {
        "mock-cross-encoder"
    }
}

// ---------------------------------------------------------------------------
// Structured query & prediction
// ---------------------------------------------------------------------------

/// Structured-query engine returning a fixed result.
pub struct MockStructuredEngine {
    result: Result<StructuredResult, ExternalError>,
    requests: Mutex<Vec<String>>,
    delay: Option<Duration>,
}

impl MockStructuredEngine {
    pub fn returning(result: StructuredResult) -> Self {
        Self {
            result: Ok(result),
            requests: Mutex::new(Vec::new()),
            delay: None,
        }
    }

    pub fn failing(error: ExternalError) -> Self {
        Self {
            result: Err(error),
            requests: Mutex::new(Vec::new()),
            delay: None,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl StructuredQueryEngine for MockStructuredEngine {
    async fn run(
        &self,
        _collection_id: &str,
        request: &str,
    ) -> Result<StructuredResult, ExternalError> {
        self.requests.lock().unwrap().push(request.to_string());
        maybe_sleep(self.delay).await;
        self.result.clone()
    }
}

/// Prediction engine returning a fixed result.
pub struct MockPredictionEngine {
    result: Result<PredictionResult, ExternalError>,
    calls: AtomicUsize,
    delay: Option<Duration>,
}

impl MockPredictionEngine {
    pub fn returning(result: PredictionResult) -> Self {
        Self {
            result: Ok(result),
            calls: AtomicUsize::new(0),
            delay: None,
        }
    }

    pub fn failing(error: ExternalError) -> Self {
        Self {
            result: Err(error),
            calls: AtomicUsize::new(0),
            delay: None,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PredictionEngine for MockPredictionEngine {
    async fn run(
        &self,
        _collection_id: &str,
        _spec: &PredictionSpec,
    ) -> Result<PredictionResult, ExternalError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        maybe_sleep(self.delay).await;
        self.result.clone()
    }
}

// ---------------------------------------------------------------------------
// Catalog
// ---------------------------------------------------------------------------

/// Catalog reporting a fixed profile.
pub struct MockCatalog {
    result: Result<CollectionProfile, ExternalError>,
}

impl MockCatalog {
    pub fn new(profile: CollectionProfile) -> Self {
        Self { result: Ok(profile) }
    }

    pub fn failing(error: ExternalError) -> Self {
        Self { result: Err(error) }
    }
}

#[async_trait]
impl CollectionCatalog for MockCatalog {
    async fn profile(&self, _collection_id: &str) -> Result<CollectionProfile, ExternalError> {
        self.result.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_text_generator_queue_then_fallback() {
        let generator = MockTextGenerator::with_response("fallback");
        generator.queue(Ok("first".into()));
        let constraints = GenerationConstraints::default();
        assert_eq!(generator.generate("p1", &constraints).await.unwrap(), "first");
        assert_eq!(generator.generate("p2", &constraints).await.unwrap(), "fallback");
        assert_eq!(generator.calls(), 2);
        assert_eq!(generator.prompts(), vec!["p1", "p2"]);
    }

    #[tokio::test]
    async fn test_embedder_fail_first_then_recovers() {
        let embedder = MockEmbedder::new().fail_first(1);
        assert!(embedder.embed("revenue").await.unwrap_err().is_transient());
        assert_eq!(embedder.embed("revenue").await.unwrap(), embedder.vector_for("revenue"));
        assert_eq!(embedder.calls(), 2);
    }

    #[tokio::test]
    async fn test_embedder_fail_on_text() {
        let embedder = MockEmbedder::new().fail_on("bad");
        assert!(embedder.embed("bad").await.is_err());
        assert!(embedder.embed("good").await.is_ok());
    }

    #[tokio::test]
    async fn test_vector_store_scripted_by_vector() {
        let store = MockVectorStore::with_hits(vec![MockVectorStore::hit("d", "doc", 0.1, "x")])
            .on_vector(vec![1.0, 0.0], vec![MockVectorStore::hit("a", "doc", 0.9, "y")]);
        let hits = store.search("kb", &[1.0, 0.0], 10).await.unwrap();
        assert_eq!(hits[0].item_id, "a");
        let hits = store.search("kb", &[0.0, 1.0], 10).await.unwrap();
        assert_eq!(hits[0].item_id, "d");
        assert_eq!(store.calls(), 2);
    }

    #[tokio::test]
    async fn test_scorer_wrong_length() {
        let scorer = MockRelevanceScorer::new().with_wrong_length();
        let scores = scorer.score_batch("q", &["a", "b"]).await.unwrap();
        assert_eq!(scores.len(), 1);
    }

    #[tokio::test]
    async fn test_scorer_rejects_single_passage() {
        let scorer = MockRelevanceScorer::new()
            .with_default_score(0.4)
            .rejecting("bad");
        let scores = scorer.score_batch("q", &["good", "bad"]).await.unwrap();
        assert_eq!(scores, vec![Some(0.4), None]);
        assert!(scorer.score("q", "bad").await.is_err());
    }

    #[tokio::test]
    async fn test_scorer_rejecting_every_passage_fails_batch() {
        let scorer = MockRelevanceScorer::new().rejecting("bad");
        let err = scorer.score_batch("q", &["bad", "bad"]).await.unwrap_err();
        assert!(matches!(err, ExternalError::InvalidInput { .. }));
    }

    #[tokio::test]
    async fn test_catalog_failing() {
        let catalog = MockCatalog::failing(ExternalError::unavailable(ServiceKind::Catalog, "down"));
        assert!(catalog.profile("kb").await.is_err());
    }
}

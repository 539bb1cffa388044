//! In-process reference collaborators.
//!
//! - `LocalEmbedder`: hashed term-frequency embedding (no model download)
//! - `InMemoryVectorStore`: exhaustive cosine scan, also a `CollectionCatalog`
//! - `LexicalRelevanceScorer`: query-term coverage in [0, 1]
//!
//! Good enough for the CLI, demos and deterministic tests. Production
//! deployments plug real services in behind the same traits.

use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::RwLock;

use super::{CollectionCatalog, Embedder, RelevanceScorer, VectorHit, VectorStore};
use crate::error::{ExternalError, ServiceKind};
use crate::types::{CollectionProfile, Metadata};
use crate::vector::{cosine_similarity, l2_normalize};

/// Lowercased alphanumeric terms of a text.
pub fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(str::to_string)
        .collect()
}

fn simple_hash(s: &str) -> usize {
    let mut hash: usize = 5381;
    for b in s.bytes() {
        hash = hash.wrapping_mul(33).wrapping_add(b as usize);
    }
    hash
}

// ---------------------------------------------------------------------------
// Embedder
// ---------------------------------------------------------------------------

/// Local term-frequency embedder (always available, deterministic).
#[derive(Debug, Clone)]
pub struct LocalEmbedder {
    dimensions: usize,
}

impl LocalEmbedder {
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions: dimensions.max(1),
        }
    }

    /// Synchronous embedding used by the async trait method and by indexing.
    pub fn embed_sync(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dimensions];
        let words = tokenize(text);
        if words.is_empty() {
            return vector;
        }

        let mut tf: HashMap<&str, usize> = HashMap::new();
        for word in &words {
            *tf.entry(word.as_str()).or_insert(0) += 1;
        }

        // Hash each unique term into a dimension
        for (term, count) in &tf {
            let idx = simple_hash(term) % self.dimensions;
            vector[idx] += *count as f32;
        }

        l2_normalize(&mut vector);
        vector
    }
}

impl Default for LocalEmbedder {
    fn default() -> Self {
        Self::new(256)
    }
}

#[async_trait]
impl Embedder for LocalEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, ExternalError> {
        if text.trim().is_empty() {
            return Err(ExternalError::invalid_input(
                ServiceKind::Embedder,
                "cannot embed empty text",
            ));
        }
        Ok(self.embed_sync(text))
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn provider_name(&self) -> &str {
        "local"
    }
}

// ---------------------------------------------------------------------------
// Vector store
// ---------------------------------------------------------------------------

/// A chunk stored in the in-memory index.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredItem {
    pub id: String,
    pub document_id: String,
    pub content: String,
    pub metadata: Metadata,
    pub vector: Vec<f32>,
}

/// In-memory nearest-neighbour index keyed by collection.
#[derive(Debug, Default)]
pub struct InMemoryVectorStore {
    collections: RwLock<HashMap<String, Vec<StoredItem>>>,
    structured: RwLock<HashSet<String>>,
}

impl InMemoryVectorStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn poisoned() -> ExternalError {
        ExternalError::unavailable(ServiceKind::VectorStore, "index lock poisoned")
    }

    /// Insert or replace an item (by id) in a collection.
    pub fn insert(&self, collection_id: &str, item: StoredItem) -> Result<(), ExternalError> {
        let mut collections = self.collections.write().map_err(|_| Self::poisoned())?;
        let items = collections.entry(collection_id.to_string()).or_default();
        match items.iter_mut().find(|existing| existing.id == item.id) {
            Some(existing) => *existing = item,
            None => items.push(item),
        }
        Ok(())
    }

    /// Flag a collection as having structured tables attached.
    pub fn mark_structured(&self, collection_id: &str) -> Result<(), ExternalError> {
        self.structured
            .write()
            .map_err(|_| Self::poisoned())?
            .insert(collection_id.to_string());
        Ok(())
    }

    pub fn len(&self, collection_id: &str) -> usize {
        self.collections
            .read()
            .map(|c| c.get(collection_id).map_or(0, Vec::len))
            .unwrap_or(0)
    }

    pub fn is_empty(&self, collection_id: &str) -> bool {
        self.len(collection_id) == 0
    }
}

#[async_trait]
impl VectorStore for InMemoryVectorStore {
    async fn search(
        &self,
        collection_id: &str,
        query_vector: &[f32],
        top_k: usize,
    ) -> Result<Vec<VectorHit>, ExternalError> {
        let collections = self.collections.read().map_err(|_| Self::poisoned())?;
        let Some(items) = collections.get(collection_id) else {
            return Ok(Vec::new());
        };

        let mut scored: Vec<(&StoredItem, f32)> = items
            .iter()
            .filter_map(|item| cosine_similarity(query_vector, &item.vector).map(|s| (item, s)))
            .collect();
        scored.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.id.cmp(&b.0.id)));
        scored.truncate(top_k);

        Ok(scored
            .into_iter()
            .map(|(item, similarity)| VectorHit {
                item_id: item.id.clone(),
                document_id: item.document_id.clone(),
                similarity,
                content: item.content.clone(),
                metadata: item.metadata.clone(),
                vector: Some(item.vector.clone()),
            })
            .collect())
    }
}

#[async_trait]
impl CollectionCatalog for InMemoryVectorStore {
    async fn profile(&self, collection_id: &str) -> Result<CollectionProfile, ExternalError> {
        let structured = self
            .structured
            .read()
            .map_err(|_| Self::poisoned())?
            .contains(collection_id);
        Ok(CollectionProfile {
            has_unstructured: !self.is_empty(collection_id),
            has_structured: structured,
        })
    }
}

// ---------------------------------------------------------------------------
// Relevance scorer
// ---------------------------------------------------------------------------

/// Fraction of distinct query terms that appear in the passage.
#[derive(Debug, Clone, Default)]
pub struct LexicalRelevanceScorer;

impl LexicalRelevanceScorer {
    pub fn new() -> Self {
        Self
    }

    pub fn coverage(query: &str, passage: &str) -> f32 {
        let terms: BTreeSet<String> = tokenize(query).into_iter().collect();
        if terms.is_empty() {
            return 0.0;
        }
        let passage_terms: HashSet<String> = tokenize(passage).into_iter().collect();
        let hits = terms.iter().filter(|t| passage_terms.contains(*t)).count();
        hits as f32 / terms.len() as f32
    }
}

#[async_trait]
impl RelevanceScorer for LexicalRelevanceScorer {
    async fn score(&self, query: &str, passage: &str) -> Result<f32, ExternalError> {
        Ok(Self::coverage(query, passage))
    }

    fn model_name(&self) -> &str {
        "lexical-coverage"
    }
}

//! Multi-query vector retrieval with merge-by-id.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::join_all;
use kbquery_core::config::{RetryConfig, TimeoutConfig};
use kbquery_core::error::{ExternalError, ServiceKind};
use kbquery_core::providers::{Embedder, VectorHit, VectorStore};
use kbquery_core::retry::call_with_policy;
use kbquery_core::types::{Candidate, QueryVariant};

/// A variant whose embedding or search failed.
#[derive(Debug, Clone, PartialEq)]
pub struct VariantFailure {
    pub variant: String,
    pub error: ExternalError,
}

/// Merged output of one retrieval fan-out.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RetrievalOutput {
    /// Unique by id, ordered by similarity desc then id asc.
    pub candidates: Vec<Candidate>,
    pub attempted: usize,
    pub failed: Vec<VariantFailure>,
    /// Hits discarded because the store reported a non-finite similarity.
    pub dropped_non_finite: usize,
}

impl RetrievalOutput {
    /// Every attempted variant failed, so emptiness means "lookup failed".
    pub fn all_failed(&self) -> bool {
        self.attempted > 0 && self.failed.len() == self.attempted
    }
}

/// Fans out embedding + nearest-neighbour search over query variants.
pub struct Retriever {
    embedder: Arc<dyn Embedder>,
    store: Arc<dyn VectorStore>,
    timeouts: TimeoutConfig,
    retry: RetryConfig,
}

impl Retriever {
    pub fn new(
        embedder: Arc<dyn Embedder>,
        store: Arc<dyn VectorStore>,
        timeouts: TimeoutConfig,
        retry: RetryConfig,
    ) -> Self {
        Self {
            embedder,
            store,
            timeouts,
            retry,
        }
    }

    /// Retrieve and merge candidates for every variant concurrently.
    ///
    /// A failing variant is skipped; the others still contribute.
    pub async fn retrieve(
        &self,
        collection_id: &str,
        variants: &[QueryVariant],
        top_k_per_variant: usize,
    ) -> RetrievalOutput {
        let searches = variants
            .iter()
            .map(|variant| self.search_variant(collection_id, &variant.text, top_k_per_variant));
        let results = join_all(searches).await;

        let mut per_variant = Vec::with_capacity(results.len());
        let mut failed = Vec::new();
        for (variant, result) in variants.iter().zip(results) {
            match result {
                Ok(hits) => per_variant.push((variant.text.as_str(), hits)),
                Err(error) => {
                    tracing::warn!(
                        collection = collection_id,
                        variant = %variant.text,
                        error = %error,
                        "Variant retrieval failed, skipping"
                    );
                    failed.push(VariantFailure {
                        variant: variant.text.clone(),
                        error,
                    });
                }
            }
        }

        let (candidates, dropped_non_finite) = merge_hits(per_variant);
        tracing::debug!(
            collection = collection_id,
            variants = variants.len(),
            failed = failed.len(),
            candidates = candidates.len(),
            "Retrieval merged"
        );

        RetrievalOutput {
            candidates,
            attempted: variants.len(),
            failed,
            dropped_non_finite,
        }
    }

    async fn search_variant(
        &self,
        collection_id: &str,
        text: &str,
        top_k: usize,
    ) -> Result<Vec<VectorHit>, ExternalError> {
        let vector = call_with_policy(
            ServiceKind::Embedder,
            self.timeouts.for_service(ServiceKind::Embedder),
            &self.retry,
            || self.embedder.embed(text),
        )
        .await?;

        call_with_policy(
            ServiceKind::VectorStore,
            self.timeouts.for_service(ServiceKind::VectorStore),
            &self.retry,
            || self.store.search(collection_id, &vector, top_k),
        )
        .await
    }
}

/// Merge per-variant hits by id, keeping the maximum similarity.
///
/// Variants are visited in order, so on equal similarity the earliest variant
/// stays the origin. Returns the merged candidates and the number of hits
/// dropped for a non-finite similarity.
pub fn merge_hits(per_variant: Vec<(&str, Vec<VectorHit>)>) -> (Vec<Candidate>, usize) {
    let mut index: HashMap<String, usize> = HashMap::new();
    let mut merged: Vec<Candidate> = Vec::new();
    let mut dropped = 0;

    for (variant, hits) in per_variant {
        for hit in hits {
            if !hit.similarity.is_finite() {
                dropped += 1;
                continue;
            }
            let similarity = hit.similarity.clamp(-1.0, 1.0);
            match index.get(&hit.item_id) {
                Some(&pos) => {
                    let existing = &mut merged[pos];
                    if similarity > existing.similarity {
                        existing.similarity = similarity;
                        existing.origin_variant = variant.to_string();
                    }
                    if !existing.retrieved_by.iter().any(|v| v == variant) {
                        existing.retrieved_by.push(variant.to_string());
                    }
                    if existing.embedding.is_none() {
                        existing.embedding = hit.vector;
                    }
                }
                None => {
                    index.insert(hit.item_id.clone(), merged.len());
                    merged.push(Candidate {
                        id: hit.item_id,
                        source_document_id: hit.document_id,
                        content: hit.content,
                        similarity,
                        origin_variant: variant.to_string(),
                        retrieved_by: vec![variant.to_string()],
                        metadata: hit.metadata,
                        embedding: hit.vector,
                    });
                }
            }
        }
    }

    for candidate in &mut merged {
        candidate.retrieved_by.sort();
    }
    merged.sort_by(|a, b| {
        b.similarity
            .total_cmp(&a.similarity)
            .then_with(|| a.id.cmp(&b.id))
    });
    (merged, dropped)
}

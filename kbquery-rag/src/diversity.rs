//! Maximal Marginal Relevance evidence selection.
//!
//! Greedy and incremental: each step scores every remaining candidate with
//!
//! ```text
//! mmr(c) = λ · relevance(c) − (1 − λ) · max_{s ∈ S} sim(c, s)
//! ```
//!
//! where the max term is 0 while `S` is empty, so the first pick is always the
//! top-relevance candidate. Each candidate's max-similarity-to-selected is
//! updated only against the newest pick, giving O(budget × pool) similarity
//! evaluations.

use std::cmp::Ordering;
use std::sync::Arc;
use std::time::Duration;

use kbquery_core::config::RetryConfig;
use kbquery_core::error::ServiceKind;
use kbquery_core::providers::Embedder;
use kbquery_core::retry::call_with_policy;
use kbquery_core::types::{Candidate, ScoredCandidate, SelectedEvidence};
use kbquery_core::vector::cosine_similarity;

/// Similarity between two candidates' content in [-1, 1].
///
/// Cosine of the embeddings when both are present and comparable, otherwise
/// Sørensen–Dice over character bigrams of the text.
pub fn content_similarity(a: &Candidate, b: &Candidate) -> f32 {
    if let (Some(ea), Some(eb)) = (&a.embedding, &b.embedding) {
        if let Some(sim) = cosine_similarity(ea, eb) {
            return sim;
        }
    }
    lexical_similarity(&a.content, &b.content)
}

/// Case-insensitive lexical similarity in [0, 1].
pub fn lexical_similarity(a: &str, b: &str) -> f32 {
    strsim::sorensen_dice(&a.to_lowercase(), &b.to_lowercase()) as f32
}

/// Greedy MMR selector.
#[derive(Debug, Clone)]
pub struct DiversitySelector {
    lambda: f32,
}

impl DiversitySelector {
    /// `lambda` is clamped into [0, 1]; 1.0 is pure relevance order.
    pub fn new(lambda: f32) -> Self {
        let lambda = if lambda.is_finite() {
            lambda.clamp(0.0, 1.0)
        } else {
            1.0
        };
        Self { lambda }
    }

    pub fn lambda(&self) -> f32 {
        self.lambda
    }

    /// Pick up to `budget` candidates balancing relevance against redundancy.
    ///
    /// Ties in MMR score fall back to [`ScoredCandidate::rank_cmp`].
    pub fn select(&self, scored: &[ScoredCandidate], budget: usize) -> SelectedEvidence {
        let mut remaining: Vec<usize> = (0..scored.len()).collect();
        // Max similarity of each pool entry to anything selected so far.
        let mut max_sim: Vec<Option<f32>> = vec![None; scored.len()];
        let mut selected: Vec<ScoredCandidate> = Vec::with_capacity(budget.min(scored.len()));

        while selected.len() < budget && !remaining.is_empty() {
            let mut best_pos = 0;
            let mut best_score = f32::NEG_INFINITY;
            for (pos, &idx) in remaining.iter().enumerate() {
                let score = self.mmr_score(&scored[idx], max_sim[idx]);
                let better = match score.total_cmp(&best_score) {
                    Ordering::Greater => true,
                    Ordering::Equal => {
                        scored[idx].rank_cmp(&scored[remaining[best_pos]]) == Ordering::Less
                    }
                    Ordering::Less => false,
                };
                if pos == 0 || better {
                    best_pos = pos;
                    best_score = score;
                }
            }

            let picked = remaining.swap_remove(best_pos);
            for &idx in &remaining {
                let sim = content_similarity(&scored[idx].candidate, &scored[picked].candidate);
                max_sim[idx] = Some(max_sim[idx].map_or(sim, |m| m.max(sim)));
            }
            selected.push(scored[picked].clone());
        }

        tracing::debug!(
            pool = scored.len(),
            budget,
            selected = selected.len(),
            lambda = self.lambda,
            "MMR selection complete"
        );
        SelectedEvidence::new(selected)
    }

    fn mmr_score(&self, candidate: &ScoredCandidate, max_sim: Option<f32>) -> f32 {
        self.lambda * candidate.relevance_score - (1.0 - self.lambda) * max_sim.unwrap_or(0.0)
    }
}

/// Embed candidates that came back from the store without a vector.
///
/// Returns the number of candidates that still lack an embedding afterwards;
/// those fall back to lexical similarity.
pub async fn fill_missing_embeddings(
    embedder: &Arc<dyn Embedder>,
    scored: &mut [ScoredCandidate],
    timeout: Duration,
    retry: &RetryConfig,
) -> usize {
    let missing: Vec<usize> = scored
        .iter()
        .enumerate()
        .filter(|(_, s)| s.candidate.embedding.is_none())
        .map(|(i, _)| i)
        .collect();
    if missing.is_empty() {
        return 0;
    }

    let texts: Vec<String> = missing
        .iter()
        .map(|&i| scored[i].candidate.content.clone())
        .collect();
    let result = call_with_policy(ServiceKind::Embedder, timeout, retry, || {
        embedder.embed_batch(&texts)
    })
    .await;

    match result {
        Ok(vectors) if vectors.len() == missing.len() => {
            for (&i, vector) in missing.iter().zip(vectors) {
                scored[i].candidate.embedding = Some(vector);
            }
            0
        }
        Ok(vectors) => {
            tracing::warn!(
                expected = missing.len(),
                got = vectors.len(),
                "Embedding batch size mismatch, using lexical similarity"
            );
            missing.len()
        }
        Err(e) => {
            tracing::warn!(error = %e, missing = missing.len(), "Could not embed candidates, using lexical similarity");
            missing.len()
        }
    }
}

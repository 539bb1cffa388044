//! Pairwise relevance reranking against the original question.

use std::sync::Arc;
use std::time::Duration;

use kbquery_core::config::RetryConfig;
use kbquery_core::error::{ExternalError, ServiceKind};
use kbquery_core::providers::RelevanceScorer;
use kbquery_core::retry::call_with_policy;
use kbquery_core::types::{Candidate, ScoredCandidate};

/// Ranked candidates plus how they were scored.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RerankOutput {
    /// Sorted by [`ScoredCandidate::rank_cmp`].
    pub ranked: Vec<ScoredCandidate>,
    /// Relevance is the embedding similarity because the model was unavailable.
    pub fallback: bool,
    /// Candidates dropped because the model could not score them or returned
    /// a NaN or infinite score.
    pub dropped_unscorable: usize,
    pub error: Option<ExternalError>,
}

/// Cross-encoder style reranker with a similarity-order fallback.
pub struct Reranker {
    scorer: Option<Arc<dyn RelevanceScorer>>,
    enabled: bool,
    timeout: Duration,
    retry: RetryConfig,
}

impl Reranker {
    pub fn new(
        scorer: Option<Arc<dyn RelevanceScorer>>,
        enabled: bool,
        timeout: Duration,
        retry: RetryConfig,
    ) -> Self {
        Self {
            scorer,
            enabled,
            timeout,
            retry,
        }
    }

    /// Score every candidate against `query_text` and sort.
    ///
    /// `query_text` must be the user's original question, never a paraphrase.
    pub async fn rerank(&self, query_text: &str, candidates: Vec<Candidate>) -> RerankOutput {
        if candidates.is_empty() {
            return RerankOutput::default();
        }
        if !self.enabled {
            return similarity_order(candidates, false, None);
        }
        let Some(scorer) = self.scorer.as_ref() else {
            tracing::warn!("No relevance model configured, using similarity order");
            return similarity_order(candidates, true, None);
        };

        let passages: Vec<&str> = candidates.iter().map(|c| c.content.as_str()).collect();
        let scores = call_with_policy(ServiceKind::Reranker, self.timeout, &self.retry, || {
            scorer.score_batch(query_text, &passages)
        })
        .await;

        let scores = match scores {
            Ok(scores) if scores.len() == candidates.len() => scores,
            Ok(scores) => {
                let err = ExternalError::malformed(
                    ServiceKind::Reranker,
                    format!("expected {} scores, got {}", candidates.len(), scores.len()),
                );
                tracing::warn!(error = %err, "Reranker returned a mismatched batch, using similarity order");
                return similarity_order(candidates, true, Some(err));
            }
            Err(err) => {
                tracing::warn!(
                    model = scorer.model_name(),
                    error = %err,
                    "Reranker unavailable, using similarity order"
                );
                return similarity_order(candidates, true, Some(err));
            }
        };

        let total = candidates.len();
        let mut ranked: Vec<ScoredCandidate> = candidates
            .into_iter()
            .zip(scores)
            .filter_map(|(candidate, score)| {
                score
                    .filter(|s| s.is_finite())
                    .map(|s| ScoredCandidate::new(candidate, s))
            })
            .collect();
        let dropped_unscorable = total - ranked.len();
        if dropped_unscorable > 0 {
            tracing::warn!(dropped = dropped_unscorable, "Dropped candidates with unscorable relevance");
        }
        ranked.sort_by(|a, b| a.rank_cmp(b));

        tracing::debug!(candidates = ranked.len(), model = scorer.model_name(), "Reranked");
        RerankOutput {
            ranked,
            fallback: false,
            dropped_unscorable,
            error: None,
        }
    }
}

/// Degraded ranking: relevance is the embedding similarity.
///
/// `fallback` marks the result as a degradation rather than a configured choice.
pub fn similarity_order(
    candidates: Vec<Candidate>,
    fallback: bool,
    error: Option<ExternalError>,
) -> RerankOutput {
    let total = candidates.len();
    let mut ranked: Vec<ScoredCandidate> = candidates
        .into_iter()
        .filter(|c| c.similarity.is_finite())
        .map(|c| {
            let score = c.similarity;
            ScoredCandidate::new(c, score)
        })
        .collect();
    ranked.sort_by(|a, b| a.rank_cmp(b));
    RerankOutput {
        dropped_unscorable: total - ranked.len(),
        ranked,
        fallback,
        error,
    }
}

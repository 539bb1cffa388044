//! Query orchestration.
//!
//! One query moves through
//! `Received → Expanding → Retrieving → Reranking → Diversifying →
//! (StructuredQuerying | Predicting)* → Assembled → Done`.
//! The execution plan is decided once, up front. Branches run concurrently,
//! each returning its own result, and are merged only by the assembler. A
//! branch failure is recorded on that branch and never aborts its siblings.

use std::sync::Arc;
use std::time::Instant;

use kbquery_core::config::PipelineConfig;
use kbquery_core::error::{ConfigError, PipelineError, ServiceKind};
use kbquery_core::providers::{
    CollectionCatalog, Embedder, PredictionEngine, RelevanceScorer, StructuredQueryEngine,
    TextGenerator, VectorStore,
};
use kbquery_core::retry::call_with_policy;
use kbquery_core::types::{
    Branch, BranchReport, BranchStatus, CandidateCounts, CollectionProfile, Diagnostics,
    EvidenceBundle, EvidenceOutcome, ExecutionPlan, PipelineStage, PredictionResult,
    PredictionSpec, Query, QueryIntent, SelectedEvidence, StructuredResult,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::assembler::EvidenceAssembler;
use crate::diversity::{DiversitySelector, fill_missing_embeddings};
use crate::expander::QueryExpander;
use crate::reranker::Reranker;
use crate::retriever::Retriever;

fn elapsed_ms(since: Instant) -> u64 {
    since.elapsed().as_millis() as u64
}

/// Everything the vector branch produced. Owned by the branch until merge.
struct VectorBranch {
    selected: SelectedEvidence,
    counts: CandidateCounts,
    expansion_fallback: bool,
    rerank_fallback: bool,
    outcome: EvidenceOutcome,
    status: BranchStatus,
    timings: Vec<(PipelineStage, u64)>,
    notes: Vec<String>,
}

struct StructuredBranch {
    result: StructuredResult,
    status: BranchStatus,
    elapsed_ms: u64,
}

struct PredictionBranch {
    result: PredictionResult,
    status: BranchStatus,
    elapsed_ms: u64,
}

/// Top-level entry point of the retrieval core.
///
/// Configuration and collaborators are fixed at construction; the
/// orchestrator holds no per-query state, so one instance can serve many
/// concurrent queries.
pub struct PipelineOrchestrator {
    config: PipelineConfig,
    embedder: Arc<dyn Embedder>,
    vector_store: Arc<dyn VectorStore>,
    text_generator: Option<Arc<dyn TextGenerator>>,
    relevance_scorer: Option<Arc<dyn RelevanceScorer>>,
    structured_engine: Option<Arc<dyn StructuredQueryEngine>>,
    prediction_engine: Option<Arc<dyn PredictionEngine>>,
    catalog: Option<Arc<dyn CollectionCatalog>>,
}

impl PipelineOrchestrator {
    /// Create an orchestrator over the two mandatory collaborators.
    pub fn new(
        config: PipelineConfig,
        embedder: Arc<dyn Embedder>,
        vector_store: Arc<dyn VectorStore>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            config,
            embedder,
            vector_store,
            text_generator: None,
            relevance_scorer: None,
            structured_engine: None,
            prediction_engine: None,
            catalog: None,
        })
    }

    /// Text generator used for query expansion.
    pub fn with_text_generator(mut self, generator: Arc<dyn TextGenerator>) -> Self {
        self.text_generator = Some(generator);
        self
    }

    pub fn with_relevance_scorer(mut self, scorer: Arc<dyn RelevanceScorer>) -> Self {
        self.relevance_scorer = Some(scorer);
        self
    }

    pub fn with_structured_engine(mut self, engine: Arc<dyn StructuredQueryEngine>) -> Self {
        self.structured_engine = Some(engine);
        self
    }

    pub fn with_prediction_engine(mut self, engine: Arc<dyn PredictionEngine>) -> Self {
        self.prediction_engine = Some(engine);
        self
    }

    pub fn with_catalog(mut self, catalog: Arc<dyn CollectionCatalog>) -> Self {
        self.catalog = Some(catalog);
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Answer a question: vector retrieval plus structured querying when the
    /// collection has tables attached.
    pub async fn answer_query(&self, query: &Query) -> Result<EvidenceBundle, PipelineError> {
        query.validate()?;
        Ok(self.run(query, QueryIntent::Answer, None).await)
    }

    /// Like [`answer_query`](Self::answer_query), abandoning every in-flight
    /// branch when `cancel` fires. A cancelled query yields no bundle.
    pub async fn answer_query_with_cancel(
        &self,
        query: &Query,
        cancel: &CancellationToken,
    ) -> Result<EvidenceBundle, PipelineError> {
        query.validate()?;
        self.run_cancellable(query, QueryIntent::Answer, None, cancel)
            .await
    }

    /// Explicit predictive request. Prediction never runs from `answer_query`.
    pub async fn predict(
        &self,
        query: &Query,
        spec: &PredictionSpec,
    ) -> Result<EvidenceBundle, PipelineError> {
        query.validate()?;
        Ok(self.run(query, QueryIntent::Predict, Some(spec)).await)
    }

    pub async fn predict_with_cancel(
        &self,
        query: &Query,
        spec: &PredictionSpec,
        cancel: &CancellationToken,
    ) -> Result<EvidenceBundle, PipelineError> {
        query.validate()?;
        self.run_cancellable(query, QueryIntent::Predict, Some(spec), cancel)
            .await
    }

    async fn run_cancellable(
        &self,
        query: &Query,
        intent: QueryIntent,
        spec: Option<&PredictionSpec>,
        cancel: &CancellationToken,
    ) -> Result<EvidenceBundle, PipelineError> {
        if cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                warn!(query_id = %query.id(), "Query cancelled, discarding in-flight branches");
                Err(PipelineError::Cancelled)
            }
            bundle = self.run(query, intent, spec) => Ok(bundle),
        }
    }

    async fn run(
        &self,
        query: &Query,
        intent: QueryIntent,
        spec: Option<&PredictionSpec>,
    ) -> EvidenceBundle {
        let started = Instant::now();
        let mut notes = Vec::new();
        let profile = self.resolve_profile(query.collection_id(), &mut notes).await;
        let plan = ExecutionPlan::decide(intent, profile);
        let mut diagnostics = Diagnostics::new(plan);
        diagnostics.notes = notes;
        diagnostics.session_id = query.session_id().map(str::to_string);

        info!(
            query_id = %query.id(),
            session = query.session_id(),
            collection = query.collection_id(),
            plan = ?plan,
            "Query received"
        );

        let vector = async {
            if plan.runs_vector() {
                Some(self.run_vector_branch(query).await)
            } else {
                None
            }
        };
        let structured = async {
            if plan.runs_structured() {
                Some(self.run_structured_branch(query).await)
            } else {
                None
            }
        };
        let prediction = async {
            match spec {
                Some(spec) if plan.runs_prediction() => {
                    Some(self.run_prediction_branch(query, spec).await)
                }
                _ => None,
            }
        };
        let (vector, structured, prediction) = tokio::join!(vector, structured, prediction);

        let selected = match vector {
            Some(branch) => {
                for (stage, ms) in branch.timings {
                    diagnostics.trace.push(stage);
                    diagnostics.timings.record(stage, ms);
                }
                diagnostics.counts = branch.counts;
                diagnostics.expansion_fallback = branch.expansion_fallback;
                diagnostics.rerank_fallback = branch.rerank_fallback;
                diagnostics.vector_outcome = branch.outcome;
                diagnostics.notes.extend(branch.notes);
                diagnostics.branches.push(BranchReport {
                    branch: Branch::Vector,
                    status: branch.status,
                });
                branch.selected
            }
            None => {
                diagnostics.branches.push(BranchReport {
                    branch: Branch::Vector,
                    status: BranchStatus::Skipped,
                });
                SelectedEvidence::default()
            }
        };

        let structured_result = match structured {
            Some(branch) => {
                diagnostics.trace.push(PipelineStage::StructuredQuerying);
                diagnostics
                    .timings
                    .record(PipelineStage::StructuredQuerying, branch.elapsed_ms);
                diagnostics.branches.push(BranchReport {
                    branch: Branch::Structured,
                    status: branch.status,
                });
                Some(branch.result)
            }
            None => {
                diagnostics.branches.push(BranchReport {
                    branch: Branch::Structured,
                    status: BranchStatus::Skipped,
                });
                None
            }
        };

        let prediction_result = match prediction {
            Some(branch) => {
                diagnostics.trace.push(PipelineStage::Predicting);
                diagnostics
                    .timings
                    .record(PipelineStage::Predicting, branch.elapsed_ms);
                diagnostics.branches.push(BranchReport {
                    branch: Branch::Prediction,
                    status: branch.status,
                });
                Some(branch.result)
            }
            None => {
                diagnostics.branches.push(BranchReport {
                    branch: Branch::Prediction,
                    status: BranchStatus::Skipped,
                });
                None
            }
        };

        let mut bundle = EvidenceAssembler::new(query.id(), diagnostics).assemble(
            selected,
            structured_result,
            prediction_result,
        );
        bundle.diagnostics.trace.push(PipelineStage::Done);
        bundle.diagnostics.timings.total_ms = elapsed_ms(started);

        info!(
            query_id = %bundle.query_id,
            session = query.session_id(),
            collection = query.collection_id(),
            selected = bundle.selected_evidence.len(),
            failed_branches = bundle.diagnostics.failed_branches().len(),
            elapsed_ms = bundle.diagnostics.timings.total_ms,
            "Query assembled"
        );
        bundle
    }

    /// Capability flags for the collection. Without a catalog, structured
    /// data is assumed present exactly when a structured engine is wired in.
    async fn resolve_profile(&self, collection_id: &str, notes: &mut Vec<String>) -> CollectionProfile {
        let Some(catalog) = self.catalog.as_ref() else {
            return CollectionProfile {
                has_unstructured: true,
                has_structured: self.structured_engine.is_some(),
            };
        };
        let result = call_with_policy(
            ServiceKind::Catalog,
            self.config.timeouts.for_service(ServiceKind::Catalog),
            &self.config.retry,
            || catalog.profile(collection_id),
        )
        .await;
        match result {
            Ok(profile) => profile,
            Err(e) => {
                warn!(collection = collection_id, error = %e, "Catalog lookup failed, assuming unstructured-only");
                notes.push(format!(
                    "collection catalog unavailable, assuming unstructured-only: {e}"
                ));
                CollectionProfile::unstructured_only()
            }
        }
    }

    async fn run_vector_branch(&self, query: &Query) -> VectorBranch {
        let config = &self.config;
        let mut timings = Vec::with_capacity(4);
        let mut notes = Vec::new();
        let mut counts = CandidateCounts::default();

        // Expanding
        debug!(query_id = %query.id(), stage = ?PipelineStage::Expanding, "Stage entered");
        let stage = Instant::now();
        let expander = QueryExpander::new(
            self.text_generator.clone(),
            config.expansion.clone(),
            config.timeouts.for_service(ServiceKind::TextGenerator),
            config.retry.clone(),
        );
        let expansion = expander.expand(query.raw_text()).await;
        timings.push((PipelineStage::Expanding, elapsed_ms(stage)));
        counts.variants = expansion.variants.len();
        if expansion.fallback {
            let reason = expansion
                .error
                .as_ref()
                .map_or_else(|| "no usable paraphrases".to_string(), ToString::to_string);
            notes.push(format!("query expansion fell back to the original question: {reason}"));
        }

        // Retrieving
        debug!(query_id = %query.id(), stage = ?PipelineStage::Retrieving, variants = counts.variants, "Stage entered");
        let stage = Instant::now();
        let retriever = Retriever::new(
            self.embedder.clone(),
            self.vector_store.clone(),
            config.timeouts.clone(),
            config.retry.clone(),
        );
        let retrieval = retriever
            .retrieve(
                query.collection_id(),
                &expansion.variants,
                config.retrieval.top_k_per_variant,
            )
            .await;
        timings.push((PipelineStage::Retrieving, elapsed_ms(stage)));
        counts.retrieved = retrieval.candidates.len();
        counts.failed_variants = retrieval.failed.len();
        for failure in &retrieval.failed {
            notes.push(format!(
                "retrieval for variant '{}' failed: {}",
                failure.variant, failure.error
            ));
        }
        let failure_reason = if retrieval.all_failed() {
            retrieval.failed.first().map(|f| f.error.to_string())
        } else {
            None
        };

        // Reranking
        debug!(query_id = %query.id(), stage = ?PipelineStage::Reranking, candidates = counts.retrieved, "Stage entered");
        let stage = Instant::now();
        let reranker = Reranker::new(
            self.relevance_scorer.clone(),
            config.rerank.enabled,
            config.timeouts.for_service(ServiceKind::Reranker),
            config.retry.clone(),
        );
        let rerank = reranker
            .rerank(query.raw_text(), retrieval.candidates)
            .await;
        timings.push((PipelineStage::Reranking, elapsed_ms(stage)));
        counts.reranked = rerank.ranked.len();
        counts.dropped_unscorable = rerank.dropped_unscorable + retrieval.dropped_non_finite;
        if rerank.fallback {
            notes.push(match &rerank.error {
                Some(e) => format!("reranker unavailable, ranked by similarity: {e}"),
                None => "no relevance model configured, ranked by similarity".to_string(),
            });
        }

        // Diversifying
        debug!(query_id = %query.id(), stage = ?PipelineStage::Diversifying, candidates = counts.reranked, "Stage entered");
        let stage = Instant::now();
        let mut ranked = rerank.ranked;
        if config.diversity.embed_missing {
            let missing = fill_missing_embeddings(
                &self.embedder,
                &mut ranked,
                config.timeouts.for_service(ServiceKind::Embedder),
                &config.retry,
            )
            .await;
            if missing > 0 {
                notes.push(format!(
                    "{missing} candidates compared lexically for diversity"
                ));
            }
        }
        let selector = DiversitySelector::new(config.diversity.lambda);
        let selected = selector.select(&ranked, config.diversity.evidence_budget);
        timings.push((PipelineStage::Diversifying, elapsed_ms(stage)));
        counts.selected = selected.len();

        let (outcome, status) = match failure_reason {
            Some(reason) => {
                warn!(query_id = %query.id(), error = %reason, "Vector retrieval failed for every variant");
                (
                    EvidenceOutcome::Failed {
                        reason: reason.clone(),
                    },
                    BranchStatus::Failed { error: reason },
                )
            }
            None if selected.is_empty() => (EvidenceOutcome::NoEvidence, BranchStatus::Empty),
            None => (EvidenceOutcome::Found, BranchStatus::Succeeded),
        };

        VectorBranch {
            selected,
            counts,
            expansion_fallback: expansion.fallback,
            rerank_fallback: rerank.fallback,
            outcome,
            status,
            timings,
            notes,
        }
    }

    async fn run_structured_branch(&self, query: &Query) -> StructuredBranch {
        debug!(query_id = %query.id(), stage = ?PipelineStage::StructuredQuerying, "Stage entered");
        let started = Instant::now();
        let result = match self.structured_engine.as_ref() {
            None => StructuredResult::failed(query.raw_text(), "no structured query engine configured"),
            Some(engine) => {
                let outcome = call_with_policy(
                    ServiceKind::StructuredQuery,
                    self.config.timeouts.for_service(ServiceKind::StructuredQuery),
                    &self.config.retry,
                    || engine.run(query.collection_id(), query.raw_text()),
                )
                .await;
                match outcome {
                    Ok(result) => result,
                    Err(e) => StructuredResult::failed(query.raw_text(), e.to_string()),
                }
            }
        };

        let status = match &result.execution_error {
            Some(error) => {
                warn!(query_id = %query.id(), error = %error, "Structured query branch failed");
                BranchStatus::Failed {
                    error: error.clone(),
                }
            }
            None if result.row_count == 0 => BranchStatus::Empty,
            None => BranchStatus::Succeeded,
        };
        StructuredBranch {
            result,
            status,
            elapsed_ms: elapsed_ms(started),
        }
    }

    async fn run_prediction_branch(&self, query: &Query, spec: &PredictionSpec) -> PredictionBranch {
        debug!(query_id = %query.id(), stage = ?PipelineStage::Predicting, "Stage entered");
        let started = Instant::now();
        let result = match self.prediction_engine.as_ref() {
            None => PredictionResult::failed(spec, "no prediction engine configured"),
            Some(engine) => {
                let outcome = call_with_policy(
                    ServiceKind::Prediction,
                    self.config.timeouts.for_service(ServiceKind::Prediction),
                    &self.config.retry,
                    || engine.run(query.collection_id(), spec),
                )
                .await;
                match outcome {
                    Ok(result) => result,
                    Err(e) => PredictionResult::failed(spec, e.to_string()),
                }
            }
        };

        let status = match &result.execution_error {
            Some(error) => {
                warn!(query_id = %query.id(), error = %error, "Prediction branch failed");
                BranchStatus::Failed {
                    error: error.clone(),
                }
            }
            None if result.points.is_empty() => BranchStatus::Empty,
            None => BranchStatus::Succeeded,
        };
        PredictionBranch {
            result,
            status,
            elapsed_ms: elapsed_ms(started),
        }
    }
}

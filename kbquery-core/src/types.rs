//! Core data model for one query's trip through the retrieval pipeline.
//!
//! Everything here is constructed fresh per query. The [`EvidenceBundle`] is the
//! sole output of the core and is never mutated after it is returned.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::error::PipelineError;

/// Free-form metadata attached to chunks, rows and model diagnostics.
pub type Metadata = BTreeMap<String, serde_json::Value>;

// ---------------------------------------------------------------------------
// Query
// ---------------------------------------------------------------------------

/// A user question against one collection. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Query {
    id: Uuid,
    raw_text: String,
    collection_id: String,
    session_id: Option<String>,
}

impl Query {
    pub fn new(raw_text: impl Into<String>, collection_id: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            raw_text: raw_text.into(),
            collection_id: collection_id.into(),
            session_id: None,
        }
    }

    /// Attach the chat/session the question belongs to.
    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn raw_text(&self) -> &str {
        &self.raw_text
    }

    pub fn collection_id(&self) -> &str {
        &self.collection_id
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    /// Reject malformed queries before any branch starts.
    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.collection_id.trim().is_empty() {
            return Err(PipelineError::InvalidQuery {
                reason: "collection_id is empty".into(),
            });
        }
        if self.raw_text.trim().is_empty() {
            return Err(PipelineError::InvalidQuery {
                reason: "query text is empty".into(),
            });
        }
        Ok(())
    }
}

/// Where a query variant came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VariantOrigin {
    Original,
    Expanded,
}

/// The original question or one LLM-generated paraphrase of it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryVariant {
    pub text: String,
    pub origin: VariantOrigin,
}

impl QueryVariant {
    pub fn original(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            origin: VariantOrigin::Original,
        }
    }

    pub fn expanded(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            origin: VariantOrigin::Expanded,
        }
    }

    /// Key used for uniqueness within a variant set.
    pub fn normalized(&self) -> String {
        normalize_text(&self.text)
    }
}

/// Case- and whitespace-insensitive form of a text.
pub fn normalize_text(text: &str) -> String {
    text.split_whitespace()
        .map(|w| w.to_lowercase())
        .collect::<Vec<_>>()
        .join(" ")
}

// ---------------------------------------------------------------------------
// Candidates
// ---------------------------------------------------------------------------

/// A chunk returned by vector search, merged across query variants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub id: String,
    pub source_document_id: String,
    pub content: String,
    /// Maximum cosine similarity observed across variants, in [-1, 1].
    pub similarity: f32,
    /// Text of the variant that produced `similarity`.
    pub origin_variant: String,
    /// Every variant that retrieved this chunk. Diagnostic only.
    pub retrieved_by: Vec<String>,
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
}

impl Candidate {
    /// Number of distinct variants that retrieved this chunk.
    pub fn corroboration(&self) -> usize {
        self.retrieved_by.len()
    }
}

/// A candidate with its reranker relevance score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredCandidate {
    pub candidate: Candidate,
    /// Higher is more relevant. Comparable only within one invocation.
    pub relevance_score: f32,
}

impl ScoredCandidate {
    pub fn new(candidate: Candidate, relevance_score: f32) -> Self {
        Self {
            candidate,
            relevance_score,
        }
    }

    pub fn id(&self) -> &str {
        &self.candidate.id
    }

    /// Deterministic ranking order: relevance desc, similarity desc, id asc.
    pub fn rank_cmp(&self, other: &Self) -> Ordering {
        other
            .relevance_score
            .total_cmp(&self.relevance_score)
            .then_with(|| other.candidate.similarity.total_cmp(&self.candidate.similarity))
            .then_with(|| self.candidate.id.cmp(&other.candidate.id))
    }
}

/// Ordered evidence chosen by the diversity selector. Index 0 is "Source 1".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SelectedEvidence {
    items: Vec<ScoredCandidate>,
}

impl SelectedEvidence {
    pub fn new(items: Vec<ScoredCandidate>) -> Self {
        Self { items }
    }

    pub fn as_slice(&self) -> &[ScoredCandidate] {
        &self.items
    }

    pub fn iter(&self) -> std::slice::Iter<'_, ScoredCandidate> {
        self.items.iter()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn first(&self) -> Option<&ScoredCandidate> {
        self.items.first()
    }

    pub fn ids(&self) -> Vec<&str> {
        self.items.iter().map(|s| s.id()).collect()
    }

    pub fn into_inner(self) -> Vec<ScoredCandidate> {
        self.items
    }
}

impl<'a> IntoIterator for &'a SelectedEvidence {
    type Item = &'a ScoredCandidate;
    type IntoIter = std::slice::Iter<'a, ScoredCandidate>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.iter()
    }
}

// ---------------------------------------------------------------------------
// Structured data & predictions
// ---------------------------------------------------------------------------

/// Rows returned by the structured-query engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StructuredResult {
    /// The SQL or query spec that was executed.
    pub query: String,
    pub rows: Vec<Metadata>,
    pub row_count: usize,
    pub column_names: Vec<String>,
    pub execution_error: Option<String>,
}

impl StructuredResult {
    pub fn from_rows(query: impl Into<String>, column_names: Vec<String>, rows: Vec<Metadata>) -> Self {
        Self {
            query: query.into(),
            row_count: rows.len(),
            rows,
            column_names,
            execution_error: None,
        }
    }

    pub fn failed(query: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            rows: Vec::new(),
            row_count: 0,
            column_names: Vec::new(),
            execution_error: Some(error.into()),
        }
    }

    pub fn is_failed(&self) -> bool {
        self.execution_error.is_some()
    }

    pub fn has_rows(&self) -> bool {
        self.execution_error.is_none() && self.row_count > 0
    }
}

/// An explicit predictive-analytics request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionSpec {
    /// e.g. "forecast", "trend", "regression".
    pub prediction_type: String,
    pub target_column: String,
    #[serde(default)]
    pub horizon: Option<u32>,
    #[serde(default)]
    pub parameters: Metadata,
}

impl PredictionSpec {
    pub fn new(prediction_type: impl Into<String>, target_column: impl Into<String>) -> Self {
        Self {
            prediction_type: prediction_type.into(),
            target_column: target_column.into(),
            horizon: None,
            parameters: Metadata::new(),
        }
    }

    pub fn with_horizon(mut self, horizon: u32) -> Self {
        self.horizon = Some(horizon);
        self
    }
}

/// One forecast/fitted point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionPoint {
    pub label: String,
    pub value: f64,
    #[serde(default)]
    pub lower: Option<f64>,
    #[serde(default)]
    pub upper: Option<f64>,
}

/// Output of the prediction engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionResult {
    pub prediction_type: String,
    pub target_column: String,
    pub points: Vec<PredictionPoint>,
    #[serde(default)]
    pub model_diagnostics: Metadata,
    pub execution_error: Option<String>,
}

impl PredictionResult {
    pub fn failed(spec: &PredictionSpec, error: impl Into<String>) -> Self {
        Self {
            prediction_type: spec.prediction_type.clone(),
            target_column: spec.target_column.clone(),
            points: Vec::new(),
            model_diagnostics: Metadata::new(),
            execution_error: Some(error.into()),
        }
    }

    pub fn is_failed(&self) -> bool {
        self.execution_error.is_some()
    }
}

// ---------------------------------------------------------------------------
// Planning
// ---------------------------------------------------------------------------

/// What the caller declared it wants from this request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryIntent {
    Answer,
    Predict,
}

/// Capability flags of a collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionProfile {
    pub has_unstructured: bool,
    pub has_structured: bool,
}

impl CollectionProfile {
    pub fn unstructured_only() -> Self {
        Self {
            has_unstructured: true,
            has_structured: false,
        }
    }

    pub fn mixed() -> Self {
        Self {
            has_unstructured: true,
            has_structured: true,
        }
    }

    pub fn empty() -> Self {
        Self {
            has_unstructured: false,
            has_structured: false,
        }
    }
}

/// Which branches run for a query. Computed once, before any branch starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExecutionPlan {
    VectorOnly,
    StructuredOnly,
    Mixed,
    Predictive { vector: bool, structured: bool },
}

impl ExecutionPlan {
    /// Vector retrieval runs unless the collection is known to hold only
    /// structured data; structured querying runs only when tables are attached;
    /// prediction runs only on an explicit predictive request.
    pub fn decide(intent: QueryIntent, profile: CollectionProfile) -> Self {
        let structured = profile.has_structured;
        let vector = profile.has_unstructured || !structured;
        match intent {
            QueryIntent::Predict => ExecutionPlan::Predictive { vector, structured },
            QueryIntent::Answer => match (vector, structured) {
                (true, true) => ExecutionPlan::Mixed,
                (false, true) => ExecutionPlan::StructuredOnly,
                _ => ExecutionPlan::VectorOnly,
            },
        }
    }

    pub fn runs_vector(&self) -> bool {
        match self {
            ExecutionPlan::VectorOnly | ExecutionPlan::Mixed => true,
            ExecutionPlan::StructuredOnly => false,
            ExecutionPlan::Predictive { vector, .. } => *vector,
        }
    }

    pub fn runs_structured(&self) -> bool {
        match self {
            ExecutionPlan::StructuredOnly | ExecutionPlan::Mixed => true,
            ExecutionPlan::VectorOnly => false,
            ExecutionPlan::Predictive { structured, .. } => *structured,
        }
    }

    pub fn runs_prediction(&self) -> bool {
        matches!(self, ExecutionPlan::Predictive { .. })
    }
}

// ---------------------------------------------------------------------------
// Diagnostics
// ---------------------------------------------------------------------------

/// States of one query's lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStage {
    Received,
    Expanding,
    Retrieving,
    Reranking,
    Diversifying,
    StructuredQuerying,
    Predicting,
    Assembled,
    Done,
}

/// An independent sub-pipeline within one query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Branch {
    Vector,
    Structured,
    Prediction,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum BranchStatus {
    Skipped,
    Succeeded,
    /// Ran fine, found nothing. Not an error.
    Empty,
    Failed { error: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchReport {
    pub branch: Branch,
    pub status: BranchStatus,
}

/// Outcome of the vector branch, separating "nothing found" from "lookup failed".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum EvidenceOutcome {
    #[default]
    NotRun,
    Found,
    NoEvidence,
    Failed {
        reason: String,
    },
}

/// Candidate counts at each stage.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateCounts {
    pub variants: usize,
    pub retrieved: usize,
    pub failed_variants: usize,
    pub reranked: usize,
    pub dropped_unscorable: usize,
    pub selected: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageTiming {
    pub stage: PipelineStage,
    pub elapsed_ms: u64,
}

/// Wall-clock measurements. Differ between otherwise identical runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageTimings {
    pub started_at: DateTime<Utc>,
    pub stages: Vec<StageTiming>,
    pub total_ms: u64,
}

impl Default for StageTimings {
    fn default() -> Self {
        Self {
            started_at: Utc::now(),
            stages: Vec::new(),
            total_ms: 0,
        }
    }
}

impl StageTimings {
    pub fn record(&mut self, stage: PipelineStage, elapsed_ms: u64) {
        self.stages.push(StageTiming { stage, elapsed_ms });
    }

    pub fn elapsed_for(&self, stage: PipelineStage) -> Option<u64> {
        self.stages
            .iter()
            .find(|t| t.stage == stage)
            .map(|t| t.elapsed_ms)
    }
}

/// Observability data attached to every bundle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Diagnostics {
    pub plan: ExecutionPlan,
    /// Caller's chat/session id, echoed for log correlation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// Stages visited, in order.
    pub trace: Vec<PipelineStage>,
    pub counts: CandidateCounts,
    pub expansion_fallback: bool,
    pub rerank_fallback: bool,
    pub vector_outcome: EvidenceOutcome,
    pub branches: Vec<BranchReport>,
    pub notes: Vec<String>,
    pub timings: StageTimings,
}

impl Diagnostics {
    pub fn new(plan: ExecutionPlan) -> Self {
        Self {
            plan,
            session_id: None,
            trace: vec![PipelineStage::Received],
            counts: CandidateCounts::default(),
            expansion_fallback: false,
            rerank_fallback: false,
            vector_outcome: EvidenceOutcome::NotRun,
            branches: Vec::new(),
            notes: Vec::new(),
            timings: StageTimings::default(),
        }
    }

    pub fn branch(&self, branch: Branch) -> Option<&BranchStatus> {
        self.branches
            .iter()
            .find(|r| r.branch == branch)
            .map(|r| &r.status)
    }

    pub fn failed_branches(&self) -> Vec<Branch> {
        self.branches
            .iter()
            .filter(|r| matches!(r.status, BranchStatus::Failed { .. }))
            .map(|r| r.branch)
            .collect()
    }

    /// Equality ignoring wall-clock timings.
    pub fn same_content(&self, other: &Self) -> bool {
        self.plan == other.plan
            && self.session_id == other.session_id
            && self.trace == other.trace
            && self.counts == other.counts
            && self.expansion_fallback == other.expansion_fallback
            && self.rerank_fallback == other.rerank_fallback
            && self.vector_outcome == other.vector_outcome
            && self.branches == other.branches
            && self.notes == other.notes
    }
}

// ---------------------------------------------------------------------------
// Evidence bundle
// ---------------------------------------------------------------------------

/// Unified, ranked evidence handed to answer synthesis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvidenceBundle {
    pub query_id: Uuid,
    pub selected_evidence: SelectedEvidence,
    pub structured_result: Option<StructuredResult>,
    pub prediction_result: Option<PredictionResult>,
    pub diagnostics: Diagnostics,
}

impl EvidenceBundle {
    /// True when any branch produced usable evidence.
    pub fn has_evidence(&self) -> bool {
        !self.selected_evidence.is_empty()
            || self
                .structured_result
                .as_ref()
                .is_some_and(StructuredResult::has_rows)
            || self
                .prediction_result
                .as_ref()
                .is_some_and(|p| !p.is_failed() && !p.points.is_empty())
    }

    /// True when there is no evidence *because* something failed, as opposed
    /// to every branch legitimately coming back empty.
    pub fn retrieval_failed(&self) -> bool {
        !self.has_evidence() && !self.diagnostics.failed_branches().is_empty()
    }

    /// Equality ignoring wall-clock timings.
    pub fn same_content(&self, other: &Self) -> bool {
        self.query_id == other.query_id
            && self.selected_evidence == other.selected_evidence
            && self.structured_result == other.structured_result
            && self.prediction_result == other.prediction_result
            && self.diagnostics.same_content(&other.diagnostics)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(id: &str, similarity: f32) -> Candidate {
        Candidate {
            id: id.into(),
            source_document_id: "doc".into(),
            content: format!("content {id}"),
            similarity,
            origin_variant: "q".into(),
            retrieved_by: vec!["q".into()],
            metadata: Metadata::new(),
            embedding: None,
        }
    }

    #[test]
    fn test_query_validation() {
        assert!(Query::new("what is revenue", "kb-1").validate().is_ok());
        assert!(matches!(
            Query::new("what is revenue", "  ").validate(),
            Err(PipelineError::InvalidQuery { .. })
        ));
        assert!(Query::new("   ", "kb-1").validate().is_err());
    }

    #[test]
    fn test_query_session() {
        let q = Query::new("q", "kb").with_session("chat-7");
        assert_eq!(q.session_id(), Some("chat-7"));
        assert_eq!(q.collection_id(), "kb");
    }

    #[test]
    fn test_normalize_text() {
        assert_eq!(normalize_text("  Find   the Revenue\tTrend "), "find the revenue trend");
        assert_eq!(
            QueryVariant::expanded("FIND the revenue trend").normalized(),
            QueryVariant::original("find the  revenue trend").normalized()
        );
    }

    #[test]
    fn test_rank_cmp_tie_breaking() {
        let a = ScoredCandidate::new(candidate("b", 0.5), 0.9);
        let b = ScoredCandidate::new(candidate("a", 0.5), 0.9);
        let c = ScoredCandidate::new(candidate("c", 0.8), 0.9);
        let d = ScoredCandidate::new(candidate("d", 0.1), 0.95);

        let mut ranked = vec![a, b, c, d];
        ranked.sort_by(|x, y| x.rank_cmp(y));
        let ids: Vec<&str> = ranked.iter().map(|s| s.id()).collect();
        assert_eq!(ids, vec!["d", "c", "a", "b"]);
    }

    #[test]
    fn test_plan_decision() {
        assert_eq!(
            ExecutionPlan::decide(QueryIntent::Answer, CollectionProfile::unstructured_only()),
            ExecutionPlan::VectorOnly
        );
        assert_eq!(
            ExecutionPlan::decide(QueryIntent::Answer, CollectionProfile::mixed()),
            ExecutionPlan::Mixed
        );
        let structured_only = CollectionProfile {
            has_unstructured: false,
            has_structured: true,
        };
        assert_eq!(
            ExecutionPlan::decide(QueryIntent::Answer, structured_only),
            ExecutionPlan::StructuredOnly
        );
        assert_eq!(
            ExecutionPlan::decide(QueryIntent::Answer, CollectionProfile::empty()),
            ExecutionPlan::VectorOnly
        );
        let plan = ExecutionPlan::decide(QueryIntent::Predict, CollectionProfile::mixed());
        assert!(plan.runs_prediction() && plan.runs_vector() && plan.runs_structured());
    }

    #[test]
    fn test_structured_result_states() {
        let ok = StructuredResult::from_rows("SELECT 1", vec!["x".into()], vec![Metadata::new()]);
        assert!(ok.has_rows());
        assert_eq!(ok.row_count, 1);

        let empty = StructuredResult::from_rows("SELECT 1", vec!["x".into()], Vec::new());
        assert!(!empty.has_rows());
        assert!(!empty.is_failed());

        let failed = StructuredResult::failed("SELEC", "syntax error");
        assert!(failed.is_failed());
        assert!(!failed.has_rows());
    }

    #[test]
    fn test_bundle_failure_vs_empty() {
        let mut diagnostics = Diagnostics::new(ExecutionPlan::VectorOnly);
        diagnostics.branches.push(BranchReport {
            branch: Branch::Vector,
            status: BranchStatus::Empty,
        });
        let bundle = EvidenceBundle {
            query_id: Uuid::nil(),
            selected_evidence: SelectedEvidence::default(),
            structured_result: None,
            prediction_result: None,
            diagnostics,
        };
        assert!(!bundle.has_evidence());
        assert!(!bundle.retrieval_failed());

        let mut failed = bundle.clone();
        failed.diagnostics.branches[0].status = BranchStatus::Failed {
            error: "vector_store unavailable".into(),
        };
        assert!(failed.retrieval_failed());
    }

    #[test]
    fn test_candidate_serializes_without_embedding() {
        let json = serde_json::to_value(candidate("c1", 0.4)).unwrap();
        assert!(json.get("embedding").is_none());
        assert_eq!(json["id"], "c1");
    }
}

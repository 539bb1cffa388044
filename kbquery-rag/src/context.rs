//! Rendering an evidence bundle into synthesis context and citations.

use kbquery_core::types::{EvidenceBundle, Metadata, SelectedEvidence};
use serde::{Deserialize, Serialize};

/// Returned when every branch legitimately came back empty.
pub const NO_EVIDENCE_MESSAGE: &str = "No relevant information found in the knowledge base for this question.";

/// Returned when nothing is available because retrieval itself failed.
pub const RETRIEVAL_FAILED_MESSAGE: &str =
    "Evidence retrieval failed, so the knowledge base could not be searched for this question.";

const PREVIEW_CHARS: usize = 200;
const TOKENS_OVERHEAD_PER_CHUNK: usize = 100;
const CHARS_PER_TOKEN: usize = 4;

/// Rendering limits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextOptions {
    pub max_chars_per_source: usize,
    pub max_rows: usize,
}

impl Default for ContextOptions {
    fn default() -> Self {
        Self {
            max_chars_per_source: 500,
            max_rows: 20,
        }
    }
}

/// A numbered citation for one selected chunk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceReference {
    /// 1-based, matching "[Source N]" in the rendered context.
    pub number: usize,
    pub document_id: String,
    pub chunk_id: String,
    pub preview: String,
    /// Rounded to three decimals.
    pub similarity: f32,
    pub relevance_score: f32,
    pub metadata: Metadata,
}

fn truncate_chars(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        text.to_string()
    } else {
        let mut out: String = text.chars().take(max).collect();
        out.push_str("...");
        out
    }
}

fn source_name(metadata: &Metadata) -> Option<&str> {
    ["filename", "file_name", "source"]
        .iter()
        .find_map(|key| metadata.get(*key).and_then(|v| v.as_str()))
}

fn cell_text(value: Option<&serde_json::Value>) -> String {
    match value {
        None | Some(serde_json::Value::Null) => String::new(),
        Some(serde_json::Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}

/// Build the context handed to answer synthesis.
pub fn render_context(bundle: &EvidenceBundle, options: &ContextOptions) -> String {
    if !bundle.has_evidence() {
        return if bundle.retrieval_failed() {
            RETRIEVAL_FAILED_MESSAGE.to_string()
        } else {
            NO_EVIDENCE_MESSAGE.to_string()
        };
    }

    let mut sections = Vec::new();

    if !bundle.selected_evidence.is_empty() {
        let mut section = String::from("RELEVANT DOCUMENT EXCERPTS:");
        for (i, item) in bundle.selected_evidence.iter().enumerate() {
            section.push_str(&format!(
                "\n\n[Source {}] (Relevance: {:.2})",
                i + 1,
                item.relevance_score
            ));
            if let Some(name) = source_name(&item.candidate.metadata) {
                section.push_str(&format!("\nFrom: {name}"));
            }
            section.push('\n');
            section.push_str(&truncate_chars(
                &item.candidate.content,
                options.max_chars_per_source,
            ));
        }
        sections.push(section);
    }

    if let Some(result) = &bundle.structured_result {
        if result.has_rows() {
            let mut section = format!(
                "STRUCTURED DATA QUERY RESULTS:\nQuery: {}\nRows: {}",
                result.query, result.row_count
            );
            if !result.column_names.is_empty() {
                section.push('\n');
                section.push_str(&result.column_names.join(" | "));
            }
            for row in result.rows.iter().take(options.max_rows) {
                let cells: Vec<String> = if result.column_names.is_empty() {
                    row.values().map(|v| cell_text(Some(v))).collect()
                } else {
                    result
                        .column_names
                        .iter()
                        .map(|c| cell_text(row.get(c)))
                        .collect()
                };
                section.push('\n');
                section.push_str(&cells.join(" | "));
            }
            if result.rows.len() > options.max_rows {
                section.push_str(&format!(
                    "\n(... {} more rows)",
                    result.rows.len() - options.max_rows
                ));
            }
            sections.push(section);
        } else if let Some(error) = &result.execution_error {
            sections.push(format!("Structured data query failed: {error}"));
        }
    }

    if let Some(prediction) = &bundle.prediction_result {
        if prediction.is_failed() {
            if let Some(error) = &prediction.execution_error {
                sections.push(format!("Prediction failed: {error}"));
            }
        } else if !prediction.points.is_empty() {
            let mut section = format!(
                "PREDICTION ({} of {}):",
                prediction.prediction_type, prediction.target_column
            );
            for point in &prediction.points {
                section.push_str(&format!("\n{}: {:.2}", point.label, point.value));
                if let (Some(lower), Some(upper)) = (point.lower, point.upper) {
                    section.push_str(&format!(" [{lower:.2}, {upper:.2}]"));
                }
            }
            sections.push(section);
        }
    }

    sections.join("\n\n")
}

/// Numbered citations in selection order.
pub fn format_sources(selected: &SelectedEvidence) -> Vec<SourceReference> {
    selected
        .iter()
        .enumerate()
        .map(|(i, item)| SourceReference {
            number: i + 1,
            document_id: item.candidate.source_document_id.clone(),
            chunk_id: item.candidate.id.clone(),
            preview: truncate_chars(&item.candidate.content, PREVIEW_CHARS),
            similarity: (item.candidate.similarity * 1000.0).round() / 1000.0,
            relevance_score: item.relevance_score,
            metadata: item.candidate.metadata.clone(),
        })
        .collect()
}

/// Rough token count of the evidence: content plus per-chunk framing overhead.
pub fn estimate_tokens(selected: &SelectedEvidence) -> usize {
    let chars: usize = selected
        .iter()
        .map(|s| s.candidate.content.chars().count())
        .sum();
    (chars + TOKENS_OVERHEAD_PER_CHUNK * selected.len()) / CHARS_PER_TOKEN
}

#[cfg(test)]
mod tests {
    use super::*;
    use kbquery_core::types::{
        Branch, BranchReport, BranchStatus, Candidate, Diagnostics, ExecutionPlan,
        PredictionPoint, PredictionResult, ScoredCandidate, StructuredResult,
    };
    use uuid::Uuid;

    fn item(id: &str, content: &str, relevance: f32, filename: Option<&str>) -> ScoredCandidate {
        let mut metadata = Metadata::new();
        if let Some(name) = filename {
            metadata.insert("filename".into(), serde_json::json!(name));
        }
        ScoredCandidate::new(
            Candidate {
                id: id.into(),
                source_document_id: format!("doc-{id}"),
                content: content.into(),
                similarity: 0.123456,
                origin_variant: "q".into(),
                retrieved_by: vec!["q".into()],
                metadata,
                embedding: None,
            },
            relevance,
        )
    }

    fn bundle(items: Vec<ScoredCandidate>) -> EvidenceBundle {
        EvidenceBundle {
            query_id: Uuid::nil(),
            selected_evidence: SelectedEvidence::new(items),
            structured_result: None,
            prediction_result: None,
            diagnostics: Diagnostics::new(ExecutionPlan::VectorOnly),
        }
    }

    #[test]
    fn test_render_sources_with_headers() {
        let text = render_context(
            &bundle(vec![
                item("a", "Revenue grew 12%.", 0.876, Some("q3-report.pdf")),
                item("b", "Costs were flat.", 0.5, None),
            ]),
            &ContextOptions::default(),
        );
        assert!(text.starts_with("RELEVANT DOCUMENT EXCERPTS:"));
        assert!(text.contains("[Source 1] (Relevance: 0.88)\nFrom: q3-report.pdf\nRevenue grew 12%."));
        assert!(text.contains("[Source 2] (Relevance: 0.50)\nCosts were flat."));
    }

    #[test]
    fn test_render_truncates_long_content() {
        let long = "x".repeat(600);
        let text = render_context(&bundle(vec![item("a", &long, 1.0, None)]), &ContextOptions::default());
        assert!(text.contains(&format!("{}...", "x".repeat(500))));
        assert!(!text.contains(&"x".repeat(501)));
    }

    #[test]
    fn test_render_distinguishes_empty_and_failed() {
        let mut empty = bundle(Vec::new());
        empty.diagnostics.branches.push(BranchReport {
            branch: Branch::Vector,
            status: BranchStatus::Empty,
        });
        assert_eq!(render_context(&empty, &ContextOptions::default()), NO_EVIDENCE_MESSAGE);

        let mut failed = bundle(Vec::new());
        failed.diagnostics.branches.push(BranchReport {
            branch: Branch::Vector,
            status: BranchStatus::Failed {
                error: "vector_store unavailable".into(),
            },
        });
        assert_eq!(render_context(&failed, &ContextOptions::default()), RETRIEVAL_FAILED_MESSAGE);
    }

    #[test]
    fn test_render_structured_and_prediction() {
        let mut b = bundle(vec![item("a", "text", 0.9, None)]);
        let rows = (0..3)
            .map(|i| {
                Metadata::from([
                    ("quarter".to_string(), serde_json::json!(format!("Q{}", i + 1))),
                    ("revenue".to_string(), serde_json::json!(100 + i * 10)),
                ])
            })
            .collect();
        b.structured_result = Some(StructuredResult::from_rows(
            "SELECT quarter, revenue FROM sales",
            vec!["quarter".into(), "revenue".into()],
            rows,
        ));
        b.prediction_result = Some(PredictionResult {
            prediction_type: "forecast".into(),
            target_column: "revenue".into(),
            points: vec![PredictionPoint {
                label: "Q4".into(),
                value: 131.5,
                lower: Some(120.0),
                upper: Some(140.0),
            }],
            model_diagnostics: Metadata::new(),
            execution_error: None,
        });

        let options = ContextOptions {
            max_rows: 2,
            ..Default::default()
        };
        let text = render_context(&b, &options);
        assert!(text.contains("STRUCTURED DATA QUERY RESULTS:\nQuery: SELECT quarter, revenue FROM sales\nRows: 3"));
        assert!(text.contains("quarter | revenue\nQ1 | 100\nQ2 | 110\n(... 1 more rows)"));
        assert!(text.contains("PREDICTION (forecast of revenue):\nQ4: 131.50 [120.00, 140.00]"));
    }

    #[test]
    fn test_format_sources() {
        let long = "y".repeat(250);
        let sources = format_sources(&SelectedEvidence::new(vec![
            item("a", "short", 0.9, Some("a.pdf")),
            item("b", &long, 0.4, None),
        ]));
        assert_eq!(sources.len(), 2);
        assert_eq!(sources[0].number, 1);
        assert_eq!(sources[0].chunk_id, "a");
        assert_eq!(sources[0].document_id, "doc-a");
        assert_eq!(sources[0].preview, "short");
        assert!((sources[0].similarity - 0.123).abs() < 1e-6);
        assert_eq!(sources[1].preview.chars().count(), 203);
    }

    #[test]
    fn test_estimate_tokens() {
        let selected = SelectedEvidence::new(vec![
            item("a", &"z".repeat(300), 0.9, None),
            item("b", &"z".repeat(100), 0.8, None),
        ]);
        assert_eq!(estimate_tokens(&selected), (400 + 200) / 4);
        assert_eq!(estimate_tokens(&SelectedEvidence::default()), 0);
    }
}

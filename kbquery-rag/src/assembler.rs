//! Packages branch results into the final evidence bundle.

use kbquery_core::types::{
    Diagnostics, EvidenceBundle, PipelineStage, PredictionResult, SelectedEvidence,
    StructuredResult,
};
use uuid::Uuid;

/// Merges vector evidence, structured rows and predictions side by side.
///
/// Neither source displaces the other. Branch execution errors become
/// diagnostic notes, never pipeline failures.
pub struct EvidenceAssembler {
    query_id: Uuid,
    diagnostics: Diagnostics,
}

impl EvidenceAssembler {
    pub fn new(query_id: Uuid, diagnostics: Diagnostics) -> Self {
        Self {
            query_id,
            diagnostics,
        }
    }

    pub fn assemble(
        self,
        selected_evidence: SelectedEvidence,
        structured_result: Option<StructuredResult>,
        prediction_result: Option<PredictionResult>,
    ) -> EvidenceBundle {
        let mut diagnostics = self.diagnostics;

        if let Some(error) = structured_result
            .as_ref()
            .and_then(|r| r.execution_error.as_deref())
        {
            diagnostics
                .notes
                .push(format!("structured query failed: {error}"));
        }
        if let Some(error) = prediction_result
            .as_ref()
            .and_then(|r| r.execution_error.as_deref())
        {
            diagnostics.notes.push(format!("prediction failed: {error}"));
        }

        diagnostics.counts.selected = selected_evidence.len();
        diagnostics.trace.push(PipelineStage::Assembled);

        EvidenceBundle {
            query_id: self.query_id,
            selected_evidence,
            structured_result,
            prediction_result,
            diagnostics,
        }
    }
}

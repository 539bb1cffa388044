//! Subcommand handlers.

use std::path::Path;
use std::sync::Arc;

use kbquery_core::PipelineConfig;
use kbquery_core::providers::{InMemoryVectorStore, LexicalRelevanceScorer, LocalEmbedder};
use kbquery_core::types::{EvidenceBundle, Query};
use kbquery_rag::{ContextOptions, PipelineOrchestrator, estimate_tokens, format_sources, render_context};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::Commands;
use crate::ConfigAction;
use crate::corpus::Corpus;

/// Embedding width used for corpus files indexed on the fly.
const CORPUS_EMBEDDING_DIMENSIONS: usize = 256;

pub async fn handle_command(command: Commands, workspace: &Path) -> anyhow::Result<()> {
    match command {
        Commands::Ask {
            corpus,
            collection,
            budget,
            lambda,
            json,
            question,
        } => {
            let overrides = AskOverrides { budget, lambda };
            handle_ask(workspace, &corpus, &collection, &question, overrides, json).await
        }
        Commands::Config { action } => handle_config(action, workspace),
    }
}

/// Per-invocation settings layered over the loaded configuration.
#[derive(Debug, Default, Clone, Copy)]
pub struct AskOverrides {
    pub budget: Option<usize>,
    pub lambda: Option<f32>,
}

impl AskOverrides {
    pub fn apply(&self, config: &mut PipelineConfig) {
        if let Some(budget) = self.budget {
            config.diversity.evidence_budget = budget;
        }
        if let Some(lambda) = self.lambda {
            config.diversity.lambda = lambda;
        }
    }
}

#[derive(Serialize)]
struct JsonAnswer<'a> {
    bundle: &'a EvidenceBundle,
    context: String,
    sources: Vec<kbquery_rag::SourceReference>,
    estimated_tokens: usize,
}

async fn handle_ask(
    workspace: &Path,
    corpus_path: &Path,
    collection: &str,
    question: &str,
    overrides: AskOverrides,
    json: bool,
) -> anyhow::Result<()> {
    let mut config = kbquery_core::load_config(Some(workspace), None)
        .map_err(|e| anyhow::anyhow!("Configuration error: {}", e))?;
    overrides.apply(&mut config);

    let corpus = Corpus::load(corpus_path)?;
    if corpus.collection(collection).is_none() {
        warn!(collection, "Collection not present in corpus file");
    }

    let embedder = LocalEmbedder::new(CORPUS_EMBEDDING_DIMENSIONS);
    let store = Arc::new(InMemoryVectorStore::new());
    let indexed = corpus.index_into(&store, &embedder)?;
    info!(chunks = indexed, corpus = %corpus_path.display(), "Corpus indexed");

    let orchestrator = PipelineOrchestrator::new(config, Arc::new(embedder), store.clone())
        .map_err(|e| anyhow::anyhow!("Configuration error: {}", e))?
        .with_relevance_scorer(Arc::new(LexicalRelevanceScorer::new()))
        .with_catalog(store);

    let cancel = CancellationToken::new();
    let ctrl_c_token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            ctrl_c_token.cancel();
        }
    });

    let query = Query::new(question, collection);
    let bundle = orchestrator.answer_query_with_cancel(&query, &cancel).await?;

    let context = render_context(&bundle, &ContextOptions::default());
    let sources = format_sources(&bundle.selected_evidence);
    let estimated_tokens = estimate_tokens(&bundle.selected_evidence);

    if json {
        let answer = JsonAnswer {
            bundle: &bundle,
            context,
            sources,
            estimated_tokens,
        };
        println!("{}", serde_json::to_string_pretty(&answer)?);
        return Ok(());
    }

    println!("{context}");
    if !sources.is_empty() {
        println!();
        println!("Sources:");
        for source in &sources {
            println!(
                "  [{}] {} / {} (similarity {:.3}, relevance {:.2})",
                source.number,
                source.document_id,
                source.chunk_id,
                source.similarity,
                source.relevance_score
            );
        }
    }
    for note in &bundle.diagnostics.notes {
        eprintln!("note: {note}");
    }
    eprintln!(
        "~{} context tokens, {} ms",
        estimated_tokens, bundle.diagnostics.timings.total_ms
    );
    Ok(())
}

fn handle_config(action: ConfigAction, workspace: &Path) -> anyhow::Result<()> {
    match action {
        ConfigAction::Show => {
            let config = kbquery_core::load_config(Some(workspace), None)
                .map_err(|e| anyhow::anyhow!("Failed to load config: {}", e))?;
            let toml_str = toml::to_string_pretty(&config)?;
            println!("{}", toml_str);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overrides_apply_only_given_values() {
        let mut config = PipelineConfig::default();
        AskOverrides {
            budget: Some(3),
            lambda: None,
        }
        .apply(&mut config);
        assert_eq!(config.diversity.evidence_budget, 3);
        assert!((config.diversity.lambda - 0.7).abs() < f32::EPSILON);

        AskOverrides {
            budget: None,
            lambda: Some(0.4),
        }
        .apply(&mut config);
        assert_eq!(config.diversity.evidence_budget, 3);
        assert!((config.diversity.lambda - 0.4).abs() < f32::EPSILON);
    }

    #[tokio::test]
    async fn test_ask_over_temp_corpus() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("corpus.json");
        std::fs::write(
            &path,
            r#"{"collections": [{"id": "kb", "chunks": [
                {"id": "a", "document_id": "d1", "content": "quarterly revenue rose in the north region"},
                {"id": "b", "document_id": "d2", "content": "the office moved to a new building"}
            ]}]}"#,
        )
        .unwrap();

        let result = handle_ask(
            dir.path(),
            &path,
            "kb",
            "how did revenue change",
            AskOverrides {
                budget: Some(1),
                lambda: None,
            },
            true,
        )
        .await;
        assert!(result.is_ok());
    }
}

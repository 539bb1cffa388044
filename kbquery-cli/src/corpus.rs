//! JSON corpus files indexed into the in-memory vector store.

use anyhow::Context;
use kbquery_core::providers::LocalEmbedder;
use kbquery_core::providers::local::{InMemoryVectorStore, StoredItem};
use kbquery_core::types::Metadata;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, warn};

/// A corpus file: one or more collections of pre-chunked documents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Corpus {
    pub collections: Vec<CorpusCollection>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorpusCollection {
    pub id: String,
    #[serde(default)]
    pub chunks: Vec<CorpusChunk>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorpusChunk {
    pub id: String,
    pub document_id: String,
    pub content: String,
    #[serde(default)]
    pub metadata: Metadata,
}

impl Corpus {
    /// Read and parse a corpus file.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read corpus file {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse corpus file {}", path.display()))
    }

    pub fn collection(&self, id: &str) -> Option<&CorpusCollection> {
        self.collections.iter().find(|c| c.id == id)
    }

    /// Embed every chunk and insert it into `store`. Returns the number of
    /// chunks indexed; chunks with blank content are skipped.
    pub fn index_into(
        &self,
        store: &InMemoryVectorStore,
        embedder: &LocalEmbedder,
    ) -> anyhow::Result<usize> {
        let mut indexed = 0;
        for collection in &self.collections {
            for chunk in &collection.chunks {
                if chunk.content.trim().is_empty() {
                    warn!(collection = %collection.id, chunk = %chunk.id, "Skipping empty chunk");
                    continue;
                }
                store.insert(
                    &collection.id,
                    StoredItem {
                        id: chunk.id.clone(),
                        document_id: chunk.document_id.clone(),
                        content: chunk.content.clone(),
                        metadata: chunk.metadata.clone(),
                        vector: embedder.embed_sync(&chunk.content),
                    },
                )?;
                indexed += 1;
            }
            debug!(
                collection = %collection.id,
                chunks = store.len(&collection.id),
                "Indexed collection"
            );
        }
        Ok(indexed)
    }
}

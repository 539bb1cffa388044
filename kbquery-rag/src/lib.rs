//! # kbquery-rag
//!
//! The retrieval-and-ranking core: query expansion, multi-query retrieval,
//! pairwise reranking, MMR diversity selection, evidence assembly and the
//! orchestrator that drives one query through all of them.

pub mod assembler;
pub mod context;
pub mod diversity;
pub mod expander;
pub mod pipeline;
pub mod reranker;
pub mod retriever;

pub use assembler::EvidenceAssembler;
pub use context::{ContextOptions, SourceReference, estimate_tokens, format_sources, render_context};
pub use diversity::{DiversitySelector, content_similarity};
pub use expander::{Expansion, QueryExpander};
pub use pipeline::PipelineOrchestrator;
pub use reranker::{RerankOutput, Reranker};
pub use retriever::{RetrievalOutput, Retriever};

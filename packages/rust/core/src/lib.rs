//! Corridor intelligence pipeline: keeps a migration corridor's checklist
//! fresh, internally consistent, and well-sourced.
//!
//! - [`pipeline`] — the orchestrator (research → ingest → synthesize →
//!   order → attribute → persist) and its freshness state transitions
//! - [`ingest`] / [`retrieval`] — content store semantics over
//!   `waymark-storage`, with corridor-first vector search
//! - [`graph`] — cycle-tolerant dependency ordering of synthesized steps
//! - [`attribution`] — citation validation, scoring, and merging
//! - [`gateway`] — quota-gated, TTL-cached upstream call wrapper
//! - [`maintenance`] — expiry and stale-corridor sweeps
//!
//! Provider seams live in [`provider`]; HTTP implementations are in the
//! `waymark-providers` crate.

pub mod attribution;
pub mod chunk;
pub mod freshness;
pub mod gateway;
pub mod graph;
pub mod ingest;
pub mod maintenance;
pub mod pipeline;
pub mod provider;
pub mod retrieval;

#[cfg(test)]
pub(crate) mod testing;

pub use gateway::{CacheState, Gated, QuotaGate};
pub use graph::DependencyGraph;
pub use ingest::{IngestOutcome, backfill_embeddings, ingest_document};
pub use maintenance::{CleanupReport, SweepOutcome, cleanup_expired, refresh_stale_corridors};
pub use pipeline::{
    Pipeline, PipelineStatus, RefreshReport, RunOptions, RunOutcome, pipeline_status,
};
pub use provider::{
    EmbeddingProvider, ResearchOutcome, ResearchProvider, SynthesisProvider,
};
pub use retrieval::{
    RagContext, RagSource, SearchHit, SearchResponse, build_rag_context, format_sources,
    search_content, similar_content,
};

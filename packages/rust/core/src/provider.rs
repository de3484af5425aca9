//! Provider seams for the black-box collaborators.
//!
//! The orchestrator only knows these contracts; HTTP implementations live
//! in `waymark-providers`, tests supply stubs. Handles are constructed
//! once and passed in explicitly — no hidden singletons.

use waymark_shared::{CandidateStep, Corridor, Result, SourceDocument};

/// Outcome of a research pass for one corridor.
///
/// Individual sources may fail without failing the whole call; their
/// errors accumulate here alongside whatever was collected.
#[derive(Debug, Default)]
pub struct ResearchOutcome {
    pub documents: Vec<SourceDocument>,
    /// Which underlying tools contributed (e.g., "web_search", "scrape").
    pub tools_used: Vec<String>,
    pub errors: Vec<String>,
}

/// Collects raw source documents for a corridor.
#[allow(async_fn_in_trait)]
pub trait ResearchProvider {
    async fn research(
        &self,
        corridor: &Corridor,
        focus_areas: &[String],
    ) -> Result<ResearchOutcome>;
}

/// Turns accumulated research text into candidate checklist items.
#[allow(async_fn_in_trait)]
pub trait SynthesisProvider {
    async fn synthesize(
        &self,
        corridor: &Corridor,
        research_text: &str,
        language: &str,
    ) -> Result<Vec<CandidateStep>>;
}

/// Produces fixed-dimension vectors for stored documents and for queries.
/// The two modes matter to providers that distinguish them.
#[allow(async_fn_in_trait)]
pub trait EmbeddingProvider {
    async fn embed_documents(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
    async fn embed_query(&self, text: &str) -> Result<Vec<f32>>;
}

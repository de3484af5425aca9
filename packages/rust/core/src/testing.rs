//! Shared stubs and fixtures for core tests.

use uuid::Uuid;
use waymark_shared::{
    CandidateStep, ChunkId, ChunkMetadata, ContentChunk, Corridor, CorridorId, Result,
    SourceDocument, SourceKind, WaymarkError,
};
use waymark_storage::Storage;

use crate::provider::{EmbeddingProvider, ResearchOutcome, ResearchProvider, SynthesisProvider};

/// Create a temp file storage for testing.
pub(crate) async fn test_storage() -> Storage {
    let tmp = std::env::temp_dir().join(format!("waymark_test_{}.db", Uuid::now_v7()));
    Storage::open(&tmp).await.expect("open test db")
}

/// Deterministic keyword-feature embedding: similar topics score close,
/// unrelated ones do not. Good enough to drive retrieval through real
/// cosine math without a provider.
pub(crate) fn toy_embedding(text: &str) -> Vec<f32> {
    const KEYWORDS: [&str; 7] = [
        "visa",
        "bank",
        "housing",
        "registration",
        "insurance",
        "german",
        "canad",
    ];
    let lower = text.to_lowercase();
    let mut vector: Vec<f32> = KEYWORDS
        .iter()
        .map(|k| if lower.contains(k) { 1.0 } else { 0.0 })
        .collect();
    vector.push(1.0); // bias term so no vector is all-zero
    vector
}

/// Embedding provider backed by [`toy_embedding`].
#[derive(Clone)]
pub(crate) struct ToyEmbedding;

impl EmbeddingProvider for ToyEmbedding {
    async fn embed_documents(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| toy_embedding(t)).collect())
    }

    async fn embed_query(&self, text: &str) -> Result<Vec<f32>> {
        Ok(toy_embedding(text))
    }
}

/// Embedding provider that always fails.
#[derive(Clone)]
pub(crate) struct FailingEmbedding;

impl EmbeddingProvider for FailingEmbedding {
    async fn embed_documents(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Err(WaymarkError::Provider("embedding service down".into()))
    }

    async fn embed_query(&self, _text: &str) -> Result<Vec<f32>> {
        Err(WaymarkError::Provider("embedding service down".into()))
    }
}

/// Research provider returning a fixed document set, or failing outright.
#[derive(Clone, Default)]
pub(crate) struct StubResearch {
    pub documents: Vec<SourceDocument>,
    pub errors: Vec<String>,
    pub fail: bool,
}

impl ResearchProvider for StubResearch {
    async fn research(
        &self,
        _corridor: &Corridor,
        _focus_areas: &[String],
    ) -> Result<ResearchOutcome> {
        if self.fail {
            return Err(WaymarkError::Network("search provider unreachable".into()));
        }
        Ok(ResearchOutcome {
            documents: self.documents.clone(),
            tools_used: vec!["web_search".into(), "scrape".into()],
            errors: self.errors.clone(),
        })
    }
}

/// Synthesis provider returning fixed candidates, or failing outright.
#[derive(Clone, Default)]
pub(crate) struct StubSynthesis {
    pub candidates: Vec<CandidateStep>,
    pub fail: bool,
}

impl SynthesisProvider for StubSynthesis {
    async fn synthesize(
        &self,
        _corridor: &Corridor,
        _research_text: &str,
        _language: &str,
    ) -> Result<Vec<CandidateStep>> {
        if self.fail {
            return Err(WaymarkError::Provider("synthesis model overloaded".into()));
        }
        Ok(self.candidates.clone())
    }
}

/// Build a blog document with enough body to survive chunking.
pub(crate) fn sample_document(url: &str, text: &str) -> SourceDocument {
    SourceDocument {
        url: url.into(),
        title: "Relocation guide".into(),
        text: text.into(),
        source: SourceKind::Blog,
        metadata: ChunkMetadata::default(),
    }
}

/// Insert a chunk embedded with [`toy_embedding`]; returns its id.
pub(crate) async fn insert_chunk_with_embedding(
    storage: &Storage,
    corridor_id: CorridorId,
    url: &str,
    body: &str,
) -> ChunkId {
    use chrono::{Duration, Utc};

    let now = Utc::now();
    let chunk = ContentChunk {
        id: ChunkId::new(),
        corridor_id,
        url: url.into(),
        title: "stored chunk".into(),
        body: body.into(),
        source: SourceKind::Forum,
        embedding: Some(toy_embedding(body)),
        metadata: ChunkMetadata::default(),
        scraped_at: now,
        expires_at: now + Duration::days(30),
    };
    storage.insert_chunk(&chunk).await.expect("insert chunk");
    chunk.id
}

/// A minimal candidate step.
pub(crate) fn candidate(title: &str, depends_on: &[&str]) -> CandidateStep {
    CandidateStep {
        title: title.into(),
        category: "legal".into(),
        description: format!("How to: {title}"),
        priority: "medium".into(),
        depends_on: depends_on.iter().map(|s| s.to_string()).collect(),
        warnings: vec![],
        tips: vec![],
        attribution: None,
    }
}

//! Vector retrieval over ingested content.
//!
//! Queries are corridor-first: the query is embedded and matched against
//! the corridor's chunks; when too few come back, a second unrestricted
//! pass appends cross-corridor results — and the response says so, because
//! general knowledge must never silently masquerade as corridor-specific
//! advice.

use tracing::{debug, instrument};
use waymark_shared::{ChunkId, ContentChunk, CorridorId, Result, WaymarkError};
use waymark_storage::Storage;

use crate::provider::EmbeddingProvider;

/// One retrieved chunk with its similarity score.
#[derive(Debug, Clone)]
pub struct SearchHit {
    pub chunk: ContentChunk,
    pub score: f32,
    /// Whether this hit came from the requested corridor's own content.
    pub corridor_specific: bool,
}

/// A ranked retrieval response.
#[derive(Debug)]
pub struct SearchResponse {
    pub hits: Vec<SearchHit>,
    /// True only when every hit came from the requested corridor.
    pub corridor_specific: bool,
}

/// Cosine similarity between two vectors; 0.0 for mismatched or empty
/// dimensions.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0_f32;
    let mut norm_a = 0.0_f32;
    let mut norm_b = 0.0_f32;
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

/// Search stored content for `query`, optionally scoped to a corridor.
///
/// With a corridor scope and fewer than `min_results` scoped hits, a
/// global pass fills the remainder and the response is tagged as not
/// corridor-specific.
#[instrument(skip_all, fields(corridor = ?corridor_id, limit))]
pub async fn search_content<E: EmbeddingProvider>(
    storage: &Storage,
    embedder: &E,
    query: &str,
    corridor_id: Option<CorridorId>,
    limit: usize,
    min_results: usize,
) -> Result<SearchResponse> {
    let query_embedding = embedder.embed_query(query).await?;

    let (mut hits, mut all_corridor_specific) = match corridor_id {
        Some(id) => {
            let scoped = storage.content_by_corridor(id).await?;
            let hits = nearest(scoped, &query_embedding, limit, None)
                .into_iter()
                .map(|(chunk, score)| SearchHit {
                    chunk,
                    score,
                    corridor_specific: true,
                })
                .collect::<Vec<_>>();
            (hits, true)
        }
        None => (Vec::new(), false),
    };

    let needs_fallback = match corridor_id {
        Some(_) => hits.len() < min_results,
        None => true,
    };

    if needs_fallback {
        if corridor_id.is_some() {
            debug!(
                scoped = hits.len(),
                min_results, "falling back to global search"
            );
            all_corridor_specific = false;
        }
        let global = storage.all_content().await?;
        let seen: Vec<ChunkId> = hits.iter().map(|h| h.chunk.id).collect();
        for (chunk, score) in nearest(global, &query_embedding, limit, None) {
            if hits.len() >= limit {
                break;
            }
            if seen.contains(&chunk.id) {
                continue;
            }
            hits.push(SearchHit {
                chunk,
                score,
                corridor_specific: false,
            });
        }
    }

    Ok(SearchResponse {
        corridor_specific: corridor_id.is_some() && all_corridor_specific,
        hits,
    })
}

/// Find chunks similar to an existing one, by its stored embedding,
/// within its own corridor and excluding itself.
pub async fn similar_content(
    storage: &Storage,
    chunk_id: ChunkId,
    limit: usize,
) -> Result<Vec<SearchHit>> {
    let target = storage
        .get_chunk(chunk_id)
        .await?
        .ok_or_else(|| WaymarkError::validation(format!("no chunk with id {chunk_id}")))?;
    let Some(embedding) = target.embedding.as_deref() else {
        debug!(chunk = %chunk_id, "chunk has no embedding");
        return Ok(Vec::new());
    };

    let corpus = storage.content_by_corridor(target.corridor_id).await?;
    Ok(nearest(corpus, embedding, limit, Some(chunk_id))
        .into_iter()
        .map(|(chunk, score)| SearchHit {
            chunk,
            score,
            corridor_specific: true,
        })
        .collect())
}

/// Rank chunks by cosine similarity to `query`, best first. Chunks
/// without embeddings are skipped.
fn nearest(
    chunks: Vec<ContentChunk>,
    query: &[f32],
    limit: usize,
    exclude: Option<ChunkId>,
) -> Vec<(ContentChunk, f32)> {
    let mut scored: Vec<(ContentChunk, f32)> = chunks
        .into_iter()
        .filter(|c| exclude != Some(c.id))
        .filter_map(|c| {
            let score = c
                .embedding
                .as_deref()
                .map(|e| cosine_similarity(e, query))?;
            Some((c, score))
        })
        .collect();
    scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    scored.truncate(limit);
    scored
}

// ---------------------------------------------------------------------------
// RAG context assembly
// ---------------------------------------------------------------------------

/// A numbered source reference for a formatted context.
#[derive(Debug, Clone)]
pub struct RagSource {
    pub index: usize,
    pub url: String,
    pub author: Option<String>,
    pub date: Option<String>,
}

/// Retrieved content formatted for LLM consumption plus its source list.
#[derive(Debug)]
pub struct RagContext {
    pub context: String,
    pub sources: Vec<RagSource>,
    pub corridor_specific: bool,
}

/// Format retrieval hits as numbered, provenance-tagged blocks.
pub fn build_rag_context(response: &SearchResponse) -> RagContext {
    let mut blocks = Vec::with_capacity(response.hits.len());
    let mut sources = Vec::with_capacity(response.hits.len());

    for (i, hit) in response.hits.iter().enumerate() {
        let index = i + 1;
        let author = hit
            .chunk
            .metadata
            .author
            .clone()
            .unwrap_or_else(|| "community member".into());
        let date = hit
            .chunk
            .metadata
            .published_at
            .map(|d| d.date_naive().to_string());

        blocks.push(format!(
            "[Source {index}] ({author}, {})\n{}\n---",
            date.as_deref().unwrap_or("unknown date"),
            hit.chunk.body
        ));
        sources.push(RagSource {
            index,
            url: hit.chunk.url.clone(),
            author: hit.chunk.metadata.author.clone(),
            date,
        });
    }

    RagContext {
        context: blocks.join("\n\n"),
        sources,
        corridor_specific: response.corridor_specific,
    }
}

/// Render a sources footer (`[1] url (author, date)` per line).
pub fn format_sources(sources: &[RagSource]) -> String {
    sources
        .iter()
        .map(|s| {
            let annotation = [s.author.as_deref(), s.date.as_deref()]
                .into_iter()
                .flatten()
                .collect::<Vec<_>>()
                .join(", ");
            if annotation.is_empty() {
                format!("[{}] {}", s.index, s.url)
            } else {
                format!("[{}] {} ({annotation})", s.index, s.url)
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{ToyEmbedding, insert_chunk_with_embedding, test_storage};

    #[test]
    fn cosine_basics() {
        assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 0.0]), 0.0);
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
    }

    #[tokio::test]
    async fn ample_corridor_content_stays_corridor_specific() {
        let storage = test_storage().await;
        let corridor = storage.create_corridor("NG", "DE").await.unwrap();
        for i in 0..4 {
            insert_chunk_with_embedding(
                &storage,
                corridor.id,
                &format!("https://example.com/visa-{i}"),
                "German visa processing takes several weeks",
            )
            .await;
        }

        let response = search_content(
            &storage,
            &ToyEmbedding,
            "how long does the visa take",
            Some(corridor.id),
            10,
            3,
        )
        .await
        .expect("search");

        assert!(response.corridor_specific);
        assert_eq!(response.hits.len(), 4);
        assert!(response.hits.iter().all(|h| h.corridor_specific));
    }

    #[tokio::test]
    async fn sparse_corridor_falls_back_and_tags_response() {
        let storage = test_storage().await;
        let sparse = storage.create_corridor("NG", "DE").await.unwrap();
        let rich = storage.create_corridor("IN", "CA").await.unwrap();

        insert_chunk_with_embedding(
            &storage,
            sparse.id,
            "https://example.com/only-one",
            "German visa appointment booking advice",
        )
        .await;
        for i in 0..5 {
            insert_chunk_with_embedding(
                &storage,
                rich.id,
                &format!("https://example.com/ca-{i}"),
                "Canadian visa application experiences",
            )
            .await;
        }

        let response = search_content(
            &storage,
            &ToyEmbedding,
            "visa application",
            Some(sparse.id),
            10,
            3,
        )
        .await
        .expect("search");

        assert!(!response.corridor_specific, "fallback taints the response");
        assert!(response.hits.len() > 1);
        // The corridor's own hit keeps its tag; borrowed ones do not.
        assert!(
            response
                .hits
                .iter()
                .any(|h| h.corridor_specific && h.chunk.url.ends_with("only-one"))
        );
        assert!(response.hits.iter().any(|h| !h.corridor_specific));
        // No chunk appears twice.
        let mut ids: Vec<_> = response.hits.iter().map(|h| h.chunk.id).collect();
        ids.sort_by_key(|id| id.0);
        ids.dedup();
        assert_eq!(ids.len(), response.hits.len());
    }

    #[tokio::test]
    async fn similar_content_excludes_self_and_other_corridors() {
        let storage = test_storage().await;
        let corridor = storage.create_corridor("NG", "DE").await.unwrap();
        let other = storage.create_corridor("IN", "CA").await.unwrap();

        let target = insert_chunk_with_embedding(
            &storage,
            corridor.id,
            "https://example.com/target",
            "Opening a bank account in Germany",
        )
        .await;
        insert_chunk_with_embedding(
            &storage,
            corridor.id,
            "https://example.com/neighbor",
            "German bank account requirements for newcomers",
        )
        .await;
        insert_chunk_with_embedding(
            &storage,
            other.id,
            "https://example.com/foreign",
            "Opening a bank account in Canada",
        )
        .await;

        let similar = similar_content(&storage, target, 5).await.expect("similar");
        assert_eq!(similar.len(), 1);
        assert!(similar[0].chunk.url.ends_with("neighbor"));
    }

    #[tokio::test]
    async fn rag_context_numbers_sources() {
        let storage = test_storage().await;
        let corridor = storage.create_corridor("NG", "DE").await.unwrap();
        insert_chunk_with_embedding(
            &storage,
            corridor.id,
            "https://example.com/a",
            "Registration must happen within fourteen days",
        )
        .await;
        insert_chunk_with_embedding(
            &storage,
            corridor.id,
            "https://example.com/b",
            "Bank accounts require the registration certificate",
        )
        .await;

        let response = search_content(
            &storage,
            &ToyEmbedding,
            "registration",
            Some(corridor.id),
            10,
            1,
        )
        .await
        .unwrap();
        let rag = build_rag_context(&response);

        assert!(rag.context.contains("[Source 1]"));
        assert!(rag.context.contains("[Source 2]"));
        assert_eq!(rag.sources.len(), 2);
        assert_eq!(rag.sources[1].index, 2);

        let footer = format_sources(&rag.sources);
        assert!(footer.lines().count() == 2);
        assert!(footer.starts_with("[1] https://example.com/"));
    }
}

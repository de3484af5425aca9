//! Content ingestion: chunk, embed, persist.
//!
//! Ingestion is idempotent per (corridor, URL): a URL that already has
//! stored chunks is skipped entirely, so concurrent ingestion of the same
//! document is safe to attempt twice. Multi-chunk documents store each
//! chunk under a `#chunk-N` URL suffix with a `(i/n)` title suffix.

use chrono::{Duration, Utc};
use tracing::{debug, warn};
use waymark_shared::{ChunkId, ContentChunk, CorridorId, Result, SourceDocument};
use waymark_storage::Storage;

use crate::chunk::{MAX_CHUNK_CHARS, MIN_CHUNK_CHARS, split_text};
use crate::provider::EmbeddingProvider;

/// What happened to one document offered for ingestion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    /// Stored as this many chunks.
    Stored { chunks: usize },
    /// The URL already has content in this corridor; nothing was written.
    AlreadyExists,
    /// Nothing survived chunking (too short / empty).
    NoUsableContent,
}

/// Ingest one researched document for a corridor.
///
/// Embedding failures do not lose the content: chunks are stored without
/// vectors and picked up later by [`backfill_embeddings`].
pub async fn ingest_document<E: EmbeddingProvider>(
    storage: &Storage,
    embedder: &E,
    corridor_id: CorridorId,
    doc: &SourceDocument,
    retention_days: u32,
) -> Result<IngestOutcome> {
    if storage.has_url(corridor_id, &doc.url).await? {
        debug!(url = %doc.url, "content already ingested, skipping");
        return Ok(IngestOutcome::AlreadyExists);
    }

    let bodies = split_text(&doc.text, MAX_CHUNK_CHARS, MIN_CHUNK_CHARS);
    if bodies.is_empty() {
        debug!(url = %doc.url, "no usable chunks after splitting");
        return Ok(IngestOutcome::NoUsableContent);
    }

    let embeddings = match embedder.embed_documents(&bodies).await {
        Ok(vectors) if vectors.len() == bodies.len() => vectors.into_iter().map(Some).collect(),
        Ok(vectors) => {
            warn!(
                url = %doc.url,
                expected = bodies.len(),
                got = vectors.len(),
                "embedding count mismatch, storing without vectors"
            );
            vec![None; bodies.len()]
        }
        Err(err) => {
            warn!(url = %doc.url, error = %err, "embedding failed, storing without vectors");
            vec![None; bodies.len()]
        }
    };

    let now = Utc::now();
    let expires_at = now + Duration::days(retention_days as i64);
    let total = bodies.len();

    for (i, (body, embedding)) in bodies.into_iter().zip(embeddings).enumerate() {
        let (url, title) = if total > 1 {
            (
                format!("{}#chunk-{i}", doc.url),
                format!("{} ({}/{})", doc.title, i + 1, total),
            )
        } else {
            (doc.url.clone(), doc.title.clone())
        };

        storage
            .insert_chunk(&ContentChunk {
                id: ChunkId::new(),
                corridor_id,
                url,
                title,
                body,
                source: doc.source,
                embedding,
                metadata: doc.metadata.clone(),
                scraped_at: now,
                expires_at,
            })
            .await?;
    }

    debug!(url = %doc.url, chunks = total, "content ingested");
    Ok(IngestOutcome::Stored { chunks: total })
}

/// Embed any chunks stored without vectors. Returns how many were updated;
/// individual failures are logged and skipped.
pub async fn backfill_embeddings<E: EmbeddingProvider>(
    storage: &Storage,
    embedder: &E,
    corridor_id: CorridorId,
) -> Result<usize> {
    let missing = storage.chunks_missing_embedding(corridor_id).await?;
    let mut updated = 0;

    for chunk in missing {
        match embedder.embed_documents(std::slice::from_ref(&chunk.body)).await {
            Ok(vectors) if !vectors.is_empty() => {
                storage.update_embedding(chunk.id, &vectors[0]).await?;
                updated += 1;
            }
            Ok(_) => warn!(chunk = %chunk.id, "embedding provider returned nothing"),
            Err(err) => warn!(chunk = %chunk.id, error = %err, "embedding backfill failed"),
        }
    }
    Ok(updated)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FailingEmbedding, ToyEmbedding, sample_document, test_storage};

    #[tokio::test]
    async fn ingesting_twice_is_a_noop() {
        let storage = test_storage().await;
        let corridor = storage.create_corridor("NG", "DE").await.unwrap();
        let embedder = ToyEmbedding;
        let doc = sample_document(
            "https://example.com/guide",
            "Register your address within two weeks of arrival, then open a bank account.",
        );

        let first = ingest_document(&storage, &embedder, corridor.id, &doc, 30)
            .await
            .expect("first ingest");
        assert_eq!(first, IngestOutcome::Stored { chunks: 1 });

        let second = ingest_document(&storage, &embedder, corridor.id, &doc, 30)
            .await
            .expect("second ingest");
        assert_eq!(second, IngestOutcome::AlreadyExists);

        let stored = storage.content_by_corridor(corridor.id).await.unwrap();
        assert_eq!(stored.len(), 1);
    }

    #[tokio::test]
    async fn multi_chunk_documents_get_suffixed_urls() {
        let storage = test_storage().await;
        let corridor = storage.create_corridor("NG", "DE").await.unwrap();
        let embedder = ToyEmbedding;

        let long_body = "A sentence about German visas and registration rules. ".repeat(80);
        let doc = sample_document("https://example.com/long-guide", &long_body);

        let outcome = ingest_document(&storage, &embedder, corridor.id, &doc, 30)
            .await
            .expect("ingest");
        let IngestOutcome::Stored { chunks } = outcome else {
            panic!("expected stored outcome, got {outcome:?}");
        };
        assert!(chunks > 1);

        let stored = storage.content_by_corridor(corridor.id).await.unwrap();
        assert_eq!(stored.len(), chunks);
        assert!(stored.iter().all(|c| c.url.contains("#chunk-")));
        assert!(stored.iter().all(|c| c.embedding.is_some()));

        // Re-ingesting the suffixed set is still a no-op.
        let again = ingest_document(&storage, &embedder, corridor.id, &doc, 30)
            .await
            .unwrap();
        assert_eq!(again, IngestOutcome::AlreadyExists);
    }

    #[tokio::test]
    async fn tiny_content_is_rejected_as_noise() {
        let storage = test_storage().await;
        let corridor = storage.create_corridor("NG", "DE").await.unwrap();
        let doc = sample_document("https://example.com/stub", "Too short.");

        let outcome = ingest_document(&storage, &ToyEmbedding, corridor.id, &doc, 30)
            .await
            .unwrap();
        assert_eq!(outcome, IngestOutcome::NoUsableContent);
    }

    #[tokio::test]
    async fn embedding_failure_stores_content_for_backfill() {
        let storage = test_storage().await;
        let corridor = storage.create_corridor("NG", "DE").await.unwrap();
        let doc = sample_document(
            "https://example.com/guide",
            "Register your address within two weeks of arrival, then open a bank account.",
        );

        let outcome = ingest_document(&storage, &FailingEmbedding, corridor.id, &doc, 30)
            .await
            .expect("ingest survives embedding failure");
        assert_eq!(outcome, IngestOutcome::Stored { chunks: 1 });

        let stored = storage.content_by_corridor(corridor.id).await.unwrap();
        assert!(stored[0].embedding.is_none());

        let updated = backfill_embeddings(&storage, &ToyEmbedding, corridor.id)
            .await
            .expect("backfill");
        assert_eq!(updated, 1);
        let stored = storage.content_by_corridor(corridor.id).await.unwrap();
        assert!(stored[0].embedding.is_some());
    }
}

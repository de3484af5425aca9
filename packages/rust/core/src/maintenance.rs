//! Scheduled maintenance sweeps.
//!
//! Two jobs: deleting content and cache entries past their retention
//! windows, and pre-emptively refreshing stale corridors in a small,
//! throttled batch. Recurrence is left to an external scheduler (cron);
//! these are plain async functions.

use std::time::Duration;

use chrono::Utc;
use tracing::{info, instrument, warn};
use waymark_shared::{CorridorId, Result};
use waymark_storage::Storage;

use crate::pipeline::Pipeline;
use crate::provider::{EmbeddingProvider, ResearchProvider, SynthesisProvider};

/// Counts from an expiry sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CleanupReport {
    pub content_deleted: u64,
    pub cache_deleted: u64,
}

/// Per-corridor result of a refresh sweep.
#[derive(Debug)]
pub struct SweepOutcome {
    pub corridor_id: CorridorId,
    pub origin: String,
    pub destination: String,
    pub success: bool,
    pub protocol_count: u32,
    pub error: Option<String>,
}

/// Delete ingested content past its retention window and expired cache
/// entries.
#[instrument(skip_all)]
pub async fn cleanup_expired(storage: &Storage) -> Result<CleanupReport> {
    let now = Utc::now();
    let content_deleted = storage.delete_expired_content(now).await?;
    let cache_deleted = storage.delete_expired_cache(now).await?;
    info!(content_deleted, cache_deleted, "expired data swept");
    Ok(CleanupReport {
        content_deleted,
        cache_deleted,
    })
}

/// Refresh stale corridors, oldest research first, a bounded number per
/// sweep with a pause between corridors. The throttle protects upstream
/// providers from burst load; it is not a correctness requirement. A
/// corridor that fails is recorded and skipped, never retried within the
/// same sweep.
#[instrument(skip_all, fields(batch))]
pub async fn refresh_stale_corridors<R, S, E>(
    pipeline: &Pipeline<R, S, E>,
    storage: &Storage,
    batch: u32,
    pause: Duration,
) -> Result<Vec<SweepOutcome>>
where
    R: ResearchProvider,
    S: SynthesisProvider,
    E: EmbeddingProvider,
{
    let threshold_days = pipeline.config().freshness_days;
    let cutoff = Utc::now() - chrono::Duration::days(threshold_days as i64);
    let stale = storage.stale_corridors(cutoff, batch).await?;
    info!(found = stale.len(), "stale corridors to refresh");

    let mut outcomes = Vec::with_capacity(stale.len());
    for (i, corridor) in stale.iter().enumerate() {
        if i > 0 && !pause.is_zero() {
            tokio::time::sleep(pause).await;
        }

        match pipeline.refresh_in_background(storage, corridor.id).await {
            Ok(report) => {
                if !report.success {
                    warn!(
                        corridor = %corridor.id,
                        errors = ?report.errors,
                        "sweep refresh failed"
                    );
                }
                outcomes.push(SweepOutcome {
                    corridor_id: corridor.id,
                    origin: corridor.origin.clone(),
                    destination: corridor.destination.clone(),
                    success: report.success,
                    protocol_count: report.protocol_count,
                    error: if report.errors.is_empty() {
                        None
                    } else {
                        Some(report.errors.join("; "))
                    },
                });
            }
            Err(err) => {
                warn!(corridor = %corridor.id, error = %err, "sweep refresh errored");
                outcomes.push(SweepOutcome {
                    corridor_id: corridor.id,
                    origin: corridor.origin.clone(),
                    destination: corridor.destination.clone(),
                    success: false,
                    protocol_count: 0,
                    error: Some(err.to_string()),
                });
            }
        }
    }

    Ok(outcomes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::RunOptions;
    use crate::testing::{
        StubResearch, StubSynthesis, ToyEmbedding, candidate, sample_document, test_storage,
    };
    use chrono::Duration as ChronoDuration;
    use waymark_shared::{AttributionConfig, PipelineConfig, ResearchStatus};

    fn sweep_pipeline() -> Pipeline<StubResearch, StubSynthesis, ToyEmbedding> {
        Pipeline::new(
            StubResearch {
                documents: vec![sample_document(
                    "https://example.com/general-guide",
                    "Practical registration and banking advice for new arrivals, \
                     gathered from community forums.",
                )],
                ..StubResearch::default()
            },
            StubSynthesis {
                candidates: vec![
                    candidate("Get residence registration", &[]),
                    candidate("Open a bank account", &["Get residence registration"]),
                ],
                fail: false,
            },
            ToyEmbedding,
            PipelineConfig::default(),
            AttributionConfig::default(),
        )
    }

    #[tokio::test]
    async fn cleanup_reports_both_kinds() {
        let storage = test_storage().await;
        let corridor = storage.create_corridor("NG", "DE").await.unwrap();

        // One live chunk, one past retention.
        crate::testing::insert_chunk_with_embedding(
            &storage,
            corridor.id,
            "https://example.com/live",
            "Current visa guidance with plenty of useful detail for arrivals.",
        )
        .await;
        let expired_id = crate::testing::insert_chunk_with_embedding(
            &storage,
            corridor.id,
            "https://example.com/old",
            "Outdated guidance that should be swept away entirely now.",
        )
        .await;
        let mut expired = storage.get_chunk(expired_id).await.unwrap().unwrap();
        expired.id = waymark_shared::ChunkId::new();
        expired.url = "https://example.com/old-expired".into();
        expired.expires_at = Utc::now() - ChronoDuration::days(1);
        storage.insert_chunk(&expired).await.unwrap();

        storage
            .cache_put(
                "svc:expired",
                &serde_json::json!({"x": 1}),
                ChronoDuration::days(-1),
            )
            .await
            .unwrap();

        let report = cleanup_expired(&storage).await.expect("cleanup");
        assert_eq!(report.content_deleted, 1);
        assert_eq!(report.cache_deleted, 1);
    }

    #[tokio::test]
    async fn sweep_refreshes_only_stale_corridors_up_to_batch() {
        let storage = test_storage().await;
        let pipeline = sweep_pipeline();

        let stale_a = storage.create_corridor("NG", "DE").await.unwrap();
        let stale_b = storage.create_corridor("IN", "CA").await.unwrap();
        let fresh = storage.create_corridor("PH", "AU").await.unwrap();
        // Make one corridor genuinely fresh so the sweep skips it.
        pipeline
            .generate(&storage, fresh.id, &RunOptions::default())
            .await
            .unwrap();
        storage.mark_fresh(fresh.id, 2).await.unwrap();

        let outcomes = refresh_stale_corridors(&pipeline, &storage, 10, Duration::ZERO)
            .await
            .expect("sweep");

        let swept: Vec<CorridorId> = outcomes.iter().map(|o| o.corridor_id).collect();
        assert!(swept.contains(&stale_a.id));
        assert!(swept.contains(&stale_b.id));
        assert!(!swept.contains(&fresh.id), "fresh corridor left alone");
        assert!(outcomes.iter().all(|o| o.success));

        for id in [stale_a.id, stale_b.id] {
            let corridor = storage.get_corridor(id).await.unwrap().unwrap();
            assert_eq!(corridor.research_status, ResearchStatus::Fresh);
            assert_eq!(corridor.protocol_count, 2);
        }
    }

    #[tokio::test]
    async fn sweep_batch_is_bounded() {
        let storage = test_storage().await;
        let pipeline = sweep_pipeline();

        for (origin, destination) in [("NG", "DE"), ("IN", "CA"), ("PH", "AU"), ("BR", "PT")] {
            storage.create_corridor(origin, destination).await.unwrap();
        }

        let outcomes = refresh_stale_corridors(&pipeline, &storage, 2, Duration::ZERO)
            .await
            .expect("sweep");
        assert_eq!(outcomes.len(), 2);
    }

    #[tokio::test]
    async fn sweep_records_failures_and_continues() {
        let storage = test_storage().await;
        // Research fails and no content exists: every refresh errors.
        let pipeline = Pipeline::new(
            StubResearch {
                fail: true,
                ..StubResearch::default()
            },
            StubSynthesis::default(),
            ToyEmbedding,
            PipelineConfig::default(),
            AttributionConfig::default(),
        );

        storage.create_corridor("NG", "DE").await.unwrap();
        storage.create_corridor("IN", "CA").await.unwrap();

        let outcomes = refresh_stale_corridors(&pipeline, &storage, 10, Duration::ZERO)
            .await
            .expect("sweep");
        assert_eq!(outcomes.len(), 2);
        assert!(outcomes.iter().all(|o| !o.success));
        assert!(outcomes.iter().all(|o| o.error.is_some()));

        // Failures leave corridors in `error`, eligible for a later sweep.
        let corridors = storage.list_corridors().await.unwrap();
        assert!(
            corridors
                .iter()
                .all(|c| c.research_status == ResearchStatus::Error)
        );
    }
}

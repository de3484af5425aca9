//! Pipeline orchestrator: research → ingest → synthesize → order →
//! attribute → persist.
//!
//! A run is idempotent and degrades instead of aborting wherever it can:
//! research failure falls back to already-ingested content, malformed
//! synthesis items are coerced, broken attributions are dropped. Only a
//! missing corridor or a truly empty corpus is terminal. Non-fatal
//! problems accumulate into the outcome's error list alongside whatever
//! partial success was achieved.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tracing::{info, instrument, warn};
use waymark_shared::{
    Attribution, AttributionConfig, ContentChunk, Corridor, CorridorId, PipelineConfig,
    ProtocolStep, Result, StepId, WaymarkError,
};
use waymark_storage::Storage;

use crate::attribution;
use crate::freshness;
use crate::graph::DependencyGraph;
use crate::ingest::{IngestOutcome, ingest_document};
use crate::provider::{EmbeddingProvider, ResearchProvider, SynthesisProvider};

/// Options for one pipeline run.
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Regenerate even when persisted steps already exist.
    pub force_refresh: bool,
    /// Target language for synthesized text.
    pub language: String,
    /// Optional research focus areas (e.g., "visa", "housing").
    pub focus_areas: Vec<String>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            force_refresh: false,
            language: "en".into(),
            focus_areas: Vec::new(),
        }
    }
}

/// Outcome of a pipeline run. `errors` carries non-fatal problems that
/// were degraded around, even when the run succeeded overall.
#[derive(Debug)]
pub struct RunOutcome {
    pub step_ids: Vec<StepId>,
    /// True when existing steps were returned without running anything.
    pub cached: bool,
    pub sources_used: usize,
    pub content_stored: usize,
    pub errors: Vec<String>,
}

/// Result of a state-machine-wrapped refresh.
#[derive(Debug)]
pub struct RefreshReport {
    pub corridor_id: CorridorId,
    /// False when another refresh held the corridor and this one no-op'd.
    pub started: bool,
    pub success: bool,
    pub protocol_count: u32,
    pub errors: Vec<String>,
}

/// Snapshot of a corridor's pipeline state for status displays.
#[derive(Debug)]
pub struct PipelineStatus {
    pub corridor: Corridor,
    pub step_count: usize,
    pub generated_step_count: usize,
    pub content_count: usize,
    pub last_content_scraped: Option<DateTime<Utc>>,
    pub fresh: bool,
    pub research_age: String,
}

/// The orchestrator. Provider handles are injected at construction and
/// live for the process lifetime.
pub struct Pipeline<R, S, E> {
    research: R,
    synthesis: S,
    embedder: E,
    cfg: PipelineConfig,
    attribution_cfg: AttributionConfig,
}

impl<R, S, E> Pipeline<R, S, E>
where
    R: ResearchProvider,
    S: SynthesisProvider,
    E: EmbeddingProvider,
{
    pub fn new(
        research: R,
        synthesis: S,
        embedder: E,
        cfg: PipelineConfig,
        attribution_cfg: AttributionConfig,
    ) -> Self {
        Self {
            research,
            synthesis,
            embedder,
            cfg,
            attribution_cfg,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.cfg
    }

    /// Generate the checklist for a corridor.
    ///
    /// The cheap path: without `force_refresh`, existing steps return
    /// immediately marked cached. Otherwise research runs (failures fall
    /// back to existing content), then synthesis, ordering, attribution,
    /// and persistence.
    #[instrument(skip_all, fields(corridor = %corridor_id, force = opts.force_refresh))]
    pub async fn generate(
        &self,
        storage: &Storage,
        corridor_id: CorridorId,
        opts: &RunOptions,
    ) -> Result<RunOutcome> {
        let mut errors: Vec<String> = Vec::new();

        let corridor = storage
            .get_corridor(corridor_id)
            .await?
            .ok_or_else(|| WaymarkError::CorridorNotFound(corridor_id.to_string()))?;

        if !opts.force_refresh {
            let existing = storage.steps_by_corridor(corridor_id).await?;
            if !existing.is_empty() {
                info!(steps = existing.len(), "returning existing steps as cached");
                return Ok(RunOutcome {
                    step_ids: existing.iter().map(|s| s.id).collect(),
                    cached: true,
                    sources_used: 0,
                    content_stored: 0,
                    errors,
                });
            }
        }

        info!(
            origin = %corridor.origin,
            destination = %corridor.destination,
            "starting pipeline run"
        );

        let (sources_used, content_stored) = self
            .run_research(storage, &corridor, &opts.focus_areas, &mut errors)
            .await;

        self.synthesize_and_persist(
            storage,
            &corridor,
            &opts.language,
            sources_used,
            content_stored,
            errors,
        )
        .await
    }

    /// Refresh variant: deletes previously machine-generated steps first
    /// so stale items cannot linger beside new ones, then runs a forced
    /// generation. With `refresh_research` false, research is skipped and
    /// synthesis re-runs over existing content (the cheap repair path).
    #[instrument(skip_all, fields(corridor = %corridor_id, refresh_research))]
    pub async fn refresh(
        &self,
        storage: &Storage,
        corridor_id: CorridorId,
        refresh_research: bool,
        language: &str,
    ) -> Result<RunOutcome> {
        let deleted = storage.delete_generated_steps(corridor_id).await?;
        info!(deleted, "cleared previously generated steps");

        if refresh_research {
            storage.delete_expired_content(Utc::now()).await?;
            self.generate(
                storage,
                corridor_id,
                &RunOptions {
                    force_refresh: true,
                    language: language.into(),
                    focus_areas: Vec::new(),
                },
            )
            .await
        } else {
            self.resynthesize(storage, corridor_id, language).await
        }
    }

    /// Re-run synthesis + ordering + attribution over existing content,
    /// without touching research. Previously generated steps are replaced.
    #[instrument(skip_all, fields(corridor = %corridor_id))]
    pub async fn resynthesize(
        &self,
        storage: &Storage,
        corridor_id: CorridorId,
        language: &str,
    ) -> Result<RunOutcome> {
        let corridor = storage
            .get_corridor(corridor_id)
            .await?
            .ok_or_else(|| WaymarkError::CorridorNotFound(corridor_id.to_string()))?;

        storage.delete_generated_steps(corridor_id).await?;
        self.synthesize_and_persist(storage, &corridor, language, 0, 0, Vec::new())
            .await
    }

    /// State-machine-wrapped refresh for background execution. Claims the
    /// corridor (`stale|error|fresh → refreshing`); if another refresh is
    /// in flight this is a no-op. Every other path terminates the
    /// corridor in `fresh` or `error` — never dangling `refreshing`.
    #[instrument(skip_all, fields(corridor = %corridor_id))]
    pub async fn refresh_in_background(
        &self,
        storage: &Storage,
        corridor_id: CorridorId,
    ) -> Result<RefreshReport> {
        // Existence check first: a CAS miss on a missing row would read as
        // "already refreshing".
        storage
            .get_corridor(corridor_id)
            .await?
            .ok_or_else(|| WaymarkError::CorridorNotFound(corridor_id.to_string()))?;

        if !storage.begin_refresh(corridor_id).await? {
            info!("refresh already in flight, skipping");
            return Ok(RefreshReport {
                corridor_id,
                started: false,
                success: false,
                protocol_count: 0,
                errors: Vec::new(),
            });
        }

        let run = async {
            storage.delete_generated_steps(corridor_id).await?;
            self.generate(
                storage,
                corridor_id,
                &RunOptions {
                    force_refresh: true,
                    ..RunOptions::default()
                },
            )
            .await
        }
        .await;

        match run {
            Ok(outcome) if !outcome.step_ids.is_empty() => {
                let count = outcome.step_ids.len() as u32;
                storage.mark_fresh(corridor_id, count).await?;
                info!(protocol_count = count, "corridor refreshed");
                Ok(RefreshReport {
                    corridor_id,
                    started: true,
                    success: true,
                    protocol_count: count,
                    errors: outcome.errors,
                })
            }
            Ok(outcome) => {
                // Zero usable output: that, and only that, records `error`.
                let message = if outcome.errors.is_empty() {
                    "pipeline produced no steps".to_string()
                } else {
                    outcome.errors.join("; ")
                };
                storage.mark_error(corridor_id, &message).await?;
                warn!(error = %message, "refresh produced no steps");
                Ok(RefreshReport {
                    corridor_id,
                    started: true,
                    success: false,
                    protocol_count: 0,
                    errors: outcome.errors,
                })
            }
            Err(err) => {
                storage.mark_error(corridor_id, &err.to_string()).await?;
                warn!(error = %err, "refresh failed");
                Ok(RefreshReport {
                    corridor_id,
                    started: true,
                    success: false,
                    protocol_count: 0,
                    errors: vec![err.to_string()],
                })
            }
        }
    }

    /// Pure status probe; never triggers a transition.
    pub async fn status(
        &self,
        storage: &Storage,
        corridor_id: CorridorId,
    ) -> Result<PipelineStatus> {
        pipeline_status(storage, corridor_id, self.cfg.freshness_days).await
    }

    /// Research + ingest, accumulating errors. Total research failure is
    /// not fatal here; the synthesis stage falls back to stored content.
    async fn run_research(
        &self,
        storage: &Storage,
        corridor: &Corridor,
        focus_areas: &[String],
        errors: &mut Vec<String>,
    ) -> (usize, usize) {
        let mut content_stored = 0;

        match self.research.research(corridor, focus_areas).await {
            Ok(outcome) => {
                errors.extend(outcome.errors.iter().map(|e| format!("research: {e}")));
                for doc in &outcome.documents {
                    match ingest_document(
                        storage,
                        &self.embedder,
                        corridor.id,
                        doc,
                        self.cfg.retention_days,
                    )
                    .await
                    {
                        Ok(IngestOutcome::Stored { chunks }) => content_stored += chunks,
                        Ok(_) => {}
                        Err(err) => {
                            errors.push(format!("ingest {}: {err}", doc.url));
                        }
                    }
                }
                info!(
                    sources = outcome.documents.len(),
                    content_stored, "research complete"
                );
                (outcome.documents.len(), content_stored)
            }
            Err(err) => {
                warn!(error = %err, "research failed, falling back to existing content");
                errors.push(format!("research failed: {err}"));
                (0, 0)
            }
        }
    }

    /// Synthesis → graph ordering → attribution → persistence.
    async fn synthesize_and_persist(
        &self,
        storage: &Storage,
        corridor: &Corridor,
        language: &str,
        sources_used: usize,
        content_stored: usize,
        mut errors: Vec<String>,
    ) -> Result<RunOutcome> {
        let corpus = storage.content_by_corridor(corridor.id).await?;
        if corpus.is_empty() {
            return Err(WaymarkError::NoContent(corridor.id.to_string()));
        }

        let research_text = build_research_text(&corpus, self.cfg.synthesis_char_cap);
        let candidates = match self
            .synthesis
            .synthesize(corridor, &research_text, language)
            .await
        {
            Ok(candidates) => candidates,
            Err(err) => {
                warn!(error = %err, "synthesis failed");
                errors.push(format!("synthesis failed: {err}"));
                return Ok(RunOutcome {
                    step_ids: Vec::new(),
                    cached: false,
                    sources_used,
                    content_stored,
                    errors,
                });
            }
        };

        if candidates.is_empty() {
            errors.push("no steps extracted from synthesis".into());
            return Ok(RunOutcome {
                step_ids: Vec::new(),
                cached: false,
                sources_used,
                content_stored,
                errors,
            });
        }

        info!(candidates = candidates.len(), "ordering synthesized steps");

        // Duplicate titles collapse to one node; collect every citation
        // offered for a title so duplicates can be merged.
        let mut citations: HashMap<&str, Vec<&Attribution>> = HashMap::new();
        for candidate in &candidates {
            if let Some(attr) = &candidate.attribution {
                citations.entry(candidate.title.as_str()).or_default().push(attr);
            }
        }

        let graph = DependencyGraph::build(&candidates);
        let ordered = graph.topological_sort();
        let now = Utc::now();

        let steps: Vec<ProtocolStep> = ordered
            .iter()
            .enumerate()
            .map(|(i, candidate)| {
                let attribution = self.resolve_citation(
                    citations.get(candidate.title.as_str()).map(Vec::as_slice),
                    &corpus,
                    now,
                );
                ProtocolStep::from_candidate(
                    corridor.id,
                    candidate,
                    (i + 1) as u32,
                    attribution,
                    now,
                )
            })
            .collect();

        storage.insert_steps(&steps).await?;
        info!(steps = steps.len(), "steps persisted");

        Ok(RunOutcome {
            step_ids: steps.iter().map(|s| s.id).collect(),
            cached: false,
            sources_used,
            content_stored,
            errors,
        })
    }

    /// Validate/enrich each offered citation, then merge duplicates.
    fn resolve_citation(
        &self,
        offered: Option<&[&Attribution]>,
        corpus: &[ContentChunk],
        now: DateTime<Utc>,
    ) -> Option<Attribution> {
        let offered = offered?;
        let valid: Vec<Attribution> = offered
            .iter()
            .copied()
            .filter_map(|attr| attribution::resolve(Some(attr), corpus))
            .collect();

        match valid.len() {
            0 => None,
            1 => valid.into_iter().next(),
            _ => attribution::merge(
                &valid,
                corpus,
                self.attribution_cfg.surface_max_engagement,
                now,
            ),
        }
    }
}

/// Pure status probe for a corridor; reads only, never transitions.
/// Usable without provider handles (e.g., by status displays).
pub async fn pipeline_status(
    storage: &Storage,
    corridor_id: CorridorId,
    freshness_days: u32,
) -> Result<PipelineStatus> {
    let corridor = storage
        .get_corridor(corridor_id)
        .await?
        .ok_or_else(|| WaymarkError::CorridorNotFound(corridor_id.to_string()))?;
    let steps = storage.steps_by_corridor(corridor_id).await?;
    let content = storage.content_by_corridor(corridor_id).await?;
    let now = Utc::now();

    Ok(PipelineStatus {
        step_count: steps.len(),
        generated_step_count: steps.iter().filter(|s| s.generated).count(),
        content_count: content.len(),
        last_content_scraped: storage.last_scraped_at(corridor_id).await?,
        fresh: freshness::is_fresh(corridor.last_researched_at, freshness_days, now),
        research_age: freshness::research_age(corridor.last_researched_at, now),
        corridor,
    })
}

/// Concatenate stored content for synthesis, with source headers and a
/// hard character cap marked visibly when truncation strikes.
fn build_research_text(corpus: &[ContentChunk], char_cap: usize) -> String {
    let joined = corpus
        .iter()
        .map(|c| format!("[Source: {}]\n{}", c.url, c.body))
        .collect::<Vec<_>>()
        .join("\n\n---\n\n");

    if joined.chars().count() > char_cap {
        let truncated: String = joined.chars().take(char_cap).collect();
        format!("{truncated}\n\n[Content truncated due to length]")
    } else {
        joined
    }
}

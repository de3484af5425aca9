//! Research provider: web search + page scraping.
//!
//! Both upstream services are paid and rate-limited, so every call runs
//! through a [`QuotaGate`]: cached answers serve free, exhausted budgets
//! degrade to stale data, and a dead upstream falls back to whatever was
//! cached before. Individual sources may fail without failing the pass —
//! a scrape that errors degrades to the search snippet.

use std::sync::Arc;

use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use waymark_core::{QuotaGate, ResearchOutcome, ResearchProvider};
use waymark_shared::{
    CacheConfig, ChunkMetadata, Corridor, QuotaConfig, ResearchProviderConfig, Result,
    SourceDocument, SourceKind, WaymarkError, resolve_api_key,
};
use waymark_storage::Storage;

use crate::http_client;

const SEARCH_SERVICE: &str = "search";
const SCRAPE_SERVICE: &str = "scrape";

/// Default focus areas when the caller names none.
const DEFAULT_FOCUS_AREAS: [&str; 5] = [
    "visa requirements",
    "cost of living",
    "housing",
    "banking",
    "community experiences",
];

pub struct ResearchClient {
    client: Client,
    cfg: ResearchProviderConfig,
    search_key: String,
    scrape_key: String,
    search_gate: QuotaGate,
    scrape_gate: QuotaGate,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SearchPayload {
    #[serde(default)]
    results: Vec<SearchResult>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SearchResult {
    #[serde(default)]
    title: String,
    #[serde(default)]
    url: String,
    /// Snippet text; the fallback document body when scraping fails.
    #[serde(default)]
    content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ScrapePayload {
    #[serde(default)]
    markdown: String,
    #[serde(default)]
    title: String,
}

impl ResearchClient {
    /// Construct from config, reading API keys from the environment.
    pub fn new(
        cfg: ResearchProviderConfig,
        quota: &QuotaConfig,
        cache: &CacheConfig,
        storage: Arc<Storage>,
    ) -> Result<Self> {
        let search_key = resolve_api_key(&cfg.search_api_key_env)?;
        let scrape_key = resolve_api_key(&cfg.scrape_api_key_env)?;
        Self::with_keys(cfg, quota, cache, storage, search_key, scrape_key)
    }

    /// Construct with explicit keys (tests point this at mock servers).
    pub fn with_keys(
        cfg: ResearchProviderConfig,
        quota: &QuotaConfig,
        cache: &CacheConfig,
        storage: Arc<Storage>,
        search_key: String,
        scrape_key: String,
    ) -> Result<Self> {
        Ok(Self {
            client: http_client(cfg.timeout_ms)?,
            search_gate: QuotaGate::new(
                storage.clone(),
                SEARCH_SERVICE,
                quota.search_monthly,
                cache.reference_ttl_days,
            ),
            scrape_gate: QuotaGate::new(
                storage,
                SCRAPE_SERVICE,
                quota.scrape_monthly,
                cache.reference_ttl_days,
            ),
            cfg,
            search_key,
            scrape_key,
        })
    }

    async fn search(&self, query: &str) -> Result<waymark_core::Gated<SearchPayload>> {
        let key = self.search_gate.cache_key(&["search", query]);
        self.search_gate
            .call(&key, || async {
                let body = serde_json::json!({
                    "query": query,
                    "max_results": self.cfg.max_results,
                    "search_depth": "basic",
                });
                let response = self
                    .client
                    .post(&self.cfg.search_url)
                    .bearer_auth(&self.search_key)
                    .json(&body)
                    .send()
                    .await
                    .map_err(|e| WaymarkError::Network(format!("search request failed: {e}")))?
                    .error_for_status()
                    .map_err(|e| WaymarkError::Provider(format!("search provider: {e}")))?;
                response
                    .json::<SearchPayload>()
                    .await
                    .map_err(|e| WaymarkError::Provider(format!("search response body: {e}")))
            })
            .await
    }

    async fn scrape(&self, url: &str) -> Result<waymark_core::Gated<ScrapePayload>> {
        let key = self.scrape_gate.cache_key(&["scrape", url]);
        self.scrape_gate
            .call(&key, || async {
                let body = serde_json::json!({ "url": url, "formats": ["markdown"] });
                let response = self
                    .client
                    .post(&self.cfg.scrape_url)
                    .bearer_auth(&self.scrape_key)
                    .json(&body)
                    .send()
                    .await
                    .map_err(|e| WaymarkError::Network(format!("scrape request failed: {e}")))?
                    .error_for_status()
                    .map_err(|e| WaymarkError::Provider(format!("scrape provider: {e}")))?;
                let json: Value = response
                    .json()
                    .await
                    .map_err(|e| WaymarkError::Provider(format!("scrape response body: {e}")))?;
                Ok(parse_scrape_response(&json))
            })
            .await
    }
}

impl ResearchProvider for ResearchClient {
    async fn research(
        &self,
        corridor: &Corridor,
        focus_areas: &[String],
    ) -> Result<ResearchOutcome> {
        let query = build_research_query(corridor, focus_areas);
        tracing::info!(query = %query, "researching corridor");

        let mut outcome = ResearchOutcome::default();

        // A search that cannot even serve stale data fails the whole pass;
        // the orchestrator falls back to already-ingested content.
        let search = self.search(&query).await?;
        outcome.tools_used.push("web_search".into());
        if search.state.is_stale() {
            outcome
                .errors
                .push("web search degraded to stale cached results".into());
        }

        for hit in search
            .value
            .results
            .iter()
            .filter(|r| !r.url.is_empty())
            .take(self.cfg.max_results as usize)
        {
            match self.scrape(&hit.url).await {
                Ok(scraped) if !scraped.value.markdown.trim().is_empty() => {
                    if !outcome.tools_used.iter().any(|t| t == "scrape") {
                        outcome.tools_used.push("scrape".into());
                    }
                    let title = if scraped.value.title.trim().is_empty() {
                        hit.title.clone()
                    } else {
                        scraped.value.title.clone()
                    };
                    outcome.documents.push(SourceDocument {
                        url: hit.url.clone(),
                        title,
                        text: scraped.value.markdown.clone(),
                        source: detect_source_kind(&hit.url),
                        metadata: metadata_for(&hit.url),
                    });
                }
                Ok(_) => {
                    // Scrape succeeded but came back empty; the snippet is
                    // better than nothing.
                    push_snippet_fallback(&mut outcome, hit);
                }
                Err(err) => {
                    tracing::warn!(url = %hit.url, error = %err, "scrape failed");
                    outcome
                        .errors
                        .push(format!("scrape failed for {}: {err}", hit.url));
                    push_snippet_fallback(&mut outcome, hit);
                }
            }
        }

        tracing::info!(
            documents = outcome.documents.len(),
            errors = outcome.errors.len(),
            "research pass complete"
        );
        Ok(outcome)
    }
}

fn push_snippet_fallback(outcome: &mut ResearchOutcome, hit: &SearchResult) {
    if !hit.content.trim().is_empty() {
        outcome.documents.push(SourceDocument {
            url: hit.url.clone(),
            title: hit.title.clone(),
            text: hit.content.clone(),
            source: detect_source_kind(&hit.url),
            metadata: metadata_for(&hit.url),
        });
    }
}

/// Some scrape APIs return `{markdown, metadata}`, others nest under
/// `data`. Accept both.
fn parse_scrape_response(json: &Value) -> ScrapePayload {
    let markdown = json
        .get("markdown")
        .or_else(|| json.pointer("/data/markdown"))
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string();
    let title = json
        .pointer("/metadata/title")
        .or_else(|| json.pointer("/data/metadata/title"))
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string();
    ScrapePayload { markdown, title }
}

/// Build the research query for a corridor.
pub fn build_research_query(corridor: &Corridor, focus_areas: &[String]) -> String {
    let focus = if focus_areas.is_empty() {
        DEFAULT_FOCUS_AREAS.join(", ")
    } else {
        focus_areas.join(", ")
    };
    format!(
        "migrating from {} to {}: {focus}",
        corridor.origin, corridor.destination
    )
}

/// Classify a source by its URL.
pub fn detect_source_kind(url: &str) -> SourceKind {
    let lower = url.to_lowercase();

    if lower.contains("reddit.com") {
        return SourceKind::Reddit;
    }
    if ["nairaland", "internations", "expatica", "forum"]
        .iter()
        .any(|marker| lower.contains(marker))
    {
        return SourceKind::Forum;
    }
    if [".gov", "embassy", "uscis", "immigration", "visa", "consulate"]
        .iter()
        .any(|marker| lower.contains(marker))
    {
        return SourceKind::Government;
    }
    if ["news", "bbc", "cnn", "reuters"]
        .iter()
        .any(|marker| lower.contains(marker))
    {
        return SourceKind::News;
    }
    SourceKind::Blog
}

/// Pull the community name out of a reddit URL, if any.
fn metadata_for(url: &str) -> ChunkMetadata {
    let community = url
        .to_lowercase()
        .contains("reddit.com")
        .then(|| {
            url.split("/r/")
                .nth(1)
                .and_then(|rest| rest.split('/').next())
                .filter(|name| !name.is_empty())
                .map(String::from)
        })
        .flatten();
    ChunkMetadata {
        community,
        ..ChunkMetadata::default()
    }
}

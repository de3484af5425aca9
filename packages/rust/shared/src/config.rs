//! Application configuration for Waymark.
//!
//! User config lives at `~/.waymark/waymark.toml`.
//! CLI flags override config file values, which override defaults.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Result, WaymarkError};

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "waymark.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".waymark";

// ---------------------------------------------------------------------------
// Config structs (matching waymark.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Global defaults.
    #[serde(default)]
    pub defaults: DefaultsConfig,

    /// Upstream provider endpoints and credentials.
    #[serde(default)]
    pub providers: ProvidersConfig,

    /// Monthly call budgets for quota-gated services.
    #[serde(default)]
    pub quota: QuotaConfig,

    /// TTLs for the gateway cache.
    #[serde(default)]
    pub cache: CacheConfig,

    /// Pipeline thresholds and limits.
    #[serde(default)]
    pub pipeline: PipelineConfig,

    /// Attribution selection policy.
    #[serde(default)]
    pub attribution: AttributionConfig,
}

/// `[defaults]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefaultsConfig {
    /// Path to the local database file.
    #[serde(default = "default_db_path")]
    pub db_path: String,

    /// Target language for synthesized checklists.
    #[serde(default = "default_language")]
    pub language: String,
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            language: default_language(),
        }
    }
}

fn default_db_path() -> String {
    "~/.waymark/waymark.db".into()
}
fn default_language() -> String {
    "en".into()
}

/// `[providers]` section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProvidersConfig {
    #[serde(default)]
    pub research: ResearchProviderConfig,
    #[serde(default)]
    pub synthesis: SynthesisProviderConfig,
    #[serde(default)]
    pub embedding: EmbeddingProviderConfig,
}

/// `[providers.research]` section — web search + page scraping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResearchProviderConfig {
    /// Name of the env var holding the search API key (never the key itself).
    #[serde(default = "default_search_api_key_env")]
    pub search_api_key_env: String,

    /// Search endpoint URL.
    #[serde(default = "default_search_url")]
    pub search_url: String,

    /// Name of the env var holding the scrape API key.
    #[serde(default = "default_scrape_api_key_env")]
    pub scrape_api_key_env: String,

    /// Scrape endpoint URL.
    #[serde(default = "default_scrape_url")]
    pub scrape_url: String,

    /// Maximum search results requested per query.
    #[serde(default = "default_max_results")]
    pub max_results: u32,

    /// Per-request timeout in milliseconds.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for ResearchProviderConfig {
    fn default() -> Self {
        Self {
            search_api_key_env: default_search_api_key_env(),
            search_url: default_search_url(),
            scrape_api_key_env: default_scrape_api_key_env(),
            scrape_url: default_scrape_url(),
            max_results: default_max_results(),
            timeout_ms: default_timeout_ms(),
        }
    }
}

fn default_search_api_key_env() -> String {
    "TAVILY_API_KEY".into()
}
fn default_search_url() -> String {
    "https://api.tavily.com/search".into()
}
fn default_scrape_api_key_env() -> String {
    "FIRECRAWL_API_KEY".into()
}
fn default_scrape_url() -> String {
    "https://api.firecrawl.dev/v1/scrape".into()
}
fn default_max_results() -> u32 {
    5
}
fn default_timeout_ms() -> u64 {
    30_000
}

/// `[providers.synthesis]` section — chat-completions style LLM endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SynthesisProviderConfig {
    #[serde(default = "default_synthesis_api_key_env")]
    pub api_key_env: String,

    /// Chat completions endpoint URL.
    #[serde(default = "default_synthesis_url")]
    pub url: String,

    #[serde(default = "default_synthesis_model")]
    pub model: String,

    #[serde(default = "default_synthesis_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for SynthesisProviderConfig {
    fn default() -> Self {
        Self {
            api_key_env: default_synthesis_api_key_env(),
            url: default_synthesis_url(),
            model: default_synthesis_model(),
            timeout_ms: default_synthesis_timeout_ms(),
        }
    }
}

fn default_synthesis_api_key_env() -> String {
    "OPENROUTER_API_KEY".into()
}
fn default_synthesis_url() -> String {
    "https://openrouter.ai/api/v1/chat/completions".into()
}
fn default_synthesis_model() -> String {
    "moonshotai/kimi-k2.5".into()
}
fn default_synthesis_timeout_ms() -> u64 {
    120_000
}

/// `[providers.embedding]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingProviderConfig {
    #[serde(default = "default_embedding_api_key_env")]
    pub api_key_env: String,

    /// Embeddings endpoint URL.
    #[serde(default = "default_embedding_url")]
    pub url: String,

    #[serde(default = "default_embedding_model")]
    pub model: String,

    /// Fixed dimensionality every stored vector must have.
    #[serde(default = "default_embedding_dimensions")]
    pub dimensions: usize,

    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for EmbeddingProviderConfig {
    fn default() -> Self {
        Self {
            api_key_env: default_embedding_api_key_env(),
            url: default_embedding_url(),
            model: default_embedding_model(),
            dimensions: default_embedding_dimensions(),
            timeout_ms: default_timeout_ms(),
        }
    }
}

fn default_embedding_api_key_env() -> String {
    "VOYAGE_API_KEY".into()
}
fn default_embedding_url() -> String {
    "https://api.voyageai.com/v1/embeddings".into()
}
fn default_embedding_model() -> String {
    "voyage-3".into()
}
fn default_embedding_dimensions() -> usize {
    1024
}

/// `[quota]` section — monthly budgets per external service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuotaConfig {
    /// Monthly budget for web search calls.
    #[serde(default = "default_search_quota")]
    pub search_monthly: u32,

    /// Monthly budget for page scrape calls.
    #[serde(default = "default_scrape_quota")]
    pub scrape_monthly: u32,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            search_monthly: default_search_quota(),
            scrape_monthly: default_scrape_quota(),
        }
    }
}

fn default_search_quota() -> u32 {
    50
}
fn default_scrape_quota() -> u32 {
    200
}

/// `[cache]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// TTL for slowly-changing reference data, in days.
    #[serde(default = "default_reference_ttl_days")]
    pub reference_ttl_days: u32,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            reference_ttl_days: default_reference_ttl_days(),
        }
    }
}

fn default_reference_ttl_days() -> u32 {
    7
}

/// `[pipeline]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// A corridor researched longer ago than this is stale.
    #[serde(default = "default_freshness_days")]
    pub freshness_days: u32,

    /// How long ingested content is retained before the sweep deletes it.
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,

    /// Maximum corridors refreshed per sweep run.
    #[serde(default = "default_sweep_batch")]
    pub sweep_batch: u32,

    /// Pause between corridors within a sweep, in seconds.
    #[serde(default = "default_sweep_pause_secs")]
    pub sweep_pause_secs: u64,

    /// Top-K for retrieval queries.
    #[serde(default = "default_retrieval_limit")]
    pub retrieval_limit: usize,

    /// Below this many corridor-scoped hits, retrieval falls back to a
    /// global search.
    #[serde(default = "default_min_results")]
    pub min_results: usize,

    /// Research text handed to synthesis is truncated past this many chars.
    #[serde(default = "default_synthesis_char_cap")]
    pub synthesis_char_cap: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            freshness_days: default_freshness_days(),
            retention_days: default_retention_days(),
            sweep_batch: default_sweep_batch(),
            sweep_pause_secs: default_sweep_pause_secs(),
            retrieval_limit: default_retrieval_limit(),
            min_results: default_min_results(),
            synthesis_char_cap: default_synthesis_char_cap(),
        }
    }
}

fn default_freshness_days() -> u32 {
    30
}
fn default_retention_days() -> u32 {
    30
}
fn default_sweep_batch() -> u32 {
    3
}
fn default_sweep_pause_secs() -> u64 {
    5
}
fn default_retrieval_limit() -> usize {
    10
}
fn default_min_results() -> usize {
    3
}
fn default_synthesis_char_cap() -> usize {
    100_000
}

/// `[attribution]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttributionConfig {
    /// When merging duplicate attributions, surface the maximum engagement
    /// seen across all candidates instead of the winner's own count.
    #[serde(default = "default_surface_max_engagement")]
    pub surface_max_engagement: bool,
}

impl Default for AttributionConfig {
    fn default() -> Self {
        Self {
            surface_max_engagement: default_surface_max_engagement(),
        }
    }
}

fn default_surface_max_engagement() -> bool {
    true
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

/// Directory holding the config file (`~/.waymark`).
pub fn config_dir() -> Result<PathBuf> {
    dirs::home_dir()
        .map(|home| home.join(CONFIG_DIR_NAME))
        .ok_or_else(|| WaymarkError::config("could not determine home directory"))
}

/// Full path to the config file.
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Load config from the default location, falling back to defaults when
/// the file does not exist.
pub fn load_config() -> Result<AppConfig> {
    let path = config_file_path()?;
    if path.exists() {
        load_config_from(&path)
    } else {
        Ok(AppConfig::default())
    }
}

/// Load config from an explicit path.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let raw = std::fs::read_to_string(path).map_err(|e| WaymarkError::io(path, e))?;
    toml::from_str(&raw)
        .map_err(|e| WaymarkError::config(format!("failed to parse {}: {e}", path.display())))
}

/// Write a default config file if none exists yet. Returns the path.
pub fn init_config() -> Result<PathBuf> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir).map_err(|e| WaymarkError::io(&dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    if !path.exists() {
        let rendered = toml::to_string_pretty(&AppConfig::default())
            .map_err(|e| WaymarkError::config(format!("failed to render defaults: {e}")))?;
        std::fs::write(&path, rendered).map_err(|e| WaymarkError::io(&path, e))?;
    }
    Ok(path)
}

/// Read an API key from the environment variable named in config.
pub fn resolve_api_key(env_name: &str) -> Result<String> {
    std::env::var(env_name).map_err(|_| {
        WaymarkError::config(format!("environment variable {env_name} is not set"))
    })
}

/// Expand a leading `~/` against the user's home directory.
pub fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.pipeline.freshness_days, 30);
        assert_eq!(cfg.pipeline.retention_days, 30);
        assert_eq!(cfg.cache.reference_ttl_days, 7);
        assert_eq!(cfg.quota.search_monthly, 50);
        assert_eq!(cfg.providers.embedding.dimensions, 1024);
        assert!(cfg.attribution.surface_max_engagement);
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let cfg: AppConfig = toml::from_str(
            r#"
            [pipeline]
            freshness_days = 7

            [providers.embedding]
            dimensions = 256
            "#,
        )
        .expect("parse partial config");
        assert_eq!(cfg.pipeline.freshness_days, 7);
        assert_eq!(cfg.pipeline.sweep_batch, 3);
        assert_eq!(cfg.providers.embedding.dimensions, 256);
        assert_eq!(cfg.providers.synthesis.timeout_ms, 120_000);
    }

    #[test]
    fn default_config_roundtrips_through_toml() {
        let rendered = toml::to_string_pretty(&AppConfig::default()).expect("render");
        let parsed: AppConfig = toml::from_str(&rendered).expect("reparse");
        assert_eq!(parsed.quota.scrape_monthly, 200);
    }
}

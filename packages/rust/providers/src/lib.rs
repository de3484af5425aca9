//! HTTP clients for the pipeline's black-box collaborators.
//!
//! This crate provides:
//! - [`research`] — web search + page scraping, quota-gated per service
//! - [`synthesis`] — chat-completions synthesis with defensive JSON
//!   extraction
//! - [`embedding`] — batch embeddings with document/query input modes
//!
//! Each client is constructed once from config (API keys come from env
//! vars named in config, never the config file itself) and implements the
//! matching `waymark-core` provider trait.

pub mod embedding;
pub mod research;
pub mod synthesis;

use std::time::Duration;

use reqwest::Client;
use waymark_shared::{Result, WaymarkError};

/// User-Agent string for provider requests.
const USER_AGENT: &str = concat!("Waymark/", env!("CARGO_PKG_VERSION"));

/// Build the shared HTTP client shape: UA, timeout, limited redirects.
pub(crate) fn http_client(timeout_ms: u64) -> Result<Client> {
    Client::builder()
        .user_agent(USER_AGENT)
        .redirect(reqwest::redirect::Policy::limited(5))
        .timeout(Duration::from_millis(timeout_ms))
        .build()
        .map_err(|e| WaymarkError::Network(format!("failed to build HTTP client: {e}")))
}

pub use embedding::EmbeddingClient;
pub use research::{ResearchClient, detect_source_kind};
pub use synthesis::{SynthesisClient, build_synthesis_prompt, parse_candidates};

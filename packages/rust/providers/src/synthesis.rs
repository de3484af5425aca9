//! Synthesis provider client (chat-completions style).
//!
//! The model's reply is untrusted: the JSON payload may arrive wrapped in
//! prose or markdown fencing, individual items may be malformed, and
//! declared dependencies may be circular. Extraction and per-item
//! decoding are defensive; ordering problems are the graph builder's job.

use std::sync::LazyLock;

use regex::Regex;
use reqwest::Client;
use serde_json::Value;
use waymark_core::SynthesisProvider;
use waymark_shared::{
    CandidateStep, Corridor, Result, SynthesisProviderConfig, WaymarkError, resolve_api_key,
};

use crate::http_client;

pub struct SynthesisClient {
    client: Client,
    cfg: SynthesisProviderConfig,
    api_key: String,
}

impl SynthesisClient {
    /// Construct from config, reading the API key from the environment.
    pub fn new(cfg: SynthesisProviderConfig) -> Result<Self> {
        let api_key = resolve_api_key(&cfg.api_key_env)?;
        Self::with_key(cfg, api_key)
    }

    /// Construct with an explicit key (tests point this at a mock server).
    pub fn with_key(cfg: SynthesisProviderConfig, api_key: String) -> Result<Self> {
        Ok(Self {
            client: http_client(cfg.timeout_ms)?,
            cfg,
            api_key,
        })
    }
}

impl SynthesisProvider for SynthesisClient {
    async fn synthesize(
        &self,
        corridor: &Corridor,
        research_text: &str,
        language: &str,
    ) -> Result<Vec<CandidateStep>> {
        let prompt = build_synthesis_prompt(
            &corridor.origin,
            &corridor.destination,
            research_text,
            language,
        );
        let body = serde_json::json!({
            "model": self.cfg.model,
            "messages": [
                { "role": "user", "content": prompt }
            ],
        });

        let response = self
            .client
            .post(&self.cfg.url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| WaymarkError::Network(format!("synthesis request failed: {e}")))?
            .error_for_status()
            .map_err(|e| WaymarkError::Provider(format!("synthesis provider: {e}")))?;

        let json: Value = response
            .json()
            .await
            .map_err(|e| WaymarkError::Provider(format!("synthesis response body: {e}")))?;
        let text = json
            .pointer("/choices/0/message/content")
            .and_then(|v| v.as_str())
            .ok_or_else(|| {
                WaymarkError::Provider("synthesis response missing message content".into())
            })?;

        parse_candidates(text)
    }
}

/// Build the synthesis prompt for a corridor.
pub fn build_synthesis_prompt(
    origin: &str,
    destination: &str,
    research_text: &str,
    language: &str,
) -> String {
    format!(
        r#"You are a migration checklist synthesizer. From the community research below, produce the checklist of steps for migrating from {origin} to {destination}.

Respond with a single JSON object, no prose, in this shape:
{{
  "protocols": [
    {{
      "title": "short imperative step name",
      "category": "visa|finance|housing|employment|legal|health|social",
      "description": "what to do and why, written in {language}",
      "priority": "critical|high|medium|low",
      "depends_on": ["titles of steps that must come first"],
      "warnings": ["pitfalls reported by the community"],
      "tips": ["shortcuts reported by the community"],
      "attribution": {{
        "source_url": "URL the advice came from",
        "author": "who said it, if known",
        "engagement": 123
      }}
    }}
  ]
}}

Rules:
- Only include steps supported by the research text.
- Use exact titles in depends_on and avoid circular dependencies.
- Omit attribution rather than inventing one.

RESEARCH:
{research_text}"#
    )
}

/// Extract and decode candidate steps from a model reply.
///
/// Tries a ```json fence, then any fence, then a bare object containing a
/// "protocols" key. Items that fail to decode are skipped with a warning
/// — one bad item must not reject the batch. Items without a title are
/// useless as dependency keys and are dropped.
pub fn parse_candidates(text: &str) -> Result<Vec<CandidateStep>> {
    let payload = extract_json(text).ok_or_else(|| {
        WaymarkError::parse("no JSON found in synthesis response".to_string())
    })?;

    let parsed: Value = serde_json::from_str(&payload)
        .map_err(|e| WaymarkError::parse(format!("synthesis JSON does not parse: {e}")))?;
    let items = parsed
        .get("protocols")
        .and_then(|v| v.as_array())
        .ok_or_else(|| WaymarkError::parse("response missing protocols array".to_string()))?;

    let mut candidates = Vec::with_capacity(items.len());
    for item in items {
        match serde_json::from_value::<CandidateStep>(item.clone()) {
            Ok(step) if !step.title.trim().is_empty() => candidates.push(step),
            Ok(_) => {
                tracing::warn!("skipping synthesized step without a title");
            }
            Err(err) => {
                tracing::warn!(error = %err, "skipping undecodable synthesized step");
            }
        }
    }
    Ok(candidates)
}

static FENCED_JSON: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)```json\s*(.*?)```").expect("static regex"));
static FENCED_ANY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)```\s*(.*?)```").expect("static regex"));
static BARE_OBJECT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?s)\{.*"protocols".*\}"#).expect("static regex"));

fn extract_json(text: &str) -> Option<String> {
    if let Some(captures) = FENCED_JSON.captures(text) {
        return Some(captures[1].to_string());
    }
    if let Some(captures) = FENCED_ANY.captures(text) {
        return Some(captures[1].to_string());
    }
    BARE_OBJECT.find(text).map(|m| m.as_str().to_string())
}

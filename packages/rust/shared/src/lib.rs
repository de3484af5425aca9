//! Shared types, error model, and configuration for Waymark.
//!
//! This crate is the foundation depended on by all other Waymark crates.
//! It provides:
//! - [`WaymarkError`] — the unified error type
//! - Domain types ([`Corridor`], [`ContentChunk`], [`ProtocolStep`], ids)
//! - Configuration ([`AppConfig`], config loading)

pub mod config;
pub mod error;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    AppConfig, AttributionConfig, CacheConfig, DefaultsConfig, EmbeddingProviderConfig,
    PipelineConfig, ProvidersConfig, QuotaConfig, ResearchProviderConfig,
    SynthesisProviderConfig, config_dir, config_file_path, expand_home, init_config,
    load_config, load_config_from, resolve_api_key,
};
pub use error::{Result, WaymarkError};
pub use types::{
    Attribution, CandidateStep, ChunkId, ChunkMetadata, ContentChunk, Corridor, CorridorId,
    MAX_DESCRIPTION_CHARS, MAX_LIST_ITEMS, MAX_TITLE_CHARS, ProtocolStep, ResearchStatus,
    SourceDocument, SourceKind, StepCategory, StepId, StepPriority, StepStatus, truncate_chars,
};

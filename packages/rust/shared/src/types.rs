//! Core domain types for the corridor intelligence pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use uuid::Uuid;

/// Maximum characters kept from a synthesized step title.
pub const MAX_TITLE_CHARS: usize = 200;
/// Maximum characters kept from a synthesized step description.
pub const MAX_DESCRIPTION_CHARS: usize = 5000;
/// Maximum warnings/tips kept per step.
pub const MAX_LIST_ITEMS: usize = 5;

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

macro_rules! uuid_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            /// Generate a new time-sortable identifier.
            pub fn new() -> Self {
                Self(Uuid::now_v7())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl std::str::FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
                Ok(Self(Uuid::parse_str(s)?))
            }
        }
    };
}

uuid_id!(
    /// Identifier for a migration corridor (origin → destination context).
    CorridorId
);
uuid_id!(
    /// Identifier for an ingested content chunk.
    ChunkId
);
uuid_id!(
    /// Identifier for a persisted protocol step.
    StepId
);

// ---------------------------------------------------------------------------
// Corridor
// ---------------------------------------------------------------------------

/// Research freshness state of a corridor.
///
/// `refreshing` is exclusive: at most one pipeline run may hold it per
/// corridor. `error` is treated as stale for gating purposes but keeps the
/// failure reason for display.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResearchStatus {
    Stale,
    Refreshing,
    Fresh,
    Error,
}

impl ResearchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stale => "stale",
            Self::Refreshing => "refreshing",
            Self::Fresh => "fresh",
            Self::Error => "error",
        }
    }

    pub fn parse(s: &str) -> crate::Result<Self> {
        match s {
            "stale" => Ok(Self::Stale),
            "refreshing" => Ok(Self::Refreshing),
            "fresh" => Ok(Self::Fresh),
            "error" => Ok(Self::Error),
            other => Err(crate::WaymarkError::validation(format!(
                "unknown research status: {other}"
            ))),
        }
    }
}

/// An origin/destination migration pathway context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Corridor {
    pub id: CorridorId,
    /// Origin country code (e.g., "NG").
    pub origin: String,
    /// Destination country code (e.g., "DE").
    pub destination: String,
    pub research_status: ResearchStatus,
    /// When the last successful pipeline run completed. Absent until the
    /// first success; an absent value always reads as stale.
    pub last_researched_at: Option<DateTime<Utc>>,
    /// Number of steps produced by the last successful run.
    pub protocol_count: u32,
    /// Failure reason from the last run, if it ended in `error`.
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Ingested content
// ---------------------------------------------------------------------------

/// Where a piece of researched content came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Reddit,
    Forum,
    Blog,
    Government,
    News,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Reddit => "reddit",
            Self::Forum => "forum",
            Self::Blog => "blog",
            Self::Government => "government",
            Self::News => "news",
        }
    }

    pub fn parse(s: &str) -> crate::Result<Self> {
        match s {
            "reddit" => Ok(Self::Reddit),
            "forum" => Ok(Self::Forum),
            "blog" => Ok(Self::Blog),
            "government" => Ok(Self::Government),
            "news" => Ok(Self::News),
            other => Err(crate::WaymarkError::validation(format!(
                "unknown source kind: {other}"
            ))),
        }
    }

    /// Authority weight used by attribution scoring (government > news >
    /// forum > blog > reddit).
    pub fn authority(&self) -> f64 {
        match self {
            Self::Government => 10.0,
            Self::News => 7.0,
            Self::Forum => 5.0,
            Self::Blog => 4.0,
            Self::Reddit => 3.0,
        }
    }
}

/// Optional provenance carried alongside scraped content.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChunkMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub published_at: Option<DateTime<Utc>>,
    /// Community the content came from (e.g., a subreddit name).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub community: Option<String>,
}

/// A bounded-size fragment of researched text with its own embedding.
///
/// The URL (with a `#chunk-N` suffix for multi-chunk documents) is unique
/// per corridor; re-ingesting the same URL is a no-op.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentChunk {
    pub id: ChunkId,
    pub corridor_id: CorridorId,
    pub url: String,
    pub title: String,
    pub body: String,
    pub source: SourceKind,
    /// Fixed-dimension embedding; absent until backfilled.
    pub embedding: Option<Vec<f32>>,
    pub metadata: ChunkMetadata,
    pub scraped_at: DateTime<Utc>,
    /// Scrape time plus the retention window; swept once past this.
    pub expires_at: DateTime<Utc>,
}

/// A document returned by the research provider, pre-chunking.
#[derive(Debug, Clone)]
pub struct SourceDocument {
    pub url: String,
    pub title: String,
    pub text: String,
    pub source: SourceKind,
    pub metadata: ChunkMetadata,
}

// ---------------------------------------------------------------------------
// Protocol steps
// ---------------------------------------------------------------------------

/// Checklist category. Unknown synthesis values coerce to `Legal`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepCategory {
    Visa,
    Finance,
    Housing,
    Employment,
    Legal,
    Health,
    Social,
}

impl StepCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Visa => "visa",
            Self::Finance => "finance",
            Self::Housing => "housing",
            Self::Employment => "employment",
            Self::Legal => "legal",
            Self::Health => "health",
            Self::Social => "social",
        }
    }

    pub fn parse(s: &str) -> crate::Result<Self> {
        Self::lookup(s).ok_or_else(|| {
            crate::WaymarkError::validation(format!("unknown step category: {s}"))
        })
    }

    /// Coerce an untrusted synthesis value, defaulting unknowns to `Legal`.
    pub fn coerce(s: &str) -> Self {
        let normalized = s.trim().to_lowercase();
        Self::lookup(&normalized).unwrap_or_else(|| {
            tracing::warn!(category = %s, "invalid category, defaulting to legal");
            Self::Legal
        })
    }

    fn lookup(s: &str) -> Option<Self> {
        match s {
            "visa" => Some(Self::Visa),
            "finance" => Some(Self::Finance),
            "housing" => Some(Self::Housing),
            "employment" => Some(Self::Employment),
            "legal" => Some(Self::Legal),
            "health" => Some(Self::Health),
            "social" => Some(Self::Social),
            _ => None,
        }
    }
}

/// Checklist priority. Unknown synthesis values coerce to `Medium`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepPriority {
    Critical,
    High,
    Medium,
    Low,
}

impl StepPriority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Critical => "critical",
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
        }
    }

    pub fn parse(s: &str) -> crate::Result<Self> {
        Self::lookup(s).ok_or_else(|| {
            crate::WaymarkError::validation(format!("unknown step priority: {s}"))
        })
    }

    /// Coerce an untrusted synthesis value, defaulting unknowns to `Medium`.
    pub fn coerce(s: &str) -> Self {
        let normalized = s.trim().to_lowercase();
        Self::lookup(&normalized).unwrap_or_else(|| {
            tracing::warn!(priority = %s, "invalid priority, defaulting to medium");
            Self::Medium
        })
    }

    fn lookup(s: &str) -> Option<Self> {
        match s {
            "critical" => Some(Self::Critical),
            "high" => Some(Self::High),
            "medium" => Some(Self::Medium),
            "low" => Some(Self::Low),
            _ => None,
        }
    }
}

/// Completion state of a persisted step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    NotStarted,
    InProgress,
    Completed,
    Blocked,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotStarted => "not_started",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Blocked => "blocked",
        }
    }

    pub fn parse(s: &str) -> crate::Result<Self> {
        match s {
            "not_started" => Ok(Self::NotStarted),
            "in_progress" => Ok(Self::InProgress),
            "completed" => Ok(Self::Completed),
            "blocked" => Ok(Self::Blocked),
            other => Err(crate::WaymarkError::validation(format!(
                "unknown step status: {other}"
            ))),
        }
    }
}

/// The source citation backing a checklist step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attribution {
    /// Defaults to empty when the model omits it; validation discards
    /// attributions without a parseable URL.
    #[serde(default, alias = "sourceUrl")]
    pub source_url: String,
    #[serde(default, alias = "authorName")]
    pub author: Option<String>,
    /// Upvotes/likes on the source; clamped to ≥ 0 during normalization.
    #[serde(default)]
    pub engagement: Option<i64>,
    #[serde(
        default,
        alias = "sourceDate",
        deserialize_with = "lenient_datetime"
    )]
    pub source_date: Option<DateTime<Utc>>,
}

/// A checklist item as produced by synthesis, before validation.
///
/// Synthesis output is untrusted: every field is optional at the wire
/// level and coerced at the persistence boundary rather than rejected.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandidateStep {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub priority: String,
    /// Titles of steps that must come first. May reference steps that do
    /// not exist or form cycles; the graph builder defends against both.
    #[serde(default, alias = "dependsOn")]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub warnings: Vec<String>,
    #[serde(default, alias = "hacks")]
    pub tips: Vec<String>,
    #[serde(default)]
    pub attribution: Option<Attribution>,
}

/// A persisted, ordered checklist step shown to a user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtocolStep {
    pub id: StepId,
    pub corridor_id: CorridorId,
    pub category: StepCategory,
    pub title: String,
    pub description: String,
    pub status: StepStatus,
    pub priority: StepPriority,
    /// 1-based position; a total order consistent with all non-cyclic
    /// prerequisite edges.
    pub order: u32,
    pub warnings: Vec<String>,
    pub tips: Vec<String>,
    pub attribution: Option<Attribution>,
    /// Whether the step was machine-generated. Only generated steps are
    /// deleted on refresh; hand-entered ones survive.
    pub generated: bool,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl ProtocolStep {
    /// Convert an ordered synthesis candidate into a persistable step,
    /// coercing enums and bounding string/list lengths.
    pub fn from_candidate(
        corridor_id: CorridorId,
        candidate: &CandidateStep,
        order: u32,
        attribution: Option<Attribution>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: StepId::new(),
            corridor_id,
            category: StepCategory::coerce(&candidate.category),
            title: truncate_chars(&candidate.title, MAX_TITLE_CHARS),
            description: truncate_chars(&candidate.description, MAX_DESCRIPTION_CHARS),
            status: StepStatus::NotStarted,
            priority: StepPriority::coerce(&candidate.priority),
            order,
            warnings: bounded_list(&candidate.warnings),
            tips: bounded_list(&candidate.tips),
            attribution,
            generated: true,
            completed_at: None,
            created_at: now,
        }
    }
}

/// Truncate to at most `max` characters, respecting char boundaries.
pub fn truncate_chars(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        s.chars().take(max).collect()
    }
}

fn bounded_list(items: &[String]) -> Vec<String> {
    items.iter().take(MAX_LIST_ITEMS).cloned().collect()
}

/// Accept an RFC 3339 string, an epoch-milliseconds number, or anything
/// else (mapped to `None`) for dates coming out of a language model.
fn lenient_datetime<'de, D>(deserializer: D) -> std::result::Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(value.and_then(|v| match v {
        serde_json::Value::String(s) => DateTime::parse_from_rfc3339(&s)
            .map(|dt| dt.with_timezone(&Utc))
            .ok(),
        serde_json::Value::Number(n) => n
            .as_i64()
            .and_then(DateTime::<Utc>::from_timestamp_millis),
        _ => None,
    }))
}

//! Turso Embedded / libSQL storage layer for the corridor pipeline.
//!
//! The [`Storage`] struct wraps a libSQL database holding corridors,
//! ingested content chunks (with embedding BLOBs), persisted protocol
//! steps, the gateway's TTL cache, and monthly quota counters.
//!
//! Embeddings are stored as little-endian `f32` BLOBs; nearest-neighbor
//! math happens in-process in `waymark-core`.

mod migrations;

use std::path::Path;

use chrono::{DateTime, Datelike, Duration, SecondsFormat, TimeZone, Utc};
use libsql::{Connection, Database, params};
use waymark_shared::{
    Attribution, ChunkId, ContentChunk, Corridor, CorridorId, ChunkMetadata, ProtocolStep,
    ResearchStatus, Result, SourceKind, StepCategory, StepId, StepPriority, StepStatus,
    WaymarkError,
};

/// Primary storage handle wrapping a libSQL database.
pub struct Storage {
    #[allow(dead_code)]
    db: Database,
    conn: Connection,
}

/// A cached payload with its freshness bookkeeping.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub key: String,
    pub payload: serde_json::Value,
    pub cached_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl CacheEntry {
    /// Whether the entry is at or past its TTL at `now`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Snapshot of a service's monthly call budget.
#[derive(Debug, Clone)]
pub struct QuotaStatus {
    pub service: String,
    pub used: u32,
    pub limit: u32,
    pub reset_at: DateTime<Utc>,
}

impl QuotaStatus {
    pub fn remaining(&self) -> u32 {
        self.limit.saturating_sub(self.used)
    }

    pub fn available(&self) -> bool {
        self.used < self.limit
    }
}

/// First instant of the calendar month after `now` — the quota reset
/// boundary.
pub fn next_month_start(now: DateTime<Utc>) -> DateTime<Utc> {
    let (year, month) = if now.month() == 12 {
        (now.year() + 1, 1)
    } else {
        (now.year(), now.month() + 1)
    };
    Utc.with_ymd_and_hms(year, month, 1, 0, 0, 0)
        .single()
        .unwrap_or(now)
}

impl Storage {
    /// Open or create a database at `path`, applying pending migrations.
    pub async fn open(path: &Path) -> Result<Self> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| WaymarkError::io(parent, e))?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| WaymarkError::Storage(e.to_string()))?;

        let conn = db
            .connect()
            .map_err(|e| WaymarkError::Storage(e.to_string()))?;

        let storage = Self { db, conn };
        storage.run_migrations().await?;
        Ok(storage)
    }

    /// Run pending schema migrations.
    async fn run_migrations(&self) -> Result<()> {
        let current_version = self.schema_version().await;

        for migration in migrations::all_migrations() {
            if migration.version > current_version {
                tracing::info!(
                    version = migration.version,
                    description = migration.description,
                    "applying migration"
                );
                self.conn.execute_batch(migration.sql).await.map_err(|e| {
                    WaymarkError::Storage(format!(
                        "migration v{} failed: {e}",
                        migration.version
                    ))
                })?;
            }
        }
        Ok(())
    }

    /// Get the current schema version, or 0 if no migrations have applied.
    async fn schema_version(&self) -> u32 {
        let result = self
            .conn
            .query("SELECT MAX(version) FROM schema_migrations", params![])
            .await;

        match result {
            Ok(mut rows) => {
                if let Ok(Some(row)) = rows.next().await {
                    row.get::<u32>(0).unwrap_or(0)
                } else {
                    0
                }
            }
            Err(_) => 0, // Table doesn't exist yet
        }
    }

    // -----------------------------------------------------------------------
    // Corridor operations
    // -----------------------------------------------------------------------

    /// Insert a new corridor in the default `stale` state.
    pub async fn create_corridor(&self, origin: &str, destination: &str) -> Result<Corridor> {
        let now = Utc::now();
        let corridor = Corridor {
            id: CorridorId::new(),
            origin: origin.to_string(),
            destination: destination.to_string(),
            research_status: ResearchStatus::Stale,
            last_researched_at: None,
            protocol_count: 0,
            error_message: None,
            created_at: now,
            updated_at: now,
        };

        self.conn
            .execute(
                "INSERT INTO corridors
                   (id, origin, destination, research_status, protocol_count,
                    created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, 0, ?5, ?6)",
                params![
                    corridor.id.to_string(),
                    origin,
                    destination,
                    corridor.research_status.as_str(),
                    fmt_ts(now),
                    fmt_ts(now)
                ],
            )
            .await
            .map_err(|e| WaymarkError::Storage(e.to_string()))?;
        Ok(corridor)
    }

    /// Get a corridor by id.
    pub async fn get_corridor(&self, id: CorridorId) -> Result<Option<Corridor>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, origin, destination, research_status, last_researched_at,
                        protocol_count, error_message, created_at, updated_at
                 FROM corridors WHERE id = ?1",
                params![id.to_string()],
            )
            .await
            .map_err(|e| WaymarkError::Storage(e.to_string()))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_corridor(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(WaymarkError::Storage(e.to_string())),
        }
    }

    /// Find a corridor by its origin/destination pair.
    pub async fn find_corridor(
        &self,
        origin: &str,
        destination: &str,
    ) -> Result<Option<Corridor>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, origin, destination, research_status, last_researched_at,
                        protocol_count, error_message, created_at, updated_at
                 FROM corridors WHERE origin = ?1 AND destination = ?2",
                params![origin, destination],
            )
            .await
            .map_err(|e| WaymarkError::Storage(e.to_string()))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_corridor(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(WaymarkError::Storage(e.to_string())),
        }
    }

    /// List all corridors, most recently updated first.
    pub async fn list_corridors(&self) -> Result<Vec<Corridor>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, origin, destination, research_status, last_researched_at,
                        protocol_count, error_message, created_at, updated_at
                 FROM corridors ORDER BY updated_at DESC",
                params![],
            )
            .await
            .map_err(|e| WaymarkError::Storage(e.to_string()))?;

        let mut corridors = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            corridors.push(row_to_corridor(&row)?);
        }
        Ok(corridors)
    }

    /// Atomically claim a corridor for refreshing. Returns `false` when a
    /// refresh is already in flight — the caller must not start another.
    pub async fn begin_refresh(&self, id: CorridorId) -> Result<bool> {
        let affected = self
            .conn
            .execute(
                "UPDATE corridors
                 SET research_status = 'refreshing', updated_at = ?1
                 WHERE id = ?2 AND research_status != 'refreshing'",
                params![fmt_ts(Utc::now()), id.to_string()],
            )
            .await
            .map_err(|e| WaymarkError::Storage(e.to_string()))?;
        Ok(affected == 1)
    }

    /// Transition `refreshing → fresh`: stamp `last_researched_at`, record
    /// the step count, clear any previous error.
    pub async fn mark_fresh(&self, id: CorridorId, protocol_count: u32) -> Result<()> {
        let now = fmt_ts(Utc::now());
        self.conn
            .execute(
                "UPDATE corridors
                 SET research_status = 'fresh', last_researched_at = ?1,
                     protocol_count = ?2, error_message = NULL, updated_at = ?1
                 WHERE id = ?3",
                params![now, protocol_count as i64, id.to_string()],
            )
            .await
            .map_err(|e| WaymarkError::Storage(e.to_string()))?;
        Ok(())
    }

    /// Transition `refreshing → error`: record the failure reason and leave
    /// `last_researched_at` untouched.
    pub async fn mark_error(&self, id: CorridorId, message: &str) -> Result<()> {
        self.conn
            .execute(
                "UPDATE corridors
                 SET research_status = 'error', error_message = ?1, updated_at = ?2
                 WHERE id = ?3",
                params![message, fmt_ts(Utc::now()), id.to_string()],
            )
            .await
            .map_err(|e| WaymarkError::Storage(e.to_string()))?;
        Ok(())
    }

    /// Corridors due for a refresh, oldest research first (never-researched
    /// ones lead), excluding any with a refresh already in flight.
    pub async fn stale_corridors(
        &self,
        researched_before: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<Corridor>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, origin, destination, research_status, last_researched_at,
                        protocol_count, error_message, created_at, updated_at
                 FROM corridors
                 WHERE research_status != 'refreshing'
                   AND (last_researched_at IS NULL OR last_researched_at < ?1)
                 ORDER BY last_researched_at IS NULL DESC, last_researched_at ASC
                 LIMIT ?2",
                params![fmt_ts(researched_before), limit as i64],
            )
            .await
            .map_err(|e| WaymarkError::Storage(e.to_string()))?;

        let mut corridors = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            corridors.push(row_to_corridor(&row)?);
        }
        Ok(corridors)
    }

    // -----------------------------------------------------------------------
    // Content chunk operations
    // -----------------------------------------------------------------------

    /// Insert a content chunk.
    pub async fn insert_chunk(&self, chunk: &ContentChunk) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO content_chunks
                   (id, corridor_id, url, title, body, source, embedding,
                    author, published_at, community, scraped_at, expires_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                params![
                    chunk.id.to_string(),
                    chunk.corridor_id.to_string(),
                    chunk.url.as_str(),
                    chunk.title.as_str(),
                    chunk.body.as_str(),
                    chunk.source.as_str(),
                    chunk.embedding.as_deref().map(embedding_to_blob),
                    chunk.metadata.author.as_deref(),
                    chunk.metadata.published_at.map(fmt_ts),
                    chunk.metadata.community.as_deref(),
                    fmt_ts(chunk.scraped_at),
                    fmt_ts(chunk.expires_at)
                ],
            )
            .await
            .map_err(|e| WaymarkError::Storage(e.to_string()))?;
        Ok(())
    }

    /// Whether any chunk for `url` already exists in this corridor,
    /// counting multi-chunk rows stored under `url#chunk-N` suffixes.
    pub async fn has_url(&self, corridor_id: CorridorId, url: &str) -> Result<bool> {
        let mut rows = self
            .conn
            .query(
                "SELECT 1 FROM content_chunks
                 WHERE corridor_id = ?1 AND (url = ?2 OR url LIKE ?2 || '#chunk-%')
                 LIMIT 1",
                params![corridor_id.to_string(), url],
            )
            .await
            .map_err(|e| WaymarkError::Storage(e.to_string()))?;

        match rows.next().await {
            Ok(Some(_)) => Ok(true),
            Ok(None) => Ok(false),
            Err(e) => Err(WaymarkError::Storage(e.to_string())),
        }
    }

    /// Get a single chunk by id.
    pub async fn get_chunk(&self, id: ChunkId) -> Result<Option<ContentChunk>> {
        let mut rows = self
            .conn
            .query(
                &format!("{CHUNK_SELECT} WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(|e| WaymarkError::Storage(e.to_string()))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_chunk(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(WaymarkError::Storage(e.to_string())),
        }
    }

    /// All chunks for a corridor, oldest scrape first.
    pub async fn content_by_corridor(&self, corridor_id: CorridorId) -> Result<Vec<ContentChunk>> {
        let mut rows = self
            .conn
            .query(
                &format!("{CHUNK_SELECT} WHERE corridor_id = ?1 ORDER BY scraped_at ASC"),
                params![corridor_id.to_string()],
            )
            .await
            .map_err(|e| WaymarkError::Storage(e.to_string()))?;

        let mut chunks = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            chunks.push(row_to_chunk(&row)?);
        }
        Ok(chunks)
    }

    /// All chunks across every corridor (global retrieval tier).
    pub async fn all_content(&self) -> Result<Vec<ContentChunk>> {
        let mut rows = self
            .conn
            .query(&format!("{CHUNK_SELECT} ORDER BY scraped_at ASC"), params![])
            .await
            .map_err(|e| WaymarkError::Storage(e.to_string()))?;

        let mut chunks = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            chunks.push(row_to_chunk(&row)?);
        }
        Ok(chunks)
    }

    /// Attach an embedding to an existing chunk.
    pub async fn update_embedding(&self, id: ChunkId, embedding: &[f32]) -> Result<()> {
        self.conn
            .execute(
                "UPDATE content_chunks SET embedding = ?1 WHERE id = ?2",
                params![embedding_to_blob(embedding), id.to_string()],
            )
            .await
            .map_err(|e| WaymarkError::Storage(e.to_string()))?;
        Ok(())
    }

    /// Chunks in a corridor that still lack an embedding.
    pub async fn chunks_missing_embedding(
        &self,
        corridor_id: CorridorId,
    ) -> Result<Vec<ContentChunk>> {
        let mut rows = self
            .conn
            .query(
                &format!("{CHUNK_SELECT} WHERE corridor_id = ?1 AND embedding IS NULL"),
                params![corridor_id.to_string()],
            )
            .await
            .map_err(|e| WaymarkError::Storage(e.to_string()))?;

        let mut chunks = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            chunks.push(row_to_chunk(&row)?);
        }
        Ok(chunks)
    }

    /// Delete chunks past their retention window. Returns how many went.
    pub async fn delete_expired_content(&self, now: DateTime<Utc>) -> Result<u64> {
        self.conn
            .execute(
                "DELETE FROM content_chunks WHERE expires_at < ?1",
                params![fmt_ts(now)],
            )
            .await
            .map_err(|e| WaymarkError::Storage(e.to_string()))
    }

    /// Most recent scrape time in a corridor, if any content exists.
    pub async fn last_scraped_at(&self, corridor_id: CorridorId) -> Result<Option<DateTime<Utc>>> {
        let mut rows = self
            .conn
            .query(
                "SELECT MAX(scraped_at) FROM content_chunks WHERE corridor_id = ?1",
                params![corridor_id.to_string()],
            )
            .await
            .map_err(|e| WaymarkError::Storage(e.to_string()))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(row.get::<String>(0).ok().map(|s| parse_ts(&s)).transpose()?),
            _ => Ok(None),
        }
    }

    // -----------------------------------------------------------------------
    // Protocol step operations
    // -----------------------------------------------------------------------

    /// Insert a batch of ordered steps.
    pub async fn insert_steps(&self, steps: &[ProtocolStep]) -> Result<()> {
        for step in steps {
            self.conn
                .execute(
                    "INSERT INTO protocol_steps
                       (id, corridor_id, category, title, description, status,
                        priority, ord, warnings_json, tips_json, attribution_json,
                        generated, completed_at, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
                    params![
                        step.id.to_string(),
                        step.corridor_id.to_string(),
                        step.category.as_str(),
                        step.title.as_str(),
                        step.description.as_str(),
                        step.status.as_str(),
                        step.priority.as_str(),
                        step.order as i64,
                        to_json(&step.warnings)?,
                        to_json(&step.tips)?,
                        step.attribution
                            .as_ref()
                            .map(|a| to_json(a))
                            .transpose()?,
                        step.generated as i64,
                        step.completed_at.map(fmt_ts),
                        fmt_ts(step.created_at)
                    ],
                )
                .await
                .map_err(|e| WaymarkError::Storage(e.to_string()))?;
        }
        Ok(())
    }

    /// All steps for a corridor in checklist order.
    pub async fn steps_by_corridor(&self, corridor_id: CorridorId) -> Result<Vec<ProtocolStep>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, corridor_id, category, title, description, status,
                        priority, ord, warnings_json, tips_json, attribution_json,
                        generated, completed_at, created_at
                 FROM protocol_steps WHERE corridor_id = ?1 ORDER BY ord ASC",
                params![corridor_id.to_string()],
            )
            .await
            .map_err(|e| WaymarkError::Storage(e.to_string()))?;

        let mut steps = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            steps.push(row_to_step(&row)?);
        }
        Ok(steps)
    }

    /// Delete machine-generated steps for a corridor (hand-entered ones
    /// survive a refresh). Returns how many went.
    pub async fn delete_generated_steps(&self, corridor_id: CorridorId) -> Result<u64> {
        self.conn
            .execute(
                "DELETE FROM protocol_steps WHERE corridor_id = ?1 AND generated = 1",
                params![corridor_id.to_string()],
            )
            .await
            .map_err(|e| WaymarkError::Storage(e.to_string()))
    }

    /// Update a step's completion status.
    pub async fn update_step_status(&self, id: StepId, status: StepStatus) -> Result<()> {
        let completed_at = match status {
            StepStatus::Completed => Some(fmt_ts(Utc::now())),
            _ => None,
        };
        self.conn
            .execute(
                "UPDATE protocol_steps SET status = ?1, completed_at = ?2 WHERE id = ?3",
                params![status.as_str(), completed_at, id.to_string()],
            )
            .await
            .map_err(|e| WaymarkError::Storage(e.to_string()))?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Gateway cache operations
    // -----------------------------------------------------------------------

    /// Look up a cache entry regardless of expiry; the caller decides what
    /// staleness means.
    pub async fn cache_get(&self, key: &str) -> Result<Option<CacheEntry>> {
        let mut rows = self
            .conn
            .query(
                "SELECT key, payload, cached_at, expires_at FROM api_cache WHERE key = ?1",
                params![key],
            )
            .await
            .map_err(|e| WaymarkError::Storage(e.to_string()))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let key: String = row
                    .get(0)
                    .map_err(|e| WaymarkError::Storage(e.to_string()))?;
                let payload: String = row
                    .get(1)
                    .map_err(|e| WaymarkError::Storage(e.to_string()))?;
                let cached_at: String = row
                    .get(2)
                    .map_err(|e| WaymarkError::Storage(e.to_string()))?;
                let expires_at: String = row
                    .get(3)
                    .map_err(|e| WaymarkError::Storage(e.to_string()))?;
                Ok(Some(CacheEntry {
                    key,
                    payload: serde_json::from_str(&payload)
                        .map_err(|e| WaymarkError::Storage(format!("corrupt cache payload: {e}")))?,
                    cached_at: parse_ts(&cached_at)?,
                    expires_at: parse_ts(&expires_at)?,
                }))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(WaymarkError::Storage(e.to_string())),
        }
    }

    /// Write-through a cache entry, replacing any previous value for `key`.
    pub async fn cache_put(
        &self,
        key: &str,
        payload: &serde_json::Value,
        ttl: Duration,
    ) -> Result<()> {
        let now = Utc::now();
        self.conn
            .execute(
                "INSERT INTO api_cache (key, payload, cached_at, expires_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(key) DO UPDATE SET
                   payload = excluded.payload,
                   cached_at = excluded.cached_at,
                   expires_at = excluded.expires_at",
                params![
                    key,
                    payload.to_string(),
                    fmt_ts(now),
                    fmt_ts(now + ttl)
                ],
            )
            .await
            .map_err(|e| WaymarkError::Storage(e.to_string()))?;
        Ok(())
    }

    /// Delete cache entries past their TTL. Returns how many went.
    pub async fn delete_expired_cache(&self, now: DateTime<Utc>) -> Result<u64> {
        self.conn
            .execute(
                "DELETE FROM api_cache WHERE expires_at < ?1",
                params![fmt_ts(now)],
            )
            .await
            .map_err(|e| WaymarkError::Storage(e.to_string()))
    }

    // -----------------------------------------------------------------------
    // Quota operations
    // -----------------------------------------------------------------------

    /// Current quota for a service, applying the lazy monthly reset first:
    /// when the stored boundary has passed, the counter zeroes and a new
    /// boundary is set before the status is read.
    pub async fn quota_status(&self, service: &str, limit: u32) -> Result<QuotaStatus> {
        let now = Utc::now();
        self.reset_quota_if_due(service, now).await?;

        let mut rows = self
            .conn
            .query(
                "SELECT call_count, reset_at FROM api_quota WHERE service = ?1",
                params![service],
            )
            .await
            .map_err(|e| WaymarkError::Storage(e.to_string()))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let used: u32 = row
                    .get(0)
                    .map_err(|e| WaymarkError::Storage(e.to_string()))?;
                let reset_at: String = row
                    .get(1)
                    .map_err(|e| WaymarkError::Storage(e.to_string()))?;
                Ok(QuotaStatus {
                    service: service.to_string(),
                    used,
                    limit,
                    reset_at: parse_ts(&reset_at)?,
                })
            }
            _ => Ok(QuotaStatus {
                service: service.to_string(),
                used: 0,
                limit,
                reset_at: next_month_start(now),
            }),
        }
    }

    /// Count one call against a service's monthly budget. The increment is
    /// a single SQL statement, so concurrent callers cannot lose updates.
    /// Returns the new count within the current period.
    pub async fn increment_quota(&self, service: &str) -> Result<u32> {
        let now = Utc::now();
        self.reset_quota_if_due(service, now).await?;

        self.conn
            .execute(
                "INSERT INTO api_quota (service, call_count, reset_at, last_call_at)
                 VALUES (?1, 1, ?2, ?3)
                 ON CONFLICT(service) DO UPDATE SET
                   call_count = call_count + 1,
                   last_call_at = excluded.last_call_at",
                params![service, fmt_ts(next_month_start(now)), fmt_ts(now)],
            )
            .await
            .map_err(|e| WaymarkError::Storage(e.to_string()))?;

        let mut rows = self
            .conn
            .query(
                "SELECT call_count FROM api_quota WHERE service = ?1",
                params![service],
            )
            .await
            .map_err(|e| WaymarkError::Storage(e.to_string()))?;

        match rows.next().await {
            Ok(Some(row)) => row
                .get::<u32>(0)
                .map_err(|e| WaymarkError::Storage(e.to_string())),
            _ => Err(WaymarkError::Storage(format!(
                "quota row missing for {service} after increment"
            ))),
        }
    }

    /// Zero the counter exactly once when the wall clock crosses the stored
    /// reset boundary. Guarded on the old boundary so two concurrent
    /// callers cannot double-reset.
    async fn reset_quota_if_due(&self, service: &str, now: DateTime<Utc>) -> Result<()> {
        let reset = self
            .conn
            .execute(
                "UPDATE api_quota
                 SET call_count = 0, reset_at = ?1
                 WHERE service = ?2 AND reset_at <= ?3",
                params![fmt_ts(next_month_start(now)), service, fmt_ts(now)],
            )
            .await
            .map_err(|e| WaymarkError::Storage(e.to_string()))?;
        if reset > 0 {
            tracing::info!(service, "monthly quota reset");
        }
        Ok(())
    }

    /// Test/diagnostic hook: force a service's reset boundary.
    pub async fn set_quota_reset_at(&self, service: &str, reset_at: DateTime<Utc>) -> Result<()> {
        self.conn
            .execute(
                "UPDATE api_quota SET reset_at = ?1 WHERE service = ?2",
                params![fmt_ts(reset_at), service],
            )
            .await
            .map_err(|e| WaymarkError::Storage(e.to_string()))?;
        Ok(())
    }
}

const CHUNK_SELECT: &str = "SELECT id, corridor_id, url, title, body, source, embedding,
        author, published_at, community, scraped_at, expires_at
 FROM content_chunks";

// ---------------------------------------------------------------------------
// Row mapping & encoding helpers
// ---------------------------------------------------------------------------

/// Render a timestamp in a fixed-width RFC 3339 form so lexicographic
/// comparison in SQL matches chronological order.
fn fmt_ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| WaymarkError::Storage(format!("invalid timestamp {s:?}: {e}")))
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String> {
    serde_json::to_string(value).map_err(|e| WaymarkError::Storage(e.to_string()))
}

/// Encode an embedding as a little-endian f32 BLOB.
pub fn embedding_to_blob(embedding: &[f32]) -> Vec<u8> {
    let mut blob = Vec::with_capacity(embedding.len() * 4);
    for value in embedding {
        blob.extend_from_slice(&value.to_le_bytes());
    }
    blob
}

/// Decode a little-endian f32 BLOB back into an embedding.
pub fn blob_to_embedding(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|bytes| f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
        .collect()
}

fn row_to_corridor(row: &libsql::Row) -> Result<Corridor> {
    let status: String = row
        .get(3)
        .map_err(|e| WaymarkError::Storage(e.to_string()))?;
    Ok(Corridor {
        id: get_id(row, 0)?,
        origin: row
            .get(1)
            .map_err(|e| WaymarkError::Storage(e.to_string()))?,
        destination: row
            .get(2)
            .map_err(|e| WaymarkError::Storage(e.to_string()))?,
        research_status: ResearchStatus::parse(&status)?,
        last_researched_at: row
            .get::<String>(4)
            .ok()
            .map(|s| parse_ts(&s))
            .transpose()?,
        protocol_count: row
            .get(5)
            .map_err(|e| WaymarkError::Storage(e.to_string()))?,
        error_message: row.get::<String>(6).ok(),
        created_at: parse_ts(
            &row.get::<String>(7)
                .map_err(|e| WaymarkError::Storage(e.to_string()))?,
        )?,
        updated_at: parse_ts(
            &row.get::<String>(8)
                .map_err(|e| WaymarkError::Storage(e.to_string()))?,
        )?,
    })
}

fn row_to_chunk(row: &libsql::Row) -> Result<ContentChunk> {
    let source: String = row
        .get(5)
        .map_err(|e| WaymarkError::Storage(e.to_string()))?;
    Ok(ContentChunk {
        id: ChunkId(parse_uuid(row, 0)?),
        corridor_id: get_id(row, 1)?,
        url: row
            .get(2)
            .map_err(|e| WaymarkError::Storage(e.to_string()))?,
        title: row
            .get(3)
            .map_err(|e| WaymarkError::Storage(e.to_string()))?,
        body: row
            .get(4)
            .map_err(|e| WaymarkError::Storage(e.to_string()))?,
        source: SourceKind::parse(&source)?,
        embedding: row
            .get::<Vec<u8>>(6)
            .ok()
            .map(|blob| blob_to_embedding(&blob)),
        metadata: ChunkMetadata {
            author: row.get::<String>(7).ok(),
            published_at: row
                .get::<String>(8)
                .ok()
                .map(|s| parse_ts(&s))
                .transpose()?,
            community: row.get::<String>(9).ok(),
        },
        scraped_at: parse_ts(
            &row.get::<String>(10)
                .map_err(|e| WaymarkError::Storage(e.to_string()))?,
        )?,
        expires_at: parse_ts(
            &row.get::<String>(11)
                .map_err(|e| WaymarkError::Storage(e.to_string()))?,
        )?,
    })
}

fn row_to_step(row: &libsql::Row) -> Result<ProtocolStep> {
    let category: String = row
        .get(2)
        .map_err(|e| WaymarkError::Storage(e.to_string()))?;
    let status: String = row
        .get(5)
        .map_err(|e| WaymarkError::Storage(e.to_string()))?;
    let priority: String = row
        .get(6)
        .map_err(|e| WaymarkError::Storage(e.to_string()))?;
    let generated: i64 = row
        .get(11)
        .map_err(|e| WaymarkError::Storage(e.to_string()))?;
    Ok(ProtocolStep {
        id: StepId(parse_uuid(row, 0)?),
        corridor_id: get_id(row, 1)?,
        category: StepCategory::parse(&category)?,
        title: row
            .get(3)
            .map_err(|e| WaymarkError::Storage(e.to_string()))?,
        description: row
            .get(4)
            .map_err(|e| WaymarkError::Storage(e.to_string()))?,
        status: StepStatus::parse(&status)?,
        priority: StepPriority::parse(&priority)?,
        order: row
            .get(7)
            .map_err(|e| WaymarkError::Storage(e.to_string()))?,
        warnings: from_json_list(row.get::<String>(8).ok())?,
        tips: from_json_list(row.get::<String>(9).ok())?,
        attribution: row
            .get::<String>(10)
            .ok()
            .map(|s| {
                serde_json::from_str::<Attribution>(&s)
                    .map_err(|e| WaymarkError::Storage(format!("corrupt attribution: {e}")))
            })
            .transpose()?,
        generated: generated != 0,
        completed_at: row
            .get::<String>(12)
            .ok()
            .map(|s| parse_ts(&s))
            .transpose()?,
        created_at: parse_ts(
            &row.get::<String>(13)
                .map_err(|e| WaymarkError::Storage(e.to_string()))?,
        )?,
    })
}

fn from_json_list(raw: Option<String>) -> Result<Vec<String>> {
    match raw {
        Some(s) => serde_json::from_str(&s)
            .map_err(|e| WaymarkError::Storage(format!("corrupt string list: {e}"))),
        None => Ok(Vec::new()),
    }
}

fn parse_uuid(row: &libsql::Row, idx: i32) -> Result<uuid::Uuid> {
    let raw: String = row
        .get(idx)
        .map_err(|e| WaymarkError::Storage(e.to_string()))?;
    uuid::Uuid::parse_str(&raw).map_err(|e| WaymarkError::Storage(format!("invalid uuid: {e}")))
}

fn get_id(row: &libsql::Row, idx: i32) -> Result<CorridorId> {
    Ok(CorridorId(parse_uuid(row, idx)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use uuid::Uuid;
    use waymark_shared::CandidateStep;

    /// Create a temp file storage for testing.
    async fn test_storage() -> Storage {
        let tmp = std::env::temp_dir().join(format!("waymark_test_{}.db", Uuid::now_v7()));
        Storage::open(&tmp).await.expect("open test db")
    }

    fn sample_chunk(corridor_id: CorridorId, url: &str) -> ContentChunk {
        let now = Utc::now();
        ContentChunk {
            id: ChunkId::new(),
            corridor_id,
            url: url.into(),
            title: "Registering in Berlin".into(),
            body: "Book an Anmeldung appointment as early as possible.".into(),
            source: SourceKind::Forum,
            embedding: Some(vec![0.1, 0.2, 0.3, 0.4]),
            metadata: ChunkMetadata {
                author: Some("expat_berlin".into()),
                published_at: Some(now - Duration::days(10)),
                community: None,
            },
            scraped_at: now,
            expires_at: now + Duration::days(30),
        }
    }

    #[tokio::test]
    async fn open_and_migrate() {
        let storage = test_storage().await;
        assert_eq!(storage.schema_version().await, 1);
    }

    #[tokio::test]
    async fn idempotent_migration() {
        let tmp = std::env::temp_dir().join(format!("waymark_test_{}.db", Uuid::now_v7()));
        let s1 = Storage::open(&tmp).await.expect("first open");
        drop(s1);
        let s2 = Storage::open(&tmp).await.expect("second open");
        assert_eq!(s2.schema_version().await, 1);
    }

    #[tokio::test]
    async fn corridor_lifecycle() {
        let storage = test_storage().await;
        let corridor = storage.create_corridor("NG", "DE").await.expect("create");
        assert_eq!(corridor.research_status, ResearchStatus::Stale);

        let loaded = storage
            .get_corridor(corridor.id)
            .await
            .expect("get")
            .expect("exists");
        assert_eq!(loaded.origin, "NG");
        assert_eq!(loaded.destination, "DE");
        assert!(loaded.last_researched_at.is_none());

        let found = storage
            .find_corridor("NG", "DE")
            .await
            .expect("find")
            .expect("exists");
        assert_eq!(found.id, corridor.id);

        assert!(storage.begin_refresh(corridor.id).await.expect("claim"));
        // Second claim while refreshing must be refused.
        assert!(!storage.begin_refresh(corridor.id).await.expect("claim"));

        storage.mark_fresh(corridor.id, 12).await.expect("fresh");
        let fresh = storage
            .get_corridor(corridor.id)
            .await
            .unwrap()
            .expect("exists");
        assert_eq!(fresh.research_status, ResearchStatus::Fresh);
        assert_eq!(fresh.protocol_count, 12);
        assert!(fresh.last_researched_at.is_some());

        assert!(storage.begin_refresh(corridor.id).await.expect("reclaim"));
        storage
            .mark_error(corridor.id, "research failed")
            .await
            .expect("error");
        let errored = storage
            .get_corridor(corridor.id)
            .await
            .unwrap()
            .expect("exists");
        assert_eq!(errored.research_status, ResearchStatus::Error);
        assert_eq!(errored.error_message.as_deref(), Some("research failed"));
        // Failure must not touch the last successful research time.
        assert_eq!(errored.last_researched_at, fresh.last_researched_at);
    }

    #[tokio::test]
    async fn stale_listing_orders_never_researched_first() {
        let storage = test_storage().await;
        let fresh = storage.create_corridor("NG", "DE").await.unwrap();
        storage.mark_fresh(fresh.id, 1).await.unwrap();
        let never = storage.create_corridor("IN", "CA").await.unwrap();
        let old = storage.create_corridor("PH", "AU").await.unwrap();
        storage.mark_fresh(old.id, 1).await.unwrap();

        // Cutoff in the future makes `old` stale; `fresh` is also stale by
        // that cutoff, so pick a cutoff between the two mark times instead.
        let stale = storage
            .stale_corridors(Utc::now() + Duration::seconds(1), 10)
            .await
            .expect("stale list");
        assert_eq!(stale.len(), 3);
        assert_eq!(stale[0].id, never.id, "never-researched leads");

        let limited = storage
            .stale_corridors(Utc::now() + Duration::seconds(1), 1)
            .await
            .expect("bounded");
        assert_eq!(limited.len(), 1);
    }

    #[tokio::test]
    async fn chunk_roundtrip_preserves_embedding() {
        let storage = test_storage().await;
        let corridor = storage.create_corridor("NG", "DE").await.unwrap();
        let chunk = sample_chunk(corridor.id, "https://example.com/post");
        storage.insert_chunk(&chunk).await.expect("insert");

        let loaded = storage
            .get_chunk(chunk.id)
            .await
            .expect("get")
            .expect("exists");
        assert_eq!(loaded.embedding, chunk.embedding);
        assert_eq!(loaded.metadata.author.as_deref(), Some("expat_berlin"));
        assert_eq!(loaded.source, SourceKind::Forum);
    }

    #[tokio::test]
    async fn url_dedup_covers_chunk_suffixes() {
        let storage = test_storage().await;
        let corridor = storage.create_corridor("NG", "DE").await.unwrap();
        let other = storage.create_corridor("IN", "CA").await.unwrap();

        let mut chunk = sample_chunk(corridor.id, "https://example.com/post#chunk-0");
        storage.insert_chunk(&chunk).await.unwrap();
        chunk.id = ChunkId::new();
        chunk.url = "https://example.com/post#chunk-1".into();
        storage.insert_chunk(&chunk).await.unwrap();

        assert!(
            storage
                .has_url(corridor.id, "https://example.com/post")
                .await
                .unwrap()
        );
        // Same URL in a different corridor is free to ingest.
        assert!(
            !storage
                .has_url(other.id, "https://example.com/post")
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn expired_content_sweep() {
        let storage = test_storage().await;
        let corridor = storage.create_corridor("NG", "DE").await.unwrap();
        let mut expired = sample_chunk(corridor.id, "https://old.example.com");
        expired.expires_at = Utc::now() - Duration::days(1);
        storage.insert_chunk(&expired).await.unwrap();
        storage
            .insert_chunk(&sample_chunk(corridor.id, "https://new.example.com"))
            .await
            .unwrap();

        let deleted = storage.delete_expired_content(Utc::now()).await.unwrap();
        assert_eq!(deleted, 1);
        let remaining = storage.content_by_corridor(corridor.id).await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].url, "https://new.example.com");
    }

    #[tokio::test]
    async fn embedding_backfill() {
        let storage = test_storage().await;
        let corridor = storage.create_corridor("NG", "DE").await.unwrap();
        let mut chunk = sample_chunk(corridor.id, "https://example.com/no-embedding");
        chunk.embedding = None;
        storage.insert_chunk(&chunk).await.unwrap();

        let missing = storage.chunks_missing_embedding(corridor.id).await.unwrap();
        assert_eq!(missing.len(), 1);

        storage
            .update_embedding(chunk.id, &[1.0, 2.0, 3.0])
            .await
            .unwrap();
        assert!(
            storage
                .chunks_missing_embedding(corridor.id)
                .await
                .unwrap()
                .is_empty()
        );
        let loaded = storage.get_chunk(chunk.id).await.unwrap().unwrap();
        assert_eq!(loaded.embedding, Some(vec![1.0, 2.0, 3.0]));
    }

    #[tokio::test]
    async fn steps_roundtrip_and_generated_delete() {
        let storage = test_storage().await;
        let corridor = storage.create_corridor("NG", "DE").await.unwrap();
        let now = Utc::now();

        let candidate = CandidateStep {
            title: "Open a bank account".into(),
            category: "finance".into(),
            description: "You need a blocked account first.".into(),
            priority: "high".into(),
            depends_on: vec!["Get residence registration".into()],
            warnings: vec!["Branches require appointments".into()],
            tips: vec![],
            attribution: None,
        };
        let mut generated =
            ProtocolStep::from_candidate(corridor.id, &candidate, 2, None, now);
        generated.attribution = Some(Attribution {
            source_url: "https://reddit.com/r/germany/post".into(),
            author: Some("u/expat".into()),
            engagement: Some(412),
            source_date: None,
        });
        let mut manual = ProtocolStep::from_candidate(corridor.id, &candidate, 1, None, now);
        manual.generated = false;
        manual.title = "Say goodbye to friends".into();

        storage
            .insert_steps(&[manual.clone(), generated.clone()])
            .await
            .expect("insert steps");

        let steps = storage.steps_by_corridor(corridor.id).await.unwrap();
        assert_eq!(steps.len(), 2);
        assert_eq!(steps[0].order, 1);
        assert_eq!(steps[1].order, 2);
        assert_eq!(
            steps[1].attribution.as_ref().map(|a| a.engagement),
            Some(Some(412))
        );
        assert_eq!(steps[1].warnings, vec!["Branches require appointments"]);

        let deleted = storage.delete_generated_steps(corridor.id).await.unwrap();
        assert_eq!(deleted, 1);
        let remaining = storage.steps_by_corridor(corridor.id).await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].title, "Say goodbye to friends");
    }

    #[tokio::test]
    async fn step_status_update_stamps_completion() {
        let storage = test_storage().await;
        let corridor = storage.create_corridor("NG", "DE").await.unwrap();
        let candidate = CandidateStep {
            title: "Get residence registration".into(),
            category: "legal".into(),
            description: "Anmeldung at the Bürgeramt.".into(),
            priority: "critical".into(),
            depends_on: vec![],
            warnings: vec![],
            tips: vec![],
            attribution: None,
        };
        let step = ProtocolStep::from_candidate(corridor.id, &candidate, 1, None, Utc::now());
        storage.insert_steps(std::slice::from_ref(&step)).await.unwrap();

        storage
            .update_step_status(step.id, StepStatus::Completed)
            .await
            .unwrap();
        let steps = storage.steps_by_corridor(corridor.id).await.unwrap();
        assert_eq!(steps[0].status, StepStatus::Completed);
        assert!(steps[0].completed_at.is_some());
    }

    #[tokio::test]
    async fn cache_roundtrip_and_expiry() {
        let storage = test_storage().await;
        let payload = serde_json::json!({"answer": 42});
        storage
            .cache_put("svc:key", &payload, Duration::days(7))
            .await
            .expect("put");

        let entry = storage
            .cache_get("svc:key")
            .await
            .expect("get")
            .expect("exists");
        assert_eq!(entry.payload, payload);
        assert!(!entry.is_expired(Utc::now()));

        // Replacement updates in place.
        let newer = serde_json::json!({"answer": 43});
        storage
            .cache_put("svc:key", &newer, Duration::days(7))
            .await
            .unwrap();
        let entry = storage.cache_get("svc:key").await.unwrap().unwrap();
        assert_eq!(entry.payload, newer);

        // An expired entry is still returned; expiry is the caller's call.
        storage
            .cache_put("svc:old", &payload, Duration::days(-1))
            .await
            .unwrap();
        let stale = storage.cache_get("svc:old").await.unwrap().unwrap();
        assert!(stale.is_expired(Utc::now()));

        let swept = storage.delete_expired_cache(Utc::now()).await.unwrap();
        assert_eq!(swept, 1);
        assert!(storage.cache_get("svc:old").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn quota_increments_monotonically() {
        let storage = test_storage().await;
        for expected in 1..=4 {
            let count = storage.increment_quota("search").await.expect("increment");
            assert_eq!(count, expected);
        }
        let status = storage.quota_status("search", 50).await.unwrap();
        assert_eq!(status.used, 4);
        assert_eq!(status.remaining(), 46);
        assert!(status.available());
    }

    #[tokio::test]
    async fn quota_lazy_reset_counts_from_one() {
        let storage = test_storage().await;
        for _ in 0..5 {
            storage.increment_quota("search").await.unwrap();
        }
        // Pretend the month rolled over.
        storage
            .set_quota_reset_at("search", Utc::now() - Duration::hours(1))
            .await
            .unwrap();

        let count = storage.increment_quota("search").await.unwrap();
        assert_eq!(count, 1, "first call of the new period");

        let status = storage.quota_status("search", 50).await.unwrap();
        assert_eq!(status.used, 1);
        assert!(status.reset_at > Utc::now());
    }

    #[tokio::test]
    async fn quota_status_resets_without_increment() {
        let storage = test_storage().await;
        for _ in 0..3 {
            storage.increment_quota("scrape").await.unwrap();
        }
        storage
            .set_quota_reset_at("scrape", Utc::now() - Duration::hours(1))
            .await
            .unwrap();

        let status = storage.quota_status("scrape", 10).await.unwrap();
        assert_eq!(status.used, 0, "check alone applies the lazy reset");
    }

    #[test]
    fn embedding_blob_roundtrip() {
        let embedding = vec![0.25_f32, -1.5, 3.75, f32::MIN_POSITIVE];
        let blob = embedding_to_blob(&embedding);
        assert_eq!(blob.len(), 16);
        assert_eq!(blob_to_embedding(&blob), embedding);
    }

    #[test]
    fn month_boundary_math() {
        let mid = Utc.with_ymd_and_hms(2026, 8, 7, 12, 0, 0).unwrap();
        assert_eq!(
            next_month_start(mid),
            Utc.with_ymd_and_hms(2026, 9, 1, 0, 0, 0).unwrap()
        );
        let december = Utc.with_ymd_and_hms(2026, 12, 31, 23, 59, 59).unwrap();
        assert_eq!(
            next_month_start(december),
            Utc.with_ymd_and_hms(2027, 1, 1, 0, 0, 0).unwrap()
        );
    }
}

//! SQL migration definitions for the Waymark database.
//!
//! Migrations are applied in order on database open. Each migration has a
//! version number and a set of SQL statements executed as a batch.

/// A database migration with a version and SQL statements.
pub(crate) struct Migration {
    pub version: u32,
    pub description: &'static str,
    pub sql: &'static str,
}

/// All migrations, in ascending version order.
pub(crate) fn all_migrations() -> Vec<Migration> {
    vec![Migration {
        version: 1,
        description: "Initial schema: corridors, content_chunks, protocol_steps, api_cache, api_quota",
        sql: r#"
-- Schema version tracking
CREATE TABLE IF NOT EXISTS schema_migrations (
    version    INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Migration corridors and their research freshness state
CREATE TABLE IF NOT EXISTS corridors (
    id                 TEXT PRIMARY KEY,
    origin             TEXT NOT NULL,
    destination        TEXT NOT NULL,
    research_status    TEXT NOT NULL DEFAULT 'stale',
    last_researched_at TEXT,
    protocol_count     INTEGER NOT NULL DEFAULT 0,
    error_message      TEXT,
    created_at         TEXT NOT NULL,
    updated_at         TEXT NOT NULL,
    UNIQUE(origin, destination)
);

-- Ingested research content, one row per chunk
CREATE TABLE IF NOT EXISTS content_chunks (
    id           TEXT PRIMARY KEY,
    corridor_id  TEXT NOT NULL REFERENCES corridors(id) ON DELETE CASCADE,
    url          TEXT NOT NULL,
    title        TEXT NOT NULL,
    body         TEXT NOT NULL,
    source       TEXT NOT NULL,
    embedding    BLOB,
    author       TEXT,
    published_at TEXT,
    community    TEXT,
    scraped_at   TEXT NOT NULL,
    expires_at   TEXT NOT NULL,
    UNIQUE(corridor_id, url)
);

CREATE INDEX IF NOT EXISTS idx_chunks_corridor ON content_chunks(corridor_id);
CREATE INDEX IF NOT EXISTS idx_chunks_expiry ON content_chunks(expires_at);

-- Persisted, ordered checklist steps
CREATE TABLE IF NOT EXISTS protocol_steps (
    id               TEXT PRIMARY KEY,
    corridor_id      TEXT NOT NULL REFERENCES corridors(id) ON DELETE CASCADE,
    category         TEXT NOT NULL,
    title            TEXT NOT NULL,
    description      TEXT NOT NULL,
    status           TEXT NOT NULL DEFAULT 'not_started',
    priority         TEXT NOT NULL,
    ord              INTEGER NOT NULL,
    warnings_json    TEXT,
    tips_json        TEXT,
    attribution_json TEXT,
    generated        INTEGER NOT NULL DEFAULT 0,
    completed_at     TEXT,
    created_at       TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_steps_corridor ON protocol_steps(corridor_id, ord);

-- TTL'd cache for quota-gated upstream calls
CREATE TABLE IF NOT EXISTS api_cache (
    key        TEXT PRIMARY KEY,
    payload    TEXT NOT NULL,
    cached_at  TEXT NOT NULL,
    expires_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_cache_expiry ON api_cache(expires_at);

-- Monthly call budget per external service
CREATE TABLE IF NOT EXISTS api_quota (
    service      TEXT PRIMARY KEY,
    call_count   INTEGER NOT NULL DEFAULT 0,
    reset_at     TEXT NOT NULL,
    last_call_at TEXT
);

INSERT INTO schema_migrations (version) VALUES (1);
"#,
    }]
}

//! Quota-gated call gateway for paid/rate-limited upstream lookups.
//!
//! Every gated call runs through the same ladder: fresh cache hit first
//! (no quota spent); then the monthly budget check (lazily reset at the
//! month boundary); then the live call with a write-through cache. When
//! the budget is exhausted or the upstream call fails, the most recent
//! cached value — even expired — is returned with an explicit staleness
//! tag instead of a hard failure. The caller always learns which of these
//! happened.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Serialize, de::DeserializeOwned};
use sha2::{Digest, Sha256};
use waymark_storage::{QuotaStatus, Storage};
use waymark_shared::{Result, WaymarkError};

/// How the returned payload was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheState {
    /// Served from cache within its TTL; no quota consumed.
    CacheHit,
    /// Fetched live; quota consumed and cache written through.
    Live,
    /// Budget exhausted; served the last cached value past its TTL.
    StaleQuotaExceeded,
    /// Upstream call failed; served the last cached value instead.
    StaleUpstreamError,
}

impl CacheState {
    /// Whether the payload may be out of date.
    pub fn is_stale(&self) -> bool {
        matches!(self, Self::StaleQuotaExceeded | Self::StaleUpstreamError)
    }
}

/// A gated call result: the payload plus how it was obtained.
#[derive(Debug)]
pub struct Gated<T> {
    pub value: T,
    pub state: CacheState,
    /// When the served payload was originally cached, for `CacheHit` and
    /// stale states.
    pub cached_at: Option<DateTime<Utc>>,
    pub quota: QuotaStatus,
}

/// Gateway for one external service: a monthly budget plus a keyed TTL
/// cache. Construct once per service and share.
#[derive(Clone)]
pub struct QuotaGate {
    storage: Arc<Storage>,
    service: String,
    monthly_limit: u32,
    ttl: Duration,
}

impl QuotaGate {
    pub fn new(
        storage: Arc<Storage>,
        service: impl Into<String>,
        monthly_limit: u32,
        ttl_days: u32,
    ) -> Self {
        Self {
            storage,
            service: service.into(),
            monthly_limit,
            ttl: Duration::days(ttl_days as i64),
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    /// Current budget snapshot (applies the lazy monthly reset).
    pub async fn quota(&self) -> Result<QuotaStatus> {
        self.storage
            .quota_status(&self.service, self.monthly_limit)
            .await
    }

    /// Derive a stable cache key from request parts.
    pub fn cache_key(&self, parts: &[&str]) -> String {
        let mut hasher = Sha256::new();
        for part in parts {
            hasher.update(part.as_bytes());
            hasher.update([0x1f]);
        }
        format!("{}:{:x}", self.service, hasher.finalize())
    }

    /// Run `fetch` behind the cache and the monthly budget.
    pub async fn call<T, F, Fut>(&self, key: &str, fetch: F) -> Result<Gated<T>>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let now = Utc::now();
        let cached = self.storage.cache_get(key).await?;

        if let Some(entry) = cached.as_ref().filter(|e| !e.is_expired(now)) {
            return Ok(Gated {
                value: decode(&entry.payload)?,
                state: CacheState::CacheHit,
                cached_at: Some(entry.cached_at),
                quota: self.quota().await?,
            });
        }

        let quota = self.quota().await?;
        if !quota.available() {
            return match cached {
                Some(entry) => {
                    tracing::warn!(
                        service = %self.service,
                        used = quota.used,
                        limit = quota.limit,
                        "quota exhausted, serving stale cache"
                    );
                    Ok(Gated {
                        value: decode(&entry.payload)?,
                        state: CacheState::StaleQuotaExceeded,
                        cached_at: Some(entry.cached_at),
                        quota,
                    })
                }
                None => Err(WaymarkError::Provider(format!(
                    "{} quota exhausted ({}/{}) and no cached value; resets at {}",
                    self.service, quota.used, quota.limit, quota.reset_at
                ))),
            };
        }

        match fetch().await {
            Ok(value) => {
                self.storage.increment_quota(&self.service).await?;
                let payload = serde_json::to_value(&value)
                    .map_err(|e| WaymarkError::Provider(format!("unencodable payload: {e}")))?;
                self.storage.cache_put(key, &payload, self.ttl).await?;
                Ok(Gated {
                    value,
                    state: CacheState::Live,
                    cached_at: None,
                    quota: self.quota().await?,
                })
            }
            Err(err) => match cached {
                Some(entry) => {
                    tracing::warn!(
                        service = %self.service,
                        error = %err,
                        "upstream call failed, serving stale cache"
                    );
                    Ok(Gated {
                        value: decode(&entry.payload)?,
                        state: CacheState::StaleUpstreamError,
                        cached_at: Some(entry.cached_at),
                        quota,
                    })
                }
                None => Err(err),
            },
        }
    }
}

fn decode<T: DeserializeOwned>(payload: &serde_json::Value) -> Result<T> {
    serde_json::from_value(payload.clone())
        .map_err(|e| WaymarkError::Storage(format!("corrupt cached payload: {e}")))
}

//! Attribution validation, enrichment, scoring, and merging.
//!
//! Each synthesized step may carry at most one raw citation. A citation
//! with a malformed URL or negative engagement is discarded — the step
//! persists without attribution rather than with a broken one. When
//! several candidates compete for one step they are ranked by a weighted
//! score and merged.

use chrono::{DateTime, Utc};
use url::Url;
use waymark_shared::{Attribution, ContentChunk};

// Score weights, summing to 1.0.
const WEIGHT_ENGAGEMENT: f64 = 0.4;
const WEIGHT_RECENCY: f64 = 0.3;
const WEIGHT_AUTHORITY: f64 = 0.2;
const WEIGHT_SPECIFICITY: f64 = 0.1;

/// An attribution paired with its computed score.
#[derive(Debug, Clone)]
pub struct ScoredAttribution {
    pub attribution: Attribution,
    pub score: f64,
}

/// Trim strings and clamp engagement to ≥ 0.
pub fn normalize(attr: &Attribution) -> Attribution {
    Attribution {
        source_url: attr.source_url.trim().to_string(),
        author: attr
            .author
            .as_deref()
            .map(str::trim)
            .filter(|a| !a.is_empty())
            .map(String::from),
        engagement: attr.engagement.map(|e| e.max(0)),
        source_date: attr.source_date,
    }
}

/// An attribution is usable when its URL parses and engagement, if
/// present, is non-negative.
pub fn validate(attr: &Attribution) -> bool {
    if attr.source_url.is_empty() || Url::parse(&attr.source_url).is_err() {
        return false;
    }
    attr.engagement.is_none_or(|e| e >= 0)
}

/// Resolve a step's raw citation against the corridor's ingested corpus:
/// normalize, validate (discarding broken candidates), and backfill a
/// missing author from the matching stored chunk.
pub fn resolve(
    candidate: Option<&Attribution>,
    corpus: &[ContentChunk],
) -> Option<Attribution> {
    let raw = candidate?;
    let normalized = normalize(raw);
    if !validate(&normalized) {
        tracing::warn!(url = %raw.source_url, "discarding invalid attribution");
        return None;
    }

    let mut resolved = normalized;
    if resolved.author.is_none() {
        if let Some(chunk) = find_matching_chunk(&resolved.source_url, corpus) {
            resolved.author = chunk.metadata.author.clone();
        }
    }
    Some(resolved)
}

/// Match a source URL to a stored chunk: exact match on the normalized
/// URL first, then prefix match.
pub fn find_matching_chunk<'a>(
    source_url: &str,
    corpus: &'a [ContentChunk],
) -> Option<&'a ContentChunk> {
    let normalized = normalize_url(source_url);

    corpus
        .iter()
        .find(|c| normalize_url(&c.url) == normalized)
        .or_else(|| {
            corpus
                .iter()
                .find(|c| normalized.starts_with(&normalize_url(&c.url)))
        })
}

/// Strip fragments and trailing slashes so `#chunk-N` suffixes and
/// cosmetic differences don't defeat matching.
fn normalize_url(url: &str) -> String {
    match Url::parse(url) {
        Ok(parsed) => {
            let origin = parsed.origin().ascii_serialization();
            format!("{origin}{}", parsed.path())
                .trim_end_matches('/')
                .to_string()
        }
        Err(_) => url
            .split('#')
            .next()
            .unwrap_or(url)
            .trim_end_matches('/')
            .to_string(),
    }
}

/// Score an attribution 0–10 against engagement, recency, source
/// authority, and specificity.
pub fn score(
    attr: &Attribution,
    matching_chunk: Option<&ContentChunk>,
    now: DateTime<Utc>,
) -> f64 {
    let mut total = 0.0;

    // Log-scaled engagement: ~1000 upvotes saturates at 10 points.
    if let Some(engagement) = attr.engagement.filter(|e| *e > 0) {
        let engagement_score = (((engagement + 1) as f64).log10() * 3.33).min(10.0);
        total += engagement_score * WEIGHT_ENGAGEMENT;
    }

    // Recency buckets from the source date, falling back to the matched
    // chunk's published time.
    let published = attr
        .source_date
        .or_else(|| matching_chunk.and_then(|c| c.metadata.published_at));
    if let Some(published) = published {
        let age_days = (now - published).num_days();
        let recency_score = match age_days {
            i64::MIN..30 => 10.0,
            30..90 => 8.0,
            90..180 => 6.0,
            180..365 => 4.0,
            _ => 2.0,
        };
        total += recency_score * WEIGHT_RECENCY;
    }

    // Source authority (government > news > forum > blog > reddit).
    if let Some(chunk) = matching_chunk {
        total += chunk.source.authority() * WEIGHT_AUTHORITY;
    }

    // Specificity: a named author and a URL beat an anonymous mention.
    let mut specificity: f64 = 5.0;
    if attr.author.is_some() {
        specificity += 3.0;
    }
    if !attr.source_url.is_empty() {
        specificity += 2.0;
    }
    total += specificity.min(10.0) * WEIGHT_SPECIFICITY;

    total
}

/// Rank candidates best-first.
pub fn rank(
    candidates: &[Attribution],
    corpus: &[ContentChunk],
    now: DateTime<Utc>,
) -> Vec<ScoredAttribution> {
    let mut scored: Vec<ScoredAttribution> = candidates
        .iter()
        .map(|attr| {
            let matching = find_matching_chunk(&attr.source_url, corpus);
            ScoredAttribution {
                attribution: attr.clone(),
                score: score(attr, matching, now),
            }
        })
        .collect();
    scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    scored
}

/// Merge duplicate attributions for one step: keep the best-scoring
/// candidate's identity and, when `surface_max_engagement` is set, the
/// maximum engagement observed across all of them — a heavily-upvoted
/// mirror should not be hidden behind a lower-engagement duplicate.
pub fn merge(
    candidates: &[Attribution],
    corpus: &[ContentChunk],
    surface_max_engagement: bool,
    now: DateTime<Utc>,
) -> Option<Attribution> {
    match candidates {
        [] => None,
        [only] => Some(only.clone()),
        _ => {
            let ranked = rank(candidates, corpus, now);
            let best = ranked.first()?.attribution.clone();

            let highest_engagement = candidates
                .iter()
                .filter_map(|a| a.engagement)
                .max()
                .filter(|e| *e > 0);

            Some(Attribution {
                engagement: if surface_max_engagement {
                    highest_engagement.or(best.engagement)
                } else {
                    best.engagement
                },
                ..best
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use waymark_shared::{ChunkId, ChunkMetadata, CorridorId, SourceKind};

    fn attr(url: &str, author: Option<&str>, engagement: Option<i64>) -> Attribution {
        Attribution {
            source_url: url.into(),
            author: author.map(String::from),
            engagement,
            source_date: None,
        }
    }

    fn chunk(url: &str, source: SourceKind, author: Option<&str>) -> ContentChunk {
        let now = Utc::now();
        ContentChunk {
            id: ChunkId::new(),
            corridor_id: CorridorId::new(),
            url: url.into(),
            title: "title".into(),
            body: "body".into(),
            source,
            embedding: None,
            metadata: ChunkMetadata {
                author: author.map(String::from),
                published_at: Some(now - Duration::days(10)),
                community: None,
            },
            scraped_at: now,
            expires_at: now + Duration::days(30),
        }
    }

    #[test]
    fn malformed_url_is_discarded() {
        let resolved = resolve(Some(&attr("not a url", None, Some(5))), &[]);
        assert!(resolved.is_none());
    }

    #[test]
    fn negative_engagement_is_clamped_by_normalize_then_accepted() {
        // normalize clamps before validate sees it, so the candidate
        // survives with engagement 0.
        let resolved = resolve(
            Some(&attr("https://example.com/a", Some("ada"), Some(-3))),
            &[],
        )
        .expect("resolved");
        assert_eq!(resolved.engagement, Some(0));
    }

    #[test]
    fn validate_rejects_raw_negative_engagement() {
        assert!(!validate(&attr("https://example.com/a", None, Some(-1))));
        assert!(validate(&attr("https://example.com/a", None, None)));
    }

    #[test]
    fn author_backfilled_from_matching_chunk() {
        let corpus = vec![chunk(
            "https://reddit.com/r/germany/post#chunk-0",
            SourceKind::Reddit,
            Some("u/expat"),
        )];
        let resolved = resolve(
            Some(&attr("https://reddit.com/r/germany/post", None, Some(10))),
            &corpus,
        )
        .expect("resolved");
        assert_eq!(resolved.author.as_deref(), Some("u/expat"));
    }

    #[test]
    fn url_matching_ignores_fragments_and_trailing_slash() {
        let corpus = vec![chunk("https://example.com/guide/", SourceKind::Blog, None)];
        assert!(find_matching_chunk("https://example.com/guide#section-2", &corpus).is_some());
        assert!(find_matching_chunk("https://example.com/other", &corpus).is_none());
    }

    #[test]
    fn government_outranks_reddit_at_equal_engagement() {
        let now = Utc::now();
        let corpus = vec![
            chunk("https://www.bamf.gov/visa", SourceKind::Government, None),
            chunk("https://reddit.com/r/germany/x", SourceKind::Reddit, None),
        ];
        let gov = score(
            &attr("https://www.bamf.gov/visa", None, Some(50)),
            Some(&corpus[0]),
            now,
        );
        let reddit = score(
            &attr("https://reddit.com/r/germany/x", None, Some(50)),
            Some(&corpus[1]),
            now,
        );
        assert!(gov > reddit);
    }

    #[test]
    fn engagement_saturates_on_log_scale() {
        let now = Utc::now();
        let small = score(&attr("https://a.example", None, Some(10)), None, now);
        let large = score(&attr("https://a.example", None, Some(10_000)), None, now);
        let huge = score(&attr("https://a.example", None, Some(1_000_000)), None, now);
        assert!(large > small);
        // Well past ~1000 the engagement component is capped at 10 points.
        assert!((huge - large).abs() < 1e-9);
    }

    #[test]
    fn rank_orders_best_first() {
        let now = Utc::now();
        let candidates = vec![
            attr("https://a.example/low", None, Some(1)),
            attr("https://a.example/high", Some("ada"), Some(900)),
        ];
        let ranked = rank(&candidates, &[], now);
        assert_eq!(ranked[0].attribution.source_url, "https://a.example/high");
        assert!(ranked[0].score > ranked[1].score);
    }

    #[test]
    fn merge_surfaces_max_engagement_across_duplicates() {
        let now = Utc::now();
        let candidates = vec![
            attr("https://gov.example/official", Some("ministry"), Some(5)),
            attr("https://reddit.com/r/mirror", None, Some(2400)),
        ];
        let corpus = vec![chunk(
            "https://gov.example/official",
            SourceKind::Government,
            None,
        )];

        let merged = merge(&candidates, &corpus, true, now).expect("merged");
        assert_eq!(merged.source_url, "https://gov.example/official");
        assert_eq!(merged.engagement, Some(2400));

        let strict = merge(&candidates, &corpus, false, now).expect("merged");
        assert_eq!(strict.engagement, Some(5));
    }
}

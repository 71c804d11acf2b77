//! Three-stage deduplication: URL canonicalization, content hash, title similarity.
//!
//! Stages run in that fixed order so exact duplicates are never misreported
//! as similarity matches (see [`DedupMethod`](crate::domain::DedupMethod)).

use std::collections::HashSet;

use sha2::{Digest as Sha2Digest, Sha256};
use unicode_normalization::UnicodeNormalization;
use url::Url;
use uuid::Uuid;

use crate::domain::{DedupCluster, DedupMethod, RawItem};

/// Query parameters stripped during URL canonicalization. Case-insensitive.
const TRACKING_PARAMS: &[&str] = &[
    "utm_source",
    "utm_medium",
    "utm_campaign",
    "utm_term",
    "utm_content",
    "ref",
    "source",
    "fbclid",
    "gclid",
    "msclkid",
    "mc_cid",
    "mc_eid",
    "affiliate",
    "partner",
    "tracking",
    "_ga",
    "ncid",
    "sr_share",
];

/// Default similarity threshold above which two titles are treated as duplicates.
pub const DEFAULT_SIMILARITY_THRESHOLD: f64 = 0.85;

/// Lower-case scheme/host, strip the fragment and trailing slash, and drop
/// any tracking query parameter. Idempotent: `canonicalize_url(canonicalize_url(u)) == canonicalize_url(u)`.
pub fn canonicalize_url(raw: &str) -> String {
    let Ok(mut url) = Url::parse(raw) else {
        return raw.to_string();
    };

    let scheme = url.scheme().to_lowercase();
    let _ = url.set_scheme(&scheme);

    if let Some(host) = url.host_str() {
        let lower = host.to_lowercase();
        let _ = url.set_host(Some(&lower));
    }

    let tracking: HashSet<&str> = TRACKING_PARAMS.iter().copied().collect();
    let kept_pairs: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(k, _)| !tracking.contains(k.to_lowercase().as_str()))
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();

    if kept_pairs.is_empty() {
        url.set_query(None);
    } else {
        let mut pairs = url.query_pairs_mut();
        pairs.clear();
        for (k, v) in &kept_pairs {
            pairs.append_pair(k, v);
        }
        drop(pairs);
    }

    url.set_fragment(None);

    let path = url.path().trim_end_matches('/').to_string();
    let path = if path.is_empty() { "/".to_string() } else { path };
    url.set_path(&path);

    url.to_string()
}

/// NFKC-normalize, lowercase, replace non-alphanumeric/whitespace with spaces,
/// and collapse whitespace.
pub fn normalize_title(title: &str) -> String {
    let nfkc: String = title.nfkc().collect();
    let lower = nfkc.to_lowercase();
    let replaced: String = lower
        .chars()
        .map(|c| if c.is_alphanumeric() || c.is_whitespace() { c } else { ' ' })
        .collect();
    replaced.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// `SHA256(normalize_title(title) | date(published_at) | source)`.
///
/// `date_str` must already be formatted as `YYYY-MM-DD`, or be empty when
/// `published_at` is absent.
pub fn compute_content_hash(title: &str, date_str: &str, source: &str) -> String {
    let normalized = normalize_title(title);
    let payload = format!("{normalized}|{date_str}|{source}");
    let digest = Sha256::digest(payload.as_bytes());
    hex_encode(&digest)
}

fn hex_encode(bytes: &[u8]) -> String {
    let mut s = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        s.push_str(&format!("{:02x}", b));
    }
    s
}

/// Pluggable title-similarity strategy, selected at startup (see DESIGN.md).
pub trait TitleSimilarity: Send + Sync {
    /// Similarity score in `[0, 1]` between two already-normalized titles.
    fn similarity(&self, a: &str, b: &str) -> f64;
}

/// 64-bit SimHash over whitespace tokens; similarity is `1 - hamming/64`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SimHashSimilarity;

impl SimHashSimilarity {
    fn simhash(title: &str) -> u64 {
        let mut weights = [0i64; 64];
        for token in title.split_whitespace() {
            let h = fnv1a(token.as_bytes());
            for bit in 0..64u32 {
                if (h >> bit) & 1 == 1 {
                    weights[bit as usize] += 1;
                } else {
                    weights[bit as usize] -= 1;
                }
            }
        }
        let mut hash = 0u64;
        for (bit, w) in weights.iter().enumerate() {
            if *w > 0 {
                hash |= 1 << bit;
            }
        }
        hash
    }
}

fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf29ce484222325;
    for &b in bytes {
        hash ^= b as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}

impl TitleSimilarity for SimHashSimilarity {
    fn similarity(&self, a: &str, b: &str) -> f64 {
        let ha = Self::simhash(a);
        let hb = Self::simhash(b);
        let distance = (ha ^ hb).count_ones();
        1.0 - (distance as f64 / 64.0)
    }
}

/// Jaccard index over whitespace-token sets; used when SimHash is disabled.
#[derive(Debug, Default, Clone, Copy)]
pub struct JaccardSimilarity;

impl TitleSimilarity for JaccardSimilarity {
    fn similarity(&self, a: &str, b: &str) -> f64 {
        let sa: HashSet<&str> = a.split_whitespace().collect();
        let sb: HashSet<&str> = b.split_whitespace().collect();
        if sa.is_empty() && sb.is_empty() {
            return 1.0;
        }
        let intersection = sa.intersection(&sb).count();
        let union = sa.union(&sb).count();
        if union == 0 {
            0.0
        } else {
            intersection as f64 / union as f64
        }
    }
}

/// Outcome of running the three-stage pipeline over a batch of raw items.
pub struct DedupResult {
    pub kept: Vec<RawItem>,
    pub removed_count: usize,
    pub clusters: Vec<DedupCluster>,
}

/// Runs URL canonicalization, content hashing, and title similarity in order.
pub struct Deduplicator {
    similarity: Box<dyn TitleSimilarity>,
    threshold: f64,
}

impl Deduplicator {
    pub fn new(similarity: Box<dyn TitleSimilarity>) -> Self {
        Self {
            similarity,
            threshold: DEFAULT_SIMILARITY_THRESHOLD,
        }
    }

    /// Use SimHash, the preferred strategy.
    pub fn with_simhash() -> Self {
        Self::new(Box::new(SimHashSimilarity))
    }

    /// Use the Jaccard fallback.
    pub fn with_jaccard() -> Self {
        Self::new(Box::new(JaccardSimilarity))
    }

    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.threshold = threshold;
        self
    }

    /// Run all three stages in order; first occurrence wins at every stage.
    pub fn deduplicate(&self, items: Vec<RawItem>) -> DedupResult {
        let input_len = items.len();
        let mut clusters = Vec::new();

        let (kept, url_clusters) = self.url_dedup(items);
        clusters.extend(url_clusters);

        let (kept, hash_clusters) = self.hash_dedup(kept);
        clusters.extend(hash_clusters);

        let (kept, sim_clusters) = self.similarity_dedup(kept);
        clusters.extend(sim_clusters);

        let removed_count = input_len - kept.len();
        DedupResult {
            kept,
            removed_count,
            clusters,
        }
    }

    fn url_dedup(&self, items: Vec<RawItem>) -> (Vec<RawItem>, Vec<DedupCluster>) {
        let mut seen: std::collections::HashMap<String, usize> = std::collections::HashMap::new();
        let mut kept: Vec<RawItem> = Vec::new();
        let mut clusters: Vec<DedupCluster> = Vec::new();

        for item in items {
            let canonical = canonicalize_url(&item.url);
            if let Some(&idx) = seen.get(&canonical) {
                let rep_url = kept[idx].url.clone();
                push_member(&mut clusters, &rep_url, DedupMethod::UrlExact, &item.url, None);
            } else {
                seen.insert(canonical, kept.len());
                kept.push(item);
            }
        }
        (kept, clusters)
    }

    fn hash_dedup(&self, items: Vec<RawItem>) -> (Vec<RawItem>, Vec<DedupCluster>) {
        let mut seen: std::collections::HashMap<String, usize> = std::collections::HashMap::new();
        let mut kept: Vec<RawItem> = Vec::new();
        let mut clusters: Vec<DedupCluster> = Vec::new();

        for item in items {
            let date_str = item
                .published_at
                .map(|dt| dt.format("%Y-%m-%d").to_string())
                .unwrap_or_default();
            let hash = compute_content_hash(&item.title, &date_str, &item.source);
            if let Some(&idx) = seen.get(&hash) {
                let rep_url = kept[idx].url.clone();
                push_member(&mut clusters, &rep_url, DedupMethod::HashMatch, &item.url, None);
            } else {
                seen.insert(hash, kept.len());
                kept.push(item);
            }
        }
        (kept, clusters)
    }

    fn similarity_dedup(&self, items: Vec<RawItem>) -> (Vec<RawItem>, Vec<DedupCluster>) {
        let mut kept: Vec<RawItem> = Vec::new();
        let mut kept_normalized: Vec<String> = Vec::new();
        let mut clusters: Vec<DedupCluster> = Vec::new();

        'outer: for item in items {
            let normalized = normalize_title(&item.title);
            for (idx, existing_norm) in kept_normalized.iter().enumerate() {
                let score = self.similarity.similarity(existing_norm, &normalized);
                if score >= self.threshold {
                    let rep_url = kept[idx].url.clone();
                    push_member(
                        &mut clusters,
                        &rep_url,
                        DedupMethod::Similarity,
                        &item.url,
                        Some(score),
                    );
                    continue 'outer;
                }
            }
            kept_normalized.push(normalized);
            kept.push(item);
        }

        (kept, clusters)
    }
}

fn push_member(
    clusters: &mut Vec<DedupCluster>,
    representative_url: &str,
    method: DedupMethod,
    member_url: &str,
    similarity_score: Option<f64>,
) {
    if let Some(cluster) = clusters
        .iter_mut()
        .find(|c| c.representative_url == representative_url && c.dedup_method == method)
    {
        cluster.member_urls.push(member_url.to_string());
        return;
    }
    clusters.push(DedupCluster {
        cluster_id: Uuid::new_v4(),
        representative_url: representative_url.to_string(),
        member_urls: vec![member_url.to_string()],
        dedup_method: method,
        similarity_score,
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::SourceType;
    use chrono::{TimeZone, Utc};

    fn raw(url: &str, title: &str, source: &str, published: i64) -> RawItem {
        RawItem {
            source: source.to_string(),
            source_type: SourceType::News,
            external_id: None,
            url: url.to_string(),
            title: title.to_string(),
            summary: None,
            published_at: Some(Utc.timestamp_opt(published, 0).unwrap()),
            fetched_at: Utc::now(),
            tickers: vec!["NVDA".into()],
            raw_payload: serde_json::json!({}),
            author: None,
            category: None,
            image_url: None,
        }
    }

    #[test]
    fn test_canonicalize_url_strips_tracking_and_lowercases() {
        let out = canonicalize_url(
            "https://Example.com/News/Article?utm_source=twitter&ref=123&page=1",
        );
        assert!(out.starts_with("https://example.com/News/Article"));
        assert!(out.contains("page=1"));
        assert!(!out.contains("utm_source"));
        assert!(!out.contains("ref="));
    }

    #[test]
    fn test_canonicalize_url_idempotent() {
        let once = canonicalize_url("https://Example.com/a/?utm_source=x&y=1#frag");
        let twice = canonicalize_url(&once);
        assert_eq!(once, twice);
    }

    #[test]
    fn test_canonicalize_url_strips_fragment_and_trailing_slash() {
        let out = canonicalize_url("https://example.com/path/#section");
        assert_eq!(out, "https://example.com/path");
    }

    #[test]
    fn test_normalize_title_collapses_and_strips_punctuation() {
        assert_eq!(
            normalize_title("NVIDIA Reports: Record Q4 Revenue!!"),
            "nvidia reports record q4 revenue"
        );
    }

    #[test]
    fn test_normalize_title_deterministic() {
        let title = "Some  Title -- With Punctuation?!";
        assert_eq!(normalize_title(title), normalize_title(title));
    }

    #[test]
    fn test_content_hash_equal_for_equal_inputs() {
        let h1 = compute_content_hash("Nvidia Reports Record Q4 Revenue", "2026-01-05", "finnhub");
        let h2 = compute_content_hash("nvidia reports record q4 revenue", "2026-01-05", "finnhub");
        assert_eq!(h1, h2);
    }

    #[test]
    fn test_content_hash_differs_on_source() {
        let h1 = compute_content_hash("Title", "2026-01-05", "finnhub");
        let h2 = compute_content_hash("Title", "2026-01-05", "sec-edgar");
        assert_ne!(h1, h2);
    }

    #[test]
    fn test_jaccard_similarity_identical_titles() {
        let sim = JaccardSimilarity;
        assert_eq!(sim.similarity("nvidia reports earnings", "nvidia reports earnings"), 1.0);
    }

    #[test]
    fn test_simhash_similarity_identical_titles() {
        let sim = SimHashSimilarity;
        assert_eq!(sim.similarity("nvidia reports earnings", "nvidia reports earnings"), 1.0);
    }

    #[test]
    fn test_dedup_stage_precedence_url_before_hash() {
        let dedup = Deduplicator::with_jaccard();
        let items = vec![
            raw("https://example.com/a?utm_source=x", "Nvidia Q4 Earnings", "finnhub", 1000),
            raw("https://example.com/a", "Totally Different Headline", "finnhub", 1000),
        ];
        let result = dedup.deduplicate(items);
        assert_eq!(result.kept.len(), 1);
        assert_eq!(result.clusters.len(), 1);
        assert_eq!(result.clusters[0].dedup_method, DedupMethod::UrlExact);
    }

    #[test]
    fn test_dedup_hash_match_same_day_same_title() {
        let dedup = Deduplicator::with_jaccard();
        let items = vec![
            raw("https://a.com/1", "Nvidia reports record Q4 revenue", "finnhub", 1_700_000_000),
            raw("https://b.com/2", "NVIDIA REPORTS RECORD Q4 REVENUE", "finnhub", 1_700_000_000),
        ];
        let result = dedup.deduplicate(items);
        assert_eq!(result.kept.len(), 1);
        assert_eq!(result.removed_count, 1);
        assert_eq!(result.clusters[0].dedup_method, DedupMethod::HashMatch);
    }

    #[test]
    fn test_dedup_similarity_stage_catches_near_duplicates() {
        let dedup = Deduplicator::with_jaccard().with_threshold(0.6);
        let items = vec![
            raw("https://a.com/1", "Nvidia beats earnings estimates handily", "finnhub", 1000),
            raw("https://b.com/2", "Nvidia beats earnings estimates by a wide margin", "reuters", 2000),
        ];
        let result = dedup.deduplicate(items);
        assert_eq!(result.kept.len(), 1);
        assert_eq!(result.clusters[0].dedup_method, DedupMethod::Similarity);
        assert!(result.clusters[0].similarity_score.unwrap() >= 0.6);
    }

    #[test]
    fn test_dedup_non_inflation() {
        let dedup = Deduplicator::with_jaccard();
        let items = vec![
            raw("https://a.com/1", "Headline One", "finnhub", 1000),
            raw("https://a.com/1", "Headline One Duplicate Url", "finnhub", 1000),
            raw("https://b.com/2", "Completely Unrelated Headline Two", "sec-edgar", 2000),
        ];
        let input_len = items.len();
        let result = dedup.deduplicate(items);
        assert_eq!(result.kept.len() + result.removed_count, input_len);
    }

    #[test]
    fn test_dedup_preserves_first_occurrence_order() {
        let dedup = Deduplicator::with_jaccard();
        let items = vec![
            raw("https://a.com/1", "First Item", "finnhub", 1000),
            raw("https://b.com/2", "Second Item", "finnhub", 2000),
        ];
        let result = dedup.deduplicate(items);
        assert_eq!(result.kept[0].url, "https://a.com/1");
        assert_eq!(result.kept[1].url, "https://b.com/2");
    }
}

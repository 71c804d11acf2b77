//! Maps a deduplicated [`RawItem`] to a persistable [`NewsItem`].
//!
//! Credibility follows a fixed rule (`source_type == filing ⇒ high`) with a
//! per-source lookup table otherwise; unknown sources default to `low`.

use std::collections::HashMap;

use chrono::Utc;
use uuid::Uuid;

use crate::dedup::{canonicalize_url, compute_content_hash, normalize_title};
use crate::domain::{Credibility, NewsItem, RawItem, SourceType};

/// Per-source default credibility, consulted only when `source_type != filing`.
pub struct CredibilityTable {
    table: HashMap<String, Credibility>,
}

impl CredibilityTable {
    pub fn new() -> Self {
        let mut table = HashMap::new();
        table.insert("finnhub".to_string(), Credibility::Medium);
        Self { table }
    }

    pub fn insert(&mut self, source: impl Into<String>, credibility: Credibility) {
        self.table.insert(source.into(), credibility);
    }

    fn lookup(&self, source: &str) -> Credibility {
        self.table.get(source).copied().unwrap_or(Credibility::Low)
    }
}

impl Default for CredibilityTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Assign credibility per §4.4's rule: filings are always high; everything
/// else looks up the per-source table with a `low` default.
pub fn assign_credibility(source_type: SourceType, source: &str, table: &CredibilityTable) -> Credibility {
    match source_type {
        SourceType::Filing => Credibility::High,
        SourceType::News => table.lookup(source),
    }
}

/// Normalize one raw item into a [`NewsItem`]. Never fails: callers should
/// skip/log per-item rather than abort the batch on malformed input, so this
/// function fills defaults (e.g. `published_at ← now()`) instead of erroring.
pub fn normalize(raw: &RawItem, table: &CredibilityTable) -> NewsItem {
    let canonical_url = canonicalize_url(&raw.url);
    let title_normalized = normalize_title(&raw.title);
    let published_at = raw.published_at.unwrap_or_else(Utc::now);
    let date_str = published_at.format("%Y-%m-%d").to_string();
    let content_hash = compute_content_hash(&raw.title, &date_str, &raw.source);
    let credibility = assign_credibility(raw.source_type, &raw.source, table);

    NewsItem {
        id: Uuid::new_v4(),
        canonical_url,
        title: raw.title.clone(),
        title_normalized,
        content_hash,
        summary: raw.summary.clone(),
        published_at,
        source: raw.source.clone(),
        source_type: raw.source_type,
        credibility,
        tickers: raw.tickers.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(source: &str, source_type: SourceType) -> RawItem {
        RawItem {
            source: source.to_string(),
            source_type,
            external_id: None,
            url: "https://example.com/a?utm_source=x".to_string(),
            title: "Some Headline".to_string(),
            summary: None,
            published_at: None,
            fetched_at: Utc::now(),
            tickers: vec!["NVDA".to_string()],
            raw_payload: serde_json::json!({}),
            author: None,
            category: None,
            image_url: None,
        }
    }

    #[test]
    fn test_filing_always_high_credibility() {
        let table = CredibilityTable::new();
        let item = raw("sec-edgar", SourceType::Filing);
        let news = normalize(&item, &table);
        assert_eq!(news.credibility, Credibility::High);
    }

    #[test]
    fn test_known_news_source_uses_table() {
        let table = CredibilityTable::new();
        let item = raw("finnhub", SourceType::News);
        let news = normalize(&item, &table);
        assert_eq!(news.credibility, Credibility::Medium);
    }

    #[test]
    fn test_unknown_news_source_defaults_low() {
        let table = CredibilityTable::new();
        let item = raw("unknown-blog", SourceType::News);
        let news = normalize(&item, &table);
        assert_eq!(news.credibility, Credibility::Low);
    }

    #[test]
    fn test_normalize_strips_tracking_params_from_canonical_url() {
        let table = CredibilityTable::new();
        let item = raw("finnhub", SourceType::News);
        let news = normalize(&item, &table);
        assert!(!news.canonical_url.contains("utm_source"));
    }

    #[test]
    fn test_normalize_fills_missing_published_at() {
        let table = CredibilityTable::new();
        let item = raw("finnhub", SourceType::News);
        let news = normalize(&item, &table);
        assert!(news.published_at <= Utc::now());
    }
}

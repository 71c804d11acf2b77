//! Collector contract and concrete collectors.
//!
//! A [`Collector`] fetches [`RawItem`]s for a set of tickers over a time
//! window from one upstream source. Fan-out across tickers is concurrent;
//! a single ticker's failure is isolated and logged rather than aborting
//! the whole batch (mirrors the original's `asyncio.gather(..., return_exceptions=True)`).

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde_json::Value;

use crate::domain::{Credibility, RawItem, SourceType};
use crate::error::Result;
use crate::rate_limit::RateLimiter;
use crate::PipelineError;

/// Source of fetched items, with its declared trust level and shape.
#[async_trait]
pub trait Collector: Send + Sync {
    /// Short machine-readable name, e.g. `"finnhub"`.
    fn source(&self) -> &'static str;
    fn source_type(&self) -> SourceType;
    fn credibility(&self) -> Credibility;

    /// Fetch raw items for `tickers` published between `since` and `until`
    /// (default "now" when `None`). Implementations must deduplicate by URL
    /// within their own returned batch.
    async fn collect(
        &self,
        tickers: &[String],
        since: DateTime<Utc>,
        until: Option<DateTime<Utc>>,
    ) -> Result<Vec<RawItem>>;

    /// Convenience wrapper for a single ticker.
    async fn collect_single(
        &self,
        ticker: &str,
        since: DateTime<Utc>,
        until: Option<DateTime<Utc>>,
    ) -> Result<Vec<RawItem>> {
        self.collect(std::slice::from_ref(&ticker.to_string()), since, until)
            .await
    }
}

fn dedup_by_url(items: Vec<RawItem>) -> Vec<RawItem> {
    let mut seen = HashSet::new();
    items
        .into_iter()
        .filter(|item| seen.insert(item.url.clone()))
        .collect()
}

/// Fans out `per_ticker` calls concurrently, logging and dropping any
/// ticker whose call failed rather than aborting the whole batch.
async fn fan_out_per_ticker<F, Fut>(tickers: &[String], per_ticker: F) -> Vec<RawItem>
where
    F: Fn(String) -> Fut,
    Fut: std::future::Future<Output = Result<Vec<RawItem>>>,
{
    let futures = tickers.iter().cloned().map(per_ticker);
    let results = futures::future::join_all(futures).await;

    let mut items = Vec::new();
    for (ticker, result) in tickers.iter().zip(results) {
        match result {
            Ok(mut batch) => items.append(&mut batch),
            Err(e) => {
                tracing::warn!(ticker, error = %e, "collector failed for ticker, skipping");
            }
        }
    }
    items
}

/// Company news and general market news from Finnhub.
pub struct FinnhubCollector {
    client: Client,
    limiter: Arc<RateLimiter>,
    api_key: String,
    base_url: String,
}

impl FinnhubCollector {
    pub fn new(client: Client, limiter: Arc<RateLimiter>, api_key: impl Into<String>) -> Self {
        Self {
            client,
            limiter,
            api_key: api_key.into(),
            base_url: "https://finnhub.io/api/v1".to_string(),
        }
    }

    fn parse_item(&self, ticker: &str, raw: &Value) -> Option<RawItem> {
        let url = raw.get("url")?.as_str()?.to_string();
        let headline = raw.get("headline").and_then(Value::as_str).unwrap_or_default();
        let summary = raw.get("summary").and_then(Value::as_str).map(String::from);
        let datetime = raw.get("datetime").and_then(Value::as_i64);
        let published_at = datetime.and_then(|ts| DateTime::from_timestamp(ts, 0));
        let related = raw
            .get("related")
            .and_then(Value::as_str)
            .map(|s| {
                s.split(',')
                    .map(str::trim)
                    .filter(|t| !t.is_empty())
                    .map(str::to_string)
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();

        let mut tickers = related;
        if !tickers.iter().any(|t| t == ticker) {
            tickers.insert(0, ticker.to_string());
        }

        Some(RawItem {
            source: self.source().to_string(),
            source_type: SourceType::News,
            external_id: raw.get("id").map(|v| v.to_string()),
            url,
            title: headline.to_string(),
            summary,
            published_at,
            fetched_at: Utc::now(),
            tickers,
            raw_payload: raw.clone(),
            author: raw.get("source").and_then(Value::as_str).map(String::from),
            category: raw.get("category").and_then(Value::as_str).map(String::from),
            image_url: raw.get("image").and_then(Value::as_str).map(String::from),
        })
    }
}

#[async_trait]
impl Collector for FinnhubCollector {
    fn source(&self) -> &'static str {
        "finnhub"
    }

    fn source_type(&self) -> SourceType {
        SourceType::News
    }

    fn credibility(&self) -> Credibility {
        Credibility::Medium
    }

    async fn collect(
        &self,
        tickers: &[String],
        since: DateTime<Utc>,
        until: Option<DateTime<Utc>>,
    ) -> Result<Vec<RawItem>> {
        let until = until.unwrap_or_else(Utc::now);
        let from = since.format("%Y-%m-%d").to_string();
        let to = until.format("%Y-%m-%d").to_string();

        let items = fan_out_per_ticker(tickers, |ticker| {
            let client = self.client.clone();
            let limiter = self.limiter.clone();
            let api_key = self.api_key.clone();
            let base_url = self.base_url.clone();
            let from = from.clone();
            let to = to.clone();
            async move {
                let url = format!(
                    "{base_url}/company-news?symbol={ticker}&from={from}&to={to}&token={api_key}"
                );
                let body: Value = limiter
                    .execute("finnhub", 3, || {
                        let client = client.clone();
                        let url = url.clone();
                        async move { send_get(&client, &url).await }
                    })
                    .await?;

                let raw_items = body.as_array().cloned().unwrap_or_default();
                Ok(raw_items
                    .iter()
                    .filter_map(|raw| self.parse_item(&ticker, raw))
                    .collect())
            }
        })
        .await;

        Ok(dedup_by_url(items))
    }
}

/// SEC EDGAR full-text-search filings collector. Requires a mandatory
/// `User-Agent` per SEC's access policy.
pub struct SecEdgarCollector {
    client: Client,
    limiter: Arc<RateLimiter>,
    user_agent: String,
    base_url: String,
}

impl SecEdgarCollector {
    pub fn new(client: Client, limiter: Arc<RateLimiter>, user_agent: impl Into<String>) -> Self {
        Self {
            client,
            limiter,
            user_agent: user_agent.into(),
            base_url: "https://efts.sec.gov/LATEST/search-index".to_string(),
        }
    }
}

#[async_trait]
impl Collector for SecEdgarCollector {
    fn source(&self) -> &'static str {
        "sec-edgar"
    }

    fn source_type(&self) -> SourceType {
        SourceType::Filing
    }

    fn credibility(&self) -> Credibility {
        Credibility::High
    }

    async fn collect(
        &self,
        tickers: &[String],
        since: DateTime<Utc>,
        until: Option<DateTime<Utc>>,
    ) -> Result<Vec<RawItem>> {
        let until = until.unwrap_or_else(Utc::now);
        let from = since.format("%Y-%m-%d").to_string();
        let to = until.format("%Y-%m-%d").to_string();

        let items = fan_out_per_ticker(tickers, |ticker| {
            let client = self.client.clone();
            let limiter = self.limiter.clone();
            let user_agent = self.user_agent.clone();
            let base_url = self.base_url.clone();
            let from = from.clone();
            let to = to.clone();
            async move {
                let url = format!(
                    "{base_url}?q={ticker}&dateRange=custom&startdt={from}&enddt={to}&forms=8-K,10-Q,10-K"
                );
                let body: Value = limiter
                    .execute("sec", 3, || {
                        let client = client.clone();
                        let url = url.clone();
                        let user_agent = user_agent.clone();
                        async move { send_get_with_ua(&client, &url, &user_agent).await }
                    })
                    .await?;

                let hits = body
                    .get("hits")
                    .and_then(|h| h.get("hits"))
                    .and_then(Value::as_array)
                    .cloned()
                    .unwrap_or_default();

                Ok(hits
                    .iter()
                    .filter_map(|hit| parse_filing(&ticker, hit))
                    .collect())
            }
        })
        .await;

        Ok(dedup_by_url(items))
    }
}

fn parse_filing(ticker: &str, hit: &Value) -> Option<RawItem> {
    let source = hit.get("_source")?;
    let accession = source.get("_id").and_then(Value::as_str).unwrap_or_default();
    let form_type = source.get("form").and_then(Value::as_str).unwrap_or("filing");
    let company = source.get("display_names").and_then(Value::as_array).and_then(|a| a.first()).and_then(Value::as_str);
    let filed = source.get("file_date").and_then(Value::as_str);
    let published_at = filed.and_then(|d| {
        chrono::NaiveDate::parse_from_str(d, "%Y-%m-%d")
            .ok()
            .and_then(|nd| nd.and_hms_opt(0, 0, 0))
            .map(|ndt| ndt.and_utc())
    });

    let url = format!("https://www.sec.gov/cgi-bin/browse-edgar?action=getcompany&filing={accession}");
    let title = format!("{form_type} filing{}", company.map(|c| format!(" — {c}")).unwrap_or_default());

    Some(RawItem {
        source: "sec-edgar".to_string(),
        source_type: SourceType::Filing,
        external_id: Some(accession.to_string()),
        url,
        title,
        summary: None,
        published_at,
        fetched_at: Utc::now(),
        tickers: vec![ticker.to_string()],
        raw_payload: hit.clone(),
        author: None,
        category: Some(form_type.to_string()),
        image_url: None,
    })
}

async fn send_get(client: &Client, url: &str) -> Result<Value> {
    let resp = client.get(url).send().await?;
    handle_response(resp).await
}

async fn send_get_with_ua(client: &Client, url: &str, user_agent: &str) -> Result<Value> {
    let resp = client.get(url).header("User-Agent", user_agent).send().await?;
    handle_response(resp).await
}

async fn handle_response(resp: reqwest::Response) -> Result<Value> {
    let status = resp.status().as_u16();
    if !resp.status().is_success() {
        let retry_after = resp
            .headers()
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(crate::rate_limit::parse_retry_after);
        let body = resp.text().await.unwrap_or_default();
        return Err(PipelineError::HttpError {
            status,
            body,
            retry_after,
        });
    }
    Ok(resp.json().await?)
}

/// Deterministic test collector returning a fixed batch regardless of input.
pub struct MockCollector {
    pub source: &'static str,
    pub source_type: SourceType,
    pub credibility: Credibility,
    pub items: Vec<RawItem>,
}

#[async_trait]
impl Collector for MockCollector {
    fn source(&self) -> &'static str {
        self.source
    }

    fn source_type(&self) -> SourceType {
        self.source_type
    }

    fn credibility(&self) -> Credibility {
        self.credibility
    }

    async fn collect(
        &self,
        _tickers: &[String],
        _since: DateTime<Utc>,
        _until: Option<DateTime<Utc>>,
    ) -> Result<Vec<RawItem>> {
        Ok(self.items.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(url: &str, tickers: &[&str]) -> RawItem {
        RawItem {
            source: "mock".into(),
            source_type: SourceType::News,
            external_id: None,
            url: url.into(),
            title: "Title".into(),
            summary: None,
            published_at: None,
            fetched_at: Utc::now(),
            tickers: tickers.iter().map(|t| t.to_string()).collect(),
            raw_payload: serde_json::json!({}),
            author: None,
            category: None,
            image_url: None,
        }
    }

    #[tokio::test]
    async fn test_mock_collector_returns_fixed_items() {
        let collector = MockCollector {
            source: "mock",
            source_type: SourceType::News,
            credibility: Credibility::Medium,
            items: vec![raw("https://example.com/a", &["NVDA"])],
        };
        let result = collector
            .collect(&["NVDA".to_string()], Utc::now(), None)
            .await
            .unwrap();
        assert_eq!(result.len(), 1);
    }

    #[test]
    fn test_dedup_by_url_keeps_first() {
        let items = vec![raw("https://a.com/1", &["NVDA"]), raw("https://a.com/1", &["AMD"])];
        let deduped = dedup_by_url(items);
        assert_eq!(deduped.len(), 1);
        assert_eq!(deduped[0].tickers, vec!["NVDA".to_string()]);
    }

    #[test]
    fn test_parse_filing_builds_title_with_company() {
        let hit = serde_json::json!({
            "_id": "0001-23-456789",
            "_source": {
                "_id": "0001-23-456789",
                "form": "8-K",
                "display_names": ["NVIDIA CORP"],
                "file_date": "2026-03-01",
            }
        });
        let item = parse_filing("NVDA", &hit).unwrap();
        assert_eq!(item.source_type, SourceType::Filing);
        assert!(item.title.contains("8-K"));
        assert!(item.title.contains("NVIDIA CORP"));
    }
}

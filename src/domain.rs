//! Core data model: watchlist entries, raw/normalized news items, analysis
//! results, dedup clusters, pipeline runs, and delivery logs.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A single tracked ticker with its investment thesis.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WatchlistEntry {
    pub ticker: String,
    pub company_name: String,
    pub thesis: String,
    #[serde(default)]
    pub risk_tags: Vec<String>,
    #[serde(default = "default_priority")]
    pub priority: u8,
    #[serde(default)]
    pub sector: Option<String>,
}

fn default_priority() -> u8 {
    3
}

/// The kind of upstream source a raw item came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    News,
    Filing,
}

/// Editorial trust assigned to a source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Credibility {
    High,
    Medium,
    Low,
}

/// Unprocessed item as fetched from a collector, before dedup/normalization.
///
/// `author`, `category`, and `image_url` are auxiliary metadata carried
/// through from the upstream API (present on Finnhub's payload) that no
/// dedup/normalize/analysis invariant depends on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawItem {
    pub source: String,
    pub source_type: SourceType,
    pub external_id: Option<String>,
    pub url: String,
    pub title: String,
    pub summary: Option<String>,
    pub published_at: Option<DateTime<Utc>>,
    pub fetched_at: DateTime<Utc>,
    pub tickers: Vec<String>,
    pub raw_payload: serde_json::Value,
    pub author: Option<String>,
    pub category: Option<String>,
    pub image_url: Option<String>,
}

impl RawItem {
    /// Ensure `ticker` appears in the tickers list, inserting it first if absent.
    ///
    /// Mirrors the upstream collector's guarantee that the queried ticker is
    /// always represented even when the provider's "related symbols" field omits it.
    pub fn ensure_primary_ticker(&mut self, ticker: &str) {
        if !self.tickers.iter().any(|t| t == ticker) {
            self.tickers.insert(0, ticker.to_string());
        }
    }
}

/// A deduplicated, normalized news or filing item.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewsItem {
    pub id: Uuid,
    pub canonical_url: String,
    pub title: String,
    pub title_normalized: String,
    pub content_hash: String,
    pub summary: Option<String>,
    pub published_at: DateTime<Utc>,
    pub source: String,
    pub source_type: SourceType,
    pub credibility: Credibility,
    pub tickers: Vec<String>,
}

/// Enumerated classification of an analyzed news item's nature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Earnings,
    Guidance,
    Regulatory,
    Contract,
    Product,
    Accident,
    Macro,
    Rumor,
    Other,
}

/// Directional market impact implied by the item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImpactDirection {
    Bullish,
    Bearish,
    Neutral,
}

/// Expected time horizon for the impact to materialize.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImpactHorizon {
    Short,
    Medium,
    Long,
}

/// Relation of the item to a ticker's stated investment thesis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThesisRelation {
    Supports,
    Weakens,
    Unrelated,
}

/// Confidence the model assigns to its own classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    High,
    Medium,
    Low,
}

/// The strict, schema-validated output of an LLM analysis call.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AnalysisResult {
    pub news_item_id: Uuid,
    pub provider: String,
    pub model: String,
    pub prompt_version: String,
    pub event_type: EventType,
    pub impact_direction: ImpactDirection,
    pub impact_horizon: ImpactHorizon,
    pub thesis_relation: ThesisRelation,
    pub confidence: Confidence,
    pub confidence_reason: String,
    pub summary: String,
    pub key_facts: Vec<String>,
    pub watch_next: String,
    pub tokens_used: u32,
    pub cost_usd: f64,
}

/// Length/count caps enforced on [`AnalysisResult`] string/list fields.
pub mod limits {
    pub const CONFIDENCE_REASON_MAX: usize = 100;
    pub const SUMMARY_MAX: usize = 100;
    pub const KEY_FACTS_MAX_ITEMS: usize = 3;
    pub const KEY_FACT_MAX: usize = 200;
    pub const WATCH_NEXT_MAX: usize = 50;
}

/// Second-pass synthesis over all of one ticker's analyzed items for a run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TickerSummary {
    pub ticker: String,
    pub company_name: String,
    pub news_count: u32,
    pub overall_sentiment: OverallSentiment,
    pub summary: String,
    pub key_events: Vec<String>,
    pub thesis_impact: String,
    pub action_suggestion: String,
    pub risk_alerts: Vec<String>,
    pub bullish_count: u32,
    pub bearish_count: u32,
    pub neutral_count: u32,
}

/// Aggregate sentiment across a ticker's items for one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverallSentiment {
    Bullish,
    Bearish,
    Neutral,
    Mixed,
}

/// How a duplicate item was identified relative to its surviving representative.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DedupMethod {
    UrlExact,
    HashMatch,
    Similarity,
}

/// A cluster of items collapsed into one surviving representative.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DedupCluster {
    pub cluster_id: Uuid,
    pub representative_url: String,
    pub member_urls: Vec<String>,
    pub dedup_method: DedupMethod,
    pub similarity_score: Option<f64>,
}

/// Lifecycle status of a pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Success,
    Partial,
    Failed,
}

/// Per-stage counters tracked across one pipeline run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunCounters {
    pub raw_collected: u32,
    pub after_normalize: u32,
    pub after_dedup: u32,
    pub analyzed_success: u32,
    pub analyzed_failed: u32,
    pub delivered: u32,
}

/// The persisted record of one end-to-end pipeline execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineRun {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub status: RunStatus,
    pub counters: RunCounters,
    pub error_log: Option<String>,
}

impl PipelineRun {
    pub fn new(run_id: Uuid) -> Self {
        Self {
            run_id,
            started_at: Utc::now(),
            finished_at: None,
            status: RunStatus::Running,
            counters: RunCounters::default(),
            error_log: None,
        }
    }
}

/// Delivery outcome of one digest against one output channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    Pending,
    Success,
    Failed,
    Retrying,
}

/// Record of one delivery attempt against one channel, for one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryLog {
    pub id: Uuid,
    pub run_id: Uuid,
    pub channel: String,
    pub status: DeliveryStatus,
    pub error_message: Option<String>,
    pub retry_count: u32,
    pub channel_ref: Option<String>,
}

impl DeliveryLog {
    /// Start a pending delivery record with its id already bound, so a later
    /// failure handler always has a valid id to update (see DESIGN.md open
    /// question #1 on the original's unbound-id bug).
    pub fn pending(run_id: Uuid, channel: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            run_id,
            channel: channel.into(),
            status: DeliveryStatus::Pending,
            error_message: None,
            retry_count: 0,
            channel_ref: None,
        }
    }

    pub fn mark_success(&mut self, channel_ref: impl Into<String>) {
        self.status = DeliveryStatus::Success;
        self.channel_ref = Some(channel_ref.into());
    }

    pub fn mark_failed(&mut self, error: impl Into<String>) {
        self.status = DeliveryStatus::Failed;
        self.error_message = Some(error.into());
    }
}

/// One digest entry: a news item plus its analysis, if any.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DigestItem {
    pub news: NewsItem,
    pub analysis: Option<AnalysisResult>,
}

impl DigestItem {
    pub fn is_analyzed(&self) -> bool {
        self.analysis.is_some()
    }
}

/// The transient, per-run output bundle assembled at the end of orchestration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Digest {
    pub run_id: Uuid,
    pub generated_at: DateTime<Utc>,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub items: Vec<DigestItem>,
    pub total_collected: u32,
    pub total_after_dedup: u32,
    pub total_analyzed: u32,
    pub total_failed: u32,
    pub ticker_summaries: HashMap<String, TickerSummary>,
}

impl Digest {
    /// Items whose analysis has a non-neutral directional impact.
    pub fn high_impact_items(&self) -> Vec<&DigestItem> {
        self.items
            .iter()
            .filter(|item| {
                item.analysis
                    .as_ref()
                    .is_some_and(|a| a.impact_direction != ImpactDirection::Neutral)
            })
            .collect()
    }

    /// Items grouped by each of their tickers.
    pub fn by_ticker(&self) -> HashMap<String, Vec<&DigestItem>> {
        let mut grouped: HashMap<String, Vec<&DigestItem>> = HashMap::new();
        for item in &self.items {
            for ticker in &item.news.tickers {
                grouped.entry(ticker.clone()).or_default().push(item);
            }
        }
        grouped
    }
}

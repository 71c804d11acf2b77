//! Persistence collaborator interface (§3/§6).
//!
//! The core pipeline only needs a narrow set of operations against the
//! store: idempotent `NewsItem` upsert keyed by canonical URL, CRUD for
//! `AnalysisResult`/`TickerSummary`/`PipelineRun`/`DeliveryLog`, and
//! watchlist read/write. [`Store`] is the object-safe trait boundary
//! (mirroring `src/backend/mod.rs`'s `Backend` trait shape); [`InMemoryStore`]
//! is the one in-memory implementation, sufficient for the CLI and for
//! tests without standing up an external database — a durable backend is a
//! drop-in implementer of the same trait and is out of scope for this
//! crate's core (SPEC_FULL.md §6).

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::domain::{
    AnalysisResult, DeliveryLog, NewsItem, PipelineRun, RawItem, RunStatus, TickerSummary,
    WatchlistEntry,
};
use crate::error::Result;
use crate::PipelineError;

/// Optional filters for [`Store::list_news_items`], matching the shape of
/// the `GET /news` collaborator query parameters (§6).
#[derive(Debug, Clone, Default)]
pub struct NewsFilter {
    pub ticker: Option<String>,
    pub source: Option<String>,
    pub limit: usize,
    pub offset: usize,
}

/// The narrow set of persistence operations the core pipeline depends on.
///
/// Object-safe and `async_trait`-based, like [`crate::collector::Collector`]
/// and [`crate::analysis::AnalysisProvider`], so callers can hold
/// `Arc<dyn Store>` without committing to a concrete backend.
#[async_trait]
pub trait Store: Send + Sync {
    async fn upsert_watchlist_entry(&self, entry: WatchlistEntry) -> Result<()>;
    async fn list_watchlist(&self) -> Result<Vec<WatchlistEntry>>;
    async fn get_watchlist_entry(&self, ticker: &str) -> Result<Option<WatchlistEntry>>;
    async fn delete_watchlist_entry(&self, ticker: &str) -> Result<bool>;

    /// Whether a `NewsItem` with this canonical URL is already persisted
    /// (the idempotency check of §4.6 step 7a).
    async fn news_item_exists(&self, canonical_url: &str) -> Result<bool>;
    async fn save_raw_item(&self, item: RawItem) -> Result<()>;
    async fn save_news_item(&self, item: NewsItem) -> Result<()>;
    async fn get_news_item(&self, id: Uuid) -> Result<Option<NewsItem>>;
    async fn list_news_items(&self, filter: NewsFilter) -> Result<Vec<NewsItem>>;

    async fn save_analysis_result(&self, result: AnalysisResult) -> Result<()>;
    async fn get_analysis_result(&self, news_item_id: Uuid) -> Result<Option<AnalysisResult>>;

    async fn save_ticker_summary(&self, run_id: Uuid, summary: TickerSummary) -> Result<()>;

    async fn create_pipeline_run(&self, run: PipelineRun) -> Result<()>;
    async fn update_pipeline_run(&self, run: PipelineRun) -> Result<()>;
    async fn get_pipeline_run(&self, run_id: Uuid) -> Result<Option<PipelineRun>>;
    async fn list_pipeline_runs(
        &self,
        status: Option<RunStatus>,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<PipelineRun>>;

    async fn create_delivery_log(&self, log: DeliveryLog) -> Result<()>;
    async fn update_delivery_log(&self, log: DeliveryLog) -> Result<()>;
    async fn list_delivery_logs(&self, run_id: Uuid) -> Result<Vec<DeliveryLog>>;
}

/// `RwLock`-guarded in-memory reference implementation, in the idiom of
/// `src/backend/mock.rs`'s fixed/programmable in-memory backend.
#[derive(Default)]
pub struct InMemoryStore {
    watchlist: RwLock<HashMap<String, WatchlistEntry>>,
    raw_items: RwLock<Vec<RawItem>>,
    news_by_id: RwLock<HashMap<Uuid, NewsItem>>,
    news_by_url: RwLock<HashMap<String, Uuid>>,
    analyses: RwLock<HashMap<Uuid, AnalysisResult>>,
    ticker_summaries: RwLock<HashMap<(Uuid, String), TickerSummary>>,
    runs: RwLock<HashMap<Uuid, PipelineRun>>,
    delivery_logs: RwLock<HashMap<Uuid, DeliveryLog>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn upsert_watchlist_entry(&self, entry: WatchlistEntry) -> Result<()> {
        self.watchlist.write().await.insert(entry.ticker.clone(), entry);
        Ok(())
    }

    async fn list_watchlist(&self) -> Result<Vec<WatchlistEntry>> {
        let mut entries: Vec<WatchlistEntry> = self.watchlist.read().await.values().cloned().collect();
        entries.sort_by(|a, b| a.ticker.cmp(&b.ticker));
        Ok(entries)
    }

    async fn get_watchlist_entry(&self, ticker: &str) -> Result<Option<WatchlistEntry>> {
        Ok(self.watchlist.read().await.get(ticker).cloned())
    }

    async fn delete_watchlist_entry(&self, ticker: &str) -> Result<bool> {
        Ok(self.watchlist.write().await.remove(ticker).is_some())
    }

    async fn news_item_exists(&self, canonical_url: &str) -> Result<bool> {
        Ok(self.news_by_url.read().await.contains_key(canonical_url))
    }

    async fn save_raw_item(&self, item: RawItem) -> Result<()> {
        self.raw_items.write().await.push(item);
        Ok(())
    }

    async fn save_news_item(&self, item: NewsItem) -> Result<()> {
        let mut by_url = self.news_by_url.write().await;
        if let Some(existing) = by_url.get(&item.canonical_url) {
            if *existing != item.id {
                return Err(PipelineError::Other(format!(
                    "canonical_url {} already maps to a different NewsItem",
                    item.canonical_url
                )));
            }
        }
        by_url.insert(item.canonical_url.clone(), item.id);
        self.news_by_id.write().await.insert(item.id, item);
        Ok(())
    }

    async fn get_news_item(&self, id: Uuid) -> Result<Option<NewsItem>> {
        Ok(self.news_by_id.read().await.get(&id).cloned())
    }

    async fn list_news_items(&self, filter: NewsFilter) -> Result<Vec<NewsItem>> {
        let items = self.news_by_id.read().await;
        let mut matched: Vec<NewsItem> = items
            .values()
            .filter(|n| {
                filter.ticker.as_ref().is_none_or(|t| n.tickers.iter().any(|nt| nt == t))
                    && filter.source.as_ref().is_none_or(|s| &n.source == s)
            })
            .cloned()
            .collect();
        matched.sort_by(|a, b| b.published_at.cmp(&a.published_at));
        let offset = filter.offset.min(matched.len());
        let end = if filter.limit == 0 {
            matched.len()
        } else {
            (offset + filter.limit).min(matched.len())
        };
        Ok(matched[offset..end].to_vec())
    }

    async fn save_analysis_result(&self, result: AnalysisResult) -> Result<()> {
        self.analyses.write().await.insert(result.news_item_id, result);
        Ok(())
    }

    async fn get_analysis_result(&self, news_item_id: Uuid) -> Result<Option<AnalysisResult>> {
        Ok(self.analyses.read().await.get(&news_item_id).cloned())
    }

    async fn save_ticker_summary(&self, run_id: Uuid, summary: TickerSummary) -> Result<()> {
        self.ticker_summaries
            .write()
            .await
            .insert((run_id, summary.ticker.clone()), summary);
        Ok(())
    }

    async fn create_pipeline_run(&self, run: PipelineRun) -> Result<()> {
        self.runs.write().await.insert(run.run_id, run);
        Ok(())
    }

    async fn update_pipeline_run(&self, run: PipelineRun) -> Result<()> {
        self.runs.write().await.insert(run.run_id, run);
        Ok(())
    }

    async fn get_pipeline_run(&self, run_id: Uuid) -> Result<Option<PipelineRun>> {
        Ok(self.runs.read().await.get(&run_id).cloned())
    }

    async fn list_pipeline_runs(
        &self,
        status: Option<RunStatus>,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<PipelineRun>> {
        let runs = self.runs.read().await;
        let mut matched: Vec<PipelineRun> = runs
            .values()
            .filter(|r| status.is_none_or(|s| r.status == s))
            .cloned()
            .collect();
        matched.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        let offset = offset.min(matched.len());
        let end = if limit == 0 { matched.len() } else { (offset + limit).min(matched.len()) };
        Ok(matched[offset..end].to_vec())
    }

    async fn create_delivery_log(&self, log: DeliveryLog) -> Result<()> {
        self.delivery_logs.write().await.insert(log.id, log);
        Ok(())
    }

    async fn update_delivery_log(&self, log: DeliveryLog) -> Result<()> {
        self.delivery_logs.write().await.insert(log.id, log);
        Ok(())
    }

    async fn list_delivery_logs(&self, run_id: Uuid) -> Result<Vec<DeliveryLog>> {
        Ok(self
            .delivery_logs
            .read()
            .await
            .values()
            .filter(|l| l.run_id == run_id)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Credibility, DeliveryStatus, RunStatus, SourceType};
    use chrono::Utc;

    fn news(url: &str) -> NewsItem {
        NewsItem {
            id: Uuid::new_v4(),
            canonical_url: url.to_string(),
            title: "Title".into(),
            title_normalized: "title".into(),
            content_hash: "hash".into(),
            summary: None,
            published_at: Utc::now(),
            source: "finnhub".into(),
            source_type: SourceType::News,
            credibility: Credibility::Medium,
            tickers: vec!["NVDA".into()],
        }
    }

    #[tokio::test]
    async fn test_news_item_exists_after_save() {
        let store = InMemoryStore::new();
        assert!(!store.news_item_exists("https://a.com").await.unwrap());
        store.save_news_item(news("https://a.com")).await.unwrap();
        assert!(store.news_item_exists("https://a.com").await.unwrap());
    }

    #[tokio::test]
    async fn test_save_news_item_same_url_same_id_is_idempotent() {
        let store = InMemoryStore::new();
        let item = news("https://a.com");
        store.save_news_item(item.clone()).await.unwrap();
        store.save_news_item(item).await.unwrap();
        assert_eq!(store.list_news_items(NewsFilter::default()).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_save_news_item_url_collision_with_different_id_errors() {
        let store = InMemoryStore::new();
        store.save_news_item(news("https://a.com")).await.unwrap();
        let result = store.save_news_item(news("https://a.com")).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_list_news_items_filters_by_ticker() {
        let store = InMemoryStore::new();
        let mut amd_item = news("https://b.com");
        amd_item.tickers = vec!["AMD".into()];
        store.save_news_item(news("https://a.com")).await.unwrap();
        store.save_news_item(amd_item).await.unwrap();

        let filter = NewsFilter { ticker: Some("AMD".to_string()), ..Default::default() };
        let results = store.list_news_items(filter).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].tickers, vec!["AMD".to_string()]);
    }

    #[tokio::test]
    async fn test_pipeline_run_round_trip() {
        let store = InMemoryStore::new();
        let run = PipelineRun::new(Uuid::new_v4());
        let run_id = run.run_id;
        store.create_pipeline_run(run).await.unwrap();

        let fetched = store.get_pipeline_run(run_id).await.unwrap().unwrap();
        assert_eq!(fetched.status, RunStatus::Running);
    }

    #[tokio::test]
    async fn test_list_pipeline_runs_filters_by_status() {
        let store = InMemoryStore::new();
        let mut success_run = PipelineRun::new(Uuid::new_v4());
        success_run.status = RunStatus::Success;
        let running_run = PipelineRun::new(Uuid::new_v4());

        store.create_pipeline_run(success_run).await.unwrap();
        store.create_pipeline_run(running_run).await.unwrap();

        let results = store.list_pipeline_runs(Some(RunStatus::Success), 0, 0).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].status, RunStatus::Success);
    }

    #[tokio::test]
    async fn test_delivery_log_round_trip_and_mutation() {
        let store = InMemoryStore::new();
        let run_id = Uuid::new_v4();
        let mut log = DeliveryLog::pending(run_id, "markdown");
        store.create_delivery_log(log.clone()).await.unwrap();

        log.mark_success("data/digests/digest.md");
        store.update_delivery_log(log.clone()).await.unwrap();

        let logs = store.list_delivery_logs(run_id).await.unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].status, DeliveryStatus::Success);
    }

    #[tokio::test]
    async fn test_watchlist_upsert_list_delete() {
        let store = InMemoryStore::new();
        store
            .upsert_watchlist_entry(WatchlistEntry {
                ticker: "NVDA".to_string(),
                company_name: "NVIDIA".to_string(),
                thesis: "thesis".to_string(),
                risk_tags: vec![],
                priority: 1,
                sector: None,
            })
            .await
            .unwrap();
        assert_eq!(store.list_watchlist().await.unwrap().len(), 1);
        assert!(store.delete_watchlist_entry("NVDA").await.unwrap());
        assert!(store.list_watchlist().await.unwrap().is_empty());
    }
}

//! Drives one end-to-end pipeline run: collect, dedup, normalize, analyze,
//! summarize, assemble a digest, deliver, finalize.
//!
//! Grounded on the teacher's legacy `Pipeline<T>` (`src/pipeline.rs`) for the
//! overall shape of a builder-configured, sequentially-staged run, but the
//! stage sequence and persistence hooks below are new: §4.6's eleven-step
//! sequence has no equivalent in the teacher's generic LLM pipeline.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use uuid::Uuid;

use crate::analysis::AnalysisProvider;
use crate::collector::Collector;
use crate::dedup::Deduplicator;
use crate::domain::{
    AnalysisResult, Digest, DigestItem, NewsItem, OverallSentiment, PipelineRun, RunStatus,
    TickerSummary,
};
use crate::error::Result;
use crate::normalize::{normalize, CredibilityTable};
use crate::output::Output;
use crate::run_ctx::in_run;
use crate::store::Store;
use crate::watchlist::{company_name_map, thesis_map};
use crate::PipelineError;

/// A cooperative cancellation flag checked between stages and between
/// analysis-loop items (§5). Cheap to clone and safe to share with an
/// embedding application that wants to request early termination.
#[derive(Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Assembles the collaborators a [`PipelineOrchestrator`] needs: stores,
/// collectors, the deduplicator/credibility table, an optional analysis
/// provider, and the enabled output channels.
pub struct PipelineOrchestrator {
    store: Arc<dyn Store>,
    collectors: Vec<Arc<dyn Collector>>,
    deduplicator: Deduplicator,
    credibility_table: CredibilityTable,
    provider: Option<Arc<dyn AnalysisProvider>>,
    outputs: Vec<Arc<dyn Output>>,
    hours_lookback: i64,
    limit_per_ticker: Option<u32>,
}

impl PipelineOrchestrator {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            collectors: Vec::new(),
            deduplicator: Deduplicator::with_simhash(),
            credibility_table: CredibilityTable::new(),
            provider: None,
            outputs: Vec::new(),
            hours_lookback: 24,
            limit_per_ticker: None,
        }
    }

    pub fn with_collector(mut self, collector: Arc<dyn Collector>) -> Self {
        self.collectors.push(collector);
        self
    }

    pub fn with_provider(mut self, provider: Arc<dyn AnalysisProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    pub fn with_outputs(mut self, outputs: Vec<Arc<dyn Output>>) -> Self {
        self.outputs = outputs;
        self
    }

    pub fn with_hours_lookback(mut self, hours: i64) -> Self {
        self.hours_lookback = hours;
        self
    }

    pub fn with_limit_per_ticker(mut self, limit: Option<u32>) -> Self {
        self.limit_per_ticker = limit;
        self
    }

    /// Run the full pipeline once, under an optional cooperative cancellation
    /// flag. Returns the finalized `(PipelineRun, Digest)` pair; `PipelineRun`
    /// is also persisted before returning.
    pub async fn run(
        &self,
        run_id: Option<Uuid>,
        tickers_override: Option<Vec<String>>,
        cancel: Option<CancellationToken>,
    ) -> Result<(PipelineRun, Digest)> {
        let run_id = run_id.unwrap_or_else(Uuid::new_v4);
        let cancel = cancel.unwrap_or_default();
        in_run(run_id, self.run_inner(run_id, tickers_override, cancel)).await
    }

    async fn run_inner(
        &self,
        run_id: Uuid,
        tickers_override: Option<Vec<String>>,
        cancel: CancellationToken,
    ) -> Result<(PipelineRun, Digest)> {
        let mut run = PipelineRun::new(run_id);
        self.store.create_pipeline_run(run.clone()).await?;
        tracing::info!(run_id = %run_id, "pipeline run started");

        match self.execute(run_id, tickers_override, &cancel, &mut run).await {
            Ok(digest) => {
                run.finished_at = Some(Utc::now());
                self.store.update_pipeline_run(run.clone()).await?;
                tracing::info!(run_id = %run_id, status = ?run.status, "pipeline run finished");
                Ok((run, digest))
            }
            Err(e) => {
                run.status = RunStatus::Failed;
                run.error_log = Some(e.to_string());
                run.finished_at = Some(Utc::now());
                self.store.update_pipeline_run(run.clone()).await?;
                tracing::error!(run_id = %run_id, error = %e, "pipeline run failed before a digest was assembled");
                Err(e)
            }
        }
    }

    async fn execute(
        &self,
        run_id: Uuid,
        tickers_override: Option<Vec<String>>,
        cancel: &CancellationToken,
        run: &mut PipelineRun,
    ) -> Result<Digest> {
        let mut had_partial_failure = false;

        // Step 2: load watchlist.
        let watchlist = self.store.list_watchlist().await?;
        if watchlist.is_empty() {
            return Err(PipelineError::InvalidConfig("watchlist is empty; nothing to collect".to_string()));
        }
        let theses = thesis_map(&watchlist);
        let company_names = company_name_map(&watchlist);
        let tickers: Vec<String> = tickers_override.unwrap_or_else(|| watchlist.iter().map(|e| e.ticker.clone()).collect());

        if cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }

        // Step 3: compute window.
        let window_end: DateTime<Utc> = Utc::now();
        let window_start = window_end - ChronoDuration::hours(self.hours_lookback);

        // Step 4: collect, concurrently across collectors.
        let raw_items = self.collect_all(&tickers, window_start, window_end).await;
        run.counters.raw_collected = raw_items.len() as u32;

        if cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }

        // Step 5: dedup first, then normalize the survivors.
        let dedup_result = self.deduplicator.deduplicate(raw_items);
        run.counters.after_dedup = dedup_result.kept.len() as u32;
        run.counters.after_normalize = dedup_result.kept.len() as u32;

        let mut pairs: Vec<(crate::domain::RawItem, NewsItem)> = dedup_result
            .kept
            .into_iter()
            .map(|raw| {
                let news = normalize(&raw, &self.credibility_table);
                (raw, news)
            })
            .collect();

        // Step 6: optional per-ticker cap.
        if let Some(limit) = self.limit_per_ticker {
            pairs = apply_per_ticker_cap(pairs, limit);
        }

        if cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }

        // Step 7: analyze + persist.
        let mut digest_items = Vec::with_capacity(pairs.len());
        for (raw, news) in pairs {
            if cancel.is_cancelled() {
                return Err(PipelineError::Cancelled);
            }

            if self.store.news_item_exists(&news.canonical_url).await? {
                continue;
            }

            self.store.save_raw_item(raw.clone()).await?;
            self.store.save_news_item(news.clone()).await?;

            let analysis = match &self.provider {
                None => None,
                Some(provider) => {
                    let thesis = news
                        .tickers
                        .iter()
                        .find_map(|t| theses.get(t))
                        .cloned()
                        .unwrap_or_default();
                    match provider.analyze(&news, &thesis).await {
                        Ok((result, _tokens, _cost)) => {
                            self.store.save_analysis_result(result.clone()).await?;
                            run.counters.analyzed_success += 1;
                            Some(result)
                        }
                        Err(e) => {
                            tracing::warn!(news_item_id = %news.id, error = %e, "analysis failed, keeping item unanalyzed");
                            run.counters.analyzed_failed += 1;
                            had_partial_failure = true;
                            None
                        }
                    }
                }
            };

            digest_items.push(DigestItem { news, analysis });
        }

        // Step 8: per-ticker summaries.
        let mut ticker_summaries: HashMap<String, TickerSummary> = HashMap::new();
        if let Some(provider) = &self.provider {
            let by_ticker = group_by_ticker(&digest_items);
            for (ticker, items) in by_ticker {
                if cancel.is_cancelled() {
                    return Err(PipelineError::Cancelled);
                }
                let company_name = company_names.get(&ticker).cloned().unwrap_or_else(|| ticker.clone());
                let thesis = theses.get(&ticker).cloned().unwrap_or_default();
                let summary = match provider.generate_ticker_summary(&ticker, &company_name, &items, &thesis).await {
                    Ok((summary, _tokens, _cost)) => summary,
                    Err(e) => {
                        tracing::warn!(ticker, error = %e, "ticker summary failed, using fallback tally");
                        had_partial_failure = true;
                        deterministic_fallback_summary(&ticker, &company_name, &items)
                    }
                };
                self.store.save_ticker_summary(run_id, summary.clone()).await?;
                ticker_summaries.insert(ticker, summary);
            }
        }

        // Step 9: assemble digest.
        let total_analyzed = digest_items.iter().filter(|i| i.is_analyzed()).count() as u32;
        let total_failed = run.counters.analyzed_failed;
        let digest = Digest {
            run_id,
            generated_at: Utc::now(),
            window_start,
            window_end,
            items: digest_items,
            total_collected: run.counters.raw_collected,
            total_after_dedup: run.counters.after_dedup,
            total_analyzed,
            total_failed,
            ticker_summaries,
        };

        // Step 10: deliver.
        for output in &self.outputs {
            let mut log = crate::domain::DeliveryLog::pending(run_id, output.name());
            self.store.create_delivery_log(log.clone()).await?;
            match output.deliver(&digest).await {
                Ok(channel_ref) => {
                    log.mark_success(channel_ref);
                    run.counters.delivered += 1;
                }
                Err(e) => {
                    tracing::error!(channel = output.name(), error = %e, "delivery failed");
                    log.mark_failed(e.to_string());
                    had_partial_failure = true;
                }
            }
            self.store.update_delivery_log(log).await?;
        }

        // Step 11: finalize.
        run.status = if had_partial_failure { RunStatus::Partial } else { RunStatus::Success };
        Ok(digest)
    }

    async fn collect_all(&self, tickers: &[String], since: DateTime<Utc>, until: DateTime<Utc>) -> Vec<crate::domain::RawItem> {
        let futures = self.collectors.iter().map(|collector| {
            let tickers = tickers.to_vec();
            async move { collector.collect(&tickers, since, Some(until)).await }
        });
        let results = futures::future::join_all(futures).await;

        let mut items = Vec::new();
        for (collector, result) in self.collectors.iter().zip(results) {
            match result {
                Ok(mut batch) => items.append(&mut batch),
                Err(e) => {
                    tracing::warn!(collector = collector.source(), error = %e, "collector failed, skipping its results");
                }
            }
        }
        items
    }
}

fn apply_per_ticker_cap(
    pairs: Vec<(crate::domain::RawItem, NewsItem)>,
    limit: u32,
) -> Vec<(crate::domain::RawItem, NewsItem)> {
    let mut counts: HashMap<String, u32> = HashMap::new();
    let mut kept = Vec::new();
    for (raw, news) in pairs {
        let has_room = news.tickers.iter().any(|t| *counts.get(t).unwrap_or(&0) < limit);
        if has_room {
            for t in &news.tickers {
                *counts.entry(t.clone()).or_insert(0) += 1;
            }
            kept.push((raw, news));
        }
    }
    kept
}

fn group_by_ticker(items: &[DigestItem]) -> Vec<(String, Vec<(NewsItem, Option<AnalysisResult>)>)> {
    let mut grouped: HashMap<String, Vec<(NewsItem, Option<AnalysisResult>)>> = HashMap::new();
    for item in items {
        for ticker in &item.news.tickers {
            grouped
                .entry(ticker.clone())
                .or_default()
                .push((item.news.clone(), item.analysis.clone()));
        }
    }
    let mut result: Vec<(String, Vec<(NewsItem, Option<AnalysisResult>)>)> = grouped.into_iter().collect();
    result.sort_by(|a, b| a.0.cmp(&b.0));
    result
}

fn deterministic_fallback_summary(ticker: &str, company_name: &str, items: &[(NewsItem, Option<AnalysisResult>)]) -> TickerSummary {
    let bullish = items
        .iter()
        .filter(|(_, a)| a.as_ref().is_some_and(|a| a.impact_direction == crate::domain::ImpactDirection::Bullish))
        .count() as u32;
    let bearish = items
        .iter()
        .filter(|(_, a)| a.as_ref().is_some_and(|a| a.impact_direction == crate::domain::ImpactDirection::Bearish))
        .count() as u32;
    let neutral = items.len() as u32 - bullish - bearish;

    let overall_sentiment = if bullish > bearish {
        OverallSentiment::Bullish
    } else if bearish > bullish {
        OverallSentiment::Bearish
    } else if bullish == 0 && bearish == 0 {
        OverallSentiment::Neutral
    } else {
        OverallSentiment::Mixed
    };

    let key_events: Vec<String> = items.iter().take(3).map(|(n, _)| n.title.clone()).collect();

    TickerSummary {
        ticker: ticker.to_string(),
        company_name: company_name.to_string(),
        news_count: items.len() as u32,
        overall_sentiment,
        summary: format!("{} news items this run ({} bullish, {} bearish, {} neutral).", items.len(), bullish, bearish, neutral),
        key_events,
        thesis_impact: String::new(),
        action_suggestion: "Continue monitoring.".to_string(),
        risk_alerts: Vec::new(),
        bullish_count: bullish,
        bearish_count: bearish,
        neutral_count: neutral,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::MockProvider;
    use crate::collector::MockCollector;
    use crate::domain::{Credibility, SourceType, WatchlistEntry};
    use crate::store::InMemoryStore;

    fn raw_item(url: &str, ticker: &str) -> crate::domain::RawItem {
        crate::domain::RawItem {
            source: "mock".into(),
            source_type: SourceType::News,
            external_id: None,
            url: url.into(),
            title: format!("News about {ticker}"),
            summary: Some("Some content.".into()),
            published_at: Some(Utc::now()),
            fetched_at: Utc::now(),
            tickers: vec![ticker.to_string()],
            raw_payload: serde_json::json!({}),
            author: None,
            category: None,
            image_url: None,
        }
    }

    async fn seeded_store() -> Arc<InMemoryStore> {
        let store = Arc::new(InMemoryStore::new());
        store
            .upsert_watchlist_entry(WatchlistEntry {
                ticker: "NVDA".to_string(),
                company_name: "NVIDIA".to_string(),
                thesis: "Long on AI capex.".to_string(),
                risk_tags: vec![],
                priority: 1,
                sector: None,
            })
            .await
            .unwrap();
        store
    }

    #[tokio::test]
    async fn test_run_without_provider_persists_unanalyzed_items() {
        let store = seeded_store().await;
        let collector = Arc::new(MockCollector {
            source: "mock",
            source_type: SourceType::News,
            credibility: Credibility::Medium,
            items: vec![raw_item("https://a.com/1", "NVDA")],
        });
        let orchestrator = PipelineOrchestrator::new(store.clone()).with_collector(collector);

        let (run, digest) = orchestrator.run(None, None, None).await.unwrap();
        assert_eq!(run.status, RunStatus::Success);
        assert_eq!(digest.items.len(), 1);
        assert!(digest.items[0].analysis.is_none());
        assert_eq!(run.counters.raw_collected, 1);
    }

    #[tokio::test]
    async fn test_run_with_provider_persists_analysis_and_summary() {
        let store = seeded_store().await;
        let collector = Arc::new(MockCollector {
            source: "mock",
            source_type: SourceType::News,
            credibility: Credibility::Medium,
            items: vec![raw_item("https://a.com/2", "NVDA")],
        });
        let provider = Arc::new(MockProvider::always_valid());
        let orchestrator = PipelineOrchestrator::new(store.clone())
            .with_collector(collector)
            .with_provider(provider);

        let (run, digest) = orchestrator.run(None, None, None).await.unwrap();
        assert_eq!(run.status, RunStatus::Success);
        assert_eq!(run.counters.analyzed_success, 1);
        assert!(digest.items[0].analysis.is_some());
        assert!(digest.ticker_summaries.contains_key("NVDA"));
    }

    #[tokio::test]
    async fn test_run_is_idempotent_on_canonical_url() {
        let store = seeded_store().await;
        let collector = Arc::new(MockCollector {
            source: "mock",
            source_type: SourceType::News,
            credibility: Credibility::Medium,
            items: vec![raw_item("https://a.com/3", "NVDA")],
        });
        let orchestrator = PipelineOrchestrator::new(store.clone()).with_collector(collector);

        let (_, first) = orchestrator.run(None, None, None).await.unwrap();
        assert_eq!(first.items.len(), 1);

        let (_, second) = orchestrator.run(None, None, None).await.unwrap();
        assert_eq!(second.items.len(), 0);
    }

    #[tokio::test]
    async fn test_run_fails_with_empty_watchlist() {
        let store = Arc::new(InMemoryStore::new());
        let orchestrator = PipelineOrchestrator::new(store);
        let result = orchestrator.run(None, None, None).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_run_respects_cancellation_before_collection() {
        let store = seeded_store().await;
        let orchestrator = PipelineOrchestrator::new(store);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = orchestrator.run(None, None, Some(cancel)).await;
        assert!(matches!(result, Err(PipelineError::Cancelled)));
    }

    #[test]
    fn test_apply_per_ticker_cap_keeps_at_most_limit_per_ticker() {
        let pairs = vec![
            normalized_pair("NVDA"),
            normalized_pair("NVDA"),
            normalized_pair("NVDA"),
        ];
        let capped = apply_per_ticker_cap(pairs, 2);
        assert_eq!(capped.len(), 2);
    }

    fn normalized_pair(ticker: &str) -> (crate::domain::RawItem, NewsItem) {
        let raw = raw_item("https://example.com/x", ticker);
        let news = NewsItem {
            id: Uuid::new_v4(),
            canonical_url: format!("https://example.com/{}", Uuid::new_v4()),
            title: "Title".into(),
            title_normalized: "title".into(),
            content_hash: "hash".into(),
            summary: None,
            published_at: Utc::now(),
            source: "mock".into(),
            source_type: SourceType::News,
            credibility: Credibility::Medium,
            tickers: vec![ticker.to_string()],
        };
        (raw, news)
    }
}

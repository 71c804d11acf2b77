//! Delivery channels for an assembled [`Digest`].
//!
//! Grounded on `original_source/backend/app/outputs/{base,markdown,notion,telegram}.py`:
//! a single object-safe [`Output`] trait, in the same vein as
//! [`crate::collector::Collector`] and [`crate::analysis::AnalysisProvider`],
//! with one implementation per channel. Chart generation (the original's
//! `ChartGenerator`/K-line plotting) and email delivery are out of scope
//! (spec.md §1 non-goals); the factory only wires the three channels below.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};

use crate::domain::{Digest, DigestItem, ImpactDirection};
use crate::error::Result;
use crate::rate_limit::RateLimiter;
use crate::PipelineError;

/// A channel a completed [`Digest`] can be delivered to.
///
/// Returns a channel-specific reference to the delivered artifact (a file
/// path, a Notion page id, `"ok"` for Telegram) that callers persist onto
/// the corresponding `DeliveryLog::channel_ref`.
#[async_trait]
pub trait Output: Send + Sync {
    fn name(&self) -> &'static str;
    async fn deliver(&self, digest: &Digest) -> Result<String>;
}

fn impact_emoji(direction: Option<ImpactDirection>) -> &'static str {
    match direction {
        Some(ImpactDirection::Bullish) => "\u{1F4C8}",
        Some(ImpactDirection::Bearish) => "\u{1F4C9}",
        _ => "\u{2796}",
    }
}

fn sentiment_counts(digest: &Digest) -> (u32, u32, u32) {
    let mut bullish = 0;
    let mut bearish = 0;
    let mut neutral = 0;
    for item in &digest.items {
        match item.analysis.as_ref().map(|a| a.impact_direction) {
            Some(ImpactDirection::Bullish) => bullish += 1,
            Some(ImpactDirection::Bearish) => bearish += 1,
            _ => neutral += 1,
        }
    }
    (bullish, bearish, neutral)
}

// ===== Markdown =====

/// Renders a digest to a single local Markdown file.
pub struct MarkdownOutput {
    output_dir: PathBuf,
}

impl MarkdownOutput {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self { output_dir: output_dir.into() }
    }

    fn build_markdown(&self, digest: &Digest) -> String {
        let mut lines = Vec::new();
        let date_str = digest.generated_at.format("%Y-%m-%d").to_string();
        let time_str = digest.generated_at.format("%H:%M UTC").to_string();

        lines.push("# Daily Stock News Digest".to_string());
        lines.push(format!("### {date_str} | Generated at {time_str}"));
        lines.push(String::new());
        lines.push("---".to_string());
        lines.push(String::new());

        let (bullish, bearish, neutral) = sentiment_counts(digest);
        let total = bullish + bearish + neutral;
        let (mood, desc) = if total == 0 {
            ("NEUTRAL", "Insufficient data")
        } else {
            let score = (bullish as f64 - bearish as f64) / total as f64 * 100.0;
            if score > 20.0 {
                ("BULLISH", "Market sentiment is positive")
            } else if score < -20.0 {
                ("BEARISH", "Market sentiment is negative")
            } else {
                ("MIXED", "Market sentiment is mixed")
            }
        };
        lines.push("## Market Sentiment Dashboard".to_string());
        lines.push(String::new());
        lines.push(format!("> **Overall: {mood}**"));
        lines.push(format!("> {desc}"));
        lines.push(String::new());
        lines.push("| Metric | Value |".to_string());
        lines.push("|:-------|------:|".to_string());
        lines.push(format!("| Bullish News | **{bullish}** |"));
        lines.push(format!("| Bearish News | **{bearish}** |"));
        lines.push(format!("| Neutral News | **{neutral}** |"));
        lines.push(format!("| Total Analyzed | **{}** |", digest.total_analyzed));
        lines.push(format!(
            "| Time Window | {} - {} |",
            digest.window_start.format("%m/%d %H:%M"),
            digest.window_end.format("%m/%d %H:%M")
        ));
        lines.push(String::new());
        lines.push("---".to_string());
        lines.push(String::new());

        let high_impact = digest.high_impact_items();
        if !high_impact.is_empty() {
            lines.push("## Top Stories".to_string());
            lines.push(String::new());
            for (i, item) in high_impact.iter().take(5).enumerate() {
                lines.push(format!(
                    "{}. {} **{}**",
                    i + 1,
                    impact_emoji(item.analysis.as_ref().map(|a| a.impact_direction)),
                    item.news.title
                ));
                if let Some(analysis) = &item.analysis {
                    lines.push(format!("   - {}", analysis.summary));
                }
            }
            lines.push(String::new());
            lines.push("---".to_string());
            lines.push(String::new());
        }

        let by_ticker = digest.by_ticker();
        if !by_ticker.is_empty() {
            lines.push("## Analysis by Ticker".to_string());
            lines.push(String::new());
            let mut tickers: Vec<&String> = by_ticker.keys().collect();
            tickers.sort();
            for ticker in tickers {
                let items = &by_ticker[ticker];
                lines.push(format!("### {ticker}"));
                if let Some(summary) = digest.ticker_summaries.get(ticker) {
                    lines.push(format!("**{:?}** — {}", summary.overall_sentiment, summary.summary));
                    lines.push(format!("- Thesis impact: {}", summary.thesis_impact));
                    lines.push(format!("- Action: {}", summary.action_suggestion));
                    if !summary.risk_alerts.is_empty() {
                        lines.push(format!("- Risks: {}", summary.risk_alerts.join("; ")));
                    }
                }
                lines.push(String::new());
                for item in items.iter().take(10) {
                    lines.push(format!(
                        "- {} {}",
                        impact_emoji(item.analysis.as_ref().map(|a| a.impact_direction)),
                        item.news.title
                    ));
                }
                lines.push(String::new());
            }
        }

        lines.push("---".to_string());
        lines.push(String::new());
        lines.push("| Time | Ticker | Impact | Title |".to_string());
        lines.push("|:-----|:-------|:------:|:------|".to_string());
        let mut sorted_items: Vec<&DigestItem> = digest.items.iter().collect();
        sorted_items.sort_by(|a, b| b.news.published_at.cmp(&a.news.published_at));
        for item in sorted_items {
            let title = if item.news.title.chars().count() > 60 {
                format!("{}...", item.news.title.chars().take(60).collect::<String>())
            } else {
                item.news.title.clone()
            };
            let tickers = if item.news.tickers.is_empty() {
                "-".to_string()
            } else {
                item.news.tickers.join(", ")
            };
            lines.push(format!(
                "| {} | {} | {} | {} |",
                item.news.published_at.format("%H:%M"),
                tickers,
                impact_emoji(item.analysis.as_ref().map(|a| a.impact_direction)),
                title
            ));
        }
        lines.push(String::new());

        lines.join("\n")
    }
}

#[async_trait]
impl Output for MarkdownOutput {
    fn name(&self) -> &'static str {
        "markdown"
    }

    async fn deliver(&self, digest: &Digest) -> Result<String> {
        std::fs::create_dir_all(&self.output_dir)
            .map_err(|e| PipelineError::Other(format!("cannot create {}: {e}", self.output_dir.display())))?;
        let filename = format!("digest_{}.md", digest.generated_at.format("%Y-%m-%d_%H%M"));
        let filepath = self.output_dir.join(filename);
        let content = self.build_markdown(digest);
        std::fs::write(&filepath, content)
            .map_err(|e| PipelineError::Other(format!("cannot write {}: {e}", filepath.display())))?;
        tracing::info!(path = %filepath.display(), items = digest.items.len(), "digest saved to markdown");
        Ok(filepath.display().to_string())
    }
}

// ===== Notion =====

/// Writes a digest as a new page in a Notion database, via the REST API
/// directly (no Notion SDK exists in the dependency pack).
pub struct NotionOutput {
    client: Client,
    limiter: Arc<RateLimiter>,
    token: String,
    database_id: String,
}

const NOTION_VERSION: &str = "2022-06-28";

impl NotionOutput {
    pub fn new(client: Client, limiter: Arc<RateLimiter>, token: impl Into<String>, database_id: impl Into<String>) -> Self {
        Self { client, limiter, token: token.into(), database_id: database_id.into() }
    }

    async fn detect_title_property(&self) -> Result<String> {
        let url = format!("https://api.notion.com/v1/databases/{}", self.database_id);
        let resp = self.send(|| self.client.get(&url)).await?;
        if let Some(props) = resp.get("properties").and_then(Value::as_object) {
            for (name, prop) in props {
                if prop.get("type").and_then(Value::as_str) == Some("title") {
                    return Ok(name.clone());
                }
            }
        }
        Ok("Name".to_string())
    }

    async fn send<F>(&self, build: F) -> Result<Value>
    where
        F: Fn() -> reqwest::RequestBuilder,
    {
        self.limiter
            .execute("notion", 3, || async {
                let resp = build()
                    .header("Authorization", format!("Bearer {}", self.token))
                    .header("Notion-Version", NOTION_VERSION)
                    .send()
                    .await?;
                handle_response(resp).await
            })
            .await
    }

    fn build_properties(&self, digest: &Digest, title_property: &str) -> Value {
        let date_str = digest.generated_at.format("%Y-%m-%d").to_string();
        let (bullish, bearish, _) = sentiment_counts(digest);
        let mut title = format!("Daily Digest - {date_str}");
        if bullish > 0 {
            title.push_str(&format!(" | +{bullish}"));
        }
        if bearish > 0 {
            title.push_str(&format!(" | -{bearish}"));
        }
        json!({
            title_property: {
                "title": [{"text": {"content": title}}]
            }
        })
    }

    fn build_content_blocks(&self, digest: &Digest) -> Vec<Value> {
        let mut blocks = vec![
            heading(1, "Daily Market News Digest"),
            paragraph(&format!(
                "Generated: {} | Window: {} - {} | Items: {}",
                digest.generated_at.format("%Y-%m-%d %H:%M UTC"),
                digest.window_start.format("%m/%d %H:%M"),
                digest.window_end.format("%m/%d %H:%M"),
                digest.items.len()
            )),
            divider(),
        ];

        let high_impact = digest.high_impact_items();
        if !high_impact.is_empty() {
            blocks.push(heading(2, "High Impact News"));
            for item in high_impact.iter().take(5) {
                blocks.extend(news_item_blocks(item, true));
            }
            blocks.push(divider());
        }

        let by_ticker = digest.by_ticker();
        if !by_ticker.is_empty() {
            blocks.push(heading(2, "News by Ticker"));
            let mut tickers: Vec<&String> = by_ticker.keys().collect();
            tickers.sort();
            for ticker in tickers {
                blocks.push(heading(3, &format!("${ticker}")));
                for item in by_ticker[ticker].iter().take(3) {
                    blocks.extend(news_item_blocks(item, false));
                }
            }
        }

        if digest.items.len() > 10 {
            blocks.push(divider());
            blocks.push(heading(2, "All News Items"));
            let children: Vec<Value> = digest.items.iter().flat_map(|i| news_item_blocks(i, false)).take(100).collect();
            blocks.push(toggle(&format!("View all {} items", digest.items.len()), children));
        }

        blocks
    }
}

fn heading(level: u8, text: &str) -> Value {
    let key = format!("heading_{level}");
    let mut map = serde_json::Map::new();
    map.insert("object".to_string(), json!("block"));
    map.insert("type".to_string(), json!(key));
    map.insert(key, json!({"rich_text": [{"type": "text", "text": {"content": text}}]}));
    Value::Object(map)
}

fn paragraph(text: &str) -> Value {
    json!({"object": "block", "type": "paragraph", "paragraph": {"rich_text": [{"type": "text", "text": {"content": text}}]}})
}

fn bullet(text: &str) -> Value {
    json!({"object": "block", "type": "bulleted_list_item", "bulleted_list_item": {"rich_text": [{"type": "text", "text": {"content": text}}]}})
}

fn divider() -> Value {
    json!({"object": "block", "type": "divider", "divider": {}})
}

fn toggle(title: &str, children: Vec<Value>) -> Value {
    let children: Vec<Value> = children.into_iter().take(100).collect();
    json!({"object": "block", "type": "toggle", "toggle": {"rich_text": [{"type": "text", "text": {"content": title}}], "children": children}})
}

fn news_item_blocks(item: &DigestItem, show_detail: bool) -> Vec<Value> {
    let tickers_str = if item.news.tickers.is_empty() {
        String::new()
    } else {
        item.news.tickers.iter().map(|t| format!("${t}")).collect::<Vec<_>>().join(", ")
    };
    let mut title_text = format!("{} {}", impact_emoji(item.analysis.as_ref().map(|a| a.impact_direction)), item.news.title);
    if !tickers_str.is_empty() {
        title_text = format!("{tickers_str} | {title_text}");
    }

    let mut blocks = vec![bullet(&title_text)];

    if show_detail {
        if let Some(a) = &item.analysis {
            blocks.push(paragraph(&format!("Type: {:?} | Impact: {:?} ({:?})", a.event_type, a.impact_direction, a.impact_horizon)));
            blocks.push(paragraph(&format!("Summary: {}", a.summary)));
            if !a.key_facts.is_empty() {
                blocks.push(paragraph(&format!("Facts: {}", a.key_facts.join("; "))));
            }
            if !a.watch_next.is_empty() {
                blocks.push(paragraph(&format!("Watch: {}", a.watch_next)));
            }
        }
    }

    blocks.push(paragraph(&format!(
        "[{}]({}) | {}",
        item.news.source,
        item.news.canonical_url,
        item.news.published_at.format("%m/%d %H:%M")
    )));

    blocks
}

#[async_trait]
impl Output for NotionOutput {
    fn name(&self) -> &'static str {
        "notion"
    }

    async fn deliver(&self, digest: &Digest) -> Result<String> {
        let title_property = self.detect_title_property().await.unwrap_or_else(|_| "Name".to_string());
        let properties = self.build_properties(digest, &title_property);
        let children = self.build_content_blocks(digest);

        let first_batch: Vec<Value> = children.iter().take(100).cloned().collect();
        let url = "https://api.notion.com/v1/pages".to_string();
        let body = json!({
            "parent": {"database_id": self.database_id},
            "properties": properties,
            "children": first_batch,
        });
        let page = self.send(|| self.client.post(&url).json(&body)).await?;
        let page_id = page
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| PipelineError::Other("Notion response missing page id".to_string()))?
            .to_string();

        if children.len() > 100 {
            let append_url = format!("https://api.notion.com/v1/blocks/{page_id}/children");
            for batch in children[100..].chunks(100) {
                let batch_body = json!({"children": batch});
                self.send(|| self.client.patch(&append_url).json(&batch_body)).await?;
            }
        }

        tracing::info!(page_id = %page_id, items = digest.items.len(), "digest delivered to Notion");
        Ok(page_id)
    }
}

// ===== Telegram =====

const TELEGRAM_MESSAGE_LIMIT: usize = 4096;

/// Pushes a digest summary to a Telegram chat via the Bot API.
pub struct TelegramOutput {
    client: Client,
    limiter: Arc<RateLimiter>,
    bot_token: String,
    chat_id: String,
}

impl TelegramOutput {
    pub fn new(client: Client, limiter: Arc<RateLimiter>, bot_token: impl Into<String>, chat_id: impl Into<String>) -> Self {
        Self { client, limiter, bot_token: bot_token.into(), chat_id: chat_id.into() }
    }

    fn format_message(&self, digest: &Digest) -> String {
        let (bullish, bearish, neutral) = sentiment_counts(digest);
        let (emoji, label) = if bullish > bearish * 2 {
            ("\u{1F7E2}", "BULLISH")
        } else if bearish > bullish * 2 {
            ("\u{1F534}", "BEARISH")
        } else {
            ("\u{26AA}", "MIXED")
        };

        let mut lines = vec![
            "<b>Daily Stock News Digest</b>".to_string(),
            format!("<i>{}</i>", digest.generated_at.format("%Y-%m-%d %H:%M")),
            String::new(),
            format!("{emoji} <b>Market sentiment: {label}</b>"),
            format!("Bullish: {bullish} | Bearish: {bearish} | Neutral: {neutral}"),
            String::new(),
            "<b>Per-ticker highlights:</b>".to_string(),
        ];

        let by_ticker = digest.by_ticker();
        let mut tickers: Vec<&String> = by_ticker.keys().collect();
        tickers.sort();
        for ticker in tickers.into_iter().take(8) {
            if let Some(summary) = digest.ticker_summaries.get(ticker) {
                lines.push(format!("<b>${ticker}</b>: {}", summary.summary));
            } else {
                lines.push(format!("<b>${ticker}</b>: {} items", by_ticker[ticker].len()));
            }
        }

        lines.join("\n")
    }

    async fn send_message(&self, text: &str) -> Result<()> {
        let url = format!("https://api.telegram.org/bot{}/sendMessage", self.bot_token);
        let chat_id = self.chat_id.clone();
        let text = text.to_string();
        self.limiter
            .execute("telegram", 3, || {
                let body = json!({
                    "chat_id": chat_id,
                    "text": text,
                    "parse_mode": "HTML",
                    "disable_web_page_preview": true,
                });
                async {
                    let resp = self.client.post(&url).json(&body).send().await?;
                    handle_response(resp).await.map(|_| ())
                }
            })
            .await
    }
}

/// Split `text` into chunks no longer than Telegram's message length limit,
/// breaking on line boundaries where possible.
fn chunk_message(text: &str, limit: usize) -> Vec<String> {
    if text.len() <= limit {
        return vec![text.to_string()];
    }
    let mut chunks = Vec::new();
    let mut current = String::new();
    for line in text.split('\n') {
        if current.len() + line.len() + 1 > limit {
            if !current.is_empty() {
                chunks.push(std::mem::take(&mut current));
            }
            if line.len() > limit {
                for piece in line.as_bytes().chunks(limit) {
                    chunks.push(String::from_utf8_lossy(piece).to_string());
                }
                continue;
            }
        }
        if !current.is_empty() {
            current.push('\n');
        }
        current.push_str(line);
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

#[async_trait]
impl Output for TelegramOutput {
    fn name(&self) -> &'static str {
        "telegram"
    }

    async fn deliver(&self, digest: &Digest) -> Result<String> {
        let message = self.format_message(digest);
        let chunks = chunk_message(&message, TELEGRAM_MESSAGE_LIMIT);
        for chunk in &chunks {
            self.send_message(chunk).await?;
        }
        tracing::info!(chunks = chunks.len(), items = digest.items.len(), "digest delivered to Telegram");
        Ok("ok".to_string())
    }
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
        return Err(PipelineError::HttpError { status, body, retry_after });
    }
    resp.json().await.map_err(PipelineError::from).or(Ok(Value::Null))
}

/// Build the set of enabled output channels for a run from their names.
pub fn build_outputs(
    names: &[String],
    client: Client,
    limiter: Arc<RateLimiter>,
    markdown_dir: impl Into<PathBuf>,
    notion_token: &str,
    notion_database_id: &str,
    telegram_bot_token: &str,
    telegram_chat_id: &str,
) -> Result<Vec<Arc<dyn Output>>> {
    let requested: HashSet<&str> = names.iter().map(String::as_str).collect();
    let mut outputs: Vec<Arc<dyn Output>> = Vec::new();

    if requested.contains("markdown") {
        outputs.push(Arc::new(MarkdownOutput::new(markdown_dir)));
    }
    if requested.contains("notion") {
        if notion_token.is_empty() || notion_database_id.is_empty() {
            return Err(PipelineError::InvalidConfig("notion output requested but token/database_id missing".into()));
        }
        outputs.push(Arc::new(NotionOutput::new(client.clone(), limiter.clone(), notion_token, notion_database_id)));
    }
    if requested.contains("telegram") {
        if telegram_bot_token.is_empty() || telegram_chat_id.is_empty() {
            return Err(PipelineError::InvalidConfig("telegram output requested but bot_token/chat_id missing".into()));
        }
        outputs.push(Arc::new(TelegramOutput::new(client, limiter, telegram_bot_token, telegram_chat_id)));
    }

    Ok(outputs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{
        Confidence, Credibility, EventType, ImpactHorizon, OverallSentiment, SourceType, TickerSummary, ThesisRelation,
    };
    use chrono::Utc;
    use uuid::Uuid;

    fn sample_digest() -> Digest {
        let news = crate::domain::NewsItem {
            id: Uuid::new_v4(),
            canonical_url: "https://example.com/a".into(),
            title: "NVIDIA beats on datacenter revenue".into(),
            title_normalized: "nvidia beats on datacenter revenue".into(),
            content_hash: "hash".into(),
            summary: None,
            published_at: Utc::now(),
            source: "finnhub".into(),
            source_type: SourceType::News,
            credibility: Credibility::Medium,
            tickers: vec!["NVDA".into()],
        };
        let analysis = crate::domain::AnalysisResult {
            news_item_id: news.id,
            provider: "mock".into(),
            model: "mock-1".into(),
            prompt_version: "v1".into(),
            event_type: EventType::Earnings,
            impact_direction: ImpactDirection::Bullish,
            impact_horizon: ImpactHorizon::Short,
            thesis_relation: ThesisRelation::Supports,
            confidence: Confidence::High,
            confidence_reason: "clear beat".into(),
            summary: "Strong datacenter beat.".into(),
            key_facts: vec!["Revenue up 20% YoY".into()],
            watch_next: "Next earnings call".into(),
            tokens_used: 100,
            cost_usd: 0.01,
        };
        let run_id = Uuid::new_v4();
        let now = Utc::now();
        let mut ticker_summaries = std::collections::HashMap::new();
        ticker_summaries.insert(
            "NVDA".to_string(),
            TickerSummary {
                ticker: "NVDA".into(),
                company_name: "NVIDIA".into(),
                news_count: 1,
                overall_sentiment: OverallSentiment::Bullish,
                summary: "Strong day for NVDA.".into(),
                key_events: vec![],
                thesis_impact: "Supports thesis.".into(),
                action_suggestion: "Hold.".into(),
                risk_alerts: vec![],
                bullish_count: 1,
                bearish_count: 0,
                neutral_count: 0,
            },
        );
        Digest {
            run_id,
            generated_at: now,
            window_start: now - chrono::Duration::hours(24),
            window_end: now,
            items: vec![DigestItem { news, analysis: Some(analysis) }],
            total_collected: 5,
            total_after_dedup: 3,
            total_analyzed: 1,
            total_failed: 0,
            ticker_summaries,
        }
    }

    #[tokio::test]
    async fn test_markdown_output_writes_file_and_returns_path() {
        let dir = tempfile::tempdir().unwrap();
        let output = MarkdownOutput::new(dir.path());
        let digest = sample_digest();
        let path = output.deliver(&digest).await.unwrap();
        assert!(std::path::Path::new(&path).exists());
        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("NVDA"));
        assert!(content.contains("Market Sentiment Dashboard"));
    }

    #[test]
    fn test_chunk_message_respects_limit() {
        let text = "line\n".repeat(2000);
        let chunks = chunk_message(&text, 100);
        assert!(chunks.len() > 1);
        for chunk in &chunks {
            assert!(chunk.len() <= 100 || !chunk.contains('\n'));
        }
    }

    #[test]
    fn test_chunk_message_single_chunk_when_short() {
        let chunks = chunk_message("short message", 4096);
        assert_eq!(chunks.len(), 1);
    }

    #[test]
    fn test_build_outputs_errors_on_missing_notion_config() {
        let client = Client::new();
        let limiter = Arc::new(RateLimiter::new(crate::rate_limit::default_configs()));
        let result = build_outputs(
            &["notion".to_string()],
            client,
            limiter,
            "data/digests",
            "",
            "",
            "",
            "",
        );
        assert!(result.is_err());
    }
}

//! LLM analysis provider contract: strict-JSON protocol with one-shot repair
//! and a deterministic fallback, plus a provider registry and concrete backends.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;

use crate::domain::{
    limits, AnalysisResult, Confidence, EventType, ImpactDirection, ImpactHorizon, NewsItem,
    OverallSentiment, ThesisRelation, TickerSummary,
};
use crate::error::Result;
use crate::parsing::parse_value_defensively;
use crate::types::PipelineContext;
use crate::PipelineError;

const DEFAULT_ANALYSIS_PROMPT: &str = r#"You are a financial analyst assistant. Analyze the following news item
against the investor's thesis and respond with a single JSON object only.

Tickers: {tickers}
Source: {source}
Published: {published_at}
Title: {title}
Content: {content}

Investment thesis: {thesis}

Respond with exactly this JSON shape:
{{
  "event_type": "earnings|guidance|regulatory|contract|product|accident|macro|rumor|other",
  "impact_direction": "bullish|bearish|neutral",
  "impact_horizon": "short|medium|long",
  "thesis_relation": "supports|weakens|unrelated",
  "confidence": "high|medium|low",
  "confidence_reason": "<=100 chars",
  "summary": "<=100 chars",
  "key_facts": ["<=3 items, each <=200 chars"],
  "watch_next": "<=50 chars"
}}"#;

const DEFAULT_TICKER_SUMMARY_PROMPT: &str = r#"You are a financial analyst assistant. Summarize the following news
items for {ticker} ({company_name}) against the investor's thesis and respond
with a single JSON object only.

Investment thesis: {thesis}

News items:
{news_list}

Respond with exactly this JSON shape:
{{
  "overall_sentiment": "bullish|bearish|neutral|mixed",
  "summary": "1-2 sentences",
  "key_events": ["up to 3 short items"],
  "thesis_impact": "free text",
  "action_suggestion": "free text",
  "risk_alerts": ["free text items"]
}}"#;

/// Intermediate, strictly-typed shape deserialized from the model's JSON response.
///
/// Field-for-field matches [`AnalysisResult`] minus the bookkeeping fields
/// (`news_item_id`, `provider`, `model`, `prompt_version`, `tokens_used`, `cost_usd`)
/// that the caller fills in after a successful parse.
#[derive(Debug, Deserialize)]
struct AnalysisFields {
    event_type: EventType,
    impact_direction: ImpactDirection,
    impact_horizon: ImpactHorizon,
    thesis_relation: ThesisRelation,
    confidence: Confidence,
    confidence_reason: String,
    summary: String,
    key_facts: Vec<String>,
    watch_next: String,
}

fn validate_fields(fields: &AnalysisFields) -> std::result::Result<(), String> {
    if fields.confidence_reason.chars().count() > limits::CONFIDENCE_REASON_MAX {
        return Err(format!(
            "confidence_reason exceeds {} characters",
            limits::CONFIDENCE_REASON_MAX
        ));
    }
    if fields.summary.chars().count() > limits::SUMMARY_MAX {
        return Err(format!("summary exceeds {} characters", limits::SUMMARY_MAX));
    }
    if fields.key_facts.len() > limits::KEY_FACTS_MAX_ITEMS {
        return Err(format!(
            "key_facts has more than {} items",
            limits::KEY_FACTS_MAX_ITEMS
        ));
    }
    if fields.key_facts.iter().any(|f| f.chars().count() > limits::KEY_FACT_MAX) {
        return Err(format!("a key_facts item exceeds {} characters", limits::KEY_FACT_MAX));
    }
    if fields.watch_next.chars().count() > limits::WATCH_NEXT_MAX {
        return Err(format!("watch_next exceeds {} characters", limits::WATCH_NEXT_MAX));
    }
    Ok(())
}

/// Parse and validate a raw model response into [`AnalysisFields`].
///
/// Detects a provider-surfaced `{"error": ...}` document as a validation
/// failure (triggers the repair path exactly as schema violations do).
fn parse_and_validate(raw: &str) -> std::result::Result<AnalysisFields, String> {
    let value = parse_value_defensively(raw).map_err(|e| e.to_string())?;

    if let Some(err) = value.get("error") {
        return Err(format!("provider returned an error object: {err}"));
    }

    let fields: AnalysisFields =
        serde_json::from_value(value).map_err(|e| format!("schema mismatch: {e}"))?;

    validate_fields(&fields)?;
    Ok(fields)
}

/// The hardcoded record returned when both the initial call and the one-shot
/// repair attempt fail to produce a valid document.
fn fallback_fields(news_title: &str) -> AnalysisFields {
    let truncated: String = news_title.chars().take(limits::SUMMARY_MAX).collect();
    AnalysisFields {
        event_type: EventType::Other,
        impact_direction: ImpactDirection::Neutral,
        impact_horizon: ImpactHorizon::Short,
        thesis_relation: ThesisRelation::Unrelated,
        confidence: Confidence::Low,
        confidence_reason: "Analysis failed, using fallback".to_string(),
        summary: truncated,
        key_facts: Vec::new(),
        watch_next: String::new(),
    }
}

fn strict_repair_prompt(original: &str, violation: &str) -> String {
    format!(
        "{original}\n\nYour previous response was invalid: {violation}. \
         Respond again with JSON ONLY, no prose, no markdown fences. \
         event_type must be exactly one of: earnings, guidance, regulatory, contract, \
         product, accident, macro, rumor, other. impact_direction must be exactly one of: \
         bullish, bearish, neutral. impact_horizon must be exactly one of: short, medium, long. \
         thesis_relation must be exactly one of: supports, weakens, unrelated. confidence must \
         be exactly one of: high, medium, low. summary must be at most {} characters. key_facts \
         must have at most {} items. watch_next must be at most {} characters.",
        limits::SUMMARY_MAX,
        limits::KEY_FACTS_MAX_ITEMS,
        limits::WATCH_NEXT_MAX,
    )
}

/// Abstraction over LLM analysis providers. Only [`call_api`](Self::call_api)
/// must be implemented; [`analyze`](Self::analyze) and
/// [`generate_ticker_summary`](Self::generate_ticker_summary) carry the
/// strict-JSON protocol (one-shot repair, deterministic fallback) as default
/// methods shared by every provider.
#[async_trait]
pub trait AnalysisProvider: Send + Sync {
    /// Provider name, e.g. `"gemini"`.
    fn name(&self) -> &'static str;
    /// Model identifier used for bookkeeping and cost estimation.
    fn model(&self) -> &str;
    /// Template/schema version stamped onto every [`AnalysisResult`].
    fn prompt_version(&self) -> &str {
        "1.0"
    }

    /// Issue one raw completion call. Returns `(text, tokens_used, cost_usd)`.
    async fn call_api(&self, prompt: &str) -> Result<(String, u32, f64)>;

    /// Analyze one news item against a ticker's thesis.
    async fn analyze(&self, news: &NewsItem, thesis: &str) -> Result<(AnalysisResult, u32, f64)> {
        let mut ctx = PipelineContext::new();
        ctx = ctx
            .insert("tickers", news.tickers.join(", "))
            .insert("title", news.title.clone())
            .insert("source", news.source.clone())
            .insert("published_at", news.published_at.to_rfc3339())
            .insert("content", news.summary.clone().unwrap_or_default())
            .insert("thesis", thesis.to_string());
        let prompt = crate::prompt::render(DEFAULT_ANALYSIS_PROMPT, "", &ctx);

        let (raw1, tokens1, cost1) = self.call_api(&prompt).await?;

        let (fields, tokens_used, cost_usd) = match parse_and_validate(&raw1) {
            Ok(fields) => (fields, tokens1, cost1),
            Err(violation) => {
                let repair_prompt = strict_repair_prompt(&prompt, &violation);
                let (raw2, tokens2, cost2) = self.call_api(&repair_prompt).await?;
                let total_tokens = tokens1 + tokens2;
                let total_cost = cost1 + cost2;
                match parse_and_validate(&raw2) {
                    Ok(fields) => (fields, total_tokens, total_cost),
                    Err(_) => (fallback_fields(&news.title), total_tokens, total_cost),
                }
            }
        };

        Ok((
            AnalysisResult {
                news_item_id: news.id,
                provider: self.name().to_string(),
                model: self.model().to_string(),
                prompt_version: self.prompt_version().to_string(),
                event_type: fields.event_type,
                impact_direction: fields.impact_direction,
                impact_horizon: fields.impact_horizon,
                thesis_relation: fields.thesis_relation,
                confidence: fields.confidence,
                confidence_reason: fields.confidence_reason,
                summary: fields.summary,
                key_facts: fields.key_facts,
                watch_next: fields.watch_next,
                tokens_used,
                cost_usd,
            },
            tokens_used,
            cost_usd,
        ))
    }

    /// Synthesize a per-ticker summary over a run's analyzed items.
    ///
    /// Looser than [`analyze`](Self::analyze): a missing/unparseable response,
    /// or any call failure, falls back to a deterministic tally rather than
    /// retrying with a repair prompt.
    async fn generate_ticker_summary(
        &self,
        ticker: &str,
        company_name: &str,
        items: &[(NewsItem, Option<AnalysisResult>)],
        thesis: &str,
    ) -> Result<(TickerSummary, u32, f64)> {
        let news_list = items
            .iter()
            .enumerate()
            .map(|(i, (news, _))| format!("{}. {}", i + 1, news.title))
            .collect::<Vec<_>>()
            .join("\n");

        let mut ctx = PipelineContext::new();
        ctx = ctx
            .insert("ticker", ticker.to_string())
            .insert("company_name", company_name.to_string())
            .insert("thesis", thesis.to_string())
            .insert("news_list", news_list);
        let prompt = crate::prompt::render(DEFAULT_TICKER_SUMMARY_PROMPT, "", &ctx);

        let call_result = self.call_api(&prompt).await;

        match call_result {
            Ok((raw, tokens, cost)) if !raw.trim().is_empty() => {
                match parse_ticker_summary(&raw, ticker, company_name, items) {
                    Ok(summary) => Ok((summary, tokens, cost)),
                    Err(_) => Ok((fallback_ticker_summary(ticker, company_name, items), tokens, cost)),
                }
            }
            _ => Ok((fallback_ticker_summary(ticker, company_name, items), 0, 0.0)),
        }
    }
}

#[derive(Debug, Deserialize)]
struct TickerSummaryFields {
    #[serde(default)]
    overall_sentiment: Option<OverallSentiment>,
    #[serde(default)]
    summary: Option<String>,
    #[serde(default)]
    key_events: Option<Vec<String>>,
    #[serde(default)]
    thesis_impact: Option<String>,
    #[serde(default)]
    action_suggestion: Option<String>,
    #[serde(default)]
    risk_alerts: Option<Vec<String>>,
}

fn parse_ticker_summary(
    raw: &str,
    ticker: &str,
    company_name: &str,
    items: &[(NewsItem, Option<AnalysisResult>)],
) -> std::result::Result<TickerSummary, String> {
    let value = parse_value_defensively(raw).map_err(|e| e.to_string())?;
    let fields: TickerSummaryFields =
        serde_json::from_value(value).map_err(|e| format!("schema mismatch: {e}"))?;

    let (bullish, bearish, neutral) = sentiment_tally(items);

    Ok(TickerSummary {
        ticker: ticker.to_string(),
        company_name: company_name.to_string(),
        news_count: items.len() as u32,
        overall_sentiment: fields.overall_sentiment.unwrap_or_else(|| default_sentiment(bullish, bearish)),
        summary: fields.summary.unwrap_or_default(),
        key_events: fields.key_events.unwrap_or_else(|| default_key_events(items)),
        thesis_impact: fields.thesis_impact.unwrap_or_else(|| "Requires manual assessment".to_string()),
        action_suggestion: fields.action_suggestion.unwrap_or_else(|| "Continue monitoring".to_string()),
        risk_alerts: fields.risk_alerts.unwrap_or_default(),
        bullish_count: bullish,
        bearish_count: bearish,
        neutral_count: neutral,
    })
}

fn fallback_ticker_summary(
    ticker: &str,
    company_name: &str,
    items: &[(NewsItem, Option<AnalysisResult>)],
) -> TickerSummary {
    let (bullish, bearish, neutral) = sentiment_tally(items);
    TickerSummary {
        ticker: ticker.to_string(),
        company_name: company_name.to_string(),
        news_count: items.len() as u32,
        overall_sentiment: default_sentiment(bullish, bearish),
        summary: "Automated summary unavailable; see individual items.".to_string(),
        key_events: default_key_events(items),
        thesis_impact: "Requires manual assessment".to_string(),
        action_suggestion: "Continue monitoring".to_string(),
        risk_alerts: Vec::new(),
        bullish_count: bullish,
        bearish_count: bearish,
        neutral_count: neutral,
    }
}

fn sentiment_tally(items: &[(NewsItem, Option<AnalysisResult>)]) -> (u32, u32, u32) {
    let mut bullish = 0;
    let mut bearish = 0;
    let mut neutral = 0;
    for (_, analysis) in items {
        match analysis.as_ref().map(|a| a.impact_direction) {
            Some(ImpactDirection::Bullish) => bullish += 1,
            Some(ImpactDirection::Bearish) => bearish += 1,
            _ => neutral += 1,
        }
    }
    (bullish, bearish, neutral)
}

fn default_sentiment(bullish: u32, bearish: u32) -> OverallSentiment {
    match bullish.cmp(&bearish) {
        std::cmp::Ordering::Greater => OverallSentiment::Bullish,
        std::cmp::Ordering::Less => OverallSentiment::Bearish,
        std::cmp::Ordering::Equal if bullish > 0 => OverallSentiment::Mixed,
        _ => OverallSentiment::Neutral,
    }
}

fn default_key_events(items: &[(NewsItem, Option<AnalysisResult>)]) -> Vec<String> {
    items.iter().take(3).map(|(news, _)| news.title.clone()).collect()
}

/// Explicit-registration constructor registry, mirroring the original's
/// factory pattern (not metaclass auto-registration).
#[derive(Default)]
pub struct ProviderRegistry {
    constructors: HashMap<String, Arc<dyn Fn() -> Arc<dyn AnalysisProvider> + Send + Sync>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, name: &str, ctor: F)
    where
        F: Fn() -> Arc<dyn AnalysisProvider> + Send + Sync + 'static,
    {
        self.constructors.insert(name.to_string(), Arc::new(ctor));
    }

    pub fn create(&self, name: &str) -> Result<Arc<dyn AnalysisProvider>> {
        self.constructors
            .get(name)
            .map(|ctor| ctor())
            .ok_or_else(|| PipelineError::UnknownProvider(name.to_string(), self.list_providers()))
    }

    pub fn list_providers(&self) -> Vec<String> {
        let mut names: Vec<String> = self.constructors.keys().cloned().collect();
        names.sort();
        names
    }
}

/// Deterministic, schema-valid test provider. Cycles through programmed
/// responses in order; falls back to a default valid response once exhausted.
pub struct MockProvider {
    pub responses: std::sync::Mutex<std::collections::VecDeque<String>>,
}

impl MockProvider {
    pub fn new(responses: Vec<String>) -> Self {
        Self {
            responses: std::sync::Mutex::new(responses.into_iter().collect()),
        }
    }

    pub fn always_valid() -> Self {
        Self::new(vec![r#"{"event_type":"other","impact_direction":"neutral","impact_horizon":"short","thesis_relation":"unrelated","confidence":"low","confidence_reason":"mock","summary":"mock summary","key_facts":[],"watch_next":""}"#.to_string()])
    }
}

#[async_trait]
impl AnalysisProvider for MockProvider {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn model(&self) -> &str {
        "mock-model"
    }

    async fn call_api(&self, _prompt: &str) -> Result<(String, u32, f64)> {
        let mut queue = self.responses.lock().unwrap();
        let response = if queue.len() > 1 {
            queue.pop_front().unwrap()
        } else {
            queue.front().cloned().unwrap_or_default()
        };
        Ok((response, 10, 0.0001))
    }
}

/// Calls a local Ollama server via the teacher's [`OllamaBackend`].
pub struct OllamaAnalysisProvider {
    client: reqwest::Client,
    base_url: String,
    model: String,
}

impl OllamaAnalysisProvider {
    pub fn new(base_url: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            model: model.into(),
        }
    }
}

#[async_trait]
impl AnalysisProvider for OllamaAnalysisProvider {
    fn name(&self) -> &'static str {
        "ollama"
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn call_api(&self, prompt: &str) -> Result<(String, u32, f64)> {
        use crate::backend::{Backend, LlmRequest};
        use crate::client::LlmConfig;

        let backend = crate::backend::OllamaBackend;
        let request = LlmRequest {
            model: self.model.clone(),
            system_prompt: None,
            prompt: prompt.to_string(),
            messages: Vec::new(),
            config: LlmConfig::default().with_temperature(0.1).with_json_mode(true),
            stream: false,
        };
        let response = backend.complete(&self.client, &self.base_url, &request).await?;
        let tokens = response
            .metadata
            .as_ref()
            .and_then(|m| m.get("eval_count"))
            .and_then(|v| v.as_u64())
            .unwrap_or_else(|| (response.text.len() / 4) as u64) as u32;
        Ok((response.text, tokens, 0.0))
    }
}

/// Calls Google's Gemini `generateContent` REST endpoint directly, since no
/// Rust SDK for it exists anywhere in the example pack.
pub struct GeminiProvider {
    client: reqwest::Client,
    api_key: String,
    model: String,
    api_endpoint: String,
}

impl GeminiProvider {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>, api_endpoint: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: api_key.into(),
            model: model.into(),
            api_endpoint: api_endpoint.into(),
        }
    }
}

#[async_trait]
impl AnalysisProvider for GeminiProvider {
    fn name(&self) -> &'static str {
        "gemini"
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn call_api(&self, prompt: &str) -> Result<(String, u32, f64)> {
        let url = format!(
            "{}/v1beta/models/{}:generateContent?key={}",
            self.api_endpoint.trim_end_matches('/'),
            self.model,
            self.api_key
        );
        let body = serde_json::json!({
            "contents": [{"parts": [{"text": prompt}]}],
            "generationConfig": {"temperature": 0.1},
        });
        let resp = self.client.post(&url).json(&body).send().await?;
        let status = resp.status().as_u16();
        if !resp.status().is_success() {
            let retry_after = resp
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(crate::rate_limit::parse_retry_after);
            let text = resp.text().await.unwrap_or_default();
            return Err(PipelineError::HttpError { status, body: text, retry_after });
        }
        let value: serde_json::Value = resp.json().await?;
        let text = value
            .get("candidates")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("content"))
            .and_then(|c| c.get("parts"))
            .and_then(|p| p.get(0))
            .and_then(|p| p.get("text"))
            .and_then(|t| t.as_str())
            .unwrap_or_default()
            .to_string();
        let tokens = value
            .get("usageMetadata")
            .and_then(|u| u.get("totalTokenCount"))
            .and_then(|v| v.as_u64())
            .unwrap_or_else(|| (text.len() / 4) as u64) as u32;
        Ok((text, tokens, tokens as f64 * 0.0000005))
    }
}

/// Calls OpenAI's `/v1/chat/completions` endpoint, routed through the
/// `openai` rate-limit bucket — the one provider the original wraps with
/// its rate limiter explicitly (`rate_limiter.execute("openai", ...)`).
pub struct OpenAiAnalysisProvider {
    client: reqwest::Client,
    limiter: Arc<crate::rate_limit::RateLimiter>,
    api_key: String,
    model: String,
}

impl OpenAiAnalysisProvider {
    pub fn new(
        limiter: Arc<crate::rate_limit::RateLimiter>,
        api_key: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            limiter,
            api_key: api_key.into(),
            model: model.into(),
        }
    }

    /// USD per 1M tokens, matching the original's `PRICING` table; falls back
    /// to the `gpt-4o-mini` row for an unrecognized model.
    fn pricing(model: &str) -> (f64, f64) {
        match model {
            "gpt-4o" => (5.0, 15.0),
            "gpt-4o-mini" => (0.15, 0.6),
            "gpt-4-turbo" => (10.0, 30.0),
            "gpt-4" => (30.0, 60.0),
            "gpt-3.5-turbo" => (0.5, 1.5),
            _ => (0.15, 0.6),
        }
    }
}

#[async_trait]
impl AnalysisProvider for OpenAiAnalysisProvider {
    fn name(&self) -> &'static str {
        "openai"
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn call_api(&self, prompt: &str) -> Result<(String, u32, f64)> {
        let client = self.client.clone();
        let api_key = self.api_key.clone();
        let model = self.model.clone();
        let prompt = prompt.to_string();

        self.limiter
            .execute("openai", 3, move || {
                let client = client.clone();
                let api_key = api_key.clone();
                let model = model.clone();
                let prompt = prompt.clone();
                async move {
                    let body = serde_json::json!({
                        "model": model,
                        "messages": [
                            {"role": "system", "content": "You are a senior equity research analyst. Always respond with valid JSON only, no markdown or extra text."},
                            {"role": "user", "content": prompt},
                        ],
                        "temperature": 0.1,
                        "max_tokens": 1024,
                        "response_format": {"type": "json_object"},
                    });
                    let resp = client
                        .post("https://api.openai.com/v1/chat/completions")
                        .header("Authorization", format!("Bearer {api_key}"))
                        .json(&body)
                        .send()
                        .await?;
                    let status = resp.status().as_u16();
                    if !resp.status().is_success() {
                        let retry_after = resp
                            .headers()
                            .get("retry-after")
                            .and_then(|v| v.to_str().ok())
                            .and_then(crate::rate_limit::parse_retry_after);
                        let text = resp.text().await.unwrap_or_default();
                        return Err(PipelineError::HttpError { status, body: text, retry_after });
                    }
                    let value: serde_json::Value = resp.json().await?;
                    let text = value
                        .get("choices")
                        .and_then(|c| c.get(0))
                        .and_then(|c| c.get("message"))
                        .and_then(|m| m.get("content"))
                        .and_then(|t| t.as_str())
                        .unwrap_or_default()
                        .to_string();
                    let tokens_in = value.get("usage").and_then(|u| u.get("prompt_tokens")).and_then(|v| v.as_u64()).unwrap_or(0);
                    let tokens_out = value.get("usage").and_then(|u| u.get("completion_tokens")).and_then(|v| v.as_u64()).unwrap_or(0);
                    let (price_in, price_out) = Self::pricing(&model);
                    let cost = tokens_in as f64 * price_in / 1_000_000.0 + tokens_out as f64 * price_out / 1_000_000.0;
                    Ok((text, (tokens_in + tokens_out) as u32, cost))
                }
            })
            .await
    }
}

/// Calls Anthropic's Messages API directly.
pub struct ClaudeProvider {
    client: reqwest::Client,
    api_key: String,
    model: String,
}

impl ClaudeProvider {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: api_key.into(),
            model: model.into(),
        }
    }
}

#[async_trait]
impl AnalysisProvider for ClaudeProvider {
    fn name(&self) -> &'static str {
        "claude"
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn call_api(&self, prompt: &str) -> Result<(String, u32, f64)> {
        let body = serde_json::json!({
            "model": self.model,
            "max_tokens": 1024,
            "temperature": 0.1,
            "messages": [{"role": "user", "content": prompt}],
        });
        let resp = self
            .client
            .post("https://api.anthropic.com/v1/messages")
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .json(&body)
            .send()
            .await?;
        let status = resp.status().as_u16();
        if !resp.status().is_success() {
            let retry_after = resp
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(crate::rate_limit::parse_retry_after);
            let text = resp.text().await.unwrap_or_default();
            return Err(PipelineError::HttpError { status, body: text, retry_after });
        }
        let value: serde_json::Value = resp.json().await?;
        let text = value
            .get("content")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("text"))
            .and_then(|t| t.as_str())
            .unwrap_or_default()
            .to_string();
        let input_tokens = value.get("usage").and_then(|u| u.get("input_tokens")).and_then(|v| v.as_u64()).unwrap_or(0);
        let output_tokens = value.get("usage").and_then(|u| u.get("output_tokens")).and_then(|v| v.as_u64()).unwrap_or(0);
        let tokens = (input_tokens + output_tokens) as u32;
        Ok((text, tokens, input_tokens as f64 * 0.000003 + output_tokens as f64 * 0.000015))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;

    fn news() -> NewsItem {
        NewsItem {
            id: Uuid::new_v4(),
            canonical_url: "https://example.com/a".into(),
            title: "Nvidia beats earnings estimates".into(),
            title_normalized: "nvidia beats earnings estimates".into(),
            content_hash: "hash".into(),
            summary: Some("Nvidia reported record revenue.".into()),
            published_at: Utc::now(),
            source: "finnhub".into(),
            source_type: crate::domain::SourceType::News,
            credibility: crate::domain::Credibility::Medium,
            tickers: vec!["NVDA".into()],
        }
    }

    #[tokio::test]
    async fn test_analyze_valid_first_response_no_repair() {
        let provider = MockProvider::new(vec![
            r#"{"event_type":"earnings","impact_direction":"bullish","impact_horizon":"short","thesis_relation":"supports","confidence":"high","confidence_reason":"clear beat","summary":"Beat estimates","key_facts":["Revenue up"],"watch_next":"next guidance"}"#.to_string(),
        ]);
        let (result, tokens, _cost) = provider.analyze(&news(), "Long NVDA on AI capex").await.unwrap();
        assert_eq!(result.event_type, EventType::Earnings);
        assert_eq!(result.impact_direction, ImpactDirection::Bullish);
        assert_eq!(tokens, 10);
    }

    #[tokio::test]
    async fn test_analyze_repairs_on_wrong_case_enum() {
        let provider = MockProvider::new(vec![
            r#"{"event_type":"EARNINGS","impact_direction":"bullish","impact_horizon":"short","thesis_relation":"supports","confidence":"high","confidence_reason":"clear beat","summary":"Beat estimates","key_facts":[],"watch_next":""}"#.to_string(),
            r#"{"event_type":"earnings","impact_direction":"bullish","impact_horizon":"short","thesis_relation":"supports","confidence":"high","confidence_reason":"clear beat","summary":"Beat estimates","key_facts":[],"watch_next":""}"#.to_string(),
        ]);
        let (result, tokens, _cost) = provider.analyze(&news(), "thesis").await.unwrap();
        assert_eq!(result.event_type, EventType::Earnings);
        assert_eq!(tokens, 20);
    }

    #[tokio::test]
    async fn test_analyze_falls_back_after_double_failure() {
        let provider = MockProvider::new(vec!["not json at all".to_string(), "still not json".to_string()]);
        let (result, tokens, _cost) = provider.analyze(&news(), "thesis").await.unwrap();
        assert_eq!(result.event_type, EventType::Other);
        assert_eq!(result.impact_direction, ImpactDirection::Neutral);
        assert_eq!(result.confidence_reason, "Analysis failed, using fallback");
        assert_eq!(tokens, 20);
    }

    #[tokio::test]
    async fn test_analyze_rejects_oversized_summary_and_repairs() {
        let long_summary = "x".repeat(150);
        let first = format!(
            r#"{{"event_type":"other","impact_direction":"neutral","impact_horizon":"short","thesis_relation":"unrelated","confidence":"low","confidence_reason":"r","summary":"{long_summary}","key_facts":[],"watch_next":""}}"#
        );
        let second = r#"{"event_type":"other","impact_direction":"neutral","impact_horizon":"short","thesis_relation":"unrelated","confidence":"low","confidence_reason":"r","summary":"short","key_facts":[],"watch_next":""}"#.to_string();
        let provider = MockProvider::new(vec![first, second]);
        let (result, _tokens, _cost) = provider.analyze(&news(), "thesis").await.unwrap();
        assert_eq!(result.summary, "short");
    }

    #[tokio::test]
    async fn test_generate_ticker_summary_valid_response() {
        let provider = MockProvider::new(vec![
            r#"{"overall_sentiment":"bullish","summary":"Strong quarter","key_events":["Beat earnings"],"thesis_impact":"Supports thesis","action_suggestion":"Hold","risk_alerts":[]}"#.to_string(),
        ]);
        let items = vec![(news(), None)];
        let (summary, _tokens, _cost) = provider
            .generate_ticker_summary("NVDA", "NVIDIA Corp", &items, "thesis")
            .await
            .unwrap();
        assert_eq!(summary.overall_sentiment, OverallSentiment::Bullish);
        assert_eq!(summary.news_count, 1);
    }

    #[tokio::test]
    async fn test_generate_ticker_summary_falls_back_on_empty_response() {
        let provider = MockProvider::new(vec!["".to_string()]);
        let items = vec![(news(), None)];
        let (summary, tokens, cost) = provider
            .generate_ticker_summary("NVDA", "NVIDIA Corp", &items, "thesis")
            .await
            .unwrap();
        assert_eq!(summary.action_suggestion, "Continue monitoring");
        assert_eq!(tokens, 0);
        assert_eq!(cost, 0.0);
    }

    #[test]
    fn test_registry_unknown_provider_lists_available() {
        let mut registry = ProviderRegistry::new();
        registry.register("mock", || Arc::new(MockProvider::always_valid()));
        let err = registry.create("nonexistent").unwrap_err();
        match err {
            PipelineError::UnknownProvider(name, available) => {
                assert_eq!(name, "nonexistent");
                assert_eq!(available, vec!["mock".to_string()]);
            }
            other => panic!("expected UnknownProvider, got {other:?}"),
        }
    }

    #[test]
    fn test_registry_create_known_provider() {
        let mut registry = ProviderRegistry::new();
        registry.register("mock", || Arc::new(MockProvider::always_valid()));
        let provider = registry.create("mock").unwrap();
        assert_eq!(provider.name(), "mock");
    }
}

//! Manual pipeline entry point. Grounded on `original_source/backend/app/cli.py`:
//! loads settings, wires collectors/provider/outputs from them, runs one
//! pipeline pass, and prints a terminal summary.

use std::sync::Arc;

use clap::Parser;
use news_digest::analysis::{
    AnalysisProvider, ClaudeProvider, GeminiProvider, MockProvider, OllamaAnalysisProvider,
    OpenAiAnalysisProvider,
};
use news_digest::collector::{Collector, FinnhubCollector, SecEdgarCollector};
use news_digest::config::Settings;
use news_digest::output::build_outputs;
use news_digest::rate_limit::{default_configs, RateLimiter};
use news_digest::store::{InMemoryStore, Store};
use news_digest::watchlist::load_watchlist;
use news_digest::{PipelineError, PipelineOrchestrator, Result};

/// NewsFeed Pipeline CLI — watchlist-driven financial news and filings pipeline.
#[derive(Parser, Debug)]
#[command(name = "news-digest", about = "Run the watchlist news pipeline once")]
struct Cli {
    /// Hours to look back for news.
    #[arg(long, default_value_t = 24)]
    hours: i64,

    /// Comma-separated ticker list; defaults to the full watchlist.
    #[arg(long)]
    tickers: Option<String>,

    /// Cap the number of analyzed news items per ticker.
    #[arg(long)]
    limit: Option<u32>,

    /// Enable debug logging.
    #[arg(long)]
    debug: bool,

    /// Path to the watchlist YAML file; defaults to `Settings::watchlist_path`.
    #[arg(long)]
    watchlist: Option<String>,

    /// Path to an env file to read configuration from, instead of `.env`.
    #[arg(long)]
    config: Option<String>,
}

fn init_logging(debug: bool) {
    let default_level = if debug { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn build_provider(settings: &Settings, limiter: Arc<RateLimiter>) -> Option<Arc<dyn AnalysisProvider>> {
    let api_key = settings.current_ai_api_key();
    match settings.ai_provider.as_str() {
        "gemini" if !api_key.is_empty() => Some(Arc::new(GeminiProvider::new(
            api_key,
            settings.gemini_model.clone(),
            settings.gemini_api_endpoint.clone(),
        )) as Arc<dyn AnalysisProvider>),
        "openai" if !api_key.is_empty() => Some(Arc::new(OpenAiAnalysisProvider::new(
            limiter,
            api_key,
            settings.openai_model.clone(),
        )) as Arc<dyn AnalysisProvider>),
        "claude" if !api_key.is_empty() => {
            Some(Arc::new(ClaudeProvider::new(api_key, settings.claude_model.clone())) as Arc<dyn AnalysisProvider>)
        }
        "ollama" => Some(Arc::new(OllamaAnalysisProvider::new(
            settings.ollama_base_url.clone(),
            settings.ollama_model.clone(),
        )) as Arc<dyn AnalysisProvider>),
        "mock" => Some(Arc::new(MockProvider::always_valid()) as Arc<dyn AnalysisProvider>),
        _ => {
            tracing::warn!(provider = %settings.ai_provider, "no API key configured for the selected provider; running in no-AI mode");
            None
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let settings = match &cli.config {
        Some(path) => Settings::load_from(path)?,
        None => Settings::load()?,
    };
    let client = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(30))
        .build()
        .map_err(PipelineError::from)?;
    let limiter = Arc::new(RateLimiter::new(default_configs()));
    let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());

    let watchlist_path = cli.watchlist.clone().unwrap_or_else(|| settings.watchlist_path.clone());
    let entries = load_watchlist(&watchlist_path)?;
    for entry in entries {
        store.upsert_watchlist_entry(entry).await?;
    }

    let mut orchestrator = PipelineOrchestrator::new(store.clone())
        .with_hours_lookback(cli.hours)
        .with_limit_per_ticker(cli.limit);

    if settings.finnhub_enabled && !settings.finnhub_api_key.is_empty() {
        let collector: Arc<dyn Collector> =
            Arc::new(FinnhubCollector::new(client.clone(), limiter.clone(), settings.finnhub_api_key.clone()));
        orchestrator = orchestrator.with_collector(collector);
    }
    if settings.sec_enabled {
        let collector: Arc<dyn Collector> =
            Arc::new(SecEdgarCollector::new(client.clone(), limiter.clone(), settings.sec_user_agent.clone()));
        orchestrator = orchestrator.with_collector(collector);
    }

    if let Some(provider) = build_provider(&settings, limiter.clone()) {
        orchestrator = orchestrator.with_provider(provider);
    }

    let outputs = build_outputs(
        &settings.outputs,
        client,
        limiter,
        "data/digests",
        &settings.notion_token,
        &settings.notion_database_id,
        &settings.telegram_bot_token,
        &settings.telegram_chat_id,
    )?;
    orchestrator = orchestrator.with_outputs(outputs);

    let tickers = cli
        .tickers
        .map(|raw| raw.split(',').map(|t| t.trim().to_uppercase()).filter(|t| !t.is_empty()).collect());

    tracing::info!(hours = cli.hours, tickers = ?tickers, "starting pipeline");
    let (run, digest) = orchestrator.run(None, tickers, None).await?;

    println!("\n{}", "=".repeat(60));
    println!("[PIPELINE COMPLETED]");
    println!("{}", "=".repeat(60));
    println!("Run ID: {}", run.run_id);
    println!("Status: {:?}", run.status);
    println!("Window: {} - {}", digest.window_start, digest.window_end);
    println!("Total collected: {}", digest.total_collected);
    println!("After dedup: {}", digest.total_after_dedup);
    println!("Analyzed: {} success, {} failed", digest.total_analyzed, digest.total_failed);

    let high_impact = digest.high_impact_items();
    if !high_impact.is_empty() {
        println!("\n[TOP NEWS]");
        for (i, item) in high_impact.iter().take(5).enumerate() {
            let impact = item
                .analysis
                .as_ref()
                .map(|a| format!("{:?}", a.impact_direction).to_uppercase())
                .unwrap_or_else(|| "N/A".to_string());
            let title: String = item.news.title.chars().take(60).collect();
            println!("  {}. [{}] {}...", i + 1, impact, title);
        }
    }
    println!("{}", "=".repeat(60));

    if run.status == news_digest::domain::RunStatus::Failed {
        std::process::exit(1);
    }

    Ok(())
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(cli.debug);

    if let Err(e) = run(cli).await {
        tracing::error!(error = %e, "pipeline failed");
        eprintln!("Pipeline failed: {e}");
        std::process::exit(1);
    }
}

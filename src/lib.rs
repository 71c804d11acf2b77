//! # news-digest
//!
//! Watchlist-driven financial news and filings pipeline: rate-limited
//! collection from multiple sources, three-stage deduplication, strict-JSON
//! LLM analysis with schema repair, and multi-channel digest delivery.
//!
//! ## Core Concepts
//!
//! - **[`Collector`](collector::Collector)** — fetches raw items for a set
//!   of tickers from one upstream source (news API, filings search).
//! - **[`Deduplicator`](dedup::Deduplicator)** — three-stage dedup (URL
//!   canonicalization, content hash, title similarity).
//! - **[`AnalysisProvider`](analysis::AnalysisProvider)** — calls an LLM
//!   with a strict-JSON protocol, one-shot repair, and deterministic
//!   fallback.
//! - **[`Output`]** — delivers an assembled digest to a channel (Markdown,
//!   Notion, Telegram).
//! - **[`PipelineOrchestrator`]** — composes the above into a single
//!   observable run with per-stage counters and status lifecycle.
//!
//! LLM transport for the local-model path is built on a small [`Backend`]
//! abstraction (normalized request/response types, one implementation:
//! [`OllamaBackend`]) carried over from this crate's prior incarnation as a
//! generic LLM-workflow toolkit; `analysis::OpenAiAnalysisProvider`,
//! `analysis::GeminiProvider`, and `analysis::ClaudeProvider` call their
//! providers' REST APIs directly instead, since no `Backend` in the example
//! pack covers them.

pub mod backend;
pub mod client;
pub mod error;
pub mod output_parser;
pub mod parsing;
pub mod prompt;
pub mod streaming;
pub mod types;

// --- News digest domain ---
pub mod analysis;
pub mod collector;
pub mod config;
pub mod dedup;
pub mod domain;
pub mod normalize;
pub mod orchestrator;
pub mod output;
pub mod rate_limit;
pub mod run_ctx;
pub mod store;
pub mod watchlist;

pub use backend::{Backend, OllamaBackend};
pub use client::LlmConfig;
pub use error::{PipelineError, Result};
pub use streaming::StreamingDecoder;
pub use types::PipelineContext;

// --- Re-exports: news digest domain ---
pub use config::Settings;
pub use orchestrator::{CancellationToken, PipelineOrchestrator};
pub use output::Output;
pub use store::{InMemoryStore, Store};
pub use watchlist::load_watchlist;

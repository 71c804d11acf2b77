//! Typed application configuration, loaded from the environment (and an
//! optional `.env` file) the way the original's `pydantic-settings` layer did.

use serde::Deserialize;

use crate::error::Result;
use crate::PipelineError;

fn default_app_name() -> String {
    "news-digest".to_string()
}
fn default_database_url() -> String {
    "sqlite://./data/news-digest.db".to_string()
}
fn default_ai_provider() -> String {
    "gemini".to_string()
}
fn default_gemini_model() -> String {
    "gemini-pro".to_string()
}
fn default_openai_model() -> String {
    "gpt-4o-mini".to_string()
}
fn default_claude_model() -> String {
    "claude-3-haiku-20240307".to_string()
}
fn default_ollama_base_url() -> String {
    "http://localhost:11434".to_string()
}
fn default_ollama_model() -> String {
    "llama3".to_string()
}
fn default_sec_user_agent() -> String {
    "news-digest/0.1 (contact@example.com)".to_string()
}
fn default_true() -> bool {
    true
}
fn default_digest_hours_lookback() -> u32 {
    24
}
fn default_watchlist_path() -> String {
    "data/watchlist.yaml".to_string()
}
fn default_prompts_dir() -> String {
    "data/prompts".to_string()
}
fn default_smtp_port() -> u16 {
    587
}

/// Application configuration, deserialized from environment variables.
///
/// Mirrors the original's `Settings(BaseSettings)`: one flat struct, every
/// field has a default, `outputs` is canonicalized to a single CSV-backed
/// field rather than the original's `outputs`/`outputs_str` alias pair
/// (DESIGN.md open question #2).
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    #[serde(default = "default_app_name")]
    pub app_name: String,
    #[serde(default)]
    pub debug: bool,

    #[serde(default = "default_database_url")]
    pub database_url: String,

    #[serde(default = "default_ai_provider")]
    pub ai_provider: String,

    #[serde(default)]
    pub gemini_api_key: String,
    #[serde(default = "default_gemini_model")]
    pub gemini_model: String,
    #[serde(default)]
    pub gemini_api_endpoint: String,

    #[serde(default)]
    pub openai_api_key: String,
    #[serde(default = "default_openai_model")]
    pub openai_model: String,

    #[serde(default)]
    pub claude_api_key: String,
    #[serde(default = "default_claude_model")]
    pub claude_model: String,

    #[serde(default = "default_ollama_base_url")]
    pub ollama_base_url: String,
    #[serde(default = "default_ollama_model")]
    pub ollama_model: String,

    #[serde(default)]
    pub finnhub_api_key: String,
    #[serde(default = "default_true")]
    pub finnhub_enabled: bool,

    #[serde(default = "default_true")]
    pub sec_enabled: bool,
    #[serde(default = "default_sec_user_agent")]
    pub sec_user_agent: String,

    /// CSV list of enabled output channel names, e.g. `"notion,telegram"`.
    #[serde(default, deserialize_with = "deserialize_csv")]
    pub outputs: Vec<String>,

    #[serde(default)]
    pub notion_token: String,
    #[serde(default)]
    pub notion_database_id: String,

    #[serde(default)]
    pub smtp_host: String,
    #[serde(default = "default_smtp_port")]
    pub smtp_port: u16,
    #[serde(default)]
    pub smtp_user: String,
    #[serde(default)]
    pub smtp_password: String,
    #[serde(default)]
    pub email_to: String,

    #[serde(default)]
    pub telegram_bot_token: String,
    #[serde(default)]
    pub telegram_chat_id: String,

    #[serde(default = "default_digest_hours_lookback")]
    pub digest_hours_lookback: u32,

    #[serde(default)]
    pub limit_per_ticker: Option<u32>,

    #[serde(default = "default_watchlist_path")]
    pub watchlist_path: String,
    #[serde(default = "default_prompts_dir")]
    pub prompts_dir: String,
}

fn deserialize_csv<'de, D>(deserializer: D) -> std::result::Result<Vec<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    Ok(split_csv(&raw))
}

fn split_csv(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

impl Settings {
    /// Load settings from the process environment, reading `.env` first if present.
    pub fn load() -> Result<Self> {
        let _ = dotenvy::dotenv();
        Self::from_env()
    }

    /// Load settings after first reading a specific env file (the CLI's `--config` override).
    pub fn load_from(path: impl AsRef<std::path::Path>) -> Result<Self> {
        dotenvy::from_path(path.as_ref())
            .map_err(|e| PipelineError::InvalidConfig(format!("cannot read config {}: {e}", path.as_ref().display())))?;
        Self::from_env()
    }

    fn from_env() -> Result<Self> {
        envy::from_env::<Settings>()
            .map_err(|e| PipelineError::InvalidConfig(format!("failed to load settings: {e}")))
    }

    /// API key for the currently configured `ai_provider`.
    pub fn current_ai_api_key(&self) -> &str {
        match self.ai_provider.as_str() {
            "gemini" => &self.gemini_api_key,
            "openai" => &self.openai_api_key,
            "claude" => &self.claude_api_key,
            _ => "",
        }
    }

    /// Model identifier for the currently configured `ai_provider`.
    pub fn current_ai_model(&self) -> &str {
        match self.ai_provider.as_str() {
            "gemini" => &self.gemini_model,
            "openai" => &self.openai_model,
            "claude" => &self.claude_model,
            "ollama" => &self.ollama_model,
            _ => "",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_csv_trims_and_drops_empty() {
        assert_eq!(split_csv("notion, telegram ,,"), vec!["notion", "telegram"]);
    }

    #[test]
    fn test_split_csv_empty_string_yields_empty_vec() {
        assert!(split_csv("").is_empty());
    }

    #[test]
    fn test_current_ai_api_key_selects_by_provider() {
        let settings = Settings {
            app_name: default_app_name(),
            debug: false,
            database_url: default_database_url(),
            ai_provider: "claude".to_string(),
            gemini_api_key: "gk".to_string(),
            gemini_model: default_gemini_model(),
            gemini_api_endpoint: String::new(),
            openai_api_key: "ok".to_string(),
            openai_model: default_openai_model(),
            claude_api_key: "ck".to_string(),
            claude_model: default_claude_model(),
            ollama_base_url: default_ollama_base_url(),
            ollama_model: default_ollama_model(),
            finnhub_api_key: String::new(),
            finnhub_enabled: true,
            sec_enabled: true,
            sec_user_agent: default_sec_user_agent(),
            outputs: vec!["markdown".to_string()],
            notion_token: String::new(),
            notion_database_id: String::new(),
            smtp_host: String::new(),
            smtp_port: default_smtp_port(),
            smtp_user: String::new(),
            smtp_password: String::new(),
            email_to: String::new(),
            telegram_bot_token: String::new(),
            telegram_chat_id: String::new(),
            digest_hours_lookback: default_digest_hours_lookback(),
            limit_per_ticker: None,
            watchlist_path: default_watchlist_path(),
            prompts_dir: default_prompts_dir(),
        };
        assert_eq!(settings.current_ai_api_key(), "ck");
        assert_eq!(settings.current_ai_model(), "claude-3-haiku-20240307");
    }
}

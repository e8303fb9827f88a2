//! Run configuration.
//!
//! Credentials come from the CLI/environment, tunables from an optional YAML
//! file. Both are folded into one immutable [`Config`] in `main` and passed
//! down by reference.

use crate::cli::Cli;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::error::Error;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, instrument};

const DEFAULT_QUERIES: &[&str] = &[
    "过去24小时 中国股市 A股 港股 重大财经新闻 利好利空",
    "latest China stock market rumors and insider news last 24 hours",
    "A股 市场小作文 传闻 24小时内 热门",
    "新浪财经 东方财富 财联社 头条新闻 24小时",
];

const DEFAULT_FEEDS: &[&str] = &[
    "https://www.cnbc.com/id/100003114/device/rss/rss.html",
    "https://feeds.a.dj.com/rss/RSSMarketsMain.xml",
];

const DEFAULT_GEMINI_MODELS: &[&str] = &["gemini-1.5-flash", "gemini-1.5-pro", "gemini-pro"];
const DEFAULT_OPENAI_MODELS: &[&str] = &["gpt-4o-mini", "gpt-4o"];

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

/// Provider credentials and endpoints. `None` disables the provider.
#[derive(Clone, Default)]
pub struct Credentials {
    pub tavily_api_key: Option<String>,
    pub gemini_api_key: Option<String>,
    pub openai_api_key: Option<String>,
    pub openai_base_url: Option<String>,
    pub analyzer_endpoint: Option<String>,
    pub search_service_endpoint: Option<String>,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("tavily_api_key", &self.tavily_api_key.is_some())
            .field("gemini_api_key", &self.gemini_api_key.is_some())
            .field("openai_api_key", &self.openai_api_key.is_some())
            .field("openai_base_url", &self.openai_base_url)
            .field("analyzer_endpoint", &self.analyzer_endpoint)
            .field("search_service_endpoint", &self.search_service_endpoint)
            .finish()
    }
}

/// Limits, queries and model lists. Every key is optional in the YAML file.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Tunables {
    pub queries: Vec<String>,
    pub feeds: Vec<String>,
    pub gemini_models: Vec<String>,
    pub openai_models: Vec<String>,
    /// Per-query corpus length at which lower-priority tiers are skipped.
    pub sufficiency_threshold: usize,
    /// Combined corpus length below which the run ends with no report.
    pub min_corpus_len: usize,
    /// Character cap on each query's rendered contribution.
    pub per_query_budget: usize,
    /// Character cap on the corpus embedded in the prompt.
    pub prompt_budget: usize,
    pub call_timeout_secs: u64,
    pub rate_limit_backoff_ms: u64,
    pub search_limit: usize,
    pub query_concurrency: usize,
    pub utc_offset_hours: i32,
    pub subject_prefix: String,
    /// Skip TLS certificate checks for the read-only feed tier.
    pub insecure_feed_tls: bool,
}

impl Default for Tunables {
    fn default() -> Self {
        Self {
            queries: strings(DEFAULT_QUERIES),
            feeds: strings(DEFAULT_FEEDS),
            gemini_models: strings(DEFAULT_GEMINI_MODELS),
            openai_models: strings(DEFAULT_OPENAI_MODELS),
            sufficiency_threshold: 100,
            min_corpus_len: 300,
            per_query_budget: 2500,
            prompt_budget: 12_000,
            call_timeout_secs: 30,
            rate_limit_backoff_ms: 2000,
            search_limit: 20,
            query_concurrency: 4,
            utc_offset_hours: 8,
            subject_prefix: "【市场晨报】".to_string(),
            insecure_feed_tls: false,
        }
    }
}

/// Rejected configuration. Reported before any provider call.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("no queries configured")]
    NoQueries,
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
    #[error("min_corpus_len ({min}) must be larger than sufficiency_threshold ({threshold})")]
    MinimumBelowThreshold { min: usize, threshold: usize },
    #[error("utc_offset_hours out of range: {0}")]
    BadOffset(i32),
}

/// The immutable configuration for one run.
#[derive(Debug, Clone)]
pub struct Config {
    pub credentials: Credentials,
    pub tunables: Tunables,
    pub output_dir: String,
    pub sender: Option<String>,
    pub recipients: Vec<String>,
}

fn non_empty(v: &Option<String>) -> Option<String> {
    v.as_ref()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Split a comma separated address list; falls back to the sender.
pub fn parse_recipients(raw: Option<&str>, sender: Option<&str>) -> Vec<String> {
    let parsed: Vec<String> = raw
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect();
    if parsed.is_empty() {
        sender.map(|s| vec![s.to_string()]).unwrap_or_default()
    } else {
        parsed
    }
}

impl Config {
    /// Build the run configuration from parsed CLI arguments.
    ///
    /// # Errors
    ///
    /// Fails when the tunables file cannot be read or parsed, or when the
    /// result does not pass [`Config::validate`].
    #[instrument(level = "info", skip_all)]
    pub async fn from_cli(cli: &Cli) -> Result<Self, Box<dyn Error>> {
        let tunables = match &cli.config {
            Some(path) => {
                let raw = tokio::fs::read_to_string(path).await?;
                info!(path = %path, "Loaded tunables file");
                Self::parse_tunables(&raw)?
            }
            None => Tunables::default(),
        };

        let sender = non_empty(&cli.email_sender);
        let config = Self {
            credentials: Credentials {
                tavily_api_key: non_empty(&cli.tavily_api_key),
                gemini_api_key: non_empty(&cli.gemini_api_key),
                openai_api_key: non_empty(&cli.openai_api_key),
                openai_base_url: non_empty(&cli.openai_base_url),
                analyzer_endpoint: non_empty(&cli.analyzer_endpoint),
                search_service_endpoint: non_empty(&cli.search_service_endpoint),
            },
            recipients: parse_recipients(cli.email_receivers.as_deref(), sender.as_deref()),
            sender,
            tunables,
            output_dir: cli.output_dir.clone(),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn parse_tunables(raw: &str) -> Result<Tunables, serde_yaml::Error> {
        if raw.trim().is_empty() {
            return Ok(Tunables::default());
        }
        serde_yaml::from_str(raw)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let t = &self.tunables;
        if t.queries.iter().all(|q| q.trim().is_empty()) {
            return Err(ConfigError::NoQueries);
        }
        for (name, value) in [
            ("sufficiency_threshold", t.sufficiency_threshold),
            ("per_query_budget", t.per_query_budget),
            ("prompt_budget", t.prompt_budget),
            ("search_limit", t.search_limit),
            ("query_concurrency", t.query_concurrency),
        ] {
            if value == 0 {
                return Err(ConfigError::Zero(name));
            }
        }
        if t.call_timeout_secs == 0 {
            return Err(ConfigError::Zero("call_timeout_secs"));
        }
        if t.min_corpus_len <= t.sufficiency_threshold {
            return Err(ConfigError::MinimumBelowThreshold {
                min: t.min_corpus_len,
                threshold: t.sufficiency_threshold,
            });
        }
        if !(-12..=14).contains(&t.utc_offset_hours) {
            return Err(ConfigError::BadOffset(t.utc_offset_hours));
        }
        Ok(())
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.tunables.call_timeout_secs)
    }

    pub fn rate_limit_backoff(&self) -> Duration {
        Duration::from_millis(self.tunables.rate_limit_backoff_ms)
    }

    /// Flat string view of the non-secret settings, for collaborators that
    /// only accept a plain mapping.
    pub fn as_mapping(&self) -> BTreeMap<String, String> {
        let t = &self.tunables;
        let mut map = BTreeMap::new();
        map.insert("output_dir".to_string(), self.output_dir.clone());
        map.insert("search_limit".to_string(), t.search_limit.to_string());
        map.insert("call_timeout_secs".to_string(), t.call_timeout_secs.to_string());
        map.insert("utc_offset_hours".to_string(), t.utc_offset_hours.to_string());
        map.insert("queries".to_string(), t.queries.join("\n"));
        if let Some(endpoint) = &self.credentials.analyzer_endpoint {
            map.insert("analyzer_endpoint".to_string(), endpoint.clone());
        }
        if let Some(endpoint) = &self.credentials.search_service_endpoint {
            map.insert("search_service_endpoint".to_string(), endpoint.clone());
        }
        map
    }
}

#[cfg(test)]
pub(crate) fn test_config() -> Config {
    Config {
        credentials: Credentials::default(),
        tunables: Tunables::default(),
        output_dir: "./reports".to_string(),
        sender: None,
        recipients: vec![],
    }
}

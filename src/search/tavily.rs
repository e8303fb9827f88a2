//! Tavily structured search tier.
//!
//! Calls `POST https://api.tavily.com/search` with a bearer key and hands the
//! `results[]` objects back untouched. Tavily names its text field `content`,
//! so each object gets a `snippet` alias before it leaves the tier.

use super::SearchTier;
use crate::error::ProviderError;
use crate::models::RawItem;
use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::{debug, instrument};

const TAVILY_URL: &str = "https://api.tavily.com/search";

#[derive(Debug)]
pub struct TavilyTier {
    http: reqwest::Client,
    api_key: Option<String>,
}

impl TavilyTier {
    pub fn new(http: reqwest::Client, api_key: Option<String>) -> Self {
        Self { http, api_key }
    }
}

/// Pull `results[]` out of a Tavily payload.
fn extract_results(payload: &Value) -> Result<Vec<RawItem>, ProviderError> {
    let results = payload
        .get("results")
        .and_then(Value::as_array)
        .ok_or_else(|| ProviderError::MalformedResponse("missing results array".to_string()))?;

    Ok(results
        .iter()
        .map(|row| {
            let mut row = row.clone();
            if let Value::Object(map) = &mut row {
                if !map.contains_key("snippet") {
                    if let Some(content) = map.get("content").cloned() {
                        map.insert("snippet".to_string(), content);
                    }
                }
            }
            RawItem::Json(row)
        })
        .collect())
}

#[async_trait]
impl SearchTier for TavilyTier {
    fn name(&self) -> &str {
        "tavily"
    }

    fn priority(&self) -> u32 {
        10
    }

    fn is_available(&self) -> bool {
        self.api_key.is_some()
    }

    #[instrument(level = "info", skip_all, fields(%query))]
    async fn search(&self, query: &str, limit: usize) -> Result<Vec<RawItem>, ProviderError> {
        let api_key = self
            .api_key
            .as_deref()
            .ok_or_else(|| ProviderError::Unavailable("TAVILY_API_KEY".to_string()))?;

        let body = json!({
            "query": query,
            "search_depth": "basic",
            "topic": "news",
            "days": 1,
            "max_results": limit,
            "include_answer": false,
            "include_raw_content": false
        });

        let response = self
            .http
            .post(TAVILY_URL)
            .bearer_auth(api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| ProviderError::from_reqwest(&e))?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::from_status(status, &body));
        }
        let payload: Value = response
            .json()
            .await
            .map_err(|e| ProviderError::MalformedResponse(e.to_string()))?;

        let items = extract_results(&payload)?;
        debug!(count = items.len(), "Tavily results");
        Ok(items)
    }
}

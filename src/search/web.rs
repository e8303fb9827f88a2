//! Generic web search tier backed by the DuckDuckGo HTML endpoint.
//!
//! The HTML endpoint needs no key, which makes this the tier of last resort.
//! Result blocks are scraped with `.result__a` as the title and
//! `.result__snippet` as the snippet.

use super::SearchTier;
use crate::error::ProviderError;
use crate::models::RawItem;
use async_trait::async_trait;
use itertools::Itertools;
use scraper::{ElementRef, Html, Selector};
use serde_json::json;
use tracing::{debug, info, instrument};

const DDG_HTML_URL: &str = "https://html.duckduckgo.com/html/";

#[derive(Debug)]
pub struct WebSearchTier {
    http: reqwest::Client,
}

impl WebSearchTier {
    pub fn new(http: reqwest::Client) -> Self {
        Self { http }
    }
}

fn selector(css: &str) -> Result<Selector, ProviderError> {
    Selector::parse(css).map_err(|e| ProviderError::Unknown(format!("bad selector {css}: {e:?}")))
}

/// Text of `el` with inline markup and runs of whitespace collapsed.
fn element_text(el: ElementRef<'_>) -> String {
    el.text().flat_map(str::split_whitespace).join(" ")
}

/// Scrape up to `limit` results out of a DuckDuckGo HTML page.
pub fn parse_results(html: &str, limit: usize) -> Result<Vec<RawItem>, ProviderError> {
    let document = Html::parse_document(html);
    let result_selector = selector(".result")?;
    let title_selector = selector(".result__a")?;
    let snippet_selector = selector(".result__snippet")?;

    let mut items = Vec::new();
    for block in document.select(&result_selector) {
        if items.len() >= limit {
            break;
        }
        let title_el = block.select(&title_selector).next();
        let title = title_el.map(element_text).unwrap_or_default();
        let url = title_el
            .and_then(|el| el.value().attr("href"))
            .unwrap_or_default();
        let snippet = block
            .select(&snippet_selector)
            .next()
            .map(element_text)
            .unwrap_or_default();
        if title.is_empty() && snippet.is_empty() {
            continue;
        }
        items.push(RawItem::Json(json!({
            "title": title,
            "snippet": snippet,
            "url": url,
        })));
    }
    Ok(items)
}

#[async_trait]
impl SearchTier for WebSearchTier {
    fn name(&self) -> &str {
        "duckduckgo"
    }

    fn priority(&self) -> u32 {
        30
    }

    fn is_available(&self) -> bool {
        true
    }

    #[instrument(level = "info", skip_all, fields(%query))]
    async fn search(&self, query: &str, limit: usize) -> Result<Vec<RawItem>, ProviderError> {
        let url = format!("{}?q={}", DDG_HTML_URL, urlencoding::encode(query));
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| ProviderError::from_reqwest(&e))?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::from_status(status, &body));
        }
        let html = response
            .text()
            .await
            .map_err(|e| ProviderError::MalformedResponse(e.to_string()))?;

        let items = parse_results(&html, limit)?;
        info!(count = items.len(), "Scraped web search results");
        debug!(bytes = html.len(), "DuckDuckGo page size");
        Ok(items)
    }
}

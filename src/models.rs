//! Data models shared by the acquisition and generation stages.
//!
//! This module defines the core data structures used throughout the application:
//! - [`RawItem`]: a provider-native search hit before normalization
//! - [`ProviderResult`]: the normalized unit every tier hands to the chain
//! - [`AggregatedCorpus`]: the per-query collection with its length counter
//! - [`FailureRecord`]: an in-memory note of one failed provider attempt
//!
//! No raw provider shape crosses the search chain boundary; everything is
//! coerced through [`normalize`] first.

use crate::error::{ErrorKind, ProviderError};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

/// A search hit exactly as a provider returned it.
#[derive(Debug, Clone, PartialEq)]
pub enum RawItem {
    /// Loosely shaped JSON from an HTTP API (mapping, string, number, ...).
    Json(Value),
    /// A bare text blob.
    Text(String),
    /// A structured record, e.g. a parsed feed entry.
    Record(FeedEntry),
}

/// One entry of an RSS or Atom feed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FeedEntry {
    pub title: Option<String>,
    /// `summary`, `description` or `content`, whichever the feed carried first.
    pub summary: Option<String>,
    pub link: Option<String>,
}

/// A normalized search hit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProviderResult {
    pub title: String,
    /// Never absent; an item without any text normalizes to an empty body.
    pub body: String,
    /// Name of the tier that produced the item.
    pub source_tag: String,
    /// Where the item came from, when the provider said.
    pub link: Option<String>,
    pub fetched_at: DateTime<Utc>,
}

impl ProviderResult {
    /// Characters this result contributes to the corpus counter.
    pub fn char_len(&self) -> usize {
        self.title.chars().count() + self.body.chars().count()
    }

    /// Render in the `Src:`/`Txt:` layout used inside the prompt.
    pub fn render(&self) -> String {
        let title = if self.title.is_empty() { "?" } else { &self.title };
        match &self.link {
            Some(link) => format!("Src: {} <{}>\nTxt: {}\n---\n", title, link, self.body),
            None => format!("Src: {}\nTxt: {}\n---\n", title, self.body),
        }
    }
}

fn json_text(v: &Value) -> Option<String> {
    match v {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

/// Coerce a provider-native item into a [`ProviderResult`].
///
/// * mappings take `title` and `body`, falling back to `snippet` when
///   `body` is missing, and `url` (or `link`) as the link
/// * bare strings become the body with an empty title
/// * any other shape is stringified into the body
///
/// Pure: the same `item`, `source_tag` and `fetched_at` always produce the
/// same result.
pub fn normalize(item: &RawItem, source_tag: &str, fetched_at: DateTime<Utc>) -> ProviderResult {
    let (title, body, link) = match item {
        RawItem::Json(Value::Object(map)) => {
            let title = map.get("title").and_then(json_text).unwrap_or_default();
            let body = map
                .get("body")
                .and_then(json_text)
                .or_else(|| map.get("snippet").and_then(json_text))
                .unwrap_or_default();
            let link = map
                .get("url")
                .or_else(|| map.get("link"))
                .and_then(Value::as_str)
                .map(str::to_string);
            (title, body, link)
        }
        RawItem::Json(Value::String(s)) | RawItem::Text(s) => (String::new(), s.clone(), None),
        RawItem::Json(Value::Null) => (String::new(), String::new(), None),
        RawItem::Json(other) => (String::new(), other.to_string(), None),
        RawItem::Record(entry) => (
            entry.title.clone().unwrap_or_default(),
            entry.summary.clone().unwrap_or_default(),
            entry.link.clone(),
        ),
    };

    ProviderResult {
        title: title.trim().to_string(),
        body: body.trim().to_string(),
        source_tag: source_tag.to_string(),
        link: link.map(|l| l.trim().to_string()).filter(|l| !l.is_empty()),
        fetched_at,
    }
}

/// One failed provider attempt. Lives only as long as the run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailureRecord {
    pub provider_name: String,
    pub error_kind: ErrorKind,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl FailureRecord {
    pub fn new(provider_name: impl Into<String>, err: &ProviderError) -> Self {
        Self {
            provider_name: provider_name.into(),
            error_kind: err.kind(),
            message: err.to_string(),
            timestamp: Utc::now(),
        }
    }
}

/// Everything the search chain collected for one query.
#[derive(Debug, Clone, Default, Serialize)]
pub struct AggregatedCorpus {
    pub query: String,
    pub results: Vec<ProviderResult>,
    /// Running character count of `results`.
    pub total_len: usize,
    pub failures: Vec<FailureRecord>,
}

impl AggregatedCorpus {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            ..Default::default()
        }
    }

    /// Append one result and bump the counter.
    pub fn push(&mut self, result: ProviderResult) {
        self.total_len += result.char_len();
        self.results.push(result);
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    /// Render the results, cut to at most `budget` characters.
    pub fn render(&self, budget: usize) -> String {
        let rendered: String = self.results.iter().map(ProviderResult::render).collect();
        crate::utils::truncate_chars(&rendered, budget).to_string()
    }
}

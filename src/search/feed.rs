//! RSS 2.0 / Atom syndication tier.
//!
//! Feeds are public and read-only, so the tier needs no credential and may
//! run with relaxed TLS verification when the network requires it. Entries
//! leave the tier as [`RawItem::Record`]s.
//!
//! # Element Mapping
//!
//! | Field | RSS 2.0 | Atom |
//! |-------|---------|------|
//! | title | `item/title` | `entry/title` |
//! | summary | `item/description`, `content:encoded` | `entry/summary`, `entry/content` |
//! | link | `item/link` | `entry/link/@href` |

use super::SearchTier;
use crate::error::ProviderError;
use crate::models::{FeedEntry, RawItem};
use async_trait::async_trait;
use futures::future::join_all;
use once_cell::sync::Lazy;
use quick_xml::Reader;
use quick_xml::escape::unescape;
use quick_xml::events::Event;
use regex::Regex;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, error, info, instrument};

static TAGS: Lazy<Regex> = Lazy::new(|| Regex::new(r"<[^>]*>").expect("tag pattern"));

#[derive(Debug, Clone, Copy, PartialEq)]
enum Field {
    Title,
    Summary,
    Link,
}

fn field_for(name: &[u8]) -> Option<Field> {
    match name {
        b"title" => Some(Field::Title),
        b"description" | b"summary" | b"content" | b"encoded" => Some(Field::Summary),
        b"link" => Some(Field::Link),
        _ => None,
    }
}

/// Collapse markup and whitespace out of a feed text field.
fn clean_text(raw: &str) -> Option<String> {
    let stripped = TAGS.replace_all(raw, " ");
    let collapsed = stripped.split_whitespace().collect::<Vec<_>>().join(" ");
    (!collapsed.is_empty()).then_some(collapsed)
}

/// Parse an RSS or Atom document into entries, in document order.
pub fn parse_feed(xml: &str) -> Result<Vec<FeedEntry>, ProviderError> {
    let mut reader = Reader::from_str(xml);
    let mut entries = Vec::new();
    let mut current: Option<FeedEntry> = None;
    let mut field: Option<Field> = None;
    let mut text = String::new();

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                let name = e.local_name();
                match name.as_ref() {
                    b"item" | b"entry" => current = Some(FeedEntry::default()),
                    other if current.is_some() && field.is_none() => {
                        field = field_for(other);
                        text.clear();
                    }
                    _ => {}
                }
            }
            Ok(Event::Empty(e)) => {
                if let Some(entry) = current.as_mut() {
                    if e.local_name().as_ref() == b"link" && entry.link.is_none() {
                        entry.link = e
                            .attributes()
                            .flatten()
                            .find(|a| a.key.as_ref() == b"href")
                            .map(|a| String::from_utf8_lossy(&a.value).into_owned());
                    }
                }
            }
            Ok(Event::Text(t)) if field.is_some() => {
                text.push_str(&String::from_utf8_lossy(&t));
            }
            Ok(Event::CData(c)) if field.is_some() => {
                text.push_str(&String::from_utf8_lossy(&c));
            }
            Ok(Event::GeneralRef(r)) if field.is_some() => {
                let reference = format!("&{};", String::from_utf8_lossy(&r));
                match unescape(&reference) {
                    Ok(resolved) => text.push_str(&resolved),
                    Err(_) => text.push_str(&reference),
                }
            }
            Ok(Event::End(e)) => {
                let name = e.local_name();
                let name = name.as_ref();
                if matches!(name, b"item" | b"entry") {
                    if let Some(entry) = current.take() {
                        entries.push(entry);
                    }
                    field = None;
                } else if let (Some(f), Some(entry)) = (field, current.as_mut()) {
                    if field_for(name) == Some(f) {
                        let value = clean_text(&text);
                        let slot = match f {
                            Field::Title => &mut entry.title,
                            Field::Summary => &mut entry.summary,
                            Field::Link => &mut entry.link,
                        };
                        if slot.is_none() {
                            *slot = value;
                        }
                        field = None;
                        text.clear();
                    }
                }
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => {
                return Err(ProviderError::MalformedResponse(format!(
                    "feed parse error at byte {}: {}",
                    reader.buffer_position(),
                    e
                )));
            }
        }
    }

    Ok(entries)
}

#[derive(Debug)]
pub struct FeedTier {
    http: reqwest::Client,
    feeds: Vec<String>,
    /// Per-feed deadline, shorter than the chain's call timeout.
    fetch_timeout: Duration,
}

impl FeedTier {
    pub fn new(http: reqwest::Client, feeds: Vec<String>, fetch_timeout: Duration) -> Self {
        Self {
            http,
            feeds,
            fetch_timeout,
        }
    }

    /// Download and parse one feed.
    #[instrument(level = "info", skip(self))]
    pub async fn fetch(&self, feed_url: &str) -> Result<Vec<FeedEntry>, ProviderError> {
        let response = self
            .http
            .get(feed_url)
            .send()
            .await
            .map_err(|e| ProviderError::from_reqwest(&e))?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::from_status(status, &body));
        }
        let xml = response
            .text()
            .await
            .map_err(|e| ProviderError::MalformedResponse(e.to_string()))?;
        let entries = parse_feed(&xml)?;
        info!(count = entries.len(), "Parsed feed entries");
        Ok(entries)
    }

    async fn fetch_within_deadline(&self, feed_url: &str) -> Result<Vec<FeedEntry>, ProviderError> {
        match timeout(self.fetch_timeout, self.fetch(feed_url)).await {
            Ok(res) => res,
            Err(_) => Err(ProviderError::Transient(format!(
                "feed gave no response within {:?}",
                self.fetch_timeout
            ))),
        }
    }
}

#[async_trait]
impl SearchTier for FeedTier {
    fn name(&self) -> &str {
        "feed"
    }

    fn priority(&self) -> u32 {
        20
    }

    fn is_available(&self) -> bool {
        !self.feeds.is_empty()
    }

    /// Feeds are general news: entries are not filtered by `query`.
    ///
    /// All feeds are fetched at once; a slow or broken feed only loses its
    /// own entries.
    async fn search(&self, _query: &str, limit: usize) -> Result<Vec<RawItem>, ProviderError> {
        let fetched = join_all(self.feeds.iter().map(|url| self.fetch_within_deadline(url))).await;

        let mut items = Vec::new();
        let mut last_err = None;
        for (url, outcome) in self.feeds.iter().zip(fetched) {
            match outcome {
                Ok(entries) => {
                    let room = limit.saturating_sub(items.len());
                    items.extend(entries.into_iter().take(room).map(RawItem::Record));
                }
                Err(e) => {
                    error!(%url, kind = %e.kind(), error = %e, "Feed fetch failed");
                    last_err = Some(e);
                }
            }
        }

        match (items.is_empty(), last_err) {
            (true, Some(e)) => Err(e),
            _ => {
                debug!(count = items.len(), "Feed tier items");
                Ok(items)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::search::SearchTierChain;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    const RSS: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<rss version="2.0" xmlns:content="http://purl.org/rss/1.0/modules/content/">
  <channel>
    <title>Markets</title>
    <item>
      <title>Stocks &amp; bonds rally</title>
      <link>https://example.com/a</link>
      <description><![CDATA[<p>The CSI 300 rose <b>1.2%</b>.</p>]]></description>
    </item>
    <item>
      <title>Yuan steady</title>
      <description>PBoC fixing at 7.10</description>
    </item>
  </channel>
</rss>"#;

    const ATOM: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<feed xmlns="http://www.w3.org/2005/Atom">
  <title>Wire</title>
  <entry>
    <title>HK IPO pipeline</title>
    <link href="https://example.com/hk"/>
    <summary>Three listings this week</summary>
  </entry>
</feed>"#;

    #[test]
    fn test_parse_rss() {
        let entries = parse_feed(RSS).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].title.as_deref(), Some("Stocks & bonds rally"));
        assert_eq!(entries[0].summary.as_deref(), Some("The CSI 300 rose 1.2% ."));
        assert_eq!(entries[0].link.as_deref(), Some("https://example.com/a"));
        assert_eq!(entries[1].summary.as_deref(), Some("PBoC fixing at 7.10"));
    }

    #[test]
    fn test_parse_atom() {
        let entries = parse_feed(ATOM).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].title.as_deref(), Some("HK IPO pipeline"));
        assert_eq!(entries[0].summary.as_deref(), Some("Three listings this week"));
        assert_eq!(entries[0].link.as_deref(), Some("https://example.com/hk"));
    }

    #[test]
    fn test_channel_title_is_not_an_entry() {
        let entries = parse_feed("<rss><channel><title>Only</title></channel></rss>").unwrap();
        assert!(entries.is_empty());
    }

    #[test]
    fn test_mismatched_tags_are_malformed() {
        let err = parse_feed("<rss><item><title>x</item></rss>").unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::MalformedResponse);
    }

    #[test]
    fn test_clean_text() {
        assert_eq!(clean_text("  <p>a</p>\n b "), Some("a b".to_string()));
        assert_eq!(clean_text("<br/>"), None);
    }

    #[test]
    fn test_available_only_with_feeds() {
        let secs = Duration::from_secs(1);
        assert!(!FeedTier::new(reqwest::Client::new(), vec![], secs).is_available());
        assert!(FeedTier::new(reqwest::Client::new(), vec!["https://x".to_string()], secs).is_available());
    }

    /// Serve `body` as RSS on a local port, or hold every connection open
    /// without answering when `body` is `None`.
    async fn local_feed(body: Option<&'static str>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((mut socket, _)) = listener.accept().await {
                let Some(body) = body else {
                    held.push(socket);
                    continue;
                };
                let mut buf = [0u8; 4096];
                let _ = socket.read(&mut buf).await;
                let response = format!(
                    "HTTP/1.1 200 OK\r\ncontent-type: application/rss+xml\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
                    body.len(),
                    body
                );
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            }
        });
        format!("http://{addr}/rss")
    }

    #[tokio::test]
    async fn test_hanging_feed_keeps_entries_from_fast_feed() {
        let fast = local_feed(Some(RSS)).await;
        let slow = local_feed(None).await;
        let tier = FeedTier::new(reqwest::Client::new(), vec![slow, fast], Duration::from_millis(300));
        let chain = SearchTierChain::new(vec![Box::new(tier)], 50, 10, Duration::from_secs(2));

        let corpus = chain.acquire("q").await;

        assert_eq!(corpus.results.len(), 2);
        assert_eq!(corpus.results[0].title, "Stocks & bonds rally");
        assert_eq!(corpus.results[0].link.as_deref(), Some("https://example.com/a"));
        assert!(corpus.failures.is_empty());
    }

    #[tokio::test]
    async fn test_every_feed_failing_is_a_tier_failure() {
        let slow = local_feed(None).await;
        let tier = FeedTier::new(reqwest::Client::new(), vec![slow], Duration::from_millis(100));

        let err = tier.search("q", 10).await.unwrap_err();

        assert_eq!(err.kind(), crate::error::ErrorKind::Transient);
    }
}

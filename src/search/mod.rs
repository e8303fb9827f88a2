//! Search tiers and the chain that runs them.
//!
//! Each tier wraps one acquisition provider behind [`SearchTier`]. The
//! [`SearchTierChain`] tries tiers in ascending priority for a query and
//! stops as soon as the query's corpus reaches the sufficiency threshold.
//!
//! # Supported Tiers
//!
//! | Tier | Module | Priority | Credential |
//! |------|--------|----------|------------|
//! | Probed search service | [`crate::probe`] | 5 | `SEARCH_SERVICE_ENDPOINT` |
//! | Tavily structured search | [`tavily`] | 10 | `TAVILY_API_KEY` |
//! | RSS/Atom feeds | [`feed`] | 20 | none |
//! | DuckDuckGo HTML search | [`web`] | 30 | none |
//!
//! # Common Patterns
//!
//! A tier never normalizes its own output: it hands back [`RawItem`]s in
//! whatever shape the provider produced and the chain coerces them with
//! [`normalize`]. A tier failure never aborts the chain; it becomes a
//! [`FailureRecord`] and the tier counts as having contributed nothing.

pub mod feed;
pub mod tavily;
pub mod web;

use crate::error::ProviderError;
use crate::models::{AggregatedCorpus, FailureRecord, ProviderResult, RawItem, normalize};
use async_trait::async_trait;
use chrono::Utc;
use itertools::Itertools;
use std::collections::HashSet;
use std::time::{Duration, Instant};
use tracing::{debug, info, instrument, warn};

/// One acquisition provider.
#[async_trait]
pub trait SearchTier: Send + Sync {
    /// Provider name, used as the `source_tag` of its results.
    fn name(&self) -> &str;

    /// Lower runs first.
    fn priority(&self) -> u32;

    /// Fixed at construction from the presence of credentials.
    fn is_available(&self) -> bool;

    /// Run the provider's search and return its items untouched.
    async fn search(&self, query: &str, limit: usize) -> Result<Vec<RawItem>, ProviderError>;
}

/// Ordered fallback over [`SearchTier`]s.
pub struct SearchTierChain {
    tiers: Vec<Box<dyn SearchTier>>,
    sufficiency_threshold: usize,
    limit: usize,
    call_timeout: Duration,
}

impl std::fmt::Debug for SearchTierChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SearchTierChain")
            .field("tiers", &self.tier_names())
            .field("sufficiency_threshold", &self.sufficiency_threshold)
            .field("limit", &self.limit)
            .field("call_timeout", &self.call_timeout)
            .finish()
    }
}

/// Whitespace- and case-insensitive identity of a result: its body, or its
/// title when the body is empty.
fn dedup_key(r: &ProviderResult) -> String {
    let text = if r.body.trim().is_empty() { &r.title } else { &r.body };
    text.split_whitespace().join(" ").to_lowercase()
}

impl SearchTierChain {
    /// Sort `tiers` by priority; ties keep their insertion order.
    pub fn new(
        mut tiers: Vec<Box<dyn SearchTier>>,
        sufficiency_threshold: usize,
        limit: usize,
        call_timeout: Duration,
    ) -> Self {
        tiers.sort_by_key(|t| t.priority());
        for tier in tiers.iter().filter(|t| !t.is_available()) {
            debug!(tier = tier.name(), "Search tier unavailable; it will be skipped");
        }
        Self {
            tiers,
            sufficiency_threshold,
            limit,
            call_timeout,
        }
    }

    pub fn tier_names(&self) -> Vec<&str> {
        self.tiers.iter().map(|t| t.name()).collect()
    }

    /// Collect results for `query`, tier by tier, until the corpus is
    /// sufficient or every available tier has been tried.
    ///
    /// Never fails: an insufficient or empty corpus is returned as is.
    #[instrument(level = "info", skip_all, fields(%query))]
    pub async fn acquire(&self, query: &str) -> AggregatedCorpus {
        let mut corpus = AggregatedCorpus::new(query);
        let mut seen: HashSet<String> = HashSet::new();

        for tier in &self.tiers {
            if !tier.is_available() {
                continue;
            }

            let t0 = Instant::now();
            let outcome = match tokio::time::timeout(self.call_timeout, tier.search(query, self.limit)).await {
                Ok(res) => res,
                Err(_) => Err(ProviderError::Transient(format!(
                    "no response within {:?}",
                    self.call_timeout
                ))),
            };
            let elapsed_ms = t0.elapsed().as_millis() as u64;

            match outcome {
                Ok(items) => {
                    let fetched_at = Utc::now();
                    let before = corpus.total_len;
                    let fresh = items
                        .iter()
                        .map(|item| normalize(item, tier.name(), fetched_at))
                        .filter(|r| r.char_len() > 0)
                        .unique_by(dedup_key)
                        .collect::<Vec<_>>();
                    for result in fresh {
                        if seen.insert(dedup_key(&result)) {
                            corpus.push(result);
                        }
                    }
                    info!(
                        tier = tier.name(),
                        raw_items = items.len(),
                        added_chars = corpus.total_len - before,
                        total_chars = corpus.total_len,
                        elapsed_ms,
                        "Search tier finished"
                    );
                }
                Err(e) => {
                    warn!(tier = tier.name(), kind = %e.kind(), error = %e, elapsed_ms, "Search tier failed");
                    corpus.failures.push(FailureRecord::new(tier.name(), &e));
                }
            }

            if corpus.total_len >= self.sufficiency_threshold {
                debug!(
                    tier = tier.name(),
                    total_chars = corpus.total_len,
                    threshold = self.sufficiency_threshold,
                    "Sufficiency threshold met; skipping remaining tiers"
                );
                break;
            }
        }

        if corpus.total_len < self.sufficiency_threshold {
            warn!(
                total_chars = corpus.total_len,
                threshold = self.sufficiency_threshold,
                "All tiers tried; corpus still below threshold"
            );
        }
        corpus
    }
}

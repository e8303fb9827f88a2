//! One report cycle: acquire, check sufficiency, generate, clean, deliver.
//!
//! ## Flow
//!
//! 1. Every configured query goes through the [`SearchTierChain`]. Queries
//!    run concurrently (bounded) but are folded back in query order.
//! 2. Each query's results are rendered, cut to the per-query budget and
//!    tagged with the query.
//! 3. A combined corpus below the hard minimum ends the run quietly.
//! 4. Otherwise the corpus is cut to the prompt budget and handed to the
//!    [`GenerationFailoverClient`].
//! 5. Code fences are stripped from the text and the result is delivered.
//!
//! Every [`RunOutcome`] maps to exit code 0; only configuration problems
//! before the first provider call end the process with a failure.

use crate::config::Config;
use crate::delivery::Delivery;
use crate::error::ProviderError;
use crate::generation::gemini::GeminiBackend;
use crate::generation::openai::OpenAiBackend;
use crate::generation::{GenerationBackend, GenerationFailoverClient};
use crate::models::AggregatedCorpus;
use crate::probe::{self, PluginRole, ProbedAnalyzer, ProbedSearchTier};
use crate::prompt::{build_prompt, subject, tag_contribution};
use crate::search::feed::FeedTier;
use crate::search::tavily::TavilyTier;
use crate::search::web::WebSearchTier;
use crate::search::{SearchTier, SearchTierChain};
use crate::utils::{report_date, strip_code_fences, truncate_chars, truncate_for_log};
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use std::time::Instant;
use tracing::{debug, error, info, instrument, warn};

/// How a run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Delivered { backend: String, model: String, chars: usize },
    /// The "no news today" path; generation was never attempted.
    InsufficientData { corpus_len: usize },
    GenerationExhausted,
    EmptyGeneration,
    DeliveryFailed,
}

impl RunOutcome {
    /// Scheduled runs favour continuity: every outcome exits cleanly.
    pub fn exit_code(&self) -> u8 {
        0
    }
}

/// Tiers for every configured search provider, available or not.
pub fn build_search_chain(config: &Config, http: &reqwest::Client, feed_http: &reqwest::Client) -> SearchTierChain {
    let creds = &config.credentials;
    let t = &config.tunables;
    let tiers: Vec<Box<dyn SearchTier>> = vec![
        Box::new(ProbedSearchTier::probe(
            &probe::constructors(PluginRole::SearchService, http),
            config,
        )),
        Box::new(TavilyTier::new(http.clone(), creds.tavily_api_key.clone())),
        Box::new(FeedTier::new(
            feed_http.clone(),
            t.feeds.clone(),
            config.call_timeout() * 3 / 4,
        )),
        Box::new(WebSearchTier::new(http.clone())),
    ];
    SearchTierChain::new(tiers, t.sufficiency_threshold, t.search_limit, config.call_timeout())
}

/// Backends for every configured generation provider; unavailable ones are
/// dropped by the client.
pub fn build_generator(config: &Config, http: &reqwest::Client) -> GenerationFailoverClient {
    let creds = &config.credentials;
    let t = &config.tunables;
    let backends: Vec<Box<dyn GenerationBackend>> = vec![
        Box::new(ProbedAnalyzer::probe(
            &probe::constructors(PluginRole::Analyzer, http),
            config,
        )),
        Box::new(GeminiBackend::new(
            http.clone(),
            creds.gemini_api_key.clone(),
            t.gemini_models.clone(),
        )),
        Box::new(OpenAiBackend::new(
            http.clone(),
            creds.openai_api_key.clone(),
            creds.openai_base_url.as_deref(),
            t.openai_models.clone(),
        )),
    ];
    GenerationFailoverClient::new(backends, config.call_timeout(), config.rate_limit_backoff())
}

pub struct PipelineOrchestrator<'a> {
    config: &'a Config,
    search: SearchTierChain,
    generator: GenerationFailoverClient,
    delivery: Box<dyn Delivery>,
}

impl<'a> PipelineOrchestrator<'a> {
    pub fn new(
        config: &'a Config,
        search: SearchTierChain,
        generator: GenerationFailoverClient,
        delivery: Box<dyn Delivery>,
    ) -> Self {
        Self {
            config,
            search,
            generator,
            delivery,
        }
    }

    /// Run every query through the chain, preserving query order.
    async fn acquire_all(&self) -> Vec<AggregatedCorpus> {
        let queries: Vec<&str> = self
            .config
            .tunables
            .queries
            .iter()
            .map(|q| q.trim())
            .filter(|q| !q.is_empty())
            .collect();
        let concurrency = self.config.tunables.query_concurrency.max(1);
        info!(queries = queries.len(), concurrency, "Starting acquisition");

        stream::iter(queries)
            .map(|q| self.search.acquire(q))
            .buffered(concurrency)
            .collect()
            .await
    }

    /// Concatenate tagged contributions; returns the text and the combined
    /// content length.
    fn combine(&self, corpora: &[AggregatedCorpus]) -> (String, usize) {
        let budget = self.config.tunables.per_query_budget;
        let mut combined = String::new();
        let mut total = 0usize;
        for corpus in corpora.iter().filter(|c| !c.is_empty()) {
            combined.push_str(&tag_contribution(&corpus.query, &corpus.render(budget)));
            // Only what fits the per-query budget reaches the prompt.
            total += corpus.total_len.min(budget);
            debug!(
                query = %corpus.query,
                results = corpus.results.len(),
                chars = corpus.total_len,
                failures = corpus.failures.len(),
                "Query contribution"
            );
        }
        (combined, total)
    }

    /// Execute one report cycle.
    #[instrument(level = "info", skip_all)]
    pub async fn run(&self, now: DateTime<Utc>) -> RunOutcome {
        let t0 = Instant::now();
        let t = &self.config.tunables;

        let corpora = self.acquire_all().await;
        let search_failures: usize = corpora.iter().map(|c| c.failures.len()).sum();
        let (combined, corpus_len) = self.combine(&corpora);
        info!(
            corpus_len,
            search_failures,
            elapsed_ms = t0.elapsed().as_millis() as u64,
            "Acquisition complete"
        );

        if corpus_len < t.min_corpus_len {
            info!(
                corpus_len,
                min = t.min_corpus_len,
                "Not enough material for a report today; skipping generation"
            );
            return RunOutcome::InsufficientData { corpus_len };
        }

        let date = report_date(now, t.utc_offset_hours);
        let data = truncate_chars(&combined, t.prompt_budget);
        let prompt = build_prompt(&date, data);
        info!(prompt_chars = prompt.chars().count(), %date, "Generating report");

        let generation = match self.generator.generate(&prompt).await {
            Ok(g) => g,
            Err(ProviderError::Exhausted { last, failures }) => {
                error!(attempts = failures.len(), last_error = %last, "No generation backend produced a report");
                return RunOutcome::GenerationExhausted;
            }
            Err(e) => {
                error!(error = %e, "Generation failed");
                return RunOutcome::GenerationExhausted;
            }
        };

        let html = strip_code_fences(&generation.text);
        if html.is_empty() {
            warn!(
                raw = %truncate_for_log(&generation.text, 200),
                "Generated text was empty after cleanup"
            );
            return RunOutcome::EmptyGeneration;
        }

        let subject = subject(&t.subject_prefix, &date);
        match self
            .delivery
            .deliver(&subject, &html, &self.config.recipients)
            .await
        {
            Ok(()) => {
                info!(
                    backend = %generation.backend,
                    model = %generation.model,
                    generation_failures = generation.failures.len(),
                    elapsed_ms_total = t0.elapsed().as_millis() as u64,
                    "Report delivered"
                );
                RunOutcome::Delivered {
                    backend: generation.backend,
                    model: generation.model,
                    chars: html.chars().count(),
                }
            }
            Err(e) => {
                error!(error = %e, "Delivery failed");
                RunOutcome::DeliveryFailed
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_config;
    use crate::delivery::DeliveryError;
    use crate::generation::tests::FakeBackend;
    use crate::models::RawItem;
    use crate::search::tests::{FakeTier, Reply};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    #[derive(Default)]
    struct RecordingDelivery {
        sent: Arc<Mutex<Vec<(String, String, Vec<String>)>>>,
    }

    #[async_trait]
    impl Delivery for RecordingDelivery {
        async fn deliver(&self, subject: &str, body_html: &str, recipients: &[String]) -> Result<(), DeliveryError> {
            self.sent
                .lock()
                .unwrap()
                .push((subject.to_string(), body_html.to_string(), recipients.to_vec()));
            Ok(())
        }
    }

    /// Records every prompt and answers with a fixed reply.
    struct PromptRecorder {
        models: Vec<String>,
        reply: String,
        prompts: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl GenerationBackend for PromptRecorder {
        fn name(&self) -> &str {
            "recorder"
        }

        fn priority(&self) -> u32 {
            1
        }

        fn is_available(&self) -> bool {
            true
        }

        fn models(&self) -> &[String] {
            &self.models
        }

        async fn complete(&self, _model_id: &str, prompt: &str) -> Result<String, ProviderError> {
            self.prompts.lock().unwrap().push(prompt.to_string());
            Ok(self.reply.clone())
        }
    }

    fn config() -> Config {
        let mut cfg = test_config();
        cfg.tunables.queries = vec!["q1".to_string(), "q2".to_string()];
        cfg.tunables.sufficiency_threshold = 20;
        cfg.tunables.min_corpus_len = 70;
        cfg.tunables.query_concurrency = 2;
        cfg.recipients = vec!["desk@example.com".to_string()];
        cfg
    }

    /// One tier whose body is `chars` long and names the query.
    fn fixture_chain(chars: usize) -> (SearchTierChain, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let tier = FakeTier {
            name: "fixture".to_string(),
            priority: 1,
            available: true,
            reply: Box::new(move |q| {
                let body = format!("{q}:{}", "n".repeat(chars - q.len() - 1));
                Reply::Items(vec![RawItem::Text(body)])
            }),
            calls: Arc::clone(&calls),
        };
        let chain = SearchTierChain::new(vec![Box::new(tier)], 20, 10, Duration::from_secs(1));
        (chain, calls)
    }

    fn recorder(reply: &str) -> (GenerationFailoverClient, Arc<Mutex<Vec<String>>>) {
        let prompts = Arc::new(Mutex::new(Vec::new()));
        let backend = PromptRecorder {
            models: vec!["m".to_string()],
            reply: reply.to_string(),
            prompts: Arc::clone(&prompts),
        };
        let client = GenerationFailoverClient::new(vec![Box::new(backend)], Duration::from_secs(1), Duration::ZERO);
        (client, prompts)
    }

    #[tokio::test]
    async fn test_insufficient_corpus_skips_generation() {
        let cfg = config();
        let (chain, tier_calls) = fixture_chain(30);
        let (generator, prompts) = recorder("<p>never</p>");
        let delivery = RecordingDelivery::default();
        let sent = Arc::clone(&delivery.sent);

        let outcome = PipelineOrchestrator::new(&cfg, chain, generator, Box::new(delivery))
            .run(Utc::now())
            .await;

        assert_eq!(outcome, RunOutcome::InsufficientData { corpus_len: 60 });
        assert_eq!(outcome.exit_code(), 0);
        assert_eq!(tier_calls.load(Ordering::SeqCst), 2);
        assert!(prompts.lock().unwrap().is_empty());
        assert!(sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_sufficient_corpus_generates_and_delivers_once() {
        let cfg = config();
        let (chain, _) = fixture_chain(40);
        let (generator, prompts) = recorder("```html\n<h1>Brief</h1>\n```");
        let delivery = RecordingDelivery::default();
        let sent = Arc::clone(&delivery.sent);

        let outcome = PipelineOrchestrator::new(&cfg, chain, generator, Box::new(delivery))
            .run(Utc::now())
            .await;

        assert_eq!(
            outcome,
            RunOutcome::Delivered {
                backend: "recorder".to_string(),
                model: "m".to_string(),
                chars: 14
            }
        );
        let prompts = prompts.lock().unwrap();
        assert_eq!(prompts.len(), 1);
        let q1 = prompts[0].find("Query: q1").unwrap();
        let q2 = prompts[0].find("Query: q2").unwrap();
        assert!(q1 < q2);
        assert!(prompts[0].contains("Txt: q1:"));
        assert!(prompts[0].contains("Txt: q2:"));

        let sent = sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].1, "<h1>Brief</h1>");
        assert!(sent[0].0.starts_with("【市场晨报】 "));
        assert_eq!(sent[0].2, vec!["desk@example.com"]);
    }

    #[tokio::test]
    async fn test_exhausted_generation_makes_no_delivery() {
        let cfg = config();
        let (chain, _) = fixture_chain(40);
        let failing = FakeBackend::new(
            "P1",
            1,
            vec![("M1", Err(ProviderError::NotFound("M1".to_string())))],
        );
        let generator = GenerationFailoverClient::new(vec![Box::new(failing)], Duration::from_secs(1), Duration::ZERO);
        let delivery = RecordingDelivery::default();
        let sent = Arc::clone(&delivery.sent);

        let outcome = PipelineOrchestrator::new(&cfg, chain, generator, Box::new(delivery))
            .run(Utc::now())
            .await;

        assert_eq!(outcome, RunOutcome::GenerationExhausted);
        assert_eq!(outcome.exit_code(), 0);
        assert!(sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_fence_only_output_is_empty_generation() {
        let cfg = config();
        let (chain, _) = fixture_chain(40);
        let (generator, _) = recorder("```html\n```");
        let delivery = RecordingDelivery::default();
        let sent = Arc::clone(&delivery.sent);

        let outcome = PipelineOrchestrator::new(&cfg, chain, generator, Box::new(delivery))
            .run(Utc::now())
            .await;

        assert_eq!(outcome, RunOutcome::EmptyGeneration);
        assert!(sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_prompt_respects_budgets() {
        let mut cfg = config();
        cfg.tunables.per_query_budget = 25;
        cfg.tunables.prompt_budget = 30;
        cfg.tunables.min_corpus_len = 40;
        let (chain, _) = fixture_chain(400);
        let (generator, prompts) = recorder("<p>ok</p>");

        PipelineOrchestrator::new(&cfg, chain, generator, Box::new(RecordingDelivery::default()))
            .run(Utc::now())
            .await;

        let prompt = prompts.lock().unwrap()[0].clone();
        let data = prompt
            .split("DATA:\n")
            .nth(1)
            .and_then(|rest| rest.split("\n\nINSTRUCTIONS:").next())
            .unwrap();
        assert_eq!(data.chars().count(), 30);
        assert!(data.starts_with("\nQuery: q1\nResults:\n"));
    }

    #[tokio::test]
    async fn test_minimum_counts_only_what_fits_the_query_budget() {
        let mut cfg = config();
        cfg.tunables.per_query_budget = 30;
        let (chain, _) = fixture_chain(400);
        let (generator, prompts) = recorder("<p>never</p>");

        let outcome = PipelineOrchestrator::new(&cfg, chain, generator, Box::new(RecordingDelivery::default()))
            .run(Utc::now())
            .await;

        assert_eq!(outcome, RunOutcome::InsufficientData { corpus_len: 60 });
        assert!(prompts.lock().unwrap().is_empty());
    }

    #[test]
    fn test_default_wiring_order_and_availability() {
        let mut cfg = test_config();
        cfg.credentials.gemini_api_key = Some("g".to_string());
        let http = reqwest::Client::new();

        let chain = build_search_chain(&cfg, &http, &http);
        assert_eq!(
            chain.tier_names(),
            vec!["search_service", "tavily", "feed", "duckduckgo"]
        );

        let generator = build_generator(&cfg, &http);
        let candidates = generator.candidates();
        assert_eq!(candidates.len(), 3);
        assert!(candidates.iter().all(|(b, _)| *b == "gemini"));
        assert_eq!(candidates[0].1, "gemini-1.5-flash");
    }
}

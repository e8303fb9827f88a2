//! Generation backends and the failover client that walks them.
//!
//! A backend exposes an ordered list of model ids. A *candidate* is one
//! (backend, model) pair; the [`GenerationFailoverClient`] tries candidates
//! strictly in configured order until one returns non-empty text.
//!
//! # Failover Table
//!
//! | Error kind | Next state |
//! |------------|------------|
//! | `NotFound`, `Unsupported` | next model, else next backend |
//! | `RateLimited` | fixed backoff, then next model/backend |
//! | `Transient`, `Unknown`, `MalformedResponse` | next model/backend at once |
//! | `Unavailable` (credential rejected) | skip the rest of this backend |
//!
//! When no candidate is left the client returns
//! [`ProviderError::Exhausted`] carrying the last error and every
//! [`FailureRecord`] collected on the way.

pub mod gemini;
pub mod openai;

use crate::error::{ErrorKind, ProviderError};
use crate::models::FailureRecord;
use crate::utils::truncate_for_log;
use async_trait::async_trait;
use rand::{Rng, rng};
use std::time::{Duration, Instant};
use tokio::time::sleep;
use tracing::{debug, error, info, instrument, warn};

/// One text-generation provider.
#[async_trait]
pub trait GenerationBackend: Send + Sync {
    fn name(&self) -> &str;

    /// Lower runs first.
    fn priority(&self) -> u32;

    /// Fixed at construction from the presence of credentials.
    fn is_available(&self) -> bool;

    /// Model ids in the order they should be tried.
    fn models(&self) -> &[String];

    async fn complete(&self, model_id: &str, prompt: &str) -> Result<String, ProviderError>;
}

/// Position in the candidate walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Try { backend: usize, model: usize },
    Exhausted,
}

/// What a failed candidate does to the walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    NextCandidate,
    BackoffThenNext,
    NextBackend,
}

/// The failover transition table.
pub fn step_for(kind: ErrorKind) -> Step {
    match kind {
        ErrorKind::RateLimited => Step::BackoffThenNext,
        ErrorKind::Unavailable => Step::NextBackend,
        ErrorKind::NotFound
        | ErrorKind::Unsupported
        | ErrorKind::Transient
        | ErrorKind::MalformedResponse
        | ErrorKind::Unknown
        | ErrorKind::Exhausted => Step::NextCandidate,
    }
}

/// Successful generation plus the failures that preceded it.
#[derive(Debug, Clone)]
pub struct Generation {
    pub text: String,
    pub backend: String,
    pub model: String,
    pub failures: Vec<FailureRecord>,
}

pub struct GenerationFailoverClient {
    backends: Vec<Box<dyn GenerationBackend>>,
    call_timeout: Duration,
    rate_limit_backoff: Duration,
}

impl std::fmt::Debug for GenerationFailoverClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self.backends.iter().map(|b| b.name()).collect();
        f.debug_struct("GenerationFailoverClient")
            .field("backends", &names)
            .field("call_timeout", &self.call_timeout)
            .field("rate_limit_backoff", &self.rate_limit_backoff)
            .finish()
    }
}

impl GenerationFailoverClient {
    /// Unavailable backends are dropped here, once; ties keep insertion order.
    pub fn new(
        backends: Vec<Box<dyn GenerationBackend>>,
        call_timeout: Duration,
        rate_limit_backoff: Duration,
    ) -> Self {
        let mut backends: Vec<_> = backends
            .into_iter()
            .filter(|b| {
                if !b.is_available() {
                    debug!(backend = b.name(), "Generation backend unavailable; skipped");
                }
                b.is_available()
            })
            .collect();
        backends.sort_by_key(|b| b.priority());
        Self {
            backends,
            call_timeout,
            rate_limit_backoff,
        }
    }

    /// Every candidate in the order `generate` will try them.
    pub fn candidates(&self) -> Vec<(&str, &str)> {
        self.backends
            .iter()
            .flat_map(|b| b.models().iter().map(move |m| (b.name(), m.as_str())))
            .collect()
    }

    /// First candidate at or after `backend`, model 0.
    fn first_from(&self, backend: usize) -> State {
        (backend..self.backends.len())
            .find(|&i| !self.backends[i].models().is_empty())
            .map_or(State::Exhausted, |i| State::Try { backend: i, model: 0 })
    }

    /// The state after a failed `state` under `step`.
    pub fn transition(&self, state: State, step: Step) -> State {
        match state {
            State::Exhausted => State::Exhausted,
            State::Try { backend, model } => match step {
                Step::NextBackend => self.first_from(backend + 1),
                Step::NextCandidate | Step::BackoffThenNext => {
                    if model + 1 < self.backends[backend].models().len() {
                        State::Try {
                            backend,
                            model: model + 1,
                        }
                    } else {
                        self.first_from(backend + 1)
                    }
                }
            },
        }
    }

    /// Sleep for the configured backoff plus 0-250 ms of jitter.
    async fn backoff(&self) {
        if self.rate_limit_backoff.is_zero() {
            return;
        }
        let jitter_ms: u64 = rng().random_range(0..=250);
        let delay = self.rate_limit_backoff + Duration::from_millis(jitter_ms);
        warn!(?delay, "Rate limited; backing off before next candidate");
        sleep(delay).await;
    }

    /// Generate text for `prompt` from the first candidate that yields any.
    #[instrument(level = "info", skip_all, fields(prompt_chars = prompt.chars().count()))]
    pub async fn generate(&self, prompt: &str) -> Result<Generation, ProviderError> {
        let total_t0 = Instant::now();
        let mut failures: Vec<FailureRecord> = Vec::new();
        let mut last: Option<ProviderError> = None;
        let mut state = self.first_from(0);

        while let State::Try { backend, model } = state {
            let b = &self.backends[backend];
            let model_id = &b.models()[model];
            let t0 = Instant::now();

            let outcome = match tokio::time::timeout(self.call_timeout, b.complete(model_id, prompt)).await {
                Ok(res) => res,
                Err(_) => Err(ProviderError::Transient(format!(
                    "no response within {:?}",
                    self.call_timeout
                ))),
            };
            let elapsed_ms = t0.elapsed().as_millis() as u64;

            let err = match outcome {
                Ok(text) if !text.trim().is_empty() => {
                    info!(
                        backend = b.name(),
                        model = %model_id,
                        elapsed_ms,
                        elapsed_ms_total = total_t0.elapsed().as_millis() as u64,
                        failures = failures.len(),
                        "Generation succeeded"
                    );
                    return Ok(Generation {
                        text,
                        backend: b.name().to_string(),
                        model: model_id.clone(),
                        failures,
                    });
                }
                Ok(_) => ProviderError::MalformedResponse("empty text".to_string()),
                Err(e) => e,
            };

            let step = step_for(err.kind());
            warn!(
                backend = b.name(),
                model = %model_id,
                kind = %err.kind(),
                ?step,
                elapsed_ms,
                error = %truncate_for_log(&err.to_string(), 300),
                "Generation candidate failed"
            );
            failures.push(FailureRecord::new(format!("{}/{}", b.name(), model_id), &err));
            last = Some(err);

            let next = self.transition(state, step);
            // No point waiting out a rate limit with nothing left to try.
            if step == Step::BackoffThenNext && next != State::Exhausted {
                self.backoff().await;
            }
            state = next;
        }

        let last = last.map_or_else(|| "no generation candidates configured".to_string(), |e| e.to_string());
        error!(
            attempts = failures.len(),
            elapsed_ms_total = total_t0.elapsed().as_millis() as u64,
            last_error = %last,
            "Every generation candidate failed"
        );
        Err(ProviderError::Exhausted { last, failures })
    }
}

//! # Market Brief
//!
//! A daily market-brief generator. It gathers news for a fixed set of
//! queries from a chain of search tiers, turns the combined corpus into an
//! HTML report through a failover chain of LLM backends, and delivers the
//! report.
//!
//! ## Features
//!
//! - Tiered search: a probed search-service plugin, Tavily, RSS/Atom feeds
//!   and DuckDuckGo HTML results, tried in priority order until each query
//!   has enough material
//! - Generation failover across a probed analyzer plugin, Gemini and any
//!   OpenAI-compatible endpoint, model by model
//! - A quiet "no news today" path when the corpus is too thin
//! - File delivery: the HTML body plus a JSON envelope per report date
//!
//! ## Usage
//!
//! ```sh
//! GEMINI_API_KEY=... TAVILY_API_KEY=... market_brief -o ./reports
//! ```
//!
//! ## Architecture
//!
//! 1. **Configuration**: CLI flags and environment, optional YAML tunables
//! 2. **Acquisition**: queries run through the search tier chain (bounded
//!    concurrency)
//! 3. **Generation**: the prompt goes through the backend failover client
//! 4. **Delivery**: fences are stripped and the report is written out

use chrono::Utc;
use clap::Parser;
use std::error::Error;
use std::process::ExitCode;
use tracing::{debug, error, info, instrument, warn};
use tracing_subscriber::{EnvFilter, fmt as tfmt};

mod cli;
mod config;
mod delivery;
mod error;
mod generation;
mod models;
mod pipeline;
mod probe;
mod prompt;
mod search;
mod utils;

use cli::Cli;
use config::Config;
use delivery::FileDelivery;
use pipeline::{PipelineOrchestrator, build_generator, build_search_chain};
use utils::{ensure_writable_dir, http_client, report_date};

/// Exit status after an interrupt, as shells report SIGINT.
const INTERRUPTED: u8 = 130;

#[tokio::main]
#[instrument]
async fn main() -> Result<ExitCode, Box<dyn Error>> {
    // --- Tracing init ---
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tfmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_file(false)
        .with_line_number(false)
        .with_timer(tracing_subscriber::fmt::time::UtcTime::rfc_3339())
        .init();

    let start_time = std::time::Instant::now();
    info!("market_brief starting up");

    let args = Cli::parse();
    debug!(output_dir = %args.output_dir, config = ?args.config, "Parsed CLI arguments");

    let config = match Config::from_cli(&args).await {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "Invalid configuration");
            return Err(e);
        }
    };
    info!(
        queries = config.tunables.queries.len(),
        recipients = config.recipients.len(),
        "Configuration loaded"
    );

    // Early check: ensure the delivery dir is writable
    if let Err(e) = ensure_writable_dir(&config.output_dir).await {
        error!(
            path = %config.output_dir,
            error = %e,
            "Output directory is not writable (fix perms or choose a different path)"
        );
        return Err(e);
    }

    let http = http_client(config.call_timeout(), false)?;
    let feed_http = if config.tunables.insecure_feed_tls {
        warn!("Feed TLS certificate checks are disabled");
        http_client(config.call_timeout(), true)?
    } else {
        http.clone()
    };

    let search = build_search_chain(&config, &http, &feed_http);
    let generator = build_generator(&config, &http);
    info!(
        tiers = ?search.tier_names(),
        candidates = generator.candidates().len(),
        "Providers wired"
    );

    let now = Utc::now();
    let date = report_date(now, config.tunables.utc_offset_hours);
    let delivery = FileDelivery::new(config.output_dir.clone(), date, config.sender.clone());
    let orchestrator = PipelineOrchestrator::new(&config, search, generator, Box::new(delivery));

    let code = tokio::select! {
        outcome = orchestrator.run(now) => {
            info!(?outcome, "Run finished");
            outcome.exit_code()
        }
        _ = tokio::signal::ctrl_c() => {
            error!("Interrupted; abandoning run");
            INTERRUPTED
        }
    };

    let elapsed = start_time.elapsed();
    info!(
        ?elapsed,
        secs = elapsed.as_secs(),
        millis = elapsed.subsec_millis(),
        "Execution complete"
    );

    Ok(ExitCode::from(code))
}

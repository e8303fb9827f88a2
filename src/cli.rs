//! Command-line interface definitions for Market Brief.
//!
//! This module defines the CLI arguments and options using the `clap` crate.
//! Every credential can be provided via a command-line flag or its
//! environment variable; a missing credential disables the matching
//! provider instead of failing the run.

use clap::Parser;

/// Command-line arguments for the Market Brief application.
///
/// # Examples
///
/// ```sh
/// # Keys from the environment, defaults for everything else
/// GEMINI_API_KEY=... market_brief -o ./reports
///
/// # Tunables from a YAML file
/// market_brief -o ./reports -c brief.yaml
/// ```
#[derive(Parser, Debug)]
#[command(author, version, about)]
pub struct Cli {
    /// Output directory for delivered reports
    #[arg(short, long, default_value = "./reports")]
    pub output_dir: String,

    /// Optional path to a YAML file with queries, feeds, models and limits
    #[arg(short, long)]
    pub config: Option<String>,

    /// Tavily search API key
    #[arg(long, env = "TAVILY_API_KEY", hide_env_values = true)]
    pub tavily_api_key: Option<String>,

    /// Google Gemini API key
    #[arg(long, env = "GEMINI_API_KEY", hide_env_values = true)]
    pub gemini_api_key: Option<String>,

    /// OpenAI (or compatible) API key
    #[arg(long, env = "OPENAI_API_KEY", hide_env_values = true)]
    pub openai_api_key: Option<String>,

    /// Base URL override for the OpenAI-compatible backend
    #[arg(long, env = "OPENAI_BASE_URL")]
    pub openai_base_url: Option<String>,

    /// Endpoint of an external analyzer plugin
    #[arg(long, env = "ANALYZER_ENDPOINT")]
    pub analyzer_endpoint: Option<String>,

    /// Endpoint of an external search service plugin
    #[arg(long, env = "SEARCH_SERVICE_ENDPOINT")]
    pub search_service_endpoint: Option<String>,

    /// Sender address for the report
    #[arg(long, env = "EMAIL_SENDER")]
    pub email_sender: Option<String>,

    /// Comma separated recipient addresses (defaults to the sender)
    #[arg(long, env = "EMAIL_RECEIVERS")]
    pub email_receivers: Option<String>,
}

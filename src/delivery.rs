//! Report delivery.
//!
//! The pipeline only knows the [`Delivery`] contract: a subject, an HTML
//! body and a recipient list. [`FileDelivery`] is the shipped implementation
//! and writes the report to disk for a mailer or static site to pick up.
//!
//! # Output Structure
//!
//! ```text
//! output_dir/
//! ├── 2025-05-06.html   # the report body
//! └── 2025-05-06.json   # subject, recipients, timestamps
//! ```

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::error::Error;
use tokio::fs;
use tracing::{error, info, instrument, warn};

pub type DeliveryError = Box<dyn Error + Send + Sync>;

#[async_trait]
pub trait Delivery: Send + Sync {
    async fn deliver(&self, subject: &str, body_html: &str, recipients: &[String]) -> Result<(), DeliveryError>;
}

/// Metadata written next to the HTML body.
#[derive(Debug, Serialize)]
pub struct DeliveryEnvelope<'a> {
    pub subject: &'a str,
    pub sender: Option<&'a str>,
    pub recipients: &'a [String],
    pub html_file: String,
    pub body_chars: usize,
    pub generated_at: DateTime<Utc>,
}

#[derive(Debug)]
pub struct FileDelivery {
    output_dir: String,
    report_date: String,
    sender: Option<String>,
}

impl FileDelivery {
    pub fn new(output_dir: impl Into<String>, report_date: impl Into<String>, sender: Option<String>) -> Self {
        Self {
            output_dir: output_dir.into(),
            report_date: report_date.into(),
            sender,
        }
    }

    fn path(&self, ext: &str) -> String {
        format!(
            "{}/{}.{}",
            self.output_dir.trim_end_matches('/'),
            self.report_date,
            ext
        )
    }
}

#[async_trait]
impl Delivery for FileDelivery {
    #[instrument(level = "info", skip_all, fields(output_dir = %self.output_dir, %subject))]
    async fn deliver(&self, subject: &str, body_html: &str, recipients: &[String]) -> Result<(), DeliveryError> {
        if recipients.is_empty() {
            warn!("No recipients configured; report is only written to disk");
        }

        if let Err(e) = fs::create_dir_all(&self.output_dir).await {
            error!(error = %e, "Failed to create output dir");
            return Err(e.into());
        }

        let html_path = self.path("html");
        fs::write(&html_path, body_html).await?;
        info!(path = %html_path, bytes = body_html.len(), "Wrote report body");

        let envelope = DeliveryEnvelope {
            subject,
            sender: self.sender.as_deref(),
            recipients,
            html_file: html_path,
            body_chars: body_html.chars().count(),
            generated_at: Utc::now(),
        };
        let json_path = self.path("json");
        fs::write(&json_path, serde_json::to_string_pretty(&envelope)?).await?;
        info!(path = %json_path, recipients = recipients.len(), "Wrote delivery envelope");

        Ok(())
    }
}

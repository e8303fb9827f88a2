//! OpenAI-compatible `chat/completions` backend.
//!
//! Any server speaking the OpenAI chat API works; point `OPENAI_BASE_URL` at
//! it. An unparsable base URL disables the backend.

use super::GenerationBackend;
use crate::error::ProviderError;
use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::{debug, instrument, warn};
use url::Url;

const OPENAI_BASE: &str = "https://api.openai.com/v1";

#[derive(Debug)]
pub struct OpenAiBackend {
    http: reqwest::Client,
    api_key: Option<String>,
    endpoint: Option<Url>,
    models: Vec<String>,
}

/// `{base}/chat/completions`, keeping any path prefix on `base`.
fn completions_url(base: &str) -> Result<Url, url::ParseError> {
    let base = format!("{}/", base.trim_end_matches('/'));
    Url::parse(&base)?.join("chat/completions")
}

fn extract_text(payload: &Value) -> Result<String, ProviderError> {
    payload
        .pointer("/choices/0/message/content")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| ProviderError::MalformedResponse("missing choices[0].message.content".to_string()))
}

impl OpenAiBackend {
    pub fn new(
        http: reqwest::Client,
        api_key: Option<String>,
        base_url: Option<&str>,
        models: Vec<String>,
    ) -> Self {
        let base = base_url.unwrap_or(OPENAI_BASE);
        let endpoint = match completions_url(base) {
            Ok(url) => Some(url),
            Err(e) => {
                warn!(%base, error = %e, "Invalid OpenAI base URL; backend disabled");
                None
            }
        };
        Self {
            http,
            api_key,
            endpoint,
            models,
        }
    }
}

#[async_trait]
impl GenerationBackend for OpenAiBackend {
    fn name(&self) -> &str {
        "openai"
    }

    fn priority(&self) -> u32 {
        20
    }

    fn is_available(&self) -> bool {
        self.api_key.is_some() && self.endpoint.is_some()
    }

    fn models(&self) -> &[String] {
        &self.models
    }

    #[instrument(level = "info", skip(self, prompt))]
    async fn complete(&self, model_id: &str, prompt: &str) -> Result<String, ProviderError> {
        let (Some(api_key), Some(endpoint)) = (self.api_key.as_deref(), self.endpoint.as_ref()) else {
            return Err(ProviderError::Unavailable("OPENAI_API_KEY".to_string()));
        };
        let body = json!({
            "model": model_id,
            "messages": [{ "role": "user", "content": prompt }],
        });

        let response = self
            .http
            .post(endpoint.clone())
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

        let text = extract_text(&payload)?;
        debug!(chars = text.chars().count(), "OpenAI-compatible backend returned text");
        Ok(text)
    }
}

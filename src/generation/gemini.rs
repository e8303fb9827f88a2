//! Google Gemini backend (`models/{model}:generateContent`).

use super::GenerationBackend;
use crate::error::ProviderError;
use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::{debug, instrument};

const GEMINI_BASE: &str = "https://generativelanguage.googleapis.com/v1beta/models";

#[derive(Debug)]
pub struct GeminiBackend {
    http: reqwest::Client,
    api_key: Option<String>,
    models: Vec<String>,
}

impl GeminiBackend {
    pub fn new(http: reqwest::Client, api_key: Option<String>, models: Vec<String>) -> Self {
        Self {
            http,
            api_key,
            models,
        }
    }
}

/// Concatenate the text parts of the first candidate.
fn extract_text(payload: &Value) -> Result<String, ProviderError> {
    if let Some(reason) = payload
        .pointer("/promptFeedback/blockReason")
        .and_then(Value::as_str)
    {
        return Err(ProviderError::MalformedResponse(format!("prompt blocked: {reason}")));
    }
    let parts = payload
        .pointer("/candidates/0/content/parts")
        .and_then(Value::as_array)
        .ok_or_else(|| ProviderError::MalformedResponse("missing candidates[0].content.parts".to_string()))?;
    Ok(parts
        .iter()
        .filter_map(|p| p.get("text").and_then(Value::as_str))
        .collect::<Vec<_>>()
        .join(""))
}

#[async_trait]
impl GenerationBackend for GeminiBackend {
    fn name(&self) -> &str {
        "gemini"
    }

    fn priority(&self) -> u32 {
        10
    }

    fn is_available(&self) -> bool {
        self.api_key.is_some()
    }

    fn models(&self) -> &[String] {
        &self.models
    }

    #[instrument(level = "info", skip(self, prompt))]
    async fn complete(&self, model_id: &str, prompt: &str) -> Result<String, ProviderError> {
        let api_key = self
            .api_key
            .as_deref()
            .ok_or_else(|| ProviderError::Unavailable("GEMINI_API_KEY".to_string()))?;
        let url = format!("{}/{}:generateContent", GEMINI_BASE, model_id);
        let body = json!({
            "contents": [{ "role": "user", "parts": [{ "text": prompt }] }]
        });

        let response = self
            .http
            .post(&url)
            .header("x-goog-api-key", api_key)
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
        debug!(chars = text.chars().count(), "Gemini returned text");
        Ok(text)
    }
}

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use crate::annotate::Generator;
use crate::error::TransportError;
use crate::settings::OllamaSettings;
use crate::templates::PromptTemplate;

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    response: String,
}

/// Generator backed by a local Ollama server (`POST /api/generate`).
pub struct OllamaClient {
    client: reqwest::Client,
    base_url: String,
    model: String,
    timeout: Duration,
}

impl OllamaClient {
    pub fn new(base_url: impl Into<String>, model: impl Into<String>, timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            model: model.into(),
            timeout,
        }
    }

    pub fn from_settings(settings: &OllamaSettings) -> Self {
        Self::new(
            settings.base_url.clone(),
            settings.model.clone(),
            Duration::from_secs(settings.timeout_secs),
        )
    }

    /// Probe `/api/tags`. Never errors; an unreachable server is just unavailable.
    pub async fn is_available(&self) -> bool {
        let url = format!("{}/api/tags", self.base_url);
        match self.client.get(&url).timeout(Duration::from_secs(5)).send().await {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                debug!(url = %url, error = %e, "ollama not reachable");
                false
            }
        }
    }
}

/// Role contents in order, then the user text under a fixed heading.
pub fn build_prompt(template: &PromptTemplate, payload: &str) -> String {
    let system: Vec<&str> = template
        .ordered_roles()
        .into_iter()
        .map(|(_, content)| content.trim())
        .filter(|content| !content.is_empty())
        .collect();
    format!("{}\n\nUser text to process:\n{}", system.join("\n\n"), payload)
}

#[async_trait]
impl Generator for OllamaClient {
    async fn generate(&self, template: &PromptTemplate, payload: &str) -> Result<String, TransportError> {
        let prompt = build_prompt(template, payload);
        let url = format!("{}/api/generate", self.base_url);
        let body = GenerateRequest {
            model: &self.model,
            prompt: &prompt,
            stream: false,
        };

        debug!(prompt = %template.name, model = %self.model, "sending generate request");
        let response = self
            .client
            .post(&url)
            .timeout(self.timeout)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    TransportError::new(format!("request timed out after {}s", self.timeout.as_secs()))
                } else {
                    TransportError::new(format!("request failed: {}", e))
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(TransportError::new(format!("HTTP {}: {}", status.as_u16(), text.trim())));
        }

        let parsed: GenerateResponse = response
            .json()
            .await
            .map_err(|e| TransportError::new(format!("invalid response: {}", e)))?;
        Ok(parsed.response.trim().to_string())
    }
}

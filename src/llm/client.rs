use crate::error::{PipelineError, Result};
use crate::llm::adapter::ExtractionAdapter;
use crate::llm::prompts::{render_user_prompt, DEFAULT_SYSTEM_PROMPT};
use crate::llm::types::*;
use async_trait::async_trait;
use log::debug;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};

const GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";
pub const DEFAULT_GEMINI_MODEL: &str = "gemini-2.5-flash";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Content {
    pub role: String,
    pub parts: Vec<Part>,
}

impl Content {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            parts: vec![Part { text: text.into() }],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Part {
    pub text: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentRequest {
    contents: Vec<Content>,
    system_instruction: Option<Content>,
    generation_config: GenerationConfig,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    response_mime_type: String,
    temperature: f32,
}

#[derive(Debug, Deserialize)]
struct GenerateContentResponse {
    candidates: Option<Vec<Candidate>>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Option<Content>,
}

/// [`ExtractionAdapter`] backed by the Gemini `generateContent` REST endpoint.
#[derive(Clone)]
pub struct GeminiAdapter {
    client: Client,
    api_key: String,
    base_url: String,
    model: String,
    system_prompt: String,
}

impl GeminiAdapter {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            api_key: api_key.into(),
            base_url: GEMINI_BASE_URL.to_string(),
            model: model.into(),
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
        }
    }

    /// Reads the key from `GEMINI_API_KEY`.
    pub fn from_env(model: impl Into<String>) -> Result<Self> {
        let api_key = std::env::var("GEMINI_API_KEY").map_err(|_| {
            PipelineError::InvalidConfig("GEMINI_API_KEY is not set".to_string())
        })?;
        Ok(Self::new(api_key, model))
    }

    /// Replace the default instructions (e.g. for a different reporting standard).
    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    async fn generate_content(&self, prompt: String) -> std::result::Result<String, AdapterError> {
        let url = format!(
            "{}/models/{}:generateContent?key={}",
            self.base_url, self.model, self.api_key
        );

        let payload = GenerateContentRequest {
            contents: vec![Content::user(prompt)],
            system_instruction: Some(Content::user(self.system_prompt.clone())),
            generation_config: GenerationConfig {
                response_mime_type: "application/json".to_string(),
                temperature: 0.0,
            },
        };

        let res = self
            .client
            .post(&url)
            .json(&payload)
            .send()
            .await
            .map_err(transport_error)?;
        let status = res.status();

        if !status.is_success() {
            let err_text = res.text().await.unwrap_or_default();
            return Err(AdapterError::new(
                classify_status(status),
                format!("Gemini API error (status {}): {}", status, err_text),
            ));
        }

        let body: GenerateContentResponse = res.json().await.map_err(transport_error)?;

        let text: String = body
            .candidates
            .unwrap_or_default()
            .into_iter()
            .next()
            .and_then(|candidate| candidate.content)
            .map(|content| content.parts.into_iter().map(|part| part.text).collect())
            .ok_or_else(|| AdapterError::provider("Gemini returned no candidates"))?;

        if text.trim().is_empty() {
            return Err(AdapterError::provider("Gemini returned empty content"));
        }
        Ok(text)
    }
}

#[async_trait]
impl ExtractionAdapter for GeminiAdapter {
    async fn extract(
        &self,
        request: &ExtractionRequest,
    ) -> std::result::Result<RawModelOutput, AdapterError> {
        let prompt = render_user_prompt(request);
        debug!(
            "Sending {}!{} to {} ({} prompt chars)",
            request.sheet_name,
            request.region.a1(),
            self.model,
            prompt.len()
        );
        self.generate_content(prompt).await.map(RawModelOutput::new)
    }

    fn name(&self) -> &str {
        &self.model
    }
}

pub fn classify_status(status: StatusCode) -> AdapterErrorKind {
    match status.as_u16() {
        429 => AdapterErrorKind::RateLimited,
        408 | 504 => AdapterErrorKind::Timeout,
        400 | 401 | 403 | 404 | 422 => AdapterErrorKind::InvalidRequest,
        _ => AdapterErrorKind::ProviderError,
    }
}

fn transport_error(err: reqwest::Error) -> AdapterError {
    if err.is_timeout() {
        AdapterError::timeout(err.to_string())
    } else {
        AdapterError::provider(err.to_string())
    }
}

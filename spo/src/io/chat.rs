//! Direct backend for OpenAI-compatible chat-completions APIs.
//!
//! Renders the capability prompts locally and sends each one as a single user
//! message to the model assigned to the role. No streaming, no retries.

use std::sync::RwLock;
use std::time::Duration;

use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, instrument, warn};

use crate::core::samples::parse_samples;
use crate::core::types::{Sample, Verdict};
use crate::io::capability::{
    AnalyzeRequest, ApiSettings, Capabilities, CapabilityError, EvaluateRequest, OptimizeRequest,
};
use crate::io::prompt::PromptEngine;

/// Models offered before a backend is configured.
pub const DEFAULT_MODEL_CATALOG: &[&str] = &[
    "Qwen/QwQ-32B",
    "Pro/deepseek-ai/DeepSeek-R1",
    "Pro/deepseek-ai/DeepSeek-V3",
    "deepseek-ai/DeepSeek-R1",
    "deepseek-ai/DeepSeek-V3",
    "deepseek-ai/DeepSeek-R1-Distill-Qwen-32B",
];

const TOP_P: f64 = 0.7;

/// Role a chat call is made for; selects model and temperature.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelRole {
    Optimizer,
    Executor,
    Evaluator,
    Analyzer,
}

impl ModelRole {
    pub fn temperature(self) -> f64 {
        match self {
            ModelRole::Optimizer | ModelRole::Executor => 0.7,
            ModelRole::Evaluator => 0.3,
            ModelRole::Analyzer => 0.5,
        }
    }

    fn model(self, settings: &ApiSettings) -> &str {
        match self {
            ModelRole::Optimizer => &settings.models.optimizer,
            ModelRole::Executor => &settings.models.executor,
            ModelRole::Evaluator => &settings.models.evaluator,
            ModelRole::Analyzer => &settings.models.analyzer,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ModelEntry {
    id: String,
}

#[derive(Debug, Deserialize)]
struct ModelList {
    data: Vec<ModelEntry>,
}

/// Capability backend calling `{base_url}/v1/chat/completions` directly.
pub struct ChatBackend {
    http: Client,
    prompts: PromptEngine,
    max_tokens: u32,
    settings: RwLock<Option<ApiSettings>>,
}

impl ChatBackend {
    pub fn new(timeout: Duration, max_tokens: u32) -> Result<Self, CapabilityError> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| CapabilityError::Network(format!("build http client: {err}")))?;
        Ok(Self {
            http,
            prompts: PromptEngine::new(),
            max_tokens,
            settings: RwLock::new(None),
        })
    }

    fn settings(&self) -> Result<ApiSettings, CapabilityError> {
        self.settings
            .read()
            .map_err(|_| CapabilityError::InvalidRequest("settings lock poisoned".to_string()))?
            .clone()
            .ok_or_else(|| CapabilityError::InvalidRequest("backend not configured".to_string()))
    }

    /// Send one user message to the model serving `role` and return its reply.
    #[instrument(skip_all, fields(role = ?role))]
    pub async fn call_model(&self, role: ModelRole, prompt: &str) -> Result<String, CapabilityError> {
        let settings = self.settings()?;
        let url = format!("{}/v1/chat/completions", settings.base_url.trim_end_matches('/'));
        let payload = json!({
            "model": role.model(&settings),
            "messages": [{ "role": "user", "content": prompt }],
            "temperature": role.temperature(),
            "max_tokens": self.max_tokens,
            "top_p": TOP_P,
            "n": 1,
            "stream": false,
        });

        let response = self
            .http
            .post(&url)
            .bearer_auth(&settings.api_key)
            .json(&payload)
            .send()
            .await
            .map_err(|err| {
                warn!(error = %err, "chat request failed");
                CapabilityError::Network(err.to_string())
            })?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|err| CapabilityError::Network(format!("read body: {err}")))?;
        if !status.is_success() {
            warn!(%status, "chat endpoint returned an error");
            return Err(CapabilityError::remote(format!(
                "status {status}: {}",
                truncate(&body, 320)
            )));
        }

        let parsed: ChatResponse = serde_json::from_str(&body)
            .map_err(|err| CapabilityError::MalformedResponse(err.to_string()))?;
        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| CapabilityError::MalformedResponse("no choices in response".to_string()))?;
        debug!(chars = content.len(), "chat reply received");
        Ok(content)
    }
}

impl Capabilities for ChatBackend {
    async fn configure(&self, settings: &ApiSettings) -> Result<(), CapabilityError> {
        if settings.api_key.trim().is_empty() || settings.base_url.trim().is_empty() {
            return Err(CapabilityError::InvalidRequest(
                "api key and base url are required".to_string(),
            ));
        }
        let mut slot = self
            .settings
            .write()
            .map_err(|_| CapabilityError::InvalidRequest("settings lock poisoned".to_string()))?;
        *slot = Some(settings.clone());
        debug!(base_url = %settings.base_url, "chat backend configured");
        Ok(())
    }

    #[instrument(skip_all)]
    async fn list_models(&self) -> Result<Vec<String>, CapabilityError> {
        let Ok(settings) = self.settings() else {
            return Ok(DEFAULT_MODEL_CATALOG.iter().map(|m| m.to_string()).collect());
        };
        let url = format!("{}/v1/models", settings.base_url.trim_end_matches('/'));
        let response = self
            .http
            .get(&url)
            .bearer_auth(&settings.api_key)
            .send()
            .await
            .map_err(|err| CapabilityError::Network(err.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(CapabilityError::remote(format!("status {status}")));
        }
        let list: ModelList = response
            .json()
            .await
            .map_err(|err| CapabilityError::MalformedResponse(err.to_string()))?;
        Ok(list.data.into_iter().map(|entry| entry.id).collect())
    }

    async fn generate_samples(&self, task_description: &str) -> Result<Vec<Sample>, CapabilityError> {
        let prompt = self
            .prompts
            .render_samples(task_description)
            .map_err(render_error)?;
        let raw = self.call_model(ModelRole::Optimizer, &prompt).await?;
        Ok(parse_samples(&raw))
    }

    async fn optimize_prompt(&self, request: OptimizeRequest<'_>) -> Result<String, CapabilityError> {
        let prompt = self.prompts.render_optimize(&request).map_err(render_error)?;
        let reply = self.call_model(ModelRole::Optimizer, &prompt).await?;
        Ok(reply.trim().to_string())
    }

    async fn execute_prompt(&self, prompt: &str, question: &str) -> Result<String, CapabilityError> {
        let full_prompt = format!("{prompt}\n\n{question}");
        self.call_model(ModelRole::Executor, &full_prompt).await
    }

    async fn evaluate_outputs(&self, request: EvaluateRequest<'_>) -> Result<Verdict, CapabilityError> {
        let prompt = self.prompts.render_evaluate(&request).map_err(render_error)?;
        let reply = self.call_model(ModelRole::Evaluator, &prompt).await?;
        Ok(Verdict::from_label(&reply))
    }

    async fn analyze_changes(&self, request: AnalyzeRequest<'_>) -> Result<String, CapabilityError> {
        let prompt = self.prompts.render_analyze(&request).map_err(render_error)?;
        self.call_model(ModelRole::Analyzer, &prompt).await
    }
}

fn render_error(err: minijinja::Error) -> CapabilityError {
    CapabilityError::InvalidRequest(format!("render prompt: {err}"))
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let head: String = text.chars().take(max_chars).collect();
    format!("{head}...")
}

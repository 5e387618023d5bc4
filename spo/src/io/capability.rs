//! Capability abstraction over the remote language-model services.
//!
//! The [`Capabilities`] trait decouples the optimization loop from the actual
//! backend (the envelope service in [`crate::io::service`] or a direct
//! chat-completions endpoint in [`crate::io::chat`]). Tests use scripted
//! implementations that return predetermined answers without network access.
//!
//! Every operation makes exactly one underlying call and reports its outcome
//! as-is. Degrading a failure (empty output, `Similar` verdict) is the
//! caller's decision, not the client's.

use std::future::Future;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::types::{Sample, Verdict};

/// Failure of a single capability call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CapabilityError {
    /// The request never produced an HTTP response (connect, timeout, TLS).
    #[error("network error: {0}")]
    Network(String),
    /// The remote answered with a failure status or `success: false`.
    #[error("remote error: {message}")]
    Remote { message: String },
    /// The remote answered, but not with the expected payload.
    #[error("malformed response: {0}")]
    MalformedResponse(String),
    /// The request could not be issued (client not configured, prompt render failure).
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl CapabilityError {
    pub fn remote(message: impl Into<String>) -> Self {
        CapabilityError::Remote {
            message: message.into(),
        }
    }
}

/// Which model serves each role in the loop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelAssignment {
    pub optimizer: String,
    pub executor: String,
    pub evaluator: String,
    pub analyzer: String,
}

impl Default for ModelAssignment {
    fn default() -> Self {
        Self {
            optimizer: "Qwen/QwQ-32B".to_string(),
            executor: "deepseek-ai/DeepSeek-R1-Distill-Qwen-32B".to_string(),
            evaluator: "Pro/deepseek-ai/DeepSeek-V3".to_string(),
            analyzer: "Pro/deepseek-ai/DeepSeek-R1".to_string(),
        }
    }
}

impl ModelAssignment {
    /// Names of roles whose model is blank.
    pub fn blank_roles(&self) -> Vec<&'static str> {
        [
            ("optimizer", &self.optimizer),
            ("executor", &self.executor),
            ("evaluator", &self.evaluator),
            ("analyzer", &self.analyzer),
        ]
        .into_iter()
        .filter(|(_, model)| model.trim().is_empty())
        .map(|(role, _)| role)
        .collect()
    }
}

/// Credentials and model choices pushed to the backend by `configure`.
#[derive(Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiSettings {
    pub api_key: String,
    pub base_url: String,
    pub models: ModelAssignment,
}

impl std::fmt::Debug for ApiSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiSettings")
            .field("api_key", &"<redacted>")
            .field("base_url", &self.base_url)
            .field("models", &self.models)
            .finish()
    }
}

/// Inputs for proposing a new candidate prompt.
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OptimizeRequest<'a> {
    pub current_prompt: &'a str,
    /// Serialized baseline output map.
    pub current_output: &'a str,
    pub task_description: &'a str,
    /// Compact summary of recent iterations.
    pub history: &'a str,
}

/// Inputs for one pairwise comparison. A is the baseline, B the candidate.
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluateRequest<'a> {
    pub output_a: &'a str,
    pub output_b: &'a str,
    pub task_description: &'a str,
    pub question: &'a str,
}

/// Inputs for the informational change analysis.
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalyzeRequest<'a> {
    pub old_prompt: &'a str,
    pub new_prompt: &'a str,
    pub task_description: &'a str,
}

/// Typed gateway to the remote capabilities.
pub trait Capabilities: Send + Sync {
    /// Push credentials and the model assignment to the backend.
    fn configure(
        &self,
        settings: &ApiSettings,
    ) -> impl Future<Output = Result<(), CapabilityError>> + Send;

    /// Model identifiers the backend offers, in backend order.
    fn list_models(&self) -> impl Future<Output = Result<Vec<String>, CapabilityError>> + Send;

    /// Generate evaluation questions for a task.
    fn generate_samples(
        &self,
        task_description: &str,
    ) -> impl Future<Output = Result<Vec<Sample>, CapabilityError>> + Send;

    /// Propose an improved prompt.
    fn optimize_prompt(
        &self,
        request: OptimizeRequest<'_>,
    ) -> impl Future<Output = Result<String, CapabilityError>> + Send;

    /// Run `prompt` against one question.
    fn execute_prompt(
        &self,
        prompt: &str,
        question: &str,
    ) -> impl Future<Output = Result<String, CapabilityError>> + Send;

    /// Compare baseline (A) and candidate (B) outputs for one question.
    fn evaluate_outputs(
        &self,
        request: EvaluateRequest<'_>,
    ) -> impl Future<Output = Result<Verdict, CapabilityError>> + Send;

    /// Describe how `new_prompt` differs from `old_prompt`.
    fn analyze_changes(
        &self,
        request: AnalyzeRequest<'_>,
    ) -> impl Future<Output = Result<String, CapabilityError>> + Send;
}

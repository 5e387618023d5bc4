//! Client for the capability service's JSON envelope API.
//!
//! Every endpoint answers `{"success": true, ...payload}` on success. A
//! non-2xx status carries `{"error": ..., "details": ...}` instead. Neither a
//! failure status nor `success != true` is ever read as a payload.

use std::time::Duration;

use reqwest::{Client, Response};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, instrument, warn};

use crate::core::types::{Sample, Verdict};
use crate::io::capability::{
    AnalyzeRequest, ApiSettings, Capabilities, CapabilityError, EvaluateRequest, OptimizeRequest,
};

/// HTTP client for the envelope service (e.g. `http://localhost:3001/api`).
#[derive(Debug, Clone)]
pub struct ServiceClient {
    http: Client,
    base_url: String,
}

#[derive(Debug, Deserialize)]
struct ModelsPayload {
    models: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct SamplesPayload {
    samples: Vec<Sample>,
}

#[derive(Debug, Deserialize)]
struct NewPromptPayload {
    #[serde(rename = "newPrompt")]
    new_prompt: String,
}

#[derive(Debug, Deserialize)]
struct OutputPayload {
    output: String,
}

#[derive(Debug, Deserialize)]
struct EvaluationPayload {
    evaluation: String,
}

#[derive(Debug, Deserialize)]
struct AnalysisPayload {
    analysis: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateSamplesBody<'a> {
    task_description: &'a str,
}

#[derive(Debug, Serialize)]
struct ExecuteBody<'a> {
    prompt: &'a str,
    question: &'a str,
}

impl ServiceClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, CapabilityError> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| CapabilityError::Network(format!("build http client: {err}")))?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, endpoint: &str) -> String {
        format!("{}/{}", self.base_url, endpoint)
    }

    async fn get<T: DeserializeOwned>(&self, endpoint: &str) -> Result<T, CapabilityError> {
        let response = self
            .http
            .get(self.url(endpoint))
            .send()
            .await
            .map_err(|err| network_error(endpoint, err))?;
        read_envelope(endpoint, response).await
    }

    async fn post<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        endpoint: &str,
        body: &B,
    ) -> Result<T, CapabilityError> {
        let response = self
            .http
            .post(self.url(endpoint))
            .json(body)
            .send()
            .await
            .map_err(|err| network_error(endpoint, err))?;
        read_envelope(endpoint, response).await
    }
}

impl Capabilities for ServiceClient {
    #[instrument(skip_all, fields(base_url = %settings.base_url))]
    async fn configure(&self, settings: &ApiSettings) -> Result<(), CapabilityError> {
        let _: Value = self.post("config", settings).await?;
        debug!("service configured");
        Ok(())
    }

    #[instrument(skip_all)]
    async fn list_models(&self) -> Result<Vec<String>, CapabilityError> {
        let payload: ModelsPayload = self.get("models").await?;
        Ok(payload.models)
    }

    #[instrument(skip_all)]
    async fn generate_samples(&self, task_description: &str) -> Result<Vec<Sample>, CapabilityError> {
        let payload: SamplesPayload = self
            .post("generate-samples", &GenerateSamplesBody { task_description })
            .await?;
        debug!(count = payload.samples.len(), "samples generated");
        Ok(payload.samples)
    }

    #[instrument(skip_all)]
    async fn optimize_prompt(&self, request: OptimizeRequest<'_>) -> Result<String, CapabilityError> {
        let payload: NewPromptPayload = self.post("optimize-prompt", &request).await?;
        Ok(payload.new_prompt)
    }

    #[instrument(skip_all)]
    async fn execute_prompt(&self, prompt: &str, question: &str) -> Result<String, CapabilityError> {
        let payload: OutputPayload = self
            .post("execute-prompt", &ExecuteBody { prompt, question })
            .await?;
        Ok(payload.output)
    }

    #[instrument(skip_all)]
    async fn evaluate_outputs(&self, request: EvaluateRequest<'_>) -> Result<Verdict, CapabilityError> {
        let payload: EvaluationPayload = self.post("evaluate-outputs", &request).await?;
        Ok(Verdict::from_label(&payload.evaluation))
    }

    #[instrument(skip_all)]
    async fn analyze_changes(&self, request: AnalyzeRequest<'_>) -> Result<String, CapabilityError> {
        let payload: AnalysisPayload = self.post("analyze-changes", &request).await?;
        Ok(payload.analysis)
    }
}

fn network_error(endpoint: &str, err: reqwest::Error) -> CapabilityError {
    warn!(endpoint, error = %err, "capability request failed");
    CapabilityError::Network(format!("{endpoint}: {err}"))
}

async fn read_envelope<T: DeserializeOwned>(
    endpoint: &str,
    response: Response,
) -> Result<T, CapabilityError> {
    let status = response.status();
    let body = response
        .text()
        .await
        .map_err(|err| CapabilityError::Network(format!("{endpoint}: read body: {err}")))?;
    let value: Option<Value> = serde_json::from_str(&body).ok();

    if !status.is_success() {
        let message = value
            .as_ref()
            .and_then(error_message)
            .unwrap_or_else(|| format!("status {status}"));
        warn!(endpoint, %status, %message, "capability service returned an error");
        return Err(CapabilityError::remote(format!("{endpoint}: {message}")));
    }

    let value = value.ok_or_else(|| {
        CapabilityError::MalformedResponse(format!("{endpoint}: body is not json"))
    })?;
    if value.get("success").and_then(Value::as_bool) != Some(true) {
        let message = error_message(&value).unwrap_or_else(|| "success flag not set".to_string());
        return Err(CapabilityError::remote(format!("{endpoint}: {message}")));
    }
    serde_json::from_value(value)
        .map_err(|err| CapabilityError::MalformedResponse(format!("{endpoint}: {err}")))
}

fn error_message(value: &Value) -> Option<String> {
    let error = value.get("error").and_then(Value::as_str)?;
    match value.get("details").and_then(Value::as_str) {
        Some(details) if !details.is_empty() => Some(format!("{error} ({details})")),
        _ => Some(error.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_message_joins_details() {
        let value = serde_json::json!({"error": "bad", "details": "why"});
        assert_eq!(error_message(&value).as_deref(), Some("bad (why)"));
        let value = serde_json::json!({"error": "bad"});
        assert_eq!(error_message(&value).as_deref(), Some("bad"));
        assert_eq!(error_message(&serde_json::json!({})), None);
    }

    #[test]
    fn url_joins_without_double_slash() {
        let client =
            ServiceClient::new("http://localhost:3001/api/", Duration::from_secs(1)).expect("client");
        assert_eq!(client.url("models"), "http://localhost:3001/api/models");
    }
}

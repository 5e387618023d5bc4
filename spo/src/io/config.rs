//! Operator configuration stored in `spo.toml`.

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::io::capability::ModelAssignment;

/// Default config file name, relative to the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "spo.toml";

/// Environment variable overriding `api_key`.
pub const API_KEY_ENV: &str = "SPO_API_KEY";

/// Hard ceiling on the iteration budget.
pub const MAX_ITERATIONS_LIMIT: u32 = 20;

/// Which capability implementation the CLI talks to.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum Backend {
    /// Call an OpenAI-compatible chat-completions API directly.
    #[default]
    Direct,
    /// Call the JSON envelope service.
    Service,
}

/// How iterations are triggered.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    #[default]
    Auto,
    Manual,
}

/// Configuration file (TOML). Missing fields take their defaults.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SpoConfig {
    pub backend: Backend,

    /// Base URL of the chat-completions provider.
    pub base_url: String,

    /// Base URL of the envelope service, including its `/api` prefix.
    pub service_url: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    pub request_timeout_secs: u64,

    /// Upper bound on in-flight per-sample calls.
    pub concurrency: usize,

    pub max_iterations: u32,

    pub mode: RunMode,

    /// Stop once this many consecutive candidates were rejected.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub early_stop_after_rejections: Option<u32>,

    pub max_tokens: u32,

    pub models: ModelAssignment,
}

impl Default for SpoConfig {
    fn default() -> Self {
        Self {
            backend: Backend::Direct,
            base_url: "https://api.siliconflow.cn".to_string(),
            service_url: "http://localhost:3001/api".to_string(),
            api_key: None,
            request_timeout_secs: 120,
            concurrency: 4,
            max_iterations: 10,
            mode: RunMode::Auto,
            early_stop_after_rejections: None,
            max_tokens: 2048,
            models: ModelAssignment::default(),
        }
    }
}

impl SpoConfig {
    pub fn validate(&self) -> Result<()> {
        if self.request_timeout_secs == 0 {
            return Err(anyhow!("request_timeout_secs must be > 0"));
        }
        if self.concurrency == 0 {
            return Err(anyhow!("concurrency must be > 0"));
        }
        if !(1..=MAX_ITERATIONS_LIMIT).contains(&self.max_iterations) {
            return Err(anyhow!(
                "max_iterations must be between 1 and {MAX_ITERATIONS_LIMIT}"
            ));
        }
        if self.max_tokens == 0 {
            return Err(anyhow!("max_tokens must be > 0"));
        }
        if self.early_stop_after_rejections == Some(0) {
            return Err(anyhow!("early_stop_after_rejections must be > 0 when set"));
        }
        if self.base_url.trim().is_empty() {
            return Err(anyhow!("base_url must be non-empty"));
        }
        if self.service_url.trim().is_empty() {
            return Err(anyhow!("service_url must be non-empty"));
        }
        let blank = self.models.blank_roles();
        if !blank.is_empty() {
            return Err(anyhow!("models.{} must be non-empty", blank.join(", models.")));
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// API key from the environment, falling back to the file value.
    pub fn resolved_api_key(&self) -> Option<String> {
        let from_env = std::env::var(API_KEY_ENV).ok();
        pick_api_key(from_env, self.api_key.clone())
    }
}

fn pick_api_key(from_env: Option<String>, from_file: Option<String>) -> Option<String> {
    from_env
        .filter(|key| !key.trim().is_empty())
        .or(from_file.filter(|key| !key.trim().is_empty()))
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `SpoConfig::default()`.
pub fn load_config(path: &Path) -> Result<SpoConfig> {
    if !path.exists() {
        let cfg = SpoConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: SpoConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("invalid config {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &SpoConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

/// Write `contents` next to `path` and rename it into place.
pub fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let mut tmp_name = path
        .file_name()
        .with_context(|| format!("path has no file name {}", path.display()))?
        .to_os_string();
    tmp_name.push(".tmp");
    let tmp_path = parent.join(tmp_name);
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp file {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace {}", path.display()))?;
    Ok(())
}

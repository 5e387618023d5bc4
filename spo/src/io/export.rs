//! JSON export of a run's history.

use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};

use crate::core::types::RunState;
use crate::io::config::write_atomic;

const DATE_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// One iteration in the export. Per-sample verdicts are deliberately left out.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExportEntry {
    pub iteration: u32,
    pub prompt: String,
    pub is_better: bool,
    pub analysis: String,
}

/// Serializable summary of a run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunExport {
    pub date: String,
    pub task_description: String,
    pub initial_prompt: String,
    pub final_prompt: String,
    pub iterations: u32,
    pub history: Vec<ExportEntry>,
}

impl RunExport {
    pub fn from_state(state: &RunState, now: DateTime<Local>) -> Self {
        Self {
            date: now.format(DATE_FORMAT).to_string(),
            task_description: state.task_description.clone(),
            initial_prompt: state.seed_prompt.clone(),
            final_prompt: state.current_best_prompt.clone(),
            iterations: state.iteration,
            history: state
                .history
                .iter()
                .map(|record| ExportEntry {
                    iteration: record.iteration,
                    prompt: record.proposed_prompt.clone(),
                    is_better: record.accepted,
                    analysis: record.analysis.clone(),
                })
                .collect(),
        }
    }
}

/// File name used when the operator asks for an export without naming one.
pub fn default_export_file_name(now: DateTime<Local>) -> String {
    format!("spo-history-{}.json", now.format("%Y%m%d-%H%M%S"))
}

/// Write the export as pretty UTF-8 JSON (temp file + rename).
pub fn write_export(path: &Path, export: &RunExport) -> Result<()> {
    let mut buf = serde_json::to_string_pretty(export).context("serialize export json")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

//! Shared deterministic types for the optimization core.
//!
//! These types define stable contracts between the controller, the capability
//! clients and the export format. They carry no I/O and serialize
//! deterministically (maps are ordered by sample id).

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Opaque sample identifier, unique within a run.
///
/// Remote services emit ids as JSON numbers or strings; both normalize to the
/// same textual form so `1` and `"1"` name the same sample.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SampleId(String);

impl SampleId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SampleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<u32> for SampleId {
    fn from(value: u32) -> Self {
        Self(value.to_string())
    }
}

impl From<&str> for SampleId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl Serialize for SampleId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for SampleId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum RawId {
            Text(String),
            Number(serde_json::Number),
        }

        Ok(match RawId::deserialize(deserializer)? {
            RawId::Text(text) => Self(text),
            RawId::Number(number) => Self(number.to_string()),
        })
    }
}

/// One evaluation question. Immutable once generated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sample {
    pub id: SampleId,
    pub question: String,
}

impl Sample {
    pub fn new(id: impl Into<SampleId>, question: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            question: question.into(),
        }
    }
}

/// Generated text per sample. Replaced wholesale, never merged.
pub type OutputMap = BTreeMap<SampleId, String>;

/// Per-sample pairwise judgment of a candidate against the baseline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    CandidateBetter,
    BaselineBetter,
    Similar,
}

/// Remote label meaning "output A (baseline) is better".
pub const LABEL_A_BETTER: &str = "A更好";
/// Remote label meaning "output B (candidate) is better".
pub const LABEL_B_BETTER: &str = "B更好";
/// Remote label meaning "the outputs are similar".
pub const LABEL_SIMILAR: &str = "相似";

impl Verdict {
    /// Map an evaluator label onto a verdict. Anything but an exact label,
    /// after trimming whitespace, is `Similar`.
    pub fn from_label(label: &str) -> Self {
        match label.trim() {
            LABEL_A_BETTER => Verdict::BaselineBetter,
            LABEL_B_BETTER => Verdict::CandidateBetter,
            _ => Verdict::Similar,
        }
    }
}

/// Verdicts for one iteration, keyed by sample id.
pub type VerdictMap = BTreeMap<SampleId, Verdict>;

/// Immutable audit entry for one completed iteration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryRecord {
    /// Iteration number (1-indexed).
    pub iteration: u32,
    pub proposed_prompt: String,
    pub accepted: bool,
    /// Natural-language change analysis; empty when the analyzer failed.
    pub analysis: String,
    pub verdicts: VerdictMap,
}

/// Complete mutable state of one optimization run.
///
/// Only the controller mutates this, and only by committing a whole iteration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunState {
    pub task_description: String,
    /// Prompt the run started from.
    pub seed_prompt: String,
    pub current_best_prompt: String,
    pub current_best_outputs: OutputMap,
    /// Completed iterations; always equal to `history.len()`.
    pub iteration: u32,
    pub max_iterations: u32,
    pub history: Vec<HistoryRecord>,
    pub terminated: bool,
}

impl RunState {
    pub fn new(task_description: &str, seed_prompt: &str, max_iterations: u32) -> Self {
        Self {
            task_description: task_description.to_string(),
            seed_prompt: seed_prompt.to_string(),
            current_best_prompt: seed_prompt.to_string(),
            current_best_outputs: OutputMap::new(),
            iteration: 0,
            max_iterations,
            history: Vec::new(),
            terminated: false,
        }
    }

    /// Number of iterations whose candidate replaced the baseline.
    pub fn accepted_count(&self) -> usize {
        self.history.iter().filter(|record| record.accepted).count()
    }

    /// Share of completed iterations that were accepted (`0.0` before the first).
    pub fn improvement_rate(&self) -> f64 {
        if self.iteration == 0 {
            return 0.0;
        }
        self.accepted_count() as f64 / f64::from(self.iteration)
    }

    pub fn budget_exhausted(&self) -> bool {
        self.iteration >= self.max_iterations
    }
}

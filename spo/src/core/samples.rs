//! Tolerant parsing of model-generated sample lists.
//!
//! Models are asked for a bare JSON array of `{id, question}` objects but
//! routinely wrap it in Markdown fences, add comments, drop key quotes or
//! answer in prose. Each stage below is tried in order until one yields
//! questions.

use std::sync::LazyLock;

use regex::Regex;
use serde::Deserialize;
use tracing::debug;

use crate::core::types::{Sample, SampleId};

static FENCED_BLOCK_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"```(?:json)?\s*([\s\S]*?)```").expect("fence regex should be valid")
});
static FENCE_MARKER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"```(?:json)?").expect("fence marker regex should be valid"));
static LINE_COMMENT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^\s*//.*$").expect("comment regex should be valid"));
static TRAILING_COMMENT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)([,\[\]\{\}])\s*//.*$").expect("trailing comment regex should be valid")
});
static BARE_KEY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"([\{,]\s*)([A-Za-z_]\w*)(\s*):").expect("bare key regex should be valid")
});
static QUESTION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#""question"\s*:\s*"((?:[^"\\]|\\.)*)""#).expect("question regex should be valid")
});

/// Number of questions taken from a prose answer.
const PROSE_SAMPLE_COUNT: usize = 3;

#[derive(Debug, Deserialize)]
struct RawSample {
    #[serde(default)]
    id: Option<SampleId>,
    question: String,
}

/// Parse a model answer into samples. Blank input yields no samples.
pub fn parse_samples(raw: &str) -> Vec<Sample> {
    if raw.trim().is_empty() {
        return Vec::new();
    }

    let cleaned = strip_code_fence(raw);
    if let Some(samples) = parse_json_array(&cleaned) {
        return samples;
    }

    let repaired = repair_json(&cleaned);
    if let Some(samples) = parse_json_array(&repaired) {
        debug!("parsed samples after json repair");
        return samples;
    }

    let extracted = extract_questions(&repaired);
    if !extracted.is_empty() {
        debug!(count = extracted.len(), "extracted questions by pattern");
        return extracted;
    }

    debug!("falling back to prose samples");
    prose_samples(raw)
}

fn strip_code_fence(raw: &str) -> String {
    if !raw.contains("```") {
        return raw.trim().to_string();
    }
    if let Some(body) = FENCED_BLOCK_RE
        .captures(raw)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().trim())
        .filter(|body| !body.is_empty())
    {
        return body.to_string();
    }
    FENCE_MARKER_RE.replace_all(raw, "").trim().to_string()
}

fn parse_json_array(text: &str) -> Option<Vec<Sample>> {
    let raw: Vec<RawSample> = serde_json::from_str(text).ok()?;
    let samples = numbered(raw.into_iter().map(|sample| (sample.id, sample.question)));
    (!samples.is_empty()).then_some(samples)
}

fn repair_json(text: &str) -> String {
    let without_lines = LINE_COMMENT_RE.replace_all(text, "");
    let without_comments = TRAILING_COMMENT_RE.replace_all(&without_lines, "$1");
    BARE_KEY_RE
        .replace_all(&without_comments, "$1\"$2\"$3:")
        .into_owned()
}

fn extract_questions(text: &str) -> Vec<Sample> {
    let questions = QUESTION_RE
        .captures_iter(text)
        .filter_map(|caps| caps.get(1))
        .map(|m| unescape(m.as_str()));
    numbered(questions.map(|question| (None, question)))
}

fn prose_samples(raw: &str) -> Vec<Sample> {
    let lines: Vec<&str> = raw
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect();
    if lines.len() >= PROSE_SAMPLE_COUNT {
        return numbered(
            lines[..PROSE_SAMPLE_COUNT]
                .iter()
                .map(|line| (None, (*line).to_string())),
        );
    }
    numbered(std::iter::once((None, raw.trim().to_string())))
}

/// Drop blank questions and fill missing ids with 1-based positions.
fn numbered(entries: impl Iterator<Item = (Option<SampleId>, String)>) -> Vec<Sample> {
    entries
        .map(|(id, question)| (id, question.trim().to_string()))
        .filter(|(_, question)| !question.is_empty())
        .enumerate()
        .map(|(index, (id, question))| Sample {
            id: id.unwrap_or_else(|| SampleId::from(index as u32 + 1)),
            question,
        })
        .collect()
}

fn unescape(fragment: &str) -> String {
    serde_json::from_str::<String>(&format!("\"{fragment}\"")).unwrap_or_else(|_| fragment.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn questions(samples: &[Sample]) -> Vec<&str> {
        samples.iter().map(|s| s.question.as_str()).collect()
    }

    #[test]
    fn parses_plain_json_array() {
        let samples = parse_samples(r#"[{"id": 1, "question": "a"}, {"id": 2, "question": "b"}]"#);
        assert_eq!(questions(&samples), vec!["a", "b"]);
        assert_eq!(samples[1].id, SampleId::from(2));
    }

    #[test]
    fn parses_fenced_json() {
        let raw = "Here you go:\n```json\n[{\"id\": \"x\", \"question\": \"fenced\"}]\n```\n";
        let samples = parse_samples(raw);
        assert_eq!(questions(&samples), vec!["fenced"]);
        assert_eq!(samples[0].id.as_str(), "x");
    }

    #[test]
    fn repairs_bare_keys_and_comments() {
        let raw = "[\n  // first\n  {id: 1, question: \"with: colon\"},\n  {id: 2, question: \"b\"} // tail\n]";
        let samples = parse_samples(raw);
        assert_eq!(questions(&samples), vec!["with: colon", "b"]);
    }

    #[test]
    fn extracts_questions_from_broken_json() {
        let raw = r#"[{"id": 1, "question": "first \"quoted\""}, {"id": 2, "question": "second"},"#;
        let samples = parse_samples(raw);
        assert_eq!(questions(&samples), vec!["first \"quoted\"", "second"]);
        assert_eq!(samples[0].id, SampleId::from(1));
    }

    #[test]
    fn falls_back_to_first_three_lines() {
        let raw = "What is X?\n\nHow does Y work?\nWhy Z?\nAnd W?";
        let samples = parse_samples(raw);
        assert_eq!(
            questions(&samples),
            vec!["What is X?", "How does Y work?", "Why Z?"]
        );
    }

    #[test]
    fn short_prose_becomes_single_sample() {
        let samples = parse_samples("only one question");
        assert_eq!(questions(&samples), vec!["only one question"]);
    }

    #[test]
    fn blank_input_yields_nothing() {
        assert!(parse_samples("  \n ").is_empty());
    }

    #[test]
    fn blank_questions_are_dropped() {
        let samples = parse_samples(r#"[{"question": " "}, {"question": "kept"}]"#);
        assert_eq!(questions(&samples), vec!["kept"]);
        assert_eq!(samples[0].id, SampleId::from(1));
    }
}

//! Run-state invariants checked before every commit.

use std::collections::BTreeSet;

use crate::core::types::{RunState, Sample, SampleId};

/// Check invariants that must hold after every committed iteration:
/// - `iteration == history.len()` and records are numbered `1..=iteration`
/// - `iteration <= max_iterations`
/// - `current_best_prompt` is the latest accepted proposal, or the seed
/// - the baseline output map covers exactly the run's samples
/// - every verdict refers to a known sample
pub fn validate_run_state(state: &RunState, samples: &[Sample]) -> Vec<String> {
    let mut errors = Vec::new();

    if state.iteration as usize != state.history.len() {
        errors.push(format!(
            "iteration {} does not match history length {}",
            state.iteration,
            state.history.len()
        ));
    }
    if state.iteration > state.max_iterations {
        errors.push(format!(
            "iteration {} exceeds max_iterations {}",
            state.iteration, state.max_iterations
        ));
    }
    for (index, record) in state.history.iter().enumerate() {
        let expected = index as u32 + 1;
        if record.iteration != expected {
            errors.push(format!(
                "history[{index}] has iteration {} (expected {expected})",
                record.iteration
            ));
        }
    }

    let expected_best = state
        .history
        .iter()
        .rev()
        .find(|record| record.accepted)
        .map(|record| record.proposed_prompt.as_str())
        .unwrap_or(state.seed_prompt.as_str());
    if state.current_best_prompt != expected_best {
        errors.push("current_best_prompt is not the latest accepted proposal".to_string());
    }

    let sample_ids: BTreeSet<&SampleId> = samples.iter().map(|sample| &sample.id).collect();
    let output_ids: BTreeSet<&SampleId> = state.current_best_outputs.keys().collect();
    if output_ids != sample_ids {
        errors.push(format!(
            "current_best_outputs covers {} samples, run has {}",
            output_ids.len(),
            sample_ids.len()
        ));
    }

    for record in &state.history {
        for id in record.verdicts.keys() {
            if !sample_ids.contains(id) {
                errors.push(format!(
                    "iteration {}: verdict for unknown sample '{id}'",
                    record.iteration
                ));
            }
        }
    }

    errors
}

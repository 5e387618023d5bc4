//! Optimization loop controller.
//!
//! Owns the run state and drives one iteration at a time:
//! propose, execute every sample, evaluate every sample, decide, record.
//! An iteration is committed atomically. If it aborts, the state is exactly
//! what it was before the step began.

use std::sync::Arc;

use futures::stream::{self, StreamExt};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::core::decision::Tally;
use crate::core::history::history_summary;
use crate::core::invariants::validate_run_state;
use crate::core::types::{HistoryRecord, OutputMap, RunState, Sample, Verdict, VerdictMap};
use crate::io::capability::{
    AnalyzeRequest, Capabilities, CapabilityError, EvaluateRequest, OptimizeRequest,
};
use crate::sample_set::SampleSet;

/// Lifecycle of a controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Baselining,
    Iterating,
    AwaitingDecision,
    Terminated,
}

/// Why a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    BudgetExhausted,
    Cancelled,
    /// The last `rejections` candidates were all rejected.
    Converged { rejections: u32 },
}

#[derive(Debug, Error)]
pub enum StepError {
    #[error("controller cannot step while {phase:?}")]
    NotReady { phase: Phase },
    #[error("run already terminated")]
    Terminated,
    #[error("optimizer failed to propose a candidate: {0}")]
    OptimizationFailed(#[source] CapabilityError),
    #[error("optimizer returned an empty candidate prompt")]
    EmptyCandidate,
    #[error("run state invariant violated: {}", .0.join("; "))]
    InvariantViolation(Vec<String>),
}

/// Result of one committed iteration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepOutcome {
    pub record: HistoryRecord,
    pub tally: Tally,
    pub terminated: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControllerOptions {
    /// Maximum in-flight per-sample calls.
    pub concurrency: usize,
    pub early_stop_after_rejections: Option<u32>,
}

impl Default for ControllerOptions {
    fn default() -> Self {
        Self {
            concurrency: 4,
            early_stop_after_rejections: None,
        }
    }
}

pub struct Controller {
    state: RunState,
    samples: Arc<SampleSet>,
    phase: Phase,
    stop_reason: Option<StopReason>,
    options: ControllerOptions,
}

impl Controller {
    pub fn new(state: RunState, samples: Arc<SampleSet>, options: ControllerOptions) -> Self {
        Self {
            state,
            samples,
            phase: Phase::Idle,
            stop_reason: None,
            options,
        }
    }

    pub fn state(&self) -> &RunState {
        &self.state
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn stop_reason(&self) -> Option<StopReason> {
        self.stop_reason
    }

    pub fn samples(&self) -> &SampleSet {
        &self.samples
    }

    /// Execute the seed prompt over every sample to fill the baseline outputs.
    #[instrument(skip_all)]
    pub async fn establish_baseline<C: Capabilities>(&mut self, client: &C) -> Result<(), StepError> {
        if self.phase != Phase::Idle {
            return Err(StepError::NotReady { phase: self.phase });
        }
        self.phase = Phase::Baselining;
        let outputs = execute_all(
            client,
            &self.state.current_best_prompt,
            self.samples.samples(),
            self.options.concurrency,
        )
        .await;

        let mut next = self.state.clone();
        next.current_best_outputs = outputs;
        let errors = validate_run_state(&next, self.samples.samples());
        if !errors.is_empty() {
            self.phase = Phase::Idle;
            return Err(StepError::InvariantViolation(errors));
        }
        self.state = next;
        self.phase = Phase::Iterating;
        info!(samples = self.samples.len(), "baseline established");
        Ok(())
    }

    /// Run one full iteration and commit it.
    #[instrument(skip_all, fields(iteration = self.state.iteration + 1))]
    pub async fn step<C: Capabilities>(&mut self, client: &C) -> Result<StepOutcome, StepError> {
        match self.phase {
            Phase::Terminated => return Err(StepError::Terminated),
            Phase::Iterating => {}
            phase => return Err(StepError::NotReady { phase }),
        }
        if self.state.budget_exhausted() {
            self.terminate(StopReason::BudgetExhausted);
            return Err(StepError::Terminated);
        }

        let iteration = self.state.iteration + 1;
        let baseline_prompt = self.state.current_best_prompt.clone();
        let current_output = serde_json::to_string(&self.state.current_best_outputs)
            .map_err(|err| StepError::InvariantViolation(vec![format!("serialize outputs: {err}")]))?;
        let history = history_summary(&self.state.history);

        let candidate = client
            .optimize_prompt(OptimizeRequest {
                current_prompt: &baseline_prompt,
                current_output: &current_output,
                task_description: &self.state.task_description,
                history: &history,
            })
            .await
            .map_err(|err| {
                warn!(error = %err, "optimizer call failed");
                StepError::OptimizationFailed(err)
            })?;
        let candidate = candidate.trim().to_string();
        if candidate.is_empty() {
            warn!("optimizer returned an empty candidate");
            return Err(StepError::EmptyCandidate);
        }

        let samples = self.samples.samples();
        let candidate_outputs =
            execute_all(client, &candidate, samples, self.options.concurrency).await;
        let verdicts = evaluate_all(
            client,
            &self.state.task_description,
            samples,
            &self.state.current_best_outputs,
            &candidate_outputs,
            self.options.concurrency,
        )
        .await;

        let analysis = match client
            .analyze_changes(AnalyzeRequest {
                old_prompt: &baseline_prompt,
                new_prompt: &candidate,
                task_description: &self.state.task_description,
            })
            .await
        {
            Ok(analysis) => analysis,
            Err(err) => {
                warn!(error = %err, "change analysis failed; recording empty analysis");
                String::new()
            }
        };

        // No await past this point, so a dropped step never leaves the phase behind.
        self.phase = Phase::AwaitingDecision;
        let tally = Tally::from_verdicts(&verdicts);
        let accepted = tally.accepts();
        debug!(?tally, accepted, "candidate judged");

        let record = HistoryRecord {
            iteration,
            proposed_prompt: candidate.clone(),
            accepted,
            analysis,
            verdicts,
        };
        let mut next = self.state.clone();
        next.iteration = iteration;
        if accepted {
            next.current_best_prompt = candidate;
            next.current_best_outputs = candidate_outputs;
        }
        next.history.push(record.clone());
        next.terminated = next.budget_exhausted();

        let errors = validate_run_state(&next, samples);
        if !errors.is_empty() {
            self.phase = Phase::Iterating;
            return Err(StepError::InvariantViolation(errors));
        }
        self.state = next;
        info!(
            iteration,
            accepted,
            candidate_better = tally.candidate_better,
            baseline_better = tally.baseline_better,
            "iteration committed"
        );

        if self.state.terminated {
            self.phase = Phase::Terminated;
            self.stop_reason = Some(StopReason::BudgetExhausted);
        } else if let Some(rejections) = self.converged_after() {
            self.terminate(StopReason::Converged { rejections });
        } else {
            self.phase = Phase::Iterating;
        }

        Ok(StepOutcome {
            record,
            tally,
            terminated: self.state.terminated,
        })
    }

    /// Stop the run at the current step boundary. No-op once terminated.
    pub fn cancel(&mut self) {
        if self.phase != Phase::Terminated {
            self.terminate(StopReason::Cancelled);
        }
    }

    fn terminate(&mut self, reason: StopReason) {
        info!(?reason, iteration = self.state.iteration, "run terminated");
        self.state.terminated = true;
        self.phase = Phase::Terminated;
        self.stop_reason = Some(reason);
    }

    fn converged_after(&self) -> Option<u32> {
        let window = self.options.early_stop_after_rejections?;
        let history = &self.state.history;
        if window == 0 || history.len() < window as usize {
            return None;
        }
        let recent = &history[history.len() - window as usize..];
        recent
            .iter()
            .all(|record| !record.accepted)
            .then_some(window)
    }
}

/// Run `prompt` on every sample. A failed sample gets an empty output.
async fn execute_all<C: Capabilities>(
    client: &C,
    prompt: &str,
    samples: &[Sample],
    concurrency: usize,
) -> OutputMap {
    stream::iter(samples.iter().map(|sample| async move {
        let output = match client.execute_prompt(prompt, &sample.question).await {
            Ok(output) => output,
            Err(err) => {
                warn!(sample = %sample.id, error = %err, "execution failed; using empty output");
                String::new()
            }
        };
        (sample.id.clone(), output)
    }))
    .buffer_unordered(concurrency.max(1))
    .collect()
    .await
}

/// Compare baseline (A) against candidate (B) on every sample.
/// A failed comparison counts as `Similar`.
async fn evaluate_all<C: Capabilities>(
    client: &C,
    task_description: &str,
    samples: &[Sample],
    baseline: &OutputMap,
    candidate: &OutputMap,
    concurrency: usize,
) -> VerdictMap {
    stream::iter(samples.iter().map(|sample| async move {
        let request = EvaluateRequest {
            output_a: baseline.get(&sample.id).map(String::as_str).unwrap_or_default(),
            output_b: candidate.get(&sample.id).map(String::as_str).unwrap_or_default(),
            task_description,
            question: &sample.question,
        };
        let verdict = match client.evaluate_outputs(request).await {
            Ok(verdict) => verdict,
            Err(err) => {
                warn!(sample = %sample.id, error = %err, "evaluation failed; counting as similar");
                Verdict::Similar
            }
        };
        (sample.id.clone(), verdict)
    }))
    .buffer_unordered(concurrency.max(1))
    .collect()
    .await
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::core::types::SampleId;
    use crate::test_support::{ScriptedCapabilities, three_samples};

    fn controller(max_iterations: u32, options: ControllerOptions) -> Controller {
        let samples = SampleSet::from_samples(three_samples()).expect("samples");
        Controller::new(
            RunState::new("write haiku", "seed", max_iterations),
            Arc::new(samples),
            options,
        )
    }

    #[tokio::test]
    async fn step_before_baseline_is_not_ready() {
        let client = ScriptedCapabilities::new(three_samples());
        let mut controller = controller(3, ControllerOptions::default());
        let err = controller.step(&client).await.expect_err("not ready");
        assert!(matches!(err, StepError::NotReady { phase: Phase::Idle }));
    }

    #[tokio::test]
    async fn baseline_covers_every_sample() {
        let client = ScriptedCapabilities::new(three_samples());
        let mut controller = controller(3, ControllerOptions::default());
        controller.establish_baseline(&client).await.expect("baseline");
        assert_eq!(controller.phase(), Phase::Iterating);
        let outputs = &controller.state().current_best_outputs;
        assert_eq!(outputs.len(), 3);
        assert_eq!(outputs[&SampleId::from(1)], "seed :: q1");
    }

    #[tokio::test]
    async fn accepted_candidate_replaces_baseline() {
        let client = ScriptedCapabilities::new(three_samples()).with_candidate(
            "better",
            [
                Verdict::CandidateBetter,
                Verdict::CandidateBetter,
                Verdict::BaselineBetter,
            ],
        );
        let mut controller = controller(3, ControllerOptions::default());
        controller.establish_baseline(&client).await.expect("baseline");

        let outcome = controller.step(&client).await.expect("step");
        assert!(outcome.record.accepted);
        assert_eq!(outcome.tally.candidate_better, 2);
        assert!(!outcome.terminated);
        let state = controller.state();
        assert_eq!(state.current_best_prompt, "better");
        assert_eq!(state.current_best_outputs[&SampleId::from(2)], "better :: q2");
        assert_eq!(state.iteration, 1);
    }

    #[tokio::test]
    async fn tie_keeps_baseline() {
        let client = ScriptedCapabilities::new(three_samples()).with_candidate(
            "tied",
            [
                Verdict::CandidateBetter,
                Verdict::BaselineBetter,
                Verdict::Similar,
            ],
        );
        let mut controller = controller(3, ControllerOptions::default());
        controller.establish_baseline(&client).await.expect("baseline");

        let outcome = controller.step(&client).await.expect("step");
        assert!(!outcome.record.accepted);
        assert_eq!(controller.state().current_best_prompt, "seed");
        assert_eq!(
            controller.state().current_best_outputs[&SampleId::from(1)],
            "seed :: q1"
        );
    }

    #[tokio::test]
    async fn empty_candidate_leaves_state_untouched() {
        let client = ScriptedCapabilities::new(three_samples()).with_candidate("   ", []);
        let mut controller = controller(3, ControllerOptions::default());
        controller.establish_baseline(&client).await.expect("baseline");
        let before = controller.state().clone();

        let err = controller.step(&client).await.expect_err("empty candidate");
        assert!(matches!(err, StepError::EmptyCandidate));
        assert_eq!(controller.state(), &before);
        assert_eq!(controller.phase(), Phase::Iterating);
    }

    #[tokio::test]
    async fn optimizer_failure_is_reported() {
        let client = ScriptedCapabilities::new(three_samples()).with_failed_candidate();
        let mut controller = controller(3, ControllerOptions::default());
        controller.establish_baseline(&client).await.expect("baseline");

        let err = controller.step(&client).await.expect_err("failure");
        assert!(matches!(err, StepError::OptimizationFailed(_)));
        assert_eq!(controller.state().iteration, 0);
        assert_eq!(client.execute_calls(), 3);
    }

    #[tokio::test]
    async fn failed_evaluations_count_as_similar() {
        let client = ScriptedCapabilities::new(three_samples())
            .with_candidate("maybe", [Verdict::CandidateBetter; 3])
            .with_failing_evaluations();
        let mut controller = controller(3, ControllerOptions::default());
        controller.establish_baseline(&client).await.expect("baseline");

        let outcome = controller.step(&client).await.expect("step");
        assert_eq!(outcome.tally.similar, 3);
        assert!(!outcome.record.accepted);
    }

    #[tokio::test]
    async fn failed_analysis_records_empty_text() {
        let client = ScriptedCapabilities::new(three_samples()).with_failing_analysis();
        let mut controller = controller(3, ControllerOptions::default());
        controller.establish_baseline(&client).await.expect("baseline");

        let outcome = controller.step(&client).await.expect("step");
        assert_eq!(outcome.record.analysis, "");
    }

    #[tokio::test]
    async fn budget_terminates_run() {
        let client = ScriptedCapabilities::new(three_samples());
        let mut controller = controller(2, ControllerOptions::default());
        controller.establish_baseline(&client).await.expect("baseline");

        assert!(!controller.step(&client).await.expect("step 1").terminated);
        assert!(controller.step(&client).await.expect("step 2").terminated);
        assert_eq!(controller.phase(), Phase::Terminated);
        assert_eq!(controller.stop_reason(), Some(StopReason::BudgetExhausted));
        assert!(matches!(
            controller.step(&client).await,
            Err(StepError::Terminated)
        ));
        assert_eq!(controller.state().history.len(), 2);
    }

    #[tokio::test]
    async fn consecutive_rejections_converge_when_enabled() {
        let client = ScriptedCapabilities::new(three_samples());
        let mut controller = controller(
            10,
            ControllerOptions {
                early_stop_after_rejections: Some(2),
                ..ControllerOptions::default()
            },
        );
        controller.establish_baseline(&client).await.expect("baseline");

        assert!(!controller.step(&client).await.expect("step 1").terminated);
        assert!(controller.step(&client).await.expect("step 2").terminated);
        assert_eq!(
            controller.stop_reason(),
            Some(StopReason::Converged { rejections: 2 })
        );
        assert_eq!(controller.state().iteration, 2);
    }

    #[tokio::test]
    async fn dropped_step_can_be_retried() {
        let client = ScriptedCapabilities::new(three_samples()).with_hanging_analysis();
        let mut controller = controller(3, ControllerOptions::default());
        controller.establish_baseline(&client).await.expect("baseline");
        let before = controller.state().clone();

        let timed_out =
            tokio::time::timeout(Duration::from_millis(100), controller.step(&client)).await;
        assert!(timed_out.is_err());
        assert_eq!(controller.phase(), Phase::Iterating);
        assert_eq!(controller.state(), &before);

        let outcome = controller.step(&client).await.expect("retried step");
        assert_eq!(outcome.record.iteration, 1);
        assert_eq!(controller.state().history.len(), 1);
    }

    #[tokio::test]
    async fn out_of_order_completions_stay_attached_to_their_samples() {
        let samples: Vec<Sample> = (1..=5u32)
            .map(|n| Sample::new(n, format!("q{n}")))
            .collect();
        let verdicts = [
            Verdict::CandidateBetter,
            Verdict::BaselineBetter,
            Verdict::Similar,
            Verdict::CandidateBetter,
            Verdict::CandidateBetter,
        ];
        let mut client = ScriptedCapabilities::new(samples.clone()).with_candidate("next", verdicts);
        for (n, sample) in samples.iter().enumerate() {
            // Earlier samples take longest, so later ones finish first.
            let delay = Duration::from_millis(10 * (5 - n as u64));
            client = client.with_delay(&sample.question, delay);
        }
        let mut controller = Controller::new(
            RunState::new("write haiku", "seed", 3),
            Arc::new(SampleSet::from_samples(samples).expect("samples")),
            ControllerOptions {
                concurrency: 2,
                ..ControllerOptions::default()
            },
        );
        controller.establish_baseline(&client).await.expect("baseline");

        let outcome = controller.step(&client).await.expect("step");
        assert!(outcome.record.accepted);
        for (n, verdict) in (1..=5u32).zip(verdicts) {
            let id = SampleId::from(n);
            assert_eq!(outcome.record.verdicts[&id], verdict);
            assert_eq!(
                controller.state().current_best_outputs[&id],
                format!("next :: q{n}")
            );
        }
        assert_eq!(client.peak_in_flight(), 2);
    }

    #[tokio::test]
    async fn cancel_stops_without_new_iteration() {
        let client = ScriptedCapabilities::new(three_samples());
        let mut controller = controller(5, ControllerOptions::default());
        controller.establish_baseline(&client).await.expect("baseline");
        controller.step(&client).await.expect("step");

        controller.cancel();
        assert!(controller.state().terminated);
        assert_eq!(controller.stop_reason(), Some(StopReason::Cancelled));
        assert!(matches!(
            controller.step(&client).await,
            Err(StepError::Terminated)
        ));
        assert_eq!(controller.state().iteration, 1);
    }
}

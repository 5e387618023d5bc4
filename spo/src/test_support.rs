//! Test-only capability backend with scripted answers.
//!
//! Executions answer `"{prompt} :: {question}"` so tests can tell which prompt
//! produced an output. Candidates are proposed in the order they were scripted.
//! When the script runs out, `candidate {n}` is proposed and judged `Similar`
//! everywhere.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use tempfile::TempDir;

use crate::core::types::{Sample, Verdict};
use crate::io::capability::{
    AnalyzeRequest, ApiSettings, Capabilities, CapabilityError, EvaluateRequest, OptimizeRequest,
};

/// Three samples with ids `1..=3` and questions `q1..=q3`.
pub fn three_samples() -> Vec<Sample> {
    (1..=3u32)
        .map(|n| Sample::new(n, format!("q{n}")))
        .collect()
}

/// Fresh temporary directory for tests that touch the filesystem.
pub fn scratch_dir() -> TempDir {
    tempfile::tempdir().expect("tempdir")
}

enum ScriptedCandidate {
    Prompt { prompt: String, verdicts: Vec<Verdict> },
    Fail(CapabilityError),
}

/// Prompt passed to the optimizer together with the history it saw.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OptimizeCall {
    pub current_prompt: String,
    pub history: String,
}

pub struct ScriptedCapabilities {
    samples: Vec<Sample>,
    generate_error: Option<CapabilityError>,
    configure_error: Option<CapabilityError>,
    candidates: Mutex<VecDeque<ScriptedCandidate>>,
    verdicts: Mutex<BTreeMap<String, Vec<Verdict>>>,
    last_candidate: Mutex<Option<String>>,
    failing_executions: Vec<(String, String)>,
    fail_evaluations: bool,
    fail_analysis: bool,
    hang_next_analysis: AtomicBool,
    delays: BTreeMap<String, Duration>,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
    optimize_log: Mutex<Vec<OptimizeCall>>,
    configure_calls: AtomicUsize,
    generate_calls: AtomicUsize,
    optimize_calls: AtomicUsize,
    execute_calls: AtomicUsize,
    evaluate_calls: AtomicUsize,
}

impl ScriptedCapabilities {
    pub fn new(samples: Vec<Sample>) -> Self {
        Self {
            samples,
            generate_error: None,
            configure_error: None,
            candidates: Mutex::new(VecDeque::new()),
            verdicts: Mutex::new(BTreeMap::new()),
            last_candidate: Mutex::new(None),
            failing_executions: Vec::new(),
            fail_evaluations: false,
            fail_analysis: false,
            hang_next_analysis: AtomicBool::new(false),
            delays: BTreeMap::new(),
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
            optimize_log: Mutex::new(Vec::new()),
            configure_calls: AtomicUsize::new(0),
            generate_calls: AtomicUsize::new(0),
            optimize_calls: AtomicUsize::new(0),
            execute_calls: AtomicUsize::new(0),
            evaluate_calls: AtomicUsize::new(0),
        }
    }

    /// Queue a candidate and its verdicts, listed in sample order.
    pub fn with_candidate(
        self,
        prompt: &str,
        verdicts: impl IntoIterator<Item = Verdict>,
    ) -> Self {
        self.candidates
            .lock()
            .expect("candidates lock")
            .push_back(ScriptedCandidate::Prompt {
                prompt: prompt.to_string(),
                verdicts: verdicts.into_iter().collect(),
            });
        self
    }

    /// Queue an optimizer call that fails.
    pub fn with_failed_candidate(self) -> Self {
        self.candidates
            .lock()
            .expect("candidates lock")
            .push_back(ScriptedCandidate::Fail(CapabilityError::remote(
                "optimizer unavailable",
            )));
        self
    }

    /// Make executing `prompt` on `question` fail.
    pub fn with_failing_execution(mut self, prompt: &str, question: &str) -> Self {
        self.failing_executions
            .push((prompt.to_string(), question.to_string()));
        self
    }

    pub fn with_failing_evaluations(mut self) -> Self {
        self.fail_evaluations = true;
        self
    }

    pub fn with_failing_analysis(mut self) -> Self {
        self.fail_analysis = true;
        self
    }

    /// The next `analyze_changes` call never resolves. Later calls answer normally.
    pub fn with_hanging_analysis(self) -> Self {
        self.hang_next_analysis.store(true, Ordering::SeqCst);
        self
    }

    /// Delay every execution and evaluation of `question` by `delay`.
    pub fn with_delay(mut self, question: &str, delay: Duration) -> Self {
        self.delays.insert(question.to_string(), delay);
        self
    }

    pub fn with_failing_generation(mut self, err: CapabilityError) -> Self {
        self.generate_error = Some(err);
        self
    }

    pub fn with_failing_configure(mut self, err: CapabilityError) -> Self {
        self.configure_error = Some(err);
        self
    }

    pub fn configure_calls(&self) -> usize {
        self.configure_calls.load(Ordering::SeqCst)
    }

    pub fn generate_calls(&self) -> usize {
        self.generate_calls.load(Ordering::SeqCst)
    }

    pub fn optimize_calls(&self) -> usize {
        self.optimize_calls.load(Ordering::SeqCst)
    }

    pub fn execute_calls(&self) -> usize {
        self.execute_calls.load(Ordering::SeqCst)
    }

    pub fn evaluate_calls(&self) -> usize {
        self.evaluate_calls.load(Ordering::SeqCst)
    }

    /// Most execute or evaluate calls observed running at once.
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    pub fn optimize_log(&self) -> Vec<OptimizeCall> {
        self.optimize_log.lock().expect("optimize log lock").clone()
    }

    fn next_candidate(&self, n: usize) -> Result<String, CapabilityError> {
        let scripted = self.candidates.lock().expect("candidates lock").pop_front();
        let (prompt, verdicts) = match scripted {
            Some(ScriptedCandidate::Fail(err)) => return Err(err),
            Some(ScriptedCandidate::Prompt { prompt, verdicts }) => (prompt, verdicts),
            None => (format!("candidate {n}"), Vec::new()),
        };
        self.verdicts
            .lock()
            .expect("verdicts lock")
            .insert(prompt.trim().to_string(), verdicts);
        *self.last_candidate.lock().expect("last candidate lock") =
            Some(prompt.trim().to_string());
        Ok(prompt)
    }

    async fn per_sample_call(&self, question: &str) {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        match self.delays.get(question) {
            Some(delay) => tokio::time::sleep(*delay).await,
            None => tokio::task::yield_now().await,
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }

    fn verdict_for(&self, question: &str) -> Verdict {
        let Some(index) = self
            .samples
            .iter()
            .position(|sample| sample.question == question)
        else {
            return Verdict::Similar;
        };
        let last = self.last_candidate.lock().expect("last candidate lock").clone();
        last.and_then(|prompt| {
            self.verdicts
                .lock()
                .expect("verdicts lock")
                .get(&prompt)
                .and_then(|verdicts| verdicts.get(index).copied())
        })
        .unwrap_or(Verdict::Similar)
    }
}

impl Capabilities for ScriptedCapabilities {
    async fn configure(&self, _settings: &ApiSettings) -> Result<(), CapabilityError> {
        self.configure_calls.fetch_add(1, Ordering::SeqCst);
        match &self.configure_error {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    async fn list_models(&self) -> Result<Vec<String>, CapabilityError> {
        Ok(vec!["scripted-model".to_string()])
    }

    async fn generate_samples(&self, _task_description: &str) -> Result<Vec<Sample>, CapabilityError> {
        self.generate_calls.fetch_add(1, Ordering::SeqCst);
        match &self.generate_error {
            Some(err) => Err(err.clone()),
            None => Ok(self.samples.clone()),
        }
    }

    async fn optimize_prompt(&self, request: OptimizeRequest<'_>) -> Result<String, CapabilityError> {
        let n = self.optimize_calls.fetch_add(1, Ordering::SeqCst) + 1;
        self.optimize_log
            .lock()
            .expect("optimize log lock")
            .push(OptimizeCall {
                current_prompt: request.current_prompt.to_string(),
                history: request.history.to_string(),
            });
        self.next_candidate(n)
    }

    async fn execute_prompt(&self, prompt: &str, question: &str) -> Result<String, CapabilityError> {
        self.execute_calls.fetch_add(1, Ordering::SeqCst);
        self.per_sample_call(question).await;
        let fails = self
            .failing_executions
            .iter()
            .any(|(p, q)| p == prompt && q == question);
        if fails {
            return Err(CapabilityError::Network("scripted execution failure".to_string()));
        }
        Ok(format!("{prompt} :: {question}"))
    }

    async fn evaluate_outputs(&self, request: EvaluateRequest<'_>) -> Result<Verdict, CapabilityError> {
        self.evaluate_calls.fetch_add(1, Ordering::SeqCst);
        self.per_sample_call(request.question).await;
        if self.fail_evaluations {
            return Err(CapabilityError::remote("scripted evaluation failure"));
        }
        Ok(self.verdict_for(request.question))
    }

    async fn analyze_changes(&self, request: AnalyzeRequest<'_>) -> Result<String, CapabilityError> {
        if self.hang_next_analysis.swap(false, Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if self.fail_analysis {
            return Err(CapabilityError::remote("scripted analysis failure"));
        }
        Ok(format!("changed {} into {}", request.old_prompt, request.new_prompt))
    }
}

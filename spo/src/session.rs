//! One optimization run: validated configuration, the capability client, the
//! frozen sample set and the controller driving them.
//!
//! Steps are serialized by the session's lock. Two concurrent `step` calls
//! run one after the other, never interleaved.

use std::sync::Arc;

use chrono::{DateTime, Local};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, instrument};

use crate::controller::{Controller, ControllerOptions, Phase, StepError, StepOutcome, StopReason};
use crate::core::types::{RunState, Sample};
use crate::io::capability::{ApiSettings, Capabilities, CapabilityError};
use crate::io::config::{MAX_ITERATIONS_LIMIT, RunMode};
use crate::io::export::RunExport;
use crate::looping::StopSignal;
use crate::sample_set::{SampleSet, SampleSetError};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("invalid run configuration: {0}")]
    Configuration(String),
    #[error("backend rejected configuration: {0}")]
    Capability(#[from] CapabilityError),
    #[error(transparent)]
    SampleSet(#[from] SampleSetError),
    #[error(transparent)]
    Step(#[from] StepError),
}

/// Everything needed to start a run.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub settings: ApiSettings,
    pub task_description: String,
    pub initial_prompt: String,
    pub max_iterations: u32,
    pub mode: RunMode,
    pub concurrency: usize,
    pub early_stop_after_rejections: Option<u32>,
}

impl RunConfig {
    pub fn validate(&self) -> Result<(), SessionError> {
        let invalid = |msg: &str| Err(SessionError::Configuration(msg.to_string()));
        if self.settings.api_key.trim().is_empty() {
            return invalid("api key must be non-empty");
        }
        if self.settings.base_url.trim().is_empty() {
            return invalid("base url must be non-empty");
        }
        if self.task_description.trim().is_empty() {
            return invalid("task description must be non-empty");
        }
        if self.initial_prompt.trim().is_empty() {
            return invalid("initial prompt must be non-empty");
        }
        if !(1..=MAX_ITERATIONS_LIMIT).contains(&self.max_iterations) {
            return Err(SessionError::Configuration(format!(
                "max iterations must be between 1 and {MAX_ITERATIONS_LIMIT}, got {}",
                self.max_iterations
            )));
        }
        if self.concurrency == 0 {
            return invalid("concurrency must be > 0");
        }
        let blank = self.settings.models.blank_roles();
        if !blank.is_empty() {
            return Err(SessionError::Configuration(format!(
                "no model assigned to {}",
                blank.join(", ")
            )));
        }
        Ok(())
    }
}

/// Read-only copy of a run's observable state.
#[derive(Debug, Clone, PartialEq)]
pub struct RunSnapshot {
    pub state: RunState,
    pub phase: Phase,
    pub stop_reason: Option<StopReason>,
    pub samples: Vec<Sample>,
}

pub struct RunSession<C> {
    client: C,
    config: RunConfig,
    samples: Arc<SampleSet>,
    controller: Mutex<Controller>,
    stop: StopSignal,
}

impl<C: Capabilities> RunSession<C> {
    /// Validate, configure the backend, generate samples and run the baseline.
    ///
    /// Nothing is created when any of these fails.
    #[instrument(skip_all)]
    pub async fn start(client: C, config: RunConfig) -> Result<Self, SessionError> {
        config.validate()?;
        client.configure(&config.settings).await?;
        let samples = Arc::new(SampleSet::generate(&client, &config.task_description).await?);

        let state = RunState::new(
            &config.task_description,
            &config.initial_prompt,
            config.max_iterations,
        );
        let options = ControllerOptions {
            concurrency: config.concurrency,
            early_stop_after_rejections: config.early_stop_after_rejections,
        };
        let mut controller = Controller::new(state, Arc::clone(&samples), options);
        controller.establish_baseline(&client).await?;
        info!(
            samples = samples.len(),
            max_iterations = config.max_iterations,
            "run started"
        );

        Ok(Self {
            client,
            config,
            samples,
            controller: Mutex::new(controller),
            stop: StopSignal::new(),
        })
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    pub fn client(&self) -> &C {
        &self.client
    }

    pub fn samples(&self) -> &SampleSet {
        &self.samples
    }

    /// Handle that stops the run at the next step boundary.
    pub fn stop_handle(&self) -> StopSignal {
        self.stop.clone()
    }

    /// Perform one iteration, unless a stop was requested.
    pub async fn step(&self) -> Result<StepOutcome, StepError> {
        let mut controller = self.controller.lock().await;
        if self.stop.is_stopped() {
            controller.cancel();
            return Err(StepError::Terminated);
        }
        controller.step(&self.client).await
    }

    /// Stop the run now. Waits for an in-flight step to finish first.
    pub async fn cancel(&self) {
        self.stop.stop();
        self.controller.lock().await.cancel();
    }

    pub async fn stop_reason(&self) -> Option<StopReason> {
        self.controller.lock().await.stop_reason()
    }

    pub async fn snapshot(&self) -> RunSnapshot {
        let controller = self.controller.lock().await;
        RunSnapshot {
            state: controller.state().clone(),
            phase: controller.phase(),
            stop_reason: controller.stop_reason(),
            samples: self.samples.samples().to_vec(),
        }
    }

    pub async fn export(&self, now: DateTime<Local>) -> RunExport {
        let controller = self.controller.lock().await;
        RunExport::from_state(controller.state(), now)
    }
}

//! Automatic mode: drive steps back-to-back until the run ends.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::info;

use crate::controller::{StepError, StepOutcome, StopReason};
use crate::io::capability::Capabilities;
use crate::session::RunSession;

/// Cooperative stop flag, honored only between steps.
#[derive(Debug, Clone, Default)]
pub struct StopSignal(Arc<AtomicBool>);

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Reason why `run_loop` stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopStop {
    /// Every budgeted iteration ran.
    BudgetExhausted,
    /// A stop was requested between steps.
    Cancelled,
    /// The early-stop window saw only rejections.
    Converged { rejections: u32 },
}

impl From<StopReason> for LoopStop {
    fn from(reason: StopReason) -> Self {
        match reason {
            StopReason::BudgetExhausted => LoopStop::BudgetExhausted,
            StopReason::Cancelled => LoopStop::Cancelled,
            StopReason::Converged { rejections } => LoopStop::Converged { rejections },
        }
    }
}

/// Summary of a loop invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopOutcome {
    pub steps_executed: u32,
    pub stop: LoopStop,
}

/// Step until the run terminates.
///
/// A step that aborts (optimizer failure, empty candidate, invariant
/// violation) ends the loop with that error. The session keeps its last
/// committed state.
pub async fn run_loop<C: Capabilities, F: FnMut(&StepOutcome)>(
    session: &RunSession<C>,
    mut on_step: F,
) -> Result<LoopOutcome, StepError> {
    let mut steps_executed = 0u32;
    loop {
        match session.step().await {
            Ok(outcome) => {
                steps_executed += 1;
                on_step(&outcome);
                if outcome.terminated {
                    break;
                }
            }
            Err(StepError::Terminated) => break,
            Err(err) => return Err(err),
        }
    }

    let stop = session
        .stop_reason()
        .await
        .map_or(LoopStop::BudgetExhausted, LoopStop::from);
    info!(steps_executed, ?stop, "loop finished");
    Ok(LoopOutcome {
        steps_executed,
        stop,
    })
}

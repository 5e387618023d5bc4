//! Acceptance rule for a candidate prompt.
//!
//! A candidate replaces the baseline only when more samples judged it better
//! than judged it worse. `Similar` verdicts and samples with no verdict do not
//! count either way, so ties (including 0-0) keep the baseline.

use serde::Serialize;

use crate::core::types::{Verdict, VerdictMap};

/// Verdict counts for one iteration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Tally {
    pub candidate_better: usize,
    pub baseline_better: usize,
    pub similar: usize,
}

impl Tally {
    pub fn from_verdicts(verdicts: &VerdictMap) -> Self {
        let mut tally = Tally::default();
        for verdict in verdicts.values() {
            match verdict {
                Verdict::CandidateBetter => tally.candidate_better += 1,
                Verdict::BaselineBetter => tally.baseline_better += 1,
                Verdict::Similar => tally.similar += 1,
            }
        }
        tally
    }

    /// Strict plurality of `CandidateBetter` over `BaselineBetter`.
    pub fn accepts(&self) -> bool {
        self.candidate_better > self.baseline_better
    }
}

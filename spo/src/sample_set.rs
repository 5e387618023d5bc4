//! The frozen evaluation corpus of a run.

use std::collections::BTreeSet;

use thiserror::Error;
use tracing::{info, warn};

use crate::core::types::{Sample, SampleId};
use crate::io::capability::{Capabilities, CapabilityError};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SampleSetError {
    #[error("sample generation returned no usable questions")]
    Empty,
    #[error("sample generation failed: {0}")]
    Capability(#[from] CapabilityError),
}

/// Ordered, immutable questions every iteration of a run is judged against.
///
/// Ids are unique. Once built the set is never regenerated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SampleSet {
    samples: Vec<Sample>,
}

impl SampleSet {
    /// Ask the capability backend for questions and freeze them.
    pub async fn generate<C: Capabilities>(
        client: &C,
        task_description: &str,
    ) -> Result<Self, SampleSetError> {
        let samples = client.generate_samples(task_description).await?;
        let set = Self::from_samples(samples)?;
        info!(count = set.len(), "sample set generated");
        Ok(set)
    }

    /// Build a set from known samples.
    ///
    /// Blank questions are dropped. When ids collide, the whole set is
    /// renumbered `1..=n` in order.
    pub fn from_samples(samples: Vec<Sample>) -> Result<Self, SampleSetError> {
        let mut samples: Vec<Sample> = samples
            .into_iter()
            .filter(|sample| !sample.question.trim().is_empty())
            .collect();
        if samples.is_empty() {
            return Err(SampleSetError::Empty);
        }

        let mut seen = BTreeSet::new();
        let unique = samples.iter().all(|sample| seen.insert(sample.id.clone()));
        if !unique {
            warn!(count = samples.len(), "duplicate sample ids; renumbering");
            for (index, sample) in samples.iter_mut().enumerate() {
                sample.id = SampleId::from(index as u32 + 1);
            }
        }
        Ok(Self { samples })
    }

    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }

    pub fn ids(&self) -> Vec<SampleId> {
        self.samples.iter().map(|sample| sample.id.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

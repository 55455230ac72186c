//! Multi-sample enrollment: averages several single-frame embeddings into
//! one before it is committed to the store.

use crate::cache::{CacheError, EmbeddingCache};
use crate::store::{IdentityStore, StoreError};
use crate::types::{Embedding, Identity, Registration};
use thiserror::Error;

/// Default number of samples averaged per registration.
pub const DEFAULT_REQUIRED_SAMPLES: usize = 3;

#[derive(Error, Debug)]
pub enum EnrollmentError {
    #[error("not enough samples: have {have}, need {need}")]
    InsufficientSamples { have: usize, need: usize },
    #[error("invalid registration: {0} is required")]
    MissingField(&'static str),
    #[error("sample dimension {actual} does not match {expected}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl EnrollmentError {
    pub fn is_validation(&self) -> bool {
        match self {
            EnrollmentError::Store(e) => e.is_validation(),
            _ => true,
        }
    }
}

/// Collects embedding samples for one registration session.
#[derive(Debug)]
pub struct EnrollmentAccumulator {
    samples: Vec<Embedding>,
    required_count: usize,
}

impl Default for EnrollmentAccumulator {
    fn default() -> Self {
        Self::new(DEFAULT_REQUIRED_SAMPLES)
    }
}

impl EnrollmentAccumulator {
    /// `required_count` is raised to at least 1.
    pub fn new(required_count: usize) -> Self {
        let required_count = required_count.max(1);
        Self {
            samples: Vec::with_capacity(required_count),
            required_count,
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn required_count(&self) -> usize {
        self.required_count
    }

    pub fn is_complete(&self) -> bool {
        self.samples.len() >= self.required_count
    }

    /// Append a sample. Returns `false` (and drops the sample) once the
    /// session already holds `required_count` samples.
    pub fn add_sample(&mut self, embedding: Embedding) -> Result<bool, EnrollmentError> {
        if self.is_complete() {
            return Ok(false);
        }
        if let Some(first) = self.samples.first() {
            if first.dim() != embedding.dim() {
                return Err(EnrollmentError::DimensionMismatch {
                    expected: first.dim(),
                    actual: embedding.dim(),
                });
            }
        }
        self.samples.push(embedding);
        Ok(true)
    }

    /// Element-wise mean of the collected samples, clearing the session.
    ///
    /// Returns `None` and leaves the samples in place while the session is
    /// still short of `required_count`.
    pub fn finalize(&mut self) -> Option<Embedding> {
        if !self.is_complete() {
            return None;
        }

        let dim = self.samples[0].dim();
        let n = self.samples.len() as f32;
        let mut mean = vec![0.0f32; dim];
        for sample in &self.samples {
            for (acc, v) in mean.iter_mut().zip(&sample.values) {
                *acc += v;
            }
        }
        for v in mean.iter_mut() {
            *v /= n;
        }

        self.samples.clear();
        Some(Embedding::new(mean))
    }

    pub fn cancel(&mut self) {
        self.samples.clear();
    }
}

/// Finalize `accumulator` and register the averaged embedding, then refresh
/// `cache` so the new identity is matchable right away.
///
/// A failed cache refresh does not undo the registration; it is logged and
/// the next rebuild picks the identity up.
pub fn commit(
    accumulator: &mut EnrollmentAccumulator,
    registration: &Registration,
    store: &dyn IdentityStore,
    cache: &EmbeddingCache,
) -> Result<Identity, EnrollmentError> {
    if let Some(field) = registration.missing_field() {
        return Err(EnrollmentError::MissingField(field));
    }

    let have = accumulator.len();
    let embedding = accumulator
        .finalize()
        .ok_or(EnrollmentError::InsufficientSamples {
            have,
            need: accumulator.required_count(),
        })?;

    let identity = store.register(registration, &embedding)?;
    tracing::info!(id = %identity.id, name = %identity.display_name, samples = have, "identity registered");

    if let Err(CacheError::Refresh(e)) = cache.rebuild(store) {
        tracing::warn!(error = %e, "cache refresh after registration failed");
    }

    Ok(identity)
}

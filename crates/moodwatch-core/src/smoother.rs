//! Temporal majority-vote smoothing of per-frame emotion readings.

use crate::types::{Emotion, EmotionObservation};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};

/// Default number of observations kept per window.
pub const DEFAULT_WINDOW_CAPACITY: usize = 5;

/// How observations are grouped into windows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SmoothingScope {
    /// One window shared by every recognized face.
    #[default]
    Global,
    /// One window per matched identity.
    PerIdentity,
}

/// Bounded FIFO of recent observations for one subject.
#[derive(Debug, Clone)]
pub struct SmoothingWindow {
    observations: VecDeque<EmotionObservation>,
    capacity: usize,
}

impl SmoothingWindow {
    /// `capacity` is raised to at least 1.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            observations: VecDeque::with_capacity(capacity + 1),
            capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.observations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observations.is_empty()
    }

    pub fn observations(&self) -> impl Iterator<Item = &EmotionObservation> {
        self.observations.iter()
    }

    /// Push a reading, evicting the oldest when over capacity, and return
    /// the smoothed result.
    pub fn observe(&mut self, label: Emotion, confidence: f32) -> EmotionObservation {
        self.observations.push_back(EmotionObservation { label, confidence });
        if self.observations.len() > self.capacity {
            self.observations.pop_front();
        }
        self.smoothed()
            .unwrap_or(EmotionObservation { label, confidence })
    }

    /// Majority label over the window and the mean confidence of that
    /// label's readings.
    ///
    /// Ties go to the label whose first occurrence in the window is
    /// earliest (oldest).
    pub fn smoothed(&self) -> Option<EmotionObservation> {
        // (label, count, confidence sum) in first-occurrence order
        let mut tally: Vec<(Emotion, u32, f32)> = Vec::with_capacity(self.observations.len());
        for obs in &self.observations {
            match tally.iter_mut().find(|(l, _, _)| *l == obs.label) {
                Some(entry) => {
                    entry.1 += 1;
                    entry.2 += obs.confidence;
                }
                None => tally.push((obs.label, 1, obs.confidence)),
            }
        }

        let mut best: Option<&(Emotion, u32, f32)> = None;
        for entry in &tally {
            match best {
                Some(b) if entry.1 <= b.1 => {}
                _ => best = Some(entry),
            }
        }

        best.map(|&(label, count, sum)| EmotionObservation {
            label,
            confidence: sum / count as f32,
        })
    }

    pub fn clear(&mut self) {
        self.observations.clear();
    }
}

/// Routes observations to smoothing windows according to a [`SmoothingScope`].
#[derive(Debug)]
pub struct EmotionSmoother {
    scope: SmoothingScope,
    capacity: usize,
    global: SmoothingWindow,
    per_identity: HashMap<String, SmoothingWindow>,
}

impl EmotionSmoother {
    pub fn new(scope: SmoothingScope, capacity: usize) -> Self {
        Self {
            scope,
            capacity,
            global: SmoothingWindow::new(capacity),
            per_identity: HashMap::new(),
        }
    }

    pub fn scope(&self) -> SmoothingScope {
        self.scope
    }

    /// Record a reading for `subject` and return its smoothed emotion.
    /// `subject` is ignored in [`SmoothingScope::Global`].
    pub fn observe(&mut self, subject: &str, label: Emotion, confidence: f32) -> EmotionObservation {
        self.window_mut(subject).observe(label, confidence)
    }

    /// Current smoothed emotion for `subject` without adding a reading.
    pub fn held(&self, subject: &str) -> Option<EmotionObservation> {
        match self.scope {
            SmoothingScope::Global => self.global.smoothed(),
            SmoothingScope::PerIdentity => self.per_identity.get(subject)?.smoothed(),
        }
    }

    pub fn reset(&mut self) {
        self.global.clear();
        self.per_identity.clear();
    }

    fn window_mut(&mut self, subject: &str) -> &mut SmoothingWindow {
        match self.scope {
            SmoothingScope::Global => &mut self.global,
            SmoothingScope::PerIdentity => {
                let capacity = self.capacity;
                self.per_identity
                    .entry(subject.to_string())
                    .or_insert_with(|| SmoothingWindow::new(capacity))
            }
        }
    }
}

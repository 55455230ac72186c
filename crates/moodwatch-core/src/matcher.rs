//! Nearest-neighbor identity matching against a cache snapshot.

use crate::cache::{IdentityRef, Snapshot};
use crate::types::Embedding;

/// Default maximum Euclidean distance for a positive match.
pub const DEFAULT_MATCH_THRESHOLD: f32 = 0.6;

/// Result of matching a probe embedding against a snapshot.
#[derive(Debug, Clone, PartialEq)]
pub enum MatchResult {
    Matched {
        identity: IdentityRef,
        distance: f32,
        /// Percentage in [0, 100].
        confidence: f32,
    },
    NoMatch {
        /// Distance of the closest candidate, if the snapshot had any.
        nearest_distance: Option<f32>,
    },
}

impl MatchResult {
    pub fn is_match(&self) -> bool {
        matches!(self, MatchResult::Matched { .. })
    }

    pub fn identity(&self) -> Option<&IdentityRef> {
        match self {
            MatchResult::Matched { identity, .. } => Some(identity),
            MatchResult::NoMatch { .. } => None,
        }
    }

    pub fn confidence(&self) -> Option<f32> {
        match self {
            MatchResult::Matched { confidence, .. } => Some(*confidence),
            MatchResult::NoMatch { .. } => None,
        }
    }
}

/// Strategy for comparing a probe embedding against a snapshot.
///
/// Implementations must be deterministic: the same probe, snapshot and
/// threshold always yield the same result.
pub trait Matcher: Send + Sync {
    fn find(&self, probe: &Embedding, snapshot: &Snapshot, threshold: f32) -> MatchResult;
}

/// Convert a match distance into a 0–100 confidence percentage.
pub fn distance_to_confidence(distance: f32) -> f32 {
    ((1.0 - distance) * 100.0).clamp(0.0, 100.0)
}

/// Exhaustive Euclidean scan. Ties resolve to the earliest snapshot entry.
pub struct EuclideanMatcher;

impl Matcher for EuclideanMatcher {
    fn find(&self, probe: &Embedding, snapshot: &Snapshot, threshold: f32) -> MatchResult {
        let mut best: Option<(usize, f32)> = None;

        for (i, candidate) in snapshot.vectors().iter().enumerate() {
            let distance = probe.euclidean_distance(candidate);
            if !distance.is_finite() {
                continue;
            }
            match best {
                Some((_, d)) if distance >= d => {}
                _ => best = Some((i, distance)),
            }
        }

        match best {
            Some((idx, distance)) if distance <= threshold => {
                let Some(identity) = snapshot.identity(idx) else {
                    return MatchResult::NoMatch {
                        nearest_distance: Some(distance),
                    };
                };
                MatchResult::Matched {
                    identity: identity.clone(),
                    distance,
                    confidence: distance_to_confidence(distance),
                }
            }
            Some((_, distance)) => MatchResult::NoMatch {
                nearest_distance: Some(distance),
            },
            None => MatchResult::NoMatch {
                nearest_distance: None,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(entries: &[(&str, Vec<f32>)]) -> Snapshot {
        Snapshot::from_entries(entries.iter().map(|(name, v)| {
            (
                IdentityRef {
                    id: format!("id-{name}"),
                    display_name: name.to_string(),
                },
                Embedding::new(v.clone()),
            )
        }))
    }

    #[test]
    fn test_empty_snapshot_is_no_match() {
        let probe = Embedding::new(vec![0.0, 0.0]);
        let result = EuclideanMatcher.find(&probe, &Snapshot::empty(), 0.6);
        assert_eq!(result, MatchResult::NoMatch { nearest_distance: None });
    }

    #[test]
    fn test_scans_all_entries() {
        let snap = snapshot(&[
            ("decoy1", vec![1.0, 1.0, 0.0]),
            ("decoy2", vec![0.0, 1.0, 1.0]),
            ("match", vec![0.1, 0.0, 0.0]),
        ]);
        let probe = Embedding::new(vec![0.0, 0.0, 0.0]);
        let result = EuclideanMatcher.find(&probe, &snap, 0.6);
        assert_eq!(result.identity().unwrap().display_name, "match");
        assert!((result.confidence().unwrap() - 90.0).abs() < 1e-4);
    }

    #[test]
    fn test_rejected_match_has_no_confidence() {
        let snap = snapshot(&[("far", vec![1.0, 0.0])]);
        let probe = Embedding::new(vec![0.0, 0.0]);
        let result = EuclideanMatcher.find(&probe, &snap, 0.6);
        assert!(!result.is_match());
        assert_eq!(result.confidence(), None);
        assert_eq!(result, MatchResult::NoMatch { nearest_distance: Some(1.0) });
    }

    #[test]
    fn test_distance_equal_to_threshold_matches() {
        let snap = snapshot(&[("edge", vec![0.5, 0.0])]);
        let probe = Embedding::new(vec![0.0, 0.0]);
        let result = EuclideanMatcher.find(&probe, &snap, 0.5);
        assert!(result.is_match());
        assert!((result.confidence().unwrap() - 50.0).abs() < 1e-4);
    }

    #[test]
    fn test_tie_prefers_first_entry() {
        let snap = snapshot(&[
            ("first", vec![0.3, 0.0]),
            ("second", vec![-0.3, 0.0]),
        ]);
        let probe = Embedding::new(vec![0.0, 0.0]);
        for _ in 0..10 {
            let result = EuclideanMatcher.find(&probe, &snap, 0.6);
            assert_eq!(result.identity().unwrap().display_name, "first");
        }
    }

    #[test]
    fn test_dimension_mismatch_never_selected() {
        let snap = snapshot(&[("short", vec![0.0]), ("ok", vec![0.2, 0.0])]);
        let probe = Embedding::new(vec![0.0, 0.0]);
        let result = EuclideanMatcher.find(&probe, &snap, 0.6);
        assert_eq!(result.identity().unwrap().display_name, "ok");
    }

    #[test]
    fn test_exact_probe_has_full_confidence() {
        let snap = snapshot(&[("self", vec![0.25, -0.5, 0.75])]);
        let probe = Embedding::new(vec![0.25, -0.5, 0.75]);
        assert_eq!(EuclideanMatcher.find(&probe, &snap, 0.6).confidence(), Some(100.0));
    }

    #[test]
    fn test_confidence_clamped() {
        assert_eq!(distance_to_confidence(0.0), 100.0);
        assert_eq!(distance_to_confidence(1.7), 0.0);
        assert!((distance_to_confidence(0.25) - 75.0).abs() < 1e-4);
    }
}

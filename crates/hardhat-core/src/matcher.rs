//! Identity matching: nearest gallery entry under a distance tolerance.

use crate::gallery::Gallery;
use crate::types::Embedding;

/// Best gallery entry accepted for a probe embedding.
#[derive(Debug, Clone, PartialEq)]
pub struct IdentityMatch {
    pub name: String,
    pub distance: f32,
}

/// Strategy for comparing a probe embedding against gallery embeddings.
///
/// A match needs two agreeing decisions: the minimum distance must be within
/// tolerance, and `accepts` must pass for that same entry.
pub trait Matcher: Send {
    /// Distance between two embeddings. Lower = more similar.
    fn distance(&self, probe: &Embedding, candidate: &Embedding) -> f32;

    /// Binary compare decision for one candidate.
    fn accepts(&self, probe: &Embedding, candidate: &Embedding, tolerance: f32) -> bool;

    /// Find the closest identity within `tolerance`.
    ///
    /// Ties resolve to the earliest gallery entry. An empty gallery yields `None`.
    fn find_match(&self, probe: &Embedding, gallery: &Gallery, tolerance: f32) -> Option<IdentityMatch> {
        let mut best: Option<(usize, f32)> = None;

        for (i, identity) in gallery.iter().enumerate() {
            let d = self.distance(probe, &identity.embedding);
            // Strict `<` keeps the first entry on ties; NaN never wins.
            let better = match best {
                None => !d.is_nan(),
                Some((_, best_d)) => d < best_d,
            };
            if better {
                best = Some((i, d));
            }
        }

        let (idx, distance) = best?;
        let identity = gallery.get(idx)?;
        if distance <= tolerance && self.accepts(probe, &identity.embedding, tolerance) {
            Some(IdentityMatch {
                name: identity.name.clone(),
                distance,
            })
        } else {
            tracing::trace!(nearest = %identity.name, distance, tolerance, "nearest identity rejected");
            None
        }
    }
}

/// Euclidean distance matcher (default).
#[derive(Debug, Clone, Copy, Default)]
pub struct EuclideanMatcher;

impl Matcher for EuclideanMatcher {
    fn distance(&self, probe: &Embedding, candidate: &Embedding) -> f32 {
        probe.euclidean_distance(candidate)
    }

    fn accepts(&self, probe: &Embedding, candidate: &Embedding, tolerance: f32) -> bool {
        probe.dim() == candidate.dim() && probe.euclidean_distance(candidate) <= tolerance
    }
}

/// Cosine matcher: distance = 1 - cosine similarity, in [0, 2].
#[derive(Debug, Clone, Copy, Default)]
pub struct CosineMatcher;

impl Matcher for CosineMatcher {
    fn distance(&self, probe: &Embedding, candidate: &Embedding) -> f32 {
        if probe.dim() != candidate.dim() {
            return f32::INFINITY;
        }
        1.0 - probe.similarity(candidate)
    }

    fn accepts(&self, probe: &Embedding, candidate: &Embedding, tolerance: f32) -> bool {
        probe.dim() == candidate.dim() && probe.similarity(candidate) >= 1.0 - tolerance
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gallery(entries: &[(&str, Vec<f32>)]) -> Gallery {
        let mut g = Gallery::default();
        for (name, values) in entries {
            g.insert(name, Embedding::new(values.clone())).unwrap();
        }
        g
    }

    #[test]
    fn test_match_within_tolerance() {
        let g = gallery(&[
            ("alice", vec![1.0, 0.0, 0.0]),
            ("bob", vec![0.0, 1.0, 0.0]),
            ("carol", vec![0.0, 0.0, 1.0]),
        ]);
        let probe = Embedding::new(vec![0.05, 0.98, 0.0]);
        let m = EuclideanMatcher.find_match(&probe, &g, 0.5).unwrap();
        assert_eq!(m.name, "bob");
        assert!(m.distance < 0.1);
    }

    #[test]
    fn test_no_match_beyond_tolerance() {
        let g = gallery(&[("alice", vec![1.0, 0.0]), ("bob", vec![0.0, 1.0])]);
        let probe = Embedding::new(vec![-1.0, -1.0]);
        assert!(EuclideanMatcher.find_match(&probe, &g, 0.5).is_none());
    }

    #[test]
    fn test_empty_gallery_never_matches() {
        let g = Gallery::default();
        for probe in [vec![], vec![0.0], vec![1.0, 2.0, 3.0], vec![f32::NAN, 1.0]] {
            let probe = Embedding::new(probe);
            assert!(EuclideanMatcher.find_match(&probe, &g, 10.0).is_none());
            assert!(CosineMatcher.find_match(&probe, &g, 10.0).is_none());
        }
    }

    #[test]
    fn test_tie_resolves_to_first_entry() {
        let g = gallery(&[("first", vec![1.0, 0.0]), ("second", vec![1.0, 0.0])]);
        let probe = Embedding::new(vec![1.0, 0.0]);
        let m = EuclideanMatcher.find_match(&probe, &g, 0.5).unwrap();
        assert_eq!(m.name, "first");
    }

    #[test]
    fn test_dimension_mismatch_probe_rejected() {
        let g = gallery(&[("alice", vec![1.0, 0.0])]);
        let probe = Embedding::new(vec![1.0, 0.0, 0.0]);
        assert!(EuclideanMatcher.find_match(&probe, &g, 100.0).is_none());
    }

    #[test]
    fn test_boundary_distance_is_accepted() {
        let g = gallery(&[("alice", vec![0.0, 0.0])]);
        let probe = Embedding::new(vec![0.5, 0.0]);
        assert!(EuclideanMatcher.find_match(&probe, &g, 0.5).is_some());
    }

    #[test]
    fn test_accept_test_must_agree() {
        // Distance says "close", compare decision says "no": no match.
        struct Strict;
        impl Matcher for Strict {
            fn distance(&self, p: &Embedding, c: &Embedding) -> f32 {
                p.euclidean_distance(c)
            }
            fn accepts(&self, _: &Embedding, _: &Embedding, _: f32) -> bool {
                false
            }
        }
        let g = gallery(&[("alice", vec![1.0, 0.0])]);
        let probe = Embedding::new(vec![1.0, 0.0]);
        assert!(Strict.find_match(&probe, &g, 0.5).is_none());
    }

    #[test]
    fn test_cosine_matcher() {
        let g = gallery(&[("decoy", vec![0.0, 1.0, 0.0]), ("match", vec![2.0, 0.0, 0.0])]);
        let probe = Embedding::new(vec![1.0, 0.0, 0.0]);
        let m = CosineMatcher.find_match(&probe, &g, 0.6).unwrap();
        assert_eq!(m.name, "match");
        assert!(m.distance.abs() < 1e-6);
    }
}

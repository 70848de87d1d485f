//! Matching policy: distance → confidence conversion, the eligibility
//! window, and the acceptance rule.

use crate::types::{Identity, Prediction};
use serde::{Deserialize, Serialize};

/// Confidence percentage for a normalized distance: `round(100 − distance)`.
pub fn confidence(distance: f32) -> i32 {
    (100.0 - distance).round() as i32
}

/// Acceptance policy for recognition sessions.
///
/// A prediction is *eligible* only when its confidence lies strictly
/// inside `(eligible_floor, eligible_ceiling)`. An eligible prediction
/// whose identity equals the claim is a *candidate match*; a candidate
/// is *accepted* once its confidence reaches `accept_threshold`.
///
/// The threshold is a minimum bar, not an exact value to hit; the
/// default of 62 keeps the bar where the system has historically sat.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct MatchPolicy {
    pub eligible_floor: i32,
    pub eligible_ceiling: i32,
    pub accept_threshold: i32,
}

impl Default for MatchPolicy {
    fn default() -> Self {
        Self {
            eligible_floor: 35,
            eligible_ceiling: 100,
            accept_threshold: 62,
        }
    }
}

/// Outcome of evaluating one prediction against a claimed identity.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MatchResult {
    pub claimed: Identity,
    pub predicted: Identity,
    pub confidence: i32,
    /// Confidence inside the eligibility window.
    pub eligible: bool,
    /// Eligible and the predicted identity equals the claim.
    pub candidate: bool,
    /// Candidate whose confidence reached the accept threshold.
    pub accepted: bool,
}

impl MatchResult {
    /// Label for the annotated stream: the identity for a candidate
    /// match, "unknown" for everything else.
    pub fn display_label(&self) -> String {
        if self.candidate {
            format!("id {}", self.predicted)
        } else {
            "unknown".to_string()
        }
    }
}

impl MatchPolicy {
    pub fn evaluate(&self, claimed: Identity, prediction: &Prediction) -> MatchResult {
        let confidence = confidence(prediction.distance);
        let eligible = confidence > self.eligible_floor && confidence < self.eligible_ceiling;
        let candidate = eligible && prediction.identity == claimed;
        let accepted = candidate && confidence >= self.accept_threshold;

        MatchResult {
            claimed,
            predicted: prediction.identity,
            confidence,
            eligible,
            candidate,
            accepted,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eval(claimed: Identity, predicted: Identity, conf: i32) -> MatchResult {
        // distance chosen so that round(100 - distance) == conf
        let prediction = Prediction {
            identity: predicted,
            distance: (100 - conf) as f32,
        };
        MatchPolicy::default().evaluate(claimed, &prediction)
    }

    #[test]
    fn accepts_candidate_at_threshold() {
        let r = eval(7, 7, 62);
        assert!(r.candidate);
        assert!(r.accepted);
    }

    #[test]
    fn accepts_candidate_above_threshold() {
        assert!(eval(7, 7, 80).accepted);
    }

    #[test]
    fn candidate_below_threshold_not_accepted() {
        let r = eval(7, 7, 50);
        assert!(r.candidate);
        assert!(!r.accepted);
    }

    #[test]
    fn confidence_34_with_matching_identity_never_accepted() {
        let r = eval(7, 7, 34);
        assert!(!r.eligible);
        assert!(!r.candidate);
        assert!(!r.accepted);
    }

    #[test]
    fn confidence_36_with_mismatched_identity_never_accepted() {
        let r = eval(7, 8, 36);
        assert!(r.eligible);
        assert!(!r.candidate);
        assert!(!r.accepted);
    }

    #[test]
    fn eligibility_bounds_are_exclusive() {
        assert!(!eval(7, 7, 35).eligible);
        assert!(eval(7, 7, 36).eligible);
        assert!(eval(7, 7, 99).eligible);
        assert!(!eval(7, 7, 100).eligible);
    }

    #[test]
    fn perfect_confidence_is_not_eligible() {
        // distance 0 → confidence 100, outside the open window
        let r = eval(7, 7, 100);
        assert!(!r.accepted);
    }

    #[test]
    fn mismatch_labels_unknown() {
        let r = eval(7, 8, 70);
        assert_eq!(r.display_label(), "unknown");
    }

    #[test]
    fn candidate_labels_identity() {
        let r = eval(7, 7, 50);
        assert_eq!(r.display_label(), "id 7");
    }

    #[test]
    fn confidence_rounds_distance() {
        assert_eq!(confidence(37.4), 63);
        assert_eq!(confidence(37.6), 62);
        assert_eq!(confidence(0.0), 100);
        assert_eq!(confidence(100.0), 0);
    }
}

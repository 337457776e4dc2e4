//! Tag-sequence validation against an FSM policy.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::FsmError;
use crate::policy::Policy;

/// Validation outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Outcome {
    Pass,
    Fail,
}

/// A single reason a sequence was rejected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Violation {
    NoMarkers,
    IllegalStart {
        expected: String,
        got: String,
    },
    IllegalTransition {
        from: String,
        to: String,
        position: usize,
    },
    IllegalFinal {
        state: String,
    },
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Violation::NoMarkers => f.write_str("no markers found"),
            Violation::IllegalStart { expected, got } => {
                write!(f, "illegal start state: expected {expected}, got {got}")
            }
            Violation::IllegalTransition { from, to, position } => {
                write!(f, "illegal transition: {from} -> {to} at position {position}")
            }
            Violation::IllegalFinal { state } => write!(f, "illegal final state: {state}"),
        }
    }
}

/// Result of validating one tag sequence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub outcome: Outcome,

    /// The full input sequence, kept regardless of outcome.
    pub trace: Vec<String>,

    /// Every violation found, in detection order.
    pub violations: Vec<Violation>,
}

impl ValidationResult {
    pub fn passed(&self) -> bool {
        self.outcome == Outcome::Pass
    }

    /// Violations rendered as human-readable reasons.
    pub fn messages(&self) -> Vec<String> {
        self.violations.iter().map(ToString::to_string).collect()
    }

    /// `BOOT -> INIT -> RUN`
    pub fn trace_line(&self) -> String {
        self.trace.join(" -> ")
    }

    /// Convert a FAIL outcome into [`FsmError::PolicyViolation`].
    pub fn into_result(self) -> Result<ValidationResult, FsmError> {
        if self.passed() {
            Ok(self)
        } else {
            Err(FsmError::PolicyViolation {
                violations: self.messages(),
                trace: self.trace,
            })
        }
    }
}

/// Validate `sequence` against `policy`.
///
/// All violations are collected in one pass. A single-element sequence is
/// only checked against the start and accept rules. A state missing from
/// `transitions` has no outgoing edges; the pairwise rule is skipped only for
/// a policy with no `start`, no `accept` and no `transitions`, which accepts
/// any non-empty sequence.
pub fn validate(sequence: &[String], policy: &Policy) -> ValidationResult {
    let trace = sequence.to_vec();

    let (Some(first), Some(last)) = (sequence.first(), sequence.last()) else {
        return ValidationResult {
            outcome: Outcome::Fail,
            trace,
            violations: vec![Violation::NoMarkers],
        };
    };

    let mut violations = Vec::new();

    if let Some(start) = &policy.start {
        if first != start {
            violations.push(Violation::IllegalStart {
                expected: start.clone(),
                got: first.clone(),
            });
        }
    }

    if !policy.is_permissive() {
        for (position, pair) in sequence.windows(2).enumerate() {
            let (from, to) = (&pair[0], &pair[1]);
            let allowed = policy
                .transitions
                .get(from)
                .is_some_and(|next| next.contains(to));
            if !allowed {
                violations.push(Violation::IllegalTransition {
                    from: from.clone(),
                    to: to.clone(),
                    position,
                });
            }
        }
    }

    if !policy.accept.is_empty() && !policy.accept.contains(last) {
        violations.push(Violation::IllegalFinal {
            state: last.clone(),
        });
    }

    let outcome = if violations.is_empty() {
        Outcome::Pass
    } else {
        Outcome::Fail
    };

    ValidationResult {
        outcome,
        trace,
        violations,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seq(states: &[&str]) -> Vec<String> {
        states.iter().map(|s| s.to_string()).collect()
    }

    fn scenario_policy() -> Policy {
        Policy::from_json(
            r#"{
                "start": "BOOT",
                "accept": ["RUN", "HALT"],
                "transitions": {
                    "BOOT": ["INIT"],
                    "INIT": ["RUN", "HALT"],
                    "RUN": ["RUN", "HALT"],
                    "HALT": []
                }
            }"#,
            None,
        )
        .unwrap()
    }

    #[test]
    fn test_legal_sequence_passes() {
        let result = validate(&seq(&["BOOT", "INIT", "RUN"]), &scenario_policy());
        assert!(result.passed());
        assert!(result.violations.is_empty());
        assert_eq!(result.trace_line(), "BOOT -> INIT -> RUN");
    }

    #[test]
    fn test_illegal_transition_reports_position() {
        let result = validate(&seq(&["BOOT", "RUN"]), &scenario_policy());
        assert_eq!(result.outcome, Outcome::Fail);
        assert_eq!(
            result.messages(),
            vec!["illegal transition: BOOT -> RUN at position 0"]
        );
    }

    #[test]
    fn test_empty_sequence_fails_with_no_markers() {
        let result = validate(&[], &scenario_policy());
        assert_eq!(result.outcome, Outcome::Fail);
        assert_eq!(result.messages(), vec!["no markers found"]);
        assert!(result.trace.is_empty());
    }

    #[test]
    fn test_collects_all_violations_in_one_pass() {
        let result = validate(&seq(&["INIT", "BOOT", "HALT", "RUN", "BOOT"]), &scenario_policy());
        assert_eq!(
            result.messages(),
            vec![
                "illegal start state: expected BOOT, got INIT",
                "illegal transition: INIT -> BOOT at position 0",
                "illegal transition: BOOT -> HALT at position 1",
                "illegal transition: HALT -> RUN at position 2",
                "illegal transition: RUN -> BOOT at position 3",
                "illegal final state: BOOT",
            ]
        );
        assert_eq!(result.trace.len(), 5);
    }

    #[test]
    fn test_single_element_skips_transition_rule() {
        // HALT has no outgoing edges but a lone HALT never forms a pair.
        let policy = Policy::from_json(
            r#"{"start": "HALT", "accept": ["HALT"], "transitions": {}}"#,
            None,
        )
        .unwrap();
        assert!(validate(&seq(&["HALT"]), &policy).passed());

        let result = validate(&seq(&["BOOT"]), &scenario_policy());
        assert_eq!(result.messages(), vec!["illegal final state: BOOT"]);
    }

    #[test]
    fn test_state_absent_from_transitions_has_no_edges() {
        let policy = Policy::from_json(r#"{"transitions": {"A": ["B"]}}"#, None).unwrap();
        let result = validate(&seq(&["A", "B", "A"]), &policy);
        assert_eq!(
            result.messages(),
            vec!["illegal transition: B -> A at position 1"]
        );
    }

    #[test]
    fn test_empty_transitions_still_constrain_pairs() {
        let policy = Policy::from_json(
            r#"{"start": "HALT", "accept": ["HALT"], "transitions": {}}"#,
            None,
        )
        .unwrap();
        let result = validate(&seq(&["HALT", "HALT"]), &policy);
        assert_eq!(result.outcome, Outcome::Fail);
        assert_eq!(
            result.messages(),
            vec!["illegal transition: HALT -> HALT at position 0"]
        );

        let policy =
            Policy::from_json(r#"{"start": "BOOT", "accept": ["RUN"]}"#, None).unwrap();
        let result = validate(&seq(&["BOOT", "RUN"]), &policy);
        assert_eq!(
            result.messages(),
            vec!["illegal transition: BOOT -> RUN at position 0"]
        );
    }

    #[test]
    fn test_start_without_edges_only_valid_alone() {
        let policy = Policy::from_json(
            r#"{"start": "BOOT", "transitions": {"INIT": ["RUN"]}}"#,
            None,
        )
        .unwrap();
        assert!(validate(&seq(&["BOOT"]), &policy).passed());

        let result = validate(&seq(&["BOOT", "INIT"]), &policy);
        assert_eq!(
            result.messages(),
            vec!["illegal transition: BOOT -> INIT at position 0"]
        );
    }

    #[test]
    fn test_permissive_policy_accepts_any_nonempty_sequence() {
        let policy = Policy::default();
        for s in [
            seq(&["X"]),
            seq(&["BOOT", "BOOT"]),
            seq(&["A", "B", "C", "D"]),
            seq(&["HALT", "BOOT", "RUN"]),
        ] {
            let result = validate(&s, &policy);
            assert!(result.passed(), "{s:?} should pass: {:?}", result.violations);
        }
    }

    #[test]
    fn test_validation_is_deterministic() {
        let policy = scenario_policy();
        let s = seq(&["BOOT", "RUN", "INIT"]);
        let a = validate(&s, &policy);
        let b = validate(&s, &policy);
        assert_eq!(a, b);
    }

    #[test]
    fn test_into_result_maps_fail_to_policy_violation() {
        let err = validate(&seq(&["BOOT", "RUN"]), &scenario_policy())
            .into_result()
            .unwrap_err();
        match err {
            FsmError::PolicyViolation { violations, trace } => {
                assert_eq!(violations.len(), 1);
                assert_eq!(trace, vec!["BOOT", "RUN"]);
            }
            other => panic!("expected PolicyViolation, got {other:?}"),
        }
    }
}

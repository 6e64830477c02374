//! Failure escalation: consecutive-failure and repetition counters, and the
//! verdict derived from them.
//!
//! Everything here is a pure function of the run history so the controller
//! and tests can recompute the counters at any point.

use serde::{Deserialize, Serialize};

use crate::history::{History, HistoryEntry};
use crate::state::TerminationReason;
use crate::types::{Action, ActionResult, ActionSignature};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureCounters {
    pub consecutive_failures: u32,
    pub action_repetition_count: u32,
}

/// Limits the verdict is computed against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EscalationPolicy {
    pub failure_budget: u32,
    pub repetition_limit: u32,
    pub final_attempt: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Continue,
    /// Allow exactly one more decision, restricted to `done`.
    ForceDoneOnly,
    Terminate(TerminationReason),
}

/// Fold one executed batch into the counters.
///
/// A lone failed action counts as a failure; any success resets the streak;
/// a multi-action batch with no success leaves it unchanged.
pub fn after_execution(counters: FailureCounters, results: &[ActionResult]) -> FailureCounters {
    let consecutive_failures = if results.iter().any(|r| r.success) {
        0
    } else if results.len() == 1 {
        counters.consecutive_failures + 1
    } else {
        counters.consecutive_failures
    };
    FailureCounters {
        consecutive_failures,
        ..counters
    }
}

/// Fold one decided batch into the counters, given the signature of the
/// previous batch's first action.
///
/// `action_repetition_count` is the number of consecutive batches, this one
/// included, that start with the same action: the first batch counts 1 and
/// a different one starts over at 1.
pub fn after_decision(
    counters: FailureCounters,
    previous: Option<&ActionSignature>,
    current: Option<&ActionSignature>,
) -> FailureCounters {
    let action_repetition_count = match (previous, current) {
        (Some(prev), Some(cur)) if prev == cur => counters.action_repetition_count + 1,
        (_, Some(_)) => 1,
        (_, None) => 0,
    };
    FailureCounters {
        action_repetition_count,
        ..counters
    }
}

pub fn batch_signature(actions: &[Action]) -> Option<ActionSignature> {
    actions.first().map(Action::signature)
}

/// Recompute the counters from scratch by replaying the history.
pub fn from_history(history: &History) -> FailureCounters {
    let mut counters = FailureCounters::default();
    let mut previous: Option<ActionSignature> = None;

    for entry in history.entries() {
        match entry {
            HistoryEntry::Decision(record) => {
                if record.error.is_some() || record.actions.is_empty() {
                    continue;
                }
                let current = batch_signature(&record.actions);
                counters = after_decision(counters, previous.as_ref(), current.as_ref());
                previous = current;
            }
            HistoryEntry::Execution(record) => {
                counters = after_execution(counters, &record.results);
            }
        }
    }
    counters
}

/// Decide whether the counters force the run to stop.
///
/// Failure exhaustion is checked before repetition. With the final-attempt
/// policy on, the first exhaustion yields [`Verdict::ForceDoneOnly`]; once
/// that round has been spent the run terminates.
pub fn should_force_terminate(
    counters: &FailureCounters,
    policy: &EscalationPolicy,
    final_attempt_used: bool,
) -> Verdict {
    if counters.consecutive_failures >= policy.failure_budget {
        if policy.final_attempt && !final_attempt_used {
            return Verdict::ForceDoneOnly;
        }
        return Verdict::Terminate(TerminationReason::MaxFailures);
    }
    if counters.action_repetition_count >= policy.repetition_limit {
        return Verdict::Terminate(TerminationReason::RepetitionLoop);
    }
    Verdict::Continue
}

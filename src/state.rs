//! Run state and the reducer that advances it.
//!
//! The controller never edits a [`RunState`] field by field. Each thing that
//! happens during a run is expressed as a [`StateEvent`] and folded in with
//! [`reduce`], which also appends the matching history entry.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::config::Budgets;
use crate::escalation::{after_decision, after_execution, batch_signature, FailureCounters};
use crate::history::{DecisionRecord, ExecutionRecord, History, HistoryEntry};
use crate::oracle::DecideMode;
use crate::progress::{GoalTracker, PageGoal, ProgressState};
use crate::stability::StabilityReport;
use crate::types::{Action, ActionResult, ActionSignature, ObservationSummary};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationReason {
    Done,
    MaxSteps,
    MaxFailures,
    RepetitionLoop,
    Error,
    Cancelled,
}

impl TerminationReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            TerminationReason::Done => "done",
            TerminationReason::MaxSteps => "max_steps",
            TerminationReason::MaxFailures => "max_failures",
            TerminationReason::RepetitionLoop => "repetition_loop",
            TerminationReason::Error => "error",
            TerminationReason::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopPhase {
    Init,
    Observe,
    Decide,
    Execute,
    Stabilize,
    Reconcile,
    Terminate,
}

impl LoopPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            LoopPhase::Init => "init",
            LoopPhase::Observe => "observe",
            LoopPhase::Decide => "decide",
            LoopPhase::Execute => "execute",
            LoopPhase::Stabilize => "stabilize",
            LoopPhase::Reconcile => "reconcile",
            LoopPhase::Terminate => "terminate",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunState {
    pub task: String,
    pub start_url: Option<String>,
    pub budgets: Budgets,
    /// Completed decide rounds.
    pub step: u32,
    pub phase: LoopPhase,
    pub counters: FailureCounters,
    pub history: History,
    pub progress: ProgressState,
    pub last_observation: Option<ObservationSummary>,
    pub last_signature: Option<ActionSignature>,
    pub mode: DecideMode,
    pub final_attempt_used: bool,
    pub final_output: Option<String>,
    pub completed: bool,
    pub outcome: Option<TerminationReason>,
    pub error: Option<String>,
}

impl RunState {
    pub fn new(task: impl Into<String>, start_url: Option<String>, budgets: Budgets) -> Self {
        Self {
            task: task.into(),
            start_url,
            budgets,
            step: 0,
            phase: LoopPhase::Init,
            counters: FailureCounters::default(),
            history: History::new(),
            progress: ProgressState::default(),
            last_observation: None,
            last_signature: None,
            mode: DecideMode::Normal,
            final_attempt_used: false,
            final_output: None,
            completed: false,
            outcome: None,
            error: None,
        }
    }

    pub fn is_terminated(&self) -> bool {
        self.outcome.is_some()
    }

    pub fn budget_spent(&self) -> bool {
        self.step >= self.budgets.step_budget
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum StateEvent {
    PhaseEntered(LoopPhase),
    GoalsExtracted(Vec<PageGoal>),
    Observed(ObservationSummary),
    ModeChanged(DecideMode),
    Decided {
        mode: DecideMode,
        actions: Vec<Action>,
        thinking: Option<String>,
        plan: Vec<String>,
    },
    DecisionFailed {
        mode: DecideMode,
        error: String,
    },
    Executed {
        results: Vec<ActionResult>,
        stability: Option<StabilityReport>,
    },
    ChecklistMatched(Vec<usize>),
    Terminated {
        reason: TerminationReason,
        error: Option<String>,
    },
}

/// Fold one event into the state. Deterministic apart from the timestamps on
/// appended history entries.
pub fn reduce(mut state: RunState, event: StateEvent) -> RunState {
    if state.is_terminated() {
        return state;
    }

    match event {
        StateEvent::PhaseEntered(phase) => state.phase = phase,
        StateEvent::GoalsExtracted(goals) => state.progress.goals = GoalTracker::new(goals),
        StateEvent::Observed(summary) => {
            state.progress.goals.evaluate(&summary.url, &summary.title);
            state.last_observation = Some(summary);
        }
        StateEvent::ModeChanged(mode) => state.mode = mode,
        StateEvent::Decided {
            mode,
            actions,
            thinking,
            plan,
        } => {
            state.step += 1;
            let current = batch_signature(&actions);
            state.counters =
                after_decision(state.counters, state.last_signature.as_ref(), current.as_ref());
            state.last_signature = current;
            if mode == DecideMode::DoneOnly {
                state.final_attempt_used = true;
            }
            state.progress.checklist.merge_lines(&plan);

            let record = DecisionRecord {
                step: state.step,
                mode,
                observation: state.last_observation.clone().unwrap_or_default(),
                actions,
                thinking,
                error: None,
                counters: state.counters,
                at: Utc::now(),
            };
            state.history = state.history.appended(HistoryEntry::Decision(record));
        }
        StateEvent::DecisionFailed { mode, error } => {
            if mode == DecideMode::DoneOnly {
                state.final_attempt_used = true;
            }
            let record = DecisionRecord {
                step: state.step + 1,
                mode,
                observation: state.last_observation.clone().unwrap_or_default(),
                actions: Vec::new(),
                thinking: None,
                error: Some(error),
                counters: state.counters,
                at: Utc::now(),
            };
            state.history = state.history.appended(HistoryEntry::Decision(record));
        }
        StateEvent::Executed { results, stability } => {
            state.counters = after_execution(state.counters, &results);
            if let Some(done) = results.iter().find(|r| r.is_done) {
                state.final_output = done.extracted_content.clone();
            }
            let record = ExecutionRecord {
                step: state.step,
                results,
                stability,
                counters: state.counters,
                at: Utc::now(),
            };
            state.history = state.history.appended(HistoryEntry::Execution(record));
        }
        StateEvent::ChecklistMatched(indices) => {
            state.progress.checklist.mark_checked(&indices);
        }
        StateEvent::Terminated { reason, error } => {
            state.phase = LoopPhase::Terminate;
            state.completed = reason == TerminationReason::Done;
            state.outcome = Some(reason);
            state.error = error;
        }
    }
    state
}

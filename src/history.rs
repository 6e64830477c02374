//! Append-only audit trail of a run.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::escalation::FailureCounters;
use crate::oracle::DecideMode;
use crate::stability::StabilityReport;
use crate::types::{Action, ActionResult, ObservationSummary};

/// What the oracle was shown and what it answered for one step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionRecord {
    pub step: u32,
    pub mode: DecideMode,
    pub observation: ObservationSummary,
    pub actions: Vec<Action>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub counters: FailureCounters,
    pub at: DateTime<Utc>,
}

/// What happened when a decided batch was executed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub step: u32,
    pub results: Vec<ActionResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stability: Option<StabilityReport>,
    pub counters: FailureCounters,
    pub at: DateTime<Utc>,
}

impl ExecutionRecord {
    pub fn success_count(&self) -> usize {
        self.results.iter().filter(|r| r.success).count()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "origin", rename_all = "snake_case")]
pub enum HistoryEntry {
    Decision(DecisionRecord),
    Execution(ExecutionRecord),
}

impl HistoryEntry {
    pub fn step(&self) -> u32 {
        match self {
            HistoryEntry::Decision(record) => record.step,
            HistoryEntry::Execution(record) => record.step,
        }
    }

    /// Single line used when the history is replayed into a prompt.
    pub fn describe(&self) -> String {
        match self {
            HistoryEntry::Decision(record) => {
                if let Some(err) = &record.error {
                    return format!("Step {}: decision failed: {}", record.step, err);
                }
                let actions: Vec<String> = record.actions.iter().map(Action::describe).collect();
                format!("Step {}: planned {}", record.step, actions.join("; "))
            }
            HistoryEntry::Execution(record) => {
                let outcomes: Vec<String> = record
                    .results
                    .iter()
                    .map(|result| match &result.error {
                        Some(err) => format!("{} FAILED ({})", result.action.kind(), err),
                        None => format!("{} ok", result.summary()),
                    })
                    .collect();
                format!("Step {}: {}", record.step, outcomes.join("; "))
            }
        }
    }
}

/// Append-only list of history entries. Entries are never edited after they
/// are added; appending consumes the old value and returns the new one.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct History {
    entries: Vec<HistoryEntry>,
}

impl History {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn appended(mut self, entry: HistoryEntry) -> Self {
        self.entries.push(entry);
        self
    }

    pub fn entries(&self) -> &[HistoryEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The last `n` entries, oldest first.
    pub fn recent(&self, n: usize) -> &[HistoryEntry] {
        let start = self.entries.len().saturating_sub(n);
        &self.entries[start..]
    }

    pub fn decisions(&self) -> impl Iterator<Item = &DecisionRecord> {
        self.entries.iter().filter_map(|entry| match entry {
            HistoryEntry::Decision(record) => Some(record),
            HistoryEntry::Execution(_) => None,
        })
    }

    pub fn executions(&self) -> impl Iterator<Item = &ExecutionRecord> {
        self.entries.iter().filter_map(|entry| match entry {
            HistoryEntry::Execution(record) => Some(record),
            HistoryEntry::Decision(_) => None,
        })
    }

    pub fn last_decision(&self) -> Option<&DecisionRecord> {
        self.entries.iter().rev().find_map(|entry| match entry {
            HistoryEntry::Decision(record) => Some(record),
            HistoryEntry::Execution(_) => None,
        })
    }

    pub fn last_execution(&self) -> Option<&ExecutionRecord> {
        self.entries.iter().rev().find_map(|entry| match entry {
            HistoryEntry::Execution(record) => Some(record),
            HistoryEntry::Decision(_) => None,
        })
    }
}

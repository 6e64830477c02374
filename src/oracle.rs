//! The decision oracle and progress matcher seams, plus the validation every
//! decision passes through before the controller acts on it.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::error::OracleError;
use crate::history::History;
use crate::progress::{PageGoal, ProgressState};
use crate::types::{Action, ActionResult, Observation};

/// How much freedom the oracle gets for one decision.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecideMode {
    #[default]
    Normal,
    /// Retry after a failed call: shorter context, single action.
    Simplified,
    /// Final attempt after the failure budget ran out: only `done` is accepted.
    DoneOnly,
}

/// Everything the oracle sees for one decision.
#[derive(Debug, Clone, Copy)]
pub struct DecideRequest<'a> {
    pub task: &'a str,
    pub observation: &'a Observation,
    pub history: &'a History,
    pub progress: &'a ProgressState,
    pub mode: DecideMode,
    pub max_actions: usize,
    /// 1-based index of the step being decided.
    pub step: u32,
    pub step_budget: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub actions: Vec<Action>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking: Option<String>,
    /// Checklist lines the oracle wants tracked.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub plan: Vec<String>,
}

impl Decision {
    pub fn new(actions: Vec<Action>) -> Self {
        Self {
            actions,
            ..Default::default()
        }
    }

    /// Enforce the batch rules: at least one action, nothing after `done`, at
    /// most `max_actions` entries.
    pub fn validated(mut self, max_actions: usize) -> Result<Self, OracleError> {
        if let Some(pos) = self.actions.iter().position(Action::is_done) {
            if pos + 1 < self.actions.len() {
                debug!(dropped = self.actions.len() - pos - 1, "dropping actions after done");
            }
            self.actions.truncate(pos + 1);
        }
        if self.actions.len() > max_actions {
            warn!(
                decided = self.actions.len(),
                max_actions, "decision exceeds batch limit, truncating"
            );
            self.actions.truncate(max_actions);
        }
        if self.actions.is_empty() {
            return Err(OracleError::EmptyDecision);
        }
        Ok(self)
    }

    /// Keep only the first `done`, for done-only rounds.
    pub fn restricted_to_done(mut self) -> Option<Self> {
        let done = self.done_action()?.clone();
        self.actions = vec![done];
        Some(self)
    }

    pub fn done_action(&self) -> Option<&Action> {
        self.actions.iter().find(|a| a.is_done())
    }
}

/// Parse a raw model reply into a decision.
///
/// Accepts an object with an `actions` array, a bare array of actions, or a
/// single action object, optionally wrapped in a markdown code fence.
pub fn parse_decision(raw: &str) -> Result<Decision, OracleError> {
    let cleaned = strip_code_fence(raw);
    if cleaned.is_empty() {
        return Err(OracleError::malformed("empty reply"));
    }
    let value: Value = serde_json::from_str(cleaned)?;

    match value {
        Value::Array(items) => Ok(Decision::new(parse_actions(items)?)),
        Value::Object(mut map) => {
            if map.contains_key("action") {
                let action: Action = serde_json::from_value(Value::Object(map))?;
                return Ok(Decision::new(vec![action]));
            }
            let actions = match map.remove("actions") {
                Some(Value::Array(items)) => parse_actions(items)?,
                Some(single @ Value::Object(_)) => vec![serde_json::from_value(single)?],
                _ => return Err(OracleError::malformed("reply has no actions")),
            };
            let thinking = ["thinking", "reasoning", "memory"]
                .iter()
                .find_map(|key| map.get(*key).and_then(Value::as_str))
                .map(str::to_string);
            let plan = match map.remove("plan") {
                Some(Value::Array(lines)) => lines
                    .into_iter()
                    .filter_map(|line| line.as_str().map(str::to_string))
                    .collect(),
                Some(Value::String(text)) => text.lines().map(str::to_string).collect(),
                _ => Vec::new(),
            };
            Ok(Decision {
                actions,
                thinking,
                plan,
            })
        }
        other => Err(OracleError::malformed(format!(
            "expected an object or array, got {}",
            other
        ))),
    }
}

fn parse_actions(items: Vec<Value>) -> Result<Vec<Action>, OracleError> {
    items
        .into_iter()
        .map(|item| serde_json::from_value(item).map_err(OracleError::from))
        .collect()
}

/// Strip a surrounding ```json fence if the model added one.
pub fn strip_code_fence(raw: &str) -> &str {
    let trimmed = raw.trim();
    let Some(inner) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let inner = inner.strip_prefix("json").unwrap_or(inner);
    inner.strip_suffix("```").unwrap_or(inner).trim()
}

/// The model that chooses the next actions.
#[async_trait]
pub trait DecisionOracle: Send + Sync {
    async fn decide(&self, request: &DecideRequest<'_>) -> Result<Decision, OracleError>;

    /// Split a task into ordered page-state goals. Most tasks have none.
    async fn extract_goals(&self, _task: &str) -> Result<Vec<PageGoal>, OracleError> {
        Ok(Vec::new())
    }
}

/// Decides which checklist lines a batch of successful actions completed.
///
/// Returned indices refer to `lines`. The answer must not depend on the
/// order of `completed` and must be the same when asked twice.
#[async_trait]
pub trait ProgressMatcher: Send + Sync {
    async fn match_completed_steps(
        &self,
        completed: &[ActionResult],
        lines: &[String],
    ) -> Result<Vec<usize>, OracleError>;
}

/// Words too common to tell checklist lines apart.
const SKIP_WORDS: &[&str] = &[
    "the", "a", "an", "to", "in", "on", "at", "for", "with", "and", "or", "but", "if", "when",
    "wait", "click", "enter", "fill", "select",
];

/// Share of a line's significant words that must occur in the action text.
const KEYWORD_MATCH_RATIO: f64 = 0.6;

/// Deterministic matcher used when the model-backed one is unavailable.
#[derive(Debug, Clone, Copy, Default)]
pub struct KeywordMatcher;

impl KeywordMatcher {
    pub fn match_lines(&self, completed: &[ActionResult], lines: &[String]) -> Vec<usize> {
        let actions_text = completed
            .iter()
            .map(ActionResult::summary)
            .collect::<Vec<_>>()
            .join(" ")
            .to_lowercase();

        let matched: Vec<usize> = lines
            .iter()
            .enumerate()
            .filter(|(_, line)| {
                let lowered = line.to_lowercase();
                let words: Vec<&str> = lowered
                    .split_whitespace()
                    .filter(|w| w.chars().count() > 2 && !SKIP_WORDS.contains(w))
                    .collect();
                if words.is_empty() {
                    return false;
                }
                let hits = words.iter().filter(|w| actions_text.contains(*w)).count();
                hits as f64 >= words.len() as f64 * KEYWORD_MATCH_RATIO
            })
            .map(|(index, _)| index)
            .collect();

        if !matched.is_empty() {
            info!(?matched, "keyword matcher found completed lines");
        }
        matched
    }
}

#[async_trait]
impl ProgressMatcher for KeywordMatcher {
    async fn match_completed_steps(
        &self,
        completed: &[ActionResult],
        lines: &[String],
    ) -> Result<Vec<usize>, OracleError> {
        Ok(self.match_lines(completed, lines))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_fenced_object_with_plan() {
        let raw = r#"```json
{"thinking":"search first","plan":["- [ ] search","- [ ] open result"],
 "actions":[{"action":"type","index":2,"text":"boots"},{"action":"click","index":3}]}
```"#;
        let decision = parse_decision(raw).unwrap();
        assert_eq!(decision.actions.len(), 2);
        assert_eq!(decision.thinking.as_deref(), Some("search first"));
        assert_eq!(decision.plan.len(), 2);
    }

    #[test]
    fn parses_single_action_and_bare_array() {
        let single = parse_decision(r#"{"action":"go_back"}"#).unwrap();
        assert_eq!(single.actions, vec![Action::GoBack]);

        let array = parse_decision(r#"[{"action":"wait","seconds":1}]"#).unwrap();
        assert_eq!(array.actions, vec![Action::Wait { seconds: 1 }]);
    }

    #[test]
    fn rejects_unknown_actions_and_prose() {
        assert!(matches!(
            parse_decision(r#"{"actions":[{"action":"fly"}]}"#),
            Err(OracleError::Malformed(_))
        ));
        assert!(parse_decision("I would click the button").is_err());
        assert!(parse_decision("   ").is_err());
    }

    #[test]
    fn validation_truncates_and_cuts_after_done() {
        let decision = Decision::new(vec![
            Action::Click { index: 1 },
            Action::Done {
                text: "ok".into(),
                success: true,
            },
            Action::Click { index: 2 },
        ])
        .validated(3)
        .unwrap();
        assert_eq!(decision.actions.len(), 2);
        assert!(decision.actions[1].is_done());

        let decision = Decision::new((1..=5).map(|index| Action::Click { index }).collect())
            .validated(3)
            .unwrap();
        assert_eq!(decision.actions.len(), 3);

        assert!(matches!(
            Decision::new(Vec::new()).validated(3),
            Err(OracleError::EmptyDecision)
        ));
    }

    #[test]
    fn done_only_keeps_just_the_done_action() {
        let done = Action::Done {
            text: "gave up".into(),
            success: false,
        };
        let decision = Decision::new(vec![Action::Click { index: 1 }, done.clone()]);
        assert_eq!(decision.done_action(), Some(&done));
        assert_eq!(decision.restricted_to_done().unwrap().actions, vec![done]);
        assert!(Decision::new(vec![Action::GoBack]).restricted_to_done().is_none());
    }

    #[test]
    fn keyword_matcher_needs_most_significant_words() {
        let completed = vec![
            ActionResult::ok(Action::Navigate {
                url: "https://shop.test/shoes".into(),
                new_tab: false,
            }),
            ActionResult::extracted(
                Action::Extract {
                    query: "price".into(),
                },
                "Running shoes cost 80 dollars",
            ),
        ];
        let lines = vec![
            "Navigate to shop.test/shoes".to_string(),
            "Add the running shoes to the cart".to_string(),
            "Click the".to_string(),
        ];
        let matched = KeywordMatcher.match_lines(&completed, &lines);
        assert_eq!(matched, vec![0]);
    }

    #[tokio::test]
    async fn keyword_matcher_is_order_independent() {
        let a = ActionResult::ok(Action::Navigate {
            url: "https://docs.test/install".into(),
            new_tab: false,
        });
        let b = ActionResult::ok(Action::Type {
            index: 4,
            text: "tokio".into(),
            clear: true,
        });
        let lines = vec!["open install docs".to_string(), "search tokio".to_string()];
        let forward = KeywordMatcher
            .match_completed_steps(&[a.clone(), b.clone()], &lines)
            .await
            .unwrap();
        let backward = KeywordMatcher
            .match_completed_steps(&[b, a], &lines)
            .await
            .unwrap();
        assert_eq!(forward, backward);
    }
}

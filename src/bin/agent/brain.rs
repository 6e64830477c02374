use async_trait::async_trait;
use browser_agent::config::OracleConfig;
use browser_agent::error::OracleError;
use browser_agent::oracle::{
    parse_decision, strip_code_fence, DecideMode, DecideRequest, Decision, DecisionOracle,
    ProgressMatcher,
};
use browser_agent::progress::PageGoal;
use browser_agent::types::ActionResult;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::types::{ChatMessage, PROMPT_HISTORY_ENTRIES, SIMPLIFIED_HISTORY_ENTRIES};

const SYSTEM_PROMPT: &str = r#"You are a browser automation agent. You control a real Chrome browser by issuing a short batch of actions as JSON.

Available actions:
- {"action":"navigate","url":"https://...","new_tab":false}
- {"action":"click","index":12}
- {"action":"type","index":4,"text":"search query","clear":true}
- {"action":"scroll","down":true,"pages":1.0}
- {"action":"send_keys","keys":"Enter"}
- {"action":"select_dropdown","index":7,"text":"Option text"}
- {"action":"switch_tab","tab_id":"..."}
- {"action":"close_tab","tab_id":"..."}
- {"action":"go_back"}
- {"action":"wait","seconds":2}
- {"action":"extract","query":"what to read from the page"}
- {"action":"done","text":"final answer or summary","success":true}

Reply format (JSON only, no markdown, no explanation):
{"thinking":"one or two sentences","plan":["- [ ] step one","- [ ] step two"],"actions":[ ... ]}

Rules:
1. Use the [N] element indices from the CURRENT page only. Indices from earlier pages are invalid.
2. An action that changes the page (navigate, go_back, switch_tab) must be the last element-targeting action in the batch.
3. Put a multi-step task into "plan" on your first reply; later replies may add lines but never remove them.
4. When the task is accomplished, reply with a single done action describing the result.
5. If an action failed, try a different element or approach instead of repeating it.
6. Keep batches short. Do not over-navigate."#;

const DONE_ONLY_PROMPT: &str = r#"The agent has failed repeatedly and has no retries left.
Reply with exactly one action: {"action":"done","text":"...","success":false or true}.
Summarize what was achieved and what blocked the task. JSON only."#;

const GOALS_PROMPT: &str = r#"Extract high-level phases from this browser task for progress tracking.

Identify 2-5 major phases that can be detected by page state changes (URL or title changes).
Completion signals must be URL path segments or title keywords that appear once the phase is done,
like "/login", "/dashboard", "confirmation".

Reply with JSON only:
{"goals":[{"id":"signup","description":"Complete signup","completion_signals":["/login","login"]}]}"#;

const MATCHER_PROMPT: &str = r#"You decide which checklist items are complete given the browser actions that just succeeded.
Consider meaning, not exact wording: "Clicked element 4" after typing a query completes "search for X";
"Navigated to https://a.test/" completes "Open a.test".
Reply with JSON only: {"completed_step_indices":[0,2],"reasoning":"..."}"#;

/// Words that suggest a task has ordered phases worth tracking as goals.
const SEQUENCING_WORDS: &[&str] = &["then", "after", "next", "once", "when", "wait"];
const LONG_TASK_CHARS: usize = 400;

/// Chat-completions client acting as decision oracle, checklist matcher
/// and goal extractor.
pub struct Brain {
    client: Client,
    config: OracleConfig,
    api_key: String,
}

impl Brain {
    pub fn new(config: OracleConfig) -> anyhow::Result<Self> {
        let api_key = config
            .api_key
            .clone()
            .ok_or_else(|| anyhow::anyhow!("OPENAI_API_KEY not set in environment"))?;
        Ok(Self {
            client: Client::new(),
            config,
            api_key,
        })
    }

    async fn chat(&self, messages: Vec<ChatMessage>) -> Result<String, OracleError> {
        let url = format!("{}/chat/completions", self.config.base_url);
        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&json!({
                "model": self.config.model,
                "messages": messages,
                "temperature": 0.2,
                "response_format": {"type": "json_object"},
            }))
            .send()
            .await
            .map_err(|err| OracleError::provider(err.to_string()))?;

        let status = response.status();
        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|err| OracleError::provider(err.to_string()))?;

        if !status.is_success() {
            let message = body["error"]["message"]
                .as_str()
                .unwrap_or("Unknown API error");
            warn!(status = %status, message, "model API error");
            return Err(OracleError::provider(format!(
                "API error ({}): {}",
                status, message
            )));
        }

        let content = body["choices"][0]["message"]["content"]
            .as_str()
            .ok_or_else(|| OracleError::malformed(format!("no content in response: {}", body)))?;
        debug!(content, "model replied");
        Ok(content.to_string())
    }

    fn decide_prompt(request: &DecideRequest<'_>) -> String {
        let history_len = match request.mode {
            DecideMode::Simplified => SIMPLIFIED_HISTORY_ENTRIES,
            _ => PROMPT_HISTORY_ENTRIES,
        };
        let mut prompt = format!(
            "Task: {}\n\nStep {} of {}. Return at most {} action(s).\n",
            request.task,
            request.step,
            request.step_budget,
            match request.mode {
                DecideMode::Normal => request.max_actions,
                _ => 1,
            }
        );

        let progress = request.progress.render();
        if !progress.is_empty() {
            prompt.push_str("\nProgress:\n");
            prompt.push_str(&progress);
        }

        let recent = request.history.recent(history_len);
        if !recent.is_empty() {
            prompt.push_str("\nRecent history:\n");
            for entry in recent {
                prompt.push_str(&entry.describe());
                prompt.push('\n');
            }
        }

        prompt.push_str("\nCurrent page:\n");
        prompt.push_str(&request.observation.render());
        if request.mode == DecideMode::Simplified {
            prompt.push_str("\nThe previous request failed. Reply with one simple action.\n");
        }
        prompt
    }
}

#[async_trait]
impl DecisionOracle for Brain {
    async fn decide(&self, request: &DecideRequest<'_>) -> Result<Decision, OracleError> {
        let mut messages = vec![ChatMessage::system(SYSTEM_PROMPT)];
        if request.mode == DecideMode::DoneOnly {
            messages.push(ChatMessage::system(DONE_ONLY_PROMPT));
        }
        messages.push(ChatMessage::user(Self::decide_prompt(request)));

        info!(step = request.step, mode = ?request.mode, "asking model for next actions");
        let reply = self.chat(messages).await?;
        parse_decision(&reply)
    }

    async fn extract_goals(&self, task: &str) -> Result<Vec<PageGoal>, OracleError> {
        let lowered = task.to_lowercase();
        let sequenced = lowered
            .split(|c: char| !c.is_alphanumeric())
            .any(|word| SEQUENCING_WORDS.contains(&word));
        if !sequenced && task.chars().count() <= LONG_TASK_CHARS {
            debug!("simple task, no goal tracking");
            return Ok(Vec::new());
        }

        #[derive(Deserialize)]
        struct GoalsReply {
            #[serde(default)]
            goals: Vec<PageGoal>,
        }

        let reply = self
            .chat(vec![
                ChatMessage::system(GOALS_PROMPT),
                ChatMessage::user(format!("Task:\n{}", task)),
            ])
            .await?;
        let parsed: GoalsReply = serde_json::from_str(strip_code_fence(&reply))?;
        info!(count = parsed.goals.len(), "goals extracted");
        Ok(parsed.goals)
    }
}

#[async_trait]
impl ProgressMatcher for Brain {
    async fn match_completed_steps(
        &self,
        completed: &[ActionResult],
        lines: &[String],
    ) -> Result<Vec<usize>, OracleError> {
        if completed.is_empty() || lines.is_empty() {
            return Ok(Vec::new());
        }

        #[derive(Deserialize)]
        struct MatchReply {
            completed_step_indices: Vec<usize>,
            #[serde(default)]
            reasoning: String,
        }

        // Sorted so the prompt does not depend on execution order.
        let mut actions: Vec<String> = completed.iter().map(ActionResult::summary).collect();
        actions.sort();
        let actions = actions
            .iter()
            .map(|summary| format!("- {}", summary))
            .collect::<Vec<_>>()
            .join("\n");
        let steps = lines
            .iter()
            .enumerate()
            .map(|(i, line)| format!("{}. {}", i, line))
            .collect::<Vec<_>>()
            .join("\n");

        let reply = self
            .chat(vec![
                ChatMessage::system(MATCHER_PROMPT),
                ChatMessage::user(format!(
                    "EXECUTED ACTIONS:\n{}\n\nCHECKLIST:\n{}",
                    actions, steps
                )),
            ])
            .await?;
        let parsed: MatchReply = serde_json::from_str(strip_code_fence(&reply))?;

        let mut indices: Vec<usize> = parsed
            .completed_step_indices
            .into_iter()
            .filter(|&i| i < lines.len())
            .collect();
        indices.sort_unstable();
        indices.dedup();
        info!(?indices, reasoning = %parsed.reasoning, "checklist items matched");
        Ok(indices)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use browser_agent::history::History;
    use browser_agent::progress::{Checklist, ProgressState};
    use browser_agent::types::Observation;

    #[test]
    fn prompt_lists_page_and_progress() {
        let observation = Observation {
            url: "https://shop.test".into(),
            title: "Shop".into(),
            ..Default::default()
        };
        let history = History::new();
        let progress = ProgressState {
            checklist: Checklist::parse("- [ ] find boots"),
            ..Default::default()
        };
        let request = DecideRequest {
            task: "buy boots",
            observation: &observation,
            history: &history,
            progress: &progress,
            mode: DecideMode::Simplified,
            max_actions: 3,
            step: 2,
            step_budget: 10,
        };
        let prompt = Brain::decide_prompt(&request);
        assert!(prompt.starts_with("Task: buy boots\n\nStep 2 of 10. Return at most 1 action(s)."));
        assert!(prompt.contains("- [ ] find boots"));
        assert!(prompt.contains("Page URL: https://shop.test"));
        assert!(prompt.contains("previous request failed"));
    }

    #[tokio::test]
    async fn simple_tasks_skip_goal_extraction() {
        let brain = Brain::new(OracleConfig {
            api_key: Some("test-key".into()),
            base_url: "http://127.0.0.1:9".into(),
            ..Default::default()
        })
        .unwrap();
        // No request is made, so the unreachable endpoint is never hit.
        let goals = brain.extract_goals("search for rust books").await.unwrap();
        assert!(goals.is_empty());
    }
}

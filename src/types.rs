use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Max characters of element text kept in a rendered observation.
pub const ELEMENT_TEXT_MAX_CHARS: usize = 80;

/// A single atomic operation the oracle asks the agent to perform.
///
/// Element-targeting variants carry an `index` that is only meaningful for the
/// observation the decision was made from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Action {
    Navigate {
        url: String,
        #[serde(default)]
        new_tab: bool,
    },
    Click {
        index: u32,
    },
    Type {
        index: u32,
        text: String,
        #[serde(default = "default_true")]
        clear: bool,
    },
    Scroll {
        #[serde(default = "default_true")]
        down: bool,
        #[serde(default = "default_pages")]
        pages: f32,
        #[serde(default)]
        index: Option<u32>,
    },
    SendKeys {
        keys: String,
    },
    SelectDropdown {
        index: u32,
        text: String,
    },
    SwitchTab {
        tab_id: String,
    },
    CloseTab {
        tab_id: String,
    },
    GoBack,
    Wait {
        #[serde(default = "default_wait_seconds")]
        seconds: u64,
    },
    Extract {
        query: String,
    },
    Done {
        text: String,
        #[serde(default = "default_true")]
        success: bool,
    },
}

fn default_true() -> bool {
    true
}

fn default_pages() -> f32 {
    1.0
}

fn default_wait_seconds() -> u64 {
    3
}

/// How an action affects the page, which decides the stabilization strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionClass {
    /// Loads a different document or switches the active one.
    PageChanging,
    /// May mutate the current document without navigating.
    DomMutating,
    /// Leaves the page alone.
    Informational,
}

/// The part of an action that is compared when looking for repetition loops.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ActionSignature {
    pub kind: String,
    pub target: Option<String>,
}

impl fmt::Display for ActionSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.target {
            Some(target) => write!(f, "{}({})", self.kind, target),
            None => f.write_str(&self.kind),
        }
    }
}

impl Action {
    /// Wire name of the action, as used in the `action` tag.
    pub fn kind(&self) -> &'static str {
        match self {
            Action::Navigate { .. } => "navigate",
            Action::Click { .. } => "click",
            Action::Type { .. } => "type",
            Action::Scroll { .. } => "scroll",
            Action::SendKeys { .. } => "send_keys",
            Action::SelectDropdown { .. } => "select_dropdown",
            Action::SwitchTab { .. } => "switch_tab",
            Action::CloseTab { .. } => "close_tab",
            Action::GoBack => "go_back",
            Action::Wait { .. } => "wait",
            Action::Extract { .. } => "extract",
            Action::Done { .. } => "done",
        }
    }

    pub fn class(&self) -> ActionClass {
        match self {
            Action::Navigate { .. }
            | Action::SwitchTab { .. }
            | Action::CloseTab { .. }
            | Action::GoBack => ActionClass::PageChanging,
            Action::Click { .. }
            | Action::Type { .. }
            | Action::Scroll { .. }
            | Action::SendKeys { .. }
            | Action::SelectDropdown { .. } => ActionClass::DomMutating,
            Action::Wait { .. } | Action::Extract { .. } | Action::Done { .. } => {
                ActionClass::Informational
            }
        }
    }

    /// Element index this action is issued against, if any.
    pub fn element_index(&self) -> Option<u32> {
        match self {
            Action::Click { index }
            | Action::Type { index, .. }
            | Action::SelectDropdown { index, .. } => Some(*index),
            Action::Scroll { index, .. } => *index,
            _ => None,
        }
    }

    pub fn is_done(&self) -> bool {
        matches!(self, Action::Done { .. })
    }

    /// Type plus target (element index, URL or tab id).
    pub fn signature(&self) -> ActionSignature {
        let target = match self {
            Action::Navigate { url, .. } => Some(url.clone()),
            Action::SwitchTab { tab_id } | Action::CloseTab { tab_id } => Some(tab_id.clone()),
            other => other.element_index().map(|index| index.to_string()),
        };
        ActionSignature {
            kind: self.kind().to_string(),
            target,
        }
    }

    /// One-line human readable description, used in events and matcher input.
    pub fn describe(&self) -> String {
        match self {
            Action::Navigate { url, new_tab } => {
                if *new_tab {
                    format!("Navigated to {} in a new tab", url)
                } else {
                    format!("Navigated to {}", url)
                }
            }
            Action::Click { index } => format!("Clicked element {}", index),
            Action::Type { index, text, .. } => {
                let shown: String = text.chars().take(50).collect();
                format!("Input '{}' into element {}", shown, index)
            }
            Action::Scroll { down, pages, .. } => {
                format!("Scrolled {} {} page(s)", if *down { "down" } else { "up" }, pages)
            }
            Action::SendKeys { keys } => format!("Sent keys {}", keys),
            Action::SelectDropdown { index, text } => {
                format!("Selected '{}' from dropdown at index {}", text, index)
            }
            Action::SwitchTab { tab_id } => format!("Switched to tab {}", tab_id),
            Action::CloseTab { tab_id } => format!("Closed tab {}", tab_id),
            Action::GoBack => "Went back".to_string(),
            Action::Wait { seconds } => format!("Waited {} seconds", seconds),
            Action::Extract { query } => format!("Extracted '{}'", query),
            Action::Done { text, .. } => format!("Done: {}", text),
        }
    }
}

/// Outcome of executing one action. Never mutated once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionResult {
    pub action: Action,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extracted_content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub is_done: bool,
}

impl ActionResult {
    pub fn ok(action: Action) -> Self {
        Self {
            action,
            success: true,
            extracted_content: None,
            error: None,
            is_done: false,
        }
    }

    pub fn extracted(action: Action, content: impl Into<String>) -> Self {
        Self {
            extracted_content: Some(content.into()),
            ..Self::ok(action)
        }
    }

    pub fn failed(action: Action, error: impl Into<String>) -> Self {
        Self {
            action,
            success: false,
            extracted_content: None,
            error: Some(error.into()),
            is_done: false,
        }
    }

    /// Result of a `done` action. The oracle's own verdict stays on the action.
    pub fn done(action: Action) -> Self {
        let text = match &action {
            Action::Done { text, .. } => text.clone(),
            _ => String::new(),
        };
        Self {
            action,
            success: true,
            extracted_content: Some(text),
            error: None,
            is_done: true,
        }
    }

    /// Summary line fed to the progress matcher.
    pub fn summary(&self) -> String {
        match (&self.extracted_content, self.action.is_done()) {
            (Some(content), false) if !content.is_empty() => {
                let shown: String = content.chars().take(120).collect();
                format!("{} -> {}", self.action.describe(), shown)
            }
            _ => self.action.describe(),
        }
    }
}

/// One interactive element in an observation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InteractiveElement {
    pub index: u32,
    pub tag: String,
    #[serde(default)]
    pub text: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TabInfo {
    pub tab_id: String,
    pub url: String,
    pub title: String,
}

/// Snapshot of the page. Element indices are valid only until the next
/// observation is taken.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Observation {
    pub url: String,
    pub title: String,
    pub elements: BTreeMap<u32, InteractiveElement>,
    #[serde(default)]
    pub tabs: Vec<TabInfo>,
    #[serde(default)]
    pub pending_requests: usize,
}

impl Observation {
    pub fn element_ids(&self) -> BTreeSet<u32> {
        self.elements.keys().copied().collect()
    }

    pub fn has_element(&self, index: u32) -> bool {
        self.elements.contains_key(&index)
    }

    pub fn summary(&self) -> ObservationSummary {
        ObservationSummary {
            url: self.url.clone(),
            title: self.title.clone(),
            element_count: self.elements.len(),
            tab_count: self.tabs.len(),
        }
    }

    /// Compact text form: one line per interactive element.
    pub fn render(&self) -> String {
        let mut out = format!("Page URL: {}\nTitle: {}\n", self.url, self.title);
        if self.tabs.len() > 1 {
            out.push_str("Tabs:\n");
            for tab in &self.tabs {
                out.push_str(&format!("  [{}] {} ({})\n", tab.tab_id, tab.title, tab.url));
            }
        }
        out.push_str("Interactive elements:\n");
        if self.elements.is_empty() {
            out.push_str("  (none)\n");
        }
        for element in self.elements.values() {
            let text: String = element.text.chars().take(ELEMENT_TEXT_MAX_CHARS).collect();
            out.push_str(&format!("  [{}] <{}", element.index, element.tag));
            for (key, value) in &element.attributes {
                out.push_str(&format!(" {}=\"{}\"", key, value));
            }
            out.push_str(&format!("> {}\n", text.trim()));
        }
        out
    }
}

/// What the history and events keep of an observation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObservationSummary {
    pub url: String,
    pub title: String,
    pub element_count: usize,
    pub tab_count: usize,
}

impl fmt::Display for ObservationSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({}) - {} elements, {} tabs",
            self.title, self.url, self.element_count, self.tab_count
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn actions_parse_from_tagged_json() {
        let action: Action =
            serde_json::from_str(r#"{"action":"type","index":4,"text":"rust"}"#).unwrap();
        assert_eq!(
            action,
            Action::Type {
                index: 4,
                text: "rust".into(),
                clear: true
            }
        );

        let action: Action = serde_json::from_str(r#"{"action":"go_back"}"#).unwrap();
        assert_eq!(action, Action::GoBack);
    }

    #[test]
    fn unknown_action_tag_is_rejected() {
        let parsed = serde_json::from_str::<Action>(r#"{"action":"teleport","index":1}"#);
        assert!(parsed.is_err());
    }

    #[test]
    fn classes_follow_page_effect() {
        assert_eq!(
            Action::Navigate {
                url: "https://example.com".into(),
                new_tab: false
            }
            .class(),
            ActionClass::PageChanging
        );
        assert_eq!(Action::Click { index: 1 }.class(), ActionClass::DomMutating);
        assert_eq!(
            Action::Extract {
                query: "price".into()
            }
            .class(),
            ActionClass::Informational
        );
    }

    #[test]
    fn signature_uses_target_index_or_url() {
        assert_eq!(
            Action::Click { index: 7 }.signature(),
            ActionSignature {
                kind: "click".into(),
                target: Some("7".into())
            }
        );
        let nav = Action::Navigate {
            url: "https://a.test".into(),
            new_tab: true,
        };
        assert_eq!(nav.signature().target.as_deref(), Some("https://a.test"));
        assert_eq!(Action::GoBack.signature().target, None);
    }

    #[test]
    fn done_result_is_terminal_and_carries_text() {
        let result = ActionResult::done(Action::Done {
            text: "found it".into(),
            success: false,
        });
        assert!(result.is_done);
        assert_eq!(result.extracted_content.as_deref(), Some("found it"));
    }

    #[test]
    fn render_lists_elements_by_index() {
        let mut observation = Observation {
            url: "https://shop.test".into(),
            title: "Shop".into(),
            ..Default::default()
        };
        observation.elements.insert(
            3,
            InteractiveElement {
                index: 3,
                tag: "button".into(),
                text: "Buy".into(),
                attributes: BTreeMap::new(),
            },
        );
        let text = observation.render();
        assert!(text.contains("[3] <button> Buy"));
        assert!(text.starts_with("Page URL: https://shop.test"));
    }
}

use serde::{Deserialize, Serialize};

/// A message in a chat-completions request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

/// Cap on interactive elements reported per observation.
pub const MAX_ELEMENTS_PER_OBSERVATION: usize = 300;
/// Cap on text returned by an `extract` action.
pub const EXTRACT_MAX_CHARS: usize = 4000;
/// History entries replayed into a normal prompt.
pub const PROMPT_HISTORY_ENTRIES: usize = 20;
/// History entries replayed into a simplified prompt.
pub const SIMPLIFIED_HISTORY_ENTRIES: usize = 4;
/// Longest `wait` the driver will honor.
pub const MAX_WAIT_SECONDS: u64 = 10;
/// Checks for a tab opened by a click before giving up on it.
pub const TAB_OPEN_POLLS: u32 = 5;
/// Pause between those checks.
pub const TAB_OPEN_POLL: std::time::Duration = std::time::Duration::from_millis(100);

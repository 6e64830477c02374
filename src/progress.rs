//! Progress tracking: ordered page-state goals and the oracle's checklist.
//!
//! Both views only inform the oracle; neither decides when a run is done.
//! Completion is monotonic in both: a goal or line, once completed, stays so.

use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, info};

/// A page-state goal, completed the first time one of its signals shows up
/// in the URL or title of an observation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageGoal {
    pub id: String,
    pub description: String,
    #[serde(default)]
    pub completion_signals: Vec<String>,
    #[serde(default)]
    pub completed: bool,
}

impl PageGoal {
    pub fn new(id: impl Into<String>, description: impl Into<String>, signals: &[&str]) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            completion_signals: signals.iter().map(|s| s.to_string()).collect(),
            completed: false,
        }
    }

    /// Case-insensitive substring match of any signal against URL or title.
    pub fn matches(&self, url: &str, title: &str) -> bool {
        let url = url.to_lowercase();
        let title = title.to_lowercase();
        self.completion_signals
            .iter()
            .map(|signal| signal.trim().to_lowercase())
            .filter(|signal| !signal.is_empty())
            .any(|signal| url.contains(&signal) || title.contains(&signal))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GoalTracker {
    goals: Vec<PageGoal>,
    current_goal_index: usize,
}

impl GoalTracker {
    pub fn new(goals: Vec<PageGoal>) -> Self {
        let mut tracker = Self {
            goals,
            current_goal_index: 0,
        };
        tracker.advance();
        tracker
    }

    pub fn goals(&self) -> &[PageGoal] {
        &self.goals
    }

    pub fn current_goal_index(&self) -> usize {
        self.current_goal_index
    }

    pub fn current(&self) -> Option<&PageGoal> {
        self.goals.get(self.current_goal_index)
    }

    pub fn completed_count(&self) -> usize {
        self.goals.iter().filter(|g| g.completed).count()
    }

    pub fn is_empty(&self) -> bool {
        self.goals.is_empty()
    }

    pub fn all_complete(&self) -> bool {
        !self.goals.is_empty() && self.current_goal_index >= self.goals.len()
    }

    /// Check the not-yet-reached goals against a fresh observation and return
    /// the ids completed by it.
    pub fn evaluate(&mut self, url: &str, title: &str) -> Vec<String> {
        let mut newly = Vec::new();
        for goal in self.goals.iter_mut().skip(self.current_goal_index) {
            if !goal.completed && goal.matches(url, title) {
                goal.completed = true;
                newly.push(goal.id.clone());
            }
        }
        if !newly.is_empty() {
            let before = self.current_goal_index;
            self.advance();
            info!(
                goals = ?newly,
                from = before,
                to = self.current_goal_index,
                "page-state goals completed"
            );
        }
        newly
    }

    fn advance(&mut self) {
        while self
            .goals
            .get(self.current_goal_index)
            .is_some_and(|goal| goal.completed)
        {
            self.current_goal_index += 1;
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChecklistItem {
    pub text: String,
    pub checked: bool,
}

/// Free-text task lines maintained by the oracle, in markdown task-list form.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Checklist {
    items: Vec<ChecklistItem>,
}

impl Checklist {
    /// Parse `- [ ]` / `- [x]` lines. Plain bullet or bare lines become
    /// unchecked items; blank lines are skipped.
    pub fn parse(markdown: &str) -> Self {
        let items = markdown.lines().filter_map(parse_line).collect();
        Self { items }
    }

    pub fn render(&self) -> String {
        self.items
            .iter()
            .map(|item| {
                format!(
                    "- [{}] {}",
                    if item.checked { "x" } else { " " },
                    item.text
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn items(&self) -> &[ChecklistItem] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn checked_count(&self) -> usize {
        self.items.iter().filter(|item| item.checked).count()
    }

    /// Unchecked lines with their position in the checklist.
    pub fn unchecked(&self) -> Vec<(usize, &str)> {
        self.items
            .iter()
            .enumerate()
            .filter(|(_, item)| !item.checked)
            .map(|(index, item)| (index, item.text.as_str()))
            .collect()
    }

    /// Append lines not already present. Existing lines are never removed or
    /// unchecked; a line arriving as `- [x]` may check an existing one.
    pub fn merge_lines<S: AsRef<str>>(&mut self, lines: &[S]) -> usize {
        let mut added = 0;
        for line in lines {
            let Some(incoming) = parse_line(line.as_ref()) else {
                continue;
            };
            let key = normalize(&incoming.text);
            match self.items.iter_mut().find(|item| normalize(&item.text) == key) {
                Some(existing) => existing.checked |= incoming.checked,
                None => {
                    self.items.push(incoming);
                    added += 1;
                }
            }
        }
        if added > 0 {
            debug!(added, total = self.items.len(), "checklist lines merged");
        }
        added
    }

    /// Check the lines at `indices`. Out-of-range indices are ignored.
    /// Returns how many lines went from unchecked to checked.
    pub fn mark_checked(&mut self, indices: &[usize]) -> usize {
        let mut marked = 0;
        for &index in indices {
            match self.items.get_mut(index) {
                Some(item) if !item.checked => {
                    item.checked = true;
                    marked += 1;
                }
                Some(_) => {}
                None => debug!(index, "ignoring out-of-range checklist index"),
            }
        }
        marked
    }
}

fn parse_line(line: &str) -> Option<ChecklistItem> {
    let trimmed = line.trim();
    let (checked, rest) = if let Some(rest) = trimmed
        .strip_prefix("- [x]")
        .or_else(|| trimmed.strip_prefix("- [X]"))
    {
        (true, rest)
    } else if let Some(rest) = trimmed.strip_prefix("- [ ]") {
        (false, rest)
    } else if let Some(rest) = trimmed.strip_prefix("- ") {
        (false, rest)
    } else {
        (false, trimmed)
    };
    let text = rest.trim();
    if text.is_empty() {
        return None;
    }
    Some(ChecklistItem {
        text: text.to_string(),
        checked,
    })
}

fn normalize(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressState {
    pub goals: GoalTracker,
    pub checklist: Checklist,
}

impl ProgressState {
    pub fn snapshot(&self) -> ProgressSnapshot {
        ProgressSnapshot {
            goals_completed: self.goals.completed_count(),
            goals_total: self.goals.goals().len(),
            current_goal: self.goals.current().map(|g| g.description.clone()),
            checklist_checked: self.checklist.checked_count(),
            checklist_total: self.checklist.len(),
            next_item: self
                .checklist
                .unchecked()
                .first()
                .map(|(_, text)| text.to_string()),
        }
    }

    /// Progress block shown to the oracle. The checklist comes first since it
    /// is the stronger signal.
    pub fn render(&self) -> String {
        let mut out = String::new();
        if !self.checklist.is_empty() {
            out.push_str("Checklist:\n");
            out.push_str(&self.checklist.render());
            out.push('\n');
        }
        if !self.goals.is_empty() {
            out.push_str("Goals:\n");
            for (index, goal) in self.goals.goals().iter().enumerate() {
                let marker = if goal.completed {
                    "done"
                } else if index == self.goals.current_goal_index() {
                    "current"
                } else {
                    "pending"
                };
                out.push_str(&format!("  {}. [{}] {}\n", index + 1, marker, goal.description));
            }
        }
        out
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub goals_completed: usize,
    pub goals_total: usize,
    pub current_goal: Option<String>,
    pub checklist_checked: usize,
    pub checklist_total: usize,
    pub next_item: Option<String>,
}

impl fmt::Display for ProgressSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "checklist {}/{}, goals {}/{}",
            self.checklist_checked, self.checklist_total, self.goals_completed, self.goals_total
        )?;
        if let Some(item) = &self.next_item {
            write!(f, ", next: {}", item)?;
        } else if let Some(goal) = &self.current_goal {
            write!(f, ", current goal: {}", goal)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signup_flow() -> GoalTracker {
        GoalTracker::new(vec![
            PageGoal::new("signup", "Complete signup", &["/login", "login"]),
            PageGoal::new("login", "Log in", &["/dashboard", "dashboard"]),
            PageGoal::new("add_item", "Add item", &["success"]),
        ])
    }

    #[test]
    fn goals_complete_in_order_and_index_never_decreases() {
        let mut tracker = signup_flow();
        assert!(tracker.evaluate("https://app.test/signup", "Sign up").is_empty());
        assert_eq!(tracker.current_goal_index(), 0);

        assert_eq!(tracker.evaluate("https://app.test/login", "Log in"), vec!["signup"]);
        assert_eq!(tracker.current_goal_index(), 1);

        // Going back to a page that matched earlier changes nothing.
        assert!(tracker.evaluate("https://app.test/login", "Log in").is_empty());
        assert_eq!(tracker.current_goal_index(), 1);

        tracker.evaluate("https://app.test/dashboard", "Dashboard");
        assert_eq!(tracker.current_goal_index(), 2);
        assert!(!tracker.all_complete());
    }

    #[test]
    fn skipped_goal_blocks_index_until_reached() {
        let mut tracker = signup_flow();
        // A later goal can complete early, but the index waits on the first.
        assert_eq!(
            tracker.evaluate("https://app.test/dashboard", "Home"),
            vec!["login"]
        );
        assert_eq!(tracker.current_goal_index(), 0);

        tracker.evaluate("https://app.test/login", "Login");
        assert_eq!(tracker.current_goal_index(), 2);
        assert_eq!(tracker.completed_count(), 2);
    }

    #[test]
    fn signals_match_title_case_insensitively() {
        let goal = PageGoal::new("confirm", "Order confirmed", &["Confirmation"]);
        assert!(goal.matches("https://shop.test/x", "ORDER CONFIRMATION"));
        assert!(!goal.matches("https://shop.test/cart", "Cart"));
    }

    #[test]
    fn checklist_round_trips_markdown() {
        let list = Checklist::parse("- [ ] open the store\n- [x] search for shoes\n\nbuy them");
        assert_eq!(list.len(), 3);
        assert_eq!(list.checked_count(), 1);
        assert_eq!(
            list.render(),
            "- [ ] open the store\n- [x] search for shoes\n- [ ] buy them"
        );
    }

    #[test]
    fn merge_appends_only_new_lines_and_never_unchecks() {
        let mut list = Checklist::parse("- [x] open the store\n- [ ] search for shoes");
        let added = list.merge_lines(&["- [ ] Open the  store", "- [ ] add to cart"]);
        assert_eq!(added, 1);
        assert_eq!(list.len(), 3);
        assert!(list.items()[0].checked);
    }

    #[test]
    fn out_of_range_indices_are_ignored() {
        let mut list = Checklist::parse("- [ ] a\n- [ ] b");
        assert_eq!(list.mark_checked(&[1, 7, 1]), 1);
        assert_eq!(list.unchecked(), vec![(0, "a")]);
    }

    #[test]
    fn snapshot_summarizes_both_views() {
        let progress = ProgressState {
            goals: signup_flow(),
            checklist: Checklist::parse("- [x] open\n- [ ] sign up"),
        };
        let snapshot = progress.snapshot();
        assert_eq!(snapshot.checklist_checked, 1);
        assert_eq!(snapshot.goals_total, 3);
        assert_eq!(
            snapshot.to_string(),
            "checklist 1/2, goals 0/3, next: sign up"
        );
        assert!(progress.render().starts_with("Checklist:\n- [x] open"));
    }
}

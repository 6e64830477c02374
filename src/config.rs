//! Runtime configuration.
//!
//! Values come from the process environment (a `.env` file is loaded by the
//! binary through `dotenvy` first) and fall back to the defaults below.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;

pub const DEFAULT_STEP_BUDGET: u32 = 50;
pub const DEFAULT_FAILURE_BUDGET: u32 = 3;
pub const DEFAULT_MAX_ACTIONS_PER_STEP: usize = 3;
pub const DEFAULT_REPETITION_LIMIT: u32 = 3;
pub const DEFAULT_MODEL: &str = "gpt-4o";

/// Per-run limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Budgets {
    pub step_budget: u32,
    pub failure_budget: u32,
}

impl Default for Budgets {
    fn default() -> Self {
        Self {
            step_budget: DEFAULT_STEP_BUDGET,
            failure_budget: DEFAULT_FAILURE_BUDGET,
        }
    }
}

/// Polling parameters of the DOM stability detector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StabilityConfig {
    /// Upper bound for the network-idle wait.
    pub max_wait_ms: u64,
    /// Interval between pending-request polls.
    pub poll_interval_ms: u64,
    /// Upper bound of element-delta passes.
    pub max_passes: u32,
    /// Consecutive empty-delta passes needed to call the page stable.
    pub stability_threshold: u32,
    /// Interval between element-delta passes.
    pub pass_interval_ms: u64,
}

impl Default for StabilityConfig {
    fn default() -> Self {
        Self {
            max_wait_ms: 3_000,
            poll_interval_ms: 500,
            max_passes: 5,
            stability_threshold: 2,
            pass_interval_ms: 300,
        }
    }
}

impl StabilityConfig {
    pub fn max_wait(&self) -> Duration {
        Duration::from_millis(self.max_wait_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn pass_interval(&self) -> Duration {
        Duration::from_millis(self.pass_interval_ms)
    }
}

/// Settings of the agent loop controller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoopConfig {
    pub budgets: Budgets,
    pub max_actions_per_step: usize,
    /// Allow one extra done-only decision after the failure budget is spent.
    pub final_attempt: bool,
    /// Identical consecutive decisions tolerated before the run is declared a loop.
    pub repetition_limit: u32,
    pub oracle_timeout_ms: u64,
    pub oracle_retry_backoff_ms: u64,
    pub action_timeout_ms: u64,
    pub matcher_timeout_ms: u64,
    pub stability: StabilityConfig,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            budgets: Budgets::default(),
            max_actions_per_step: DEFAULT_MAX_ACTIONS_PER_STEP,
            final_attempt: true,
            repetition_limit: DEFAULT_REPETITION_LIMIT,
            oracle_timeout_ms: 60_000,
            oracle_retry_backoff_ms: 1_000,
            action_timeout_ms: 30_000,
            matcher_timeout_ms: 30_000,
            stability: StabilityConfig::default(),
        }
    }
}

impl LoopConfig {
    pub fn oracle_timeout(&self) -> Duration {
        Duration::from_millis(self.oracle_timeout_ms)
    }

    pub fn oracle_retry_backoff(&self) -> Duration {
        Duration::from_millis(self.oracle_retry_backoff_ms)
    }

    pub fn action_timeout(&self) -> Duration {
        Duration::from_millis(self.action_timeout_ms)
    }

    pub fn matcher_timeout(&self) -> Duration {
        Duration::from_millis(self.matcher_timeout_ms)
    }
}

/// Browser launch settings used by the headless Chrome driver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrowserConfig {
    pub headless: bool,
    /// Endpoint of an already running Chrome to attach to.
    pub attach_url: Option<String>,
    pub chrome_path: Option<PathBuf>,
    pub profile_dir: Option<PathBuf>,
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            headless: true,
            attach_url: None,
            chrome_path: None,
            profile_dir: None,
        }
    }
}

/// Chat-completions provider used by the decision oracle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OracleConfig {
    pub api_key: Option<String>,
    pub model: String,
    pub base_url: String,
}

impl Default for OracleConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            model: DEFAULT_MODEL.to_string(),
            base_url: "https://api.openai.com/v1".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct AgentConfig {
    pub agent: LoopConfig,
    pub browser: BrowserConfig,
    pub oracle: OracleConfig,
}

impl AgentConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a config from an arbitrary key lookup, starting from the defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        let agent = &mut config.agent;

        set_parsed(&lookup, "AGENT_MAX_STEPS", &mut agent.budgets.step_budget)?;
        set_parsed(&lookup, "AGENT_MAX_FAILURES", &mut agent.budgets.failure_budget)?;
        set_parsed(
            &lookup,
            "AGENT_MAX_ACTIONS_PER_STEP",
            &mut agent.max_actions_per_step,
        )?;
        set_parsed(&lookup, "AGENT_FINAL_ATTEMPT", &mut agent.final_attempt)?;
        set_parsed(&lookup, "AGENT_REPETITION_LIMIT", &mut agent.repetition_limit)?;
        set_parsed(&lookup, "AGENT_ORACLE_TIMEOUT_MS", &mut agent.oracle_timeout_ms)?;
        set_parsed(&lookup, "AGENT_ACTION_TIMEOUT_MS", &mut agent.action_timeout_ms)?;
        set_parsed(
            &lookup,
            "AGENT_STABILITY_MAX_WAIT_MS",
            &mut agent.stability.max_wait_ms,
        )?;
        set_parsed(
            &lookup,
            "AGENT_STABILITY_POLL_MS",
            &mut agent.stability.poll_interval_ms,
        )?;
        set_parsed(
            &lookup,
            "AGENT_STABILITY_MAX_PASSES",
            &mut agent.stability.max_passes,
        )?;
        set_parsed(
            &lookup,
            "AGENT_STABILITY_THRESHOLD",
            &mut agent.stability.stability_threshold,
        )?;

        if agent.budgets.step_budget == 0 {
            return Err(invalid("AGENT_MAX_STEPS", "0", "must be at least 1"));
        }
        if agent.budgets.failure_budget == 0 {
            return Err(invalid("AGENT_MAX_FAILURES", "0", "must be at least 1"));
        }
        if agent.repetition_limit == 0 {
            return Err(invalid("AGENT_REPETITION_LIMIT", "0", "must be at least 1"));
        }
        if agent.max_actions_per_step == 0 {
            return Err(invalid("AGENT_MAX_ACTIONS_PER_STEP", "0", "must be at least 1"));
        }
        if agent.stability.stability_threshold == 0 {
            return Err(invalid("AGENT_STABILITY_THRESHOLD", "0", "must be at least 1"));
        }

        set_parsed(&lookup, "AGENT_HEADLESS", &mut config.browser.headless)?;
        config.browser.attach_url = lookup("AGENT_CHROME_ATTACH_URL");
        config.browser.chrome_path = lookup("AGENT_CHROME_PATH").map(PathBuf::from);
        config.browser.profile_dir = lookup("AGENT_PROFILE_DIR").map(PathBuf::from);

        config.oracle.api_key = lookup("OPENAI_API_KEY").filter(|key| !key.trim().is_empty());
        if let Some(model) = lookup("OPENAI_MODEL") {
            config.oracle.model = model;
        }
        if let Some(base_url) = lookup("OPENAI_BASE_URL") {
            config.oracle.base_url = base_url.trim_end_matches('/').to_string();
        }

        Ok(config)
    }
}

fn set_parsed<F, T>(lookup: &F, key: &'static str, slot: &mut T) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    if let Some(raw) = lookup(key) {
        let trimmed = raw.trim();
        *slot = trimmed
            .parse()
            .map_err(|err: T::Err| invalid(key, trimmed, &err.to_string()))?;
    }
    Ok(())
}

fn invalid(key: &'static str, value: &str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        key,
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

//! Scripted collaborators for driving the agent loop without a browser or
//! a model.
#![allow(dead_code)]

use async_trait::async_trait;
use browser_agent::config::{Budgets, LoopConfig, StabilityConfig};
use browser_agent::controller::AgentLoop;
use browser_agent::driver::{BrowserDriver, SessionFactory};
use browser_agent::error::{DriverError, OracleError};
use browser_agent::events::{EventSink, RunEvent};
use browser_agent::oracle::{
    DecideMode, DecideRequest, Decision, DecisionOracle, KeywordMatcher, ProgressMatcher,
};
use browser_agent::progress::PageGoal;
use browser_agent::session::{SessionManager, SessionRegistry};
use browser_agent::types::{Action, ActionResult, InteractiveElement, Observation, TabInfo};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

pub fn page(url: &str, title: &str, ids: impl IntoIterator<Item = u32>) -> Observation {
    let mut observation = Observation {
        url: url.to_string(),
        title: title.to_string(),
        tabs: vec![TabInfo {
            tab_id: "tab-1".into(),
            url: url.to_string(),
            title: title.to_string(),
        }],
        ..Default::default()
    };
    for index in ids {
        observation.elements.insert(
            index,
            InteractiveElement {
                index,
                tag: "button".into(),
                text: format!("button {}", index),
                attributes: Default::default(),
            },
        );
    }
    observation
}

pub fn click(index: u32) -> Action {
    Action::Click { index }
}

pub fn navigate(url: &str) -> Action {
    Action::Navigate {
        url: url.to_string(),
        new_tab: false,
    }
}

pub fn done(text: &str) -> Action {
    Action::Done {
        text: text.to_string(),
        success: true,
    }
}

pub fn decision(actions: Vec<Action>) -> Decision {
    Decision::new(actions)
}

pub fn fast_config() -> LoopConfig {
    LoopConfig {
        budgets: Budgets {
            step_budget: 20,
            failure_budget: 3,
        },
        max_actions_per_step: 3,
        final_attempt: true,
        repetition_limit: 3,
        oracle_timeout_ms: 500,
        oracle_retry_backoff_ms: 1,
        action_timeout_ms: 500,
        matcher_timeout_ms: 100,
        stability: StabilityConfig {
            max_wait_ms: 20,
            poll_interval_ms: 1,
            max_passes: 3,
            stability_threshold: 2,
            pass_interval_ms: 1,
        },
    }
}

/// How the scripted page reacts to an action.
pub type ExecFn =
    Arc<dyn Fn(&Action, &mut Observation) -> Result<ActionResult, DriverError> + Send + Sync>;

pub fn exec_fn(
    f: impl Fn(&Action, &mut Observation) -> Result<ActionResult, DriverError> + Send + Sync + 'static,
) -> ExecFn {
    Arc::new(f)
}

/// Default page behavior: navigation changes the URL, everything else works.
pub fn default_exec() -> ExecFn {
    exec_fn(|action, page| {
        if let Action::Navigate { url, .. } = action {
            page.url = url.clone();
            page.title = url.rsplit('/').next().unwrap_or_default().to_string();
        }
        Ok(ActionResult::ok(action.clone()))
    })
}

#[derive(Debug, Default)]
pub struct DriverLog {
    pub observe_flags: Vec<bool>,
    pub executed: Vec<Action>,
    pub navigated: Vec<String>,
    pub closed: usize,
    /// Calls that started while another call on the same session was unfinished.
    pub overlapping_calls: usize,
}

pub struct ScriptedDriver {
    page: Mutex<Observation>,
    exec: ExecFn,
    exec_delay: Option<Duration>,
    busy: AtomicBool,
    log: Arc<Mutex<DriverLog>>,
    fail_observe: Option<fn() -> DriverError>,
}

impl ScriptedDriver {
    fn begin_call(&self) {
        if self.busy.swap(true, Ordering::SeqCst) {
            self.log.lock().unwrap().overlapping_calls += 1;
        }
    }

    fn end_call(&self) {
        self.busy.store(false, Ordering::SeqCst);
    }
}

#[async_trait]
impl BrowserDriver for ScriptedDriver {
    async fn observe(&self, force_fresh: bool) -> Result<Observation, DriverError> {
        self.begin_call();
        self.log.lock().unwrap().observe_flags.push(force_fresh);
        let observed = match self.fail_observe {
            Some(fail) => Err(fail()),
            None => Ok(self.page.lock().unwrap().clone()),
        };
        self.end_call();
        observed
    }

    async fn execute(&self, action: &Action) -> Result<ActionResult, DriverError> {
        self.begin_call();
        self.log.lock().unwrap().executed.push(action.clone());
        if let Some(delay) = self.exec_delay {
            tokio::time::sleep(delay).await;
        }
        let result = {
            let mut page = self.page.lock().unwrap();
            (self.exec)(action, &mut page)
        };
        self.end_call();
        result
    }

    async fn navigate(&self, url: &str) -> Result<(), DriverError> {
        self.begin_call();
        self.log.lock().unwrap().navigated.push(url.to_string());
        self.page.lock().unwrap().url = url.to_string();
        self.end_call();
        Ok(())
    }

    async fn pending_requests(&self) -> Result<usize, DriverError> {
        self.begin_call();
        self.end_call();
        Ok(0)
    }

    async fn close(&self) -> Result<(), DriverError> {
        self.log.lock().unwrap().closed += 1;
        Ok(())
    }
}

/// Opens a fresh scripted driver per session, all sharing one log.
pub struct ScriptedFactory {
    start: Observation,
    exec: ExecFn,
    exec_delay: Option<Duration>,
    pub log: Arc<Mutex<DriverLog>>,
    fail_observe: Option<fn() -> DriverError>,
    fail_open: bool,
}

impl ScriptedFactory {
    pub fn new(start: Observation) -> Self {
        Self {
            start,
            exec: default_exec(),
            exec_delay: None,
            log: Arc::new(Mutex::new(DriverLog::default())),
            fail_observe: None,
            fail_open: false,
        }
    }

    pub fn with_exec(mut self, exec: ExecFn) -> Self {
        self.exec = exec;
        self
    }

    /// Every action takes `delay` before it lands on the page.
    pub fn with_exec_delay(mut self, delay: Duration) -> Self {
        self.exec_delay = Some(delay);
        self
    }

    pub fn failing_observe(mut self, fail: fn() -> DriverError) -> Self {
        self.fail_observe = Some(fail);
        self
    }

    pub fn failing_open(mut self) -> Self {
        self.fail_open = true;
        self
    }
}

#[async_trait]
impl SessionFactory for ScriptedFactory {
    async fn open(&self) -> Result<Box<dyn BrowserDriver>, DriverError> {
        if self.fail_open {
            return Err(DriverError::Crashed("chrome failed to start".into()));
        }
        Ok(Box::new(ScriptedDriver {
            page: Mutex::new(self.start.clone()),
            exec: self.exec.clone(),
            exec_delay: self.exec_delay,
            busy: AtomicBool::new(false),
            log: self.log.clone(),
            fail_observe: self.fail_observe,
        }))
    }
}

#[derive(Debug, Clone)]
pub struct SeenRequest {
    pub mode: DecideMode,
    pub step: u32,
    pub url: String,
    pub element_count: usize,
}

/// Replays queued replies, then cycles through `cycle`.
#[derive(Default)]
pub struct ScriptedOracle {
    replies: Mutex<VecDeque<Result<Decision, OracleError>>>,
    cycle: Vec<Decision>,
    cycle_pos: Mutex<usize>,
    goals: Vec<PageGoal>,
    delay: Option<Duration>,
    cancel_at: Option<(u32, CancellationToken)>,
    panics: bool,
    pub seen: Mutex<Vec<SeenRequest>>,
}

impl ScriptedOracle {
    pub fn replying(replies: Vec<Result<Decision, OracleError>>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            ..Default::default()
        }
    }

    pub fn repeating(cycle: Vec<Decision>) -> Self {
        Self {
            cycle,
            ..Default::default()
        }
    }

    pub fn then_repeating(mut self, cycle: Vec<Decision>) -> Self {
        self.cycle = cycle;
        self
    }

    pub fn with_goals(mut self, goals: Vec<PageGoal>) -> Self {
        self.goals = goals;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Cancel `token` while deciding step `step`.
    pub fn cancelling_at(mut self, step: u32, token: CancellationToken) -> Self {
        self.cancel_at = Some((step, token));
        self
    }

    /// Every decision panics, taking the run task down with it.
    pub fn panicking() -> Self {
        Self {
            panics: true,
            ..Default::default()
        }
    }

    pub fn seen(&self) -> Vec<SeenRequest> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl DecisionOracle for ScriptedOracle {
    async fn decide(&self, request: &DecideRequest<'_>) -> Result<Decision, OracleError> {
        self.seen.lock().unwrap().push(SeenRequest {
            mode: request.mode,
            step: request.step,
            url: request.observation.url.clone(),
            element_count: request.observation.elements.len(),
        });
        if let Some((step, token)) = &self.cancel_at {
            if *step == request.step {
                token.cancel();
            }
        }
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.panics {
            panic!("oracle blew up");
        }

        if let Some(reply) = self.replies.lock().unwrap().pop_front() {
            return reply;
        }
        if self.cycle.is_empty() {
            return Err(OracleError::provider("script exhausted"));
        }
        let mut pos = self.cycle_pos.lock().unwrap();
        let reply = self.cycle[*pos % self.cycle.len()].clone();
        *pos += 1;
        Ok(reply)
    }

    async fn extract_goals(&self, _task: &str) -> Result<Vec<PageGoal>, OracleError> {
        Ok(self.goals.clone())
    }
}

pub struct Harness {
    pub agent: AgentLoop,
    pub registry: SessionRegistry,
    pub log: Arc<Mutex<DriverLog>>,
    pub oracle: Arc<ScriptedOracle>,
}

pub fn harness(config: LoopConfig, factory: ScriptedFactory, oracle: ScriptedOracle) -> Harness {
    harness_with_matcher(config, factory, oracle, Arc::new(KeywordMatcher))
}

pub fn harness_with_matcher(
    config: LoopConfig,
    factory: ScriptedFactory,
    oracle: ScriptedOracle,
    matcher: Arc<dyn ProgressMatcher>,
) -> Harness {
    let log = factory.log.clone();
    let registry = SessionRegistry::new();
    let sessions = SessionManager::new(Arc::new(factory), registry.clone());
    let oracle = Arc::new(oracle);
    let agent = AgentLoop::new(
        config,
        sessions,
        oracle.clone(),
        matcher,
        EventSink::new(4096),
    );
    Harness {
        agent,
        registry,
        log,
        oracle,
    }
}

/// Everything received so far, without waiting.
pub fn drain(rx: &mut broadcast::Receiver<RunEvent>) -> Vec<RunEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

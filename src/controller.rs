//! The agent loop controller.
//!
//! One call to [`AgentLoop::run`] drives a single run through
//! `INIT -> OBSERVE -> DECIDE -> EXECUTE -> STABILIZE -> RECONCILE` until a
//! termination condition is met. Every path out of the loop produces a
//! complete [`RunReport`], and the browser session is always released.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument, Span};

use crate::config::{Budgets, LoopConfig};
use crate::driver::BrowserDriver;
use crate::error::{DriverError, OracleError};
use crate::escalation::{should_force_terminate, EscalationPolicy, Verdict};
use crate::events::{EventSink, RunEvent};
use crate::history::History;
use crate::oracle::{DecideMode, DecideRequest, Decision, DecisionOracle, KeywordMatcher, ProgressMatcher};
use crate::progress::{Checklist, PageGoal};
use crate::session::SessionManager;
use crate::stability::{await_network_idle, await_stability, strategy_for, StabilityReport};
use crate::state::{reduce, LoopPhase, RunState, StateEvent, TerminationReason};
use crate::types::{Action, ActionClass, ActionResult, Observation};

/// What a caller asks for when starting a run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunRequest {
    pub task: String,
    #[serde(default)]
    pub start_url: Option<String>,
    #[serde(default)]
    pub max_steps: Option<u32>,
    #[serde(default)]
    pub max_failures: Option<u32>,
}

impl RunRequest {
    pub fn new(task: impl Into<String>) -> Self {
        Self {
            task: task.into(),
            ..Default::default()
        }
    }

    pub fn with_start_url(mut self, url: impl Into<String>) -> Self {
        self.start_url = Some(url.into());
        self
    }

    pub fn with_budgets(mut self, max_steps: u32, max_failures: u32) -> Self {
        self.max_steps = Some(max_steps);
        self.max_failures = Some(max_failures);
        self
    }

    /// Budgets for this run. A step budget of 0 is honoured (the run ends
    /// before deciding anything); a failure budget is at least 1.
    pub fn budgets(&self, defaults: Budgets) -> Budgets {
        Budgets {
            step_budget: self.max_steps.unwrap_or(defaults.step_budget),
            failure_budget: self.max_failures.unwrap_or(defaults.failure_budget).max(1),
        }
    }
}

/// Final account of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: String,
    pub task: String,
    pub completed: bool,
    pub steps_used: u32,
    pub termination_reason: TerminationReason,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub history: History,
    pub checklist_final_state: Checklist,
    pub goals_final_state: Vec<PageGoal>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl RunReport {
    fn from_state(run_id: &str, state: RunState, started_at: DateTime<Utc>) -> Self {
        Self {
            run_id: run_id.to_string(),
            task: state.task,
            completed: state.completed,
            steps_used: state.step,
            termination_reason: state.outcome.unwrap_or(TerminationReason::Error),
            final_output: state.final_output,
            error: state.error,
            history: state.history,
            checklist_final_state: state.progress.checklist,
            goals_final_state: state.progress.goals.goals().to_vec(),
            started_at,
            finished_at: Utc::now(),
        }
    }
}

/// Results of one executed batch.
struct BatchOutcome {
    results: Vec<ActionResult>,
    /// Actions actually handed to the driver.
    dispatched: Vec<Action>,
    fatal: Option<DriverError>,
}

#[derive(Clone)]
pub struct AgentLoop {
    config: LoopConfig,
    sessions: SessionManager,
    oracle: Arc<dyn DecisionOracle>,
    matcher: Arc<dyn ProgressMatcher>,
    events: EventSink,
}

impl AgentLoop {
    pub fn new(
        config: LoopConfig,
        sessions: SessionManager,
        oracle: Arc<dyn DecisionOracle>,
        matcher: Arc<dyn ProgressMatcher>,
        events: EventSink,
    ) -> Self {
        Self {
            config,
            sessions,
            oracle,
            matcher,
            events,
        }
    }

    pub fn config(&self) -> &LoopConfig {
        &self.config
    }

    pub fn events(&self) -> &EventSink {
        &self.events
    }

    pub async fn run(
        &self,
        run_id: &str,
        request: RunRequest,
        cancel: CancellationToken,
    ) -> RunReport {
        let span = info_span!("run", run_id = %run_id);
        self.run_inner(run_id, request, cancel).instrument(span).await
    }

    async fn run_inner(
        &self,
        run_id: &str,
        request: RunRequest,
        cancel: CancellationToken,
    ) -> RunReport {
        let started_at = Utc::now();
        let budgets = request.budgets(self.config.budgets);
        let state = RunState::new(request.task, request.start_url, budgets);
        info!(
            task = %state.task,
            step_budget = budgets.step_budget,
            failure_budget = budgets.failure_budget,
            "starting run"
        );
        let state = self.enter(run_id, state, LoopPhase::Init, None);

        if budgets.step_budget == 0 {
            let state = self.terminate(run_id, state, TerminationReason::MaxSteps, None);
            return RunReport::from_state(run_id, state, started_at);
        }
        if cancel.is_cancelled() {
            let state = self.terminate(run_id, state, TerminationReason::Cancelled, None);
            return RunReport::from_state(run_id, state, started_at);
        }

        let lease = match self.sessions.acquire().await {
            Ok(lease) => lease,
            Err(err) => {
                let state =
                    self.terminate(run_id, state, TerminationReason::Error, Some(err.to_string()));
                return RunReport::from_state(run_id, state, started_at);
            }
        };
        info!(session_id = %lease.id, "session acquired");

        // Driven on its own task so a panic still ends in a report and a
        // released session.
        let fallback = state.clone();
        let driven = {
            let agent = self.clone();
            let id = run_id.to_string();
            let driver = lease.driver.clone();
            tokio::spawn(
                async move { agent.drive(&id, state, driver.as_ref(), &cancel).await }
                    .instrument(Span::current()),
            )
            .await
        };
        let state = match driven {
            Ok(state) => state,
            Err(err) => self.terminate(
                run_id,
                fallback,
                TerminationReason::Error,
                Some(format!("run task failed: {}", err)),
            ),
        };

        if let Err(err) = self.sessions.release(lease).await {
            warn!(error = %err, "session release failed");
        }

        let report = RunReport::from_state(run_id, state, started_at);
        info!(
            reason = %report.termination_reason,
            completed = report.completed,
            steps_used = report.steps_used,
            "run finished"
        );
        report
    }

    async fn drive(
        &self,
        run_id: &str,
        mut state: RunState,
        driver: &dyn BrowserDriver,
        cancel: &CancellationToken,
    ) -> RunState {
        state = self.extract_goals(state).await;

        if let Some(url) = state.start_url.clone() {
            match driver.navigate(&url).await {
                Ok(()) => {
                    await_network_idle(driver, &self.config.stability).await;
                }
                Err(err) if err.is_fatal() => {
                    return self.terminate(
                        run_id,
                        state,
                        TerminationReason::Error,
                        Some(err.to_string()),
                    );
                }
                Err(err) => warn!(url = %url, error = %err, "start navigation failed"),
            }
        }

        loop {
            // OBSERVE
            if cancel.is_cancelled() {
                info!(step = state.step, "run cancelled");
                return self.terminate(run_id, state, TerminationReason::Cancelled, None);
            }
            state = self.enter(run_id, state, LoopPhase::Observe, None);
            let observation = match self.observe_fresh(driver).await {
                Ok(observation) => observation,
                Err(err) => {
                    return self.terminate(
                        run_id,
                        state,
                        TerminationReason::Error,
                        Some(format!("observation failed: {}", err)),
                    );
                }
            };
            state = reduce(state, StateEvent::Observed(observation.summary()));

            // DECIDE
            state = self.enter(run_id, state, LoopPhase::Decide, None);
            let (next, decided) = self.decide(state, &observation).await;
            state = next;
            let decision = match decided {
                Ok(decision) => decision,
                Err(err) => {
                    return self.terminate(
                        run_id,
                        state,
                        TerminationReason::Error,
                        Some(format!("oracle failed: {}", err)),
                    );
                }
            };

            let decision = if state.mode == DecideMode::DoneOnly {
                match decision.clone().restricted_to_done() {
                    Some(done_only) => done_only,
                    None => {
                        warn!("final attempt did not produce done, stopping");
                        state = self.record_decision(state, decision);
                        return self.terminate(run_id, state, TerminationReason::MaxFailures, None);
                    }
                }
            } else {
                decision
            };
            let actions = decision.actions.clone();
            state = self.record_decision(state, decision);

            // EXECUTE
            let planned = actions
                .iter()
                .map(Action::describe)
                .collect::<Vec<_>>()
                .join("; ");
            state = self.enter(run_id, state, LoopPhase::Execute, Some(planned));
            let before = observation.element_ids();
            let outcome = self.execute_batch(driver, &observation, &actions).await;

            if let Some(fatal) = outcome.fatal {
                error!(error = %fatal, "browser session lost");
                state = reduce(
                    state,
                    StateEvent::Executed {
                        results: outcome.results,
                        stability: None,
                    },
                );
                return self.terminate(
                    run_id,
                    state,
                    TerminationReason::Error,
                    Some(fatal.to_string()),
                );
            }

            // STABILIZE
            let stability: Option<StabilityReport> = match strategy_for(&outcome.dispatched) {
                Some(strategy) => {
                    state = self.enter(run_id, state, LoopPhase::Stabilize, None);
                    Some(await_stability(driver, strategy, &before, &self.config.stability).await)
                }
                None => None,
            };

            // RECONCILE
            let results = outcome.results;
            let outcomes = results
                .iter()
                .map(|r| match &r.error {
                    Some(err) => format!("{} failed: {}", r.action.kind(), err),
                    None => r.summary(),
                })
                .collect::<Vec<_>>()
                .join("; ");
            state = reduce(
                state,
                StateEvent::Executed {
                    results: results.clone(),
                    stability,
                },
            );
            state = self.enter(run_id, state, LoopPhase::Reconcile, Some(outcomes));
            state = self.reconcile_checklist(state, &results).await;

            if results.iter().any(|r| r.is_done) {
                let reason = if state.mode == DecideMode::DoneOnly {
                    TerminationReason::MaxFailures
                } else {
                    TerminationReason::Done
                };
                return self.terminate(run_id, state, reason, None);
            }

            let policy = EscalationPolicy {
                failure_budget: state.budgets.failure_budget,
                repetition_limit: self.config.repetition_limit,
                final_attempt: self.config.final_attempt,
            };
            match should_force_terminate(&state.counters, &policy, state.final_attempt_used) {
                Verdict::Terminate(reason) => {
                    warn!(
                        consecutive_failures = state.counters.consecutive_failures,
                        repetitions = state.counters.action_repetition_count,
                        reason = %reason,
                        "escalation stopped the run"
                    );
                    return self.terminate(run_id, state, reason, None);
                }
                Verdict::ForceDoneOnly => {
                    if state.budget_spent() {
                        return self.terminate(run_id, state, TerminationReason::MaxFailures, None);
                    }
                    warn!(
                        consecutive_failures = state.counters.consecutive_failures,
                        "failure budget spent, granting one done-only decision"
                    );
                    state = reduce(state, StateEvent::ModeChanged(DecideMode::DoneOnly));
                    continue;
                }
                Verdict::Continue => {}
            }

            if state.budget_spent() {
                info!(step = state.step, "step budget spent");
                return self.terminate(run_id, state, TerminationReason::MaxSteps, None);
            }
        }
    }

    async fn extract_goals(&self, state: RunState) -> RunState {
        match timeout(self.config.oracle_timeout(), self.oracle.extract_goals(&state.task)).await {
            Ok(Ok(goals)) if !goals.is_empty() => {
                info!(count = goals.len(), "page-state goals extracted");
                reduce(state, StateEvent::GoalsExtracted(goals))
            }
            Ok(Ok(_)) => state,
            Ok(Err(err)) => {
                warn!(error = %err, "goal extraction failed, continuing without goals");
                state
            }
            Err(_) => {
                warn!("goal extraction timed out, continuing without goals");
                state
            }
        }
    }

    /// Uncached observation, retried once unless the session is gone.
    ///
    /// Driver calls are never abandoned here: the driver enforces its own
    /// deadline and returns only once its browser work has stopped.
    async fn observe_fresh(&self, driver: &dyn BrowserDriver) -> Result<Observation, DriverError> {
        match driver.observe(true).await {
            Ok(observation) => Ok(observation),
            Err(err) if err.is_fatal() => Err(err),
            Err(err) => {
                warn!(error = %err, "observation failed, retrying");
                driver.observe(true).await
            }
        }
    }

    /// Ask the oracle for the next batch. A failed or timed-out call is
    /// retried once in simplified mode after a jittered backoff.
    async fn decide(
        &self,
        mut state: RunState,
        observation: &Observation,
    ) -> (RunState, Result<Decision, OracleError>) {
        let max_actions = self.config.max_actions_per_step;
        let mut mode = state.mode;
        let mut attempt = 1;
        loop {
            let request = DecideRequest {
                task: &state.task,
                observation,
                history: &state.history,
                progress: &state.progress,
                mode,
                max_actions,
                step: state.step + 1,
                step_budget: state.budgets.step_budget,
            };
            let outcome = match timeout(self.config.oracle_timeout(), self.oracle.decide(&request))
                .await
            {
                Ok(Ok(decision)) => decision.validated(max_actions),
                Ok(Err(err)) => Err(err),
                Err(_) => Err(OracleError::Timeout(self.config.oracle_timeout_ms)),
            };

            let err = match outcome {
                Ok(decision) => {
                    debug!(
                        step = state.step + 1,
                        mode = ?mode,
                        actions = decision.actions.len(),
                        "oracle decided"
                    );
                    return (state, Ok(decision));
                }
                Err(err) => err,
            };

            warn!(attempt, mode = ?mode, error = %err, "oracle decision failed");
            state = reduce(
                state,
                StateEvent::DecisionFailed {
                    mode,
                    error: err.to_string(),
                },
            );
            if attempt >= 2 {
                return (state, Err(err));
            }
            attempt += 1;
            sleep(self.retry_backoff()).await;
            if mode == DecideMode::Normal {
                mode = DecideMode::Simplified;
            }
        }
    }

    fn retry_backoff(&self) -> Duration {
        let base = self.config.oracle_retry_backoff();
        base + base.mul_f32(rand::random::<f32>() * 0.5)
    }

    fn record_decision(&self, state: RunState, decision: Decision) -> RunState {
        let mode = state.mode;
        let kinds: Vec<&str> = decision.actions.iter().map(Action::kind).collect();
        info!(step = state.step + 1, actions = ?kinds, "decision accepted");
        reduce(
            state,
            StateEvent::Decided {
                mode,
                actions: decision.actions,
                thinking: decision.thinking,
                plan: decision.plan,
            },
        )
    }

    /// Run a batch in order against the observation it was decided from.
    async fn execute_batch(
        &self,
        driver: &dyn BrowserDriver,
        observation: &Observation,
        actions: &[Action],
    ) -> BatchOutcome {
        let mut results = Vec::with_capacity(actions.len());
        let mut dispatched = Vec::new();
        let mut page_changed = false;

        for action in actions {
            if action.is_done() {
                results.push(ActionResult::done(action.clone()));
                break;
            }
            if let Some(index) = action.element_index() {
                if page_changed {
                    debug!(index, "skipping action on stale index");
                    results.push(ActionResult::failed(
                        action.clone(),
                        format!("element index {} is stale after page change", index),
                    ));
                    continue;
                }
                if !observation.has_element(index) {
                    results.push(ActionResult::failed(
                        action.clone(),
                        DriverError::ElementNotFound(index).to_string(),
                    ));
                    continue;
                }
            }

            dispatched.push(action.clone());
            let result = match driver.execute(action).await {
                Ok(result) => result,
                Err(err) if err.is_fatal() => {
                    results.push(ActionResult::failed(action.clone(), err.to_string()));
                    return BatchOutcome {
                        results,
                        dispatched,
                        fatal: Some(err),
                    };
                }
                Err(err) => ActionResult::failed(action.clone(), err.to_string()),
            };
            match &result.error {
                Some(err) => info!(action = action.kind(), error = %err, "action failed"),
                None => info!(action = action.kind(), "action ok"),
            }
            if result.success && action.class() == ActionClass::PageChanging {
                page_changed = true;
            }
            results.push(result);
        }

        BatchOutcome {
            results,
            dispatched,
            fatal: None,
        }
    }

    /// Match successful results against unchecked checklist lines, falling
    /// back to keywords when the matcher fails or stalls.
    async fn reconcile_checklist(&self, state: RunState, results: &[ActionResult]) -> RunState {
        let successes: Vec<ActionResult> = results
            .iter()
            .filter(|r| r.success && !r.is_done)
            .cloned()
            .collect();
        if successes.is_empty() {
            return state;
        }
        let (positions, lines): (Vec<usize>, Vec<String>) = state
            .progress
            .checklist
            .unchecked()
            .into_iter()
            .map(|(index, text)| (index, text.to_string()))
            .unzip();
        if lines.is_empty() {
            return state;
        }

        let matched = match timeout(
            self.config.matcher_timeout(),
            self.matcher.match_completed_steps(&successes, &lines),
        )
        .await
        {
            Ok(Ok(matched)) => matched,
            Ok(Err(err)) => {
                warn!(error = %err, "progress matcher failed, using keyword fallback");
                KeywordMatcher.match_lines(&successes, &lines)
            }
            Err(_) => {
                warn!("progress matcher timed out, using keyword fallback");
                KeywordMatcher.match_lines(&successes, &lines)
            }
        };

        let indices: Vec<usize> = matched
            .into_iter()
            .filter_map(|i| positions.get(i).copied())
            .collect();
        if indices.is_empty() {
            return state;
        }
        debug!(?indices, "checklist lines completed");
        reduce(state, StateEvent::ChecklistMatched(indices))
    }

    fn enter(
        &self,
        run_id: &str,
        state: RunState,
        phase: LoopPhase,
        action_summary: Option<String>,
    ) -> RunState {
        let state = reduce(state, StateEvent::PhaseEntered(phase));
        self.publish(run_id, &state, action_summary);
        state
    }

    fn terminate(
        &self,
        run_id: &str,
        state: RunState,
        reason: TerminationReason,
        error: Option<String>,
    ) -> RunState {
        match (&error, reason) {
            (Some(err), _) => error!(reason = %reason, error = %err, "run terminated"),
            (None, TerminationReason::Done) => info!("task completed"),
            (None, _) => warn!(reason = %reason, step = state.step, "run terminated"),
        }
        let state = reduce(state, StateEvent::Terminated { reason, error });
        self.publish(run_id, &state, state.final_output.clone());
        state
    }

    fn publish(&self, run_id: &str, state: &RunState, action_summary: Option<String>) {
        self.events.publish(RunEvent {
            run_id: run_id.to_string(),
            step_index: state.step,
            phase: state.phase,
            observation_summary: state.last_observation.as_ref().map(|o| o.to_string()),
            action_summary,
            progress_summary: state.progress.snapshot().to_string(),
            termination_reason: state.outcome,
        });
    }
}

//! DOM stability detection.
//!
//! Replaces fixed sleeps after actions with polling of real signals: the
//! pending network request count after page-changing actions, and the set of
//! interactive element indices after DOM-mutating ones. Neither strategy
//! fails; when stability cannot be established the caller proceeds with a
//! best-effort observation.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use crate::config::StabilityConfig;
use crate::driver::BrowserDriver;
use crate::types::{Action, ActionClass};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StabilityStrategy {
    NetworkIdle,
    ElementDelta,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StabilityReport {
    pub strategy: StabilityStrategy,
    /// False when the wait ran out or the driver could not be polled.
    pub settled: bool,
    pub polls: u32,
    pub waited_ms: u64,
    pub remaining_requests: usize,
    /// Elements present at the end that were not there before the action.
    pub new_elements: usize,
}

/// Pick the strategy for a batch of executed actions, or `None` when nothing
/// in it can have changed the page.
pub fn strategy_for<'a, I>(executed: I) -> Option<StabilityStrategy>
where
    I: IntoIterator<Item = &'a Action>,
{
    let mut strategy = None;
    for action in executed {
        match action.class() {
            ActionClass::PageChanging => return Some(StabilityStrategy::NetworkIdle),
            ActionClass::DomMutating => strategy = Some(StabilityStrategy::ElementDelta),
            ActionClass::Informational => {}
        }
    }
    strategy
}

pub async fn await_stability(
    driver: &dyn BrowserDriver,
    strategy: StabilityStrategy,
    before: &BTreeSet<u32>,
    config: &StabilityConfig,
) -> StabilityReport {
    match strategy {
        StabilityStrategy::NetworkIdle => await_network_idle(driver, config).await,
        StabilityStrategy::ElementDelta => await_element_delta(driver, before, config).await,
    }
}

/// Poll the pending request count until it reaches zero or `max_wait` passes.
pub async fn await_network_idle(
    driver: &dyn BrowserDriver,
    config: &StabilityConfig,
) -> StabilityReport {
    let started = Instant::now();
    let max_wait = config.max_wait();
    let mut report = StabilityReport {
        strategy: StabilityStrategy::NetworkIdle,
        settled: false,
        polls: 1,
        waited_ms: 0,
        remaining_requests: 0,
        new_elements: 0,
    };

    match driver.pending_requests().await {
        Ok(0) => {
            debug!("no pending network requests, page is idle");
            report.settled = true;
            return report;
        }
        Ok(pending) => {
            info!(pending, "waiting for pending network requests");
            report.remaining_requests = pending;
        }
        Err(err) => {
            debug!(error = %err, "could not read pending requests, proceeding");
            return report;
        }
    }

    while started.elapsed() < max_wait {
        let left = max_wait.saturating_sub(started.elapsed());
        sleep(config.poll_interval().min(left).max(Duration::from_millis(1))).await;
        report.polls += 1;

        match driver.pending_requests().await {
            Ok(0) => {
                report.remaining_requests = 0;
                report.settled = true;
                break;
            }
            Ok(pending) => {
                if pending < report.remaining_requests {
                    debug!(
                        from = report.remaining_requests,
                        to = pending,
                        "pending requests decreasing"
                    );
                }
                report.remaining_requests = pending;
            }
            Err(err) => debug!(error = %err, "pending request poll failed"),
        }
    }

    report.waited_ms = started.elapsed().as_millis() as u64;
    if report.settled {
        info!(waited_ms = report.waited_ms, "network idle");
    } else {
        warn!(
            remaining = report.remaining_requests,
            waited_ms = report.waited_ms,
            "requests still pending after max wait, proceeding anyway"
        );
    }
    report
}

/// Re-observe until the element index set stops changing for
/// `stability_threshold` consecutive passes, or `max_passes` is used up.
pub async fn await_element_delta(
    driver: &dyn BrowserDriver,
    before: &BTreeSet<u32>,
    config: &StabilityConfig,
) -> StabilityReport {
    let started = Instant::now();
    let mut previous = before.clone();
    let mut quiet_passes = 0u32;
    let mut report = StabilityReport {
        strategy: StabilityStrategy::ElementDelta,
        settled: false,
        polls: 0,
        waited_ms: 0,
        remaining_requests: 0,
        new_elements: 0,
    };

    for pass in 1..=config.max_passes {
        if pass > 1 {
            sleep(config.pass_interval()).await;
        }
        report.polls = pass;

        let observation = match driver.observe(true).await {
            Ok(observation) => observation,
            Err(err) => {
                debug!(pass, error = %err, "observation failed during stability pass");
                quiet_passes = 0;
                continue;
            }
        };

        let current = observation.element_ids();
        let delta = previous.symmetric_difference(&current).count();
        if delta == 0 {
            quiet_passes += 1;
        } else {
            debug!(pass, delta, elements = current.len(), "element set changed");
            quiet_passes = 0;
        }
        report.remaining_requests = observation.pending_requests;
        previous = current;

        if quiet_passes >= config.stability_threshold {
            report.settled = true;
            break;
        }
    }

    report.new_elements = previous.difference(before).count();
    report.waited_ms = started.elapsed().as_millis() as u64;
    if report.settled {
        info!(
            passes = report.polls,
            elements = previous.len(),
            new = report.new_elements,
            "DOM stabilized"
        );
    } else {
        info!(
            max_passes = config.max_passes,
            new = report.new_elements,
            "max passes reached without a stable element set"
        );
    }
    report
}

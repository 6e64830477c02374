//! Run API: start runs in the background, follow their events, fetch or
//! await their reports, cancel them.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, watch, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use crate::controller::{AgentLoop, RunReport, RunRequest};
use crate::events::RunEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Cancelling,
    Finished,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: String,
    pub task: String,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub report: Option<RunReport>,
}

struct RunHandle {
    task: String,
    started_at: DateTime<Utc>,
    cancel: CancellationToken,
    report: watch::Receiver<Option<RunReport>>,
}

impl RunHandle {
    fn summary(&self, run_id: &str) -> RunSummary {
        let report = self.report.borrow().clone();
        // A closed channel means the run task is gone, report or not.
        let gone = self.report.has_changed().is_err();
        let status = match (&report, gone, self.cancel.is_cancelled()) {
            (Some(_), _, _) | (None, true, _) => RunStatus::Finished,
            (None, false, true) => RunStatus::Cancelling,
            (None, false, false) => RunStatus::Running,
        };
        RunSummary {
            run_id: run_id.to_string(),
            task: self.task.clone(),
            status,
            started_at: self.started_at,
            report,
        }
    }
}

#[derive(Clone)]
pub struct RunManager {
    agent: Arc<AgentLoop>,
    runs: Arc<RwLock<HashMap<String, RunHandle>>>,
}

impl RunManager {
    pub fn new(agent: AgentLoop) -> Self {
        Self {
            agent: Arc::new(agent),
            runs: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Spawn a run and return its id without waiting for it.
    pub async fn start_run(&self, request: RunRequest) -> String {
        let run_id = Uuid::new_v4().to_string();
        let cancel = CancellationToken::new();
        let (tx, rx) = watch::channel(None);

        self.runs.write().await.insert(
            run_id.clone(),
            RunHandle {
                task: request.task.clone(),
                started_at: Utc::now(),
                cancel: cancel.clone(),
                report: rx,
            },
        );
        info!(run_id = %run_id, task = %request.task, "run started");

        let agent = self.agent.clone();
        let id = run_id.clone();
        tokio::spawn(async move {
            let report = agent.run(&id, request, cancel).await;
            if tx.send(Some(report)).is_err() {
                debug!(run_id = %id, "run finished with no one holding its handle");
            }
        });
        run_id
    }

    /// Events of every run; filter on `run_id` to follow one.
    pub fn subscribe(&self) -> broadcast::Receiver<RunEvent> {
        self.agent.events().subscribe()
    }

    pub async fn status(&self, run_id: &str) -> Option<RunSummary> {
        self.runs
            .read()
            .await
            .get(run_id)
            .map(|handle| handle.summary(run_id))
    }

    /// Wait for a run to finish. `None` when the run is unknown or its task
    /// died before producing a report.
    pub async fn wait(&self, run_id: &str) -> Option<RunReport> {
        let mut rx = self.runs.read().await.get(run_id)?.report.clone();
        match rx.wait_for(Option::is_some).await {
            Ok(report) => report.clone(),
            Err(_) => None,
        }
    }

    /// Request cancellation. Takes effect at the start of the next step.
    pub async fn cancel(&self, run_id: &str) -> bool {
        match self.runs.read().await.get(run_id) {
            Some(handle) => {
                debug!(run_id = %run_id, "cancellation requested");
                handle.cancel.cancel();
                true
            }
            None => false,
        }
    }

    pub async fn list(&self) -> Vec<RunSummary> {
        let runs = self.runs.read().await;
        let mut summaries: Vec<RunSummary> = runs
            .iter()
            .map(|(id, handle)| handle.summary(id))
            .collect();
        summaries.sort_by_key(|summary| summary.started_at);
        summaries
    }
}

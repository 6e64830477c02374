mod brain;
mod dom;
mod face;
mod hands;
mod types;

use anyhow::{Context, Result};
use browser_agent::config::AgentConfig;
use browser_agent::controller::{AgentLoop, RunRequest};
use browser_agent::events::EventSink;
use browser_agent::runs::RunManager;
use browser_agent::session::{SessionManager, SessionRegistry};
use browser_agent::telemetry::{self, LogFormat};
use clap::{Parser, Subcommand};
use dotenvy::dotenv;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[command(name = "agent", version, about = "Drive a browser toward a task with an LLM")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Serve the run API and web UI.
    Serve {
        #[arg(long, default_value_t = 3000)]
        port: u16,
    },
    /// Run one task and print its report as JSON.
    Run {
        task: String,
        #[arg(long)]
        start_url: Option<String>,
        #[arg(long)]
        max_steps: Option<u32>,
        #[arg(long)]
        max_failures: Option<u32>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    telemetry::init(LogFormat::from_env());

    let cli = Cli::parse();
    let config = AgentConfig::from_env().context("invalid configuration")?;
    let runs = build_runs(&config)?;

    match cli.command {
        Command::Serve { port } => face::serve(runs, port).await,
        Command::Run {
            task,
            start_url,
            max_steps,
            max_failures,
        } => {
            let request = RunRequest {
                task,
                start_url,
                max_steps,
                max_failures,
            };
            run_once(runs, request).await
        }
    }
}

fn build_runs(config: &AgentConfig) -> Result<RunManager> {
    let brain = Arc::new(brain::Brain::new(config.oracle.clone())?);
    let factory = Arc::new(hands::ChromeSessionFactory::new(
        config.browser.clone(),
        config.agent.action_timeout(),
    ));
    let sessions = SessionManager::new(factory, SessionRegistry::new());
    let agent = AgentLoop::new(
        config.agent.clone(),
        sessions,
        brain.clone(),
        brain,
        EventSink::default(),
    );
    info!(model = %config.oracle.model, "agent ready");
    Ok(RunManager::new(agent))
}

async fn run_once(runs: RunManager, request: RunRequest) -> Result<()> {
    let mut events = runs.subscribe();
    let run_id = runs.start_run(request).await;

    let follow_id = run_id.clone();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) if event.run_id == follow_id => {
                    if let Some(summary) = &event.action_summary {
                        info!(
                            step = event.step_index,
                            phase = event.phase.as_str(),
                            progress = %event.progress_summary,
                            "{}",
                            summary
                        );
                    }
                    if event.is_final() {
                        break;
                    }
                }
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "event stream lagged"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    let cancel_runs = runs.clone();
    let cancel_id = run_id.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, cancelling after the current step");
            cancel_runs.cancel(&cancel_id).await;
        }
    });

    let report = runs
        .wait(&run_id)
        .await
        .context("run ended without a report")?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

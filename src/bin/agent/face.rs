use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use browser_agent::controller::RunRequest;
use browser_agent::events::RunEvent;
use browser_agent::runs::RunManager;
use serde::Deserialize;
use serde_json::json;
use std::convert::Infallible;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{info, warn};

#[derive(Clone)]
pub struct AppState {
    pub runs: RunManager,
}

#[derive(Debug, Deserialize)]
struct EventFilter {
    run_id: Option<String>,
}

pub fn router(runs: RunManager) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/runs", post(start_run_handler).get(list_runs_handler))
        .route("/runs/{id}", get(run_status_handler))
        .route("/runs/{id}/cancel", post(cancel_run_handler))
        .route("/events", get(sse_handler))
        .route("/favicon.ico", get(|| async { StatusCode::NO_CONTENT }))
        .with_state(AppState { runs })
}

/// Serve the run API on `port`, or the next free port among the following
/// nine. Returns when the server stops.
pub async fn serve(runs: RunManager, port: u16) -> anyhow::Result<()> {
    let mut listener = None;
    for candidate in port..port.saturating_add(10) {
        match tokio::net::TcpListener::bind(("127.0.0.1", candidate)).await {
            Ok(bound) => {
                listener = Some(bound);
                break;
            }
            Err(err) => warn!(port = candidate, error = %err, "port unavailable"),
        }
    }
    let listener = listener.ok_or_else(|| {
        anyhow::anyhow!(
            "could not bind any port in {}-{}",
            port,
            port.saturating_add(9)
        )
    })?;

    info!("web UI running at http://{}", listener.local_addr()?);
    axum::serve(listener, router(runs)).await?;
    Ok(())
}

async fn index_handler() -> Html<&'static str> {
    Html(INDEX_HTML)
}

async fn start_run_handler(
    State(state): State<AppState>,
    Json(request): Json<RunRequest>,
) -> Response {
    if request.task.trim().is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "task must not be empty"})),
        )
            .into_response();
    }
    info!(task = %request.task, "POST /runs");
    let run_id = state.runs.start_run(request).await;
    (StatusCode::ACCEPTED, Json(json!({"run_id": run_id}))).into_response()
}

async fn list_runs_handler(State(state): State<AppState>) -> Response {
    Json(state.runs.list().await).into_response()
}

async fn run_status_handler(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.runs.status(&id).await {
        Some(summary) => Json(summary).into_response(),
        None => not_found(&id),
    }
}

async fn cancel_run_handler(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    if state.runs.cancel(&id).await {
        info!(run_id = %id, "cancel requested over HTTP");
        (StatusCode::ACCEPTED, Json(json!({"run_id": id, "cancelled": true}))).into_response()
    } else {
        not_found(&id)
    }
}

fn not_found(id: &str) -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(json!({"error": format!("run {} not found", id)})),
    )
        .into_response()
}

fn to_sse_event(event: &RunEvent) -> Event {
    let name = if event.is_final() {
        "finished"
    } else {
        event.phase.as_str()
    };
    Event::default()
        .event(name)
        .data(serde_json::to_string(event).unwrap_or_else(|_| "{}".to_string()))
}

async fn sse_handler(
    State(state): State<AppState>,
    Query(filter): Query<EventFilter>,
) -> Sse<impl tokio_stream::Stream<Item = Result<Event, Infallible>>> {
    let rx = state.runs.subscribe();
    let stream = BroadcastStream::new(rx).filter_map(move |result| match result {
        Ok(event) if filter.run_id.as_ref().is_none_or(|id| *id == event.run_id) => {
            Some(Ok::<_, Infallible>(to_sse_event(&event)))
        }
        // Lagged receivers skip what they missed.
        _ => None,
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}

const INDEX_HTML: &str = r##"<!DOCTYPE html>
<html lang="en">
<head>
<meta charset="UTF-8">
<meta name="viewport" content="width=device-width, initial-scale=1.0">
<title>Browser Agent</title>
<style>
  * { margin: 0; padding: 0; box-sizing: border-box; }
  body { background: #0a0a0f; color: #e0e0e0; font-family: system-ui, sans-serif;
         height: 100vh; display: flex; flex-direction: column; }
  header { padding: 20px 32px; border-bottom: 1px solid #1a1a2e; font-size: 20px; color: #fff; }
  .main { flex: 1; display: flex; flex-direction: column; max-width: 860px; width: 100%;
          margin: 0 auto; padding: 24px 32px; gap: 12px; overflow: hidden; }
  #log { flex: 1; overflow-y: auto; display: flex; flex-direction: column; gap: 6px; }
  .entry { padding: 8px 12px; border-radius: 6px; font-size: 13px; background: #111118;
           border-left: 3px solid #3b82f6; font-family: monospace; white-space: pre-wrap; }
  .entry.finished { border-left-color: #22c55e; color: #86efac; }
  .entry.failed { border-left-color: #ef4444; color: #fca5a5; }
  .inputs { display: flex; gap: 8px; }
  input { background: #111118; border: 1px solid #222; border-radius: 6px; padding: 10px 14px;
          color: #fff; font-size: 15px; }
  #task { flex: 1; }
  button { background: #6366f1; color: #fff; border: none; border-radius: 6px; padding: 10px 20px;
           font-weight: 600; cursor: pointer; }
</style>
</head>
<body>
  <header>Browser Agent</header>
  <div class="main">
    <div id="log"></div>
    <div class="inputs">
      <input id="task" placeholder="Tell the agent what to do..." autofocus />
      <input id="url" placeholder="Start URL (optional)" />
      <button onclick="start()">Run</button>
    </div>
  </div>
<script>
  const log = document.getElementById('log');
  const esc = s => String(s || '').replace(/</g, '&lt;');

  function add(cls, text) {
    const div = document.createElement('div');
    div.className = 'entry ' + cls;
    div.innerHTML = text;
    log.appendChild(div);
    log.scrollTop = log.scrollHeight;
  }

  async function start() {
    const task = document.getElementById('task').value.trim();
    const url = document.getElementById('url').value.trim();
    if (!task) return;
    const res = await fetch('/runs', {
      method: 'POST',
      headers: {'Content-Type': 'application/json'},
      body: JSON.stringify({task, start_url: url || null}),
    });
    const body = await res.json();
    add('', 'run ' + esc(body.run_id || body.error) + ': ' + esc(task));
  }

  document.getElementById('task').addEventListener('keydown', e => { if (e.key === 'Enter') start(); });

  const es = new EventSource('/events');
  for (const phase of ['init', 'observe', 'decide', 'execute', 'stabilize', 'reconcile']) {
    es.addEventListener(phase, e => {
      const d = JSON.parse(e.data);
      if (phase !== 'execute' && phase !== 'reconcile') return;
      add('', '[' + d.run_id.slice(0, 8) + '] step ' + d.step_index + ' ' + phase + ': ' +
          esc(d.action_summary) + '\n' + esc(d.progress_summary));
    });
  }
  es.addEventListener('finished', e => {
    const d = JSON.parse(e.data);
    add(d.termination_reason === 'done' ? 'finished' : 'failed',
        '[' + d.run_id.slice(0, 8) + '] ' + d.termination_reason + ' after ' + d.step_index +
        ' step(s)' + (d.action_summary ? ': ' + esc(d.action_summary) : ''));
  });
</script>
</body>
</html>
"##;

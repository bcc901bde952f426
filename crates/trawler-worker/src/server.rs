//! The worker's HTTP surface.
//!
//! - `POST /tasks/process` - dispatcher delivery path. Replies 200 even on
//!   handler failure so the dispatcher does not redeliver permanent
//!   errors; failure durability lives in the state store.
//! - `GET /health` - liveness for container orchestration.
//! - `GET /admin/queue` - active/waiting counts for health gating.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

use trawler::models::{JobOptions, JobPayload};
use trawler::queue::{QueueJob, QueueProvider};
use trawler::worker::JobHandler;

#[derive(Clone)]
pub struct AppState {
    pub handler: Arc<JobHandler>,
    pub queue: Arc<dyn QueueProvider>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/tasks/process", post(process_task))
        .route("/admin/queue", get(queue_counts))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health() -> &'static str {
    "ok"
}

#[derive(Debug, Deserialize)]
struct TaskEnvelope {
    name: String,
    data: JobPayload,
    options: JobOptions,
}

#[derive(Debug, Serialize)]
struct ProcessReply {
    success: bool,
    #[serde(rename = "jobId")]
    job_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

/// Some dispatchers deliver the payload decoded, others pass the base64
/// body through verbatim; accept both.
fn parse_envelope(body: &[u8]) -> Result<TaskEnvelope, serde_json::Error> {
    serde_json::from_slice(body).or_else(|first_err| {
        use base64::Engine;
        let text: Vec<u8> = body
            .iter()
            .copied()
            .filter(|b| !b.is_ascii_whitespace())
            .collect();
        match base64::engine::general_purpose::STANDARD.decode(text) {
            Ok(decoded) => serde_json::from_slice(&decoded),
            Err(_) => Err(first_err),
        }
    })
}

async fn process_task(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Json<ProcessReply> {
    let task_name = headers
        .get("X-CloudTasks-TaskName")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    let queue_name = headers
        .get("X-CloudTasks-QueueName")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");

    let envelope = match parse_envelope(&body) {
        Ok(envelope) => envelope,
        Err(e) => {
            warn!(task_name, error = %e, "unparseable task payload");
            return Json(ProcessReply {
                success: false,
                job_id: String::new(),
                error: Some(format!("unparseable task payload: {e}")),
            });
        }
    };

    let job_id = envelope.options.job_id.clone();
    info!(job_id, task_name, queue_name, "task received");

    let job = QueueJob {
        id: job_id.clone(),
        name: envelope.name,
        data: envelope.data,
        options: envelope.options,
        lease_token: None,
    };
    state.handler.process(&job).await;

    let (success, error) = match state.queue.job_state(&job_id).await {
        Ok(status) if status.as_str() == "completed" => (true, None),
        Ok(_) => (
            false,
            state.queue.job_error(&job_id).await.ok().flatten(),
        ),
        Err(e) => (false, Some(e.to_string())),
    };

    Json(ProcessReply {
        success,
        job_id,
        error,
    })
}

#[derive(Debug, Serialize)]
struct QueueCounts {
    active: u64,
    waiting: u64,
}

async fn queue_counts(State(state): State<AppState>) -> Json<QueueCounts> {
    let active = state.queue.active_count().await.unwrap_or(0);
    let waiting = state.queue.waiting_count().await.unwrap_or(0);
    Json(QueueCounts { active, waiting })
}

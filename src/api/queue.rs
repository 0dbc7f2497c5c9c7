use axum::extract::State;
use axum::http::StatusCode;
use serde::Serialize;
use serde_json::Value;

use crate::api::handler_utils::{into_json, ApiObject};
use crate::api::server::AppState;
use crate::worker::{QueueSnapshot, QueuedJobView};

#[derive(Debug, Clone, Serialize)]
struct QueueJobResponse {
    id: String,
    image: String,
    model: String,
    position: usize,
    state: &'static str,
    enqueued_at: String,
}

#[derive(Debug, Clone, Serialize)]
struct QueueResponse {
    ok: bool,
    active: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    channel: Option<String>,
    count: usize,
    jobs: Vec<QueueJobResponse>,
}

pub async fn get_queue_handler(State(state): State<AppState>) -> ApiObject<Value> {
    (StatusCode::OK, into_json(queue_response(state.queue.snapshot())))
}

fn queue_response(snapshot: QueueSnapshot) -> QueueResponse {
    let jobs = snapshot
        .jobs
        .into_iter()
        .map(job_response)
        .collect::<Vec<_>>();
    QueueResponse {
        ok: true,
        active: snapshot.active,
        channel: snapshot.channel,
        count: jobs.len(),
        jobs,
    }
}

fn job_response(view: QueuedJobView) -> QueueJobResponse {
    QueueJobResponse {
        id: view.id.to_string(),
        image: view.image,
        model: view.model.to_string(),
        position: view.position,
        state: view.state.as_str(),
        enqueued_at: view.enqueued_at.to_rfc3339(),
    }
}

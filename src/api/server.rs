use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use axum::extract::{OriginalUri, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::api::error::ErrorKind;
use crate::api::handler_utils::{error_response, ApiObject};
use crate::commands::CommandHandler;
use crate::worker::UpscaleQueue;

#[derive(Clone)]
pub struct AppState {
    pub service_name: &'static str,
    pub service_version: &'static str,
    pub started_unix_ms: u128,
    pub commands: Arc<CommandHandler>,
    pub queue: UpscaleQueue,
}

impl AppState {
    pub fn new(commands: Arc<CommandHandler>, queue: UpscaleQueue) -> Self {
        Self {
            service_name: env!("CARGO_PKG_NAME"),
            service_version: env!("CARGO_PKG_VERSION"),
            started_unix_ms: now_unix_ms(),
            commands,
            queue,
        }
    }
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route(
            "/api/messages",
            post(crate::api::messages::post_message_handler),
        )
        .route("/api/queue", get(crate::api::queue::get_queue_handler))
        .fallback(not_found_handler)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn serve(addr: SocketAddr, state: AppState) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let app = build_router(state);
    info!(bind = %addr, "starting upscale-bot HTTP gateway");
    axum::serve(listener, app).await
}

async fn health_handler(State(state): State<AppState>) -> (StatusCode, Json<Value>) {
    let now = now_unix_ms();
    (
        StatusCode::OK,
        Json(json!({
            "ok": true,
            "status": "ok",
            "service": state.service_name,
            "version": state.service_version,
            "started_unix_ms": state.started_unix_ms,
            "uptime_ms": now.saturating_sub(state.started_unix_ms),
            "queue_active": state.queue.is_active(),
        })),
    )
}

async fn not_found_handler(OriginalUri(uri): OriginalUri) -> ApiObject<Value> {
    error_response(
        StatusCode::NOT_FOUND,
        ErrorKind::Unknown,
        "not_found",
        format!("No route for {}", uri.path()),
    )
}

fn now_unix_ms() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |duration| duration.as_millis())
}

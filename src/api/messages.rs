use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;
use url::Url;

use crate::api::handler_utils::{into_json, validation_error, ApiObject};
use crate::api::server::AppState;
use crate::commands::{HandledMessage, IncomingMessage};

#[derive(Debug, Clone, Deserialize)]
pub struct PostMessageRequest {
    pub content: String,
    pub author: String,
    #[serde(default)]
    pub author_is_bot: bool,
    #[serde(default)]
    pub attachments: Vec<String>,
    pub reply_to: String,
}

#[derive(Debug, Clone, Serialize)]
struct PostMessageResponse {
    ok: bool,
    handled: bool,
    replies: Vec<String>,
}

pub async fn post_message_handler(
    State(state): State<AppState>,
    payload: Result<Json<PostMessageRequest>, JsonRejection>,
) -> ApiObject<Value> {
    let payload = match payload {
        Ok(Json(payload)) => payload,
        Err(rejection) => return validation_error(rejection.body_text()),
    };
    let message = match into_incoming_message(payload) {
        Ok(message) => message,
        Err(response) => return response,
    };

    let handled = state.commands.handle(&message).await;
    debug!(
        author = %message.author,
        handled = !matches!(handled, HandledMessage::Ignored),
        "chat message handled"
    );
    (
        StatusCode::OK,
        into_json(PostMessageResponse {
            ok: true,
            handled: !matches!(handled, HandledMessage::Ignored),
            replies: handled.replies().to_vec(),
        }),
    )
}

fn into_incoming_message(payload: PostMessageRequest) -> Result<IncomingMessage, ApiObject<Value>> {
    let reply_to = payload.reply_to.trim().to_string();
    if reply_to.is_empty() {
        return Err(validation_error("reply_to is required"));
    }
    let attachments = payload
        .attachments
        .iter()
        .map(|raw| {
            Url::parse(raw.trim())
                .map_err(|_| validation_error(format!("attachment is not a valid url: {raw}")))
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(IncomingMessage {
        content: payload.content,
        author: payload.author,
        author_is_bot: payload.author_is_bot,
        attachments,
        reply_to,
    })
}

//! WhatsApp webhook endpoints: Meta-style verification handshake and inbound
//! message processing.

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use std::sync::Arc;
use tracing::{info, warn};

use crate::api::AppState;
use crate::services::intake::{InboundKind, InboundMessage};

#[derive(Debug, Deserialize)]
pub struct VerifyParams {
    #[serde(rename = "hub.mode")]
    pub hub_mode: String,
    #[serde(rename = "hub.verify_token")]
    pub hub_verify_token: String,
    #[serde(rename = "hub.challenge")]
    pub hub_challenge: String,
}

/// GET /whatsapp/webhook: verification handshake. Returns the challenge
/// string when the verify token matches.
pub async fn verify_webhook(
    State(state): State<Arc<AppState>>,
    Query(params): Query<VerifyParams>,
) -> Response {
    if params.hub_mode != "subscribe" {
        warn!(hub_mode = %params.hub_mode, "webhook verification failed: invalid hub.mode");
        return (StatusCode::FORBIDDEN, "Invalid hub.mode").into_response();
    }
    if params.hub_verify_token != state.whatsapp_verify_token {
        warn!("webhook verification failed: invalid verify token");
        return (StatusCode::FORBIDDEN, "Invalid verify token").into_response();
    }
    info!("webhook verification successful");
    (StatusCode::OK, params.hub_challenge).into_response()
}

/// Pull the first inbound message out of the nested WhatsApp webhook
/// envelope. Delivery receipts and status updates carry no messages and are
/// skipped.
pub fn parse_inbound_message(payload: &JsonValue) -> Option<InboundMessage> {
    let message = payload
        .get("entry")?
        .as_array()?
        .first()?
        .get("changes")?
        .as_array()?
        .first()?
        .get("value")?
        .get("messages")?
        .as_array()?
        .first()?;

    let sender = message.get("from")?.as_str()?.to_string();
    let msg_type = message.get("type")?.as_str()?;

    match msg_type {
        "text" => {
            let text = message.get("text")?.get("body")?.as_str()?.to_string();
            Some(InboundMessage {
                sender,
                text,
                kind: InboundKind::Text,
            })
        }
        "interactive" => {
            let button_id = message
                .get("interactive")?
                .get("button_reply")?
                .get("id")?
                .as_str()?
                .to_string();
            Some(InboundMessage {
                sender,
                text: button_id,
                kind: InboundKind::ButtonReply,
            })
        }
        other => {
            info!(message_type = %other, "ignoring unsupported message type");
            None
        }
    }
}

/// POST /whatsapp/webhook: always acknowledges; processing failures stay
/// internal.
pub async fn receive_webhook(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<JsonValue>,
) -> Json<JsonValue> {
    if let Some(message) = parse_inbound_message(&payload) {
        info!(
            sender = %message.sender,
            kind = ?message.kind,
            "inbound WhatsApp message"
        );
        state.intake.handle_inbound(message).await;
    }
    Json(json!({"status": "received"}))
}

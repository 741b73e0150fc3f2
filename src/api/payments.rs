//! Payment endpoints: STK push initiation and the provider callback.

use axum::extract::State;
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::sync::Arc;
use tracing::info;

use crate::api::AppState;
use crate::database::store::{Payment, PaymentStatus};
use crate::error::AppResult;
use crate::services::reconciler::CallbackAck;

#[derive(Debug, Deserialize)]
pub struct PaymentCreate {
    pub invoice_id: String,
    pub idempotency_key: String,
}

#[derive(Debug, Serialize)]
pub struct PaymentResponse {
    pub id: uuid::Uuid,
    pub invoice_id: String,
    pub method: String,
    pub status: PaymentStatus,
    pub amount_cents: i64,
    pub idempotency_key: String,
    pub checkout_request_id: Option<String>,
    pub merchant_request_id: Option<String>,
    pub mpesa_receipt: Option<String>,
    pub retry_count: i32,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

impl From<Payment> for PaymentResponse {
    fn from(payment: Payment) -> Self {
        Self {
            id: payment.id,
            invoice_id: payment.invoice_id,
            method: payment.method,
            status: payment.status,
            amount_cents: payment.amount_cents,
            idempotency_key: payment.idempotency_key,
            checkout_request_id: payment.checkout_request_id,
            merchant_request_id: payment.merchant_request_id,
            mpesa_receipt: payment.mpesa_receipt,
            retry_count: payment.retry_count,
            created_at: payment.created_at,
            updated_at: payment.updated_at,
        }
    }
}

/// POST /payments/stk/initiate
///
/// A duplicate idempotency key returns the prior payment with 200, exactly
/// like the first call did: duplicates are not errors.
pub async fn initiate_stk_push(
    State(state): State<Arc<AppState>>,
    Json(request): Json<PaymentCreate>,
) -> AppResult<Json<PaymentResponse>> {
    info!(
        invoice_id = %request.invoice_id,
        idempotency_key = %request.idempotency_key,
        "received STK push initiate request"
    );

    let payment = state
        .flow
        .initiate(&request.invoice_id, &request.idempotency_key)
        .await?;

    Ok(Json(payment.into()))
}

/// POST /payments/stk/callback
///
/// Always acknowledged with success regardless of internal processing
/// outcome, to prevent provider-side redelivery storms.
pub async fn handle_stk_callback(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<JsonValue>,
) -> Json<CallbackAck> {
    Json(state.reconciler.reconcile(&payload).await)
}

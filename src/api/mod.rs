//! HTTP surface: routing and shared application state.

pub mod invoices;
pub mod payments;
pub mod whatsapp;

use axum::routing::{get, post};
use axum::{Json, Router};
use sqlx::PgPool;
use std::sync::Arc;

use crate::database::store::RecordStore;
use crate::health::HealthStatus;
use crate::services::intake::IntakeService;
use crate::services::payment_flow::PaymentFlow;
use crate::services::reconciler::CallbackReconciler;

pub struct AppState {
    pub store: Arc<dyn RecordStore>,
    pub flow: Arc<PaymentFlow>,
    pub reconciler: Arc<CallbackReconciler>,
    pub intake: Arc<IntakeService>,
    pub whatsapp_verify_token: String,
    pub db_pool: Option<PgPool>,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/invoices", post(invoices::create_invoice))
        .route("/invoices/{id}", get(invoices::get_invoice))
        .route("/invoices/{id}/cancel", post(invoices::cancel_invoice))
        .route("/payments/stk/initiate", post(payments::initiate_stk_push))
        .route("/payments/stk/callback", post(payments::handle_stk_callback))
        .route(
            "/whatsapp/webhook",
            get(whatsapp::verify_webhook).post(whatsapp::receive_webhook),
        )
        .with_state(state)
}

async fn health(
    axum::extract::State(state): axum::extract::State<Arc<AppState>>,
) -> Json<HealthStatus> {
    let database = match &state.db_pool {
        Some(pool) => match crate::database::health_check(pool).await {
            Ok(()) => "postgres",
            Err(_) => "unreachable",
        },
        None => "memory",
    };
    Json(HealthStatus::healthy(database))
}

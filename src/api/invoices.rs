//! Invoice REST endpoints.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use crate::api::AppState;
use crate::database::store::{Invoice, InvoiceStatus, NewInvoice};
use crate::error::{AppError, AppErrorKind, AppResult, DomainError, ValidationError};
use crate::phone::normalize_msisdn;

/// Minimum invoice amount: 1 KES.
const MIN_AMOUNT_CENTS: i64 = 100;

#[derive(Debug, Deserialize)]
pub struct InvoiceCreate {
    pub customer_msisdn: String,
    pub customer_name: Option<String>,
    pub merchant_msisdn: String,
    pub amount_cents: i64,
    pub description: String,
}

#[derive(Debug, Serialize)]
pub struct InvoiceResponse {
    pub id: String,
    pub customer_msisdn: String,
    pub customer_name: Option<String>,
    pub merchant_msisdn: String,
    pub amount_cents: i64,
    pub currency: String,
    pub description: String,
    pub status: InvoiceStatus,
    pub pay_ref: Option<String>,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

impl From<Invoice> for InvoiceResponse {
    fn from(invoice: Invoice) -> Self {
        Self {
            id: invoice.id,
            customer_msisdn: invoice.customer_msisdn,
            customer_name: invoice.customer_name,
            merchant_msisdn: invoice.merchant_msisdn,
            amount_cents: invoice.amount_cents,
            currency: invoice.currency,
            description: invoice.description,
            status: invoice.status,
            pay_ref: invoice.pay_ref,
            created_at: invoice.created_at,
            updated_at: invoice.updated_at,
        }
    }
}

fn validate(request: &InvoiceCreate) -> AppResult<(String, String)> {
    let customer = normalize_msisdn(&request.customer_msisdn).map_err(|e| {
        AppError::new(AppErrorKind::Validation(ValidationError::InvalidMsisdn {
            reason: e.reason,
        }))
    })?;
    let merchant = normalize_msisdn(&request.merchant_msisdn).map_err(|e| {
        AppError::new(AppErrorKind::Validation(ValidationError::InvalidMsisdn {
            reason: e.reason,
        }))
    })?;

    if request.amount_cents < MIN_AMOUNT_CENTS {
        return Err(AppError::new(AppErrorKind::Validation(
            ValidationError::InvalidAmount {
                amount: request.amount_cents.to_string(),
                reason: "minimum invoice amount is 1 KES".to_string(),
            },
        )));
    }

    let desc_len = request.description.chars().count();
    if !(3..=120).contains(&desc_len) {
        return Err(AppError::new(AppErrorKind::Validation(
            ValidationError::OutOfRange {
                field: "description".to_string(),
                message: "must be between 3 and 120 characters".to_string(),
            },
        )));
    }

    if let Some(name) = &request.customer_name {
        let len = name.chars().count();
        if !(2..=60).contains(&len) {
            return Err(AppError::new(AppErrorKind::Validation(
                ValidationError::OutOfRange {
                    field: "customer_name".to_string(),
                    message: "must be between 2 and 60 characters".to_string(),
                },
            )));
        }
    }

    Ok((customer, merchant))
}

/// POST /invoices
pub async fn create_invoice(
    State(state): State<Arc<AppState>>,
    Json(request): Json<InvoiceCreate>,
) -> AppResult<(StatusCode, Json<InvoiceResponse>)> {
    let (customer_msisdn, merchant_msisdn) = validate(&request)?;

    let suffix: String = Uuid::new_v4().simple().to_string()[..4].to_string();
    let invoice = state
        .store
        .insert_invoice(NewInvoice {
            id: format!("INV-{}-{}", Utc::now().timestamp(), suffix),
            customer_name: request.customer_name,
            customer_msisdn,
            merchant_msisdn,
            amount_cents: request.amount_cents,
            currency: "KES".to_string(),
            description: request.description,
        })
        .await?;

    info!(invoice_id = %invoice.id, amount_cents = invoice.amount_cents, "invoice created via API");
    Ok((StatusCode::CREATED, Json(invoice.into())))
}

/// GET /invoices/{id}
pub async fn get_invoice(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> AppResult<Json<InvoiceResponse>> {
    let invoice = state.store.find_invoice(&id).await?.ok_or_else(|| {
        AppError::new(AppErrorKind::Domain(DomainError::InvoiceNotFound {
            invoice_id: id.clone(),
        }))
    })?;
    Ok(Json(invoice.into()))
}

/// POST /invoices/{id}/cancel: explicit cancel, allowed while the invoice
/// has not reached a terminal state.
pub async fn cancel_invoice(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> AppResult<Json<InvoiceResponse>> {
    let cancelled = state
        .store
        .transition_invoice_status(
            &id,
            &[
                InvoiceStatus::Pending,
                InvoiceStatus::Sent,
                InvoiceStatus::Failed,
            ],
            InvoiceStatus::Cancelled,
            None,
        )
        .await?;

    match cancelled {
        Some(invoice) => {
            info!(invoice_id = %invoice.id, "invoice cancelled via API");
            Ok(Json(invoice.into()))
        }
        None => {
            // Either missing or already terminal; report which.
            let current = state.store.find_invoice(&id).await?;
            match current {
                Some(invoice) => Err(AppError::new(AppErrorKind::Domain(
                    DomainError::InvalidInvoiceStatus {
                        current: invoice.status.to_string(),
                    },
                ))),
                None => Err(AppError::new(AppErrorKind::Domain(
                    DomainError::InvoiceNotFound { invoice_id: id },
                ))),
            }
        }
    }
}

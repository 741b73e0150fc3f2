use async_trait::async_trait;
use sqlx::types::Json;
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

use crate::database::error::{DatabaseError, DatabaseErrorKind};
use crate::database::store::{NewPayment, Payment, PaymentStatus, PaymentStore};
use crate::payments::types::{CallbackSnapshot, RequestSnapshot};

const PAYMENT_COLUMNS: &str = "id, invoice_id, method, status, amount_cents, idempotency_key, \
     merchant_request_id, checkout_request_id, mpesa_receipt, retry_count, \
     raw_request, raw_callback, created_at, updated_at";

#[derive(Debug, FromRow)]
struct PaymentRow {
    id: Uuid,
    invoice_id: String,
    method: String,
    status: String,
    amount_cents: i64,
    idempotency_key: String,
    merchant_request_id: Option<String>,
    checkout_request_id: Option<String>,
    mpesa_receipt: Option<String>,
    retry_count: i32,
    raw_request: Option<Json<RequestSnapshot>>,
    raw_callback: Option<Json<CallbackSnapshot>>,
    created_at: chrono::DateTime<chrono::Utc>,
    updated_at: chrono::DateTime<chrono::Utc>,
}

impl TryFrom<PaymentRow> for Payment {
    type Error = DatabaseError;

    fn try_from(row: PaymentRow) -> Result<Self, Self::Error> {
        let status = PaymentStatus::from_db_status(&row.status).ok_or_else(|| {
            DatabaseError::new(DatabaseErrorKind::Unknown {
                message: format!("payment {} has unknown status {}", row.id, row.status),
            })
        })?;
        Ok(Payment {
            id: row.id,
            invoice_id: row.invoice_id,
            method: row.method,
            status,
            amount_cents: row.amount_cents,
            idempotency_key: row.idempotency_key,
            merchant_request_id: row.merchant_request_id,
            checkout_request_id: row.checkout_request_id,
            mpesa_receipt: row.mpesa_receipt,
            retry_count: row.retry_count,
            raw_request: row.raw_request.map(|j| j.0),
            raw_callback: row.raw_callback.map(|j| j.0),
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

/// Postgres-backed payment store. The `uq_payments_idempotency_key` unique
/// index is the store-level enforcement of at-most-one payment row per
/// logical key.
pub struct PaymentRepository {
    pool: PgPool,
}

impl PaymentRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn fetch_optional_by(
        &self,
        column: &str,
        value: &str,
    ) -> Result<Option<Payment>, DatabaseError> {
        let query =
            format!("SELECT {PAYMENT_COLUMNS} FROM payments WHERE {column} = $1 LIMIT 1");
        let row = sqlx::query_as::<_, PaymentRow>(&query)
            .bind(value)
            .fetch_optional(&self.pool)
            .await
            .map_err(DatabaseError::from_sqlx)?;
        row.map(Payment::try_from).transpose()
    }
}

#[async_trait]
impl PaymentStore for PaymentRepository {
    async fn insert_payment(&self, payment: NewPayment) -> Result<Payment, DatabaseError> {
        let query = format!(
            "INSERT INTO payments \
             (id, invoice_id, method, status, amount_cents, idempotency_key, retry_count) \
             VALUES ($1, $2, 'MPESA_STK', 'INITIATED', $3, $4, $5) \
             RETURNING {PAYMENT_COLUMNS}"
        );
        let row = sqlx::query_as::<_, PaymentRow>(&query)
            .bind(Uuid::new_v4())
            .bind(&payment.invoice_id)
            .bind(payment.amount_cents)
            .bind(&payment.idempotency_key)
            .bind(payment.retry_count)
            .fetch_one(&self.pool)
            .await
            .map_err(DatabaseError::from_sqlx)?;
        row.try_into()
    }

    async fn find_payment(&self, id: Uuid) -> Result<Option<Payment>, DatabaseError> {
        let query = format!("SELECT {PAYMENT_COLUMNS} FROM payments WHERE id = $1");
        let row = sqlx::query_as::<_, PaymentRow>(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(DatabaseError::from_sqlx)?;
        row.map(Payment::try_from).transpose()
    }

    async fn find_payment_by_idempotency_key(
        &self,
        key: &str,
    ) -> Result<Option<Payment>, DatabaseError> {
        self.fetch_optional_by("idempotency_key", key).await
    }

    async fn find_payment_by_checkout_id(
        &self,
        checkout_request_id: &str,
    ) -> Result<Option<Payment>, DatabaseError> {
        self.fetch_optional_by("checkout_request_id", checkout_request_id)
            .await
    }

    async fn latest_payment_for_invoice(
        &self,
        invoice_id: &str,
    ) -> Result<Option<Payment>, DatabaseError> {
        let query = format!(
            "SELECT {PAYMENT_COLUMNS} FROM payments \
             WHERE invoice_id = $1 \
             ORDER BY created_at DESC \
             LIMIT 1"
        );
        let row = sqlx::query_as::<_, PaymentRow>(&query)
            .bind(invoice_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(DatabaseError::from_sqlx)?;
        row.map(Payment::try_from).transpose()
    }

    async fn attach_provider_ids(
        &self,
        id: Uuid,
        merchant_request_id: &str,
        checkout_request_id: &str,
        snapshot: &RequestSnapshot,
    ) -> Result<Payment, DatabaseError> {
        let query = format!(
            "UPDATE payments \
             SET merchant_request_id = $2, checkout_request_id = $3, raw_request = $4, updated_at = NOW() \
             WHERE id = $1 \
             RETURNING {PAYMENT_COLUMNS}"
        );
        let row = sqlx::query_as::<_, PaymentRow>(&query)
            .bind(id)
            .bind(merchant_request_id)
            .bind(checkout_request_id)
            .bind(Json(snapshot))
            .fetch_optional(&self.pool)
            .await
            .map_err(DatabaseError::from_sqlx)?
            .ok_or_else(|| DatabaseError::not_found("Payment", &id.to_string()))?;
        row.try_into()
    }

    async fn mark_payment_failed(
        &self,
        id: Uuid,
        snapshot: &RequestSnapshot,
    ) -> Result<Payment, DatabaseError> {
        let query = format!(
            "UPDATE payments \
             SET status = 'FAILED', raw_request = $2, updated_at = NOW() \
             WHERE id = $1 \
             RETURNING {PAYMENT_COLUMNS}"
        );
        let row = sqlx::query_as::<_, PaymentRow>(&query)
            .bind(id)
            .bind(Json(snapshot))
            .fetch_optional(&self.pool)
            .await
            .map_err(DatabaseError::from_sqlx)?
            .ok_or_else(|| DatabaseError::not_found("Payment", &id.to_string()))?;
        row.try_into()
    }

    async fn complete_payment_if_initiated(
        &self,
        id: Uuid,
        to: PaymentStatus,
        mpesa_receipt: Option<&str>,
        callback: &CallbackSnapshot,
    ) -> Result<Option<Payment>, DatabaseError> {
        // Compare-and-set on status: a duplicate delivery racing this update
        // matches zero rows and is discarded by the caller.
        let query = format!(
            "UPDATE payments \
             SET status = $2, mpesa_receipt = COALESCE($3, mpesa_receipt), raw_callback = $4, updated_at = NOW() \
             WHERE id = $1 AND status = 'INITIATED' \
             RETURNING {PAYMENT_COLUMNS}"
        );
        let row = sqlx::query_as::<_, PaymentRow>(&query)
            .bind(id)
            .bind(to.as_str())
            .bind(mpesa_receipt)
            .bind(Json(callback))
            .fetch_optional(&self.pool)
            .await
            .map_err(DatabaseError::from_sqlx)?;
        row.map(Payment::try_from).transpose()
    }

    async fn increment_retry_count(&self, id: Uuid) -> Result<Payment, DatabaseError> {
        let query = format!(
            "UPDATE payments \
             SET retry_count = retry_count + 1, updated_at = NOW() \
             WHERE id = $1 \
             RETURNING {PAYMENT_COLUMNS}"
        );
        let row = sqlx::query_as::<_, PaymentRow>(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(DatabaseError::from_sqlx)?
            .ok_or_else(|| DatabaseError::not_found("Payment", &id.to_string()))?;
        row.try_into()
    }
}

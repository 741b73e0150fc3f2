//! Record store boundary.
//!
//! The payment and invoice store is the single shared mutable resource in the
//! system, so the invariants that protect money movement live here: the
//! unique constraint on `payments.idempotency_key` and the conditional
//! (compare-and-set) status updates. Services depend on these traits, not on
//! a concrete backend; Postgres repositories and the in-memory store both
//! implement them.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::database::error::DatabaseError;
use crate::payments::types::{CallbackSnapshot, RequestSnapshot};

// ============================================================================
// Entities
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InvoiceStatus {
    Pending,
    Sent,
    Paid,
    Cancelled,
    Failed,
}

impl InvoiceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvoiceStatus::Pending => "PENDING",
            InvoiceStatus::Sent => "SENT",
            InvoiceStatus::Paid => "PAID",
            InvoiceStatus::Cancelled => "CANCELLED",
            InvoiceStatus::Failed => "FAILED",
        }
    }

    pub fn from_db_status(status: &str) -> Option<Self> {
        match status {
            "PENDING" => Some(InvoiceStatus::Pending),
            "SENT" => Some(InvoiceStatus::Sent),
            "PAID" => Some(InvoiceStatus::Paid),
            "CANCELLED" => Some(InvoiceStatus::Cancelled),
            "FAILED" => Some(InvoiceStatus::Failed),
            _ => None,
        }
    }

    /// PAID and CANCELLED never transition again. FAILED is terminal for the
    /// conversational flow but may be reopened to PENDING by an approved
    /// retry.
    pub fn is_terminal(&self) -> bool {
        matches!(self, InvoiceStatus::Paid | InvoiceStatus::Cancelled)
    }
}

impl std::fmt::Display for InvoiceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentStatus {
    Initiated,
    Success,
    Failed,
    Expired,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Initiated => "INITIATED",
            PaymentStatus::Success => "SUCCESS",
            PaymentStatus::Failed => "FAILED",
            PaymentStatus::Expired => "EXPIRED",
        }
    }

    pub fn from_db_status(status: &str) -> Option<Self> {
        match status {
            "INITIATED" => Some(PaymentStatus::Initiated),
            "SUCCESS" => Some(PaymentStatus::Success),
            "FAILED" => Some(PaymentStatus::Failed),
            "EXPIRED" => Some(PaymentStatus::Expired),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, PaymentStatus::Initiated)
    }
}

impl std::fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Invoice {
    pub id: String,
    pub customer_name: Option<String>,
    pub customer_msisdn: String,
    pub merchant_msisdn: String,
    pub amount_cents: i64,
    pub currency: String,
    pub description: String,
    pub status: InvoiceStatus,
    pub pay_ref: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Payment {
    pub id: Uuid,
    pub invoice_id: String,
    pub method: String,
    pub status: PaymentStatus,
    pub amount_cents: i64,
    pub idempotency_key: String,
    pub merchant_request_id: Option<String>,
    pub checkout_request_id: Option<String>,
    pub mpesa_receipt: Option<String>,
    pub retry_count: i32,
    pub raw_request: Option<RequestSnapshot>,
    pub raw_callback: Option<CallbackSnapshot>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Fields supplied by the caller when a payment row is created. The store
/// assigns id and timestamps and enforces idempotency-key uniqueness.
/// `retry_count` carries the cumulative attempt count for the invoice: 0 on
/// a first attempt, the incremented count on an approved retry, so the
/// newest payment row is always authoritative for the retry policy.
#[derive(Debug, Clone)]
pub struct NewPayment {
    pub invoice_id: String,
    pub amount_cents: i64,
    pub idempotency_key: String,
    pub retry_count: i32,
}

#[derive(Debug, Clone)]
pub struct NewInvoice {
    pub id: String,
    pub customer_name: Option<String>,
    pub customer_msisdn: String,
    pub merchant_msisdn: String,
    pub amount_cents: i64,
    pub currency: String,
    pub description: String,
}

/// Audit row for chat traffic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageLogEntry {
    pub invoice_id: Option<String>,
    pub channel: String,
    pub direction: String,
    pub event: String,
    pub payload: serde_json::Value,
}

// ============================================================================
// Store traits
// ============================================================================

#[async_trait]
pub trait InvoiceStore: Send + Sync {
    async fn insert_invoice(&self, invoice: NewInvoice) -> Result<Invoice, DatabaseError>;

    async fn find_invoice(&self, id: &str) -> Result<Option<Invoice>, DatabaseError>;

    /// Atomic conditional status update: applies only when the current status
    /// is one of `expected`. Returns the updated row, or `None` when the
    /// precondition no longer holds (somebody else won the race).
    async fn transition_invoice_status(
        &self,
        id: &str,
        expected: &[InvoiceStatus],
        to: InvoiceStatus,
        pay_ref: Option<&str>,
    ) -> Result<Option<Invoice>, DatabaseError>;
}

#[async_trait]
pub trait PaymentStore: Send + Sync {
    /// Insert a fresh INITIATED payment. A duplicate idempotency key surfaces
    /// as `DatabaseErrorKind::UniqueViolation`; the caller re-reads the
    /// winner's row instead of erroring.
    async fn insert_payment(&self, payment: NewPayment) -> Result<Payment, DatabaseError>;

    async fn find_payment(&self, id: Uuid) -> Result<Option<Payment>, DatabaseError>;

    async fn find_payment_by_idempotency_key(
        &self,
        key: &str,
    ) -> Result<Option<Payment>, DatabaseError>;

    async fn find_payment_by_checkout_id(
        &self,
        checkout_request_id: &str,
    ) -> Result<Option<Payment>, DatabaseError>;

    /// Most recently created payment for an invoice, used by the retry path.
    async fn latest_payment_for_invoice(
        &self,
        invoice_id: &str,
    ) -> Result<Option<Payment>, DatabaseError>;

    /// Record the provider correlation ids and the request snapshot after a
    /// successful push.
    async fn attach_provider_ids(
        &self,
        id: Uuid,
        merchant_request_id: &str,
        checkout_request_id: &str,
        snapshot: &RequestSnapshot,
    ) -> Result<Payment, DatabaseError>;

    /// Synchronous failure on the initiation path: the push never started, so
    /// only the payment moves to FAILED.
    async fn mark_payment_failed(
        &self,
        id: Uuid,
        snapshot: &RequestSnapshot,
    ) -> Result<Payment, DatabaseError>;

    /// Terminal transition, applied only while the payment is still
    /// INITIATED (compare-and-set on status). Returns `None` when the
    /// payment was already terminal: the idempotent-consumer guard against
    /// duplicate provider deliveries.
    async fn complete_payment_if_initiated(
        &self,
        id: Uuid,
        to: PaymentStatus,
        mpesa_receipt: Option<&str>,
        callback: &CallbackSnapshot,
    ) -> Result<Option<Payment>, DatabaseError>;

    async fn increment_retry_count(&self, id: Uuid) -> Result<Payment, DatabaseError>;
}

#[async_trait]
pub trait MessageLogStore: Send + Sync {
    async fn log_message(&self, entry: MessageLogEntry) -> Result<(), DatabaseError>;
}

/// Convenience super-trait: the full record store a service depends on.
pub trait RecordStore: InvoiceStore + PaymentStore + MessageLogStore {}

impl<T: InvoiceStore + PaymentStore + MessageLogStore> RecordStore for T {}

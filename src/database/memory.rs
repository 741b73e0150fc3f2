//! In-memory record store.
//!
//! Implements the same uniqueness and compare-and-set semantics as the
//! Postgres repositories. Used by the test suite and by local runs without a
//! database (SKIP_EXTERNALS).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::database::error::DatabaseError;
use crate::database::store::{
    Invoice, InvoiceStatus, InvoiceStore, MessageLogEntry, MessageLogStore, NewInvoice,
    NewPayment, Payment, PaymentStatus, PaymentStore,
};
use crate::payments::types::{CallbackSnapshot, RequestSnapshot};

#[derive(Default)]
struct Inner {
    invoices: HashMap<String, Invoice>,
    payments: HashMap<Uuid, Payment>,
    messages: Vec<MessageLogEntry>,
}

#[derive(Default)]
pub struct MemoryStore {
    // A single mutex stands in for the database's transactional guarantees:
    // every operation observes and mutates a consistent snapshot.
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Test/observability hook: number of audit rows recorded.
    pub async fn message_count(&self) -> usize {
        self.inner.lock().await.messages.len()
    }
}

fn touch(updated_at: &mut DateTime<Utc>) {
    *updated_at = Utc::now();
}

#[async_trait]
impl InvoiceStore for MemoryStore {
    async fn insert_invoice(&self, invoice: NewInvoice) -> Result<Invoice, DatabaseError> {
        let mut inner = self.inner.lock().await;
        if inner.invoices.contains_key(&invoice.id) {
            return Err(DatabaseError::unique_violation("invoices_pkey"));
        }
        let now = Utc::now();
        let row = Invoice {
            id: invoice.id.clone(),
            customer_name: invoice.customer_name,
            customer_msisdn: invoice.customer_msisdn,
            merchant_msisdn: invoice.merchant_msisdn,
            amount_cents: invoice.amount_cents,
            currency: invoice.currency,
            description: invoice.description,
            status: InvoiceStatus::Pending,
            pay_ref: None,
            created_at: now,
            updated_at: now,
        };
        inner.invoices.insert(invoice.id, row.clone());
        Ok(row)
    }

    async fn find_invoice(&self, id: &str) -> Result<Option<Invoice>, DatabaseError> {
        Ok(self.inner.lock().await.invoices.get(id).cloned())
    }

    async fn transition_invoice_status(
        &self,
        id: &str,
        expected: &[InvoiceStatus],
        to: InvoiceStatus,
        pay_ref: Option<&str>,
    ) -> Result<Option<Invoice>, DatabaseError> {
        let mut inner = self.inner.lock().await;
        let Some(invoice) = inner.invoices.get_mut(id) else {
            return Ok(None);
        };
        if !expected.contains(&invoice.status) {
            return Ok(None);
        }
        invoice.status = to;
        if let Some(pay_ref) = pay_ref {
            invoice.pay_ref = Some(pay_ref.to_string());
        }
        touch(&mut invoice.updated_at);
        Ok(Some(invoice.clone()))
    }
}

#[async_trait]
impl PaymentStore for MemoryStore {
    async fn insert_payment(&self, payment: NewPayment) -> Result<Payment, DatabaseError> {
        let mut inner = self.inner.lock().await;
        if inner
            .payments
            .values()
            .any(|p| p.idempotency_key == payment.idempotency_key)
        {
            return Err(DatabaseError::unique_violation(
                "uq_payments_idempotency_key",
            ));
        }
        let now = Utc::now();
        let row = Payment {
            id: Uuid::new_v4(),
            invoice_id: payment.invoice_id,
            method: "MPESA_STK".to_string(),
            status: PaymentStatus::Initiated,
            amount_cents: payment.amount_cents,
            idempotency_key: payment.idempotency_key,
            merchant_request_id: None,
            checkout_request_id: None,
            mpesa_receipt: None,
            retry_count: payment.retry_count,
            raw_request: None,
            raw_callback: None,
            created_at: now,
            updated_at: now,
        };
        inner.payments.insert(row.id, row.clone());
        Ok(row)
    }

    async fn find_payment(&self, id: Uuid) -> Result<Option<Payment>, DatabaseError> {
        Ok(self.inner.lock().await.payments.get(&id).cloned())
    }

    async fn find_payment_by_idempotency_key(
        &self,
        key: &str,
    ) -> Result<Option<Payment>, DatabaseError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .payments
            .values()
            .find(|p| p.idempotency_key == key)
            .cloned())
    }

    async fn find_payment_by_checkout_id(
        &self,
        checkout_request_id: &str,
    ) -> Result<Option<Payment>, DatabaseError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .payments
            .values()
            .find(|p| p.checkout_request_id.as_deref() == Some(checkout_request_id))
            .cloned())
    }

    async fn latest_payment_for_invoice(
        &self,
        invoice_id: &str,
    ) -> Result<Option<Payment>, DatabaseError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .payments
            .values()
            .filter(|p| p.invoice_id == invoice_id)
            .max_by_key(|p| p.created_at)
            .cloned())
    }

    async fn attach_provider_ids(
        &self,
        id: Uuid,
        merchant_request_id: &str,
        checkout_request_id: &str,
        snapshot: &RequestSnapshot,
    ) -> Result<Payment, DatabaseError> {
        let mut inner = self.inner.lock().await;
        let payment = inner
            .payments
            .get_mut(&id)
            .ok_or_else(|| DatabaseError::not_found("Payment", &id.to_string()))?;
        payment.merchant_request_id = Some(merchant_request_id.to_string());
        payment.checkout_request_id = Some(checkout_request_id.to_string());
        payment.raw_request = Some(snapshot.clone());
        touch(&mut payment.updated_at);
        Ok(payment.clone())
    }

    async fn mark_payment_failed(
        &self,
        id: Uuid,
        snapshot: &RequestSnapshot,
    ) -> Result<Payment, DatabaseError> {
        let mut inner = self.inner.lock().await;
        let payment = inner
            .payments
            .get_mut(&id)
            .ok_or_else(|| DatabaseError::not_found("Payment", &id.to_string()))?;
        payment.status = PaymentStatus::Failed;
        payment.raw_request = Some(snapshot.clone());
        touch(&mut payment.updated_at);
        Ok(payment.clone())
    }

    async fn complete_payment_if_initiated(
        &self,
        id: Uuid,
        to: PaymentStatus,
        mpesa_receipt: Option<&str>,
        callback: &CallbackSnapshot,
    ) -> Result<Option<Payment>, DatabaseError> {
        let mut inner = self.inner.lock().await;
        let Some(payment) = inner.payments.get_mut(&id) else {
            return Ok(None);
        };
        if payment.status != PaymentStatus::Initiated {
            return Ok(None);
        }
        payment.status = to;
        payment.mpesa_receipt = mpesa_receipt.map(|r| r.to_string());
        payment.raw_callback = Some(callback.clone());
        touch(&mut payment.updated_at);
        Ok(Some(payment.clone()))
    }

    async fn increment_retry_count(&self, id: Uuid) -> Result<Payment, DatabaseError> {
        let mut inner = self.inner.lock().await;
        let payment = inner
            .payments
            .get_mut(&id)
            .ok_or_else(|| DatabaseError::not_found("Payment", &id.to_string()))?;
        payment.retry_count += 1;
        touch(&mut payment.updated_at);
        Ok(payment.clone())
    }
}

#[async_trait]
impl MessageLogStore for MemoryStore {
    async fn log_message(&self, entry: MessageLogEntry) -> Result<(), DatabaseError> {
        self.inner.lock().await.messages.push(entry);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn invoice(id: &str) -> NewInvoice {
        NewInvoice {
            id: id.to_string(),
            customer_name: Some("Jane".to_string()),
            customer_msisdn: "254712345678".to_string(),
            merchant_msisdn: "254700000001".to_string(),
            amount_cents: 10_000,
            currency: "KES".to_string(),
            description: "House cleaning".to_string(),
        }
    }

    #[tokio::test]
    async fn duplicate_idempotency_key_is_rejected() {
        let store = MemoryStore::new();
        store.insert_invoice(invoice("INV-1")).await.unwrap();
        store
            .insert_payment(NewPayment {
                invoice_id: "INV-1".to_string(),
                amount_cents: 10_000,
                idempotency_key: "K1".to_string(),
                retry_count: 0,
            })
            .await
            .expect("first insert should succeed");

        let err = store
            .insert_payment(NewPayment {
                invoice_id: "INV-1".to_string(),
                amount_cents: 10_000,
                idempotency_key: "K1".to_string(),
                retry_count: 0,
            })
            .await
            .expect_err("second insert should violate uniqueness");
        assert!(err.is_unique_violation());
    }

    #[tokio::test]
    async fn conditional_invoice_update_only_applies_on_expected_status() {
        let store = MemoryStore::new();
        store.insert_invoice(invoice("INV-1")).await.unwrap();

        let updated = store
            .transition_invoice_status(
                "INV-1",
                &[InvoiceStatus::Pending],
                InvoiceStatus::Sent,
                None,
            )
            .await
            .unwrap();
        assert_eq!(updated.unwrap().status, InvoiceStatus::Sent);

        // Precondition no longer holds.
        let second = store
            .transition_invoice_status(
                "INV-1",
                &[InvoiceStatus::Pending],
                InvoiceStatus::Sent,
                None,
            )
            .await
            .unwrap();
        assert!(second.is_none());
    }

    #[tokio::test]
    async fn terminal_payment_transition_is_applied_at_most_once() {
        let store = MemoryStore::new();
        store.insert_invoice(invoice("INV-1")).await.unwrap();
        let payment = store
            .insert_payment(NewPayment {
                invoice_id: "INV-1".to_string(),
                amount_cents: 10_000,
                idempotency_key: "K1".to_string(),
                retry_count: 0,
            })
            .await
            .unwrap();

        let callback = CallbackSnapshot::StkResult {
            merchant_request_id: None,
            checkout_request_id: "C1".to_string(),
            result_code: 0,
            result_desc: None,
            mpesa_receipt: Some("R1".to_string()),
            transaction_date: None,
            phone_number: None,
        };

        let first = store
            .complete_payment_if_initiated(payment.id, PaymentStatus::Success, Some("R1"), &callback)
            .await
            .unwrap();
        assert_eq!(first.unwrap().status, PaymentStatus::Success);

        let second = store
            .complete_payment_if_initiated(
                payment.id,
                PaymentStatus::Failed,
                None,
                &callback,
            )
            .await
            .unwrap();
        assert!(second.is_none(), "SUCCESS must be irreversible");

        let reread = store.find_payment(payment.id).await.unwrap().unwrap();
        assert_eq!(reread.status, PaymentStatus::Success);
        assert_eq!(reread.mpesa_receipt.as_deref(), Some("R1"));
    }

    #[tokio::test]
    async fn latest_payment_prefers_most_recent_row() {
        let store = MemoryStore::new();
        store.insert_invoice(invoice("INV-1")).await.unwrap();
        store
            .insert_payment(NewPayment {
                invoice_id: "INV-1".to_string(),
                amount_cents: 10_000,
                idempotency_key: "K1".to_string(),
                retry_count: 0,
            })
            .await
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let second = store
            .insert_payment(NewPayment {
                invoice_id: "INV-1".to_string(),
                amount_cents: 10_000,
                idempotency_key: "K2".to_string(),
                retry_count: 0,
            })
            .await
            .unwrap();

        let latest = store
            .latest_payment_for_invoice("INV-1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(latest.id, second.id);
    }
}

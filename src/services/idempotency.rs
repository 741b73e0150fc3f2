//! Idempotency guard for payment initiation.

use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::database::error::DatabaseError;
use crate::database::store::{Payment, RecordStore};

/// Generate a UUID-based idempotency key for callers that do not supply one
/// (e.g. the chat pay-button path generates one per click batch).
pub fn generate_idempotency_key() -> String {
    Uuid::new_v4().to_string()
}

/// Deduplicates payment-initiation requests by a caller-supplied key.
pub struct IdempotencyGuard {
    store: Arc<dyn RecordStore>,
}

impl IdempotencyGuard {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self { store }
    }

    /// Look up any payment already recorded against `key`. A hit is the
    /// canonical result: the caller must return it and must not re-issue a
    /// provider call. A miss clears the caller to insert a new row carrying
    /// the key; the store's unique constraint settles concurrent races.
    pub async fn reserve(&self, key: &str) -> Result<Option<Payment>, DatabaseError> {
        let existing = self.store.find_payment_by_idempotency_key(key).await?;
        match &existing {
            Some(payment) => {
                info!(
                    idempotency_key = %key,
                    payment_id = %payment.id,
                    status = %payment.status,
                    "idempotency key already reserved, returning prior payment"
                );
            }
            None => {
                debug!(idempotency_key = %key, "idempotency key is unique");
            }
        }
        Ok(existing)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::memory::MemoryStore;
    use crate::database::store::{InvoiceStore, NewInvoice, NewPayment, PaymentStore};

    async fn seeded_store() -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        store
            .insert_invoice(NewInvoice {
                id: "INV-1".to_string(),
                customer_name: None,
                customer_msisdn: "254712345678".to_string(),
                merchant_msisdn: "254700000001".to_string(),
                amount_cents: 10_000,
                currency: "KES".to_string(),
                description: "Deep clean".to_string(),
            })
            .await
            .unwrap();
        store
    }

    #[tokio::test]
    async fn reserve_returns_none_for_fresh_key() {
        let store = seeded_store().await;
        let guard = IdempotencyGuard::new(store);
        assert!(guard.reserve("K-fresh").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn reserve_returns_existing_payment_unconditionally() {
        let store = seeded_store().await;
        let created = store
            .insert_payment(NewPayment {
                invoice_id: "INV-1".to_string(),
                amount_cents: 10_000,
                idempotency_key: "K1".to_string(),
                retry_count: 0,
            })
            .await
            .unwrap();

        let guard = IdempotencyGuard::new(store);
        let reserved = guard.reserve("K1").await.unwrap().expect("should hit");
        assert_eq!(reserved.id, created.id);
    }

    #[test]
    fn generated_keys_are_unique() {
        let a = generate_idempotency_key();
        let b = generate_idempotency_key();
        assert_ne!(a, b);
        assert_eq!(a.len(), 36);
    }
}

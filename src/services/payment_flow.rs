//! Payment state machine.
//!
//! Owns the authoritative status of a payment and of its parent invoice.
//! Consumes initiation requests from the API/chat layer and terminal
//! outcomes from the callback reconciler. Payment states:
//! `INITIATED → {SUCCESS, FAILED, EXPIRED}`, SUCCESS terminal and
//! irreversible.

use chrono::Utc;
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::database::error::DatabaseError;
use crate::database::store::{
    Invoice, InvoiceStatus, NewPayment, Payment, PaymentStatus, RecordStore,
};
use crate::payments::error::GatewayError;
use crate::payments::gateway::PaymentGateway;
use crate::payments::types::{RequestSnapshot, StkCallback, StkPushRequest};
use crate::services::idempotency::IdempotencyGuard;
use crate::services::notification::{failure_reason, ReceiptDispatcher};
use crate::services::retry_policy::{RetryDecision, RetryPolicy};

/// Daraja result code for an STK prompt the payer never answered.
const RESULT_CODE_TIMEOUT: i64 = 1037;

#[derive(Debug, Error)]
pub enum PaymentFlowError {
    #[error("Invoice not found: {invoice_id}")]
    InvoiceNotFound { invoice_id: String },

    #[error("No payment record found for invoice {invoice_id}")]
    PaymentNotFound { invoice_id: String },

    #[error("Invoice status must be SENT or FAILED (current: {current})")]
    InvalidInvoiceStatus { current: InvoiceStatus },

    #[error("Payment retry denied: {reason}")]
    RetryDenied { reason: String },

    #[error("Failed to initiate payment: {0}")]
    Gateway(#[from] GatewayError),

    #[error("Store error: {0}")]
    Database(#[from] DatabaseError),
}

impl PaymentFlowError {
    /// Plain-language message safe to show a chat user.
    pub fn user_message(&self) -> String {
        match self {
            PaymentFlowError::InvoiceNotFound { .. } => "Invoice not found.".to_string(),
            PaymentFlowError::PaymentNotFound { .. } => {
                "Payment record not found. Please contact support.".to_string()
            }
            PaymentFlowError::InvalidInvoiceStatus { current } => match current {
                InvoiceStatus::Paid => "This invoice has already been paid.".to_string(),
                InvoiceStatus::Cancelled => "This invoice was cancelled.".to_string(),
                _ => "This invoice is not ready for payment.".to_string(),
            },
            PaymentFlowError::RetryDenied { reason } => reason.clone(),
            PaymentFlowError::Gateway(e) => e.user_message(),
            PaymentFlowError::Database(_) => {
                "Something went wrong on our side. Please try again later.".to_string()
            }
        }
    }
}

/// Result of feeding a provider callback through `complete`.
#[derive(Debug)]
pub enum CompletionOutcome {
    /// The terminal transition was applied by this call.
    Completed {
        payment: Payment,
        invoice: Option<Invoice>,
    },
    /// The payment was already terminal; the duplicate delivery was
    /// discarded.
    AlreadyProcessed { checkout_request_id: String },
    /// No local payment matches the checkout id; acknowledged, nothing
    /// mutated.
    UnknownCheckout { checkout_request_id: String },
}

pub struct PaymentFlow {
    store: Arc<dyn RecordStore>,
    gateway: Arc<dyn PaymentGateway>,
    guard: IdempotencyGuard,
    retry_policy: RetryPolicy,
    receipts: Arc<dyn ReceiptDispatcher>,
}

fn amount_kes(amount_cents: i64) -> i64 {
    // STK push takes whole KES; round half-up from minor units.
    (amount_cents + 50) / 100
}

fn truncate(value: &str, max: usize) -> String {
    value.chars().take(max).collect()
}

impl PaymentFlow {
    pub fn new(
        store: Arc<dyn RecordStore>,
        gateway: Arc<dyn PaymentGateway>,
        retry_policy: RetryPolicy,
        receipts: Arc<dyn ReceiptDispatcher>,
    ) -> Self {
        Self {
            guard: IdempotencyGuard::new(store.clone()),
            store,
            gateway,
            retry_policy,
            receipts,
        }
    }

    /// Initiate a push payment for an invoice.
    ///
    /// The idempotency guard short-circuits duplicates before anything else
    /// runs: a prior payment under the same key is the canonical result and
    /// no second provider call is made. A FAILED invoice re-enters through
    /// the retry gate, which increments the single retry counter and reopens
    /// the invoice to PENDING before the push.
    pub async fn initiate(
        &self,
        invoice_id: &str,
        idempotency_key: &str,
    ) -> Result<Payment, PaymentFlowError> {
        if let Some(existing) = self.guard.reserve(idempotency_key).await? {
            return Ok(existing);
        }

        let invoice = self
            .store
            .find_invoice(invoice_id)
            .await?
            .ok_or_else(|| PaymentFlowError::InvoiceNotFound {
                invoice_id: invoice_id.to_string(),
            })?;

        let retry_count = match invoice.status {
            InvoiceStatus::Sent => 0,
            InvoiceStatus::Failed => self.approve_retry(&invoice).await?,
            current => {
                warn!(
                    invoice_id = %invoice.id,
                    status = %current,
                    "invalid invoice status for payment initiation"
                );
                return Err(PaymentFlowError::InvalidInvoiceStatus { current });
            }
        };

        let payment = match self
            .store
            .insert_payment(NewPayment {
                invoice_id: invoice.id.clone(),
                amount_cents: invoice.amount_cents,
                idempotency_key: idempotency_key.to_string(),
                retry_count,
            })
            .await
        {
            Ok(payment) => payment,
            Err(e) if e.is_unique_violation() => {
                // Lost the insert race: the winner's row is the canonical
                // result for this key.
                info!(
                    idempotency_key = %idempotency_key,
                    "concurrent duplicate initiation, returning winner's payment"
                );
                return self
                    .store
                    .find_payment_by_idempotency_key(idempotency_key)
                    .await?
                    .ok_or(PaymentFlowError::Database(e));
            }
            Err(e) => return Err(e.into()),
        };

        info!(
            payment_id = %payment.id,
            invoice_id = %invoice.id,
            amount_cents = invoice.amount_cents,
            "payment record created, initiating STK push"
        );

        let request = StkPushRequest {
            phone_number: invoice.customer_msisdn.clone(),
            amount_kes: amount_kes(invoice.amount_cents),
            account_reference: truncate(&invoice.id, 20),
            transaction_desc: truncate(&invoice.description, 20),
        };

        match self.gateway.push_payment(request.clone()).await {
            Ok(response) => {
                let snapshot = RequestSnapshot::StkPush {
                    phone_number: request.phone_number,
                    amount_kes: request.amount_kes,
                    account_reference: request.account_reference,
                    transaction_desc: request.transaction_desc,
                    merchant_request_id: response.merchant_request_id.clone(),
                    checkout_request_id: response.checkout_request_id.clone(),
                };
                let payment = self
                    .store
                    .attach_provider_ids(
                        payment.id,
                        &response.merchant_request_id,
                        &response.checkout_request_id,
                        &snapshot,
                    )
                    .await?;
                info!(
                    payment_id = %payment.id,
                    checkout_request_id = %response.checkout_request_id,
                    "STK push initiated"
                );
                Ok(payment)
            }
            Err(e) => {
                // The push never started: the payment fails synchronously and
                // the invoice is left untouched so the attempt can be
                // retried under policy.
                let snapshot = RequestSnapshot::StkPushError {
                    phone_number: request.phone_number,
                    amount_kes: request.amount_kes,
                    account_reference: request.account_reference,
                    error: e.to_string(),
                };
                if let Err(store_err) =
                    self.store.mark_payment_failed(payment.id, &snapshot).await
                {
                    error!(
                        payment_id = %payment.id,
                        error = %store_err,
                        "failed to record gateway failure on payment"
                    );
                }
                error!(
                    payment_id = %payment.id,
                    invoice_id = %invoice.id,
                    error = %e,
                    "STK push initiation failed"
                );
                Err(e.into())
            }
        }
    }

    /// Retry gate for a FAILED invoice. On approval the single retry counter
    /// is incremented and the invoice is reopened to PENDING. Returns the
    /// cumulative attempt count the replacement payment row must carry so
    /// the newest row stays authoritative for the next evaluation.
    async fn approve_retry(&self, invoice: &Invoice) -> Result<i32, PaymentFlowError> {
        let payment = self
            .store
            .latest_payment_for_invoice(&invoice.id)
            .await?
            .ok_or_else(|| PaymentFlowError::PaymentNotFound {
                invoice_id: invoice.id.clone(),
            })?;

        let decision = self.retry_policy.evaluate(&payment, Utc::now());
        if let Some(reason) = decision.denial_reason() {
            return Err(PaymentFlowError::RetryDenied { reason });
        }
        debug_assert!(matches!(decision, RetryDecision::Allowed));

        let bumped = self.store.increment_retry_count(payment.id).await?;
        let reopened = self
            .store
            .transition_invoice_status(
                &invoice.id,
                &[InvoiceStatus::Failed],
                InvoiceStatus::Pending,
                None,
            )
            .await?;
        if reopened.is_none() {
            // Somebody else changed the invoice while we deliberated.
            let current = self
                .store
                .find_invoice(&invoice.id)
                .await?
                .map(|i| i.status)
                .unwrap_or(InvoiceStatus::Failed);
            return Err(PaymentFlowError::InvalidInvoiceStatus { current });
        }

        info!(
            invoice_id = %invoice.id,
            payment_id = %payment.id,
            retry_count = bumped.retry_count,
            "payment retry approved, invoice reopened to PENDING"
        );
        Ok(bumped.retry_count)
    }

    /// Apply a provider callback outcome. Invoked only by the callback
    /// reconciler.
    ///
    /// The terminal transition is a compare-and-set on INITIATED, so a
    /// duplicate delivery racing this call loses the CAS and is discarded.
    /// Receipt dispatch is bound to the winning transition: exactly one
    /// dispatch per successful completion, never more.
    pub async fn complete(
        &self,
        callback: &StkCallback,
    ) -> Result<CompletionOutcome, PaymentFlowError> {
        let checkout_id = callback.checkout_request_id.as_str();
        let Some(payment) = self.store.find_payment_by_checkout_id(checkout_id).await? else {
            warn!(
                checkout_request_id = %checkout_id,
                "callback references unknown payment, discarding"
            );
            return Ok(CompletionOutcome::UnknownCheckout {
                checkout_request_id: checkout_id.to_string(),
            });
        };

        if payment.status.is_terminal() {
            info!(
                checkout_request_id = %checkout_id,
                payment_id = %payment.id,
                status = %payment.status,
                "duplicate callback for terminal payment, discarding"
            );
            return Ok(CompletionOutcome::AlreadyProcessed {
                checkout_request_id: checkout_id.to_string(),
            });
        }

        let target = if callback.is_success() {
            PaymentStatus::Success
        } else if callback.result_code == RESULT_CODE_TIMEOUT {
            PaymentStatus::Expired
        } else {
            PaymentStatus::Failed
        };

        let snapshot = callback.snapshot();
        let Some(payment) = self
            .store
            .complete_payment_if_initiated(
                payment.id,
                target,
                callback.mpesa_receipt.as_deref(),
                &snapshot,
            )
            .await?
        else {
            // Lost the race against a concurrent duplicate delivery.
            info!(
                checkout_request_id = %checkout_id,
                "terminal transition already applied by a concurrent delivery"
            );
            return Ok(CompletionOutcome::AlreadyProcessed {
                checkout_request_id: checkout_id.to_string(),
            });
        };

        let invoice = if callback.is_success() {
            let invoice = self
                .store
                .transition_invoice_status(
                    &payment.invoice_id,
                    &[
                        InvoiceStatus::Pending,
                        InvoiceStatus::Sent,
                        InvoiceStatus::Failed,
                    ],
                    InvoiceStatus::Paid,
                    callback.mpesa_receipt.as_deref(),
                )
                .await?;
            match &invoice {
                Some(invoice) => {
                    info!(
                        payment_id = %payment.id,
                        invoice_id = %invoice.id,
                        mpesa_receipt = callback.mpesa_receipt.as_deref().unwrap_or("N/A"),
                        "payment successful, invoice PAID"
                    );
                    self.receipts.payment_succeeded(invoice, &payment).await;
                }
                None => {
                    error!(
                        payment_id = %payment.id,
                        invoice_id = %payment.invoice_id,
                        "payment succeeded but invoice could not be promoted"
                    );
                }
            }
            invoice
        } else {
            let invoice = self
                .store
                .transition_invoice_status(
                    &payment.invoice_id,
                    &[InvoiceStatus::Pending, InvoiceStatus::Sent],
                    InvoiceStatus::Failed,
                    None,
                )
                .await?;
            let reason = failure_reason(callback.result_code);
            info!(
                payment_id = %payment.id,
                invoice_id = %payment.invoice_id,
                result_code = callback.result_code,
                reason = %reason,
                "payment failed"
            );
            if let Some(invoice) = &invoice {
                self.receipts.payment_failed(invoice, &payment, &reason).await;
            }
            invoice
        };

        Ok(CompletionOutcome::Completed { payment, invoice })
    }
}

//! Receipt and failure-notice dispatch.
//!
//! The payment state machine calls this boundary exactly once per terminal
//! transition; delivery failures are logged and never bubble back into the
//! payment lifecycle.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{error, info};

use crate::chat::ChatTransport;
use crate::database::store::{Invoice, Payment};

#[async_trait]
pub trait ReceiptDispatcher: Send + Sync {
    /// Payment confirmed by the provider: send receipts to customer and
    /// merchant.
    async fn payment_succeeded(&self, invoice: &Invoice, payment: &Payment);

    /// Payment ended in failure: notify both parties with a readable reason.
    async fn payment_failed(&self, invoice: &Invoice, payment: &Payment, reason: &str);
}

/// Human-readable rendering of Daraja result codes.
pub fn failure_reason(result_code: i64) -> String {
    match result_code {
        1 => "Insufficient balance".to_string(),
        1032 => "Cancelled by user".to_string(),
        1037 => "Timeout - user did not respond".to_string(),
        2001 => "Invalid phone number".to_string(),
        code => format!("Payment failed (code {})", code),
    }
}

fn format_kes(amount_cents: i64) -> String {
    format!("KES {}.{:02}", amount_cents / 100, amount_cents % 100)
}

pub struct NotificationService {
    transport: Arc<dyn ChatTransport>,
}

impl NotificationService {
    pub fn new(transport: Arc<dyn ChatTransport>) -> Self {
        Self { transport }
    }

    async fn send_logged(&self, to: &str, text: &str, context: &str) {
        if let Err(e) = self.transport.send(to, text).await {
            error!(to = %to, context = %context, error = %e, "failed to send notification");
        }
    }
}

#[async_trait]
impl ReceiptDispatcher for NotificationService {
    async fn payment_succeeded(&self, invoice: &Invoice, payment: &Payment) {
        let receipt = payment.mpesa_receipt.as_deref().unwrap_or("N/A");
        let amount = format_kes(invoice.amount_cents);

        let customer_message = format!(
            "Payment received! ✅\n\nInvoice: {}\nAmount: {}\nM-PESA Receipt: {}\n\nThank you for your payment.",
            invoice.id, amount, receipt
        );
        self.send_logged(&invoice.customer_msisdn, &customer_message, "customer receipt")
            .await;

        let merchant_message = format!(
            "Payment received for invoice {}\nCustomer: {}\nAmount: {}\nM-PESA Receipt: {}",
            invoice.id, invoice.customer_msisdn, amount, receipt
        );
        self.send_logged(&invoice.merchant_msisdn, &merchant_message, "merchant receipt")
            .await;

        info!(
            invoice_id = %invoice.id,
            payment_id = %payment.id,
            "receipts dispatched"
        );
    }

    async fn payment_failed(&self, invoice: &Invoice, _payment: &Payment, reason: &str) {
        let merchant_message = format!(
            "Payment failed for invoice {}\nCustomer: {}\nReason: {}",
            invoice.id, invoice.customer_msisdn, reason
        );
        self.send_logged(&invoice.merchant_msisdn, &merchant_message, "merchant failure notice")
            .await;

        let customer_message = format!(
            "Payment for invoice {} was not completed.\nReason: {}\nYou can try again by tapping the Pay button in the invoice message.",
            invoice.id, reason
        );
        self.send_logged(&invoice.customer_msisdn, &customer_message, "customer failure notice")
            .await;
    }
}

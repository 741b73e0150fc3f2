//! Inbound chat routing.
//!
//! Couples the conversational intake state machine to invoice creation and
//! the payment state machine: a confirmed dialogue becomes an invoice sent
//! with a pay button, and a pay-button reply re-enters `PaymentFlow::initiate`
//! under the same idempotency and retry guarantees as an API-originated
//! payment.

use chrono::Utc;
use serde_json::json;
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::chat::ChatTransport;
use crate::database::store::{
    Invoice, InvoiceStatus, MessageLogEntry, NewInvoice, Payment, PaymentStatus, RecordStore,
};
use crate::services::conversation::{ConversationEngine, FlowEvent, InvoiceDraft};
use crate::services::payment_flow::PaymentFlow;

const HELP_TEXT: &str = "InvoiceIQ Bot Commands:\n\n\
    - invoice: Start guided invoice creation\n\
    - cancel <invoice_id>: Cancel an unpaid invoice\n\
    - help: Show this help";

/// Inbound message kinds the chat webhook can deliver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundKind {
    Text,
    ButtonReply,
}

#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub sender: String,
    pub text: String,
    pub kind: InboundKind,
}

pub struct IntakeService {
    store: Arc<dyn RecordStore>,
    conversation: ConversationEngine,
    transport: Arc<dyn ChatTransport>,
    flow: Arc<PaymentFlow>,
}

fn generate_invoice_id() -> String {
    let suffix: String = Uuid::new_v4().simple().to_string()[..4].to_string();
    format!("INV-{}-{}", Utc::now().timestamp(), suffix)
}

/// Attempt-stable idempotency key for the pay button. Repeat taps while an
/// attempt is in flight (or after it succeeded) reuse the attempt's key and
/// short-circuit; a tap after a failed attempt opens the next attempt.
fn chat_idempotency_key(invoice_id: &str, latest: Option<&Payment>) -> String {
    let attempt = match latest {
        None => 0,
        Some(payment) => match payment.status {
            PaymentStatus::Initiated | PaymentStatus::Success => payment.retry_count,
            PaymentStatus::Failed | PaymentStatus::Expired => payment.retry_count + 1,
        },
    };
    format!("chat-{}-{}", invoice_id, attempt)
}

fn invoice_message(invoice: &Invoice) -> String {
    let name = invoice
        .customer_name
        .as_deref()
        .map(|n| format!("Hi {},\n\n", n))
        .unwrap_or_default();
    format!(
        "{}You have a new invoice.\n\nInvoice: {}\nAmount: KES {}.{:02}\nFor: {}\n\nTap Pay to settle via M-PESA.",
        name,
        invoice.id,
        invoice.amount_cents / 100,
        invoice.amount_cents % 100,
        invoice.description,
    )
}

impl IntakeService {
    pub fn new(
        store: Arc<dyn RecordStore>,
        conversation: ConversationEngine,
        transport: Arc<dyn ChatTransport>,
        flow: Arc<PaymentFlow>,
    ) -> Self {
        Self {
            store,
            conversation,
            transport,
            flow,
        }
    }

    /// Route one inbound chat message. Transport errors on the reply are
    /// logged, never propagated: the chat webhook must always acknowledge.
    pub async fn handle_inbound(&self, message: InboundMessage) {
        self.audit(&message).await;

        let reply = match message.kind {
            InboundKind::ButtonReply => self.handle_button(&message).await,
            InboundKind::Text => self.handle_text(&message).await,
        };

        if let Some(text) = reply {
            if let Err(e) = self.transport.send(&message.sender, &text).await {
                error!(sender = %message.sender, error = %e, "failed to send chat reply");
            }
        }
    }

    async fn handle_button(&self, message: &InboundMessage) -> Option<String> {
        if let Some(invoice_id) = message.text.strip_prefix("pay_") {
            info!(
                sender = %message.sender,
                invoice_id = %invoice_id,
                "payment button clicked"
            );
            return Some(self.start_payment(invoice_id).await);
        }
        warn!(sender = %message.sender, button_id = %message.text, "unknown button reply");
        Some("Button received. I'm not sure what to do with this.".to_string())
    }

    async fn handle_text(&self, message: &InboundMessage) -> Option<String> {
        if self.conversation.is_in_flow(&message.sender).await {
            return self.advance_flow(message).await;
        }

        let text = message.text.trim();
        let lowered = text.to_lowercase();
        let mut parts = lowered.split_whitespace();
        match parts.next() {
            Some("invoice") => {
                let reply = self
                    .conversation
                    .handle_message(&message.sender, text)
                    .await;
                reply.response
            }
            Some("help") => Some(HELP_TEXT.to_string()),
            Some("cancel") => {
                let invoice_id = text.split_whitespace().nth(1);
                match invoice_id {
                    Some(id) => Some(self.cancel_invoice(id).await),
                    None => Some("Usage: cancel <invoice_id>".to_string()),
                }
            }
            _ => Some(
                "I didn't understand that command. Send 'help' for available commands."
                    .to_string(),
            ),
        }
    }

    async fn advance_flow(&self, message: &InboundMessage) -> Option<String> {
        let reply = self
            .conversation
            .handle_message(&message.sender, &message.text)
            .await;

        if let FlowEvent::Confirmed(draft) = reply.event {
            return Some(self.create_and_send_invoice(&message.sender, draft).await);
        }
        reply.response
    }

    /// Invoice creation on dialogue confirmation: persist PENDING, deliver
    /// with a pay button, and promote to SENT only when delivery succeeded.
    async fn create_and_send_invoice(&self, merchant_msisdn: &str, draft: InvoiceDraft) -> String {
        let invoice = match self
            .store
            .insert_invoice(NewInvoice {
                id: generate_invoice_id(),
                customer_name: draft.customer_name,
                customer_msisdn: draft.customer_msisdn,
                merchant_msisdn: merchant_msisdn.to_string(),
                amount_cents: draft.amount_cents,
                currency: "KES".to_string(),
                description: draft.description,
            })
            .await
        {
            Ok(invoice) => invoice,
            Err(e) => {
                error!(merchant_msisdn = %merchant_msisdn, error = %e, "failed to create invoice");
                return "Failed to create invoice. Please try again by sending 'invoice'."
                    .to_string();
            }
        };

        info!(invoice_id = %invoice.id, merchant_msisdn = %merchant_msisdn, "invoice created from guided flow");

        let button_id = format!("pay_{}", invoice.id);
        let delivery = self
            .transport
            .send_with_button(
                &invoice.customer_msisdn,
                &invoice_message(&invoice),
                &button_id,
                "Pay",
            )
            .await;

        match delivery {
            Ok(()) => {
                let sent = self
                    .store
                    .transition_invoice_status(
                        &invoice.id,
                        &[InvoiceStatus::Pending],
                        InvoiceStatus::Sent,
                        None,
                    )
                    .await;
                if let Err(e) = sent {
                    error!(invoice_id = %invoice.id, error = %e, "failed to mark invoice SENT");
                }
                format!(
                    "Invoice {} sent to {} for KES {}.{:02}. You'll be notified when it's paid.",
                    invoice.id,
                    invoice.customer_msisdn,
                    invoice.amount_cents / 100,
                    invoice.amount_cents % 100,
                )
            }
            Err(e) => {
                warn!(invoice_id = %invoice.id, error = %e, "invoice created but delivery failed");
                format!(
                    "Invoice {} created but could not be delivered to the customer. It remains PENDING; you can try again later.",
                    invoice.id
                )
            }
        }
    }

    /// Pay-button path into the payment state machine. The key is derived
    /// from the invoice and the attempt number, so a double-tapped button
    /// collapses onto one payment row via the store's unique constraint
    /// instead of issuing a second push.
    async fn start_payment(&self, invoice_id: &str) -> String {
        let latest = match self.store.latest_payment_for_invoice(invoice_id).await {
            Ok(latest) => latest,
            Err(e) => {
                error!(invoice_id = %invoice_id, error = %e, "failed to resolve payment attempt");
                return "Something went wrong on our side. Please try again later.".to_string();
            }
        };
        let key = chat_idempotency_key(invoice_id, latest.as_ref());

        match self.flow.initiate(invoice_id, &key).await {
            Ok(payment) if payment.status == PaymentStatus::Success => {
                "This invoice has already been paid.".to_string()
            }
            Ok(payment) => {
                info!(
                    invoice_id = %invoice_id,
                    payment_id = %payment.id,
                    idempotency_key = %key,
                    "STK push started from chat"
                );
                "Payment request sent! Enter your M-PESA PIN on your phone to complete the payment."
                    .to_string()
            }
            Err(e) => {
                warn!(invoice_id = %invoice_id, error = %e, "chat payment initiation failed");
                e.user_message()
            }
        }
    }

    async fn cancel_invoice(&self, invoice_id: &str) -> String {
        let cancelled = self
            .store
            .transition_invoice_status(
                invoice_id,
                &[InvoiceStatus::Pending, InvoiceStatus::Sent],
                InvoiceStatus::Cancelled,
                None,
            )
            .await;
        match cancelled {
            Ok(Some(invoice)) => {
                info!(invoice_id = %invoice.id, "invoice cancelled via chat");
                format!("Invoice {} cancelled.", invoice.id)
            }
            Ok(None) => format!(
                "Invoice {} cannot be cancelled (not found, already paid, or already cancelled).",
                invoice_id
            ),
            Err(e) => {
                error!(invoice_id = %invoice_id, error = %e, "invoice cancellation failed");
                "Something went wrong on our side. Please try again later.".to_string()
            }
        }
    }

    /// Metadata-only audit row; message bodies stay out of the database.
    async fn audit(&self, message: &InboundMessage) {
        let event = match message.kind {
            InboundKind::ButtonReply => "button_reply",
            InboundKind::Text => "message_received",
        };
        let entry = MessageLogEntry {
            invoice_id: message
                .text
                .strip_prefix("pay_")
                .map(|id| id.to_string()),
            channel: "WHATSAPP".to_string(),
            direction: "IN".to_string(),
            event: event.to_string(),
            payload: json!({
                "sender": message.sender,
                "text_length": message.text.len(),
            }),
        };
        if let Err(e) = self.store.log_message(entry).await {
            error!(error = %e, "failed to log inbound message");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::{TransportError, TransportResult};
    use crate::database::memory::MemoryStore;
    use crate::database::store::{InvoiceStore, PaymentStore};
    use crate::payments::error::GatewayResult;
    use crate::payments::gateway::PaymentGateway;
    use crate::payments::types::{StkPushRequest, StkPushResponse};
    use crate::services::conversation::InMemorySessionStore;
    use crate::services::notification::ReceiptDispatcher;
    use crate::services::retry_policy::RetryPolicy;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::sync::Mutex;

    #[derive(Default)]
    struct RecordingTransport {
        sent: Mutex<Vec<(String, String)>>,
        buttons: Mutex<Vec<(String, String)>>,
        fail_buttons: bool,
    }

    #[async_trait]
    impl ChatTransport for RecordingTransport {
        async fn send(&self, to: &str, text: &str) -> TransportResult<()> {
            self.sent
                .lock()
                .await
                .push((to.to_string(), text.to_string()));
            Ok(())
        }

        async fn send_with_button(
            &self,
            to: &str,
            text: &str,
            button_id: &str,
            _button_title: &str,
        ) -> TransportResult<()> {
            if self.fail_buttons {
                return Err(TransportError::Network {
                    message: "down".to_string(),
                });
            }
            self.buttons
                .lock()
                .await
                .push((to.to_string(), button_id.to_string()));
            let _ = text;
            Ok(())
        }

        fn channel(&self) -> &'static str {
            "WHATSAPP"
        }
    }

    struct StubGateway {
        pushes: AtomicU32,
    }

    #[async_trait]
    impl PaymentGateway for StubGateway {
        async fn get_token(&self) -> GatewayResult<String> {
            Ok("token".to_string())
        }

        async fn push_payment(&self, _request: StkPushRequest) -> GatewayResult<StkPushResponse> {
            let n = self.pushes.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(StkPushResponse {
                merchant_request_id: format!("MR-{}", n),
                checkout_request_id: format!("C{}", n),
                response_code: "0".to_string(),
                response_description: None,
                customer_message: None,
            })
        }

        fn name(&self) -> &'static str {
            "stub"
        }
    }

    struct NoopReceipts;

    #[async_trait]
    impl ReceiptDispatcher for NoopReceipts {
        async fn payment_succeeded(
            &self,
            _invoice: &Invoice,
            _payment: &crate::database::store::Payment,
        ) {
        }
        async fn payment_failed(
            &self,
            _invoice: &Invoice,
            _payment: &crate::database::store::Payment,
            _reason: &str,
        ) {
        }
    }

    struct TestRig {
        intake: IntakeService,
        store: Arc<MemoryStore>,
        transport: Arc<RecordingTransport>,
        gateway: Arc<StubGateway>,
    }

    fn rig(fail_buttons: bool) -> TestRig {
        let store = Arc::new(MemoryStore::new());
        let transport = Arc::new(RecordingTransport {
            fail_buttons,
            ..Default::default()
        });
        let gateway = Arc::new(StubGateway {
            pushes: AtomicU32::new(0),
        });
        let flow = Arc::new(PaymentFlow::new(
            store.clone(),
            gateway.clone(),
            RetryPolicy::default(),
            Arc::new(NoopReceipts),
        ));
        let intake = IntakeService::new(
            store.clone(),
            ConversationEngine::new(Arc::new(InMemorySessionStore::new())),
            transport.clone(),
            flow,
        );
        TestRig {
            intake,
            store,
            transport,
            gateway,
        }
    }

    fn service(
        fail_buttons: bool,
    ) -> (IntakeService, Arc<MemoryStore>, Arc<RecordingTransport>) {
        let r = rig(fail_buttons);
        (r.intake, r.store, r.transport)
    }

    fn text(sender: &str, body: &str) -> InboundMessage {
        InboundMessage {
            sender: sender.to_string(),
            text: body.to_string(),
            kind: InboundKind::Text,
        }
    }

    #[tokio::test]
    async fn guided_flow_creates_and_sends_invoice() {
        let (intake, store, transport) = service(false);
        let merchant = "254700000001";

        for input in ["invoice", "254712345678", "Jane", "1500", "Deep cleaning"] {
            intake.handle_inbound(text(merchant, input)).await;
        }
        intake.handle_inbound(text(merchant, "confirm")).await;

        let buttons = transport.buttons.lock().await;
        assert_eq!(buttons.len(), 1);
        let (to, button_id) = &buttons[0];
        assert_eq!(to, "254712345678");
        assert!(button_id.starts_with("pay_INV-"));

        let invoice_id = button_id.strip_prefix("pay_").unwrap();
        let invoice = store.find_invoice(invoice_id).await.unwrap().unwrap();
        assert_eq!(invoice.status, InvoiceStatus::Sent);
        assert_eq!(invoice.amount_cents, 150_000);
        assert_eq!(invoice.merchant_msisdn, merchant);
    }

    #[tokio::test]
    async fn failed_delivery_leaves_invoice_pending() {
        let (intake, store, transport) = service(true);
        let merchant = "254700000001";

        for input in ["invoice", "254712345678", "-", "100", "Consulting"] {
            intake.handle_inbound(text(merchant, input)).await;
        }
        intake.handle_inbound(text(merchant, "confirm")).await;

        // The merchant confirmation names the invoice; it must still be
        // PENDING because delivery failed.
        let sent = transport.sent.lock().await;
        let confirmation = sent
            .iter()
            .find(|(to, body)| to == merchant && body.contains("could not be delivered"))
            .expect("merchant should be told delivery failed");
        let invoice_id = confirmation
            .1
            .split_whitespace()
            .nth(1)
            .expect("confirmation names the invoice");
        let invoice = store.find_invoice(invoice_id).await.unwrap().unwrap();
        assert_eq!(invoice.status, InvoiceStatus::Pending);
    }

    #[tokio::test]
    async fn pay_button_initiates_stk_push() {
        let (intake, store, transport) = service(false);
        store
            .insert_invoice(NewInvoice {
                id: "INV-7".to_string(),
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
            .transition_invoice_status(
                "INV-7",
                &[InvoiceStatus::Pending],
                InvoiceStatus::Sent,
                None,
            )
            .await
            .unwrap();

        intake
            .handle_inbound(InboundMessage {
                sender: "254712345678".to_string(),
                text: "pay_INV-7".to_string(),
                kind: InboundKind::ButtonReply,
            })
            .await;

        let payment = store
            .latest_payment_for_invoice("INV-7")
            .await
            .unwrap()
            .expect("payment should exist");
        assert_eq!(payment.checkout_request_id.as_deref(), Some("C1"));

        let sent = transport.sent.lock().await;
        assert!(sent
            .iter()
            .any(|(_, text)| text.contains("Enter your M-PESA PIN")));
    }

    #[tokio::test]
    async fn double_tapped_pay_button_issues_one_push() {
        let r = rig(false);
        r.store
            .insert_invoice(NewInvoice {
                id: "INV-8".to_string(),
                customer_name: None,
                customer_msisdn: "254712345678".to_string(),
                merchant_msisdn: "254700000001".to_string(),
                amount_cents: 10_000,
                currency: "KES".to_string(),
                description: "Deep clean".to_string(),
            })
            .await
            .unwrap();
        r.store
            .transition_invoice_status(
                "INV-8",
                &[InvoiceStatus::Pending],
                InvoiceStatus::Sent,
                None,
            )
            .await
            .unwrap();

        let tap = InboundMessage {
            sender: "254712345678".to_string(),
            text: "pay_INV-8".to_string(),
            kind: InboundKind::ButtonReply,
        };
        r.intake.handle_inbound(tap.clone()).await;
        r.intake.handle_inbound(tap).await;

        assert_eq!(
            r.gateway.pushes.load(Ordering::SeqCst),
            1,
            "second tap must reuse the in-flight attempt"
        );
    }

    #[tokio::test]
    async fn unknown_command_gets_help_hint() {
        let (intake, _store, transport) = service(false);
        intake
            .handle_inbound(text("254700000001", "make me rich"))
            .await;
        let sent = transport.sent.lock().await;
        assert!(sent[0].1.contains("Send 'help'"));
    }

    #[tokio::test]
    async fn cancel_command_cancels_sent_invoice() {
        let (intake, store, transport) = service(false);
        store
            .insert_invoice(NewInvoice {
                id: "INV-9".to_string(),
                customer_name: None,
                customer_msisdn: "254712345678".to_string(),
                merchant_msisdn: "254700000001".to_string(),
                amount_cents: 10_000,
                currency: "KES".to_string(),
                description: "Deep clean".to_string(),
            })
            .await
            .unwrap();

        intake
            .handle_inbound(text("254700000001", "cancel INV-9"))
            .await;

        let invoice = store.find_invoice("INV-9").await.unwrap().unwrap();
        assert_eq!(invoice.status, InvoiceStatus::Cancelled);
        let sent = transport.sent.lock().await;
        assert!(sent[0].1.contains("cancelled"));
    }

    #[tokio::test]
    async fn inbound_messages_are_audited() {
        let (intake, store, _transport) = service(false);
        intake.handle_inbound(text("254700000001", "help")).await;
        assert_eq!(store.message_count().await, 1);
    }
}

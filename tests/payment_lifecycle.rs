//! End-to-end payment lifecycle scenarios driven through the public service
//! layer: in-memory store, stub gateway, callback reconciler and counting
//! receipt dispatcher.

use async_trait::async_trait;
use serde_json::json;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use invoiceiq_backend::database::memory::MemoryStore;
use invoiceiq_backend::database::store::{
    Invoice, InvoiceStatus, InvoiceStore, NewInvoice, Payment, PaymentStatus, PaymentStore,
};
use invoiceiq_backend::payments::error::GatewayResult;
use invoiceiq_backend::payments::gateway::PaymentGateway;
use invoiceiq_backend::payments::types::{StkPushRequest, StkPushResponse};
use invoiceiq_backend::services::notification::ReceiptDispatcher;
use invoiceiq_backend::services::payment_flow::{PaymentFlow, PaymentFlowError};
use invoiceiq_backend::services::reconciler::CallbackReconciler;
use invoiceiq_backend::services::retry_policy::RetryPolicy;

struct StubGateway {
    pushes: AtomicU32,
}

impl StubGateway {
    fn new() -> Self {
        Self {
            pushes: AtomicU32::new(0),
        }
    }
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
            response_description: Some("Success. Request accepted for processing".to_string()),
            customer_message: None,
        })
    }

    fn name(&self) -> &'static str {
        "stub"
    }
}

#[derive(Default)]
struct CountingReceipts {
    success: AtomicU32,
}

#[async_trait]
impl ReceiptDispatcher for CountingReceipts {
    async fn payment_succeeded(&self, _invoice: &Invoice, _payment: &Payment) {
        self.success.fetch_add(1, Ordering::SeqCst);
    }

    async fn payment_failed(&self, _invoice: &Invoice, _payment: &Payment, _reason: &str) {}
}

struct World {
    store: Arc<MemoryStore>,
    gateway: Arc<StubGateway>,
    receipts: Arc<CountingReceipts>,
    flow: Arc<PaymentFlow>,
    reconciler: CallbackReconciler,
}

fn world_with_policy(policy: RetryPolicy) -> World {
    let store = Arc::new(MemoryStore::new());
    let gateway = Arc::new(StubGateway::new());
    let receipts = Arc::new(CountingReceipts::default());
    let flow = Arc::new(PaymentFlow::new(
        store.clone(),
        gateway.clone(),
        policy,
        receipts.clone(),
    ));
    let reconciler = CallbackReconciler::new(flow.clone());
    World {
        store,
        gateway,
        receipts,
        flow,
        reconciler,
    }
}

fn world() -> World {
    world_with_policy(RetryPolicy::default())
}

async fn sent_invoice(store: &MemoryStore, id: &str, amount_cents: i64) {
    store
        .insert_invoice(NewInvoice {
            id: id.to_string(),
            customer_name: Some("Jane Doe".to_string()),
            customer_msisdn: "254712345678".to_string(),
            merchant_msisdn: "254700000001".to_string(),
            amount_cents,
            currency: "KES".to_string(),
            description: "House cleaning".to_string(),
        })
        .await
        .unwrap();
    store
        .transition_invoice_status(id, &[InvoiceStatus::Pending], InvoiceStatus::Sent, None)
        .await
        .unwrap();
}

fn stk_callback(checkout: &str, result_code: i64, receipt: Option<&str>) -> serde_json::Value {
    let mut stk = json!({
        "MerchantRequestID": "29115-34620561-1",
        "CheckoutRequestID": checkout,
        "ResultCode": result_code,
        "ResultDesc": if result_code == 0 {
            "The service request is processed successfully."
        } else {
            "Request cancelled by user"
        },
    });
    if let Some(receipt) = receipt {
        stk["CallbackMetadata"] = json!({
            "Item": [
                {"Name": "Amount", "Value": 100.00},
                {"Name": "MpesaReceiptNumber", "Value": receipt},
                {"Name": "TransactionDate", "Value": 20191219102115_i64},
                {"Name": "PhoneNumber", "Value": 254712345678_i64}
            ]
        });
    }
    json!({"Body": {"stkCallback": stk}})
}

#[tokio::test]
async fn full_happy_path_initiate_callback_paid() {
    let w = world();
    sent_invoice(&w.store, "INV-1", 10_000).await;

    let payment = w.flow.initiate("INV-1", "K1").await.unwrap();
    assert_eq!(payment.status, PaymentStatus::Initiated);
    assert_eq!(payment.checkout_request_id.as_deref(), Some("C1"));

    let ack = w.reconciler.reconcile(&stk_callback("C1", 0, Some("R1"))).await;
    assert_eq!(ack.result_code, "0");

    let invoice = w.store.find_invoice("INV-1").await.unwrap().unwrap();
    assert_eq!(invoice.status, InvoiceStatus::Paid);
    assert_eq!(invoice.pay_ref.as_deref(), Some("R1"));

    let payment = w.store.find_payment(payment.id).await.unwrap().unwrap();
    assert_eq!(payment.status, PaymentStatus::Success);
    assert_eq!(payment.mpesa_receipt.as_deref(), Some("R1"));
}

#[tokio::test]
async fn duplicate_initiate_with_same_key_returns_same_payment_id() {
    let w = world();
    sent_invoice(&w.store, "INV-1", 10_000).await;

    let first = w.flow.initiate("INV-1", "K1").await.unwrap();
    let second = w.flow.initiate("INV-1", "K1").await.unwrap();

    assert_eq!(first.id, second.id);
    assert_eq!(
        w.gateway.pushes.load(Ordering::SeqCst),
        1,
        "no second gateway call may be observed"
    );
}

#[tokio::test]
async fn concurrent_duplicate_initiations_yield_one_payment() {
    let w = world();
    sent_invoice(&w.store, "INV-1", 10_000).await;

    let mut handles = Vec::new();
    for _ in 0..8 {
        let flow = w.flow.clone();
        handles.push(tokio::spawn(
            async move { flow.initiate("INV-1", "K1").await },
        ));
    }

    let mut ids = Vec::new();
    for handle in handles {
        ids.push(handle.await.unwrap().unwrap().id);
    }
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), 1, "all callers must observe the same payment");
    assert_eq!(w.gateway.pushes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn duplicate_callback_delivery_produces_one_receipt_and_one_paid_transition() {
    let w = world();
    sent_invoice(&w.store, "INV-1", 10_000).await;
    w.flow.initiate("INV-1", "K1").await.unwrap();

    let payload = stk_callback("C1", 0, Some("R1"));
    let ack1 = w.reconciler.reconcile(&payload).await;
    let ack2 = w.reconciler.reconcile(&payload).await;
    assert_eq!(ack1.result_code, "0");
    assert_eq!(ack2.result_code, "0");

    assert_eq!(w.receipts.success.load(Ordering::SeqCst), 1);
    let invoice = w.store.find_invoice("INV-1").await.unwrap().unwrap();
    assert_eq!(invoice.status, InvoiceStatus::Paid);
}

#[tokio::test]
async fn success_never_regresses_under_late_failure_callback() {
    let w = world();
    sent_invoice(&w.store, "INV-1", 10_000).await;
    let payment = w.flow.initiate("INV-1", "K1").await.unwrap();

    w.reconciler.reconcile(&stk_callback("C1", 0, Some("R1"))).await;
    w.reconciler.reconcile(&stk_callback("C1", 1032, None)).await;

    let payment = w.store.find_payment(payment.id).await.unwrap().unwrap();
    assert_eq!(payment.status, PaymentStatus::Success);
}

#[tokio::test]
async fn callback_for_unknown_checkout_acknowledges_without_mutation() {
    let w = world();
    sent_invoice(&w.store, "INV-1", 10_000).await;
    w.flow.initiate("INV-1", "K1").await.unwrap();

    let ack = w
        .reconciler
        .reconcile(&stk_callback("C-ghost", 0, Some("R9")))
        .await;
    assert_eq!(ack.result_code, "0");
    assert_eq!(ack.result_desc, "Accepted");

    let invoice = w.store.find_invoice("INV-1").await.unwrap().unwrap();
    assert_eq!(invoice.status, InvoiceStatus::Sent);
    assert_eq!(w.receipts.success.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn malformed_callback_is_acknowledged_without_mutation() {
    let w = world();
    sent_invoice(&w.store, "INV-1", 10_000).await;
    w.flow.initiate("INV-1", "K1").await.unwrap();

    for payload in [
        json!({}),
        json!({"Body": {}}),
        json!({"Body": {"stkCallback": {"ResultCode": 0}}}),
        json!("not even an object"),
    ] {
        let ack = w.reconciler.reconcile(&payload).await;
        assert_eq!(ack.result_code, "0");
    }

    let invoice = w.store.find_invoice("INV-1").await.unwrap().unwrap();
    assert_eq!(invoice.status, InvoiceStatus::Sent);
}

#[tokio::test]
async fn retry_sequence_cooldown_then_allowed_then_max_attempts() {
    // First attempt fails; an immediate retry hits the cooldown gate.
    let w = world();
    sent_invoice(&w.store, "INV-1", 10_000).await;
    w.flow.initiate("INV-1", "K1").await.unwrap();
    w.reconciler.reconcile(&stk_callback("C1", 1032, None)).await;

    let invoice = w.store.find_invoice("INV-1").await.unwrap().unwrap();
    assert_eq!(invoice.status, InvoiceStatus::Failed);

    match w.flow.initiate("INV-1", "K2").await.unwrap_err() {
        PaymentFlowError::RetryDenied { reason } => {
            assert!(reason.contains("wait"), "cooldown reason expected: {reason}");
        }
        other => panic!("expected cooldown denial, got {other:?}"),
    }

    // With the cooldown elapsed (zero-cooldown policy stands in for time
    // passing) the retry is approved and re-enters initiation.
    let w2 = world_with_policy(RetryPolicy::new(1, Duration::from_secs(0)));
    sent_invoice(&w2.store, "INV-1", 10_000).await;
    w2.flow.initiate("INV-1", "K1").await.unwrap();
    w2.reconciler.reconcile(&stk_callback("C1", 1032, None)).await;

    let retried = w2.flow.initiate("INV-1", "K2").await.unwrap();
    assert_eq!(retried.status, PaymentStatus::Initiated);
    let retried_full = w2.store.find_payment(retried.id).await.unwrap().unwrap();
    assert_eq!(retried_full.checkout_request_id.as_deref(), Some("C2"));

    // Second failure exhausts the ceiling: denial now cites max attempts
    // even though the cooldown is zero.
    w2.reconciler.reconcile(&stk_callback("C2", 1032, None)).await;
    match w2.flow.initiate("INV-1", "K3").await.unwrap_err() {
        PaymentFlowError::RetryDenied { reason } => {
            assert!(
                reason.contains("Maximum payment attempts"),
                "max-attempts reason expected: {reason}"
            );
        }
        other => panic!("expected max-attempts denial, got {other:?}"),
    }
}

#[tokio::test]
async fn approved_retry_reopens_invoice_and_increments_single_counter() {
    let w = world_with_policy(RetryPolicy::new(1, Duration::from_secs(0)));
    sent_invoice(&w.store, "INV-1", 10_000).await;
    let first = w.flow.initiate("INV-1", "K1").await.unwrap();
    w.reconciler.reconcile(&stk_callback("C1", 1032, None)).await;

    let second = w.flow.initiate("INV-1", "K2").await.unwrap();

    // The prior row was bumped exactly once and the replacement row carries
    // the cumulative count, so the newest payment stays authoritative.
    let prior = w.store.find_payment(first.id).await.unwrap().unwrap();
    assert_eq!(prior.retry_count, 1);
    assert_eq!(second.retry_count, 1);

    // The invoice travelled FAILED → PENDING on approval.
    let invoice = w.store.find_invoice("INV-1").await.unwrap().unwrap();
    assert_eq!(invoice.status, InvoiceStatus::Pending);
}

#[tokio::test]
async fn expired_payment_from_timeout_result_code() {
    let w = world();
    sent_invoice(&w.store, "INV-1", 10_000).await;
    let payment = w.flow.initiate("INV-1", "K1").await.unwrap();

    w.reconciler.reconcile(&stk_callback("C1", 1037, None)).await;

    let payment = w.store.find_payment(payment.id).await.unwrap().unwrap();
    assert_eq!(payment.status, PaymentStatus::Expired);
}

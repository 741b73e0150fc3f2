//! Callback reconciler: the single entry point for provider-initiated
//! events.
//!
//! Maps an inbound STK callback to its payment record and feeds it into the
//! payment state machine exactly once. A malformed or partially-populated
//! payload still yields a success acknowledgment (the provider must never be
//! given cause to retry delivery of something we cannot act on) but performs
//! no state mutation.

use serde_json::Value as JsonValue;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::payments::types::StkCallback;
use crate::services::payment_flow::{CompletionOutcome, PaymentFlow};

/// Acknowledgment returned to the provider. Always success, regardless of
/// internal processing outcome.
#[derive(Debug, Clone, serde::Serialize)]
pub struct CallbackAck {
    #[serde(rename = "ResultCode")]
    pub result_code: String,
    #[serde(rename = "ResultDesc")]
    pub result_desc: String,
}

impl CallbackAck {
    pub fn accepted() -> Self {
        Self {
            result_code: "0".to_string(),
            result_desc: "Accepted".to_string(),
        }
    }
}

/// Extract `{checkout_id, result_code, receipt?}` from the Daraja callback
/// envelope. Returns `None` when the payload is missing the fields needed to
/// act on it.
pub fn parse_stk_callback(payload: &JsonValue) -> Option<StkCallback> {
    let stk = payload.get("Body")?.get("stkCallback")?;

    let checkout_request_id = stk
        .get("CheckoutRequestID")
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())?
        .to_string();
    let result_code = stk.get("ResultCode").and_then(|v| v.as_i64())?;

    let merchant_request_id = stk
        .get("MerchantRequestID")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());
    let result_desc = stk
        .get("ResultDesc")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());

    // Metadata is only present on success; items arrive as {Name, Value}
    // pairs with mixed value types.
    let mut mpesa_receipt = None;
    let mut transaction_date = None;
    let mut phone_number = None;
    if result_code == 0 {
        if let Some(items) = stk
            .get("CallbackMetadata")
            .and_then(|m| m.get("Item"))
            .and_then(|i| i.as_array())
        {
            for item in items {
                let Some(name) = item.get("Name").and_then(|n| n.as_str()) else {
                    continue;
                };
                let value = item.get("Value");
                match name {
                    "MpesaReceiptNumber" => {
                        mpesa_receipt = value.and_then(|v| v.as_str()).map(|s| s.to_string());
                    }
                    "TransactionDate" => {
                        transaction_date = value.and_then(|v| v.as_i64());
                    }
                    "PhoneNumber" => {
                        phone_number = value.and_then(|v| match v {
                            JsonValue::Number(n) => n.as_i64().map(|n| n.to_string()),
                            JsonValue::String(s) => Some(s.clone()),
                            _ => None,
                        });
                    }
                    _ => {}
                }
            }
        }
    }

    Some(StkCallback {
        merchant_request_id,
        checkout_request_id,
        result_code,
        result_desc,
        mpesa_receipt,
        transaction_date,
        phone_number,
    })
}

pub struct CallbackReconciler {
    flow: Arc<PaymentFlow>,
}

impl CallbackReconciler {
    pub fn new(flow: Arc<PaymentFlow>) -> Self {
        Self { flow }
    }

    /// Process one raw provider callback. Never fails toward the transport
    /// layer: every path ends in a success acknowledgment.
    pub async fn reconcile(&self, payload: &JsonValue) -> CallbackAck {
        let Some(callback) = parse_stk_callback(payload) else {
            warn!("malformed STK callback payload, acknowledging without action");
            return CallbackAck::accepted();
        };

        info!(
            checkout_request_id = %callback.checkout_request_id,
            result_code = callback.result_code,
            "received STK callback"
        );

        match self.flow.complete(&callback).await {
            Ok(CompletionOutcome::Completed { payment, .. }) => {
                info!(
                    payment_id = %payment.id,
                    status = %payment.status,
                    "callback reconciled"
                );
            }
            Ok(CompletionOutcome::AlreadyProcessed {
                checkout_request_id,
            }) => {
                info!(
                    checkout_request_id = %checkout_request_id,
                    "duplicate callback discarded"
                );
            }
            Ok(CompletionOutcome::UnknownCheckout {
                checkout_request_id,
            }) => {
                warn!(
                    checkout_request_id = %checkout_request_id,
                    "callback for unknown checkout discarded"
                );
            }
            Err(e) => {
                // Internal failure must not leak to the provider; it would
                // trigger a redelivery storm.
                error!(error = %e, "error processing STK callback");
            }
        }

        CallbackAck::accepted()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn success_payload(checkout: &str, receipt: &str) -> JsonValue {
        json!({
            "Body": {
                "stkCallback": {
                    "MerchantRequestID": "29115-34620561-1",
                    "CheckoutRequestID": checkout,
                    "ResultCode": 0,
                    "ResultDesc": "The service request is processed successfully.",
                    "CallbackMetadata": {
                        "Item": [
                            {"Name": "Amount", "Value": 100.00},
                            {"Name": "MpesaReceiptNumber", "Value": receipt},
                            {"Name": "TransactionDate", "Value": 20191219102115_i64},
                            {"Name": "PhoneNumber", "Value": 254712345678_i64}
                        ]
                    }
                }
            }
        })
    }

    #[test]
    fn parses_successful_callback_with_metadata() {
        let parsed = parse_stk_callback(&success_payload("ws_CO_1", "NLJ7RT61SV")).unwrap();
        assert_eq!(parsed.checkout_request_id, "ws_CO_1");
        assert_eq!(parsed.result_code, 0);
        assert!(parsed.is_success());
        assert_eq!(parsed.mpesa_receipt.as_deref(), Some("NLJ7RT61SV"));
        assert_eq!(parsed.transaction_date, Some(20191219102115));
        assert_eq!(parsed.phone_number.as_deref(), Some("254712345678"));
    }

    #[test]
    fn parses_failed_callback_without_metadata() {
        let payload = json!({
            "Body": {
                "stkCallback": {
                    "MerchantRequestID": "92334-77894064-1",
                    "CheckoutRequestID": "ws_CO_2",
                    "ResultCode": 1032,
                    "ResultDesc": "Request cancelled by user"
                }
            }
        });
        let parsed = parse_stk_callback(&payload).unwrap();
        assert_eq!(parsed.result_code, 1032);
        assert!(!parsed.is_success());
        assert!(parsed.mpesa_receipt.is_none());
    }

    #[test]
    fn rejects_payload_without_stk_callback() {
        assert!(parse_stk_callback(&json!({"hello": "world"})).is_none());
        assert!(parse_stk_callback(&json!({"Body": {}})).is_none());
    }

    #[test]
    fn rejects_payload_missing_checkout_id_or_result_code() {
        let no_checkout = json!({
            "Body": {"stkCallback": {"ResultCode": 0}}
        });
        assert!(parse_stk_callback(&no_checkout).is_none());

        let no_result = json!({
            "Body": {"stkCallback": {"CheckoutRequestID": "ws_CO_3"}}
        });
        assert!(parse_stk_callback(&no_result).is_none());
    }

    #[test]
    fn tolerates_partially_populated_metadata() {
        let payload = json!({
            "Body": {
                "stkCallback": {
                    "CheckoutRequestID": "ws_CO_4",
                    "ResultCode": 0,
                    "CallbackMetadata": {
                        "Item": [
                            {"Name": "Amount"},
                            {"Value": "orphaned"},
                            {"Name": "MpesaReceiptNumber", "Value": "ABC123"}
                        ]
                    }
                }
            }
        });
        let parsed = parse_stk_callback(&payload).unwrap();
        assert_eq!(parsed.mpesa_receipt.as_deref(), Some("ABC123"));
    }
}

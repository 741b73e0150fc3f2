use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};

/// Outbound push-payment request as the gateway sees it. Amount is whole KES;
/// the Daraja API does not accept decimals on STK push.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StkPushRequest {
    pub phone_number: String,
    pub amount_kes: i64,
    pub account_reference: String,
    pub transaction_desc: String,
}

/// Correlation identifiers assigned by the provider at initiation. Both must
/// be recorded on the payment row: the checkout id is what the asynchronous
/// callback is matched on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StkPushResponse {
    pub merchant_request_id: String,
    pub checkout_request_id: String,
    pub response_code: String,
    pub response_description: Option<String>,
    pub customer_message: Option<String>,
}

/// Raw Daraja STK push response envelope.
#[derive(Debug, Deserialize)]
pub struct DarajaStkResponse {
    #[serde(rename = "MerchantRequestID")]
    pub merchant_request_id: String,
    #[serde(rename = "CheckoutRequestID")]
    pub checkout_request_id: String,
    #[serde(rename = "ResponseCode")]
    pub response_code: String,
    #[serde(rename = "ResponseDescription")]
    pub response_description: Option<String>,
    #[serde(rename = "CustomerMessage")]
    pub customer_message: Option<String>,
}

/// OAuth token response. Daraja returns `expires_in` as a string ("3599") in
/// production and a number in some sandbox responses, so accept both.
#[derive(Debug, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(deserialize_with = "expires_in_seconds")]
    pub expires_in: u64,
}

fn expires_in_seconds<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Num(u64),
        Text(String),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Num(n) => Ok(n),
        Raw::Text(s) => s
            .trim()
            .parse::<u64>()
            .map_err(|_| de::Error::custom(format!("invalid expires_in: {}", s))),
    }
}

// ============================================================================
// Payload snapshots
//
// Stored request/callback payloads are tagged unions of the shapes each call
// site actually produces, not open JSON maps.
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RequestSnapshot {
    StkPush {
        phone_number: String,
        amount_kes: i64,
        account_reference: String,
        transaction_desc: String,
        merchant_request_id: String,
        checkout_request_id: String,
    },
    StkPushError {
        phone_number: String,
        amount_kes: i64,
        account_reference: String,
        error: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CallbackSnapshot {
    StkResult {
        merchant_request_id: Option<String>,
        checkout_request_id: String,
        result_code: i64,
        result_desc: Option<String>,
        mpesa_receipt: Option<String>,
        transaction_date: Option<i64>,
        phone_number: Option<String>,
    },
}

/// A parsed, validated STK callback ready for reconciliation.
#[derive(Debug, Clone, PartialEq)]
pub struct StkCallback {
    pub merchant_request_id: Option<String>,
    pub checkout_request_id: String,
    pub result_code: i64,
    pub result_desc: Option<String>,
    pub mpesa_receipt: Option<String>,
    pub transaction_date: Option<i64>,
    pub phone_number: Option<String>,
}

impl StkCallback {
    pub fn is_success(&self) -> bool {
        self.result_code == 0
    }

    pub fn snapshot(&self) -> CallbackSnapshot {
        CallbackSnapshot::StkResult {
            merchant_request_id: self.merchant_request_id.clone(),
            checkout_request_id: self.checkout_request_id.clone(),
            result_code: self.result_code,
            result_desc: self.result_desc.clone(),
            mpesa_receipt: self.mpesa_receipt.clone(),
            transaction_date: self.transaction_date,
            phone_number: self.phone_number.clone(),
        }
    }
}

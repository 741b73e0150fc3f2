//! M-PESA Daraja gateway adapter.
//!
//! Pure boundary component: OAuth token acquisition with a process-wide cache
//! and STK push initiation. No business-rule knowledge lives here.

use crate::payments::error::{GatewayError, GatewayResult};
use crate::payments::gateway::PaymentGateway;
use crate::payments::types::{
    DarajaStkResponse, StkPushRequest, StkPushResponse, TokenResponse,
};
use crate::payments::utils::{sanitize_xml_text, AuthScheme, GatewayHttpClient};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, info};

pub const SANDBOX_BASE_URL: &str = "https://sandbox.safaricom.co.ke";
pub const PRODUCTION_BASE_URL: &str = "https://api.safaricom.co.ke";

/// Safety margin subtracted from the provider's stated token lifetime so a
/// token is never used in the final seconds before it expires server-side.
const TOKEN_EXPIRY_MARGIN_SECS: u64 = 60;

/// Daraja caps AccountReference and TransactionDesc at 20 characters.
const MAX_REFERENCE_LEN: usize = 20;

#[derive(Debug, Clone)]
pub struct MpesaConfig {
    pub consumer_key: String,
    pub consumer_secret: String,
    pub shortcode: String,
    pub passkey: String,
    pub callback_url: String,
    pub base_url: String,
    pub timeout_secs: u64,
    pub max_retries: u32,
}

impl MpesaConfig {
    pub fn validate(&self) -> GatewayResult<()> {
        if self.consumer_key.is_empty()
            || self.consumer_secret.is_empty()
            || self.passkey.is_empty()
        {
            return Err(GatewayError::Configuration {
                message: "MPESA_CONSUMER_KEY, MPESA_CONSUMER_SECRET and MPESA_PASSKEY are required"
                    .to_string(),
            });
        }
        if self.shortcode.parse::<u64>().is_err() {
            return Err(GatewayError::Configuration {
                message: format!("MPESA_SHORTCODE must be numeric: {}", self.shortcode),
            });
        }
        if self.callback_url.is_empty() {
            return Err(GatewayError::Configuration {
                message: "MPESA_CALLBACK_URL is required".to_string(),
            });
        }
        Ok(())
    }
}

struct CachedToken {
    access_token: String,
    expires_at: Instant,
}

pub struct MpesaGateway {
    config: MpesaConfig,
    http: GatewayHttpClient,
    token_cache: RwLock<Option<CachedToken>>,
}

impl MpesaGateway {
    pub fn new(config: MpesaConfig) -> GatewayResult<Self> {
        config.validate()?;
        let http = GatewayHttpClient::new(
            Duration::from_secs(config.timeout_secs),
            config.max_retries,
        )?;
        Ok(Self {
            config,
            http,
            token_cache: RwLock::new(None),
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url, path)
    }

    /// Password for STK push: base64(shortcode + passkey + timestamp).
    fn generate_password(&self, timestamp: &str) -> String {
        let raw = format!("{}{}{}", self.config.shortcode, self.config.passkey, timestamp);
        BASE64.encode(raw.as_bytes())
    }

    /// Daraja timestamp format, e.g. "20250112153045".
    fn generate_timestamp() -> String {
        chrono::Local::now().format("%Y%m%d%H%M%S").to_string()
    }

    async fn fetch_token(&self) -> GatewayResult<TokenResponse> {
        let url = self.endpoint("/oauth/v1/generate?grant_type=client_credentials");
        let response: TokenResponse = self
            .http
            .request_json(
                reqwest::Method::GET,
                &url,
                AuthScheme::Basic {
                    username: &self.config.consumer_key,
                    password: &self.config.consumer_secret,
                },
                None,
            )
            .await?;

        if response.access_token.is_empty() {
            return Err(GatewayError::InvalidResponse {
                message: "no access_token in OAuth response".to_string(),
            });
        }
        Ok(response)
    }
}

#[async_trait]
impl PaymentGateway for MpesaGateway {
    /// Double-checked token acquisition: a cached, non-expired token is
    /// reused without a network call; when it has expired the writer
    /// re-checks under the write lock so concurrent callers that queued
    /// behind the refresh reuse the freshly-fetched token.
    async fn get_token(&self) -> GatewayResult<String> {
        {
            let cache = self.token_cache.read().await;
            if let Some(cached) = cache.as_ref() {
                if Instant::now() < cached.expires_at {
                    debug!(
                        expires_in = cached
                            .expires_at
                            .saturating_duration_since(Instant::now())
                            .as_secs(),
                        "reusing cached M-PESA access token"
                    );
                    return Ok(cached.access_token.clone());
                }
            }
        }

        let mut cache = self.token_cache.write().await;
        if let Some(cached) = cache.as_ref() {
            if Instant::now() < cached.expires_at {
                return Ok(cached.access_token.clone());
            }
        }

        info!("generating new M-PESA access token");
        let response = self.fetch_token().await?;
        let lifetime = response
            .expires_in
            .saturating_sub(TOKEN_EXPIRY_MARGIN_SECS)
            .max(1);
        let token = response.access_token.clone();
        *cache = Some(CachedToken {
            access_token: response.access_token,
            expires_at: Instant::now() + Duration::from_secs(lifetime),
        });

        info!(expires_in = response.expires_in, "M-PESA access token generated");
        Ok(token)
    }

    async fn push_payment(&self, request: StkPushRequest) -> GatewayResult<StkPushResponse> {
        let phone: i64 =
            request
                .phone_number
                .parse()
                .map_err(|_| GatewayError::Configuration {
                    message: format!("payer msisdn is not numeric: {}", request.phone_number),
                })?;
        if request.amount_kes <= 0 {
            return Err(GatewayError::Configuration {
                message: format!("amount must be positive: {}", request.amount_kes),
            });
        }

        let access_token = self.get_token().await?;
        let timestamp = Self::generate_timestamp();
        let password = self.generate_password(&timestamp);
        let shortcode: i64 =
            self.config
                .shortcode
                .parse()
                .map_err(|_| GatewayError::Configuration {
                    message: format!("shortcode is not numeric: {}", self.config.shortcode),
                })?;

        let mut account_reference = sanitize_xml_text(&request.account_reference);
        account_reference.truncate(MAX_REFERENCE_LEN);
        let mut transaction_desc = sanitize_xml_text(&request.transaction_desc);
        transaction_desc.truncate(MAX_REFERENCE_LEN);

        // Numeric fields must be JSON integers, not strings, or Daraja
        // rejects the request with an opaque error.
        let payload = serde_json::json!({
            "BusinessShortCode": shortcode,
            "Password": password,
            "Timestamp": timestamp,
            "TransactionType": "CustomerPayBillOnline",
            "Amount": request.amount_kes,
            "PartyA": phone,
            "PartyB": shortcode,
            "PhoneNumber": phone,
            "CallBackURL": self.config.callback_url,
            "AccountReference": account_reference,
            "TransactionDesc": transaction_desc,
        });

        info!(
            phone_number = %request.phone_number,
            amount_kes = request.amount_kes,
            account_reference = %account_reference,
            "initiating STK push"
        );

        let raw: DarajaStkResponse = self
            .http
            .request_json(
                reqwest::Method::POST,
                &self.endpoint("/mpesa/stkpush/v1/processrequest"),
                AuthScheme::Bearer(&access_token),
                Some(&payload),
            )
            .await?;

        if raw.response_code != "0" {
            return Err(GatewayError::Rejected {
                message: format!(
                    "STK push rejected: code={} desc={}",
                    raw.response_code,
                    raw.response_description.as_deref().unwrap_or("none")
                ),
                status: None,
            });
        }

        info!(
            checkout_request_id = %raw.checkout_request_id,
            merchant_request_id = %raw.merchant_request_id,
            "STK push accepted by provider"
        );

        Ok(StkPushResponse {
            merchant_request_id: raw.merchant_request_id,
            checkout_request_id: raw.checkout_request_id,
            response_code: raw.response_code,
            response_description: raw.response_description,
            customer_message: raw.customer_message,
        })
    }

    fn name(&self) -> &'static str {
        "mpesa"
    }
}

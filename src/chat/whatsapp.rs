//! WhatsApp Cloud API transport via a 360dialog-style BSP endpoint.
//!
//! Uses API-key authentication (`D360-API-KEY` header); phone number mapping
//! is managed by the BSP, so the endpoint carries no phone id.

use async_trait::async_trait;
use reqwest::Client;
use serde_json::json;
use std::time::Duration;
use tracing::{debug, info};

use crate::chat::{ChatTransport, TransportError, TransportResult};

#[derive(Debug, Clone)]
pub struct WhatsAppConfig {
    pub api_url: String,
    pub api_key: String,
    pub timeout_secs: u64,
}

pub struct WhatsAppTransport {
    config: WhatsAppConfig,
    client: Client,
}

impl WhatsAppTransport {
    pub fn new(config: WhatsAppConfig) -> TransportResult<Self> {
        if config.api_key.is_empty() {
            return Err(TransportError::Configuration {
                message: "WABA_API_KEY is required".to_string(),
            });
        }
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| TransportError::Configuration {
                message: format!("failed to initialize HTTP client: {}", e),
            })?;
        Ok(Self { config, client })
    }

    async fn post_message(&self, payload: serde_json::Value) -> TransportResult<()> {
        let url = format!("{}/messages", self.config.api_url.trim_end_matches('/'));
        let response = self
            .client
            .post(&url)
            .header("D360-API-KEY", &self.config.api_key)
            .json(&payload)
            .send()
            .await
            .map_err(|e| TransportError::Network {
                message: format!("WhatsApp request failed: {}", e),
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TransportError::Rejected {
                message: format!("HTTP {}: {}", status, body),
            });
        }
        debug!("WhatsApp message accepted");
        Ok(())
    }
}

#[async_trait]
impl ChatTransport for WhatsAppTransport {
    async fn send(&self, to: &str, text: &str) -> TransportResult<()> {
        info!(to = %to, length = text.len(), "sending WhatsApp text message");
        self.post_message(json!({
            "messaging_product": "whatsapp",
            "recipient_type": "individual",
            "to": to,
            "type": "text",
            "text": { "body": text },
        }))
        .await
    }

    async fn send_with_button(
        &self,
        to: &str,
        text: &str,
        button_id: &str,
        button_title: &str,
    ) -> TransportResult<()> {
        info!(to = %to, button_id = %button_id, "sending WhatsApp interactive message");
        self.post_message(json!({
            "messaging_product": "whatsapp",
            "recipient_type": "individual",
            "to": to,
            "type": "interactive",
            "interactive": {
                "type": "button",
                "body": { "text": text },
                "action": {
                    "buttons": [{
                        "type": "reply",
                        "reply": { "id": button_id, "title": button_title },
                    }],
                },
            },
        }))
        .await
    }

    fn channel(&self) -> &'static str {
        "WHATSAPP"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_api_key_is_rejected() {
        let result = WhatsAppTransport::new(WhatsAppConfig {
            api_url: "https://waba.360dialog.io/v1".to_string(),
            api_key: String::new(),
            timeout_secs: 10,
        });
        assert!(result.is_err());
    }
}

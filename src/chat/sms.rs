//! SMS transport, used as the delivery fallback when WhatsApp fails.

use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;
use tracing::info;

use crate::chat::{ChatTransport, TransportError, TransportResult};

#[derive(Debug, Clone)]
pub struct SmsConfig {
    pub api_url: String,
    pub api_key: String,
    pub username: String,
    pub timeout_secs: u64,
}

pub struct SmsTransport {
    config: SmsConfig,
    client: Client,
}

impl SmsTransport {
    pub fn new(config: SmsConfig) -> TransportResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| TransportError::Configuration {
                message: format!("failed to initialize HTTP client: {}", e),
            })?;
        Ok(Self { config, client })
    }
}

#[async_trait]
impl ChatTransport for SmsTransport {
    async fn send(&self, to: &str, text: &str) -> TransportResult<()> {
        info!(to = %to, length = text.len(), "sending SMS");
        let response = self
            .client
            .post(&self.config.api_url)
            .header("apiKey", &self.config.api_key)
            .form(&[
                ("username", self.config.username.as_str()),
                ("to", &format!("+{}", to)),
                ("message", text),
            ])
            .send()
            .await
            .map_err(|e| TransportError::Network {
                message: format!("SMS request failed: {}", e),
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TransportError::Rejected {
                message: format!("HTTP {}: {}", status, body),
            });
        }
        Ok(())
    }

    /// SMS has no interactive buttons; the action is rendered as a reply
    /// instruction appended to the text.
    async fn send_with_button(
        &self,
        to: &str,
        text: &str,
        button_id: &str,
        button_title: &str,
    ) -> TransportResult<()> {
        let body = format!("{}\n\nReply \"{}\" to {}.", text, button_id, button_title);
        self.send(to, &body).await
    }

    fn channel(&self) -> &'static str {
        "SMS"
    }
}

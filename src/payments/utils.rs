use crate::payments::error::{GatewayError, GatewayResult};
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use std::time::Duration;
use tracing::warn;

/// Authentication applied to an outbound gateway request.
pub enum AuthScheme<'a> {
    Bearer(&'a str),
    Basic { username: &'a str, password: &'a str },
    None,
}

/// Thin HTTP client for provider calls: explicit timeout on every request,
/// bounded exponential backoff on network errors and 5xx/429 responses. API
/// errors (4xx) are never retried.
#[derive(Clone)]
pub struct GatewayHttpClient {
    client: Client,
    timeout: Duration,
    max_retries: u32,
}

impl GatewayHttpClient {
    pub fn new(timeout: Duration, max_retries: u32) -> GatewayResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| GatewayError::Network {
                message: format!("failed to initialize HTTP client: {}", e),
            })?;

        Ok(Self {
            client,
            timeout,
            max_retries,
        })
    }

    pub async fn request_json<T: DeserializeOwned>(
        &self,
        method: reqwest::Method,
        url: &str,
        auth: AuthScheme<'_>,
        body: Option<&JsonValue>,
    ) -> GatewayResult<T> {
        let mut last_error = None;
        for attempt in 0..=self.max_retries {
            let mut request = self.client.request(method.clone(), url);
            request = request.timeout(self.timeout);

            match &auth {
                AuthScheme::Bearer(token) => request = request.bearer_auth(token),
                AuthScheme::Basic { username, password } => {
                    request = request.basic_auth(username, Some(password))
                }
                AuthScheme::None => {}
            }
            if let Some(payload) = body {
                request = request.json(payload);
            }

            let response = request.send().await.map_err(|e| {
                if e.is_timeout() {
                    GatewayError::Timeout {
                        seconds: self.timeout.as_secs(),
                    }
                } else {
                    GatewayError::Network {
                        message: format!("provider request failed: {}", e),
                    }
                }
            });

            match response {
                Ok(resp) => {
                    let status = resp.status();
                    let text = resp.text().await.unwrap_or_default();
                    if status.is_success() {
                        return serde_json::from_str::<T>(&text).map_err(|e| {
                            GatewayError::InvalidResponse {
                                message: format!("invalid provider JSON response: {}", e),
                            }
                        });
                    }

                    if status.as_u16() == 401 || status.as_u16() == 403 {
                        return Err(GatewayError::Auth {
                            message: format!("HTTP {}: {}", status, text),
                        });
                    }

                    let retryable = status.is_server_error() || status.as_u16() == 429;
                    if retryable && attempt < self.max_retries {
                        warn!(
                            status = %status,
                            attempt = attempt + 1,
                            "provider returned retryable error, backing off"
                        );
                        tokio::time::sleep(Duration::from_secs(1 << attempt)).await;
                        continue;
                    }

                    return Err(GatewayError::Rejected {
                        message: format!("HTTP {}: {}", status, text),
                        status: Some(status.as_u16()),
                    });
                }
                Err(e) => {
                    let retryable = e.is_retryable();
                    last_error = Some(e);
                    if retryable && attempt < self.max_retries {
                        tokio::time::sleep(Duration::from_secs(1 << attempt)).await;
                        continue;
                    }
                    break;
                }
            }
        }

        Err(last_error.unwrap_or(GatewayError::Network {
            message: "provider request failed".to_string(),
        }))
    }
}

/// Escape XML special characters in free-text fields. Daraja processes
/// AccountReference and TransactionDesc through XML internally; unescaped
/// `&`, `<` or `>` cause opaque parsing failures on the provider side.
pub fn sanitize_xml_text(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

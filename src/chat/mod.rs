//! Chat transport boundary: outbound message delivery to users.

pub mod sms;
pub mod whatsapp;

use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("Chat transport network error: {message}")]
    Network { message: String },

    #[error("Chat transport rejected message: {message}")]
    Rejected { message: String },

    #[error("Chat transport configuration error: {message}")]
    Configuration { message: String },
}

pub type TransportResult<T> = Result<T, TransportError>;

/// Outbound chat delivery. Implementations are pure boundary adapters; the
/// services formatting messages never see transport detail.
#[async_trait]
pub trait ChatTransport: Send + Sync {
    async fn send(&self, to: &str, text: &str) -> TransportResult<()>;

    /// Send a message with a single interactive reply button. Transports
    /// without button support render the button id as a text instruction.
    async fn send_with_button(
        &self,
        to: &str,
        text: &str,
        button_id: &str,
        button_title: &str,
    ) -> TransportResult<()>;

    fn channel(&self) -> &'static str;
}

/// Tries the primary transport and degrades to the fallback on failure
/// (WhatsApp first, SMS second in the default wiring).
pub struct FallbackTransport {
    primary: Arc<dyn ChatTransport>,
    fallback: Arc<dyn ChatTransport>,
}

impl FallbackTransport {
    pub fn new(primary: Arc<dyn ChatTransport>, fallback: Arc<dyn ChatTransport>) -> Self {
        Self { primary, fallback }
    }
}

#[async_trait]
impl ChatTransport for FallbackTransport {
    async fn send(&self, to: &str, text: &str) -> TransportResult<()> {
        match self.primary.send(to, text).await {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!(
                    to = %to,
                    primary = self.primary.channel(),
                    fallback = self.fallback.channel(),
                    error = %e,
                    "primary transport failed, falling back"
                );
                self.fallback.send(to, text).await
            }
        }
    }

    async fn send_with_button(
        &self,
        to: &str,
        text: &str,
        button_id: &str,
        button_title: &str,
    ) -> TransportResult<()> {
        match self
            .primary
            .send_with_button(to, text, button_id, button_title)
            .await
        {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!(
                    to = %to,
                    primary = self.primary.channel(),
                    error = %e,
                    "primary transport failed for button message, falling back"
                );
                self.fallback
                    .send_with_button(to, text, button_id, button_title)
                    .await
            }
        }
    }

    fn channel(&self) -> &'static str {
        self.primary.channel()
    }
}

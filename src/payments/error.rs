use thiserror::Error;

pub type GatewayResult<T> = Result<T, GatewayError>;

/// Errors surfaced by the payment gateway adapter. The adapter fails closed:
/// every transport or non-success response becomes one of these variants,
/// never a silently-swallowed partial result.
#[derive(Debug, Clone, Error)]
pub enum GatewayError {
    #[error("Gateway authentication failed: {message}")]
    Auth { message: String },

    #[error("Gateway network error: {message}")]
    Network { message: String },

    #[error("Gateway request timed out after {seconds}s")]
    Timeout { seconds: u64 },

    #[error("Gateway rejected request: {message}")]
    Rejected {
        message: String,
        status: Option<u16>,
    },

    #[error("Invalid gateway response: {message}")]
    InvalidResponse { message: String },

    #[error("Gateway configuration error: {message}")]
    Configuration { message: String },
}

impl GatewayError {
    pub fn is_retryable(&self) -> bool {
        match self {
            GatewayError::Network { .. } | GatewayError::Timeout { .. } => true,
            GatewayError::Rejected { status, .. } => {
                matches!(status, Some(s) if *s >= 500 || *s == 429)
            }
            GatewayError::Auth { .. }
            | GatewayError::InvalidResponse { .. }
            | GatewayError::Configuration { .. } => false,
        }
    }

    /// Plain-language rendering for chat users. Internal detail stays in the
    /// logs.
    pub fn user_message(&self) -> String {
        match self {
            GatewayError::Timeout { .. } => {
                "Payment service timed out. Please try again.".to_string()
            }
            GatewayError::Network { .. } | GatewayError::Rejected { .. } => {
                "Payment service is temporarily unavailable. Please try again shortly.".to_string()
            }
            GatewayError::Auth { .. }
            | GatewayError::InvalidResponse { .. }
            | GatewayError::Configuration { .. } => {
                "Payment could not be started. Please contact support.".to_string()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_flags_are_set() {
        assert!(GatewayError::Timeout { seconds: 30 }.is_retryable());
        assert!(GatewayError::Network {
            message: "connection reset".to_string()
        }
        .is_retryable());
        assert!(GatewayError::Rejected {
            message: "server error".to_string(),
            status: Some(503)
        }
        .is_retryable());
        assert!(!GatewayError::Rejected {
            message: "bad request".to_string(),
            status: Some(400)
        }
        .is_retryable());
        assert!(!GatewayError::Auth {
            message: "invalid credentials".to_string()
        }
        .is_retryable());
    }

    #[test]
    fn user_messages_never_leak_internals() {
        let err = GatewayError::Rejected {
            message: "HTTP 500: {\"errorCode\":\"500.001.1001\"}".to_string(),
            status: Some(500),
        };
        assert!(!err.user_message().contains("500.001.1001"));
    }
}

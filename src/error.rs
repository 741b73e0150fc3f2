//! Unified error handling for the InvoiceIQ backend.
//!
//! Provides a single application error type with HTTP status mapping,
//! machine-readable error codes and user-friendly messages, rendered as a
//! consistent JSON envelope at the API edge.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::database::error::{DatabaseError, DatabaseErrorKind};
use crate::payments::error::GatewayError;
use crate::services::payment_flow::PaymentFlowError;

/// Error codes for programmatic client handling
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum ErrorCode {
    // Domain errors (4xx)
    #[serde(rename = "INVOICE_NOT_FOUND")]
    InvoiceNotFound,
    #[serde(rename = "PAYMENT_NOT_FOUND")]
    PaymentNotFound,
    #[serde(rename = "INVALID_INVOICE_STATUS")]
    InvalidInvoiceStatus,
    #[serde(rename = "RETRY_DENIED")]
    RetryDenied,

    // Infrastructure errors (5xx)
    #[serde(rename = "DATABASE_ERROR")]
    DatabaseError,
    #[serde(rename = "CONFIGURATION_ERROR")]
    ConfigurationError,

    // External errors (502, 504)
    #[serde(rename = "PAYMENT_PROVIDER_ERROR")]
    PaymentProviderError,
    #[serde(rename = "EXTERNAL_SERVICE_TIMEOUT")]
    ExternalServiceTimeout,

    // Generic
    #[serde(rename = "INTERNAL_ERROR")]
    InternalError,
    #[serde(rename = "VALIDATION_ERROR")]
    ValidationError,
}

/// Domain-specific business logic errors
#[derive(Debug, Clone)]
pub enum DomainError {
    InvoiceNotFound { invoice_id: String },
    PaymentNotFound { invoice_id: String },
    InvalidInvoiceStatus { current: String },
    RetryDenied { reason: String },
}

/// Infrastructure-level errors (database, configuration)
#[derive(Debug, Clone)]
pub enum InfrastructureError {
    Database { message: String, is_retryable: bool },
    Configuration { message: String },
}

/// External service errors (payment provider, chat transport)
#[derive(Debug, Clone)]
pub enum ExternalError {
    PaymentProvider {
        message: String,
        is_retryable: bool,
    },
    Timeout {
        service: String,
        timeout_secs: u64,
    },
}

/// Input validation errors
#[derive(Debug, Clone)]
pub enum ValidationError {
    InvalidMsisdn { reason: String },
    InvalidAmount { amount: String, reason: String },
    MissingField { field: String },
    OutOfRange { field: String, message: String },
}

/// Unified application error type
#[derive(Debug, Clone)]
pub struct AppError {
    pub kind: AppErrorKind,
    pub context: Option<String>,
}

#[derive(Debug, Clone)]
pub enum AppErrorKind {
    Domain(DomainError),
    Infrastructure(InfrastructureError),
    External(ExternalError),
    Validation(ValidationError),
}

impl AppError {
    pub fn new(kind: AppErrorKind) -> Self {
        Self {
            kind,
            context: None,
        }
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    /// Map error to HTTP status code
    pub fn status_code(&self) -> StatusCode {
        match &self.kind {
            AppErrorKind::Domain(err) => match err {
                DomainError::InvoiceNotFound { .. } => StatusCode::NOT_FOUND,
                DomainError::PaymentNotFound { .. } => StatusCode::NOT_FOUND,
                DomainError::InvalidInvoiceStatus { .. } => StatusCode::BAD_REQUEST,
                DomainError::RetryDenied { .. } => StatusCode::BAD_REQUEST,
            },
            AppErrorKind::Infrastructure(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppErrorKind::External(err) => match err {
                ExternalError::PaymentProvider { .. } => StatusCode::BAD_GATEWAY,
                ExternalError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            },
            AppErrorKind::Validation(_) => StatusCode::BAD_REQUEST,
        }
    }

    /// Get error code for client handling
    pub fn error_code(&self) -> ErrorCode {
        match &self.kind {
            AppErrorKind::Domain(err) => match err {
                DomainError::InvoiceNotFound { .. } => ErrorCode::InvoiceNotFound,
                DomainError::PaymentNotFound { .. } => ErrorCode::PaymentNotFound,
                DomainError::InvalidInvoiceStatus { .. } => ErrorCode::InvalidInvoiceStatus,
                DomainError::RetryDenied { .. } => ErrorCode::RetryDenied,
            },
            AppErrorKind::Infrastructure(err) => match err {
                InfrastructureError::Database { .. } => ErrorCode::DatabaseError,
                InfrastructureError::Configuration { .. } => ErrorCode::ConfigurationError,
            },
            AppErrorKind::External(err) => match err {
                ExternalError::PaymentProvider { .. } => ErrorCode::PaymentProviderError,
                ExternalError::Timeout { .. } => ErrorCode::ExternalServiceTimeout,
            },
            AppErrorKind::Validation(_) => ErrorCode::ValidationError,
        }
    }

    /// Get user-friendly error message
    pub fn user_message(&self) -> String {
        match &self.kind {
            AppErrorKind::Domain(err) => match err {
                DomainError::InvoiceNotFound { invoice_id } => {
                    format!("Invoice '{}' not found", invoice_id)
                }
                DomainError::PaymentNotFound { invoice_id } => {
                    format!("No payment record found for invoice '{}'", invoice_id)
                }
                DomainError::InvalidInvoiceStatus { current } => {
                    format!(
                        "Invoice status must be SENT or FAILED (current: {})",
                        current
                    )
                }
                DomainError::RetryDenied { reason } => reason.clone(),
            },
            AppErrorKind::Infrastructure(_) => {
                "Service temporarily unavailable. Please try again later".to_string()
            }
            AppErrorKind::External(err) => match err {
                ExternalError::PaymentProvider { is_retryable, .. } => {
                    if *is_retryable {
                        "Payment provider is temporarily unavailable. Please try again"
                            .to_string()
                    } else {
                        "Payment processing failed. Please contact support".to_string()
                    }
                }
                ExternalError::Timeout {
                    service,
                    timeout_secs,
                } => {
                    format!(
                        "{} request timed out after {} seconds. Please try again",
                        service, timeout_secs
                    )
                }
            },
            AppErrorKind::Validation(err) => match err {
                ValidationError::InvalidMsisdn { reason } => {
                    format!("Invalid phone number: {}", reason)
                }
                ValidationError::InvalidAmount { amount, reason } => {
                    format!("Invalid amount '{}': {}", amount, reason)
                }
                ValidationError::MissingField { field } => {
                    format!("Required field '{}' is missing", field)
                }
                ValidationError::OutOfRange { field, message } => {
                    format!("Field '{}' is out of range: {}", field, message)
                }
            },
        }
    }

    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        match &self.kind {
            AppErrorKind::Domain(err) => {
                matches!(err, DomainError::RetryDenied { .. })
            }
            AppErrorKind::Infrastructure(err) => match err {
                InfrastructureError::Database { is_retryable, .. } => *is_retryable,
                InfrastructureError::Configuration { .. } => false,
            },
            AppErrorKind::External(err) => match err {
                ExternalError::PaymentProvider { is_retryable, .. } => *is_retryable,
                ExternalError::Timeout { .. } => true,
            },
            AppErrorKind::Validation(_) => false,
        }
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.user_message())
    }
}

impl std::error::Error for AppError {}

impl From<DatabaseError> for AppError {
    fn from(err: DatabaseError) -> Self {
        let is_retryable = err.is_retryable();
        let kind = match &err.kind {
            DatabaseErrorKind::NotFound { entity, id } if entity == "Invoice" => {
                AppErrorKind::Domain(DomainError::InvoiceNotFound {
                    invoice_id: id.clone(),
                })
            }
            _ => AppErrorKind::Infrastructure(InfrastructureError::Database {
                message: err.to_string(),
                is_retryable,
            }),
        };
        AppError::new(kind)
    }
}

impl From<GatewayError> for AppError {
    fn from(err: GatewayError) -> Self {
        let kind = match &err {
            GatewayError::Timeout { seconds } => AppErrorKind::External(ExternalError::Timeout {
                service: "M-PESA".to_string(),
                timeout_secs: *seconds,
            }),
            _ => AppErrorKind::External(ExternalError::PaymentProvider {
                message: err.to_string(),
                is_retryable: err.is_retryable(),
            }),
        };
        AppError::new(kind)
    }
}

impl From<PaymentFlowError> for AppError {
    fn from(err: PaymentFlowError) -> Self {
        match err {
            PaymentFlowError::InvoiceNotFound { invoice_id } => {
                AppError::new(AppErrorKind::Domain(DomainError::InvoiceNotFound {
                    invoice_id,
                }))
            }
            PaymentFlowError::PaymentNotFound { invoice_id } => {
                AppError::new(AppErrorKind::Domain(DomainError::PaymentNotFound {
                    invoice_id,
                }))
            }
            PaymentFlowError::InvalidInvoiceStatus { current } => {
                AppError::new(AppErrorKind::Domain(DomainError::InvalidInvoiceStatus {
                    current: current.to_string(),
                }))
            }
            PaymentFlowError::RetryDenied { reason } => {
                AppError::new(AppErrorKind::Domain(DomainError::RetryDenied { reason }))
            }
            PaymentFlowError::Gateway(e) => e.into(),
            PaymentFlowError::Database(e) => e.into(),
        }
    }
}

/// Standardized error response structure returned to clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: ErrorCode,
    pub message: String,
    pub timestamp: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retryable: Option<bool>,
}

impl ErrorResponse {
    pub fn from_app_error(error: &AppError) -> Self {
        Self {
            error: error.error_code(),
            message: error.user_message(),
            timestamp: Utc::now().to_rfc3339(),
            retryable: Some(error.is_retryable()),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = ErrorResponse::from_app_error(&self);
        (status, Json(body)).into_response()
    }
}

/// Result type for operations that can fail with AppError
pub type AppResult<T> = Result<T, AppError>;

//! Services module for business logic and integrations

pub mod conversation;
pub mod idempotency;
pub mod intake;
pub mod notification;
pub mod payment_flow;
pub mod reconciler;
pub mod retry_policy;

pub use conversation::{ConversationEngine, InMemorySessionStore, SessionStore};
pub use idempotency::{generate_idempotency_key, IdempotencyGuard};
pub use intake::{InboundKind, InboundMessage, IntakeService};
pub use notification::{NotificationService, ReceiptDispatcher};
pub use payment_flow::{CompletionOutcome, PaymentFlow, PaymentFlowError};
pub use reconciler::{CallbackAck, CallbackReconciler};
pub use retry_policy::{RetryDecision, RetryPolicy};

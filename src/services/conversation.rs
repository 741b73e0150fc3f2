//! Conversational intake state machine.
//!
//! Per-user dialogue state drives collection of invoice fields:
//! `IDLE → COLLECT_PHONE → COLLECT_NAME → COLLECT_AMOUNT →
//! COLLECT_DESCRIPTION → READY`. Each state validates its input before
//! advancing and re-prompts on failure without advancing. The literal input
//! "cancel" resets any non-idle state to IDLE, discarding collected data.
//!
//! Session storage is an injected dependency so single-instance deployments
//! can use the in-memory map and multi-instance deployments can back it with
//! an external keyed cache.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

use crate::phone::normalize_msisdn;

pub const NAME_MIN_LEN: usize = 2;
pub const NAME_MAX_LEN: usize = 60;
pub const DESCRIPTION_MIN_LEN: usize = 3;
pub const DESCRIPTION_MAX_LEN: usize = 120;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionState {
    Idle,
    CollectPhone,
    CollectName,
    CollectAmount,
    CollectDescription,
    Ready,
}

/// Partially-collected invoice fields for one user's dialogue.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionData {
    pub customer_msisdn: Option<String>,
    pub customer_name: Option<String>,
    pub amount_cents: Option<i64>,
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub state: SessionState,
    pub data: SessionData,
}

impl Default for Session {
    fn default() -> Self {
        Self {
            state: SessionState::Idle,
            data: SessionData::default(),
        }
    }
}

/// Completed field set handed to invoice creation on confirmation.
#[derive(Debug, Clone, PartialEq)]
pub struct InvoiceDraft {
    pub customer_msisdn: String,
    pub customer_name: Option<String>,
    pub amount_cents: i64,
    pub description: String,
}

/// What happened on this turn of the dialogue.
#[derive(Debug, Clone, PartialEq)]
pub enum FlowEvent {
    Started,
    Prompted,
    ValidationError,
    Cancelled,
    Confirmed(InvoiceDraft),
}

#[derive(Debug, Clone, PartialEq)]
pub struct FlowReply {
    pub response: Option<String>,
    pub event: FlowEvent,
}

impl FlowReply {
    fn prompt(event: FlowEvent, text: impl Into<String>) -> Self {
        Self {
            response: Some(text.into()),
            event,
        }
    }
}

fn preview(data: &SessionData) -> String {
    let amount_cents = data.amount_cents.unwrap_or(0);
    format!(
        "Here's your invoice:\n\nCustomer: {}\nPhone: {}\nAmount: KES {}.{:02}\nDescription: {}\n\nSend 'confirm' to create the invoice or 'cancel' to start over.",
        data.customer_name.as_deref().unwrap_or("(not given)"),
        data.customer_msisdn.as_deref().unwrap_or(""),
        amount_cents / 100,
        amount_cents % 100,
        data.description.as_deref().unwrap_or(""),
    )
}

/// One turn of the dialogue as a pure transition: `(session, input) →
/// (session', reply)`. All I/O stays in the engine around it.
pub fn step(session: &Session, input: &str) -> (Session, FlowReply) {
    let text = input.trim();

    // "cancel" is accepted in any non-idle state and unconditionally resets.
    if session.state != SessionState::Idle && text.eq_ignore_ascii_case("cancel") {
        return (
            Session::default(),
            FlowReply::prompt(
                FlowEvent::Cancelled,
                "Invoice cancelled. Send 'invoice' to start again.",
            ),
        );
    }

    match session.state {
        SessionState::Idle => (
            Session {
                state: SessionState::CollectPhone,
                data: SessionData::default(),
            },
            FlowReply::prompt(
                FlowEvent::Started,
                "Let's create an invoice!\n\nFirst, please send the customer's phone number (e.g. 254712345678):",
            ),
        ),

        SessionState::CollectPhone => match normalize_msisdn(text) {
            Ok(msisdn) => {
                let mut data = session.data.clone();
                data.customer_msisdn = Some(msisdn);
                (
                    Session {
                        state: SessionState::CollectName,
                        data,
                    },
                    FlowReply::prompt(
                        FlowEvent::Prompted,
                        "Perfect! What is the customer's name? (or send '-' to skip)",
                    ),
                )
            }
            Err(e) => (
                session.clone(),
                FlowReply::prompt(
                    FlowEvent::ValidationError,
                    format!(
                        "Invalid phone number. Please try again (e.g. 254712345678 or 0712345678):\n{}",
                        e
                    ),
                ),
            ),
        },

        SessionState::CollectName => {
            let mut data = session.data.clone();
            if text == "-" {
                data.customer_name = None;
            } else {
                let len = text.chars().count();
                if !(NAME_MIN_LEN..=NAME_MAX_LEN).contains(&len) {
                    return (
                        session.clone(),
                        FlowReply::prompt(
                            FlowEvent::ValidationError,
                            format!(
                                "Name must be between {} and {} characters. Please try again (or send '-' to skip):",
                                NAME_MIN_LEN, NAME_MAX_LEN
                            ),
                        ),
                    );
                }
                data.customer_name = Some(text.to_string());
            }
            (
                Session {
                    state: SessionState::CollectAmount,
                    data,
                },
                FlowReply::prompt(
                    FlowEvent::Prompted,
                    "How much is the invoice for? Send the amount in whole KES (e.g. 1500):",
                ),
            )
        }

        SessionState::CollectAmount => match text.parse::<i64>() {
            Ok(amount_kes) if amount_kes > 0 => {
                let mut data = session.data.clone();
                data.amount_cents = Some(amount_kes * 100);
                (
                    Session {
                        state: SessionState::CollectDescription,
                        data,
                    },
                    FlowReply::prompt(
                        FlowEvent::Prompted,
                        "What is this invoice for? Send a short description (3-120 characters):",
                    ),
                )
            }
            _ => (
                session.clone(),
                FlowReply::prompt(
                    FlowEvent::ValidationError,
                    "Amount must be a positive whole number of KES. Please try again:",
                ),
            ),
        },

        SessionState::CollectDescription => {
            let len = text.chars().count();
            if !(DESCRIPTION_MIN_LEN..=DESCRIPTION_MAX_LEN).contains(&len) {
                return (
                    session.clone(),
                    FlowReply::prompt(
                        FlowEvent::ValidationError,
                        format!(
                            "Description must be between {} and {} characters. Please try again:",
                            DESCRIPTION_MIN_LEN, DESCRIPTION_MAX_LEN
                        ),
                    ),
                );
            }
            let mut data = session.data.clone();
            data.description = Some(text.to_string());
            let reply = FlowReply::prompt(FlowEvent::Prompted, preview(&data));
            (
                Session {
                    state: SessionState::Ready,
                    data,
                },
                reply,
            )
        }

        SessionState::Ready => {
            if text.eq_ignore_ascii_case("confirm") {
                let data = &session.data;
                // Every field was validated on the way into READY.
                let draft = InvoiceDraft {
                    customer_msisdn: data.customer_msisdn.clone().unwrap_or_default(),
                    customer_name: data.customer_name.clone(),
                    amount_cents: data.amount_cents.unwrap_or_default(),
                    description: data.description.clone().unwrap_or_default(),
                };
                (
                    Session::default(),
                    FlowReply {
                        response: None,
                        event: FlowEvent::Confirmed(draft),
                    },
                )
            } else {
                (
                    session.clone(),
                    FlowReply::prompt(
                        FlowEvent::ValidationError,
                        "Please send 'confirm' to create the invoice or 'cancel' to start over.",
                    ),
                )
            }
        }
    }
}

// ============================================================================
// Session storage
// ============================================================================

#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn load(&self, user_id: &str) -> Session;
    async fn save(&self, user_id: &str, session: Session);
    async fn clear(&self, user_id: &str);
}

/// Keyed in-memory session map for single-instance deployments.
#[derive(Default)]
pub struct InMemorySessionStore {
    sessions: RwLock<HashMap<String, Session>>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn load(&self, user_id: &str) -> Session {
        self.sessions
            .read()
            .await
            .get(user_id)
            .cloned()
            .unwrap_or_default()
    }

    async fn save(&self, user_id: &str, session: Session) {
        // Idle sessions with no data are dropped instead of stored so the
        // map only holds users mid-dialogue.
        let mut sessions = self.sessions.write().await;
        if session.state == SessionState::Idle {
            sessions.remove(user_id);
        } else {
            sessions.insert(user_id.to_string(), session);
        }
    }

    async fn clear(&self, user_id: &str) {
        self.sessions.write().await.remove(user_id);
    }
}

/// Drives the per-user dialogue against a session store. Concurrent messages
/// from the same user are rare; last-write-wins on the session row is
/// acceptable for this flow.
pub struct ConversationEngine {
    store: Arc<dyn SessionStore>,
}

impl ConversationEngine {
    pub fn new(store: Arc<dyn SessionStore>) -> Self {
        Self { store }
    }

    pub async fn is_in_flow(&self, user_id: &str) -> bool {
        self.store.load(user_id).await.state != SessionState::Idle
    }

    pub async fn handle_message(&self, user_id: &str, text: &str) -> FlowReply {
        let session = self.store.load(user_id).await;
        let from_state = session.state;
        let (next, reply) = step(&session, text);
        debug!(
            from_state = ?from_state,
            to_state = ?next.state,
            event = ?reply.event,
            "conversation transition"
        );
        self.store.save(user_id, next).await;
        reply
    }

    pub async fn reset(&self, user_id: &str) {
        self.store.clear(user_id).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn advance(session: Session, input: &str) -> (Session, FlowReply) {
        step(&session, input)
    }

    fn session_at_ready() -> Session {
        let (s, _) = advance(Session::default(), "invoice");
        let (s, _) = advance(s, "254712345678");
        let (s, _) = advance(s, "Jane Doe");
        let (s, _) = advance(s, "1500");
        let (s, reply) = advance(s, "House cleaning services");
        assert_eq!(s.state, SessionState::Ready);
        assert!(reply.response.unwrap().contains("confirm"));
        s
    }

    #[test]
    fn full_flow_collects_and_confirms() {
        let ready = session_at_ready();
        let (s, reply) = advance(ready, "confirm");
        assert_eq!(s, Session::default());
        match reply.event {
            FlowEvent::Confirmed(draft) => {
                assert_eq!(draft.customer_msisdn, "254712345678");
                assert_eq!(draft.customer_name.as_deref(), Some("Jane Doe"));
                assert_eq!(draft.amount_cents, 150_000);
                assert_eq!(draft.description, "House cleaning services");
            }
            other => panic!("expected confirmation, got {:?}", other),
        }
    }

    #[test]
    fn cancel_resets_from_every_non_idle_state() {
        let mut sessions = vec![];
        let (s, _) = advance(Session::default(), "invoice");
        sessions.push(s.clone());
        let (s, _) = advance(s, "254712345678");
        sessions.push(s.clone());
        let (s, _) = advance(s, "Jane");
        sessions.push(s.clone());
        let (s, _) = advance(s, "1500");
        sessions.push(s.clone());
        let (s, _) = advance(s, "Cleaning work");
        sessions.push(s);

        for session in sessions {
            let (next, reply) = advance(session, "cancel");
            assert_eq!(next.state, SessionState::Idle);
            assert_eq!(next.data, SessionData::default());
            assert_eq!(reply.event, FlowEvent::Cancelled);
        }
    }

    #[test]
    fn invalid_phone_reprompts_without_advancing() {
        let (s, _) = advance(Session::default(), "invoice");
        let (next, reply) = advance(s.clone(), "not-a-phone");
        assert_eq!(next.state, SessionState::CollectPhone);
        assert_eq!(reply.event, FlowEvent::ValidationError);
        assert_eq!(next.data, s.data);
    }

    #[test]
    fn phone_is_normalized_on_entry() {
        let (s, _) = advance(Session::default(), "invoice");
        let (next, _) = advance(s, "0712345678");
        assert_eq!(
            next.data.customer_msisdn.as_deref(),
            Some("254712345678")
        );
    }

    #[test]
    fn name_can_be_skipped_with_dash() {
        let (s, _) = advance(Session::default(), "invoice");
        let (s, _) = advance(s, "254712345678");
        let (next, _) = advance(s, "-");
        assert_eq!(next.state, SessionState::CollectAmount);
        assert!(next.data.customer_name.is_none());
    }

    #[test]
    fn name_length_bounds_are_enforced() {
        let (s, _) = advance(Session::default(), "invoice");
        let (s, _) = advance(s, "254712345678");
        let (next, reply) = advance(s.clone(), "J");
        assert_eq!(reply.event, FlowEvent::ValidationError);
        assert_eq!(next.state, SessionState::CollectName);

        let long_name = "x".repeat(61);
        let (_, reply) = advance(s, &long_name);
        assert_eq!(reply.event, FlowEvent::ValidationError);
    }

    #[test]
    fn amount_must_be_positive_integer() {
        let (s, _) = advance(Session::default(), "invoice");
        let (s, _) = advance(s, "254712345678");
        let (s, _) = advance(s, "-");
        for bad in ["0", "-5", "12.50", "lots"] {
            let (next, reply) = advance(s.clone(), bad);
            assert_eq!(reply.event, FlowEvent::ValidationError, "input: {bad}");
            assert_eq!(next.state, SessionState::CollectAmount);
        }
        let (next, _) = advance(s, "250");
        assert_eq!(next.data.amount_cents, Some(25_000));
    }

    #[test]
    fn description_length_bounds_are_enforced() {
        let (s, _) = advance(Session::default(), "invoice");
        let (s, _) = advance(s, "254712345678");
        let (s, _) = advance(s, "-");
        let (s, _) = advance(s, "100");
        let (_, reply) = advance(s.clone(), "ab");
        assert_eq!(reply.event, FlowEvent::ValidationError);
        let long_desc = "x".repeat(121);
        let (_, reply) = advance(s.clone(), &long_desc);
        assert_eq!(reply.event, FlowEvent::ValidationError);
        let (next, _) = advance(s, "abc");
        assert_eq!(next.state, SessionState::Ready);
    }

    #[test]
    fn ready_rejects_anything_but_confirm_and_cancel() {
        let ready = session_at_ready();
        let (next, reply) = advance(ready.clone(), "yes please");
        assert_eq!(next.state, SessionState::Ready);
        assert_eq!(reply.event, FlowEvent::ValidationError);
        assert_eq!(next.data, ready.data);
    }

    #[tokio::test]
    async fn sessions_are_independent_per_user() {
        let engine = ConversationEngine::new(Arc::new(InMemorySessionStore::new()));
        engine.handle_message("254700000001", "invoice").await;
        engine.handle_message("254700000002", "invoice").await;
        engine
            .handle_message("254700000001", "254712345678")
            .await;

        // User 2 is still collecting a phone number; user 1 has moved on.
        assert!(engine.is_in_flow("254700000001").await);
        assert!(engine.is_in_flow("254700000002").await);

        engine.handle_message("254700000002", "cancel").await;
        assert!(!engine.is_in_flow("254700000002").await);
        assert!(engine.is_in_flow("254700000001").await);
    }

    #[tokio::test]
    async fn engine_round_trips_state_through_store() {
        let engine = ConversationEngine::new(Arc::new(InMemorySessionStore::new()));
        let reply = engine.handle_message("u1", "invoice").await;
        assert_eq!(reply.event, FlowEvent::Started);
        let reply = engine.handle_message("u1", "254712345678").await;
        assert_eq!(reply.event, FlowEvent::Prompted);
        let reply = engine.handle_message("u1", "cancel").await;
        assert_eq!(reply.event, FlowEvent::Cancelled);
        assert!(!engine.is_in_flow("u1").await);
    }
}

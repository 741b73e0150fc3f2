//! Retry eligibility for failed payments.
//!
//! Two independent gates, both of which must pass: an attempt ceiling and a
//! cooldown window since the payment last changed. The retry counter on the
//! payment row is owned by this policy: it is read here and incremented in
//! exactly one place (the approved-retry branch of the initiation path).

use chrono::{DateTime, Utc};
use std::time::Duration;

use crate::database::store::Payment;

/// Ceiling of one retry: two total attempts per payment.
pub const DEFAULT_MAX_RETRIES: i32 = 1;

/// Canonical cooldown between attempts. The source of record applies a single
/// value on every retry path.
pub const DEFAULT_RETRY_COOLDOWN_SECS: u64 = 90;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    Allowed,
    MaxAttemptsReached,
    CooldownActive { remaining_secs: u64 },
}

impl RetryDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, RetryDecision::Allowed)
    }

    /// User-facing denial reason; `None` when the retry is allowed.
    pub fn denial_reason(&self) -> Option<String> {
        match self {
            RetryDecision::Allowed => None,
            RetryDecision::MaxAttemptsReached => {
                Some("Maximum payment attempts reached. Please contact support.".to_string())
            }
            RetryDecision::CooldownActive { remaining_secs } => Some(format!(
                "Please wait {} seconds before retrying payment.",
                remaining_secs
            )),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_retries: i32,
    cooldown: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            cooldown: Duration::from_secs(DEFAULT_RETRY_COOLDOWN_SECS),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: i32, cooldown: Duration) -> Self {
        Self {
            max_retries,
            cooldown,
        }
    }

    /// Evaluate both gates against `now`. The attempt ceiling is checked
    /// first: once exhausted, no amount of elapsed time re-opens the payment.
    pub fn evaluate(&self, payment: &Payment, now: DateTime<Utc>) -> RetryDecision {
        if payment.retry_count >= self.max_retries {
            tracing::warn!(
                payment_id = %payment.id,
                retry_count = payment.retry_count,
                max_retries = self.max_retries,
                "payment retry blocked: max retry count reached"
            );
            return RetryDecision::MaxAttemptsReached;
        }

        let elapsed = now.signed_duration_since(payment.updated_at);
        let cooldown_secs = self.cooldown.as_secs() as i64;
        if elapsed.num_seconds() < cooldown_secs {
            let remaining = (cooldown_secs - elapsed.num_seconds()).max(0) as u64;
            tracing::info!(
                payment_id = %payment.id,
                remaining_secs = remaining,
                "payment retry blocked: cooldown not yet elapsed"
            );
            return RetryDecision::CooldownActive {
                remaining_secs: remaining,
            };
        }

        tracing::info!(
            payment_id = %payment.id,
            retry_count = payment.retry_count,
            "payment retry allowed"
        );
        RetryDecision::Allowed
    }
}

//! Billing error taxonomy
//!
//! The webhook response policy hangs off this taxonomy: signature failures
//! map to 400, unusable or conflicting events are acknowledged with 200 so
//! the gateway stops retrying, and transient failures map to 5xx so the
//! gateway's own retry mechanism re-delivers.

use thiserror::Error;

pub type BillingResult<T> = Result<T, BillingError>;

#[derive(Debug, Error)]
pub enum BillingError {
    /// Signature header missing or HMAC mismatch. Rejected, never retried.
    #[error("webhook signature invalid")]
    InvalidSignature,

    /// Payload is missing required fields or fails schema validation.
    /// The data is unusable; logged and acknowledged without any write.
    #[error("malformed payload: {0}")]
    MalformedPayload(String),

    /// Event references state that cannot accept it (e.g. a renewal for a
    /// cancelled subscription). Logged as a warning, event is a no-op.
    #[error("conflicting state: {0}")]
    ConflictingState(String),

    #[error("account not found: {0}")]
    AccountNotFound(String),

    #[error("subscription not found: {0}")]
    SubscriptionNotFound(String),

    /// Outbound call exceeded its deadline. Retryable.
    #[error("upstream request timed out")]
    UpstreamTimeout,

    /// Gateway or email provider returned an error response. Retryable.
    #[error("upstream error{}: {message}", status.map(|s| format!(" ({s})")).unwrap_or_default())]
    Upstream {
        status: Option<u16>,
        message: String,
    },

    #[error("database error: {0}")]
    Database(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl BillingError {
    /// Whether a retry could plausibly succeed. Transient errors make the
    /// webhook endpoint return non-2xx so the gateway re-delivers.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BillingError::UpstreamTimeout
                | BillingError::Upstream { .. }
                | BillingError::Database(_)
        )
    }

    /// Errors that must be acknowledged with 200 so the gateway does not
    /// endlessly retry payloads we can never process.
    pub fn is_acknowledgeable(&self) -> bool {
        matches!(
            self,
            BillingError::MalformedPayload(_)
                | BillingError::ConflictingState(_)
                | BillingError::AccountNotFound(_)
                | BillingError::SubscriptionNotFound(_)
        )
    }

    pub fn malformed(context: impl Into<String>) -> Self {
        BillingError::MalformedPayload(context.into())
    }

    pub fn conflict(context: impl Into<String>) -> Self {
        BillingError::ConflictingState(context.into())
    }
}

/// Unique-constraint violations coming out of reconciliation writes are
/// business conflicts (a second billable subscription, a reused reference),
/// not transient database failures.
pub fn is_unique_violation(e: &sqlx::Error) -> bool {
    matches!(e, sqlx::Error::Database(db) if db.is_unique_violation())
}

impl From<sqlx::Error> for BillingError {
    fn from(e: sqlx::Error) -> Self {
        BillingError::Database(e.to_string())
    }
}

impl From<reqwest::Error> for BillingError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            BillingError::UpstreamTimeout
        } else {
            BillingError::Upstream {
                status: e.status().map(|s| s.as_u16()),
                message: e.to_string(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_errors_are_retryable() {
        assert!(BillingError::UpstreamTimeout.is_retryable());
        assert!(BillingError::Database("connection reset".into()).is_retryable());
        assert!(BillingError::Upstream {
            status: Some(502),
            message: "bad gateway".into()
        }
        .is_retryable());
    }

    #[test]
    fn unusable_events_are_acknowledged_not_retried() {
        assert!(BillingError::malformed("missing amount").is_acknowledgeable());
        assert!(BillingError::conflict("subscription already cancelled").is_acknowledgeable());
        assert!(!BillingError::malformed("missing amount").is_retryable());
    }

    #[test]
    fn signature_failure_is_neither() {
        let e = BillingError::InvalidSignature;
        assert!(!e.is_retryable());
        assert!(!e.is_acknowledgeable());
    }
}

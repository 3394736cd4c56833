//! Subscription state machine
//!
//! One transition table is the single chokepoint for every status change.
//! Undefined `(state, event)` pairs are rejected with `ConflictingState`
//! instead of being silently applied.

use serde::{Deserialize, Serialize};
use vendly_shared::AccountTier;

use crate::error::{BillingError, BillingResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Pending,
    Active,
    NonRenewing,
    Attention,
    Completed,
    Cancelled,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Pending => "pending",
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::NonRenewing => "non_renewing",
            SubscriptionStatus::Attention => "attention",
            SubscriptionStatus::Completed => "completed",
            SubscriptionStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(SubscriptionStatus::Pending),
            "active" => Some(SubscriptionStatus::Active),
            "non_renewing" => Some(SubscriptionStatus::NonRenewing),
            "attention" => Some(SubscriptionStatus::Attention),
            "completed" => Some(SubscriptionStatus::Completed),
            "cancelled" => Some(SubscriptionStatus::Cancelled),
            _ => None,
        }
    }

    /// Terminal states accept no further events.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SubscriptionStatus::Completed | SubscriptionStatus::Cancelled
        )
    }

    /// States that count against the one-billable-subscription-per-account
    /// invariant.
    pub fn is_billable(&self) -> bool {
        matches!(
            self,
            SubscriptionStatus::Active
                | SubscriptionStatus::NonRenewing
                | SubscriptionStatus::Attention
        )
    }
}

impl std::fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Lifecycle events distilled from gateway webhooks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionEvent {
    /// First successful charge or `subscription.create`.
    Activated,
    /// Renewal charge succeeded (`charge.success` with a plan, or a paid
    /// invoice update).
    RenewalSucceeded,
    /// Renewal charge failed (`invoice.payment_failed`).
    RenewalFailed,
    /// Auto-renew switched off (`subscription.not_renew`).
    AutoRenewDisabled,
    /// `subscription.disable` by user or merchant.
    Disabled,
    /// `subscription.disable` because the plan ran to term.
    RanToTerm,
}

impl SubscriptionEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionEvent::Activated => "activated",
            SubscriptionEvent::RenewalSucceeded => "renewal_succeeded",
            SubscriptionEvent::RenewalFailed => "renewal_failed",
            SubscriptionEvent::AutoRenewDisabled => "auto_renew_disabled",
            SubscriptionEvent::Disabled => "disabled",
            SubscriptionEvent::RanToTerm => "ran_to_term",
        }
    }
}

/// The transition table. Returns the next status, or `ConflictingState`
/// for pairs the table does not define.
pub fn transition(
    current: SubscriptionStatus,
    event: SubscriptionEvent,
) -> BillingResult<SubscriptionStatus> {
    use SubscriptionEvent as E;
    use SubscriptionStatus as S;

    let next = match (current, event) {
        (S::Pending, E::Activated) => S::Active,
        // Duplicate activation after a re-synced create event is harmless.
        (S::Active, E::Activated) => S::Active,

        (S::Active, E::RenewalSucceeded) => S::Active,
        (S::NonRenewing, E::RenewalSucceeded) => S::NonRenewing,
        // Recovery: a successful retry during the grace window.
        (S::Attention, E::RenewalSucceeded) => S::Active,

        (S::Active, E::RenewalFailed) => S::Attention,
        (S::NonRenewing, E::RenewalFailed) => S::Attention,
        (S::Attention, E::RenewalFailed) => S::Attention,

        (S::Active, E::AutoRenewDisabled) => S::NonRenewing,
        (S::Attention, E::AutoRenewDisabled) => S::NonRenewing,

        (S::Pending, E::Disabled) => S::Cancelled,
        (S::Active, E::Disabled) => S::Cancelled,
        (S::NonRenewing, E::Disabled) => S::Cancelled,
        (S::Attention, E::Disabled) => S::Cancelled,

        (S::NonRenewing, E::RanToTerm) => S::Completed,
        (S::Active, E::RanToTerm) => S::Completed,

        (current, event) => {
            return Err(BillingError::conflict(format!(
                "subscription in state '{current}' cannot accept event '{}'",
                event.as_str()
            )));
        }
    };

    Ok(next)
}

/// Account tier implied by a subscription status, if the status forces one.
/// `Attention` and `NonRenewing` leave the tier untouched: the account keeps
/// premium until the grace period elapses or the period runs out.
pub fn tier_for(status: SubscriptionStatus) -> Option<AccountTier> {
    match status {
        SubscriptionStatus::Active => Some(AccountTier::Premium),
        SubscriptionStatus::Cancelled | SubscriptionStatus::Completed => Some(AccountTier::Free),
        SubscriptionStatus::Pending
        | SubscriptionStatus::NonRenewing
        | SubscriptionStatus::Attention => None,
    }
}

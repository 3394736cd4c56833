//! Shared domain types

use serde::{Deserialize, Serialize};

/// Billing class of an account, controlling feature access.
///
/// Accounts are created as `FreeTrial` at registration. Transitions happen
/// only through the reconciler or the scheduled sweeps, never directly from
/// user actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountTier {
    Free,
    FreeTrial,
    Premium,
}

impl AccountTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccountTier::Free => "free",
            AccountTier::FreeTrial => "free_trial",
            AccountTier::Premium => "premium",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "free" => Some(AccountTier::Free),
            "free_trial" => Some(AccountTier::FreeTrial),
            "premium" => Some(AccountTier::Premium),
            _ => None,
        }
    }

    /// Whether the tier grants paid feature access.
    pub fn is_paid(&self) -> bool {
        matches!(self, AccountTier::Premium)
    }
}

impl std::fmt::Display for AccountTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tier_round_trips_through_str() {
        for tier in [AccountTier::Free, AccountTier::FreeTrial, AccountTier::Premium] {
            assert_eq!(AccountTier::parse(tier.as_str()), Some(tier));
        }
    }

    #[test]
    fn unknown_tier_is_rejected() {
        assert_eq!(AccountTier::parse("enterprise"), None);
        assert_eq!(AccountTier::parse(""), None);
    }

    #[test]
    fn only_premium_is_paid() {
        assert!(AccountTier::Premium.is_paid());
        assert!(!AccountTier::Free.is_paid());
        assert!(!AccountTier::FreeTrial.is_paid());
    }
}

// Billing crate clippy configuration
// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Vendly Billing Module
//!
//! Reconciles payment-gateway webhooks against local billing state.
//!
//! ## Features
//!
//! - **Webhook Handling**: HMAC-verified, idempotent gateway event intake
//! - **Subscription Lifecycle**: Explicit state machine for activation,
//!   renewal, payment failure, and cancellation
//! - **Revenue Ledger**: Append-only record of every earning event
//! - **Payouts**: Transfer initiation and terminal-state settlement
//! - **Trial Sweeps**: Scheduled expiry and reminder batch jobs
//! - **Email Notifications**: Trial ending, payment failed
//! - **Invariants**: Runnable consistency checks over reconciled state

pub mod accounts;
pub mod client;
pub mod config;
pub mod email;
pub mod error;
pub mod events;
pub mod fsm;
pub mod invariants;
pub mod invoices;
pub mod ledger;
pub mod payouts;
pub mod subscriptions;
pub mod trial;
pub mod webhooks;

#[cfg(test)]
mod edge_case_tests;

// Accounts
pub use accounts::{Account, AccountService};

// Client
pub use client::{Bank, GatewayClient, GatewayConfig, GatewaySubscription, TransferHandle};

// Config
pub use config::BillingSettings;

// Email
pub use email::{BillingEmailService, EmailConfig};

// Error
pub use error::{BillingError, BillingResult};

// Events
pub use events::{
    ChargePayload, EventEnvelope, EventKind, InvoicePayload, SubscriptionPayload, TransferPayload,
    SIGNATURE_HEADER,
};

// State machine
pub use fsm::{transition, tier_for, SubscriptionEvent, SubscriptionStatus};

// Invariants
pub use invariants::{
    InvariantCheckSummary, InvariantChecker, InvariantViolation, ViolationSeverity,
};

// Ledger
pub use ledger::{LedgerActivity, LedgerEntry, LedgerStatus, RevenueLedger};

// Payouts
pub use payouts::{Payout, PayoutService, PayoutStatus};

// Subscriptions
pub use subscriptions::{Subscription, SubscriptionReconciler};

// Trial
pub use trial::TrialService;

// Webhooks
pub use webhooks::{cleanup_old_events, WebhookHandler};

use sqlx::PgPool;

/// Main billing service that combines all billing functionality
pub struct BillingService {
    pub gateway: GatewayClient,
    pub email: BillingEmailService,
    pub reconciler: SubscriptionReconciler,
    pub payouts: PayoutService,
    pub ledger: RevenueLedger,
    pub trial: TrialService,
    pub webhooks: WebhookHandler,
    pub invariants: InvariantChecker,
    pub settings: BillingSettings,
}

impl BillingService {
    /// Create a new billing service from environment variables
    pub fn from_env(pool: PgPool) -> BillingResult<Self> {
        Ok(Self::new(GatewayConfig::from_env()?, pool))
    }

    /// Create a new billing service with explicit gateway config
    pub fn new(config: GatewayConfig, pool: PgPool) -> Self {
        let settings = BillingSettings::from_env();
        let secret = config.secret_key.clone();
        let gateway = GatewayClient::new(config);
        let email = BillingEmailService::from_env();
        let reconciler = SubscriptionReconciler::new(pool.clone(), settings.grace_period_days);
        let payouts = PayoutService::new(gateway.clone(), pool.clone());

        Self {
            gateway,
            email: email.clone(),
            reconciler: reconciler.clone(),
            payouts: payouts.clone(),
            ledger: RevenueLedger::new(pool.clone()),
            trial: TrialService::new(pool.clone(), email.clone(), &settings),
            webhooks: WebhookHandler::new(pool.clone(), secret, reconciler, payouts, email),
            invariants: InvariantChecker::new(pool),
            settings,
        }
    }
}

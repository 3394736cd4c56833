// Test file - these are expected patterns in test code
#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

//! Edge Case Tests for Billing Reconciliation
//!
//! Cross-module boundary conditions:
//! - Webhook signatures and event identity
//! - Error classification driving the HTTP response policy
//! - Subscription lifecycle sequences through the state machine
//! - Renewal date arithmetic
//! - Amount formatting

mod signature_tests {
    use hmac::{Hmac, Mac};
    use sha2::Sha512;

    type HmacSha512 = Hmac<Sha512>;

    fn sign(secret: &str, body: &[u8]) -> String {
        let mut mac = HmacSha512::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(body);
        hex::encode(mac.finalize().into_bytes())
    }

    #[test]
    fn signature_is_128_hex_chars() {
        let sig = sign("sk_test_abc", b"{}");
        assert_eq!(sig.len(), 128);
        assert!(sig.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn signature_depends_on_every_body_byte() {
        let body = br#"{"event":"charge.success","data":{"amount":50000}}"#;
        let base = sign("sk_test_abc", body);
        for i in 0..body.len() {
            let mut mutated = body.to_vec();
            mutated[i] ^= 0x01;
            assert_ne!(sign("sk_test_abc", &mutated), base, "byte {i} ignored");
        }
    }

    #[test]
    fn signature_depends_on_secret() {
        let body = b"payload";
        assert_ne!(sign("sk_live_a", body), sign("sk_live_b", body));
    }
}

mod event_identity_tests {
    use crate::events::EventEnvelope;

    // Two different events must never share an identity even when their
    // data ids collide numerically.
    #[test]
    fn identity_is_scoped_by_event_type() {
        let charge = br#"{"event":"charge.success","data":{"id":7}}"#;
        let invoice = br#"{"event":"invoice.create","data":{"id":7}}"#;
        let a = EventEnvelope::parse(charge).unwrap().event_id(charge);
        let b = EventEnvelope::parse(invoice).unwrap().event_id(invoice);
        assert_ne!(a, b);
    }

    #[test]
    fn redelivered_body_yields_identical_identity() {
        let body = br#"{"event":"transfer.success","data":{"reference":"po_1","amount":9000}}"#;
        let first = EventEnvelope::parse(body).unwrap().event_id(body);
        let second = EventEnvelope::parse(body).unwrap().event_id(body);
        assert_eq!(first, second);
    }

    #[test]
    fn non_numeric_id_falls_back_to_digest() {
        let body = br#"{"event":"charge.success","data":{"id":"not-a-number"}}"#;
        let id = EventEnvelope::parse(body).unwrap().event_id(body);
        assert_eq!(id.len(), 64);
    }
}

mod error_policy_tests {
    use crate::error::BillingError;

    // The HTTP layer acknowledges (200) what a redelivery cannot fix and
    // rejects (500) what it can. These classifications are that contract.

    #[test]
    fn permanent_failures_are_acknowledgeable() {
        assert!(BillingError::malformed("bad json").is_acknowledgeable());
        assert!(BillingError::conflict("undefined transition").is_acknowledgeable());
        assert!(BillingError::AccountNotFound("buyer@example.com".into()).is_acknowledgeable());
        assert!(BillingError::SubscriptionNotFound("SUB_1".into()).is_acknowledgeable());
    }

    #[test]
    fn transient_failures_are_retryable_not_acknowledgeable() {
        let errors = [
            BillingError::UpstreamTimeout,
            BillingError::Upstream {
                status: Some(503),
                message: "unavailable".into(),
            },
            BillingError::Database("connection reset".into()),
        ];
        for e in errors {
            assert!(e.is_retryable(), "{e} should be retryable");
            assert!(!e.is_acknowledgeable(), "{e} should not be acknowledged");
        }
    }

    #[test]
    fn invalid_signature_is_neither() {
        let e = BillingError::InvalidSignature;
        assert!(!e.is_retryable());
        assert!(!e.is_acknowledgeable());
    }
}

mod lifecycle_sequence_tests {
    use crate::fsm::{transition, SubscriptionEvent as E, SubscriptionStatus as S};

    fn run(start: S, events: &[E]) -> Result<S, crate::error::BillingError> {
        events.iter().try_fold(start, |s, &e| transition(s, e))
    }

    #[test]
    fn failed_renewal_then_recovery() {
        let end = run(S::Active, &[E::RenewalFailed, E::RenewalSucceeded]).unwrap();
        assert_eq!(end, S::Active);
    }

    #[test]
    fn repeated_failures_stay_in_attention() {
        let end = run(S::Active, &[E::RenewalFailed, E::RenewalFailed, E::RenewalFailed]).unwrap();
        assert_eq!(end, S::Attention);
    }

    #[test]
    fn non_renewing_runs_to_term() {
        let end = run(S::Active, &[E::AutoRenewDisabled, E::RanToTerm]).unwrap();
        assert_eq!(end, S::Completed);
    }

    #[test]
    fn cancel_during_grace_window() {
        let end = run(S::Active, &[E::RenewalFailed, E::Disabled]).unwrap();
        assert_eq!(end, S::Cancelled);
    }

    #[test]
    fn no_sequence_escapes_a_terminal_state() {
        for terminal in [S::Cancelled, S::Completed] {
            for event in [
                E::Activated,
                E::RenewalSucceeded,
                E::RenewalFailed,
                E::AutoRenewDisabled,
                E::Disabled,
                E::RanToTerm,
            ] {
                assert!(transition(terminal, event).is_err());
            }
        }
    }

    #[test]
    fn attention_can_switch_off_autorenew() {
        // Users in a grace window may still disable auto-renew; the grace
        // clock keeps running.
        assert_eq!(
            transition(S::Attention, E::AutoRenewDisabled).unwrap(),
            S::NonRenewing
        );
    }
}

mod renewal_date_tests {
    use crate::subscriptions::advance_next_payment;
    use time::macros::datetime;

    #[test]
    fn monthly_is_the_default_interval() {
        let next = advance_next_payment(
            Some(datetime!(2024-05-01 00:00 UTC)),
            datetime!(2024-05-01 00:00 UTC),
            None,
        );
        assert_eq!(next, datetime!(2024-05-31 00:00 UTC));
    }

    #[test]
    fn late_charge_advances_from_charge_time() {
        // The renewal settled 10 days after schedule; the next window
        // anchors on the actual charge, not the stale schedule.
        let next = advance_next_payment(
            Some(datetime!(2024-05-01 00:00 UTC)),
            datetime!(2024-05-11 00:00 UTC),
            Some("weekly"),
        );
        assert_eq!(next, datetime!(2024-05-18 00:00 UTC));
    }

    #[test]
    fn missing_schedule_anchors_on_charge() {
        let next = advance_next_payment(None, datetime!(2024-05-01 00:00 UTC), Some("daily"));
        assert_eq!(next, datetime!(2024-05-02 00:00 UTC));
    }

    #[test]
    fn unknown_interval_treated_as_monthly() {
        let next = advance_next_payment(
            None,
            datetime!(2024-05-01 00:00 UTC),
            Some("fortnightly"),
        );
        assert_eq!(next, datetime!(2024-05-31 00:00 UTC));
    }
}

mod amount_tests {
    use crate::ledger::format_major;

    #[test]
    fn formats_minor_units_as_major() {
        assert_eq!(format_major(50000), "500.00");
        assert_eq!(format_major(1), "0.01");
        assert_eq!(format_major(0), "0.00");
        assert_eq!(format_major(99), "0.99");
        assert_eq!(format_major(100), "1.00");
    }

    #[test]
    fn formats_negative_adjustments() {
        assert_eq!(format_major(-2550), "-25.50");
    }
}

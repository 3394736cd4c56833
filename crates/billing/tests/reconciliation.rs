//! Database-backed reconciliation tests.
//!
//! Each test gets its own schema via `sqlx::test` with the workspace
//! migrations applied, so the properties that live in SQL (idempotency
//! claims, partial unique indexes, monotonic status updates) are exercised
//! against a real Postgres.

#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

use hmac::{Hmac, Mac};
use sha2::Sha512;
use sqlx::PgPool;
use time::macros::datetime;
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use vendly_billing::events::{
    ChargePayload, CustomerPayload, InvoicePayload, PlanPayload, SubscriptionPayload,
    SubscriptionRef,
};
use vendly_billing::{
    BillingEmailService, BillingError, BillingSettings, GatewayClient, GatewayConfig,
    LedgerActivity, LedgerStatus, RevenueLedger, SubscriptionReconciler, TrialService,
    WebhookHandler,
};

const SECRET: &str = "sk_test_secret";

fn sign(body: &[u8]) -> String {
    let mut mac = Hmac::<Sha512>::new_from_slice(SECRET.as_bytes()).unwrap();
    mac.update(body);
    hex::encode(mac.finalize().into_bytes())
}

fn reconciler(pool: &PgPool) -> SubscriptionReconciler {
    SubscriptionReconciler::new(pool.clone(), 7)
}

fn webhook_handler(pool: &PgPool) -> WebhookHandler {
    let config = GatewayConfig {
        secret_key: SECRET.into(),
        base_url: "http://gateway.invalid".into(),
    };
    let gateway = GatewayClient::new(config);
    WebhookHandler::new(
        pool.clone(),
        SECRET.into(),
        reconciler(pool),
        vendly_billing::PayoutService::new(gateway, pool.clone()),
        BillingEmailService::from_env(),
    )
}

fn customer(email: &str) -> CustomerPayload {
    CustomerPayload {
        email: email.into(),
        customer_code: Some("CUS_1".into()),
    }
}

fn plan(code: &str) -> PlanPayload {
    PlanPayload {
        plan_code: Some(code.into()),
        name: Some("Standard".into()),
        interval: Some("monthly".into()),
    }
}

fn failed_invoice(invoice_code: &str, subscription_code: &str, email: &str) -> InvoicePayload {
    InvoicePayload {
        invoice_code: invoice_code.into(),
        amount: 50000,
        paid: Some(false),
        status: Some("failed".into()),
        subscription: SubscriptionRef {
            subscription_code: subscription_code.into(),
            status: None,
            next_payment_date: None,
        },
        customer: customer(email),
    }
}

async fn seed_account(pool: &PgPool, email: &str, tier: &str) -> Uuid {
    sqlx::query_scalar("INSERT INTO accounts (email, tier) VALUES ($1, $2) RETURNING id")
        .bind(email)
        .bind(tier)
        .fetch_one(pool)
        .await
        .unwrap()
}

async fn seed_account_aged(pool: &PgPool, email: &str, age_days: i32) -> Uuid {
    sqlx::query_scalar(
        r#"
        INSERT INTO accounts (email, tier, created_at)
        VALUES ($1, 'free_trial', NOW() - make_interval(days => $2))
        RETURNING id
        "#,
    )
    .bind(email)
    .bind(age_days)
    .fetch_one(pool)
    .await
    .unwrap()
}

async fn seed_subscription(
    pool: &PgPool,
    account_id: Uuid,
    code: &str,
    plan_code: &str,
    next_payment_date: Option<OffsetDateTime>,
) -> Uuid {
    sqlx::query_scalar(
        r#"
        INSERT INTO subscriptions
            (account_id, gateway_subscription_code, plan_code, amount_minor, status,
             next_payment_date)
        VALUES ($1, $2, $3, 50000, 'active', $4)
        RETURNING id
        "#,
    )
    .bind(account_id)
    .bind(code)
    .bind(plan_code)
    .bind(next_payment_date)
    .fetch_one(pool)
    .await
    .unwrap()
}

/// Put the activation entry on the ledger the way the charge handler would.
async fn seed_activation_revenue(pool: &PgPool, account_id: Uuid, reference: &str) {
    sqlx::query(
        r#"
        INSERT INTO revenues (account_id, activity, status, amount_minor, reference)
        VALUES ($1, 'SUBSCRIPTION', 'COMPLETED', 50000, $2)
        "#,
    )
    .bind(account_id)
    .bind(reference)
    .execute(pool)
    .await
    .unwrap();
}

async fn account_tier(pool: &PgPool, account_id: Uuid) -> String {
    sqlx::query_scalar("SELECT tier FROM accounts WHERE id = $1")
        .bind(account_id)
        .fetch_one(pool)
        .await
        .unwrap()
}

async fn subscription_state(
    pool: &PgPool,
    code: &str,
) -> (String, Option<OffsetDateTime>, Option<OffsetDateTime>) {
    sqlx::query_as(
        r#"
        SELECT status, next_payment_date, grace_expires_at
        FROM subscriptions
        WHERE gateway_subscription_code = $1
        "#,
    )
    .bind(code)
    .fetch_one(pool)
    .await
    .unwrap()
}

async fn revenue_count(pool: &PgPool, activity: &str, reference: &str) -> i64 {
    sqlx::query_scalar("SELECT COUNT(*) FROM revenues WHERE activity = $1 AND reference = $2")
        .bind(activity)
        .bind(reference)
        .fetch_one(pool)
        .await
        .unwrap()
}

#[sqlx::test(migrations = "../../migrations")]
async fn redelivered_charge_applies_exactly_once(pool: PgPool) {
    seed_account(&pool, "buyer@example.com", "free_trial").await;

    let body = br#"{"event":"charge.success","data":{"id":4021,"reference":"po_ref_1","amount":2500,"plan":{},"customer":{"email":"buyer@example.com"}}}"#;
    let signature = sign(body);
    let handler = webhook_handler(&pool);

    handler.handle(body, Some(&signature)).await.unwrap();
    // The gateway delivers at-least-once; the second copy must be a no-op.
    handler.handle(body, Some(&signature)).await.unwrap();

    assert_eq!(revenue_count(&pool, "PURCHASE", "po_ref_1").await, 1);

    let audit_rows: Vec<String> = sqlx::query_scalar(
        r#"
        SELECT processing_result
        FROM gateway_webhook_events
        WHERE gateway_event_id = 'charge.success:4021'
        "#,
    )
    .fetch_all(&pool)
    .await
    .unwrap();
    assert_eq!(audit_rows, vec!["success".to_string()]);
}

#[sqlx::test(migrations = "../../migrations")]
async fn trial_expiry_demotes_only_past_the_window(pool: PgPool) {
    let expired_id = seed_account_aged(&pool, "old@example.com", 31).await;
    let active_id = seed_account_aged(&pool, "young@example.com", 29).await;

    let trial = TrialService::new(
        pool.clone(),
        BillingEmailService::from_env(),
        &BillingSettings::default(),
    );
    let demoted = trial.expire_trials().await.unwrap();

    assert_eq!(demoted, 1);
    assert_eq!(account_tier(&pool, expired_id).await, "free");
    assert_eq!(account_tier(&pool, active_id).await, "free_trial");
}

#[sqlx::test(migrations = "../../migrations")]
async fn renewal_failure_keeps_premium_through_the_grace_window(pool: PgPool) {
    let account_id = seed_account(&pool, "buyer@example.com", "premium").await;
    seed_subscription(
        &pool,
        account_id,
        "SUB_1",
        "PLN_std",
        Some(OffsetDateTime::now_utc() - Duration::days(1)),
    )
    .await;

    let reconciler = reconciler(&pool);
    let invoice = failed_invoice("INV_1", "SUB_1", "buyer@example.com");
    reconciler.handle_payment_failed(&invoice).await.unwrap();

    assert_eq!(account_tier(&pool, account_id).await, "premium");
    let (status, _, grace) = subscription_state(&pool, "SUB_1").await;
    assert_eq!(status, "attention");
    let deadline = grace.expect("grace deadline set");

    // A repeated failure must not push the deadline out or duplicate the
    // ledger entry.
    reconciler.handle_payment_failed(&invoice).await.unwrap();
    let (_, _, grace_after) = subscription_state(&pool, "SUB_1").await;
    assert_eq!(grace_after, Some(deadline));
    assert_eq!(revenue_count(&pool, "SUBSCRIPTION_RENEW", "INV_1").await, 1);
    assert_eq!(account_tier(&pool, account_id).await, "premium");
}

#[sqlx::test(migrations = "../../migrations")]
async fn ledger_status_never_leaves_a_terminal_state(pool: PgPool) {
    let account_id = seed_account(&pool, "seller@example.com", "premium").await;
    let ledger = RevenueLedger::new(pool.clone());

    let inserted = ledger
        .append(
            account_id,
            LedgerActivity::Purchase,
            LedgerStatus::Pending,
            1000,
            "po_pending_1",
        )
        .await
        .unwrap();
    assert!(inserted);

    let completed = ledger
        .mark_status(LedgerActivity::Purchase, "po_pending_1", LedgerStatus::Completed)
        .await
        .unwrap();
    assert!(completed);

    let moved_again = ledger
        .mark_status(LedgerActivity::Purchase, "po_pending_1", LedgerStatus::Failed)
        .await
        .unwrap();
    assert!(!moved_again);

    let status: String = sqlx::query_scalar(
        "SELECT status FROM revenues WHERE activity = 'PURCHASE' AND reference = 'po_pending_1'",
    )
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(status, "COMPLETED");
}

#[sqlx::test(migrations = "../../migrations")]
async fn create_first_activation_pair_records_one_activation(pool: PgPool) {
    let account_id = seed_account(&pool, "buyer@example.com", "free_trial").await;
    let reconciler = reconciler(&pool);
    let scheduled = datetime!(2030-01-01 00:00 UTC);

    let create = SubscriptionPayload {
        subscription_code: "SUB_10".into(),
        status: Some("active".into()),
        amount: 50000,
        next_payment_date: Some(scheduled),
        plan: plan("PLN_std"),
        customer: customer("buyer@example.com"),
    };
    reconciler.handle_subscription_create(&create).await.unwrap();

    // The companion charge lands second. It is the activation charge, not a
    // renewal, and the gateway-scheduled next payment stands.
    let activation = ChargePayload {
        id: Some(1),
        reference: "ref_act_1".into(),
        amount: 50000,
        status: Some("success".into()),
        plan: Some(plan("PLN_std")),
        customer: customer("buyer@example.com"),
        paid_at: None,
    };
    reconciler.handle_charge_success(&activation).await.unwrap();

    assert_eq!(revenue_count(&pool, "SUBSCRIPTION", "ref_act_1").await, 1);
    assert_eq!(revenue_count(&pool, "SUBSCRIPTION_RENEW", "ref_act_1").await, 0);
    assert_eq!(account_tier(&pool, account_id).await, "premium");
    let (status, next, _) = subscription_state(&pool, "SUB_10").await;
    assert_eq!(status, "active");
    assert_eq!(next, Some(scheduled));

    // The next cycle's charge is a renewal and advances the schedule.
    let renewal = ChargePayload {
        id: Some(2),
        reference: "ref_rnw_1".into(),
        amount: 50000,
        status: Some("success".into()),
        plan: Some(plan("PLN_std")),
        customer: customer("buyer@example.com"),
        paid_at: None,
    };
    reconciler.handle_charge_success(&renewal).await.unwrap();

    assert_eq!(revenue_count(&pool, "SUBSCRIPTION_RENEW", "ref_rnw_1").await, 1);
    let (_, next_after, _) = subscription_state(&pool, "SUB_10").await;
    assert_eq!(next_after, Some(scheduled + Duration::days(30)));
}

#[sqlx::test(migrations = "../../migrations")]
async fn second_plan_activation_is_a_conflict_not_a_retry_loop(pool: PgPool) {
    let account_id = seed_account(&pool, "buyer@example.com", "premium").await;
    seed_subscription(&pool, account_id, "SUB_A", "PLN_a", None).await;

    let create = SubscriptionPayload {
        subscription_code: "SUB_B".into(),
        status: Some("active".into()),
        amount: 70000,
        next_payment_date: None,
        plan: plan("PLN_b"),
        customer: customer("buyer@example.com"),
    };
    let err = reconciler(&pool)
        .handle_subscription_create(&create)
        .await
        .unwrap_err();
    assert!(matches!(err, BillingError::ConflictingState(_)));
    assert!(err.is_acknowledgeable());

    // Through the full pipeline the event is acknowledged and audited as
    // skipped, so the gateway stops redelivering it.
    let body = br#"{"event":"subscription.create","data":{"id":88,"subscription_code":"SUB_B","amount":70000,"plan":{"plan_code":"PLN_b"},"customer":{"email":"buyer@example.com"}}}"#;
    let signature = sign(body);
    let outcome = webhook_handler(&pool).handle(body, Some(&signature)).await;
    assert!(matches!(outcome, Err(BillingError::ConflictingState(_))));

    let result: String = sqlx::query_scalar(
        r#"
        SELECT processing_result FROM gateway_webhook_events
        WHERE gateway_event_id = 'subscription.create:88'
        "#,
    )
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(result, "skipped");
}

#[sqlx::test(migrations = "../../migrations")]
async fn renewal_then_disable_settles_subscription_and_tier(pool: PgPool) {
    let account_id = seed_account(&pool, "buyer@example.com", "premium").await;
    seed_subscription(
        &pool,
        account_id,
        "SUB_20",
        "PLN_std",
        Some(OffsetDateTime::now_utc() - Duration::days(1)),
    )
    .await;
    seed_activation_revenue(&pool, account_id, "ref_seed_act").await;

    let reconciler = reconciler(&pool);
    let renewal = ChargePayload {
        id: Some(3),
        reference: "ref_rnw_20".into(),
        amount: 50000,
        status: Some("success".into()),
        plan: Some(plan("PLN_std")),
        customer: customer("buyer@example.com"),
        paid_at: None,
    };
    reconciler.handle_charge_success(&renewal).await.unwrap();
    assert_eq!(revenue_count(&pool, "SUBSCRIPTION_RENEW", "ref_rnw_20").await, 1);

    let disable = SubscriptionPayload {
        subscription_code: "SUB_20".into(),
        status: None,
        amount: 50000,
        next_payment_date: None,
        plan: plan("PLN_std"),
        customer: customer("buyer@example.com"),
    };
    reconciler.handle_disable(&disable).await.unwrap();

    let (status, _, grace) = subscription_state(&pool, "SUB_20").await;
    assert_eq!(status, "cancelled");
    assert_eq!(grace, None);
    assert_eq!(account_tier(&pool, account_id).await, "free");
}

//! Subscription reconciliation
//!
//! Maps verified gateway events onto local subscription and account state.
//! Every handler runs in one transaction and takes row-level locks on the
//! subscription and account it touches, so concurrent deliveries for the
//! same subscription (duplicate delivery, renewal racing a cancellation)
//! serialize instead of interleaving tier changes.
//!
//! Lock order is fixed: subscription row first, then its account row.
//! Handlers that only know the customer email resolve the account id with a
//! plain read before taking any lock.

use sqlx::{PgPool, Postgres, Transaction};
use time::{Duration, OffsetDateTime};
use uuid::Uuid;
use vendly_shared::AccountTier;

use crate::accounts::AccountService;
use crate::error::{self, BillingError, BillingResult};
use crate::events::{ChargePayload, InvoicePayload, SubscriptionPayload};
use crate::fsm::{self, SubscriptionEvent, SubscriptionStatus};
use crate::invoices;
use crate::ledger::{LedgerActivity, LedgerStatus, RevenueLedger};

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Subscription {
    pub id: Uuid,
    pub account_id: Uuid,
    pub gateway_subscription_code: String,
    pub plan_code: String,
    pub amount_minor: i64,
    pub status: String,
    pub next_payment_date: Option<OffsetDateTime>,
    pub grace_expires_at: Option<OffsetDateTime>,
    pub created_at: OffsetDateTime,
}

impl Subscription {
    pub fn status(&self) -> BillingResult<SubscriptionStatus> {
        SubscriptionStatus::parse(&self.status).ok_or_else(|| {
            BillingError::Database(format!("bad subscription status '{}'", self.status))
        })
    }
}

#[derive(Clone)]
pub struct SubscriptionReconciler {
    pool: PgPool,
    grace_period: Duration,
}

impl SubscriptionReconciler {
    pub fn new(pool: PgPool, grace_period_days: i64) -> Self {
        Self {
            pool,
            grace_period: Duration::days(grace_period_days),
        }
    }

    /// `subscription.create`: the gateway confirmed a recurring agreement.
    /// Creates or re-syncs the local record and promotes the account. The
    /// revenue entry for the initial charge is owned by the charge handler,
    /// which sees the money move.
    pub async fn handle_subscription_create(
        &self,
        payload: &SubscriptionPayload,
    ) -> BillingResult<()> {
        let plan_code = payload
            .plan
            .plan_code
            .as_deref()
            .filter(|c| !c.is_empty())
            .ok_or_else(|| BillingError::malformed("subscription.create without plan_code"))?;

        let mut tx = self.pool.begin().await?;
        let account_id =
            AccountService::resolve_id_by_email(&mut tx, &payload.customer.email).await?;
        let existing = Self::lock_by_code(&mut tx, &payload.subscription_code).await?;
        let account = AccountService::lock_by_id(&mut tx, account_id).await?;

        match existing {
            Some(sub) => {
                let next = fsm::transition(sub.status()?, SubscriptionEvent::Activated)?;
                sqlx::query(
                    r#"
                    UPDATE subscriptions
                    SET status = $1, amount_minor = $2, next_payment_date = $3,
                        grace_expires_at = NULL, updated_at = NOW()
                    WHERE id = $4
                    "#,
                )
                .bind(next.as_str())
                .bind(payload.amount)
                .bind(payload.next_payment_date)
                .bind(sub.id)
                .execute(&mut *tx)
                .await?;
            }
            None => {
                let inserted = sqlx::query(
                    r#"
                    INSERT INTO subscriptions
                        (account_id, gateway_subscription_code, gateway_customer_code,
                         plan_code, amount_minor, status, next_payment_date)
                    VALUES ($1, $2, $3, $4, $5, 'active', $6)
                    "#,
                )
                .bind(account.id)
                .bind(&payload.subscription_code)
                .bind(&payload.customer.customer_code)
                .bind(plan_code)
                .bind(payload.amount)
                .bind(payload.next_payment_date)
                .execute(&mut *tx)
                .await;

                if let Err(e) = inserted {
                    // One billable subscription per account. A second plan
                    // cannot activate no matter how often the gateway
                    // redelivers, so this is a conflict, not a transient
                    // failure.
                    if error::is_unique_violation(&e) {
                        return Err(BillingError::conflict(format!(
                            "account {} already has a billable subscription, cannot activate '{}'",
                            account.id, payload.subscription_code
                        )));
                    }
                    return Err(e.into());
                }
            }
        }

        AccountService::set_tier(&mut tx, account.id, AccountTier::Premium).await?;
        tx.commit().await?;

        tracing::info!(
            subscription_code = %payload.subscription_code,
            account_id = %account.id,
            "Subscription activated"
        );
        Ok(())
    }

    /// `charge.success`: a plan charge is either the activation charge (the
    /// companion subscription.create may arrive before or after it) or a
    /// renewal; a plan-less charge is a one-time purchase.
    pub async fn handle_charge_success(&self, payload: &ChargePayload) -> BillingResult<()> {
        match payload.plan_code() {
            None => self.record_purchase(payload).await,
            Some(plan_code) => self.apply_plan_charge(payload, plan_code).await,
        }
    }

    async fn record_purchase(&self, payload: &ChargePayload) -> BillingResult<()> {
        let mut tx = self.pool.begin().await?;
        let account = AccountService::lock_by_email(&mut tx, &payload.customer.email).await?;

        invoices::record(&mut *tx, None, &payload.reference, payload.amount, "success").await?;
        RevenueLedger::append_with(
            &mut *tx,
            account.id,
            LedgerActivity::Purchase,
            LedgerStatus::Completed,
            payload.amount,
            &payload.reference,
        )
        .await?;
        tx.commit().await?;

        tracing::info!(
            reference = %payload.reference,
            account_id = %account.id,
            amount = payload.amount,
            "Purchase recorded"
        );
        Ok(())
    }

    async fn apply_plan_charge(
        &self,
        payload: &ChargePayload,
        plan_code: &str,
    ) -> BillingResult<()> {
        let mut tx = self.pool.begin().await?;
        let account_id =
            AccountService::resolve_id_by_email(&mut tx, &payload.customer.email).await?;
        let existing = Self::lock_billable_by_plan(&mut tx, account_id, plan_code).await?;
        let account = AccountService::lock_by_id(&mut tx, account_id).await?;

        let is_activation = match &existing {
            Some(sub) => !Self::activation_revenue_recorded(&mut tx, account.id, sub).await?,
            None => true,
        };

        match existing {
            None => {
                // Initial charge. The gateway emits subscription.create right
                // after, which creates the subscription record itself.
                invoices::record(&mut *tx, None, &payload.reference, payload.amount, "success")
                    .await?;
                RevenueLedger::append_with(
                    &mut *tx,
                    account.id,
                    LedgerActivity::Subscription,
                    LedgerStatus::Completed,
                    payload.amount,
                    &payload.reference,
                )
                .await?;
                AccountService::set_tier(&mut tx, account.id, AccountTier::Premium).await?;
            }
            Some(sub) if is_activation => {
                // subscription.create arrived first, so this charge is the
                // activation, not a renewal. The create event already stored
                // the gateway-scheduled next_payment_date; advancing it here
                // would push billing a full interval into the future.
                let next = fsm::transition(sub.status()?, SubscriptionEvent::Activated)?;
                sqlx::query(
                    r#"
                    UPDATE subscriptions
                    SET status = $1, grace_expires_at = NULL, updated_at = NOW()
                    WHERE id = $2
                    "#,
                )
                .bind(next.as_str())
                .bind(sub.id)
                .execute(&mut *tx)
                .await?;

                invoices::record(
                    &mut *tx,
                    Some(sub.id),
                    &payload.reference,
                    payload.amount,
                    "success",
                )
                .await?;
                RevenueLedger::append_with(
                    &mut *tx,
                    account.id,
                    LedgerActivity::Subscription,
                    LedgerStatus::Completed,
                    payload.amount,
                    &payload.reference,
                )
                .await?;
                AccountService::set_tier(&mut tx, account.id, AccountTier::Premium).await?;
            }
            Some(sub) => {
                let next = fsm::transition(sub.status()?, SubscriptionEvent::RenewalSucceeded)?;
                let interval = payload.plan.as_ref().and_then(|p| p.interval.as_deref());
                let charged_at = payload.paid_at.unwrap_or_else(OffsetDateTime::now_utc);
                let next_payment =
                    advance_next_payment(sub.next_payment_date, charged_at, interval);

                sqlx::query(
                    r#"
                    UPDATE subscriptions
                    SET status = $1, next_payment_date = $2, grace_expires_at = NULL,
                        updated_at = NOW()
                    WHERE id = $3
                    "#,
                )
                .bind(next.as_str())
                .bind(next_payment)
                .bind(sub.id)
                .execute(&mut *tx)
                .await?;

                invoices::record(
                    &mut *tx,
                    Some(sub.id),
                    &payload.reference,
                    payload.amount,
                    "success",
                )
                .await?;
                RevenueLedger::append_with(
                    &mut *tx,
                    account.id,
                    LedgerActivity::SubscriptionRenew,
                    LedgerStatus::Completed,
                    payload.amount,
                    &payload.reference,
                )
                .await?;

                if let Some(tier) = fsm::tier_for(next) {
                    AccountService::set_tier(&mut tx, account.id, tier).await?;
                }
            }
        }

        tx.commit().await?;
        tracing::info!(
            reference = %payload.reference,
            plan_code = plan_code,
            "Plan charge applied"
        );
        Ok(())
    }

    /// Paid invoice update: the renewal settled through the invoice flow.
    /// Renewals can surface both as `charge.success` and as a paid invoice;
    /// the unique ledger reference collapses the pair to one entry when the
    /// gateway reuses the transaction reference.
    pub async fn handle_renewal_paid(&self, payload: &InvoicePayload) -> BillingResult<()> {
        let mut tx = self.pool.begin().await?;
        let sub = Self::lock_by_code(&mut tx, &payload.subscription.subscription_code)
            .await?
            .ok_or_else(|| {
                BillingError::SubscriptionNotFound(payload.subscription.subscription_code.clone())
            })?;
        let account = AccountService::lock_by_id(&mut tx, sub.account_id).await?;

        let next = fsm::transition(sub.status()?, SubscriptionEvent::RenewalSucceeded)?;
        let next_payment = payload.subscription.next_payment_date.unwrap_or_else(|| {
            advance_next_payment(sub.next_payment_date, OffsetDateTime::now_utc(), None)
        });

        sqlx::query(
            r#"
            UPDATE subscriptions
            SET status = $1, next_payment_date = $2, grace_expires_at = NULL, updated_at = NOW()
            WHERE id = $3
            "#,
        )
        .bind(next.as_str())
        .bind(next_payment)
        .bind(sub.id)
        .execute(&mut *tx)
        .await?;

        let inserted =
            invoices::record(&mut *tx, Some(sub.id), &payload.invoice_code, payload.amount, "paid")
                .await?;
        if !inserted {
            // invoice.create announced this reference earlier; settle it.
            invoices::set_status(&mut *tx, &payload.invoice_code, "paid").await?;
        }
        RevenueLedger::append_with(
            &mut *tx,
            account.id,
            LedgerActivity::SubscriptionRenew,
            LedgerStatus::Completed,
            payload.amount,
            payload.ledger_reference(),
        )
        .await?;

        if let Some(tier) = fsm::tier_for(next) {
            AccountService::set_tier(&mut tx, account.id, tier).await?;
        }
        tx.commit().await?;

        tracing::info!(
            subscription_code = %payload.subscription.subscription_code,
            invoice_code = %payload.invoice_code,
            "Renewal settled via invoice"
        );
        Ok(())
    }

    /// `invoice.create`: the gateway announced an upcoming billing attempt.
    pub async fn handle_invoice_created(&self, payload: &InvoicePayload) -> BillingResult<()> {
        let subscription_id = self
            .find_by_code(&payload.subscription.subscription_code)
            .await?
            .map(|s| s.id);

        let status = payload.status.as_deref().unwrap_or("pending");
        invoices::record(
            &self.pool,
            subscription_id,
            &payload.invoice_code,
            payload.amount,
            status,
        )
        .await?;
        Ok(())
    }

    /// `invoice.payment_failed`: renewal charge failed. The subscription
    /// moves to attention and a grace deadline is set; the account keeps
    /// premium until the enforcement sweep fires. A repeated failure does
    /// not push the deadline out.
    pub async fn handle_payment_failed(&self, payload: &InvoicePayload) -> BillingResult<()> {
        let mut tx = self.pool.begin().await?;
        let sub = Self::lock_by_code(&mut tx, &payload.subscription.subscription_code)
            .await?
            .ok_or_else(|| {
                BillingError::SubscriptionNotFound(payload.subscription.subscription_code.clone())
            })?;

        let next = fsm::transition(sub.status()?, SubscriptionEvent::RenewalFailed)?;
        let deadline = sub
            .grace_expires_at
            .unwrap_or_else(|| OffsetDateTime::now_utc() + self.grace_period);

        sqlx::query(
            r#"
            UPDATE subscriptions
            SET status = $1, grace_expires_at = $2, updated_at = NOW()
            WHERE id = $3
            "#,
        )
        .bind(next.as_str())
        .bind(deadline)
        .bind(sub.id)
        .execute(&mut *tx)
        .await?;

        let inserted = invoices::record(
            &mut *tx,
            Some(sub.id),
            &payload.invoice_code,
            payload.amount,
            "failed",
        )
        .await?;
        if !inserted {
            invoices::set_status(&mut *tx, &payload.invoice_code, "failed").await?;
        }
        RevenueLedger::append_with(
            &mut *tx,
            sub.account_id,
            LedgerActivity::SubscriptionRenew,
            LedgerStatus::Failed,
            payload.amount,
            payload.ledger_reference(),
        )
        .await?;
        tx.commit().await?;

        tracing::warn!(
            subscription_code = %payload.subscription.subscription_code,
            grace_expires_at = %deadline,
            "Renewal failed, subscription needs attention"
        );
        Ok(())
    }

    /// `subscription.not_renew`: auto-renew switched off; access continues
    /// until the period runs out, so the tier is untouched.
    pub async fn handle_not_renew(&self, payload: &SubscriptionPayload) -> BillingResult<()> {
        let mut tx = self.pool.begin().await?;
        let sub = Self::lock_by_code(&mut tx, &payload.subscription_code)
            .await?
            .ok_or_else(|| BillingError::SubscriptionNotFound(payload.subscription_code.clone()))?;

        let next = fsm::transition(sub.status()?, SubscriptionEvent::AutoRenewDisabled)?;
        sqlx::query("UPDATE subscriptions SET status = $1, updated_at = NOW() WHERE id = $2")
            .bind(next.as_str())
            .bind(sub.id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        tracing::info!(
            subscription_code = %payload.subscription_code,
            "Subscription set to non-renewing"
        );
        Ok(())
    }

    /// `subscription.disable`: terminal. Status and tier change commit in
    /// the same transaction.
    pub async fn handle_disable(&self, payload: &SubscriptionPayload) -> BillingResult<()> {
        let event = match payload.status.as_deref() {
            Some("complete") => SubscriptionEvent::RanToTerm,
            _ => SubscriptionEvent::Disabled,
        };

        let mut tx = self.pool.begin().await?;
        let sub = Self::lock_by_code(&mut tx, &payload.subscription_code)
            .await?
            .ok_or_else(|| BillingError::SubscriptionNotFound(payload.subscription_code.clone()))?;
        let account = AccountService::lock_by_id(&mut tx, sub.account_id).await?;

        let next = fsm::transition(sub.status()?, event)?;
        sqlx::query(
            r#"
            UPDATE subscriptions
            SET status = $1, grace_expires_at = NULL, updated_at = NOW()
            WHERE id = $2
            "#,
        )
        .bind(next.as_str())
        .bind(sub.id)
        .execute(&mut *tx)
        .await?;

        if let Some(tier) = fsm::tier_for(next) {
            AccountService::set_tier(&mut tx, account.id, tier).await?;
        }
        tx.commit().await?;

        tracing::info!(
            subscription_code = %payload.subscription_code,
            status = next.as_str(),
            "Subscription terminated"
        );
        Ok(())
    }

    /// Hourly sweep: demote accounts whose failed-renewal grace window has
    /// elapsed. One batched update; the predicate self-heals on the next
    /// run if this one fails.
    pub async fn enforce_grace_periods(&self) -> BillingResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE accounts a
            SET tier = 'free', updated_at = NOW()
            FROM subscriptions s
            WHERE s.account_id = a.id
              AND s.status = 'attention'
              AND s.grace_expires_at < NOW()
              AND a.tier = 'premium'
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    pub async fn find_by_code(&self, code: &str) -> BillingResult<Option<Subscription>> {
        let sub = sqlx::query_as(
            r#"
            SELECT id, account_id, gateway_subscription_code, plan_code, amount_minor,
                   status, next_payment_date, grace_expires_at, created_at
            FROM subscriptions
            WHERE gateway_subscription_code = $1
            "#,
        )
        .bind(code)
        .fetch_optional(&self.pool)
        .await?;
        Ok(sub)
    }

    async fn lock_by_code(
        tx: &mut Transaction<'_, Postgres>,
        code: &str,
    ) -> BillingResult<Option<Subscription>> {
        let sub = sqlx::query_as(
            r#"
            SELECT id, account_id, gateway_subscription_code, plan_code, amount_minor,
                   status, next_payment_date, grace_expires_at, created_at
            FROM subscriptions
            WHERE gateway_subscription_code = $1
            FOR UPDATE
            "#,
        )
        .bind(code)
        .fetch_optional(&mut **tx)
        .await?;
        Ok(sub)
    }

    /// Whether the activation charge for this subscription already reached
    /// the ledger. The one-hour slack covers delivery skew between a charge
    /// and its companion subscription.create, which arrive in either order;
    /// entries from an earlier, since-terminated subscription fall outside
    /// the window.
    async fn activation_revenue_recorded(
        tx: &mut Transaction<'_, Postgres>,
        account_id: Uuid,
        sub: &Subscription,
    ) -> BillingResult<bool> {
        let exists: bool = sqlx::query_scalar(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM revenues
                WHERE account_id = $1
                  AND activity = 'SUBSCRIPTION'
                  AND status = 'COMPLETED'
                  AND created_at >= $2 - INTERVAL '1 hour'
            )
            "#,
        )
        .bind(account_id)
        .bind(sub.created_at)
        .fetch_one(&mut **tx)
        .await?;
        Ok(exists)
    }

    async fn lock_billable_by_plan(
        tx: &mut Transaction<'_, Postgres>,
        account_id: Uuid,
        plan_code: &str,
    ) -> BillingResult<Option<Subscription>> {
        let sub = sqlx::query_as(
            r#"
            SELECT id, account_id, gateway_subscription_code, plan_code, amount_minor,
                   status, next_payment_date, grace_expires_at, created_at
            FROM subscriptions
            WHERE account_id = $1
              AND plan_code = $2
              AND status IN ('active', 'non_renewing', 'attention')
            ORDER BY created_at DESC
            LIMIT 1
            FOR UPDATE
            "#,
        )
        .bind(account_id)
        .bind(plan_code)
        .fetch_optional(&mut **tx)
        .await?;
        Ok(sub)
    }
}

impl InvoicePayload {
    /// Ledger reference for invoice-driven entries.
    pub fn ledger_reference(&self) -> &str {
        &self.invoice_code
    }
}

/// Next payment date after a successful charge. Advances from whichever is
/// later, the recorded next date or the charge time, by the plan interval
/// (fixed-length approximations, monthly by default).
pub fn advance_next_payment(
    current_next: Option<OffsetDateTime>,
    charged_at: OffsetDateTime,
    interval: Option<&str>,
) -> OffsetDateTime {
    let step = match interval {
        Some("hourly") => Duration::hours(1),
        Some("daily") => Duration::days(1),
        Some("weekly") => Duration::weeks(1),
        Some("quarterly") => Duration::days(90),
        Some("biannually") => Duration::days(182),
        Some("annually") => Duration::days(365),
        _ => Duration::days(30),
    };

    let base = match current_next {
        Some(next) if next > charged_at => next,
        _ => charged_at,
    };
    base + step
}

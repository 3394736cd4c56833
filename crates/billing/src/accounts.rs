//! Account tier store
//!
//! Tier changes flow exclusively through the reconciler and the scheduled
//! sweeps. Row-level helpers here take a caller-owned transaction so a tier
//! change always commits atomically with the subscription/ledger writes that
//! caused it.

use sqlx::{PgPool, Postgres, Transaction};
use time::OffsetDateTime;
use uuid::Uuid;
use vendly_shared::AccountTier;

use crate::error::{BillingError, BillingResult};

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Account {
    pub id: Uuid,
    pub email: String,
    pub tier: String,
    pub created_at: OffsetDateTime,
}

impl Account {
    pub fn tier(&self) -> BillingResult<AccountTier> {
        AccountTier::parse(&self.tier)
            .ok_or_else(|| BillingError::Database(format!("bad account tier '{}'", self.tier)))
    }
}

#[derive(Clone)]
pub struct AccountService {
    pool: PgPool,
}

impl AccountService {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn get(&self, account_id: Uuid) -> BillingResult<Option<Account>> {
        let account = sqlx::query_as(
            "SELECT id, email, tier, created_at FROM accounts WHERE id = $1",
        )
        .bind(account_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(account)
    }

    /// Resolve an account id by email without taking a lock. Handlers that
    /// also lock a subscription row resolve the id first and take the
    /// account lock after the subscription lock, keeping one lock order.
    pub async fn resolve_id_by_email(
        tx: &mut Transaction<'_, Postgres>,
        email: &str,
    ) -> BillingResult<Uuid> {
        let id: Option<Uuid> = sqlx::query_scalar("SELECT id FROM accounts WHERE email = $1")
            .bind(email)
            .fetch_optional(&mut **tx)
            .await?;

        id.ok_or_else(|| BillingError::AccountNotFound(email.to_string()))
    }

    /// Lock the account row for the duration of the transaction. Concurrent
    /// webhook deliveries for the same account serialize here.
    pub async fn lock_by_email(
        tx: &mut Transaction<'_, Postgres>,
        email: &str,
    ) -> BillingResult<Account> {
        let account: Option<Account> = sqlx::query_as(
            "SELECT id, email, tier, created_at FROM accounts WHERE email = $1 FOR UPDATE",
        )
        .bind(email)
        .fetch_optional(&mut **tx)
        .await?;

        account.ok_or_else(|| BillingError::AccountNotFound(email.to_string()))
    }

    pub async fn lock_by_id(
        tx: &mut Transaction<'_, Postgres>,
        account_id: Uuid,
    ) -> BillingResult<Account> {
        let account: Option<Account> = sqlx::query_as(
            "SELECT id, email, tier, created_at FROM accounts WHERE id = $1 FOR UPDATE",
        )
        .bind(account_id)
        .fetch_optional(&mut **tx)
        .await?;

        account.ok_or_else(|| BillingError::AccountNotFound(account_id.to_string()))
    }

    /// Set the tier inside a caller-owned transaction.
    pub async fn set_tier(
        tx: &mut Transaction<'_, Postgres>,
        account_id: Uuid,
        tier: AccountTier,
    ) -> BillingResult<()> {
        sqlx::query("UPDATE accounts SET tier = $1, updated_at = NOW() WHERE id = $2")
            .bind(tier.as_str())
            .bind(account_id)
            .execute(&mut **tx)
            .await?;

        tracing::info!(account_id = %account_id, tier = tier.as_str(), "Account tier set");
        Ok(())
    }
}

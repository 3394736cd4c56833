//! Invoice records
//!
//! An invoice is a billing attempt under a subscription (or a one-time
//! purchase receipt). Duplicate references are dropped on insert; only the
//! status may change afterwards, as the attempt settles or fails.

use uuid::Uuid;

use crate::error::BillingResult;

/// Record an invoice inside a caller-owned transaction or on the pool.
/// Returns false when the reference was already recorded.
pub async fn record<'e, E>(
    exec: E,
    subscription_id: Option<Uuid>,
    reference: &str,
    amount_minor: i64,
    status: &str,
) -> BillingResult<bool>
where
    E: sqlx::Executor<'e, Database = sqlx::Postgres>,
{
    let result = sqlx::query(
        r#"
        INSERT INTO invoices (subscription_id, reference, amount_minor, status)
        VALUES ($1, $2, $3, $4)
        ON CONFLICT (reference) DO NOTHING
        "#,
    )
    .bind(subscription_id)
    .bind(reference)
    .bind(amount_minor)
    .bind(status)
    .execute(exec)
    .await?;

    Ok(result.rows_affected() > 0)
}

/// Settle the status of an invoice that was announced earlier (e.g. by
/// `invoice.create`). No-op for unknown references.
pub async fn set_status<'e, E>(exec: E, reference: &str, status: &str) -> BillingResult<bool>
where
    E: sqlx::Executor<'e, Database = sqlx::Postgres>,
{
    let result = sqlx::query(
        r#"
        UPDATE invoices
        SET status = $1, updated_at = NOW()
        WHERE reference = $2 AND status != $1
        "#,
    )
    .bind(status)
    .bind(reference)
    .execute(exec)
    .await?;

    Ok(result.rows_affected() > 0)
}

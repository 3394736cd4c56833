//! Trial sweeps
//!
//! Periodic batch jobs re-evaluating a predicate over accounts and applying
//! a bulk change. Both sweeps are at-least-once: any failure is logged and
//! the next scheduled run re-evaluates the same predicate.

use sqlx::PgPool;

use crate::config::BillingSettings;
use crate::email::BillingEmailService;
use crate::error::BillingResult;

#[derive(Clone)]
pub struct TrialService {
    pool: PgPool,
    email: BillingEmailService,
    trial_days: i64,
    reminder_day: i64,
}

impl TrialService {
    pub fn new(pool: PgPool, email: BillingEmailService, settings: &BillingSettings) -> Self {
        Self {
            pool,
            email,
            trial_days: settings.trial_days,
            reminder_day: settings.trial_reminder_day,
        }
    }

    /// Demote every account still on free_trial past the trial window.
    /// Single batched update; returns the number of demoted accounts.
    pub async fn expire_trials(&self) -> BillingResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE accounts
            SET tier = 'free', updated_at = NOW()
            WHERE tier = 'free_trial'
              AND created_at < NOW() - make_interval(days => $1::int)
            "#,
        )
        .bind(self.trial_days)
        .execute(&self.pool)
        .await?;

        let expired = result.rows_affected();
        if expired > 0 {
            tracing::info!(expired = expired, "Trial expiry sweep demoted accounts");
        }
        Ok(expired)
    }

    /// Send one reminder email to the batch of accounts inside the 24-hour
    /// window at the reminder day. The window does not repeat for the same
    /// account, so a missed run loses the reminder rather than duplicating
    /// it. Returns the number of recipients.
    pub async fn send_trial_reminders(&self) -> BillingResult<usize> {
        let recipients: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT email
            FROM accounts
            WHERE tier = 'free_trial'
              AND created_at <= NOW() - make_interval(days => $1::int)
              AND created_at > NOW() - make_interval(days => $1::int + 1)
            "#,
        )
        .bind(self.reminder_day)
        .fetch_all(&self.pool)
        .await?;

        if recipients.is_empty() {
            return Ok(0);
        }

        let days_left = self.trial_days - self.reminder_day;
        self.email.send_trial_ending(&recipients, days_left).await;

        tracing::info!(
            recipients = recipients.len(),
            days_left = days_left,
            "Trial-ending reminders sent"
        );
        Ok(recipients.len())
    }
}

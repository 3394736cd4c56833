//! Billing policy settings

/// Tunable policy knobs, loaded from the environment with explicit defaults.
#[derive(Debug, Clone)]
pub struct BillingSettings {
    /// Free-trial length in days.
    pub trial_days: i64,
    /// Day of trial on which the reminder email goes out.
    pub trial_reminder_day: i64,
    /// Days an account stays premium after a failed renewal before the
    /// sweep demotes it.
    pub grace_period_days: i64,
    /// Retention window for processed webhook event rows.
    pub webhook_retention_days: i64,
}

impl Default for BillingSettings {
    fn default() -> Self {
        Self {
            trial_days: 30,
            trial_reminder_day: 27,
            grace_period_days: 7,
            webhook_retention_days: 30,
        }
    }
}

impl BillingSettings {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            trial_days: env_i64("TRIAL_DAYS", defaults.trial_days),
            trial_reminder_day: env_i64("TRIAL_REMINDER_DAY", defaults.trial_reminder_day),
            grace_period_days: env_i64("GRACE_PERIOD_DAYS", defaults.grace_period_days),
            webhook_retention_days: env_i64(
                "WEBHOOK_RETENTION_DAYS",
                defaults.webhook_retention_days,
            ),
        }
    }
}

fn env_i64(key: &str, default: i64) -> i64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

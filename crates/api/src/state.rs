//! Shared application state

use std::sync::Arc;

use sqlx::PgPool;
use vendly_billing::BillingService;

#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub billing: Arc<BillingService>,
}

impl AppState {
    pub fn new(pool: PgPool, billing: BillingService) -> Self {
        Self {
            pool,
            billing: Arc::new(billing),
        }
    }
}

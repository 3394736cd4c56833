//! Vendly Shared
//!
//! Cross-crate infrastructure: database pool construction, migrations,
//! and the domain types every service needs (account tiers).

pub mod db;
pub mod types;

pub use db::{create_pool, run_migrations};
pub use types::AccountTier;

//! Error types for the billing engine.

use thiserror::Error;
use vmgrid_state::StateError;

/// Result type alias for billing operations.
pub type BillingResult<T> = Result<T, BillingError>;

#[derive(Debug, Error)]
pub enum BillingError {
    #[error("state error: {0}")]
    State(#[from] StateError),

    /// The VM has no flavor, or the flavor has no price for the OS family.
    #[error("no hourly price for virtual machine {vm} ({os_family})")]
    NoPrice { vm: u64, os_family: String },

    #[error("invalid amount: {0}")]
    InvalidAmount(i64),

    #[error("overdraft limit must not be negative: {0}")]
    NegativeOverdraft(i64),
}

//! Error types for the placement optimizer.

use thiserror::Error;
use vmgrid_billing::BillingError;
use vmgrid_cloud::CloudError;
use vmgrid_state::StateError;

/// Result type alias for placement operations.
pub type PlacementResult<T> = Result<T, PlacementError>;

/// Placement failures. A missing template is not one of them: that
/// outcome is [`PlacementOutcome::Unsatisfied`](crate::PlacementOutcome).
#[derive(Debug, Error)]
pub enum PlacementError {
    #[error("state error: {0}")]
    State(#[from] StateError),

    #[error("billing error: {0}")]
    Billing(#[from] BillingError),

    #[error("provider error: {0}")]
    Cloud(#[from] CloudError),
}

//! Lifecycle error types.

use thiserror::Error;
use vmgrid_billing::BillingError;
use vmgrid_cloud::CloudError;
use vmgrid_network::NetworkError;
use vmgrid_placement::PlacementError;
use vmgrid_state::StateError;

/// Errors returned by lifecycle operations.
///
/// `Conflict` and `Invalid` reject a request before anything is written.
/// `Invariant` rejects an operation the platform must never perform.
#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("invalid request: {0}")]
    Invalid(String),

    #[error("invariant violation: {0}")]
    Invariant(String),

    #[error("state store error: {0}")]
    State(#[from] StateError),

    #[error("billing error: {0}")]
    Billing(#[from] BillingError),

    #[error("placement error: {0}")]
    Placement(#[from] PlacementError),

    #[error("network error: {0}")]
    Network(#[from] NetworkError),

    #[error("provider error: {0}")]
    Cloud(#[from] CloudError),
}

pub type LifecycleResult<T> = Result<T, LifecycleError>;

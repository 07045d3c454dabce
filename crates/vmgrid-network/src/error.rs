//! Error types for the network mapping manager.

use thiserror::Error;
use vmgrid_cloud::CloudError;
use vmgrid_state::StateError;

/// Result type alias for mapping operations.
pub type NetworkResult<T> = Result<T, NetworkError>;

#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("state error: {0}")]
    State(#[from] StateError),

    #[error("dnat error: {0}")]
    Cloud(#[from] CloudError),
}

//! Error types for provider adapters.

use thiserror::Error;

/// Result type alias for adapter calls.
pub type CloudResult<T> = Result<T, CloudError>;

/// Failures surfaced by compute-site, monitoring and DNAT adapters.
///
/// Callers treat every variant as transient: the failure is logged and the
/// operation is skipped or rolled back for this cycle.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum CloudError {
    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("provider unavailable: {0}")]
    Unavailable(String),

    #[error("not found at provider: {0}")]
    NotFound(String),

    #[error("{op} timed out after {after_ms}ms")]
    Timeout { op: &'static str, after_ms: u64 },

    #[error("no adapter registered for compute site {0}")]
    UnknownSite(String),

    #[error("provider error: {0}")]
    Provider(String),
}

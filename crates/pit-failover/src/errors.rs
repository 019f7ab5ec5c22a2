//! Failover error types.

/// Errors from profile bookkeeping operations.
#[derive(Debug, thiserror::Error)]
pub enum FailoverError {
    /// No registered profile carries the given ID.
    #[error("Unknown profile: {0}")]
    UnknownProfile(String),
}

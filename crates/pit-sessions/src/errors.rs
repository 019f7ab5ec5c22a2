//! Spawner errors.
//!
//! Only malformed spawn input is an error. Queueing is a normal state, a
//! failed handle becomes a terminal session failure, and inapplicable
//! `send`/`cancel` calls report `false`.

use thiserror::Error;

/// Errors returned by `SessionSpawner::spawn`.
#[derive(Debug, Error)]
pub enum SpawnError {
    /// The spawn request was malformed.
    #[error("invalid spawn request: {0}")]
    Validation(String),
}

impl SpawnError {
    /// Stable category string for log routing.
    pub fn category(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
        }
    }

    /// Whether retrying the same call could succeed.
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Validation(_) => false,
        }
    }
}

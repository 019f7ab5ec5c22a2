//! # pit-failover
//!
//! Credential and model failover for completion calls. Maintains per-provider
//! pools of [`types::AuthProfile`]s, rotates among them fairly, excludes
//! profiles under cooldown, and maps provider failures to recovery actions
//! (rotate credential, fall back to the next model, retry, or abort).

#![deny(unsafe_code)]

pub mod classifier;
pub mod errors;
pub mod service;
pub mod types;

pub use classifier::{FailureClass, FailureClassifier, RegexClassifier};
pub use errors::FailoverError;
pub use service::{
    FailoverConfig, FailoverStats, ModelFailoverService, ProfileStats, ProviderPoolStats,
};
pub use types::{
    AuthProfile, CredentialKind, FailoverAction, FailoverDecision, FailoverState,
    ProviderFailure, UsageStats,
};

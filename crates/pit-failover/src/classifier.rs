//! Failure classification.
//!
//! Classification is a pluggable seam so pattern changes never touch the
//! failover logic. The default implementation matches status codes, error
//! codes, and message substrings with precompiled regexes.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::types::ProviderFailure;

/// Failure classes in evaluation precedence order (first match wins).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    /// Provider rate limit (HTTP 429 and friends).
    RateLimit,
    /// Request or connection timed out.
    Timeout,
    /// Credential rejected (401/403, invalid key).
    Auth,
    /// Provider-side error (status ≥ 500).
    Server,
    /// Anything else.
    Other,
}

/// Maps a [`ProviderFailure`] to a [`FailureClass`].
pub trait FailureClassifier: Send + Sync {
    /// Classify a failure.
    fn classify(&self, failure: &ProviderFailure) -> FailureClass;
}

static RATE_LIMIT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)rate\s*limit").unwrap());
static TIMEOUT_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)timed?\s*out").unwrap());

/// Default regex-based classifier.
#[derive(Clone, Copy, Debug, Default)]
pub struct RegexClassifier;

impl FailureClassifier for RegexClassifier {
    fn classify(&self, failure: &ProviderFailure) -> FailureClass {
        let code = failure.code.as_deref().unwrap_or("");

        // 1. Rate limit
        if failure.status == Some(429)
            || code == "rate_limit"
            || RATE_LIMIT_RE.is_match(&failure.message)
        {
            return FailureClass::RateLimit;
        }

        // 2. Timeout
        if code == "ETIMEDOUT"
            || code.to_ascii_lowercase().contains("timeout")
            || TIMEOUT_RE.is_match(&failure.message)
            || failure.message.to_ascii_lowercase().contains("timeout")
        {
            return FailureClass::Timeout;
        }

        // 3. Auth
        if matches!(failure.status, Some(401 | 403)) || code == "invalid_api_key" {
            return FailureClass::Auth;
        }

        // 4. Server
        if failure.status.is_some_and(|s| s >= 500) {
            return FailureClass::Server;
        }

        FailureClass::Other
    }
}

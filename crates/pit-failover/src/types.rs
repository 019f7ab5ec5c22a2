//! Failover data model: credential profiles, per-conversation state, and
//! the failure/decision vocabulary.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ─────────────────────────────────────────────────────────────────────────────
// Credential profiles
// ─────────────────────────────────────────────────────────────────────────────

/// Kind of credential a profile carries.
///
/// OAuth profiles are preferred over API keys when selecting from a pool.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialKind {
    /// OAuth access token.
    OAuth,
    /// Static API key.
    ApiKey,
}

/// Request/failure bookkeeping for one profile.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageStats {
    /// Successful requests attributed to this profile.
    pub requests: u64,
    /// Failures attributed to this profile.
    pub failures: u64,
    /// Time of the most recent failure.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_failure: Option<DateTime<Utc>>,
}

/// One provider credential in a selection pool.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthProfile {
    /// Unique profile ID.
    pub id: String,
    /// Provider the credential belongs to (e.g. `"openai"`).
    pub provider: String,
    /// Credential kind.
    pub kind: CredentialKind,
    /// The secret itself (API key or access token).
    pub secret: String,
    /// Credential expiry, if the provider issued one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    /// Last time the profile served a successful request.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_used: Option<DateTime<Utc>>,
    /// Timed exclusion window after a rate-limit failure. A profile whose
    /// cooldown lies in the future is never selectable; once real time
    /// passes it, the profile is selectable again with no manual reset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cooldown_until: Option<DateTime<Utc>>,
    /// Permanently excluded (auth failure).
    #[serde(default)]
    pub disabled: bool,
    /// Usage bookkeeping.
    #[serde(default)]
    pub usage: UsageStats,
}

impl AuthProfile {
    /// Create a profile with empty bookkeeping.
    pub fn new(
        id: impl Into<String>,
        provider: impl Into<String>,
        kind: CredentialKind,
        secret: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            provider: provider.into(),
            kind,
            secret: secret.into(),
            expires_at: None,
            last_used: None,
            cooldown_until: None,
            disabled: false,
            usage: UsageStats::default(),
        }
    }

    /// Whether the profile may be selected at `now`.
    pub fn is_available(&self, now: DateTime<Utc>) -> bool {
        !self.disabled && self.cooldown_until.is_none_or(|until| until <= now)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Per-conversation failover state
// ─────────────────────────────────────────────────────────────────────────────

/// Failover cursor for one logical conversation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailoverState {
    /// Model currently in use (primary or a fallback).
    pub current_model: String,
    /// Profile most recently selected, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_profile_id: Option<String>,
    /// Position in the fallback list; −1 means the primary model.
    pub fallback_index: i64,
    /// Monotonic round-robin counter. Never decreases except via `reset()`.
    pub rotation_index: u64,
    /// Session a profile was pinned for, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pinned_session_id: Option<String>,
}

impl FailoverState {
    /// Fresh state pointing at the primary model.
    pub fn new(primary_model: &str) -> Self {
        Self {
            current_model: primary_model.to_owned(),
            current_profile_id: None,
            fallback_index: -1,
            rotation_index: 0,
            pinned_session_id: None,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Failures and decisions
// ─────────────────────────────────────────────────────────────────────────────

/// A provider failure as observed by the completion caller.
///
/// Carries whichever of status / code / message the transport produced;
/// classification tries them in that order of specificity.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderFailure {
    /// HTTP status, when the failure came from an HTTP response.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    /// Provider or transport error code (e.g. `"rate_limit"`, `"ETIMEDOUT"`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    /// Human-readable description.
    pub message: String,
}

impl ProviderFailure {
    /// Failure from an HTTP status and message.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        Self {
            status: Some(status),
            code: None,
            message: message.into(),
        }
    }

    /// Failure from an error code and message.
    pub fn from_code(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status: None,
            code: Some(code.into()),
            message: message.into(),
        }
    }
}

/// Recovery action chosen for a failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailoverAction {
    /// Retry the same call with a different credential profile.
    Rotate,
    /// Retry against the next fallback model.
    Fallback,
    /// Retry the same call unchanged.
    Retry,
    /// Give up; surface the failure to the caller.
    Abort,
}

/// Outcome of [`crate::ModelFailoverService::handle_error`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailoverDecision {
    /// Action the caller should take.
    pub action: FailoverAction,
    /// Model to use next (set for `Fallback`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Profile to use next (set for `Rotate`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub profile: Option<AuthProfile>,
}

impl FailoverDecision {
    /// A bare action with no replacement model or profile.
    pub fn action(action: FailoverAction) -> Self {
        Self {
            action,
            model: None,
            profile: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn profile_available_by_default() {
        let p = AuthProfile::new("p1", "openai", CredentialKind::ApiKey, "sk-1");
        assert!(p.is_available(Utc::now()));
    }

    #[test]
    fn disabled_profile_never_available() {
        let mut p = AuthProfile::new("p1", "openai", CredentialKind::ApiKey, "sk-1");
        p.disabled = true;
        assert!(!p.is_available(Utc::now()));
    }

    #[test]
    fn cooldown_excludes_until_elapsed() {
        let now = Utc::now();
        let mut p = AuthProfile::new("p1", "openai", CredentialKind::OAuth, "tok");
        p.cooldown_until = Some(now + Duration::seconds(60));
        assert!(!p.is_available(now));
        // Once the wall clock passes the cooldown, no reset is needed
        assert!(p.is_available(now + Duration::seconds(61)));
    }

    #[test]
    fn state_starts_at_primary() {
        let state = FailoverState::new("gpt-4o");
        assert_eq!(state.current_model, "gpt-4o");
        assert_eq!(state.fallback_index, -1);
        assert_eq!(state.rotation_index, 0);
    }

    #[test]
    fn decision_serde_format() {
        let d = FailoverDecision::action(FailoverAction::Abort);
        let json = serde_json::to_string(&d).unwrap();
        assert_eq!(json, r#"{"action":"abort"}"#);
    }
}

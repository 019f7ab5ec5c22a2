//! Model failover service.
//!
//! One instance holds the per-provider credential pools plus the failover
//! cursor for one logical conversation. Call [`ModelFailoverService::reset`]
//! at the start of each unrelated top-level conversation so state does not
//! leak across sessions.
//!
//! All pool mutations run under a single mutex, so concurrent callers
//! always observe a consistent pool.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{Duration, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::classifier::{FailureClass, FailureClassifier, RegexClassifier};
use crate::errors::FailoverError;
use crate::types::{
    AuthProfile, CredentialKind, FailoverAction, FailoverDecision, FailoverState,
    ProviderFailure,
};

/// Default cooldown after a rate-limit failure.
const DEFAULT_COOLDOWN_MS: i64 = 60_000;

// ─────────────────────────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Failover configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailoverConfig {
    /// Primary model.
    pub primary_model: String,
    /// Fallback models tried in order once the primary's profiles are exhausted.
    #[serde(default)]
    pub fallback_models: Vec<String>,
    /// Cooldown window applied to a rate-limited profile, in milliseconds.
    pub cooldown_ms: i64,
    /// Whether timeouts resolve to a retry (vs. abort).
    pub rotate_on_timeout: bool,
}

impl Default for FailoverConfig {
    fn default() -> Self {
        Self {
            primary_model: String::new(),
            fallback_models: vec![],
            cooldown_ms: DEFAULT_COOLDOWN_MS,
            rotate_on_timeout: true,
        }
    }
}

/// Usage snapshot for one profile.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileStats {
    /// Profile ID.
    pub id: String,
    /// Credential kind.
    pub kind: CredentialKind,
    /// Successful requests.
    pub requests: u64,
    /// Recorded failures.
    pub failures: u64,
    /// Whether the profile is selectable right now.
    pub available: bool,
}

/// Per-provider pool counts for observability.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderPoolStats {
    /// Registered profiles.
    pub total: usize,
    /// Profiles selectable right now.
    pub available: usize,
    /// Profiles currently excluded by cooldown.
    pub in_cooldown: usize,
    /// Per-profile usage numbers.
    pub profiles: Vec<ProfileStats>,
}

/// Snapshot returned by [`ModelFailoverService::stats`].
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailoverStats {
    /// Pool counts keyed by provider.
    pub providers: HashMap<String, ProviderPoolStats>,
    /// Current model.
    pub current_model: String,
    /// Most recently selected profile.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_profile_id: Option<String>,
    /// Position in the fallback list (−1 = primary).
    pub fallback_index: i64,
}

// ─────────────────────────────────────────────────────────────────────────────
// Service
// ─────────────────────────────────────────────────────────────────────────────

struct Inner {
    pools: HashMap<String, Vec<AuthProfile>>,
    state: FailoverState,
}

/// Rotates credentials and models for a completion caller.
pub struct ModelFailoverService {
    config: FailoverConfig,
    classifier: Arc<dyn FailureClassifier>,
    inner: Mutex<Inner>,
}

impl ModelFailoverService {
    /// Create a service with the default regex classifier.
    pub fn new(config: FailoverConfig) -> Self {
        Self::with_classifier(config, Arc::new(RegexClassifier))
    }

    /// Create a service with a custom failure classifier.
    pub fn with_classifier(
        config: FailoverConfig,
        classifier: Arc<dyn FailureClassifier>,
    ) -> Self {
        let state = FailoverState::new(&config.primary_model);
        Self {
            config,
            classifier,
            inner: Mutex::new(Inner {
                pools: HashMap::new(),
                state,
            }),
        }
    }

    /// Replace the profile pool for a provider.
    pub fn register_profiles(&self, provider: &str, profiles: Vec<AuthProfile>) {
        debug!(provider, count = profiles.len(), "profiles registered");
        let _ = self
            .inner
            .lock()
            .pools
            .insert(provider.to_owned(), profiles);
    }

    /// Selectable profiles for a provider, in fairness order:
    /// OAuth before API key, then ascending `last_used` (oldest first).
    pub fn available_profiles(&self, provider: &str) -> Vec<AuthProfile> {
        let inner = self.inner.lock();
        let now = Utc::now();
        let mut available: Vec<AuthProfile> = inner
            .pools
            .get(provider)
            .map(|pool| {
                pool.iter()
                    .filter(|p| p.is_available(now))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        available.sort_by(|a, b| {
            kind_rank(a.kind)
                .cmp(&kind_rank(b.kind))
                .then(a.last_used.cmp(&b.last_used))
        });
        available
    }

    /// Round-robin over the available set; `None` when the pool is empty.
    ///
    /// The rotation counter only advances; nothing resets it except
    /// [`Self::reset`].
    pub fn next_profile(&self, provider: &str) -> Option<AuthProfile> {
        let available = self.available_profiles(provider);
        if available.is_empty() {
            return None;
        }

        let mut inner = self.inner.lock();
        #[allow(clippy::cast_possible_truncation)]
        let idx = (inner.state.rotation_index % available.len() as u64) as usize;
        inner.state.rotation_index += 1;

        let selected = available[idx].clone();
        inner.state.current_profile_id = Some(selected.id.clone());
        debug!(provider, profile = %selected.id, "profile selected");
        Some(selected)
    }

    /// Pin a profile to a session, making it the current selection.
    pub fn pin_profile(&self, profile_id: &str, session_id: &str) -> Result<(), FailoverError> {
        let mut inner = self.inner.lock();
        if !pool_contains(&inner.pools, profile_id) {
            return Err(FailoverError::UnknownProfile(profile_id.to_owned()));
        }
        inner.state.current_profile_id = Some(profile_id.to_owned());
        inner.state.pinned_session_id = Some(session_id.to_owned());
        Ok(())
    }

    /// Put a profile into cooldown and record the failure.
    pub fn cooldown_profile(&self, profile_id: &str) -> Result<(), FailoverError> {
        let mut inner = self.inner.lock();
        let cooldown_ms = self.config.cooldown_ms;
        let profile = find_profile_mut(&mut inner.pools, profile_id)
            .ok_or_else(|| FailoverError::UnknownProfile(profile_id.to_owned()))?;
        let now = Utc::now();
        profile.cooldown_until = Some(now + Duration::milliseconds(cooldown_ms));
        profile.usage.failures += 1;
        profile.usage.last_failure = Some(now);
        warn!(profile = profile_id, cooldown_ms, "profile cooled down");
        Ok(())
    }

    /// Permanently disable a profile (auth failure).
    pub fn disable_profile(&self, profile_id: &str) -> Result<(), FailoverError> {
        let mut inner = self.inner.lock();
        let profile = find_profile_mut(&mut inner.pools, profile_id)
            .ok_or_else(|| FailoverError::UnknownProfile(profile_id.to_owned()))?;
        profile.disabled = true;
        profile.usage.failures += 1;
        profile.usage.last_failure = Some(Utc::now());
        warn!(profile = profile_id, "profile disabled");
        Ok(())
    }

    /// Record a successful request on a profile. Call on every success.
    pub fn mark_profile_used(&self, profile_id: &str) -> Result<(), FailoverError> {
        let mut inner = self.inner.lock();
        let profile = find_profile_mut(&mut inner.pools, profile_id)
            .ok_or_else(|| FailoverError::UnknownProfile(profile_id.to_owned()))?;
        profile.last_used = Some(Utc::now());
        profile.usage.requests += 1;
        Ok(())
    }

    /// Advance into the fallback model list.
    ///
    /// Returns the new model, or `None` (state unchanged) once exhausted.
    pub fn fallback_to_next_model(&self) -> Option<String> {
        let mut inner = self.inner.lock();
        #[allow(clippy::cast_possible_wrap)]
        let last = self.config.fallback_models.len() as i64 - 1;
        if inner.state.fallback_index >= last {
            return None;
        }
        inner.state.fallback_index += 1;
        #[allow(clippy::cast_sign_loss)]
        let model = self.config.fallback_models[inner.state.fallback_index as usize].clone();
        inner.state.current_model = model.clone();
        info!(model, fallback_index = inner.state.fallback_index, "model fallback");
        Some(model)
    }

    /// Back to the primary model with a zeroed rotation counter.
    ///
    /// Call at the start of each unrelated top-level conversation.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.state = FailoverState::new(&self.config.primary_model);
    }

    /// Map a provider failure to a recovery action.
    ///
    /// Precedence (first match wins): rate limit → rotate/fallback/abort;
    /// timeout → retry when enabled; auth → disable and rotate or abort;
    /// server (≥500) → retry; anything else → abort.
    pub fn handle_error(&self, provider: &str, failure: &ProviderFailure) -> FailoverDecision {
        let class = self.classifier.classify(failure);
        debug!(provider, ?class, message = %failure.message, "provider failure");

        match class {
            FailureClass::RateLimit => {
                if let Some(current) = self.current_profile_id() {
                    let _ = self.cooldown_profile(&current);
                }
                if let Some(profile) = self.next_profile(provider) {
                    return FailoverDecision {
                        action: FailoverAction::Rotate,
                        model: None,
                        profile: Some(profile),
                    };
                }
                if let Some(model) = self.fallback_to_next_model() {
                    return FailoverDecision {
                        action: FailoverAction::Fallback,
                        model: Some(model),
                        profile: None,
                    };
                }
                FailoverDecision::action(FailoverAction::Abort)
            }
            FailureClass::Timeout => {
                if self.config.rotate_on_timeout {
                    FailoverDecision::action(FailoverAction::Retry)
                } else {
                    FailoverDecision::action(FailoverAction::Abort)
                }
            }
            FailureClass::Auth => {
                if let Some(current) = self.current_profile_id() {
                    let _ = self.disable_profile(&current);
                }
                if let Some(profile) = self.next_profile(provider) {
                    return FailoverDecision {
                        action: FailoverAction::Rotate,
                        model: None,
                        profile: Some(profile),
                    };
                }
                FailoverDecision::action(FailoverAction::Abort)
            }
            FailureClass::Server => FailoverDecision::action(FailoverAction::Retry),
            FailureClass::Other => FailoverDecision::action(FailoverAction::Abort),
        }
    }

    /// Snapshot of the failover cursor.
    pub fn state(&self) -> FailoverState {
        self.inner.lock().state.clone()
    }

    /// Per-provider pool counts plus the current cursor.
    pub fn stats(&self) -> FailoverStats {
        let inner = self.inner.lock();
        let now = Utc::now();
        let providers = inner
            .pools
            .iter()
            .map(|(provider, pool)| {
                let available = pool.iter().filter(|p| p.is_available(now)).count();
                let in_cooldown = pool
                    .iter()
                    .filter(|p| p.cooldown_until.is_some_and(|until| until > now))
                    .count();
                let profiles = pool
                    .iter()
                    .map(|p| ProfileStats {
                        id: p.id.clone(),
                        kind: p.kind,
                        requests: p.usage.requests,
                        failures: p.usage.failures,
                        available: p.is_available(now),
                    })
                    .collect();
                (
                    provider.clone(),
                    ProviderPoolStats {
                        total: pool.len(),
                        available,
                        in_cooldown,
                        profiles,
                    },
                )
            })
            .collect();
        FailoverStats {
            providers,
            current_model: inner.state.current_model.clone(),
            current_profile_id: inner.state.current_profile_id.clone(),
            fallback_index: inner.state.fallback_index,
        }
    }

    fn current_profile_id(&self) -> Option<String> {
        self.inner.lock().state.current_profile_id.clone()
    }
}

fn kind_rank(kind: CredentialKind) -> u8 {
    match kind {
        CredentialKind::OAuth => 0,
        CredentialKind::ApiKey => 1,
    }
}

fn pool_contains(pools: &HashMap<String, Vec<AuthProfile>>, profile_id: &str) -> bool {
    pools
        .values()
        .any(|pool| pool.iter().any(|p| p.id == profile_id))
}

fn find_profile_mut<'a>(
    pools: &'a mut HashMap<String, Vec<AuthProfile>>,
    profile_id: &str,
) -> Option<&'a mut AuthProfile> {
    pools
        .values_mut()
        .find_map(|pool| pool.iter_mut().find(|p| p.id == profile_id))
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

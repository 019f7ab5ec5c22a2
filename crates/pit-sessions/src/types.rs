//! Session records and spawner configuration.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Default concurrent-session cap.
pub const DEFAULT_MAX_CONCURRENT: usize = 3;
/// Default per-session wall-clock timeout.
pub const DEFAULT_TIMEOUT_MS: u64 = 300_000;

/// Lifecycle state of a session. Transitions are forward-only.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Created, waiting for a slot.
    Pending,
    /// Executing against its handle.
    Running,
    /// Finished with a result.
    Completed,
    /// Finished with an error (including timeout).
    Failed,
    /// Cancelled by the caller before completion.
    Cancelled,
}

impl SessionStatus {
    /// Whether this state can never change again.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// Options accepted by `SessionSpawner::spawn`.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpawnOptions {
    /// Human-readable label.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    /// Spawning session, when nested.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_session_id: Option<String>,
    /// Model override; the spawner default applies when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// System prompt handed to the execution handle.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    /// Timeout override in milliseconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    /// Whether the host should surface the final result. On by default.
    #[serde(default = "default_announce_result")]
    pub announce_result: bool,
    /// Accepted for compatibility; the overflow queue is strict FIFO.
    #[serde(default)]
    pub priority: i64,
    /// Opaque host metadata carried on the session record.
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}

fn default_announce_result() -> bool {
    true
}

impl Default for SpawnOptions {
    fn default() -> Self {
        Self {
            label: None,
            parent_session_id: None,
            model: None,
            system_prompt: None,
            timeout_ms: None,
            announce_result: true,
            priority: 0,
            metadata: HashMap::new(),
        }
    }
}

/// One background session. Snapshots of this record are handed out by
/// `get`/`list`; the spawner owns the live copy.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    /// Unique session ID (UUID v7, so IDs sort by creation time).
    pub id: String,
    /// Task text the session runs.
    pub task: String,
    /// Lifecycle state.
    pub status: SessionStatus,
    /// Coarse progress in `[0.0, 1.0]`.
    pub progress: f64,
    /// Final output; set only on `Completed`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    /// Failure description; set only on `Failed`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Model the session is bound to.
    pub model: String,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Set when the session leaves the queue and starts executing.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// Set on any terminal transition.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Options the session was spawned with.
    pub options: SpawnOptions,
}

impl Session {
    /// Label, when one was provided.
    pub fn label(&self) -> Option<&str> {
        self.options.label.as_deref()
    }

    /// Parent session, when nested.
    pub fn parent_session_id(&self) -> Option<&str> {
        self.options.parent_session_id.as_deref()
    }
}

/// Filter for `SessionSpawner::list`.
#[derive(Clone, Debug, Default)]
pub struct SessionFilter {
    /// Only sessions in this state.
    pub status: Option<SessionStatus>,
    /// Only children of this session.
    pub parent_session_id: Option<String>,
    /// Cap on the number of returned sessions (newest first).
    pub limit: Option<usize>,
}

/// Aggregate counts returned by `SessionSpawner::status`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpawnerStatus {
    /// Sessions waiting for a slot.
    pub pending: usize,
    /// Sessions currently executing.
    pub running: usize,
    /// Sessions finished successfully.
    pub completed: usize,
    /// Sessions finished with an error.
    pub failed: usize,
    /// Sessions cancelled by the caller.
    pub cancelled: usize,
    /// Current overflow queue length.
    pub queued: usize,
    /// Configured concurrency cap.
    pub max_concurrent: usize,
}

/// Spawner configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpawnerConfig {
    /// Concurrent-session cap.
    pub max_concurrent: usize,
    /// Model used when spawn options omit one.
    pub default_model: String,
    /// Timeout used when spawn options omit one, in milliseconds.
    pub default_timeout_ms: u64,
}

impl Default for SpawnerConfig {
    fn default() -> Self {
        Self {
            max_concurrent: DEFAULT_MAX_CONCURRENT,
            default_model: String::new(),
            default_timeout_ms: DEFAULT_TIMEOUT_MS,
        }
    }
}

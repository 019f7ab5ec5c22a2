//! Lifecycle events for the Pit runtime.
//!
//! Two families share one enum: `session.*` events emitted by the session
//! spawner and `subagent.*` events derived from them by the sub-agent
//! layer. Events are broadcast in emission order over [`EventBus`]; late
//! subscribers do not receive earlier events.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;

/// Broadcast channel capacity. Slow subscribers past this lag are dropped
/// to `Lagged` rather than blocking emitters.
const EVENT_BUS_CAPACITY: usize = 256;

// ─────────────────────────────────────────────────────────────────────────────
// BaseEvent
// ─────────────────────────────────────────────────────────────────────────────

/// Fields common to every lifecycle event.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BaseEvent {
    /// Session the event belongs to.
    pub session_id: String,
    /// Emission time.
    pub timestamp: DateTime<Utc>,
}

impl BaseEvent {
    /// Base event stamped with the current time.
    pub fn now(session_id: &str) -> Self {
        Self {
            session_id: session_id.to_owned(),
            timestamp: Utc::now(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// PitEvent
// ─────────────────────────────────────────────────────────────────────────────

/// Session and sub-agent lifecycle events.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum PitEvent {
    /// A session was created (it may start immediately or queue).
    #[serde(rename = "session.created")]
    SessionCreated {
        /// Common fields.
        #[serde(flatten)]
        base: BaseEvent,
        /// Task text the session will run.
        task: String,
        /// Optional human label.
        #[serde(skip_serializing_if = "Option::is_none")]
        label: Option<String>,
    },

    /// A session entered the pending queue (concurrency cap reached).
    #[serde(rename = "session.queued")]
    SessionQueued {
        /// Common fields.
        #[serde(flatten)]
        base: BaseEvent,
        /// Zero-based position in the FIFO queue at enqueue time.
        position: usize,
    },

    /// A session began executing.
    #[serde(rename = "session.started")]
    SessionStarted {
        /// Common fields.
        #[serde(flatten)]
        base: BaseEvent,
        /// Model the execution handle was bound to.
        model: String,
    },

    /// Incremental output arrived from a running session.
    #[serde(rename = "session.progress")]
    SessionProgress {
        /// Common fields.
        #[serde(flatten)]
        base: BaseEvent,
        /// Output fragment.
        chunk: String,
    },

    /// A session finished successfully.
    #[serde(rename = "session.completed")]
    SessionCompleted {
        /// Common fields.
        #[serde(flatten)]
        base: BaseEvent,
        /// Full accumulated output.
        result: String,
        /// Wall-clock duration in milliseconds.
        duration_ms: u64,
    },

    /// A session failed (handle error, start failure, or timeout).
    #[serde(rename = "session.failed")]
    SessionFailed {
        /// Common fields.
        #[serde(flatten)]
        base: BaseEvent,
        /// Failure description.
        error: String,
        /// Wall-clock duration in milliseconds.
        duration_ms: u64,
    },

    /// A session was cancelled by the caller.
    #[serde(rename = "session.cancelled")]
    SessionCancelled {
        /// Common fields.
        #[serde(flatten)]
        base: BaseEvent,
        /// Whether the session was running (vs. still pending) when cancelled.
        was_running: bool,
    },

    /// A typed sub-agent was registered atop a session.
    #[serde(rename = "subagent.spawned")]
    SubagentSpawned {
        /// Common fields.
        #[serde(flatten)]
        base: BaseEvent,
        /// Sub-agent type name (strategy, analysis, ...).
        agent_type: String,
        /// Tags attached at spawn.
        tags: Vec<String>,
    },

    /// A sub-agent's underlying session produced output.
    #[serde(rename = "subagent.progress")]
    SubagentProgress {
        /// Common fields.
        #[serde(flatten)]
        base: BaseEvent,
        /// Output fragment.
        chunk: String,
    },

    /// A sub-agent finished with a parsed result.
    #[serde(rename = "subagent.completed")]
    SubagentCompleted {
        /// Common fields.
        #[serde(flatten)]
        base: BaseEvent,
        /// Sub-agent type name.
        agent_type: String,
        /// Result summary (≤200 chars).
        summary: String,
        /// Parsed metrics as opaque JSON.
        #[serde(skip_serializing_if = "Option::is_none")]
        metrics: Option<Value>,
        /// Wall-clock duration in milliseconds.
        duration_ms: u64,
    },

    /// A sub-agent's session failed.
    #[serde(rename = "subagent.failed")]
    SubagentFailed {
        /// Common fields.
        #[serde(flatten)]
        base: BaseEvent,
        /// Failure description.
        error: String,
        /// Wall-clock duration in milliseconds.
        duration_ms: u64,
    },

    /// A sub-agent's session was cancelled.
    #[serde(rename = "subagent.cancelled")]
    SubagentCancelled {
        /// Common fields.
        #[serde(flatten)]
        base: BaseEvent,
    },
}

impl PitEvent {
    /// Event type string for log and UI routing.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::SessionCreated { .. } => "session.created",
            Self::SessionQueued { .. } => "session.queued",
            Self::SessionStarted { .. } => "session.started",
            Self::SessionProgress { .. } => "session.progress",
            Self::SessionCompleted { .. } => "session.completed",
            Self::SessionFailed { .. } => "session.failed",
            Self::SessionCancelled { .. } => "session.cancelled",
            Self::SubagentSpawned { .. } => "subagent.spawned",
            Self::SubagentProgress { .. } => "subagent.progress",
            Self::SubagentCompleted { .. } => "subagent.completed",
            Self::SubagentFailed { .. } => "subagent.failed",
            Self::SubagentCancelled { .. } => "subagent.cancelled",
        }
    }

    /// Session ID the event refers to.
    pub fn session_id(&self) -> &str {
        match self {
            Self::SessionCreated { base, .. }
            | Self::SessionQueued { base, .. }
            | Self::SessionStarted { base, .. }
            | Self::SessionProgress { base, .. }
            | Self::SessionCompleted { base, .. }
            | Self::SessionFailed { base, .. }
            | Self::SessionCancelled { base, .. }
            | Self::SubagentSpawned { base, .. }
            | Self::SubagentProgress { base, .. }
            | Self::SubagentCompleted { base, .. }
            | Self::SubagentFailed { base, .. }
            | Self::SubagentCancelled { base } => &base.session_id,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// EventBus
// ─────────────────────────────────────────────────────────────────────────────

/// Broadcast bus for [`PitEvent`]s.
///
/// Emission never blocks and never fails; an event with no subscribers is
/// simply dropped. Delivery order equals emission order per subscriber.
pub struct EventBus {
    tx: broadcast::Sender<PitEvent>,
}

impl EventBus {
    /// Create a bus with the default capacity.
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_BUS_CAPACITY);
        Self { tx }
    }

    /// Emit an event to all current subscribers.
    pub fn emit(&self, event: PitEvent) {
        let _ = self.tx.send(event);
    }

    /// Subscribe to events emitted after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<PitEvent> {
        self.tx.subscribe()
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

//! The session spawner.
//!
//! Scheduling invariant: the running count and the overflow queue live
//! behind one mutex, so the capacity check and the start-or-enqueue
//! decision are a single atomic step. Every terminal transition releases
//! its slot exactly once; whichever path performs the status transition
//! owns the release.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use dashmap::DashMap;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, warn};
use uuid::Uuid;

use pit_core::events::{BaseEvent, EventBus, PitEvent};

use crate::errors::SpawnError;
use crate::handle::{ExecutionHandle, HandleError, HandleEvent, HandleFactory, HandleSpec};
use crate::types::{Session, SessionFilter, SessionStatus, SpawnOptions, SpawnerConfig, SpawnerStatus};

struct SchedState {
    running: usize,
    queue: VecDeque<String>,
}

struct ActiveRun {
    cancel: CancellationToken,
    // None while the factory is still creating the handle.
    handle: Option<Arc<dyn ExecutionHandle>>,
}

enum RunOutcome {
    Completed(String),
    Failed(String),
    Cancelled,
}

/// Runs background sessions with a concurrency cap and a FIFO overflow
/// queue. Cheap to share; all methods take `&self`.
pub struct SessionSpawner {
    config: SpawnerConfig,
    factory: Arc<dyn HandleFactory>,
    bus: Arc<EventBus>,
    sessions: DashMap<String, Session>,
    active: DashMap<String, ActiveRun>,
    sched: Mutex<SchedState>,
}

impl SessionSpawner {
    /// Create a spawner bound to a handle factory and an event bus.
    pub fn new(
        config: SpawnerConfig,
        factory: Arc<dyn HandleFactory>,
        bus: Arc<EventBus>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            factory,
            bus,
            sessions: DashMap::new(),
            active: DashMap::new(),
            sched: Mutex::new(SchedState {
                running: 0,
                queue: VecDeque::new(),
            }),
        })
    }

    /// Create a session and either start it or queue it.
    ///
    /// Returns a snapshot of the new session. The only error is a
    /// malformed request; hitting the concurrency cap queues instead.
    pub fn spawn(
        self: &Arc<Self>,
        task: &str,
        options: SpawnOptions,
    ) -> Result<Session, SpawnError> {
        if task.trim().is_empty() {
            return Err(SpawnError::Validation("task must not be empty".into()));
        }

        let id = Uuid::now_v7().to_string();
        let model = options
            .model
            .clone()
            .unwrap_or_else(|| self.config.default_model.clone());
        let session = Session {
            id: id.clone(),
            task: task.to_owned(),
            status: SessionStatus::Pending,
            progress: 0.0,
            result: None,
            error: None,
            model,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            options,
        };
        let label = session.options.label.clone();
        let _ = self.sessions.insert(id.clone(), session.clone());

        info!(session_id = %id, "session created");
        self.bus.emit(PitEvent::SessionCreated {
            base: BaseEvent::now(&id),
            task: task.to_owned(),
            label,
        });

        // Capacity check and placement are one atomic step.
        let queued_at = {
            let mut sched = self.sched.lock();
            if sched.running < self.config.max_concurrent {
                sched.running += 1;
                None
            } else {
                sched.queue.push_back(id.clone());
                Some(sched.queue.len() - 1)
            }
        };

        match queued_at {
            None => self.start_run(id),
            Some(position) => {
                debug!(session_id = %session.id, position, "session queued");
                self.bus.emit(PitEvent::SessionQueued {
                    base: BaseEvent::now(&session.id),
                    position,
                });
            }
        }

        Ok(session)
    }

    /// Snapshot of one session.
    pub fn get(&self, id: &str) -> Option<Session> {
        self.sessions.get(id).map(|s| s.value().clone())
    }

    /// Session snapshots matching a filter, newest first.
    pub fn list(&self, filter: &SessionFilter) -> Vec<Session> {
        let mut sessions: Vec<Session> = self
            .sessions
            .iter()
            .filter(|s| filter.status.is_none_or(|status| s.status == status))
            .filter(|s| {
                filter
                    .parent_session_id
                    .as_deref()
                    .is_none_or(|parent| s.parent_session_id() == Some(parent))
            })
            .map(|s| s.value().clone())
            .collect();
        sessions.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        if let Some(limit) = filter.limit {
            sessions.truncate(limit);
        }
        sessions
    }

    /// Forward a message into a running session.
    ///
    /// Returns `false` when the session is not running; that is a normal
    /// outcome, not an error.
    pub async fn send_message(&self, id: &str, text: &str) -> bool {
        let Some(handle) = self.active.get(id).and_then(|run| run.handle.clone()) else {
            return false;
        };
        match handle.send(text).await {
            Ok(()) => true,
            Err(err) => {
                warn!(session_id = %id, error = %err, "send_message failed");
                false
            }
        }
    }

    /// Cancel a session.
    ///
    /// Pending sessions leave the queue without ever running. Running
    /// sessions have their token fired and their slot released before
    /// this returns. Terminal or unknown sessions report `false`.
    pub fn cancel(self: &Arc<Self>, id: &str) -> bool {
        let was_running = {
            let Some(mut session) = self.sessions.get_mut(id) else {
                return false;
            };
            if session.status.is_terminal() {
                return false;
            }
            let was_running = session.status == SessionStatus::Running;
            session.status = SessionStatus::Cancelled;
            session.error = Some("Session cancelled".into());
            session.completed_at = Some(Utc::now());
            was_running
        };

        info!(session_id = %id, was_running, "session cancelled");
        self.bus.emit(PitEvent::SessionCancelled {
            base: BaseEvent::now(id),
            was_running,
        });

        if was_running {
            if let Some((_, run)) = self.active.remove(id) {
                run.cancel.cancel();
            }
            self.release_slot_and_drain();
        } else {
            // Pending: drop the queue entry if it is still there. A
            // promoted-but-not-yet-running session holds a slot that its
            // run task releases when it observes the terminal status.
            let mut sched = self.sched.lock();
            sched.queue.retain(|queued| queued != id);
        }
        true
    }

    /// Remove terminal sessions older than `max_age_ms`.
    ///
    /// Returns the number removed. Pending and running sessions are
    /// never touched.
    pub fn cleanup(&self, max_age_ms: u64) -> usize {
        #[allow(clippy::cast_possible_wrap)]
        let cutoff = Utc::now() - chrono::Duration::milliseconds(max_age_ms as i64);
        let before = self.sessions.len();
        self.sessions.retain(|_, session| {
            !(session.status.is_terminal()
                && session.completed_at.is_some_and(|at| at < cutoff))
        });
        let removed = before - self.sessions.len();
        if removed > 0 {
            debug!(removed, "sessions cleaned up");
        }
        removed
    }

    /// Aggregate counts per status plus queue depth.
    pub fn status(&self) -> SpawnerStatus {
        let mut status = SpawnerStatus {
            max_concurrent: self.config.max_concurrent,
            queued: self.sched.lock().queue.len(),
            ..SpawnerStatus::default()
        };
        for session in &self.sessions {
            match session.status {
                SessionStatus::Pending => status.pending += 1,
                SessionStatus::Running => status.running += 1,
                SessionStatus::Completed => status.completed += 1,
                SessionStatus::Failed => status.failed += 1,
                SessionStatus::Cancelled => status.cancelled += 1,
            }
        }
        status
    }

    // ── internal ────────────────────────────────────────────────────────

    /// Spawn the run task for a session whose slot is already held.
    fn start_run(self: &Arc<Self>, id: String) {
        let spawner = Arc::clone(self);
        let span = info_span!("session", session_id = %id);
        let _ = tokio::spawn(async move { spawner.run(id).await }.instrument(span));
    }

    async fn run(self: Arc<Self>, id: String) {
        let started = Instant::now();

        // Cancelled between promotion and here: give the slot back.
        let Some((model, system_prompt, timeout_ms)) = self.mark_running(&id) else {
            self.release_slot_and_drain();
            return;
        };

        info!(model, "session started");
        self.bus.emit(PitEvent::SessionStarted {
            base: BaseEvent::now(&id),
            model: model.clone(),
        });

        // Register the token before creating the handle so a cancel
        // issued during startup still reaches this task.
        let cancel = CancellationToken::new();
        let _ = self.active.insert(
            id.clone(),
            ActiveRun {
                cancel: cancel.clone(),
                handle: None,
            },
        );
        // Cancelled in the window before the insert above: the token was
        // not yet in `active` for cancel() to fire, so fire it here.
        if self.sessions.get(&id).is_none_or(|s| s.status.is_terminal()) {
            cancel.cancel();
        }

        let created = tokio::select! {
            () = cancel.cancelled() => None,
            created = self.factory.create(HandleSpec {
                session_id: id.clone(),
                model,
                system_prompt,
            }) => Some(created),
        };

        let outcome = match created {
            None => RunOutcome::Cancelled,
            Some(Err(err)) => RunOutcome::Failed(err.to_string()),
            Some(Ok(handle)) => {
                if let Some(mut run) = self.active.get_mut(&id) {
                    run.handle = Some(Arc::clone(&handle));
                }
                tokio::select! {
                    () = cancel.cancelled() => RunOutcome::Cancelled,
                    res = tokio::time::timeout(
                        Duration::from_millis(timeout_ms),
                        self.consume(&id, handle),
                    ) => match res {
                        Ok(Ok(output)) => RunOutcome::Completed(output),
                        Ok(Err(err)) => RunOutcome::Failed(err.to_string()),
                        Err(_) => RunOutcome::Failed("Session timed out".into()),
                    },
                }
            }
        };

        let _ = self.active.remove(&id);
        self.finish(&id, outcome, started);
    }

    /// Transition Pending → Running and return the run parameters, or
    /// `None` when the session is gone or no longer pending.
    fn mark_running(&self, id: &str) -> Option<(String, Option<String>, u64)> {
        let mut session = self.sessions.get_mut(id)?;
        if session.status != SessionStatus::Pending {
            return None;
        }
        session.status = SessionStatus::Running;
        session.started_at = Some(Utc::now());
        Some((
            session.model.clone(),
            session.options.system_prompt.clone(),
            session
                .options
                .timeout_ms
                .unwrap_or(self.config.default_timeout_ms),
        ))
    }

    /// Drive the handle's event stream to completion, accumulating output.
    async fn consume(
        &self,
        id: &str,
        handle: Arc<dyn ExecutionHandle>,
    ) -> Result<String, HandleError> {
        let mut stream = handle.start().await?;
        let mut output = String::new();
        while let Some(event) = stream.next().await {
            match event? {
                HandleEvent::Chunk { delta } => {
                    output.push_str(&delta);
                    self.bus.emit(PitEvent::SessionProgress {
                        base: BaseEvent::now(id),
                        chunk: delta,
                    });
                }
                HandleEvent::Completed { output: final_output } => {
                    if let Some(final_output) = final_output {
                        output = final_output;
                    }
                    return Ok(output);
                }
            }
        }
        // End of stream without a Completed event counts as completion
        // with whatever accumulated.
        Ok(output)
    }

    /// Apply a terminal outcome. No-op when another path (cancel) already
    /// transitioned the session; the slot is released only by the path
    /// that performed the transition.
    fn finish(self: &Arc<Self>, id: &str, outcome: RunOutcome, started: Instant) {
        #[allow(clippy::cast_possible_truncation)]
        let duration_ms = started.elapsed().as_millis() as u64;

        let event = {
            // A missing record means cleanup removed an already-terminal
            // session; that transition released the slot.
            let Some(mut session) = self.sessions.get_mut(id) else {
                return;
            };
            if session.status.is_terminal() {
                return;
            }
            session.completed_at = Some(Utc::now());
            match outcome {
                RunOutcome::Completed(result) => {
                    session.status = SessionStatus::Completed;
                    session.progress = 1.0;
                    session.result = Some(result.clone());
                    PitEvent::SessionCompleted {
                        base: BaseEvent::now(id),
                        result,
                        duration_ms,
                    }
                }
                RunOutcome::Failed(error) => {
                    session.status = SessionStatus::Failed;
                    session.error = Some(error.clone());
                    PitEvent::SessionFailed {
                        base: BaseEvent::now(id),
                        error,
                        duration_ms,
                    }
                }
                RunOutcome::Cancelled => {
                    session.status = SessionStatus::Cancelled;
                    session.error = Some("Session cancelled".into());
                    PitEvent::SessionCancelled {
                        base: BaseEvent::now(id),
                        was_running: true,
                    }
                }
            }
        };

        info!(session_id = %id, event = event.event_type(), duration_ms, "session finished");
        self.bus.emit(event);
        self.release_slot_and_drain();
    }

    /// Give a slot back and promote the queue head, if any.
    fn release_slot_and_drain(self: &Arc<Self>) {
        let next = {
            let mut sched = self.sched.lock();
            sched.running = sched.running.saturating_sub(1);
            if sched.running < self.config.max_concurrent {
                let next = sched.queue.pop_front();
                if next.is_some() {
                    sched.running += 1;
                }
                next
            } else {
                None
            }
        };
        if let Some(id) = next {
            self.start_run(id);
        }
    }
}

//! The sub-agent spawner.
//!
//! Registry maintenance is event-driven: a background listener consumes
//! `session.*` events from the shared bus, mirrors status into the
//! registry, parses terminal output into results and re-emits
//! `subagent.*` events. Session state is owned by the session spawner
//! alone.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use pit_core::events::{BaseEvent, EventBus, PitEvent};
use pit_core::text::truncate_str;
use pit_sessions::{SessionSpawner, SessionStatus, SpawnError};

use crate::metrics::{MetricParser, RegexMetricParser};
use crate::prompts;
use crate::types::{
    AgentMetrics, AgentType, ResultStatus, StrategySpawn, SubAgentEntry, SubAgentOptions,
    SubAgentResult, TradingContext,
};

/// Summary length cap on results and events.
const SUMMARY_MAX_CHARS: usize = 200;
/// Polling cadence of `wait_for_all`.
const WAIT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Filter for `SubAgentSpawner::list`.
#[derive(Clone, Debug, Default)]
pub struct AgentFilter {
    /// Only agents of this type.
    pub agent_type: Option<AgentType>,
    /// Only agents sharing at least one of these tags.
    pub tags: Vec<String>,
    /// Only agents in this mirrored session status.
    pub status: Option<SessionStatus>,
}

/// Aggregate counts returned by `SubAgentSpawner::status`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AgentsStatus {
    /// Registered agents.
    pub total: usize,
    /// Agents waiting for a slot.
    pub pending: usize,
    /// Agents currently executing.
    pub running: usize,
    /// Agents finished successfully.
    pub completed: usize,
    /// Agents finished with an error.
    pub failed: usize,
    /// Agents cancelled.
    pub cancelled: usize,
}

struct Registry {
    entries: DashMap<String, SubAgentEntry>,
    mailboxes: DashMap<String, Vec<SubAgentResult>>,
    completion_order: Mutex<Vec<String>>,
}

/// Spawns and tracks typed trading sub-agents atop a [`SessionSpawner`].
pub struct SubAgentSpawner {
    sessions: Arc<SessionSpawner>,
    bus: Arc<EventBus>,
    parser: Arc<dyn MetricParser>,
    registry: Arc<Registry>,
    shutdown: CancellationToken,
}

impl SubAgentSpawner {
    /// Create a spawner with the default regex metric parser.
    ///
    /// Must be called inside a tokio runtime; the event listener task
    /// starts immediately.
    pub fn new(sessions: Arc<SessionSpawner>, bus: Arc<EventBus>) -> Arc<Self> {
        Self::with_parser(sessions, bus, Arc::new(RegexMetricParser))
    }

    /// Create a spawner with a custom metric parser.
    pub fn with_parser(
        sessions: Arc<SessionSpawner>,
        bus: Arc<EventBus>,
        parser: Arc<dyn MetricParser>,
    ) -> Arc<Self> {
        let registry = Arc::new(Registry {
            entries: DashMap::new(),
            mailboxes: DashMap::new(),
            completion_order: Mutex::new(Vec::new()),
        });
        let shutdown = CancellationToken::new();

        let rx = bus.subscribe();
        let _ = tokio::spawn(listen(
            rx,
            Arc::clone(&bus),
            Arc::clone(&registry),
            Arc::clone(&parser),
            shutdown.clone(),
        ));

        Arc::new(Self {
            sessions,
            bus,
            parser,
            registry,
            shutdown,
        })
    }

    /// Spawn one typed sub-agent.
    ///
    /// The session task is the type's instruction template, the rendered
    /// trading-context block, then the caller's task enriched with
    /// context fields it does not already mention.
    pub fn spawn(
        &self,
        task: &str,
        options: SubAgentOptions,
    ) -> Result<SubAgentEntry, SpawnError> {
        let full_task = prompts::build_task(task, options.agent_type, &options.trading_context);

        let mut session_options = options.session;
        if session_options.label.is_none() {
            session_options.label = Some(format!(
                "{}: {}",
                options.agent_type.as_str(),
                truncate_str(task, 60)
            ));
        }
        let session = self.sessions.spawn(&full_task, session_options)?;

        let tags: BTreeSet<String> = options.tags.into_iter().collect();
        let entry = SubAgentEntry {
            session_id: session.id.clone(),
            agent_type: options.agent_type,
            tags: tags.clone(),
            context: options.trading_context,
            share_results_with: options.share_results_with,
            status: session.status,
            result: None,
            created_at: Utc::now(),
        };
        let _ = self.registry.entries.insert(session.id.clone(), entry.clone());

        // The session may have advanced (or finished) before the entry
        // landed in the registry; resync so no terminal event is lost.
        if let Some(live) = self.sessions.get(&session.id) {
            if live.status.is_terminal() {
                let output = live.result.or(live.error).unwrap_or_default();
                settle(&self.bus, &self.registry, &*self.parser, &session.id, live.status, output, None);
            } else if let Some(mut tracked) = self.registry.entries.get_mut(&session.id) {
                tracked.status = live.status;
            }
        }

        info!(session_id = %session.id, agent_type = options.agent_type.as_str(), "subagent spawned");
        self.bus.emit(PitEvent::SubagentSpawned {
            base: BaseEvent::now(&session.id),
            agent_type: options.agent_type.as_str().to_owned(),
            tags: tags.into_iter().collect(),
        });

        Ok(entry)
    }

    /// Spawn one strategy agent per item. Parallelism comes from the
    /// session spawner's concurrency cap.
    pub fn spawn_strategies(
        &self,
        strategies: Vec<StrategySpawn>,
    ) -> Result<Vec<SubAgentEntry>, SpawnError> {
        let mut entries = Vec::with_capacity(strategies.len());
        for spec in strategies {
            let task = spec
                .task
                .unwrap_or_else(|| format!("Execute the {} strategy", spec.strategy));
            let mut tags = spec.tags;
            tags.push(spec.strategy.clone());
            let options = SubAgentOptions {
                agent_type: AgentType::Strategy,
                trading_context: TradingContext {
                    symbols: spec.symbols,
                    timeframe: spec.timeframe,
                    strategy: Some(spec.strategy),
                    ..TradingContext::default()
                },
                tags,
                ..SubAgentOptions::default()
            };
            entries.push(self.spawn(&task, options)?);
        }
        Ok(entries)
    }

    /// Spawn one agent of the given type per symbol, tagged with the
    /// lowercased symbol.
    pub fn spawn_multi_symbol_analysis(
        &self,
        symbols: &[String],
        timeframe: &str,
        agent_type: AgentType,
    ) -> Result<Vec<SubAgentEntry>, SpawnError> {
        let mut entries = Vec::with_capacity(symbols.len());
        for symbol in symbols {
            let options = SubAgentOptions {
                agent_type,
                trading_context: TradingContext {
                    symbols: vec![symbol.clone()],
                    timeframe: Some(timeframe.to_owned()),
                    ..TradingContext::default()
                },
                tags: vec![symbol.to_lowercase()],
                ..SubAgentOptions::default()
            };
            entries.push(self.spawn(&format!("Analyze {symbol}"), options)?);
        }
        Ok(entries)
    }

    /// Snapshot of one agent, with status refreshed from the session
    /// spawner for agents that have not settled yet.
    pub fn get(&self, id: &str) -> Option<SubAgentEntry> {
        let mut entry = self.registry.entries.get(id).map(|e| e.value().clone())?;
        if entry.result.is_none() {
            if let Some(session) = self.sessions.get(id) {
                entry.status = session.status;
            }
        }
        Some(entry)
    }

    /// Agent snapshots matching a filter, newest first.
    pub fn list(&self, filter: &AgentFilter) -> Vec<SubAgentEntry> {
        let mut entries: Vec<SubAgentEntry> = self
            .registry
            .entries
            .iter()
            .filter(|e| filter.agent_type.is_none_or(|t| e.agent_type == t))
            .filter(|e| filter.status.is_none_or(|s| e.status == s))
            .filter(|e| {
                filter.tags.is_empty() || filter.tags.iter().any(|tag| e.tags.contains(tag))
            })
            .map(|e| e.value().clone())
            .collect();
        entries.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        entries
    }

    /// Aggregate counts over the registry. Unsettled entries are counted
    /// by their live session status.
    pub fn status(&self) -> AgentsStatus {
        let mut status = AgentsStatus::default();
        for entry in &self.registry.entries {
            status.total += 1;
            let current = if entry.result.is_none() {
                self.sessions
                    .get(&entry.session_id)
                    .map_or(entry.status, |s| s.status)
            } else {
                entry.status
            };
            match current {
                SessionStatus::Pending => status.pending += 1,
                SessionStatus::Running => status.running += 1,
                SessionStatus::Completed => status.completed += 1,
                SessionStatus::Failed => status.failed += 1,
                SessionStatus::Cancelled => status.cancelled += 1,
            }
        }
        status
    }

    /// Forward a message to a registered agent's session.
    pub async fn send(&self, id: &str, text: &str) -> bool {
        if !self.registry.entries.contains_key(id) {
            return false;
        }
        self.sessions.send_message(id, text).await
    }

    /// Cancel a registered agent's session.
    pub fn cancel(&self, id: &str) -> bool {
        self.registry.entries.contains_key(id) && self.sessions.cancel(id)
    }

    /// Wait until all listed agents have a result or the timeout passes,
    /// polling at a fixed one-second cadence.
    ///
    /// Returns the results of whichever agents finished; a partial set on
    /// timeout is a normal outcome, not an error.
    pub async fn wait_for_all(&self, ids: &[String], timeout_ms: u64) -> Vec<SubAgentResult> {
        let deadline = Instant::now() + Duration::from_millis(timeout_ms);
        loop {
            let results: Vec<SubAgentResult> = ids
                .iter()
                .filter_map(|id| {
                    self.registry
                        .entries
                        .get(id)
                        .and_then(|e| e.result.clone())
                })
                .collect();
            if results.len() == ids.len() {
                return results;
            }
            let now = Instant::now();
            if now >= deadline {
                debug!(
                    finished = results.len(),
                    total = ids.len(),
                    "wait_for_all timed out with partial results"
                );
                return results;
            }
            tokio::time::sleep(WAIT_POLL_INTERVAL.min(deadline - now)).await;
        }
    }

    /// Results of agents carrying a tag, in completion order.
    pub fn results_by_tag(&self, tag: &str) -> Vec<SubAgentResult> {
        let order = self.registry.completion_order.lock().clone();
        order
            .iter()
            .filter_map(|id| self.registry.entries.get(id))
            .filter(|e| e.tags.contains(tag))
            .filter_map(|e| e.result.clone())
            .collect()
    }

    /// Take all results shared with an agent, emptying its mailbox.
    pub fn drain_mailbox(&self, id: &str) -> Vec<SubAgentResult> {
        self.registry
            .mailboxes
            .remove(id)
            .map(|(_, results)| results)
            .unwrap_or_default()
    }

    /// Build a result record from raw output without touching the
    /// registry. Settlement applies the same derivation when a session
    /// finishes; this covers output obtained out of band.
    pub fn parse_result(&self, id: &str, raw: &str) -> SubAgentResult {
        let agent_type = self
            .registry
            .entries
            .get(id)
            .map(|entry| entry.agent_type)
            .unwrap_or_default();
        build_result(
            &*self.parser,
            id,
            agent_type,
            SessionStatus::Completed,
            raw.to_owned(),
            0,
        )
    }
}

impl Drop for SubAgentSpawner {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

// ── listener ────────────────────────────────────────────────────────────

async fn listen(
    mut rx: tokio::sync::broadcast::Receiver<PitEvent>,
    bus: Arc<EventBus>,
    registry: Arc<Registry>,
    parser: Arc<dyn MetricParser>,
    shutdown: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            () = shutdown.cancelled() => break,
            recv = rx.recv() => match recv {
                Ok(event) => event,
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "subagent listener lagged behind the event bus");
                    continue;
                }
                Err(RecvError::Closed) => break,
            },
        };

        match event {
            PitEvent::SessionStarted { base, .. } => {
                if let Some(mut entry) = registry.entries.get_mut(&base.session_id) {
                    entry.status = SessionStatus::Running;
                }
            }
            PitEvent::SessionProgress { base, chunk } => {
                if registry.entries.contains_key(&base.session_id) {
                    bus.emit(PitEvent::SubagentProgress {
                        base: BaseEvent::now(&base.session_id),
                        chunk,
                    });
                }
            }
            PitEvent::SessionCompleted {
                base,
                result,
                duration_ms,
            } => settle(
                &bus,
                &registry,
                &*parser,
                &base.session_id,
                SessionStatus::Completed,
                result,
                Some(duration_ms),
            ),
            PitEvent::SessionFailed {
                base,
                error,
                duration_ms,
            } => settle(
                &bus,
                &registry,
                &*parser,
                &base.session_id,
                SessionStatus::Failed,
                error,
                Some(duration_ms),
            ),
            PitEvent::SessionCancelled { base, .. } => settle(
                &bus,
                &registry,
                &*parser,
                &base.session_id,
                SessionStatus::Cancelled,
                "cancelled".to_owned(),
                None,
            ),
            _ => {}
        }
    }
}

/// Derive a [`SubAgentResult`] from raw output: status from whether the
/// output is empty, metrics through the parser, summary truncated.
fn build_result(
    parser: &dyn MetricParser,
    id: &str,
    agent_type: AgentType,
    final_status: SessionStatus,
    output: String,
    duration_ms: u64,
) -> SubAgentResult {
    let status = match final_status {
        SessionStatus::Completed if !output.trim().is_empty() => ResultStatus::Success,
        SessionStatus::Completed => ResultStatus::Partial,
        _ => ResultStatus::Error,
    };
    let metrics = if final_status == SessionStatus::Completed {
        parser.parse(&output)
    } else {
        AgentMetrics::default()
    };
    SubAgentResult {
        session_id: id.to_owned(),
        agent_type,
        status,
        summary: truncate_str(&output, SUMMARY_MAX_CHARS).to_owned(),
        output,
        metrics,
        completed_at: Utc::now(),
        duration_ms,
    }
}

/// Apply one terminal session outcome to the registry: parse the result,
/// record completion order, deliver shared copies and emit the matching
/// `subagent.*` event. Idempotent per agent.
fn settle(
    bus: &EventBus,
    registry: &Registry,
    parser: &dyn MetricParser,
    id: &str,
    final_status: SessionStatus,
    output: String,
    duration_ms: Option<u64>,
) {
    let (result, share_targets, agent_type) = {
        let Some(mut entry) = registry.entries.get_mut(id) else {
            return;
        };
        if entry.result.is_some() {
            return;
        }
        entry.status = final_status;

        #[allow(clippy::cast_sign_loss)]
        let duration_ms = duration_ms.unwrap_or_else(|| {
            (Utc::now() - entry.created_at).num_milliseconds().max(0) as u64
        });
        let result = build_result(parser, id, entry.agent_type, final_status, output, duration_ms);
        entry.result = Some(result.clone());
        (result, entry.share_results_with.clone(), entry.agent_type)
    };

    registry.completion_order.lock().push(id.to_owned());
    for target in &share_targets {
        registry
            .mailboxes
            .entry(target.clone())
            .or_default()
            .push(result.clone());
    }

    let event = match final_status {
        SessionStatus::Completed => PitEvent::SubagentCompleted {
            base: BaseEvent::now(id),
            agent_type: agent_type.as_str().to_owned(),
            summary: result.summary.clone(),
            metrics: if result.metrics.is_empty() {
                None
            } else {
                serde_json::to_value(result.metrics).ok()
            },
            duration_ms: result.duration_ms,
        },
        SessionStatus::Failed => PitEvent::SubagentFailed {
            base: BaseEvent::now(id),
            error: result.output.clone(),
            duration_ms: result.duration_ms,
        },
        _ => PitEvent::SubagentCancelled {
            base: BaseEvent::now(id),
        },
    };
    debug!(session_id = %id, event = event.event_type(), "subagent settled");
    bus.emit(event);
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use async_stream::stream;
    use async_trait::async_trait;
    use tokio::sync::{Notify, broadcast};

    use pit_sessions::{
        ExecutionHandle, HandleError, HandleEvent, HandleFactory, HandleSpec, HandleStream,
        SpawnerConfig,
    };

    use super::*;

    /// Per-session run controlled by the test.
    #[derive(Default)]
    struct Run {
        go: Arc<Notify>,
        output: String,
    }

    /// Factory whose handles complete with a test-supplied output when
    /// the test calls [`TriggeredFactory::complete`].
    #[derive(Default)]
    struct TriggeredFactory {
        runs: Arc<Mutex<HashMap<String, Run>>>,
    }

    impl TriggeredFactory {
        fn complete(&self, session_id: &str, output: &str) {
            let mut runs = self.runs.lock();
            let run = runs.entry(session_id.to_owned()).or_default();
            run.output = output.to_owned();
            run.go.notify_one();
        }
    }

    struct TriggeredHandle {
        session_id: String,
        go: Arc<Notify>,
        runs: Arc<Mutex<HashMap<String, Run>>>,
    }

    #[async_trait]
    impl ExecutionHandle for TriggeredHandle {
        async fn start(&self) -> Result<HandleStream, HandleError> {
            let go = Arc::clone(&self.go);
            let runs = Arc::clone(&self.runs);
            let session_id = self.session_id.clone();
            Ok(Box::pin(stream! {
                go.notified().await;
                let output = runs
                    .lock()
                    .get(&session_id)
                    .map(|run| run.output.clone())
                    .unwrap_or_default();
                yield Ok(HandleEvent::Completed { output: Some(output) });
            }))
        }

        async fn send(&self, _message: &str) -> Result<(), HandleError> {
            Ok(())
        }
    }

    #[async_trait]
    impl HandleFactory for TriggeredFactory {
        async fn create(&self, spec: HandleSpec) -> Result<Arc<dyn ExecutionHandle>, HandleError> {
            let go = Arc::clone(
                &self
                    .runs
                    .lock()
                    .entry(spec.session_id.clone())
                    .or_default()
                    .go,
            );
            Ok(Arc::new(TriggeredHandle {
                session_id: spec.session_id,
                go,
                runs: Arc::clone(&self.runs),
            }))
        }
    }

    /// Factory that refuses to create handles.
    struct FailingFactory;

    #[async_trait]
    impl HandleFactory for FailingFactory {
        async fn create(&self, _spec: HandleSpec) -> Result<Arc<dyn ExecutionHandle>, HandleError> {
            Err(HandleError::Start("no broker connection".into()))
        }
    }

    struct Fixture {
        agents: Arc<SubAgentSpawner>,
        factory: Arc<TriggeredFactory>,
        rx: broadcast::Receiver<PitEvent>,
    }

    fn fixture(max_concurrent: usize) -> Fixture {
        let bus = Arc::new(EventBus::new());
        let rx = bus.subscribe();
        let factory = Arc::new(TriggeredFactory::default());
        let sessions = SessionSpawner::new(
            SpawnerConfig {
                max_concurrent,
                default_model: "gpt-4o-mini".into(),
                default_timeout_ms: 5_000,
            },
            factory.clone(),
            Arc::clone(&bus),
        );
        let agents = SubAgentSpawner::new(sessions, bus);
        Fixture {
            agents,
            factory,
            rx,
        }
    }

    async fn wait_for(
        rx: &mut broadcast::Receiver<PitEvent>,
        event_type: &str,
        session_id: &str,
    ) -> PitEvent {
        loop {
            let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .expect("timed out waiting for event")
                .expect("event bus closed");
            if event.event_type() == event_type && event.session_id() == session_id {
                return event;
            }
        }
    }

    #[tokio::test]
    async fn spawn_registers_entry_and_builds_task() {
        let mut fx = fixture(2);
        let entry = fx
            .agents
            .spawn(
                "Assess momentum",
                SubAgentOptions {
                    agent_type: AgentType::Analysis,
                    trading_context: TradingContext {
                        symbols: vec!["BTC-USD".into()],
                        timeframe: Some("4h".into()),
                        ..TradingContext::default()
                    },
                    tags: vec!["btc".into()],
                    ..SubAgentOptions::default()
                },
            )
            .unwrap();

        let spawned = wait_for(&mut fx.rx, "subagent.spawned", &entry.session_id).await;
        assert!(matches!(
            spawned,
            PitEvent::SubagentSpawned { ref agent_type, .. } if agent_type.as_str() == "analysis"
        ));

        let listed = fx.agents.list(&AgentFilter::default());
        assert_eq!(listed.len(), 1);
        assert!(listed[0].tags.contains("btc"));

        fx.factory.complete(&entry.session_id, "uptrend");
        let _ = wait_for(&mut fx.rx, "subagent.completed", &entry.session_id).await;
    }

    #[tokio::test]
    async fn parse_result_builds_record_from_raw_output() {
        let mut fx = fixture(2);
        let entry = fx
            .agents
            .spawn(
                "Backtest breakout",
                SubAgentOptions {
                    agent_type: AgentType::Backtest,
                    ..SubAgentOptions::default()
                },
            )
            .unwrap();
        let _ = wait_for(&mut fx.rx, "subagent.spawned", &entry.session_id).await;

        let result = fx
            .agents
            .parse_result(&entry.session_id, "Profit: 1,250.50 over 42 trades, win rate 58%");
        assert_eq!(result.agent_type, AgentType::Backtest);
        assert_eq!(result.status, ResultStatus::Success);
        assert_eq!(result.metrics.profit, Some(1250.50));
        assert_eq!(result.metrics.trades, Some(42));

        // Unknown agents still parse, with the default type and no metrics.
        let empty = fx.agents.parse_result("unknown", "   ");
        assert_eq!(empty.agent_type, AgentType::Generic);
        assert_eq!(empty.status, ResultStatus::Partial);
        assert!(empty.metrics.is_empty());
    }

    #[tokio::test]
    async fn completion_parses_metrics_and_truncates_summary() {
        let mut fx = fixture(1);
        let entry = fx
            .agents
            .spawn(
                "Backtest it",
                SubAgentOptions {
                    agent_type: AgentType::Backtest,
                    ..SubAgentOptions::default()
                },
            )
            .unwrap();

        let padding = "x".repeat(300);
        let output = format!("Profit: 12.5%, win rate: 60%, 20 trades, Sharpe: 1.4. {padding}");
        fx.factory.complete(&entry.session_id, &output);
        let completed = wait_for(&mut fx.rx, "subagent.completed", &entry.session_id).await;
        assert!(matches!(
            completed,
            PitEvent::SubagentCompleted { metrics: Some(_), .. }
        ));

        let result = fx.agents.get(&entry.session_id).unwrap().result.unwrap();
        assert_eq!(result.status, ResultStatus::Success);
        assert_eq!(result.metrics.profit, Some(12.5));
        assert_eq!(result.metrics.win_rate, Some(60.0));
        assert_eq!(result.metrics.trades, Some(20));
        assert_eq!(result.metrics.sharpe_ratio, Some(1.4));
        assert!(result.summary.chars().count() <= 200);
        assert_eq!(result.output, output);
    }

    #[tokio::test]
    async fn empty_output_is_partial() {
        let mut fx = fixture(1);
        let entry = fx
            .agents
            .spawn("Do nothing", SubAgentOptions::default())
            .unwrap();
        fx.factory.complete(&entry.session_id, "   ");
        let _ = wait_for(&mut fx.rx, "subagent.completed", &entry.session_id).await;

        let result = fx.agents.get(&entry.session_id).unwrap().result.unwrap();
        assert_eq!(result.status, ResultStatus::Partial);
        assert!(result.metrics.is_empty());
    }

    #[tokio::test]
    async fn session_failure_maps_to_error_result() {
        let bus = Arc::new(EventBus::new());
        let mut rx = bus.subscribe();
        let sessions = SessionSpawner::new(
            SpawnerConfig {
                max_concurrent: 1,
                default_model: "gpt-4o-mini".into(),
                default_timeout_ms: 5_000,
            },
            Arc::new(FailingFactory),
            Arc::clone(&bus),
        );
        let agents = SubAgentSpawner::new(sessions, bus);

        let entry = agents.spawn("Trade", SubAgentOptions::default()).unwrap();
        let failed = wait_for(&mut rx, "subagent.failed", &entry.session_id).await;
        assert!(matches!(
            failed,
            PitEvent::SubagentFailed { ref error, .. } if error.contains("no broker connection")
        ));

        let settled = agents.get(&entry.session_id).unwrap();
        assert_eq!(settled.status, SessionStatus::Failed);
        assert_eq!(settled.result.unwrap().status, ResultStatus::Error);
    }

    #[tokio::test]
    async fn cancel_settles_with_error_result() {
        let mut fx = fixture(1);
        let entry = fx
            .agents
            .spawn("Monitor BTC", SubAgentOptions::default())
            .unwrap();
        let _ = wait_for(&mut fx.rx, "session.started", &entry.session_id).await;

        assert!(fx.agents.cancel(&entry.session_id));
        let _ = wait_for(&mut fx.rx, "subagent.cancelled", &entry.session_id).await;

        let settled = fx.agents.get(&entry.session_id).unwrap();
        assert_eq!(settled.status, SessionStatus::Cancelled);
        assert_eq!(settled.result.unwrap().status, ResultStatus::Error);
    }

    #[tokio::test]
    async fn cancel_and_send_gated_on_registry() {
        let fx = fixture(1);
        assert!(!fx.agents.cancel("not-an-agent"));
        assert!(!fx.agents.send("not-an-agent", "hello").await);
    }

    #[tokio::test]
    async fn shared_results_land_in_mailboxes() {
        let mut fx = fixture(1);
        let entry = fx
            .agents
            .spawn(
                "Scout",
                SubAgentOptions {
                    share_results_with: vec!["aggregator-1".into()],
                    ..SubAgentOptions::default()
                },
            )
            .unwrap();
        fx.factory.complete(&entry.session_id, "found a setup");
        let _ = wait_for(&mut fx.rx, "subagent.completed", &entry.session_id).await;

        let delivered = fx.agents.drain_mailbox("aggregator-1");
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].session_id, entry.session_id);
        assert!(fx.agents.drain_mailbox("aggregator-1").is_empty());
    }

    #[tokio::test]
    async fn wait_for_all_returns_complete_set() {
        let mut fx = fixture(2);
        let a = fx.agents.spawn("a", SubAgentOptions::default()).unwrap();
        let b = fx.agents.spawn("b", SubAgentOptions::default()).unwrap();
        fx.factory.complete(&a.session_id, "a done");
        let _ = wait_for(&mut fx.rx, "subagent.completed", &a.session_id).await;
        fx.factory.complete(&b.session_id, "b done");
        let _ = wait_for(&mut fx.rx, "subagent.completed", &b.session_id).await;

        let ids = vec![a.session_id.clone(), b.session_id.clone()];
        let results = fx.agents.wait_for_all(&ids, 5_000).await;
        assert_eq!(results.len(), 2);
    }

    #[tokio::test]
    async fn wait_for_all_returns_partial_set_on_timeout() {
        let mut fx = fixture(2);
        let done = fx.agents.spawn("done", SubAgentOptions::default()).unwrap();
        let stuck = fx.agents.spawn("stuck", SubAgentOptions::default()).unwrap();
        fx.factory.complete(&done.session_id, "finished");
        let _ = wait_for(&mut fx.rx, "subagent.completed", &done.session_id).await;

        let ids = vec![done.session_id.clone(), stuck.session_id.clone()];
        let results = fx.agents.wait_for_all(&ids, 20).await;
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].session_id, done.session_id);

        fx.factory.complete(&stuck.session_id, "late");
        let _ = wait_for(&mut fx.rx, "subagent.completed", &stuck.session_id).await;
    }

    #[tokio::test]
    async fn results_by_tag_follow_completion_order() {
        let mut fx = fixture(2);
        let opts = |tag: &str| SubAgentOptions {
            tags: vec![tag.into()],
            ..SubAgentOptions::default()
        };
        let first = fx.agents.spawn("one", opts("btc")).unwrap();
        let second = fx.agents.spawn("two", opts("btc")).unwrap();

        // Finish in reverse spawn order.
        fx.factory.complete(&second.session_id, "second done");
        let _ = wait_for(&mut fx.rx, "subagent.completed", &second.session_id).await;
        fx.factory.complete(&first.session_id, "first done");
        let _ = wait_for(&mut fx.rx, "subagent.completed", &first.session_id).await;

        let results = fx.agents.results_by_tag("btc");
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].session_id, second.session_id);
        assert_eq!(results[1].session_id, first.session_id);
        assert!(fx.agents.results_by_tag("eth").is_empty());
    }

    #[tokio::test]
    async fn spawn_strategies_fans_out() {
        let mut fx = fixture(4);
        let entries = fx
            .agents
            .spawn_strategies(vec![
                StrategySpawn {
                    strategy: "breakout".into(),
                    symbols: vec!["BTC-USD".into()],
                    timeframe: Some("1h".into()),
                    task: None,
                    tags: vec![],
                },
                StrategySpawn {
                    strategy: "mean-reversion".into(),
                    symbols: vec!["ETH-USD".into()],
                    timeframe: Some("4h".into()),
                    task: Some("Trade the range".into()),
                    tags: vec!["range".into()],
                },
            ])
            .unwrap();
        assert_eq!(entries.len(), 2);
        assert!(entries[0].tags.contains("breakout"));
        assert!(entries[1].tags.contains("mean-reversion"));
        assert!(entries[1].tags.contains("range"));

        let strategies = fx.agents.list(&AgentFilter {
            agent_type: Some(AgentType::Strategy),
            ..AgentFilter::default()
        });
        assert_eq!(strategies.len(), 2);

        for entry in &entries {
            fx.factory.complete(&entry.session_id, "flat");
            let _ = wait_for(&mut fx.rx, "subagent.completed", &entry.session_id).await;
        }
    }

    #[tokio::test]
    async fn multi_symbol_analysis_spawns_per_symbol() {
        let mut fx = fixture(4);
        let symbols = vec!["BTC-USD".to_owned(), "ETH-USD".to_owned()];
        let entries = fx
            .agents
            .spawn_multi_symbol_analysis(&symbols, "1d", AgentType::Analysis)
            .unwrap();
        assert_eq!(entries.len(), 2);
        assert!(entries[0].tags.contains("btc-usd"));
        assert!(entries[1].tags.contains("eth-usd"));
        assert_eq!(entries[0].context.timeframe.as_deref(), Some("1d"));

        let tagged = fx.agents.list(&AgentFilter {
            tags: vec!["eth-usd".into()],
            ..AgentFilter::default()
        });
        assert_eq!(tagged.len(), 1);

        for entry in &entries {
            fx.factory.complete(&entry.session_id, "done");
            let _ = wait_for(&mut fx.rx, "subagent.completed", &entry.session_id).await;
        }
    }

    #[tokio::test]
    async fn status_counts_registry_entries() {
        let mut fx = fixture(1);
        let running = fx.agents.spawn("run", SubAgentOptions::default()).unwrap();
        let queued = fx.agents.spawn("wait", SubAgentOptions::default()).unwrap();
        let _ = wait_for(&mut fx.rx, "session.started", &running.session_id).await;

        let status = fx.agents.status();
        assert_eq!(status.total, 2);
        assert_eq!(status.running, 1);
        assert_eq!(status.pending, 1);

        fx.factory.complete(&running.session_id, "ok");
        let _ = wait_for(&mut fx.rx, "subagent.completed", &running.session_id).await;
        fx.factory.complete(&queued.session_id, "ok");
        let _ = wait_for(&mut fx.rx, "subagent.completed", &queued.session_id).await;
        assert_eq!(fx.agents.status().completed, 2);
    }
}

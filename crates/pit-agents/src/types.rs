//! Sub-agent records and options.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use pit_sessions::{SessionStatus, SpawnOptions};

/// Kind of work a sub-agent performs. The type selects its instruction
/// template and expected output shape.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentType {
    /// Executes a trading strategy, reporting trades and PnL.
    Strategy,
    /// Analyzes market conditions and key levels.
    Analysis,
    /// Backtests a strategy over a date range.
    Backtest,
    /// Researches a topic, reporting findings with sources.
    Research,
    /// Monitors positions or symbols, reporting status and events.
    Monitor,
    /// Combines results from other agents.
    Aggregator,
    /// Free-form task with no imposed output shape.
    #[default]
    Generic,
}

impl AgentType {
    /// Stable lowercase name used in tags, events and logs.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Strategy => "strategy",
            Self::Analysis => "analysis",
            Self::Backtest => "backtest",
            Self::Research => "research",
            Self::Monitor => "monitor",
            Self::Aggregator => "aggregator",
            Self::Generic => "generic",
        }
    }
}

/// Inclusive date range for backtests.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DateRange {
    /// Range start, ISO date.
    pub start: String,
    /// Range end, ISO date.
    pub end: String,
}

/// Trading parameters rendered into the sub-agent's instructions.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TradingContext {
    /// Symbols in scope.
    #[serde(default)]
    pub symbols: Vec<String>,
    /// Chart timeframe ("1h", "4h", "1d", ...).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeframe: Option<String>,
    /// Strategy name.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub strategy: Option<String>,
    /// Opaque risk parameters.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub risk_params: Option<Value>,
    /// Backtest date range.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub date_range: Option<DateRange>,
}

/// Terminal result classification.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultStatus {
    /// Completed with output.
    Success,
    /// Completed without usable output.
    Partial,
    /// Failed or cancelled.
    Error,
}

/// Numeric metrics extracted from a sub-agent's output. Absent labels
/// stay `None`; extraction never fails.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentMetrics {
    /// Profit, in percent or account currency as reported.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub profit: Option<f64>,
    /// Win rate in percent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub win_rate: Option<f64>,
    /// Trade count.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trades: Option<u64>,
    /// Sharpe ratio.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sharpe_ratio: Option<f64>,
}

impl AgentMetrics {
    /// Whether no metric was extracted.
    pub fn is_empty(&self) -> bool {
        self.profit.is_none()
            && self.win_rate.is_none()
            && self.trades.is_none()
            && self.sharpe_ratio.is_none()
    }
}

/// Parsed terminal result of one sub-agent.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubAgentResult {
    /// Underlying session ID.
    pub session_id: String,
    /// Agent type.
    pub agent_type: AgentType,
    /// Result classification.
    pub status: ResultStatus,
    /// Raw output (or failure text).
    pub output: String,
    /// Extracted metrics.
    pub metrics: AgentMetrics,
    /// Output truncated to 200 characters.
    pub summary: String,
    /// When the agent finished.
    pub completed_at: DateTime<Utc>,
    /// Wall-clock duration in milliseconds.
    pub duration_ms: u64,
}

/// Registry entry for one sub-agent.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubAgentEntry {
    /// Underlying session ID; also the sub-agent's ID.
    pub session_id: String,
    /// Agent type.
    pub agent_type: AgentType,
    /// Tags for grouping and lookup.
    pub tags: BTreeSet<String>,
    /// Trading context the agent was spawned with.
    pub context: TradingContext,
    /// Agents whose mailboxes receive this agent's result.
    pub share_results_with: Vec<String>,
    /// Mirrored session status, maintained from observed events.
    pub status: SessionStatus,
    /// Parsed result; set on any terminal transition.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<SubAgentResult>,
    /// When the agent was spawned.
    pub created_at: DateTime<Utc>,
}

/// Options accepted by `SubAgentSpawner::spawn`.
#[derive(Clone, Debug, Default)]
pub struct SubAgentOptions {
    /// Agent type; selects the instruction template.
    pub agent_type: AgentType,
    /// Trading context rendered into the instructions.
    pub trading_context: TradingContext,
    /// Agent IDs whose mailboxes receive this agent's result.
    pub share_results_with: Vec<String>,
    /// Tags for grouping and lookup.
    pub tags: Vec<String>,
    /// Options forwarded to the session spawner.
    pub session: SpawnOptions,
}

/// One strategy in a `spawn_strategies` fan-out.
#[derive(Clone, Debug)]
pub struct StrategySpawn {
    /// Strategy name.
    pub strategy: String,
    /// Symbols the strategy trades.
    pub symbols: Vec<String>,
    /// Chart timeframe.
    pub timeframe: Option<String>,
    /// Task override; a default is built from the strategy name when unset.
    pub task: Option<String>,
    /// Extra tags beyond the strategy name.
    pub tags: Vec<String>,
}

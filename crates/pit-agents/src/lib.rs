//! Typed trading sub-agents.
//!
//! A [`SubAgentSpawner`] layers agent typing, instruction templates,
//! tagging, metric parsing and result aggregation on top of the session
//! spawner. It observes `session.*` events from the shared bus and never
//! mutates session state directly.

#![deny(unsafe_code)]

pub mod metrics;
pub mod prompts;
pub mod spawner;
pub mod types;

pub use metrics::{MetricParser, RegexMetricParser};
pub use spawner::{AgentFilter, AgentsStatus, SubAgentSpawner};
pub use types::{
    AgentMetrics, AgentType, DateRange, ResultStatus, StrategySpawn, SubAgentEntry,
    SubAgentOptions, SubAgentResult, TradingContext,
};

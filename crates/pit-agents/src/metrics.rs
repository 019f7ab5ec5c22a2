//! Best-effort metric extraction from agent output.

use std::sync::LazyLock;

use regex::Regex;

use crate::types::AgentMetrics;

static PROFIT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(?:profit|pnl)[^\d+-]*([+-]?\d[\d,]*(?:\.\d+)?)").unwrap()
});

static WIN_RATE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)win\s*rate[^\d]*(\d+(?:\.\d+)?)").unwrap()
});

static TRADES_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(?:(\d+)\s+trades?\b|trades?[^\d]*(\d+))").unwrap()
});

static SHARPE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)sharpe(?:\s*ratio)?[^\d+-]*([+-]?\d+(?:\.\d+)?)").unwrap()
});

/// Extracts [`AgentMetrics`] from raw output. Implementations must never
/// fail; unrecognizable output yields empty metrics.
pub trait MetricParser: Send + Sync {
    /// Extract whatever labeled metrics the output contains.
    fn parse(&self, raw: &str) -> AgentMetrics;
}

/// Default parser: labeled-number extraction with case-insensitive
/// regexes. Thousands separators in profit values are tolerated.
#[derive(Clone, Copy, Debug, Default)]
pub struct RegexMetricParser;

impl MetricParser for RegexMetricParser {
    fn parse(&self, raw: &str) -> AgentMetrics {
        let profit = PROFIT_RE
            .captures(raw)
            .and_then(|c| c.get(1))
            .and_then(|m| m.as_str().replace(',', "").parse().ok());
        let win_rate = WIN_RATE_RE
            .captures(raw)
            .and_then(|c| c.get(1))
            .and_then(|m| m.as_str().parse().ok());
        let trades = TRADES_RE
            .captures(raw)
            .and_then(|c| c.get(1).or_else(|| c.get(2)))
            .and_then(|m| m.as_str().parse().ok());
        let sharpe_ratio = SHARPE_RE
            .captures(raw)
            .and_then(|c| c.get(1))
            .and_then(|m| m.as_str().parse().ok());
        AgentMetrics {
            profit,
            win_rate,
            trades,
            sharpe_ratio,
        }
    }
}

//! Instruction templates per agent type.
//!
//! Each type carries a fixed template naming the output shape the parent
//! expects back. The rendered task is: template, then the trading-context
//! block, then the caller's task text enriched with any context fields it
//! does not already mention.

use crate::types::{AgentType, TradingContext};

/// Fixed instruction template for an agent type.
pub fn instruction_template(agent_type: AgentType) -> &'static str {
    match agent_type {
        AgentType::Strategy => {
            "You are a trading strategy execution agent. Execute the strategy \
             described below against the given symbols. Report every trade you \
             take (entry, exit, size) and finish with a PnL summary including \
             total profit and win rate."
        }
        AgentType::Analysis => {
            "You are a market analysis agent. Analyze current market conditions \
             for the given symbols and timeframe. Report the prevailing trend, \
             key support and resistance levels, and notable volume or \
             volatility signals."
        }
        AgentType::Backtest => {
            "You are a backtesting agent. Backtest the strategy described below \
             over the given date range. Report performance metrics: total \
             profit, win rate, number of trades, maximum drawdown and Sharpe \
             ratio."
        }
        AgentType::Research => {
            "You are a research agent. Research the topic described below. \
             Report your findings as a concise list with a source for each \
             finding."
        }
        AgentType::Monitor => {
            "You are a monitoring agent. Watch the given symbols or positions. \
             Report current status and any notable events (price alerts, \
             threshold crossings, unusual activity) as they occur."
        }
        AgentType::Aggregator => {
            "You are an aggregation agent. Combine the results provided to you \
             from other agents into one consolidated report, reconciling any \
             conflicting numbers and noting disagreements."
        }
        AgentType::Generic => "Complete the task described below.",
    }
}

/// Render the trading-context block, one line per populated field.
/// Returns an empty string for an empty context.
pub fn render_context_block(context: &TradingContext) -> String {
    let mut lines = Vec::new();
    if !context.symbols.is_empty() {
        lines.push(format!("Symbols: {}", context.symbols.join(", ")));
    }
    if let Some(timeframe) = &context.timeframe {
        lines.push(format!("Timeframe: {timeframe}"));
    }
    if let Some(strategy) = &context.strategy {
        lines.push(format!("Strategy: {strategy}"));
    }
    if let Some(risk) = &context.risk_params {
        lines.push(format!("Risk parameters: {risk}"));
    }
    if let Some(range) = &context.date_range {
        lines.push(format!("Date range: {} to {}", range.start, range.end));
    }
    if lines.is_empty() {
        String::new()
    } else {
        format!("Trading context:\n{}", lines.join("\n"))
    }
}

/// Append context fields the task text does not already mention.
/// Matching is a case-insensitive substring check.
pub fn enrich_task(task: &str, context: &TradingContext) -> String {
    let lower = task.to_lowercase();
    let mut additions = Vec::new();

    let missing_symbols: Vec<&str> = context
        .symbols
        .iter()
        .filter(|symbol| !lower.contains(&symbol.to_lowercase()))
        .map(String::as_str)
        .collect();
    if !missing_symbols.is_empty() {
        additions.push(format!("for {}", missing_symbols.join(", ")));
    }
    if let Some(timeframe) = &context.timeframe {
        if !lower.contains(&timeframe.to_lowercase()) {
            additions.push(format!("on the {timeframe} timeframe"));
        }
    }
    if let Some(strategy) = &context.strategy {
        if !lower.contains(&strategy.to_lowercase()) {
            additions.push(format!("using the {strategy} strategy"));
        }
    }

    if additions.is_empty() {
        task.to_owned()
    } else {
        format!("{task} ({})", additions.join(", "))
    }
}

/// Full task text handed to the session spawner.
pub fn build_task(task: &str, agent_type: AgentType, context: &TradingContext) -> String {
    let template = instruction_template(agent_type);
    let block = render_context_block(context);
    let enriched = enrich_task(task, context);
    if block.is_empty() {
        format!("{template}\n\n{enriched}")
    } else {
        format!("{template}\n\n{block}\n\n{enriched}")
    }
}

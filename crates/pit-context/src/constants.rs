//! Compaction constants.

/// Approximate characters per token used by the estimation heuristic.
pub const CHARS_PER_TOKEN: usize = 4;

/// Context window used when a model does not match the static table.
pub const DEFAULT_CONTEXT_WINDOW: u64 = 128_000;

/// Default usage ratio at which compaction fires.
pub const DEFAULT_THRESHOLD: f64 = 0.75;

/// Default number of recent messages preserved verbatim.
pub const DEFAULT_KEEP_RECENT: usize = 10;

/// Truncation limit for each message serialized into the summary prompt.
pub const SUMMARY_PROMPT_MESSAGE_LIMIT: usize = 500;

/// Static context-window table, matched by substring in order.
///
/// More specific model IDs come before their prefixes.
pub const CONTEXT_WINDOWS: &[(&str, u64)] = &[
    ("gpt-4o-mini", 128_000),
    ("gpt-4o", 128_000),
    ("gpt-4-turbo", 128_000),
    ("gpt-4", 8_192),
    ("gpt-3.5-turbo", 16_385),
    ("o1-mini", 128_000),
    ("o1", 200_000),
    ("claude-3-5", 200_000),
    ("claude", 200_000),
    ("gemini-1.5-pro", 2_097_152),
    ("gemini-1.5-flash", 1_048_576),
    ("gemini", 1_048_576),
];

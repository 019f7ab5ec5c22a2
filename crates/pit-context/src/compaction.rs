//! Compaction service.
//!
//! ## Algorithm
//!
//! 1. Estimate history tokens at ~4 chars/token and compare against the
//!    model's context window.
//! 2. When the usage ratio crosses the threshold, split messages into
//!    `to_compact` (all but the last `keep_recent`) and `to_keep`.
//! 3. Render `to_compact` into a fixed prompt (each message truncated to
//!    500 chars) and call the injected summarizer.
//! 4. Replace `to_compact` with one synthetic system message labeled with
//!    the incremented compaction counter.
//!
//! Undersized or under-threshold input is a no-op, never an error.

use std::sync::atomic::{AtomicU32, Ordering};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use pit_core::messages::Message;
use pit_core::text::truncate_str;

use crate::constants::{
    CHARS_PER_TOKEN, CONTEXT_WINDOWS, DEFAULT_CONTEXT_WINDOW, DEFAULT_KEEP_RECENT,
    DEFAULT_THRESHOLD, SUMMARY_PROMPT_MESSAGE_LIMIT,
};
use crate::errors::CompactionError;
use crate::summarizer::Summarizer;

// ─────────────────────────────────────────────────────────────────────────────
// Configuration and result types
// ─────────────────────────────────────────────────────────────────────────────

/// Compaction configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompactionConfig {
    /// Whether compaction is enabled at all.
    pub enabled: bool,
    /// Usage ratio (0–1) at which compaction fires.
    pub threshold: f64,
    /// Number of recent messages always preserved verbatim.
    pub keep_recent: usize,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold: DEFAULT_THRESHOLD,
            keep_recent: DEFAULT_KEEP_RECENT,
        }
    }
}

/// Outcome of one compaction pass.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompactionResult {
    /// Summary text produced by the summarizer (empty on no-op).
    pub summary: String,
    /// Number of messages replaced by the summary.
    pub messages_compacted: usize,
    /// Estimated tokens removed from the history.
    pub tokens_recovered: u64,
    /// Value of the per-service compaction counter after this pass.
    pub compaction_count: u32,
}

/// Compacted history plus the pass report.
#[derive(Clone, Debug)]
pub struct CompactionOutcome {
    /// New message list: `[summary, ...kept]`, or the input unchanged on no-op.
    pub messages: Vec<Message>,
    /// Pass report.
    pub result: CompactionResult,
}

// ─────────────────────────────────────────────────────────────────────────────
// CompactionService
// ─────────────────────────────────────────────────────────────────────────────

/// Keeps conversation histories within a model's token budget.
///
/// The compaction counter persists for the lifetime of the service
/// instance and labels each synthetic summary message.
pub struct CompactionService {
    config: CompactionConfig,
    compaction_count: AtomicU32,
}

impl CompactionService {
    /// Create a service with the given configuration.
    pub fn new(config: CompactionConfig) -> Self {
        Self {
            config,
            compaction_count: AtomicU32::new(0),
        }
    }

    /// Estimate history tokens: Σ ceil(content/4) + Σ ceil(tool results/4).
    pub fn estimate_tokens(messages: &[Message]) -> u64 {
        messages
            .iter()
            .map(|m| {
                let mut chars = m.content.len();
                if let Some(results) = &m.tool_results {
                    for r in results {
                        chars += serde_json::to_string(r).map_or(0, |s| s.len());
                    }
                }
                chars.div_ceil(CHARS_PER_TOKEN) as u64
            })
            .sum()
    }

    /// Context window for a model via substring lookup; 128K when unmatched.
    pub fn context_window(model: &str) -> u64 {
        CONTEXT_WINDOWS
            .iter()
            .find(|(key, _)| model.contains(key))
            .map_or(DEFAULT_CONTEXT_WINDOW, |(_, window)| *window)
    }

    /// Whether the history has crossed the compaction threshold.
    pub fn needs_compaction(&self, messages: &[Message], model: &str) -> bool {
        if !self.config.enabled {
            return false;
        }
        let window = Self::context_window(model);
        #[allow(clippy::cast_precision_loss)]
        let ratio = Self::estimate_tokens(messages) as f64 / window as f64;
        ratio >= self.config.threshold
    }

    /// Compact unconditionally (threshold is not consulted).
    ///
    /// No-op when the history has at most `keep_recent` messages.
    pub async fn compact(
        &self,
        messages: &[Message],
        model: &str,
        summarizer: &dyn Summarizer,
    ) -> Result<CompactionOutcome, CompactionError> {
        if messages.len() <= self.config.keep_recent {
            debug!(
                total_messages = messages.len(),
                keep_recent = self.config.keep_recent,
                "compaction skipped: history within preserve window"
            );
            return Ok(CompactionOutcome {
                messages: messages.to_vec(),
                result: CompactionResult {
                    summary: String::new(),
                    messages_compacted: 0,
                    tokens_recovered: 0,
                    compaction_count: self.compaction_count.load(Ordering::SeqCst),
                },
            });
        }

        let split_at = messages.len() - self.config.keep_recent;
        let (to_compact, to_keep) = messages.split_at(split_at);

        let prompt = render_summary_prompt(to_compact);
        let summary = summarizer.summarize(&prompt).await?;

        let count = self.compaction_count.fetch_add(1, Ordering::SeqCst) + 1;
        let summary_message = Message::system(format!(
            "[Conversation summary #{count}] Earlier history ({} messages) was \
             compacted. Summary:\n\n{summary}",
            to_compact.len()
        ));

        let mut new_messages = Vec::with_capacity(1 + to_keep.len());
        new_messages.push(summary_message);
        new_messages.extend_from_slice(to_keep);

        let tokens_before = Self::estimate_tokens(messages);
        let tokens_after = Self::estimate_tokens(&new_messages);
        let tokens_recovered = tokens_before.saturating_sub(tokens_after);

        info!(
            model,
            messages_compacted = to_compact.len(),
            tokens_recovered,
            compaction_count = count,
            "history compacted"
        );

        Ok(CompactionOutcome {
            messages: new_messages,
            result: CompactionResult {
                summary,
                messages_compacted: to_compact.len(),
                tokens_recovered,
                compaction_count: count,
            },
        })
    }

    /// Compact only if [`Self::needs_compaction`] holds.
    ///
    /// Returns `Some` outcome when compaction ran, `None` otherwise.
    pub async fn auto_compact(
        &self,
        messages: &[Message],
        model: &str,
        summarizer: &dyn Summarizer,
    ) -> Result<Option<CompactionOutcome>, CompactionError> {
        if !self.needs_compaction(messages, model) {
            return Ok(None);
        }
        self.compact(messages, model, summarizer).await.map(Some)
    }

    /// Current value of the compaction counter.
    pub fn compaction_count(&self) -> u32 {
        self.compaction_count.load(Ordering::SeqCst)
    }

    /// Reset the compaction counter to zero.
    pub fn reset_compaction_count(&self) {
        self.compaction_count.store(0, Ordering::SeqCst);
    }
}

/// Render the fixed summarization prompt for the messages being replaced.
fn render_summary_prompt(to_compact: &[Message]) -> String {
    let mut prompt = String::from(
        "Summarize this conversation history for a trading agent. Preserve \
         decisions, open positions, symbols, numeric results, and unresolved \
         questions. Be concise.\n\n",
    );
    for msg in to_compact {
        let role = match msg.role {
            pit_core::messages::MessageRole::User => "user",
            pit_core::messages::MessageRole::Assistant => "assistant",
            pit_core::messages::MessageRole::System => "system",
            pit_core::messages::MessageRole::Tool => "tool",
        };
        prompt.push_str(role);
        prompt.push_str(": ");
        prompt.push_str(truncate_str(&msg.content, SUMMARY_PROMPT_MESSAGE_LIMIT));
        prompt.push('\n');
    }
    prompt
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex;

    struct MockSummarizer {
        reply: String,
        prompts: Mutex<Vec<String>>,
    }

    impl MockSummarizer {
        fn new(reply: &str) -> Self {
            Self {
                reply: reply.into(),
                prompts: Mutex::new(vec![]),
            }
        }
    }

    #[async_trait]
    impl Summarizer for MockSummarizer {
        async fn summarize(&self, prompt: &str) -> Result<String, CompactionError> {
            self.prompts.lock().unwrap().push(prompt.to_owned());
            Ok(self.reply.clone())
        }
    }

    struct FailingSummarizer;

    #[async_trait]
    impl Summarizer for FailingSummarizer {
        async fn summarize(&self, _prompt: &str) -> Result<String, CompactionError> {
            Err(CompactionError::Summarizer("unavailable".into()))
        }
    }

    fn history(n: usize) -> Vec<Message> {
        (0..n)
            .map(|i| {
                if i % 2 == 0 {
                    Message::user(format!("message {i}"))
                } else {
                    Message::assistant(format!("reply {i}"))
                }
            })
            .collect()
    }

    fn small_service(keep_recent: usize) -> CompactionService {
        CompactionService::new(CompactionConfig {
            keep_recent,
            ..CompactionConfig::default()
        })
    }

    // -- estimate_tokens --

    #[test]
    fn estimate_counts_content_chars() {
        let msgs = vec![Message::user("abcdefgh")]; // 8 chars → 2 tokens
        assert_eq!(CompactionService::estimate_tokens(&msgs), 2);
    }

    #[test]
    fn estimate_rounds_up() {
        let msgs = vec![Message::user("abcde")]; // 5 chars → ceil(5/4) = 2
        assert_eq!(CompactionService::estimate_tokens(&msgs), 2);
    }

    #[test]
    fn estimate_includes_tool_results() {
        let plain = vec![Message::user("abcd")];
        let with_tool = vec![Message::tool("abcd", vec![json!({"k": "v"})])];
        assert!(
            CompactionService::estimate_tokens(&with_tool)
                > CompactionService::estimate_tokens(&plain)
        );
    }

    #[test]
    fn estimate_empty_is_zero() {
        assert_eq!(CompactionService::estimate_tokens(&[]), 0);
    }

    // -- context_window --

    #[test]
    fn context_window_substring_match() {
        assert_eq!(CompactionService::context_window("gpt-4o-2024-08-06"), 128_000);
        assert_eq!(CompactionService::context_window("gpt-3.5-turbo-0125"), 16_385);
        assert_eq!(
            CompactionService::context_window("claude-3-5-sonnet-latest"),
            200_000
        );
    }

    #[test]
    fn context_window_specific_before_prefix() {
        // "gpt-4o-mini" must not fall through to the bare "gpt-4" entry
        assert_eq!(CompactionService::context_window("gpt-4o-mini"), 128_000);
        assert_eq!(CompactionService::context_window("gpt-4-0613"), 8_192);
    }

    #[test]
    fn context_window_default_for_unknown() {
        assert_eq!(CompactionService::context_window("mystery-model"), 128_000);
    }

    // -- needs_compaction --

    #[test]
    fn needs_compaction_below_threshold() {
        let svc = CompactionService::new(CompactionConfig::default());
        assert!(!svc.needs_compaction(&history(4), "gpt-4o"));
    }

    #[test]
    fn needs_compaction_at_threshold() {
        let svc = CompactionService::new(CompactionConfig::default());
        // gpt-3.5-turbo window 16385; threshold 0.75 → ~12289 tokens.
        // One message of 16385 * 3 chars ≈ 12289 tokens crosses it.
        let big = vec![Message::user("x".repeat(16_385 * 3))];
        assert!(svc.needs_compaction(&big, "gpt-3.5-turbo"));
    }

    #[test]
    fn needs_compaction_disabled() {
        let svc = CompactionService::new(CompactionConfig {
            enabled: false,
            ..CompactionConfig::default()
        });
        let big = vec![Message::user("x".repeat(1_000_000))];
        assert!(!svc.needs_compaction(&big, "gpt-3.5-turbo"));
    }

    // -- compact --

    #[tokio::test]
    async fn compact_noop_when_within_keep_recent() {
        let svc = small_service(10);
        let msgs = history(6);
        let summarizer = MockSummarizer::new("unused");

        let outcome = svc.compact(&msgs, "gpt-4o", &summarizer).await.unwrap();

        assert_eq!(outcome.messages, msgs);
        assert_eq!(outcome.result.messages_compacted, 0);
        assert!(outcome.result.summary.is_empty());
        assert!(summarizer.prompts.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn compact_preserves_last_keep_recent_verbatim() {
        let svc = small_service(2);
        let msgs = history(6);
        let summarizer = MockSummarizer::new("the gist");

        let outcome = svc.compact(&msgs, "gpt-4o", &summarizer).await.unwrap();

        // [summary, last two originals]
        assert_eq!(outcome.messages.len(), 3);
        assert!(outcome.messages[0].is_system());
        assert_eq!(outcome.messages[1], msgs[4]);
        assert_eq!(outcome.messages[2], msgs[5]);
        assert_eq!(outcome.result.messages_compacted, 4);
    }

    #[tokio::test]
    async fn compact_summary_message_carries_counter_and_text() {
        let svc = small_service(1);
        let summarizer = MockSummarizer::new("bought AAPL, flat on MSFT");

        let outcome = svc
            .compact(&history(4), "gpt-4o", &summarizer)
            .await
            .unwrap();

        let synthetic = &outcome.messages[0];
        assert!(synthetic.content.contains("[Conversation summary #1]"));
        assert!(synthetic.content.contains("bought AAPL, flat on MSFT"));
        assert_eq!(outcome.result.compaction_count, 1);
    }

    #[tokio::test]
    async fn compact_counter_increments_across_passes() {
        let svc = small_service(1);
        let summarizer = MockSummarizer::new("s");

        let first = svc.compact(&history(4), "gpt-4o", &summarizer).await.unwrap();
        let second = svc
            .compact(&history(4), "gpt-4o", &summarizer)
            .await
            .unwrap();

        assert_eq!(first.result.compaction_count, 1);
        assert_eq!(second.result.compaction_count, 2);
        assert_eq!(svc.compaction_count(), 2);

        svc.reset_compaction_count();
        assert_eq!(svc.compaction_count(), 0);
    }

    #[tokio::test]
    async fn compact_prompt_truncates_long_messages() {
        let svc = small_service(1);
        let summarizer = MockSummarizer::new("s");
        let msgs = vec![
            Message::user("y".repeat(2_000)),
            Message::assistant("short"),
        ];

        let _ = svc.compact(&msgs, "gpt-4o", &summarizer).await.unwrap();

        let prompts = summarizer.prompts.lock().unwrap();
        // 2000-char message clipped to 500 within the prompt
        assert!(prompts[0].contains(&"y".repeat(500)));
        assert!(!prompts[0].contains(&"y".repeat(501)));
    }

    #[tokio::test]
    async fn compact_reports_tokens_recovered() {
        let svc = small_service(1);
        let summarizer = MockSummarizer::new("tiny");
        let msgs = vec![
            Message::user("a".repeat(4_000)),
            Message::assistant("b".repeat(4_000)),
            Message::user("keep me"),
        ];

        let outcome = svc.compact(&msgs, "gpt-4o", &summarizer).await.unwrap();
        assert!(outcome.result.tokens_recovered > 0);
    }

    #[tokio::test]
    async fn compact_propagates_summarizer_error() {
        let svc = small_service(1);
        let result = svc.compact(&history(4), "gpt-4o", &FailingSummarizer).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn failed_pass_does_not_advance_counter() {
        let svc = small_service(1);
        let _ = svc.compact(&history(4), "gpt-4o", &FailingSummarizer).await;
        assert_eq!(svc.compaction_count(), 0);
    }

    // -- auto_compact --

    #[tokio::test]
    async fn auto_compact_skips_below_threshold() {
        let svc = CompactionService::new(CompactionConfig::default());
        let summarizer = MockSummarizer::new("unused");

        let outcome = svc
            .auto_compact(&history(6), "gpt-4o", &summarizer)
            .await
            .unwrap();

        assert!(outcome.is_none());
        assert!(summarizer.prompts.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn auto_compact_runs_above_threshold() {
        let svc = small_service(1);
        let summarizer = MockSummarizer::new("s");
        // Big history against the small gpt-3.5 window
        let msgs = vec![
            Message::user("x".repeat(30_000)),
            Message::user("x".repeat(30_000)),
            Message::user("recent"),
        ];

        let outcome = svc
            .auto_compact(&msgs, "gpt-3.5-turbo", &summarizer)
            .await
            .unwrap();

        let outcome = outcome.expect("compaction should have occurred");
        assert_eq!(outcome.result.messages_compacted, 2);
    }
}

//! Summarizer seam.
//!
//! The only seam to an actual language model in this crate: a single-shot
//! prompt-in, text-out call. The host supplies the implementation.

use async_trait::async_trait;

use crate::errors::CompactionError;

/// Produces a summary for a rendered conversation transcript.
#[async_trait]
pub trait Summarizer: Send + Sync {
    /// Summarize the given prompt. Single-shot, no streaming.
    async fn summarize(&self, prompt: &str) -> Result<String, CompactionError>;
}

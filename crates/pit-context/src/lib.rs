//! # pit-context
//!
//! Context compaction for the Pit runtime. Once a session's conversation
//! history crosses a token-budget threshold, the older portion is replaced
//! with a single synthetic summary message produced by an injected
//! [`Summarizer`]. The most recent messages are always preserved verbatim.

#![deny(unsafe_code)]

pub mod compaction;
pub mod constants;
pub mod errors;
pub mod summarizer;

pub use compaction::{CompactionConfig, CompactionOutcome, CompactionResult, CompactionService};
pub use errors::CompactionError;
pub use summarizer::Summarizer;

//! # pit-core
//!
//! Foundation types and utilities shared across the Pit runtime crates:
//!
//! - **Messages**: the conversation model passed to completion calls and
//!   to the compaction service
//! - **Events**: the `session.*` / `subagent.*` lifecycle event enum and
//!   the broadcast-based [`events::EventBus`]
//! - **Text**: small string helpers (summary truncation)

#![deny(unsafe_code)]

pub mod events;
pub mod messages;
pub mod text;

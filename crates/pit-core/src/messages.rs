//! Conversation message model.
//!
//! Messages form the history handed to completion calls and consumed by
//! the compaction service. Four roles: user, assistant, system, and tool.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Role of a conversation message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    /// Host or end-user input.
    User,
    /// Model output.
    Assistant,
    /// Injected instructions or synthetic context (compaction summaries).
    System,
    /// Tool invocation result.
    Tool,
}

/// One entry in a conversation history.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    /// Message role.
    pub role: MessageRole,
    /// Text content.
    pub content: String,
    /// When the message was produced, if known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    /// Structured tool outputs attached to the message.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_results: Option<Vec<Value>>,
}

impl Message {
    /// Create a user message.
    pub fn user(content: impl Into<String>) -> Self {
        Self::with_role(MessageRole::User, content)
    }

    /// Create an assistant message.
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::with_role(MessageRole::Assistant, content)
    }

    /// Create a system message.
    pub fn system(content: impl Into<String>) -> Self {
        Self::with_role(MessageRole::System, content)
    }

    /// Create a tool message carrying structured results.
    pub fn tool(content: impl Into<String>, results: Vec<Value>) -> Self {
        Self {
            role: MessageRole::Tool,
            content: content.into(),
            timestamp: None,
            tool_results: Some(results),
        }
    }

    fn with_role(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            timestamp: None,
            tool_results: None,
        }
    }

    /// Whether this is a system message.
    pub fn is_system(&self) -> bool {
        self.role == MessageRole::System
    }
}

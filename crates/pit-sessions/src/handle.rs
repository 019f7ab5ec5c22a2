//! Host-supplied execution seam.
//!
//! The spawner never talks to a model provider directly. The host hands it
//! a [`HandleFactory`]; each session gets one [`ExecutionHandle`] whose
//! `start` yields a stream of output events. Stopping a handle is
//! expressed by dropping its stream (the spawner does this on cancel and
//! timeout).

use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures::Stream;
use thiserror::Error;

/// Parameters for creating one session's handle.
#[derive(Clone, Debug)]
pub struct HandleSpec {
    /// Session the handle belongs to.
    pub session_id: String,
    /// Resolved model name.
    pub model: String,
    /// Optional system prompt.
    pub system_prompt: Option<String>,
}

/// Output events produced by a running handle.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HandleEvent {
    /// Incremental output fragment.
    Chunk {
        /// Appended text.
        delta: String,
    },
    /// Terminal event. When `output` is set it replaces the accumulated
    /// chunk text; otherwise the accumulation stands.
    Completed {
        /// Full final output, when the handle produces one.
        output: Option<String>,
    },
}

/// Failures surfaced by handles and their factories.
#[derive(Debug, Error)]
pub enum HandleError {
    /// The handle could not be created or started.
    #[error("handle start failed: {0}")]
    Start(String),
    /// The handle's event stream failed mid-run.
    #[error("handle stream failed: {0}")]
    Stream(String),
}

/// Boxed event stream returned by [`ExecutionHandle::start`].
pub type HandleStream = Pin<Box<dyn Stream<Item = Result<HandleEvent, HandleError>> + Send>>;

/// One session's connection to the host's executor.
#[async_trait]
pub trait ExecutionHandle: Send + Sync {
    /// Begin execution, yielding output events until completion.
    async fn start(&self) -> Result<HandleStream, HandleError>;

    /// Forward a follow-up message into the running execution.
    async fn send(&self, message: &str) -> Result<(), HandleError>;
}

/// Creates handles for new sessions.
#[async_trait]
pub trait HandleFactory: Send + Sync {
    /// Create the handle for one session.
    async fn create(&self, spec: HandleSpec) -> Result<Arc<dyn ExecutionHandle>, HandleError>;
}

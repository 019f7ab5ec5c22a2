//! Bounded-concurrency session executor.
//!
//! A [`SessionSpawner`] runs background sessions against a host-supplied
//! [`HandleFactory`], capping the number of concurrently running sessions
//! and queueing overflow FIFO. Lifecycle transitions are broadcast as
//! `session.*` events on a shared `EventBus`.

#![deny(unsafe_code)]

pub mod errors;
pub mod handle;
pub mod spawner;
pub mod types;

pub use errors::SpawnError;
pub use handle::{ExecutionHandle, HandleError, HandleEvent, HandleFactory, HandleSpec, HandleStream};
pub use spawner::SessionSpawner;
pub use types::{Session, SessionFilter, SessionStatus, SpawnOptions, SpawnerConfig, SpawnerStatus};

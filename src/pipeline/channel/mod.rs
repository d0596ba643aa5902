//! Token registry bridging orchestrator runs to subscribers.
//!
//! A caller issues a token for a set of intake files, then either subscribes
//! to the run's event stream or starts it detached. Tokens evict themselves
//! when their run ends or, if never started, when they outlive the TTL.

pub mod registry;
pub mod stream;
pub mod sweeper;

pub use registry::{ProgressChannel, RunToken};
pub use stream::EventStream;
pub use sweeper::SweeperHandle;

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChannelError {
    #[error("Unknown or expired token: {0}")]
    InvalidToken(String),

    #[error("Run already started for token: {0}")]
    AlreadyStarted(String),
}

//! Session supervision
//!
//! The [`ReconnectSupervisor`] owns the whole session lifecycle: it connects to
//! the signaling server, starts the pipeline, runs negotiation and tears
//! everything down and starts over whenever any part fails.

mod error;
mod reconnect;

use std::fmt;

pub use error::{SessionError, SupervisorError};
pub use reconnect::ReconnectSupervisor;

/// Lifecycle state of the supervised session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Active,
    Reconnecting,
    /// Configuration is unusable; nothing will be retried
    Fatal,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Active => "active",
            Self::Reconnecting => "reconnecting",
            Self::Fatal => "fatal",
        })
    }
}

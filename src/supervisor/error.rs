//! Supervisor error types

use thiserror::Error;

use crate::negotiation::NegotiationError;
use crate::pipeline::{ConnectivityState, PipelineError};
use crate::signaling::TransportError;

/// Why a session epoch ended. Every variant leads to a reconnect.
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Signaling transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Pipeline error: {0}")]
    Pipeline(#[from] PipelineError),

    #[error("Negotiation error: {0}")]
    Negotiation(#[from] NegotiationError),

    #[error("Signaling connection closed")]
    SignalingClosed,

    #[error("Peer connectivity lost ({0})")]
    ConnectivityLost(ConnectivityState),
}

/// Errors that stop the supervisor for good
#[derive(Error, Debug)]
pub enum SupervisorError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Gave up after {0} failed connection attempts")]
    AttemptsExhausted(u32),
}

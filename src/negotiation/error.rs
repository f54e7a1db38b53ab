//! Negotiation error types

use thiserror::Error;

use crate::pipeline::PipelineError;
use crate::signaling::{IceCandidateRecord, TransportError};

/// Errors that end the current negotiation
#[derive(Error, Debug)]
pub enum NegotiationError {
    #[error("Signaling error: {0}")]
    Transport(#[from] TransportError),

    #[error("Malformed SDP: {0}")]
    MalformedSdp(String),

    #[error("Failed to create local offer: {0}")]
    LocalOffer(#[source] PipelineError),

    #[error("Failed to apply remote description: {0}")]
    RemoteDescription(#[source] PipelineError),

    #[error("ICE candidate {} rejected: {source}", candidate.candidate)]
    CandidateRejected {
        candidate: IceCandidateRecord,
        #[source]
        source: PipelineError,
    },

    #[error("Media session is gone")]
    SessionGone,
}

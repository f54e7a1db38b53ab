//! Offer/answer state machine

use std::fmt;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::pipeline::{Completion, PipelineError, SessionCommand};
use crate::signaling::{IceCandidateRecord, SignalingMessage, SignalingSender};

use super::buffer::IceCandidateBuffer;
use super::error::NegotiationError;

/// Progress of the offer/answer exchange within one epoch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    NoOffer,
    OfferSent,
    /// Answer received, remote description being applied
    RemoteDescriptionPending,
    RemoteDescriptionSet,
}

impl fmt::Display for NegotiationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::NoOffer => "no-offer",
            Self::OfferSent => "offer-sent",
            Self::RemoteDescriptionPending => "remote-description-pending",
            Self::RemoteDescriptionSet => "remote-description-set",
        })
    }
}

/// Drives offer/answer and candidate exchange for one epoch.
///
/// Owned by the coordinating loop. Media operations are queued to the session
/// worker; their results come back through [`NegotiationEngine::on_completion`].
pub struct NegotiationEngine {
    epoch: u64,
    state: NegotiationState,
    offer_in_flight: bool,
    signaling: SignalingSender,
    commands: mpsc::UnboundedSender<SessionCommand>,
    remote_candidates: IceCandidateBuffer,
    held_local: Vec<IceCandidateRecord>,
}

impl NegotiationEngine {
    pub fn new(
        epoch: u64,
        signaling: SignalingSender,
        commands: mpsc::UnboundedSender<SessionCommand>,
    ) -> Self {
        Self {
            epoch,
            state: NegotiationState::NoOffer,
            offer_in_flight: false,
            signaling,
            commands,
            remote_candidates: IceCandidateBuffer::new(),
            held_local: Vec::new(),
        }
    }

    pub fn state(&self) -> NegotiationState {
        self.state
    }

    /// Remote candidates waiting for the remote description
    pub fn buffered_candidates(&self) -> usize {
        self.remote_candidates.len()
    }

    fn submit(&self, command: SessionCommand) -> Result<(), NegotiationError> {
        self.commands
            .send(command)
            .map_err(|_| NegotiationError::SessionGone)
    }

    /// The pipeline asks for a local offer
    pub fn on_negotiation_needed(&mut self) -> Result<(), NegotiationError> {
        if self.offer_in_flight {
            debug!(epoch = self.epoch, "Offer creation already in progress, ignoring");
            return Ok(());
        }
        if self.state != NegotiationState::NoOffer {
            debug!(
                epoch = self.epoch,
                state = %self.state,
                "Offer already made this session, ignoring renegotiation"
            );
            return Ok(());
        }

        self.offer_in_flight = true;
        self.submit(SessionCommand::CreateOffer)
    }

    /// The local offer was created and applied as the local description
    pub fn on_local_offer(
        &mut self,
        result: Result<String, PipelineError>,
    ) -> Result<(), NegotiationError> {
        self.offer_in_flight = false;
        let sdp = result.map_err(NegotiationError::LocalOffer)?;

        debug!(epoch = self.epoch, "Local offer:\n{}", sdp);
        self.signaling.send(SignalingMessage::Offer { sdp })?;
        self.state = NegotiationState::OfferSent;
        info!(epoch = self.epoch, "Offer sent");

        for candidate in std::mem::take(&mut self.held_local) {
            self.send_local_candidate(candidate)?;
        }
        Ok(())
    }

    /// The viewer answered our offer
    pub fn on_answer(&mut self, sdp: String) -> Result<(), NegotiationError> {
        match self.state {
            NegotiationState::OfferSent => {}
            NegotiationState::NoOffer => {
                warn!(
                    epoch = self.epoch,
                    state = %self.state,
                    message_type = "answer",
                    "Answer received without an outstanding offer, ignoring"
                );
                return Ok(());
            }
            NegotiationState::RemoteDescriptionPending | NegotiationState::RemoteDescriptionSet => {
                warn!(
                    epoch = self.epoch,
                    state = %self.state,
                    message_type = "answer",
                    "Duplicate answer, ignoring"
                );
                return Ok(());
            }
        }

        validate_sdp(&sdp)?;
        debug!(epoch = self.epoch, "Remote answer:\n{}", sdp);

        self.state = NegotiationState::RemoteDescriptionPending;
        self.submit(SessionCommand::SetRemoteAnswer(sdp))
    }

    /// The remote description finished applying
    pub fn on_remote_description_applied(
        &mut self,
        result: Result<(), PipelineError>,
    ) -> Result<(), NegotiationError> {
        if self.state != NegotiationState::RemoteDescriptionPending {
            warn!(
                epoch = self.epoch,
                state = %self.state,
                "Unexpected remote description completion, ignoring"
            );
            return Ok(());
        }
        result.map_err(NegotiationError::RemoteDescription)?;

        self.state = NegotiationState::RemoteDescriptionSet;
        info!(epoch = self.epoch, "Remote description set");

        let commands = &self.commands;
        let flushed = self.remote_candidates.flush(|candidate| {
            commands
                .send(SessionCommand::AddIceCandidate(candidate))
                .map_err(|_| NegotiationError::SessionGone)
        })?;
        if flushed > 0 {
            debug!(epoch = self.epoch, "Applying {} buffered candidates", flushed);
        }
        Ok(())
    }

    /// A candidate from the viewer
    pub fn on_remote_candidate(
        &mut self,
        candidate: IceCandidateRecord,
    ) -> Result<(), NegotiationError> {
        if self.state == NegotiationState::RemoteDescriptionSet {
            self.submit(SessionCommand::AddIceCandidate(candidate))
        } else {
            debug!(
                epoch = self.epoch,
                state = %self.state,
                "Buffering remote candidate"
            );
            self.remote_candidates.enqueue(candidate);
            Ok(())
        }
    }

    /// A candidate gathered by the local pipeline
    pub fn on_local_candidate(
        &mut self,
        candidate: IceCandidateRecord,
    ) -> Result<(), NegotiationError> {
        if candidate.is_end_of_candidates() {
            debug!(epoch = self.epoch, "Local gathering finished");
            return Ok(());
        }
        if self.state == NegotiationState::NoOffer {
            self.held_local.push(candidate);
            return Ok(());
        }
        self.send_local_candidate(candidate)
    }

    fn send_local_candidate(&self, candidate: IceCandidateRecord) -> Result<(), NegotiationError> {
        debug!(epoch = self.epoch, "Sending local candidate {}", candidate.candidate);
        self.signaling
            .send(SignalingMessage::IceCandidate { candidate })?;
        Ok(())
    }

    /// A remote candidate was handed to the media session
    pub fn on_candidate_applied(
        &mut self,
        candidate: IceCandidateRecord,
        result: Result<(), PipelineError>,
    ) -> Result<(), NegotiationError> {
        result.map_err(|source| NegotiationError::CandidateRejected { candidate, source })
    }

    /// Dispatch a worker completion
    pub fn on_completion(&mut self, completion: Completion) -> Result<(), NegotiationError> {
        match completion {
            Completion::LocalOffer(result) => self.on_local_offer(result),
            Completion::RemoteAnswer(result) => self.on_remote_description_applied(result),
            Completion::CandidateApplied { candidate, result } => {
                self.on_candidate_applied(candidate, result)
            }
        }
    }
}

/// Minimal structural check before handing an SDP to the engine
fn validate_sdp(sdp: &str) -> Result<(), NegotiationError> {
    let first = sdp.trim_start().lines().next().unwrap_or_default();
    if !first.starts_with("v=") {
        return Err(NegotiationError::MalformedSdp(format!(
            "expected version line, got '{}'",
            first.chars().take(32).collect::<String>()
        )));
    }
    Ok(())
}

//! Pipeline notifications and session commands
//!
//! Media engines call back from their own threads. None of those callbacks may
//! touch session state: [`EventSink`] turns every notification into a
//! [`SessionEvent`] on the coordinating loop's queue.

use tokio::sync::mpsc;
use tracing::{trace, warn};

use crate::signaling::IceCandidateRecord;

use super::error::PipelineError;
use super::router::IncomingStream;
use super::ConnectivityState;

/// Asynchronous message from the pipeline bus
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusMessage {
    Error(String),
    EndOfStream,
    Warning(String),
}

impl BusMessage {
    /// Map the message to the error that ends the session, if any.
    ///
    /// Warnings are logged and never end the session.
    pub fn into_terminal(self) -> Option<PipelineError> {
        match self {
            Self::Error(e) => Some(PipelineError::Bus(e)),
            Self::EndOfStream => Some(PipelineError::EndOfStream),
            Self::Warning(w) => {
                warn!("Pipeline warning: {}", w);
                None
            }
        }
    }
}

/// Notification raised by a running media session
#[derive(Debug)]
pub enum PipelineEvent {
    NegotiationNeeded,
    /// Locally gathered candidate to forward to the viewer
    IceCandidate(IceCandidateRecord),
    StateChanged(ConnectivityState),
    IncomingStream(IncomingStream),
    Bus(BusMessage),
}

/// Operation executed by the session worker, in submission order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionCommand {
    /// Create an offer and apply it as the local description
    CreateOffer,
    SetRemoteAnswer(String),
    AddIceCandidate(IceCandidateRecord),
}

/// Result of a [`SessionCommand`], delivered back to the loop
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion {
    LocalOffer(Result<String, PipelineError>),
    RemoteAnswer(Result<(), PipelineError>),
    CandidateApplied {
        candidate: IceCandidateRecord,
        result: Result<(), PipelineError>,
    },
}

/// Everything the coordinating loop receives besides signaling messages
#[derive(Debug)]
pub enum SessionEvent {
    Pipeline(PipelineEvent),
    Completed(Completion),
}

/// Capability surface a media engine uses to report on a session
pub trait PipelineEvents: Send + Sync {
    fn on_negotiation_needed(&self);

    fn on_ice_candidate(&self, sdp_mline_index: u32, candidate: String);

    fn on_state_changed(&self, state: ConnectivityState);

    fn on_incoming_stream(&self, stream: IncomingStream);

    fn on_bus(&self, message: BusMessage);
}

/// Queue-backed [`PipelineEvents`] for one epoch
#[derive(Debug, Clone)]
pub struct EventSink {
    epoch: u64,
    tx: mpsc::UnboundedSender<SessionEvent>,
}

impl EventSink {
    /// Create a sink and the receiver the coordinating loop drains
    pub fn channel(epoch: u64) -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { epoch, tx }, rx)
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Report a finished session command
    pub fn complete(&self, completion: Completion) {
        self.post(SessionEvent::Completed(completion));
    }

    fn post(&self, event: SessionEvent) {
        if self.tx.send(event).is_err() {
            // The epoch is over; late notifications from the old session are dropped
            trace!("Epoch {} finished, dropping pipeline event", self.epoch);
        }
    }
}

impl PipelineEvents for EventSink {
    fn on_negotiation_needed(&self) {
        self.post(SessionEvent::Pipeline(PipelineEvent::NegotiationNeeded));
    }

    fn on_ice_candidate(&self, sdp_mline_index: u32, candidate: String) {
        self.post(SessionEvent::Pipeline(PipelineEvent::IceCandidate(
            IceCandidateRecord::new(sdp_mline_index, candidate),
        )));
    }

    fn on_state_changed(&self, state: ConnectivityState) {
        self.post(SessionEvent::Pipeline(PipelineEvent::StateChanged(state)));
    }

    fn on_incoming_stream(&self, stream: IncomingStream) {
        self.post(SessionEvent::Pipeline(PipelineEvent::IncomingStream(stream)));
    }

    fn on_bus(&self, message: BusMessage) {
        self.post(SessionEvent::Pipeline(PipelineEvent::Bus(message)));
    }
}

//! SDP offer/answer negotiation
//!
//! The robot always makes the offer. Remote candidates that arrive before the
//! viewer's answer has been applied are held in an [`IceCandidateBuffer`] and
//! replayed in arrival order once the remote description is set.

mod buffer;
mod engine;
mod error;

pub use buffer::IceCandidateBuffer;
pub use engine::{NegotiationEngine, NegotiationState};
pub use error::NegotiationError;

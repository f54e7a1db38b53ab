//! Signaling module
//!
//! Owns the WebSocket connection to the cloud signaling server and the JSON
//! messages exchanged over it (room join, SDP offer/answer, ICE candidates).

mod channel;
mod error;
mod message;
mod tls;

pub use channel::{ConnectOptions, SignalingChannel, SignalingSender, DEFAULT_CONNECT_TIMEOUT};
pub use error::TransportError;
pub use message::{IceCandidateRecord, SignalingMessage, WORKSTATION_ROLE};
pub use tls::TlsOptions;

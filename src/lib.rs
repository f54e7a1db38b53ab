//! robolink - Self-healing WebRTC signaling client for robot camera streaming
//!
//! The robot joins a signaling room named after its identity, offers its
//! media to the viewer that answers, and rebuilds the whole session whenever
//! the signaling connection or the peer connection fails.

pub mod config;
pub mod identity;
pub mod negotiation;
pub mod pipeline;
pub mod signaling;
pub mod supervisor;

pub use config::SupervisorConfig;
pub use identity::{FileIdentityStore, IdentityProvider, SessionIdentity};
pub use pipeline::{MediaEngine, PipelineController, PipelineSpec};
pub use signaling::{SignalingChannel, SignalingMessage};
pub use supervisor::{ConnectionState, ReconnectSupervisor};

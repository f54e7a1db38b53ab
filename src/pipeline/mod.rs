//! Media pipeline module
//!
//! The media engine itself is an external collaborator. This module defines the
//! capability surface the session core relies on: a [`MediaEngine`] that starts
//! a [`MediaSession`] for a [`PipelineSpec`], the events a running session
//! raises, and the [`PipelineController`] that owns the single live session.

mod controller;
mod error;
mod events;
mod router;
#[cfg(feature = "webrtc-engine")]
mod rtc_engine;

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::signaling::IceCandidateRecord;

pub use controller::{PipelineController, PipelineHandle};
pub use error::PipelineError;
pub use events::{
    BusMessage, Completion, EventSink, PipelineEvent, PipelineEvents, SessionCommand, SessionEvent,
};
pub use router::{DrainConsumer, IncomingStream, StreamConsumer, StreamDescriptor, StreamRouter};
#[cfg(feature = "webrtc-engine")]
pub use rtc_engine::{TrackPublisher, WebRtcEngine};

/// Default public STUN server
pub const DEFAULT_STUN_SERVER: &str = "stun:stun.l.google.com:19302";

/// Kind of media carried by a track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Video,
    Audio,
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Video => "video",
            Self::Audio => "audio",
        })
    }
}

/// ICE connection state reported by the media engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityState {
    New,
    Checking,
    Connected,
    Completed,
    Failed,
    Disconnected,
    Closed,
}

impl ConnectivityState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Checking => "checking",
            Self::Connected => "connected",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Disconnected => "disconnected",
            Self::Closed => "closed",
        }
    }

    /// States that end an active session
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Failed | Self::Disconnected | Self::Closed)
    }
}

impl fmt::Display for ConnectivityState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConnectivityState {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "new" => Ok(Self::New),
            "checking" => Ok(Self::Checking),
            "connected" => Ok(Self::Connected),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "disconnected" => Ok(Self::Disconnected),
            "closed" => Ok(Self::Closed),
            other => Err(PipelineError::InvalidSpec(format!(
                "unknown connectivity state '{}'",
                other
            ))),
        }
    }
}

/// STUN/TURN server entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub credential: Option<String>,
}

impl IceServer {
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: None,
            credential: None,
        }
    }
}

/// Local track offered to the viewer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackSpec {
    pub kind: MediaKind,
    /// Codec MIME type, e.g. `video/VP8`
    pub mime_type: String,
    pub clock_rate: u32,
    #[serde(default)]
    pub channels: u16,
    pub id: String,
    pub stream_id: String,
}

impl TrackSpec {
    /// VP8 camera track
    pub fn vp8(id: impl Into<String>) -> Self {
        Self {
            kind: MediaKind::Video,
            mime_type: "video/VP8".to_string(),
            clock_rate: 90000,
            channels: 0,
            id: id.into(),
            stream_id: "robot".to_string(),
        }
    }

    /// Opus microphone track
    pub fn opus(id: impl Into<String>) -> Self {
        Self {
            kind: MediaKind::Audio,
            mime_type: "audio/opus".to_string(),
            clock_rate: 48000,
            channels: 2,
            id: id.into(),
            stream_id: "robot".to_string(),
        }
    }
}

/// Description of the media graph to start.
///
/// Produced by the media-configuration collaborator; the session core only
/// hands it to the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineSpec {
    #[serde(default = "default_ice_servers")]
    pub ice_servers: Vec<IceServer>,
    #[serde(default = "default_tracks")]
    pub tracks: Vec<TrackSpec>,
}

fn default_ice_servers() -> Vec<IceServer> {
    vec![IceServer::stun(DEFAULT_STUN_SERVER)]
}

fn default_tracks() -> Vec<TrackSpec> {
    vec![TrackSpec::vp8("camera")]
}

impl Default for PipelineSpec {
    fn default() -> Self {
        Self {
            ice_servers: default_ice_servers(),
            tracks: default_tracks(),
        }
    }
}

impl PipelineSpec {
    pub fn validate(&self) -> Result<(), PipelineError> {
        for track in &self.tracks {
            let prefix = format!("{}/", track.kind);
            if !track.mime_type.to_lowercase().starts_with(&prefix) {
                return Err(PipelineError::InvalidSpec(format!(
                    "track {} has kind {} but codec {}",
                    track.id, track.kind, track.mime_type
                )));
            }
        }
        for server in &self.ice_servers {
            if server.urls.is_empty() {
                return Err(PipelineError::InvalidSpec(
                    "ICE server entry without urls".to_string(),
                ));
            }
        }
        Ok(())
    }
}

/// Factory for media sessions
#[async_trait]
pub trait MediaEngine: Send + Sync {
    /// Build and activate the media graph described by `spec`.
    ///
    /// Every notification of the returned session must go through `events`.
    async fn start(
        &self,
        spec: &PipelineSpec,
        events: std::sync::Arc<dyn PipelineEvents>,
    ) -> Result<Box<dyn MediaSession>, PipelineError>;
}

/// A running media session
#[async_trait]
pub trait MediaSession: Send + Sync {
    /// Create a local offer and return its SDP
    async fn create_offer(&self) -> Result<String, PipelineError>;

    /// Apply a previously created offer as the local description
    async fn set_local_description(&self, sdp: &str) -> Result<(), PipelineError>;

    /// Apply the viewer's answer as the remote description
    async fn set_remote_answer(&self, sdp: &str) -> Result<(), PipelineError>;

    /// Add a remote ICE candidate
    async fn add_ice_candidate(&self, candidate: &IceCandidateRecord) -> Result<(), PipelineError>;

    /// Deactivate the media graph and release its resources
    async fn stop(&self) -> Result<(), PipelineError>;
}

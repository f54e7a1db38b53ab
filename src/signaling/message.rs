//! Signaling wire messages
//!
//! Messages are JSON objects tagged by their `type` field:
//!
//! ```text
//! {"type":"join-room","roomId":"<identity>","role":"workstation"}
//! {"type":"offer","sdp":"<SDP text>"}
//! {"type":"answer","sdp":"<SDP text>"}
//! {"type":"ice-candidate","candidate":{"candidate":"<ICE line>","sdpMLineIndex":0}}
//! ```

use serde::{Deserialize, Serialize};

/// Role announced by the robot when joining its room
pub const WORKSTATION_ROLE: &str = "workstation";

/// A single ICE candidate as exchanged with the viewer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidateRecord {
    /// The `candidate:` attribute line
    pub candidate: String,
    /// Index of the media section the candidate belongs to
    #[serde(rename = "sdpMLineIndex", default)]
    pub sdp_mline_index: u32,
}

impl IceCandidateRecord {
    pub fn new(sdp_mline_index: u32, candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mline_index,
        }
    }

    /// Browsers signal the end of gathering with an empty candidate line
    pub fn is_end_of_candidates(&self) -> bool {
        self.candidate.trim().is_empty()
    }
}

/// Signaling message types
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SignalingMessage {
    // Robot -> Server
    JoinRoom {
        #[serde(rename = "roomId")]
        room_id: String,
        role: String,
    },

    // Robot -> Viewer
    Offer {
        sdp: String,
    },

    // Viewer -> Robot
    Answer {
        sdp: String,
    },

    // Both directions
    IceCandidate {
        candidate: IceCandidateRecord,
    },
}

impl SignalingMessage {
    /// Build the join message sent right after connecting
    pub fn join_room(room_id: impl Into<String>) -> Self {
        Self::JoinRoom {
            room_id: room_id.into(),
            role: WORKSTATION_ROLE.to_string(),
        }
    }

    /// Wire name of the message, used for logging
    pub fn message_type(&self) -> &'static str {
        match self {
            Self::JoinRoom { .. } => "join-room",
            Self::Offer { .. } => "offer",
            Self::Answer { .. } => "answer",
            Self::IceCandidate { .. } => "ice-candidate",
        }
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn decode(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

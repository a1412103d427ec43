//! Named events exchanged with the relay.
//!
//! Frames are JSON objects of the form `{"event": "call-start", "data": {...}}`. The relay
//! never interprets call semantics; it fans room-scoped events out to the room and routes
//! unicast events (`to`) to a single peer, stamping the sender as `from`.

use derive_more::Display;
use serde::{Deserialize, Serialize};

use crate::{PeerId, RoomId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    #[display(fmt = "offer")]
    Offer,
    #[display(fmt = "answer")]
    Answer,
    #[display(fmt = "pranswer")]
    Pranswer,
    #[display(fmt = "rollback")]
    Rollback,
}

/// a session description in the browser's JSON shape
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

/// a route candidate in the browser's JSON shape (RTCIceCandidateInit)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(
        default,
        rename = "sdpMLineIndex",
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mline_index: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

/// one roster entry as the relay reports it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticipantInfo {
    pub id: PeerId,
    pub username: String,
}

/// sent by this client to the relay
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ClientSignal {
    /// announce a new call. the relay fans it out as `incoming-call`
    #[display(fmt = "call-start")]
    #[serde(rename_all = "camelCase")]
    CallStart {
        room_id: RoomId,
        username: String,
        peer_id: PeerId,
    },
    /// join the room's call. the relay fans it out as `call-user-joined`
    #[display(fmt = "call-accept")]
    #[serde(rename_all = "camelCase")]
    CallAccept {
        room_id: RoomId,
        username: String,
        peer_id: PeerId,
    },
    #[display(fmt = "call-leave")]
    #[serde(rename_all = "camelCase")]
    CallLeave { room_id: RoomId },
    /// informational, never causes renegotiation
    #[display(fmt = "call-mute")]
    #[serde(rename_all = "camelCase")]
    CallMute { room_id: RoomId, muted: bool },
    #[display(fmt = "call-offer")]
    #[serde(rename_all = "camelCase")]
    CallOffer {
        room_id: RoomId,
        to: PeerId,
        sdp: SessionDescription,
    },
    #[display(fmt = "call-answer")]
    #[serde(rename_all = "camelCase")]
    CallAnswer {
        room_id: RoomId,
        to: PeerId,
        sdp: SessionDescription,
    },
    #[display(fmt = "call-ice-candidate")]
    #[serde(rename_all = "camelCase")]
    CallIceCandidate {
        room_id: RoomId,
        to: PeerId,
        candidate: IceCandidate,
    },
}

/// received by this client from the relay
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum RelaySignal {
    /// someone (possibly this client) started a call in the room
    #[display(fmt = "incoming-call")]
    #[serde(rename_all = "camelCase")]
    IncomingCall {
        caller: String,
        caller_id: PeerId,
        room_id: RoomId,
        #[serde(default)]
        participants: Vec<ParticipantInfo>,
    },
    /// sent to a client joining a room whose call is already running
    #[display(fmt = "call-existing")]
    #[serde(rename_all = "camelCase")]
    CallExisting {
        room_id: RoomId,
        #[serde(default)]
        host_name: Option<String>,
        #[serde(default)]
        participants: Vec<ParticipantInfo>,
    },
    #[display(fmt = "call-user-joined")]
    #[serde(rename_all = "camelCase")]
    CallUserJoined {
        peer_id: PeerId,
        username: String,
        #[serde(default)]
        participants: Vec<ParticipantInfo>,
    },
    #[display(fmt = "call-user-left")]
    #[serde(rename_all = "camelCase")]
    CallUserLeft {
        peer_id: PeerId,
        #[serde(default)]
        username: Option<String>,
        #[serde(default)]
        room_empty: bool,
    },
    #[display(fmt = "call-user-muted")]
    #[serde(rename_all = "camelCase")]
    CallUserMuted { peer_id: PeerId, muted: bool },
    #[display(fmt = "call-user-declined")]
    #[serde(rename_all = "camelCase")]
    CallUserDeclined { username: String },
    #[display(fmt = "call-ended")]
    CallEnded {},
    #[display(fmt = "call-offer")]
    #[serde(rename_all = "camelCase")]
    CallOffer {
        room_id: RoomId,
        from: PeerId,
        sdp: SessionDescription,
    },
    #[display(fmt = "call-answer")]
    #[serde(rename_all = "camelCase")]
    CallAnswer {
        room_id: RoomId,
        from: PeerId,
        sdp: SessionDescription,
    },
    #[display(fmt = "call-ice-candidate")]
    #[serde(rename_all = "camelCase")]
    CallIceCandidate {
        room_id: RoomId,
        from: PeerId,
        candidate: IceCandidate,
    },
}

impl RelaySignal {
    /// the room the event is scoped to, if the payload names one
    pub fn room_id(&self) -> Option<&RoomId> {
        match self {
            RelaySignal::IncomingCall { room_id, .. }
            | RelaySignal::CallExisting { room_id, .. }
            | RelaySignal::CallOffer { room_id, .. }
            | RelaySignal::CallAnswer { room_id, .. }
            | RelaySignal::CallIceCandidate { room_id, .. } => Some(room_id),
            _ => None,
        }
    }

    /// offer, answer and candidate messages belong to a single link rather than the session
    pub fn is_peer_signal(&self) -> bool {
        matches!(
            self,
            RelaySignal::CallOffer { .. }
                | RelaySignal::CallAnswer { .. }
                | RelaySignal::CallIceCandidate { .. }
        )
    }
}

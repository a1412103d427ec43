use futures::stream::BoxStream;
use serde::Serialize;

use crate::{media::RemoteStream, roster::Participant, session::CallState, PeerId, RoomId};

pub struct CallEventStream(pub BoxStream<'static, CallEvent>);

impl core::ops::Deref for CallEventStream {
    type Target = BoxStream<'static, CallEvent>;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl core::ops::DerefMut for CallEventStream {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, derive_more::Display)]
pub enum CallEvent {
    #[display(fmt = "StateChanged({})", _0)]
    StateChanged(CallState),
    #[display(fmt = "ParticipantJoined")]
    ParticipantJoined(Participant),
    #[display(fmt = "ParticipantLeft({})", _0)]
    ParticipantLeft(PeerId),
    #[display(fmt = "ParticipantMuted({}, {})", peer_id, muted)]
    ParticipantMuted { peer_id: PeerId, muted: bool },
    #[display(fmt = "CallDeclined({})", username)]
    CallDeclined { username: String },
    /// remote audio is playing. the stream stays attached until RemoteStreamRemoved
    #[display(fmt = "RemoteStreamAdded")]
    RemoteStreamAdded(RemoteStream),
    #[display(fmt = "RemoteStreamRemoved")]
    RemoteStreamRemoved(RemoteStream),
    /// the link to this peer was abandoned. the rest of the call continues
    #[display(fmt = "PeerFailed({})", peer_id)]
    PeerFailed { peer_id: PeerId, reason: String },
    /// whole seconds since the local user entered the call
    #[display(fmt = "Elapsed({})", _0)]
    Elapsed(u64),
}

/// everything the call dock renders from
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CallSnapshot {
    pub own_id: PeerId,
    pub own_name: String,
    pub state: CallState,
    pub room_id: Option<RoomId>,
    pub host_label: Option<String>,
    pub is_muted: bool,
    /// in join order. includes the local user while in the call
    pub participants: Vec<Participant>,
    pub elapsed_secs: u64,
    pub remote_streams: Vec<RemoteStream>,
}

impl CallSnapshot {
    pub fn idle(own_id: PeerId, own_name: impl Into<String>) -> Self {
        Self {
            own_id,
            own_name: own_name.into(),
            state: CallState::Idle,
            room_id: None,
            host_label: None,
            is_muted: false,
            participants: vec![],
            elapsed_secs: 0,
            remote_streams: vec![],
        }
    }

    /// participants other than the local user
    pub fn others(&self) -> impl Iterator<Item = &Participant> {
        self.participants
            .iter()
            .filter(move |p| p.peer_id != self.own_id)
    }
}
